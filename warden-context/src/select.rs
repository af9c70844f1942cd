use warden_embed::cosine_similarity;

/// A scored catalog entry offered to the selector.
#[derive(Clone, Debug)]
pub struct Candidate<'a> {
    pub tokens: usize,
    pub embedding: &'a [f32],
    pub relevance: f32,
}

/// Limits on what a selection may contain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SelectionBudget {
    pub max_tokens: usize,
    pub max_items: usize,
}

/// Picked candidate indices, most valuable first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selection {
    pub indices: Vec<usize>,
    pub total_tokens: usize,
}

pub trait ContextSelector: Send + Sync {
    fn select(&self, candidates: &[Candidate<'_>], budget: SelectionBudget) -> Selection;
}

/// Greedy facility-location selection.
///
/// Maximises `Σ_i max_{j∈S} cos(e_i, e_j) + γ Σ_{j∈S} relevance_j`. Each pick is
/// the candidate with the largest marginal gain that still fits the token
/// budget, so a second definition of the same table adds little and a distinct
/// one is preferred.
pub struct FacilityLocationSelector {
    gamma: f32,
}

impl FacilityLocationSelector {
    pub fn new(gamma: f32) -> Self {
        Self { gamma }
    }

    fn marginal_gain(&self, similarity: &[f32], coverage: &[f32], relevance: f32) -> f32 {
        let covered: f32 = similarity
            .iter()
            .zip(coverage)
            .map(|(s, c)| (s - c).max(0.0))
            .sum();
        covered + self.gamma * relevance
    }
}

impl ContextSelector for FacilityLocationSelector {
    fn select(&self, candidates: &[Candidate<'_>], budget: SelectionBudget) -> Selection {
        if candidates.is_empty() || budget.max_tokens == 0 || budget.max_items == 0 {
            return Selection::default();
        }

        // similarity[j][i]: how well candidate j stands in for candidate i.
        let similarity: Vec<Vec<f32>> = candidates
            .iter()
            .map(|facility| {
                candidates
                    .iter()
                    .map(|c| cosine_similarity(facility.embedding, c.embedding).max(0.0))
                    .collect()
            })
            .collect();

        let mut picked = vec![false; candidates.len()];
        let mut coverage = vec![0.0_f32; candidates.len()];
        let mut selection = Selection::default();

        while selection.indices.len() < budget.max_items {
            let remaining = budget.max_tokens - selection.total_tokens;
            let best = candidates
                .iter()
                .enumerate()
                .filter(|(j, c)| !picked[*j] && c.tokens <= remaining)
                .map(|(j, c)| (j, self.marginal_gain(&similarity[j], &coverage, c.relevance)))
                .filter(|(_, gain)| *gain > 0.0)
                // Ties go to the earlier (higher ranked) candidate.
                .max_by(|a, b| a.1.total_cmp(&b.1).then(b.0.cmp(&a.0)));
            let Some((j, _)) = best else { break };

            picked[j] = true;
            selection.indices.push(j);
            selection.total_tokens += candidates[j].tokens;
            for (cov, s) in coverage.iter_mut().zip(&similarity[j]) {
                *cov = cov.max(*s);
            }
        }
        selection
    }
}
