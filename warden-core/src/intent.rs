use std::sync::LazyLock;

use regex::Regex;
use warden_types::AttemptErrorKind;

use crate::fallback::tokenize;

// Single quotes only count at word boundaries, so "store's" and "What's"
// never open a quoted value.
static QUOTED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:^|[\s(\[=,:])'([^'\n]+)'(?:$|[\s)\],.?!;:])|"([^"\n]+)""#).expect("valid regex")
});

static YEAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:19|20)\d{2}\b").expect("valid regex"));

// Phrases that point back at an earlier answer. Bare words like "last" or
// "that" show up in fresh questions too ("revenue last month").
const FOLLOW_UP_MARKERS: [&str; 16] = [
    "compare that", "compare this", "compare it", "same as", "same but", "what about",
    "how about", "that result", "those results", "these results", "previous result",
    "previous query", "instead", "break that down", "drill into that", "drill down",
];

const EXISTENCE_MARKERS: [&str; 6] = ["is there", "are there", "does any", "do any", "exist", "exists"];

/// What the request asks for, as far as verification cares.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Intent {
    /// Refers back to an earlier result.
    pub follow_up: bool,
    /// Asks whether something exists; zero rows is a valid answer.
    pub existence_check: bool,
    /// Quoted values and years the statement must filter on.
    pub filter_values: Vec<String>,
}

impl Intent {
    pub fn parse(request_text: &str) -> Self {
        let tokens = tokenize(request_text);
        let has = |phrase: &str| {
            let needle = tokenize(phrase);
            !needle.is_empty()
                && needle.len() <= tokens.len()
                && tokens.windows(needle.len()).any(|w| w == needle.as_slice())
        };

        let mut filter_values: Vec<String> = QUOTED_RE
            .captures_iter(request_text)
            .filter_map(|c| c.get(1).or_else(|| c.get(2)))
            .map(|m| m.as_str().trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();
        for year in YEAR_RE.find_iter(request_text) {
            if !filter_values.iter().any(|v| v.contains(year.as_str())) {
                filter_values.push(year.as_str().to_string());
            }
        }

        Self {
            follow_up: FOLLOW_UP_MARKERS.iter().any(|m| has(*m)),
            existence_check: EXISTENCE_MARKERS.iter().any(|m| has(*m)),
            filter_values,
        }
    }
}

/// A failed verification, fed back into the next plan as negative context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifyFailure {
    pub kind: AttemptErrorKind,
    pub detail: String,
}

impl VerifyFailure {
    pub fn new(kind: AttemptErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// Checks an executed statement against the request: every named filter value
/// must appear in the statement, and rows must come back unless the request
/// only asks whether something exists.
pub fn verify(intent: &Intent, statement: &str, row_count: usize) -> Result<(), VerifyFailure> {
    let lowered = statement.to_lowercase();
    if let Some(missing) = intent
        .filter_values
        .iter()
        .find(|v| !lowered.contains(&v.to_lowercase()))
    {
        return Err(VerifyFailure::new(
            AttemptErrorKind::FilterMismatch,
            format!("statement does not filter on '{missing}'"),
        ));
    }
    if row_count == 0 && !intent.existence_check {
        return Err(VerifyFailure::new(
            AttemptErrorKind::EmptyResult,
            "statement returned no rows",
        ));
    }
    Ok(())
}
