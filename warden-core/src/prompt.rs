use std::fmt::Write;

use warden_types::{ConversationTurn, FeedbackRecord, RetrievedContext};

const INSTRUCTIONS: &str = "You translate analytics questions into one read-only SQL query.\n\
Use only tables and columns from the schema context. Never modify data.\n\
Reply with a single ```sql fenced block and nothing else.";

/// A statement that failed verification, shown to the next plan as a form to avoid.
#[derive(Clone, Debug)]
pub struct RejectedStatement {
    pub statement_text: String,
    pub error: String,
}

/// Everything the Plan step feeds the generator.
pub struct PlanInput<'a> {
    pub request_text: &'a str,
    pub context: &'a RetrievedContext,
    pub previous: Option<&'a ConversationTurn>,
    pub examples: &'a [FeedbackRecord],
    pub rejected: Option<&'a RejectedStatement>,
}

pub fn build_prompt(input: &PlanInput<'_>) -> String {
    let mut out = String::from(INSTRUCTIONS);

    out.push_str("\n\n## Schema context\n");
    if input.context.is_empty() {
        out.push_str("No schema context was retrieved. Prefer simple queries over well-known tables.\n");
    } else {
        for entry in input.context.iter() {
            let _ = writeln!(
                out,
                "- [{}] {}: {}",
                entry.entity_kind.as_str(),
                entry.entity_name,
                entry.definition
            );
        }
    }

    if let Some(turn) = input.previous {
        let sig = &turn.data_signature;
        let _ = write!(
            out,
            "\n## Previous result\nRequest: {}\nStatement:\n```sql\n{}\n```\nColumns: {}\nRows: {}\n",
            turn.request_text,
            turn.final_statement_text,
            sig.column_names.join(", "),
            sig.row_count
        );
        for row in &sig.sample_rows {
            let _ = writeln!(out, "| {} |", row.join(" | "));
        }
    }

    if !input.examples.is_empty() {
        out.push_str("\n## Verified examples\n");
        for example in input.examples {
            let statement = example.correction.as_deref().unwrap_or(&example.statement_text);
            let _ = write!(
                out,
                "Q: {}\n```sql\n{}\n```\n",
                example.request_text, statement
            );
        }
    }

    if let Some(rejected) = input.rejected {
        let _ = write!(
            out,
            "\n## Avoid this form\nThe following statement failed: {}\n```sql\n{}\n```\n",
            rejected.error, rejected.statement_text
        );
    }

    let _ = write!(out, "\n## Question\n{}\n", input.request_text);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use warden_types::{ContextEntry, DataSignature, EntityKind, Rating};

    #[test]
    fn includes_every_section_when_present() {
        let context = RetrievedContext::new(vec![ContextEntry {
            entity_name: "revenue".into(),
            entity_kind: EntityKind::Metric,
            definition: "SUM(f.revenue)".into(),
        }]);
        let previous = ConversationTurn {
            request_text: "revenue by region".into(),
            final_statement_text: "SELECT region FROM dim_store".into(),
            data_signature: DataSignature::new(2, vec!["region".into()], vec![vec!["EU".into()]]),
            timestamp: Utc::now(),
        };
        let examples = vec![FeedbackRecord::new(
            "units by product",
            "SELECT bad",
            Rating::Positive,
            Some("SELECT good".into()),
        )];
        let rejected = RejectedStatement {
            statement_text: "SELECT nope FROM t".into(),
            error: "query error: no such column".into(),
        };
        let prompt = build_prompt(&PlanInput {
            request_text: "compare that to last year",
            context: &context,
            previous: Some(&previous),
            examples: &examples,
            rejected: Some(&rejected),
        });
        assert!(prompt.contains("- [metric] revenue: SUM(f.revenue)"));
        assert!(prompt.contains("## Previous result"));
        assert!(prompt.contains("| EU |"));
        assert!(prompt.contains("SELECT good"));
        assert!(!prompt.contains("SELECT bad"));
        assert!(prompt.contains("SELECT nope FROM t"));
        assert!(prompt.ends_with("compare that to last year\n"));
    }

    #[test]
    fn empty_context_is_called_out() {
        let prompt = build_prompt(&PlanInput {
            request_text: "revenue",
            context: &RetrievedContext::empty(),
            previous: None,
            examples: &[],
            rejected: None,
        });
        assert!(prompt.contains("No schema context was retrieved"));
        assert!(!prompt.contains("## Previous result"));
    }
}
