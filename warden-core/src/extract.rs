use std::sync::LazyLock;

use regex::Regex;

static FENCED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)```[a-z]*[ \t]*\r?\n?(.*?)```").expect("valid regex"));

static BARE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)\b((?:select\b|with\s+\w+\s+as\s*\().*?)(?:;|\n[ \t]*\n|$)").expect("valid regex")
});

fn starts_like_query(text: &str) -> bool {
    let first = text
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_lowercase();
    first == "select" || first == "with"
}

/// Pulls a single statement out of generator output: the first fenced block
/// holding a query, else the first bare `SELECT`/`WITH` statement.
pub fn extract_statement(text: &str) -> Option<String> {
    for caps in FENCED_RE.captures_iter(text) {
        let body = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        if starts_like_query(body) {
            return Some(clean(body));
        }
    }
    BARE_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| clean(m.as_str()))
        .filter(|s| !s.is_empty())
}

fn clean(statement: &str) -> String {
    statement.trim().trim_end_matches(';').trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_fenced_block() {
        let text = "Here you go:\n```sql\nSELECT region, SUM(revenue)\nFROM sales\nGROUP BY region;\n```\nThat sums it.";
        assert_eq!(
            extract_statement(text).unwrap(),
            "SELECT region, SUM(revenue)\nFROM sales\nGROUP BY region"
        );
    }

    #[test]
    fn falls_back_to_bare_statement() {
        let text = "The query is SELECT month FROM dim_date; and it lists months.";
        assert_eq!(extract_statement(text).unwrap(), "SELECT month FROM dim_date");
    }

    #[test]
    fn skips_non_query_fences() {
        let text = "```\nnot a query\n```\n```sql\nWITH t AS (SELECT 1) SELECT * FROM t\n```";
        assert_eq!(extract_statement(text).unwrap(), "WITH t AS (SELECT 1) SELECT * FROM t");
    }

    #[test]
    fn prose_without_statement_is_malformed() {
        assert_eq!(extract_statement("I cannot answer that."), None);
        assert_eq!(extract_statement("Happy to help with that request."), None);
    }
}
