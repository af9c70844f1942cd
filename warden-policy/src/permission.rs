use std::collections::BTreeSet;

use regex::Regex;

use crate::PolicyError;

/// Case-insensitive whole-word matcher over the blocked operation keywords.
///
/// `DROP` matches "drop table sales" but not "dropdown" or "backdrop".
#[derive(Clone, Debug)]
pub struct PermissionChecker {
    pattern: Option<Regex>,
}

impl PermissionChecker {
    pub fn new(keywords: &BTreeSet<String>) -> Result<Self, PolicyError> {
        let alternatives: Vec<String> = keywords
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(regex::escape)
            .collect();
        if alternatives.is_empty() {
            return Ok(Self { pattern: None });
        }
        let source = format!(r"(?i)\b(?:{})\b", alternatives.join("|"));
        let pattern = Regex::new(&source).map_err(|e| PolicyError::Invalid(e.to_string()))?;
        Ok(Self {
            pattern: Some(pattern),
        })
    }

    /// First blocked keyword found in `text`, upper-cased.
    pub fn find(&self, text: &str) -> Option<String> {
        self.pattern
            .as_ref()?
            .find(text)
            .map(|m| m.as_str().to_uppercase())
    }
}
