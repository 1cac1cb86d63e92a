//! Tagged-field extraction from oracle responses.
//!
//! Structured responses use `<TAG>...</TAG>` blocks. An [`OutputsMapping`]
//! names the fields to pull out and which of them are required.

use anyhow::Result;
use regex::Regex;
use std::collections::BTreeMap;

use crate::error::PilotError;

/// Value substituted for an absent optional field
pub const NOT_AVAILABLE: &str = "N/A";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputField {
    pub tag: String,
    pub required: bool,
}

#[derive(Debug, Clone, Default)]
pub struct OutputsMapping {
    fields: Vec<(String, OutputField)>,
}

impl OutputsMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, field: &str, tag: &str) -> Self {
        self.fields.push((
            field.to_string(),
            OutputField {
                tag: tag.to_string(),
                required: true,
            },
        ));
        self
    }

    pub fn optional(mut self, field: &str, tag: &str) -> Self {
        self.fields.push((
            field.to_string(),
            OutputField {
                tag: tag.to_string(),
                required: false,
            },
        ));
        self
    }

    /// Extract every mapped field from `text`.
    ///
    /// Fails on the first required tag that is missing.
    pub fn extract(&self, text: &str) -> Result<Outputs> {
        let mut values = BTreeMap::new();
        for (field, spec) in &self.fields {
            let value = match find_tag(text, &spec.tag)? {
                Some(value) => value,
                None if spec.required => {
                    return Err(PilotError::Parse {
                        field: field.clone(),
                        tag: spec.tag.clone(),
                    }
                    .into())
                }
                None => NOT_AVAILABLE.to_string(),
            };
            values.insert(field.clone(), value);
        }
        Ok(Outputs(values))
    }
}

/// Extracted field values keyed by field name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outputs(BTreeMap<String, String>);

impl Outputs {
    /// Field value, or [`NOT_AVAILABLE`] for fields that were never mapped
    pub fn get(&self, field: &str) -> &str {
        self.0.get(field).map(String::as_str).unwrap_or(NOT_AVAILABLE)
    }

    /// Field value unless it is the sentinel
    pub fn present(&self, field: &str) -> Option<&str> {
        Some(self.get(field)).filter(|value| *value != NOT_AVAILABLE)
    }

    pub fn into_map(self) -> BTreeMap<String, String> {
        self.0
    }
}

/// Contents of the first `<tag>...</tag>` block, trimmed
pub fn find_tag(text: &str, tag: &str) -> Result<Option<String>> {
    let tag = regex::escape(tag);
    let re = Regex::new(&format!(r"(?s)<{tag}>(.*?)</{tag}>"))?;
    Ok(re
        .captures(text)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optional_tag_absent_yields_sentinel() {
        let mapping = OutputsMapping::new()
            .required("thoughts", "THOUGHTS")
            .required("action", "ACTION")
            .optional("ux", "UX");
        let text = "<THOUGHTS>Login form is visible</THOUGHTS>\n<ACTION>Tap the login button</ACTION>";

        let outputs = mapping.extract(text).unwrap();
        assert_eq!(outputs.get("thoughts"), "Login form is visible");
        assert_eq!(outputs.get("action"), "Tap the login button");
        assert_eq!(outputs.get("ux"), NOT_AVAILABLE);
        assert_eq!(outputs.present("ux"), None);
    }

    #[test]
    fn test_missing_required_tag_is_parse_error() {
        let mapping = OutputsMapping::new().required("action", "ACTION");
        let err = mapping.extract("<THOUGHTS>hmm</THOUGHTS>").unwrap_err();
        match err.downcast_ref::<PilotError>() {
            Some(PilotError::Parse { field, tag }) => {
                assert_eq!(field, "action");
                assert_eq!(tag, "ACTION");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_first_block_wins_and_spans_lines() {
        let text = "<A>\n line one\n line two\n</A><A>second</A>";
        assert_eq!(find_tag(text, "A").unwrap().as_deref(), Some("line one\n line two"));
    }

    #[test]
    fn test_nested_tags_are_reachable() {
        let text = "<UX><SUMMARY>Clear layout</SUMMARY><SCORE>8</SCORE></UX>";
        let section = find_tag(text, "UX").unwrap().unwrap();
        assert_eq!(find_tag(&section, "SCORE").unwrap().as_deref(), Some("8"));
    }
}
