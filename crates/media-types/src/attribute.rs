use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A manifest attribute whose raw value could not be converted.
///
/// Carries the attribute name and the untouched value so callers can report
/// exactly which part of an untrusted manifest was malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid value `{value}` for attribute `{name}`: expected {expected}")]
pub struct AttributeParseError {
    pub name: String,
    pub value: String,
    pub expected: &'static str,
}

impl AttributeParseError {
    pub fn new(name: impl Into<String>, value: impl Into<String>, expected: &'static str) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            expected,
        }
    }
}

/// Parse a raw attribute value, mapping any conversion failure to an
/// [`AttributeParseError`] naming the attribute.
pub fn parse_attribute<T: FromStr>(
    name: &str,
    value: &str,
    expected: &'static str,
) -> Result<T, AttributeParseError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| AttributeParseError::new(name, value, expected))
}

/// What a parser does with an element whose attributes fail to parse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseMode {
    /// Abort the whole manifest on the first bad attribute.
    #[default]
    Strict,
    /// Drop only the owning element (variant, segment, representation).
    Lenient,
}

impl ParseMode {
    #[inline]
    pub fn is_lenient(self) -> bool {
        matches!(self, ParseMode::Lenient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_attribute_reports_name_and_value() {
        let err = parse_attribute::<u64>("BANDWIDTH", "12k", "unsigned integer").unwrap_err();
        assert_eq!(err.name, "BANDWIDTH");
        assert_eq!(err.value, "12k");
        assert_eq!(
            err.to_string(),
            "invalid value `12k` for attribute `BANDWIDTH`: expected unsigned integer"
        );
    }

    #[test]
    fn parse_attribute_trims_whitespace() {
        assert_eq!(parse_attribute::<u32>("width", " 640 ", "integer"), Ok(640));
    }

    #[test]
    fn parse_mode_defaults_to_strict() {
        assert_eq!(ParseMode::default(), ParseMode::Strict);
        assert!(ParseMode::Lenient.is_lenient());
    }
}
