//! Attribute-list tokenizer shared by every HLS tag handler.
//!
//! An attribute list is the part of a tag after its colon:
//! `BANDWIDTH=1280000,CODECS="avc1.4d401f,mp4a.40.2",RESOLUTION=1280x720`.
//! Commas inside double quotes do not separate attributes.

use std::collections::HashMap;

use media_types::{AttributeParseError, ByteRange, Resolution, parse_attribute};

/// Parsed attribute list. Keys are kept verbatim, including ones this crate
/// does not interpret.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes {
    values: HashMap<String, String>,
}

impl Attributes {
    /// Tokenize an attribute list. Never fails; an empty input yields an
    /// empty mapping and a bare key without `=` maps to an empty value.
    pub fn parse(input: &str) -> Self {
        let mut values = HashMap::new();

        for item in split_top_level(input) {
            let (key, value) = match item.split_once('=') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => (item.trim(), ""),
            };
            if key.is_empty() {
                continue;
            }
            values.insert(key.to_string(), unquote(value).to_string());
        }

        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Owned copy of a string attribute.
    pub fn string(&self, name: &str) -> Option<String> {
        self.get(name).map(str::to_string)
    }

    /// A required attribute; absence is reported as an empty raw value.
    pub fn required(&self, name: &str) -> Result<&str, AttributeParseError> {
        self.get(name)
            .ok_or_else(|| AttributeParseError::new(name, "", "a value"))
    }

    pub fn u64(&self, name: &str) -> Result<Option<u64>, AttributeParseError> {
        self.get(name)
            .map(|raw| parse_attribute(name, raw, "unsigned integer"))
            .transpose()
    }

    pub fn f64(&self, name: &str) -> Result<Option<f64>, AttributeParseError> {
        self.get(name)
            .map(|raw| parse_attribute(name, raw, "decimal number"))
            .transpose()
    }

    /// Enumerated `YES`/`NO` attribute. Only the literal `YES` is true.
    pub fn flag(&self, name: &str) -> bool {
        self.get(name) == Some("YES")
    }

    /// `RESOLUTION=<width>x<height>`.
    pub fn resolution(&self, name: &str) -> Result<Option<Resolution>, AttributeParseError> {
        let Some(raw) = self.get(name) else {
            return Ok(None);
        };
        let invalid = || AttributeParseError::new(name, raw, "<width>x<height>");
        let (width, height) = raw.split_once(['x', 'X']).ok_or_else(invalid)?;
        let width = width.trim().parse::<u32>().map_err(|_| invalid())?;
        let height = height.trim().parse::<u32>().map_err(|_| invalid())?;
        Ok(Some(Resolution::new(width, height)))
    }

    /// `BYTERANGE="<length>[@<offset>]"`, with the same offset rules as
    /// `#EXT-X-BYTERANGE`.
    pub fn byte_range(
        &self,
        name: &str,
        previous_end: Option<u64>,
    ) -> Result<Option<ByteRange>, AttributeParseError> {
        self.get(name)
            .map(|raw| parse_byte_range(name, raw, previous_end))
            .transpose()
    }
}

/// Parse `<length>[@<offset>]`. A missing offset continues right after
/// `previous_end` (or at zero when there is nothing to continue from).
pub fn parse_byte_range(
    name: &str,
    raw: &str,
    previous_end: Option<u64>,
) -> Result<ByteRange, AttributeParseError> {
    let value = unquote(raw.trim());
    let expected = "<length>[@<offset>]";
    let (length, offset) = match value.split_once('@') {
        Some((length, offset)) => (length, Some(offset)),
        None => (value, None),
    };
    let length: u64 = parse_attribute(name, length, expected)
        .map_err(|_| AttributeParseError::new(name, raw, expected))?;
    let offset = match offset {
        Some(offset) => parse_attribute(name, offset, expected)
            .map_err(|_| AttributeParseError::new(name, raw, expected))?,
        None => previous_end.unwrap_or(0),
    };
    Ok(ByteRange::new(offset, length))
}

fn split_top_level(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0usize;
    for (idx, ch) in input.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(input[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    if start < input.len() {
        parts.push(input[start..].trim());
    }
    parts.retain(|p| !p.is_empty());
    parts
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}
