//! Generic element tree built from the quick-xml event stream. Only
//! structural problems are reported here; attribute values stay raw strings.

use std::borrow::Cow;

use iso8601_duration::Duration as IsoDuration;
use media_types::{AttributeParseError, ByteRange, parse_attribute};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use crate::error::DashError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Element {
    /// Local name, namespace prefix stripped.
    pub(crate) name: String,
    pub(crate) attributes: Vec<(String, String)>,
    pub(crate) children: Vec<Element>,
    pub(crate) text: String,
}

impl Element {
    fn from_start(start: &BytesStart<'_>, position: u64) -> Result<Self, DashError> {
        let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
        let mut attributes = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| DashError::xml(position, e))?;
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|e| DashError::xml(position, e))?;
            attributes.push((key, value.into_owned()));
        }
        Ok(Self {
            name,
            attributes,
            ..Default::default()
        })
    }

    pub(crate) fn is(&self, name: &str) -> bool {
        self.name == name
    }

    pub(crate) fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub(crate) fn string(&self, name: &str) -> Option<String> {
        self.attr(name).map(str::to_string)
    }

    pub(crate) fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.is(name))
    }

    pub(crate) fn children<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.is(name))
    }

    /// Trimmed text of the first child called `name`, if non-empty.
    pub(crate) fn child_text(&self, name: &str) -> Option<String> {
        self.child(name)
            .map(|c| c.text.trim())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    }

    pub(crate) fn u64(&self, name: &str) -> Result<Option<u64>, AttributeParseError> {
        self.attr(name)
            .map(|raw| parse_attribute(name, raw, "unsigned integer"))
            .transpose()
    }

    pub(crate) fn u32(&self, name: &str) -> Result<Option<u32>, AttributeParseError> {
        self.attr(name)
            .map(|raw| parse_attribute(name, raw, "unsigned integer"))
            .transpose()
    }

    pub(crate) fn i64(&self, name: &str) -> Result<Option<i64>, AttributeParseError> {
        self.attr(name)
            .map(|raw| parse_attribute(name, raw, "integer"))
            .transpose()
    }

    /// ISO-8601 duration (`PT1M30.5S`) in seconds.
    pub(crate) fn duration(&self, name: &str) -> Result<Option<f64>, AttributeParseError> {
        self.attr(name)
            .map(|raw| parse_iso_duration(name, raw))
            .transpose()
    }

    /// Inclusive `first-last` byte range.
    pub(crate) fn byte_range(&self, name: &str) -> Result<Option<ByteRange>, AttributeParseError> {
        self.attr(name)
            .map(|raw| parse_byte_range(name, raw))
            .transpose()
    }
}

pub(crate) fn parse_iso_duration(name: &str, raw: &str) -> Result<f64, AttributeParseError> {
    IsoDuration::parse(raw.trim())
        .ok()
        .and_then(|d| d.to_std())
        .map(|d| d.as_secs_f64())
        .ok_or_else(|| AttributeParseError::new(name, raw, "ISO-8601 duration"))
}

pub(crate) fn parse_byte_range(name: &str, raw: &str) -> Result<ByteRange, AttributeParseError> {
    let expected = "<first>-<last>";
    let invalid = || AttributeParseError::new(name, raw, expected);
    let (first, last) = raw.split_once('-').ok_or_else(invalid)?;
    let first: u64 = parse_attribute(name, first, expected).map_err(|_| invalid())?;
    let last: u64 = parse_attribute(name, last, expected).map_err(|_| invalid())?;
    ByteRange::from_inclusive(first, last).ok_or_else(invalid)
}

/// Build the element tree of `xml`. Returns `None` for a document without
/// any element.
pub(crate) fn parse_document(xml: &str) -> Result<Option<Element>, DashError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Element> = Vec::new();

    loop {
        let position = reader.buffer_position() as u64;
        let event = reader
            .read_event()
            .map_err(|e| DashError::xml(position, e))?;

        match event {
            Event::Start(start) => stack.push(Element::from_start(&start, position)?),
            Event::Empty(start) => {
                let element = Element::from_start(&start, position)?;
                if let Some(root) = attach(&mut stack, element) {
                    return Ok(Some(root));
                }
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| DashError::xml(position, "unexpected closing tag"))?;
                if let Some(root) = attach(&mut stack, element) {
                    return Ok(Some(root));
                }
            }
            Event::Text(text) => {
                if let Some(top) = stack.last_mut() {
                    let text = text.unescape().map_err(|e| DashError::xml(position, e))?;
                    top.text.push_str(&text);
                }
            }
            Event::CData(data) => {
                if let Some(top) = stack.last_mut() {
                    let bytes = data.into_inner();
                    let text: Cow<'_, str> = String::from_utf8_lossy(&bytes);
                    top.text.push_str(&text);
                }
            }
            Event::Eof => {
                return if stack.is_empty() {
                    Ok(None)
                } else {
                    Err(DashError::xml(position, "unexpected end of document"))
                };
            }
            _ => {}
        }
    }
}

/// Attach a finished element to its parent, or hand it back if it is the root.
fn attach(stack: &mut [Element], element: Element) -> Option<Element> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(element);
            None
        }
        None => Some(element),
    }
}
