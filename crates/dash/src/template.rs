use std::sync::LazyLock;

use regex::{Captures, Regex};

static TEMPLATE_IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(RepresentationID|Number|Time|Bandwidth)(?:%0(\d+)d)?\$|\$\$").unwrap()
});

/// Values available to a `SegmentTemplate` URL pattern.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateVars<'a> {
    pub representation_id: &'a str,
    pub bandwidth: Option<u64>,
    pub number: Option<u64>,
    pub time: Option<u64>,
}

/// Substitute `$RepresentationID$`, `$Number$`, `$Time$` and `$Bandwidth$`
/// (each optionally with a `%0<width>d` format tag) and unescape `$$`.
/// Identifiers without a value are left untouched.
pub fn expand_template(template: &str, vars: &TemplateVars<'_>) -> String {
    TEMPLATE_IDENTIFIER
        .replace_all(template, |caps: &Captures<'_>| {
            let Some(identifier) = caps.get(1) else {
                return "$".to_string();
            };
            let value = match identifier.as_str() {
                "RepresentationID" => return vars.representation_id.to_string(),
                "Number" => vars.number,
                "Time" => vars.time,
                _ => vars.bandwidth,
            };
            match (value, caps.get(2)) {
                (Some(value), Some(width)) => {
                    let width = width.as_str().parse::<usize>().unwrap_or(1);
                    format!("{value:0width$}")
                }
                (Some(value), None) => value.to_string(),
                (None, _) => caps[0].to_string(),
            }
        })
        .into_owned()
}
