//! Expansion of a representation's addressing into concrete segment URLs.

use media_types::{AttributeParseError, ByteRange};
use mp4::{BoxParseError, find_sidx};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::DashError;
use crate::model::{
    AdaptationSet, Initialization, Mpd, Representation, SegmentBase, SegmentList, SegmentTemplate,
    TimelineEntry,
};
use crate::template::{TemplateVars, expand_template};

/// Most segments one representation may expand to.
pub const MAX_SEGMENTS: u64 = 1_000_000;

/// An attribute whose value pushes segment numbers or times past `u64`.
fn out_of_range(name: &str, value: impl ToString) -> DashError {
    AttributeParseError::new(
        name,
        value.to_string(),
        "a value that keeps segment numbers and times within 64 bits",
    )
    .into()
}

/// An attribute whose value describes more than [`MAX_SEGMENTS`] segments.
fn too_many(name: &str, value: impl ToString) -> DashError {
    AttributeParseError::new(
        name,
        value.to_string(),
        "a value describing at most 1000000 segments",
    )
    .into()
}

/// How many numbers lie in `start..=end`.
fn numbers_through(start: u64, end: u64) -> u64 {
    if end < start {
        0
    } else {
        (end - start).saturating_add(1)
    }
}

/// One addressable media segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentUrl {
    /// Absolute media URL.
    pub media: String,
    /// Absolute per-segment index URL, from `SegmentTemplate@index`.
    pub index: Option<String>,
    pub byte_range: Option<ByteRange>,
    pub timescale: u64,
    /// Ticks of `timescale`.
    pub duration: u64,
    /// `$Number$` of this segment.
    pub number: u64,
    /// `$Time$` of this segment, when the addressing mode defines one.
    pub time: Option<u64>,
}

impl SegmentUrl {
    pub fn duration_secs(&self) -> f64 {
        self.duration as f64 / self.timescale.max(1) as f64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitSegment {
    pub url: String,
    pub byte_range: Option<ByteRange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MediaSegments {
    /// Segments known from the manifest alone.
    Listed(Vec<SegmentUrl>),
    /// A single file whose segment boundaries live in a `sidx` box that has
    /// to be fetched first.
    Indexed(IndexedMedia),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedMedia {
    pub url: String,
    pub index_range: ByteRange,
}

impl IndexedMedia {
    /// Build the segment list from the bytes of `index_range`.
    ///
    /// The first subsegment starts `first_offset` bytes after the end of the
    /// `sidx` box; the rest follow back to back.
    pub fn segments_from_index(&self, index: &[u8]) -> Result<Vec<SegmentUrl>, DashError> {
        let (offset, sidx) = find_sidx(index)?
            .ok_or_else(|| BoxParseError::new(0, "no sidx box in index range"))?;
        let anchor = self
            .index_range
            .offset
            .checked_add(offset)
            .and_then(|end| end.checked_add(sidx.box_size))
            .ok_or_else(|| BoxParseError::new(offset, "index range overflows the file position"))?;
        let timescale = sidx.timescale.max(1) as u64;
        let mut time = sidx.earliest_presentation_time;

        let ranges = sidx
            .segment_ranges(anchor)
            .map_err(|e| BoxParseError::new(offset.saturating_add(e.offset), e.reason))?;

        let mut segments = Vec::with_capacity(ranges.len());
        for (number, (range, reference)) in ranges.into_iter().zip(&sidx.references).enumerate() {
            let duration = reference.subsegment_duration as u64;
            segments.push(SegmentUrl {
                media: self.url.clone(),
                index: None,
                byte_range: Some(range),
                timescale,
                duration,
                number: number as u64,
                time: Some(time),
            });
            time = time.checked_add(duration).ok_or_else(|| {
                BoxParseError::new(offset, "subsegment times overflow 64 bits")
            })?;
        }

        debug!(url = %self.url, segments = segments.len(), "expanded segment index");
        Ok(segments)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpandedRepresentation {
    pub representation_id: String,
    pub bandwidth: Option<u64>,
    pub init: Option<InitSegment>,
    pub media: MediaSegments,
}

enum Addressing<'a> {
    List(&'a SegmentList),
    Template(&'a SegmentTemplate),
    Base(&'a SegmentBase),
}

fn own_addressing<'a>(
    list: Option<&'a SegmentList>,
    template: Option<&'a SegmentTemplate>,
    base: Option<&'a SegmentBase>,
) -> Option<Addressing<'a>> {
    list.map(Addressing::List)
        .or_else(|| template.map(Addressing::Template))
        .or_else(|| base.map(Addressing::Base))
}

/// Expand `rep` (a member of `set` in period `period_index` of `mpd`) into
/// concrete segments. The representation's own addressing wins over the
/// adaptation set's. Expects base URLs to have been resolved.
pub fn expand_representation(
    mpd: &Mpd,
    period_index: usize,
    set: &AdaptationSet,
    rep: &Representation,
) -> Result<ExpandedRepresentation, DashError> {
    let base = rep
        .base_url
        .as_deref()
        .or(set.base_url.as_deref())
        .map(|b| Url::parse(b).map_err(|e| DashError::invalid_uri(b, e)))
        .transpose()?;
    let period_secs = mpd.period_duration(period_index);

    let addressing = own_addressing(
        rep.segment_list.as_ref(),
        rep.segment_template.as_ref(),
        rep.segment_base.as_ref(),
    )
    .or_else(|| {
        own_addressing(
            set.segment_list.as_ref(),
            set.segment_template.as_ref(),
            set.segment_base.as_ref(),
        )
    });

    let expander = Expander {
        rep,
        base: base.as_ref(),
        period_secs,
    };

    let (init, media) = match addressing {
        Some(Addressing::List(list)) => expander.list(list)?,
        Some(Addressing::Template(template)) => expander.template(template)?,
        Some(Addressing::Base(segment_base)) => expander.segment_base(segment_base)?,
        // Only a representation that names its own file can be fetched whole.
        None if rep.base_url.is_some() && rep.base_url != set.base_url => {
            (None, MediaSegments::Listed(vec![expander.whole_file()?]))
        }
        None => {
            return Err(DashError::missing_addressing(
                &rep.id,
                "no SegmentList, SegmentTemplate, SegmentBase or BaseURL",
            ));
        }
    };

    Ok(ExpandedRepresentation {
        representation_id: rep.id.clone(),
        bandwidth: rep.bandwidth,
        init,
        media,
    })
}

struct Expander<'a> {
    rep: &'a Representation,
    base: Option<&'a Url>,
    period_secs: Option<f64>,
}

impl Expander<'_> {
    fn absolute(&self, uri: &str) -> Result<String, DashError> {
        match self.base {
            Some(base) => base
                .join(uri)
                .map(String::from)
                .map_err(|e| DashError::invalid_uri(uri, e)),
            None => Url::parse(uri)
                .map(String::from)
                .map_err(|e| DashError::invalid_uri(uri, e)),
        }
    }

    fn base_url(&self) -> Result<String, DashError> {
        self.base.map(|base| base.to_string()).ok_or_else(|| {
            DashError::missing_addressing(&self.rep.id, "no BaseURL to address media by")
        })
    }

    fn initialization(&self, init: &Initialization) -> Result<InitSegment, DashError> {
        let url = match init.source_url.as_deref() {
            Some(url) => self.absolute(url)?,
            None => self.base_url()?,
        };
        Ok(InitSegment {
            url,
            byte_range: init.range,
        })
    }

    fn vars(&self) -> TemplateVars<'_> {
        TemplateVars {
            representation_id: &self.rep.id,
            bandwidth: self.rep.bandwidth,
            ..Default::default()
        }
    }

    fn whole_file(&self) -> Result<SegmentUrl, DashError> {
        Ok(SegmentUrl {
            media: self.base_url()?,
            index: None,
            byte_range: None,
            timescale: 1000,
            duration: self
                .period_secs
                .map(|secs| (secs * 1000.0).round() as u64)
                .unwrap_or(0),
            number: 0,
            time: None,
        })
    }

    fn list(&self, list: &SegmentList) -> Result<(Option<InitSegment>, MediaSegments), DashError> {
        let timescale = list.timescale.unwrap_or(1);
        let duration = list.duration.unwrap_or(0);
        let init = list
            .initialization
            .as_ref()
            .map(|init| self.initialization(init))
            .transpose()?;

        let segments = list
            .segment_urls
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                let media = match entry.media.as_deref() {
                    Some(media) => self.absolute(media)?,
                    None => self.base_url()?,
                };
                let number = i as u64;
                let time = match duration {
                    0 => None,
                    d => Some(
                        number
                            .checked_mul(d)
                            .ok_or_else(|| out_of_range("SegmentList@duration", d))?,
                    ),
                };
                Ok(SegmentUrl {
                    media,
                    index: None,
                    byte_range: entry.media_range,
                    timescale,
                    duration,
                    number,
                    time,
                })
            })
            .collect::<Result<Vec<_>, DashError>>()?;

        Ok((init, MediaSegments::Listed(segments)))
    }

    fn segment_base(
        &self,
        segment_base: &SegmentBase,
    ) -> Result<(Option<InitSegment>, MediaSegments), DashError> {
        let init = segment_base
            .initialization
            .as_ref()
            .map(|init| self.initialization(init))
            .transpose()?;

        let media = match segment_base.index_range {
            Some(index_range) => MediaSegments::Indexed(IndexedMedia {
                url: self.base_url()?,
                index_range,
            }),
            None => MediaSegments::Listed(vec![self.whole_file()?]),
        };
        Ok((init, media))
    }

    fn template(
        &self,
        template: &SegmentTemplate,
    ) -> Result<(Option<InitSegment>, MediaSegments), DashError> {
        let rep_id = self.rep.id.as_str();
        let media = template.media.as_deref().ok_or_else(|| {
            DashError::missing_addressing(rep_id, "SegmentTemplate has no media pattern")
        })?;
        let timescale = template.timescale.unwrap_or(1).max(1);
        let start_number = template.start_number.unwrap_or(0);
        let pto = template.presentation_time_offset.unwrap_or(0);

        let init = template
            .initialization
            .as_deref()
            .map(|pattern| {
                self.absolute(&expand_template(pattern, &self.vars()))
                    .map(|url| InitSegment {
                        url,
                        byte_range: None,
                    })
            })
            .transpose()?;

        let mut slots = match template.timeline.as_deref() {
            Some(entries) => {
                let period_end = self
                    .period_secs
                    .map(|secs| {
                        pto.checked_add((secs * timescale as f64).round() as u64)
                            .ok_or_else(|| out_of_range("presentationTimeOffset", pto))
                    })
                    .transpose()?;
                timeline_slots(entries, period_end, rep_id)?
            }
            None => {
                let duration = template.duration.filter(|d| *d > 0).ok_or_else(|| {
                    DashError::missing_addressing(
                        rep_id,
                        "SegmentTemplate has neither a SegmentTimeline nor a duration",
                    )
                })?;
                let by_period = self
                    .period_secs
                    .map(|secs| segment_count(secs, duration, timescale));
                let by_end = template
                    .end_number
                    .map(|end| numbers_through(start_number, end));
                let count = match (by_period, by_end) {
                    (Some(a), Some(b)) => a.min(b),
                    (Some(count), None) | (None, Some(count)) => count,
                    (None, None) => {
                        return Err(DashError::missing_addressing(
                            rep_id,
                            "period duration is unknown and no endNumber is set",
                        ));
                    }
                };
                if count > MAX_SEGMENTS {
                    return Err(match template.end_number {
                        Some(end) if by_end == Some(count) => too_many("endNumber", end),
                        _ => too_many("duration", duration),
                    });
                }
                (0..count)
                    .map(|i| {
                        let offset = i
                            .checked_mul(duration)
                            .ok_or_else(|| out_of_range("duration", duration))?;
                        let time = pto
                            .checked_add(offset)
                            .ok_or_else(|| out_of_range("presentationTimeOffset", pto))?;
                        Ok((time, duration))
                    })
                    .collect::<Result<Vec<_>, DashError>>()?
            }
        };

        if let Some(end) = template.end_number {
            let allowed = numbers_through(start_number, end);
            if (slots.len() as u64) > allowed {
                slots.truncate(allowed as usize);
            }
        }

        let segments = slots
            .into_iter()
            .enumerate()
            .map(|(i, (time, duration))| {
                let number = start_number
                    .checked_add(i as u64)
                    .ok_or_else(|| out_of_range("startNumber", start_number))?;
                let vars = TemplateVars {
                    number: Some(number),
                    time: Some(time),
                    ..self.vars()
                };
                Ok(SegmentUrl {
                    media: self.absolute(&expand_template(media, &vars))?,
                    index: template
                        .index
                        .as_deref()
                        .map(|pattern| self.absolute(&expand_template(pattern, &vars)))
                        .transpose()?,
                    byte_range: None,
                    timescale,
                    duration,
                    number,
                    time: Some(time),
                })
            })
            .collect::<Result<Vec<_>, DashError>>()?;

        debug!(
            representation = rep_id,
            segments = segments.len(),
            timeline = template.timeline.is_some(),
            "expanded segment template"
        );
        Ok((init, MediaSegments::Listed(segments)))
    }
}

/// `ceil(period / (duration / timescale))`, tolerant of float noise when the
/// period is an exact multiple of the segment duration.
fn segment_count(period_secs: f64, duration: u64, timescale: u64) -> u64 {
    let exact = period_secs * timescale as f64 / duration as f64;
    (exact - 1e-9).ceil().max(0.0) as u64
}

/// `(time, duration)` of every segment a timeline describes. A negative
/// repeat count runs until the next entry's `t`, or `period_end` for the
/// last entry. Fails on times past `u64::MAX` and on more than
/// [`MAX_SEGMENTS`] slots.
fn timeline_slots(
    entries: &[TimelineEntry],
    period_end: Option<u64>,
    rep_id: &str,
) -> Result<Vec<(u64, u64)>, DashError> {
    let mut slots = Vec::new();
    let mut cursor = 0u64;

    for (i, entry) in entries.iter().enumerate() {
        if let Some(t) = entry.t {
            cursor = t;
        }
        let d = entry.d.max(1);
        let count = if entry.r >= 0 {
            (entry.r as u64).saturating_add(1)
        } else {
            let end = entries
                .get(i + 1)
                .and_then(|next| next.t)
                .or(period_end)
                .ok_or_else(|| {
                    DashError::missing_addressing(
                        rep_id,
                        "open-ended SegmentTimeline repeat without a known period end",
                    )
                })?;
            end.saturating_sub(cursor).div_ceil(d)
        };

        if (slots.len() as u64).saturating_add(count) > MAX_SEGMENTS {
            return Err(too_many("S@r", entry.r));
        }
        for _ in 0..count {
            slots.push((cursor, d));
            cursor = cursor
                .checked_add(d)
                .ok_or_else(|| out_of_range("S@t", cursor))?;
        }
    }

    Ok(slots)
}
