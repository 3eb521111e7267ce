//! The MPD element tree, as parsed. URL-bearing fields hold the raw manifest
//! text until [`crate::resolve_base_urls`] has run.

use media_types::{ByteRange, Resolution};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mpd {
    /// `static` or `dynamic`.
    pub mpd_type: Option<String>,
    pub base_url: Option<String>,
    /// Seconds.
    pub media_presentation_duration: Option<f64>,
    pub periods: Vec<Period>,
}

impl Mpd {
    pub fn is_dynamic(&self) -> bool {
        self.mpd_type.as_deref() == Some("dynamic")
    }

    /// Duration of period `index` in seconds: its own `duration`, else the
    /// gap to the next period's start, else what remains of the
    /// presentation duration.
    pub fn period_duration(&self, index: usize) -> Option<f64> {
        let period = self.periods.get(index)?;
        if let Some(duration) = period.duration {
            return Some(duration);
        }
        let start = period.start.unwrap_or(0.0);
        if let Some(next_start) = self.periods.get(index + 1).and_then(|p| p.start) {
            return Some(next_start - start);
        }
        self.media_presentation_duration
            .map(|total| (total - start).max(0.0))
    }

    /// Every representation with the index of its period and its
    /// adaptation set, in document order.
    pub fn representations(
        &self,
    ) -> impl Iterator<Item = (usize, &AdaptationSet, &Representation)> + '_ {
        self.periods.iter().enumerate().flat_map(|(index, period)| {
            period.adaptation_sets.iter().flat_map(move |set| {
                set.representations
                    .iter()
                    .map(move |rep| (index, set, rep))
            })
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Period {
    pub id: Option<String>,
    /// Seconds from the start of the presentation.
    pub start: Option<f64>,
    pub duration: Option<f64>,
    pub base_url: Option<String>,
    pub adaptation_sets: Vec<AdaptationSet>,
}

impl Period {
    /// Adaptation sets matching `kind` (`video`, `audio`, `text`) and
    /// `lang`, where given.
    pub fn adaptation_sets_matching<'a>(
        &'a self,
        kind: Option<&'a str>,
        lang: Option<&'a str>,
    ) -> impl Iterator<Item = &'a AdaptationSet> + 'a {
        self.adaptation_sets.iter().filter(move |set| {
            kind.is_none_or(|kind| set.kind() == Some(kind))
                && lang.is_none_or(|lang| set.lang.as_deref() == Some(lang))
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdaptationSet {
    pub id: Option<String>,
    pub content_type: Option<String>,
    pub mime_type: Option<String>,
    pub lang: Option<String>,
    pub base_url: Option<String>,
    pub segment_template: Option<SegmentTemplate>,
    pub segment_list: Option<SegmentList>,
    pub segment_base: Option<SegmentBase>,
    pub representations: Vec<Representation>,
}

impl AdaptationSet {
    /// `contentType`, falling back to the major type of `mimeType`.
    pub fn kind(&self) -> Option<&str> {
        self.content_type.as_deref().or_else(|| {
            self.mime_type
                .as_deref()
                .and_then(|mime| mime.split('/').next())
        })
    }

    /// Highest-bandwidth representation.
    pub fn best_representation(&self) -> Option<&Representation> {
        self.representations
            .iter()
            .max_by_key(|rep| rep.bandwidth.unwrap_or(0))
    }

    pub fn worst_representation(&self) -> Option<&Representation> {
        self.representations
            .iter()
            .min_by_key(|rep| rep.bandwidth.unwrap_or(0))
    }

    pub fn representation(&self, id: &str) -> Option<&Representation> {
        self.representations.iter().find(|rep| rep.id == id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Representation {
    pub id: String,
    pub bandwidth: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub codecs: Option<String>,
    pub mime_type: Option<String>,
    pub frame_rate: Option<String>,
    pub base_url: Option<String>,
    pub segment_template: Option<SegmentTemplate>,
    pub segment_list: Option<SegmentList>,
    pub segment_base: Option<SegmentBase>,
}

impl Representation {
    pub fn resolution(&self) -> Option<Resolution> {
        Some(Resolution::new(self.width?, self.height?))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentTemplate {
    pub media: Option<String>,
    pub initialization: Option<String>,
    pub index: Option<String>,
    pub start_number: Option<u64>,
    pub end_number: Option<u64>,
    pub timescale: Option<u64>,
    /// Ticks of `timescale`.
    pub duration: Option<u64>,
    pub presentation_time_offset: Option<u64>,
    pub timeline: Option<Vec<TimelineEntry>>,
}

/// One `<S t d r>` element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub t: Option<u64>,
    pub d: u64,
    /// Repeat count. Negative repeats until the next `t` or the period end.
    pub r: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentList {
    pub timescale: Option<u64>,
    pub duration: Option<u64>,
    pub initialization: Option<Initialization>,
    pub segment_urls: Vec<SegmentListEntry>,
}

/// One `<SegmentURL>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentListEntry {
    pub media: Option<String>,
    pub media_range: Option<ByteRange>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentBase {
    pub timescale: Option<u64>,
    pub index_range: Option<ByteRange>,
    pub initialization: Option<Initialization>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Initialization {
    pub source_url: Option<String>,
    pub range: Option<ByteRange>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rep(id: &str, bandwidth: u64) -> Representation {
        Representation {
            id: id.into(),
            bandwidth: Some(bandwidth),
            ..Default::default()
        }
    }

    #[test]
    fn picks_representations_by_bandwidth() {
        let set = AdaptationSet {
            representations: vec![rep("mid", 2000), rep("high", 5000), rep("low", 300)],
            ..Default::default()
        };
        assert_eq!(set.best_representation().unwrap().id, "high");
        assert_eq!(set.worst_representation().unwrap().id, "low");
        assert_eq!(set.representation("mid").unwrap().bandwidth, Some(2000));
    }

    #[test]
    fn filters_adaptation_sets() {
        let period = Period {
            adaptation_sets: vec![
                AdaptationSet {
                    mime_type: Some("video/mp4".into()),
                    ..Default::default()
                },
                AdaptationSet {
                    content_type: Some("audio".into()),
                    lang: Some("en".into()),
                    ..Default::default()
                },
                AdaptationSet {
                    content_type: Some("audio".into()),
                    lang: Some("fr".into()),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert_eq!(period.adaptation_sets_matching(Some("video"), None).count(), 1);
        assert_eq!(period.adaptation_sets_matching(Some("audio"), None).count(), 2);
        let french: Vec<_> = period
            .adaptation_sets_matching(Some("audio"), Some("fr"))
            .collect();
        assert_eq!(french.len(), 1);
        assert_eq!(french[0].lang.as_deref(), Some("fr"));
    }

    #[test]
    fn iterates_all_representations() {
        let mpd = Mpd {
            periods: vec![
                Period {
                    adaptation_sets: vec![AdaptationSet {
                        representations: vec![rep("a", 1), rep("b", 2)],
                        ..Default::default()
                    }],
                    ..Default::default()
                },
                Period {
                    adaptation_sets: vec![AdaptationSet {
                        representations: vec![rep("c", 3)],
                        ..Default::default()
                    }],
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let ids: Vec<_> = mpd
            .representations()
            .map(|(period, _, rep)| (period, rep.id.as_str()))
            .collect();
        assert_eq!(ids, vec![(0, "a"), (0, "b"), (1, "c")]);
    }
}
