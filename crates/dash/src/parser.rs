//! Recursive descent from the element tree into the typed MPD model, one
//! function per level.

use media_types::{AttributeParseError, ParseMode};
use tracing::{debug, warn};

use crate::error::DashError;
use crate::model::{
    AdaptationSet, Initialization, Mpd, Period, Representation, SegmentBase, SegmentList,
    SegmentListEntry, SegmentTemplate, TimelineEntry,
};
use crate::xml::{Element, parse_document};

/// Parse MPD XML into the raw element model. URLs are left unresolved; run
/// [`crate::resolve_base_urls`] before expanding segments.
pub fn parse_mpd(xml: &str, mode: ParseMode) -> Result<Mpd, DashError> {
    let root = parse_document(xml)?.ok_or(DashError::MissingRoot)?;
    if !root.is("MPD") {
        return Err(DashError::MissingRoot);
    }

    let mut mpd = Mpd {
        mpd_type: root.string("type"),
        base_url: root.child_text("BaseURL"),
        media_presentation_duration: root.duration("mediaPresentationDuration")?,
        periods: Vec::new(),
    };

    for element in root.children("Period") {
        mpd.periods.push(period(element, mode)?);
    }

    debug!(
        periods = mpd.periods.len(),
        dynamic = mpd.is_dynamic(),
        "parsed MPD"
    );
    Ok(mpd)
}

fn period(element: &Element, mode: ParseMode) -> Result<Period, DashError> {
    let mut period = Period {
        id: element.string("id"),
        start: element.duration("start")?,
        duration: element.duration("duration")?,
        base_url: element.child_text("BaseURL"),
        adaptation_sets: Vec::new(),
    };

    for child in element.children("AdaptationSet") {
        match adaptation_set(child, mode) {
            Ok(set) => period.adaptation_sets.push(set),
            Err(err) if mode.is_lenient() => {
                warn!(
                    adaptation_set = child.attr("id").unwrap_or_default(),
                    error = %err,
                    "skipping malformed adaptation set"
                );
            }
            Err(err) => return Err(err.into()),
        }
    }

    Ok(period)
}

fn adaptation_set(element: &Element, mode: ParseMode) -> Result<AdaptationSet, AttributeParseError> {
    let mut set = AdaptationSet {
        id: element.string("id"),
        content_type: element.string("contentType"),
        mime_type: element.string("mimeType"),
        lang: element.string("lang"),
        base_url: element.child_text("BaseURL"),
        segment_template: element.child("SegmentTemplate").map(segment_template).transpose()?,
        segment_list: element.child("SegmentList").map(segment_list).transpose()?,
        segment_base: element.child("SegmentBase").map(segment_base).transpose()?,
        representations: Vec::new(),
    };

    for child in element.children("Representation") {
        match representation(child, &set) {
            Ok(rep) => set.representations.push(rep),
            Err(err) if mode.is_lenient() => {
                warn!(
                    representation = child.attr("id").unwrap_or_default(),
                    error = %err,
                    "skipping malformed representation"
                );
            }
            Err(err) => return Err(err),
        }
    }

    Ok(set)
}

fn representation(
    element: &Element,
    parent: &AdaptationSet,
) -> Result<Representation, AttributeParseError> {
    Ok(Representation {
        id: element.string("id").unwrap_or_default(),
        bandwidth: element.u64("bandwidth")?,
        width: element.u32("width")?,
        height: element.u32("height")?,
        codecs: element.string("codecs"),
        mime_type: element.string("mimeType").or_else(|| parent.mime_type.clone()),
        frame_rate: element.string("frameRate"),
        base_url: element.child_text("BaseURL"),
        segment_template: element.child("SegmentTemplate").map(segment_template).transpose()?,
        segment_list: element.child("SegmentList").map(segment_list).transpose()?,
        segment_base: element.child("SegmentBase").map(segment_base).transpose()?,
    })
}

fn segment_template(element: &Element) -> Result<SegmentTemplate, AttributeParseError> {
    let timeline = element
        .child("SegmentTimeline")
        .map(|timeline| {
            timeline
                .children("S")
                .map(timeline_entry)
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?;

    Ok(SegmentTemplate {
        media: element.string("media"),
        initialization: element.string("initialization"),
        index: element.string("index"),
        start_number: element.u64("startNumber")?,
        end_number: element.u64("endNumber")?,
        timescale: element.u64("timescale")?,
        duration: element.u64("duration")?,
        presentation_time_offset: element.u64("presentationTimeOffset")?,
        timeline,
    })
}

fn timeline_entry(element: &Element) -> Result<TimelineEntry, AttributeParseError> {
    let d = element
        .u64("d")?
        .filter(|d| *d > 0)
        .ok_or_else(|| {
            AttributeParseError::new("d", element.attr("d").unwrap_or_default(), "positive segment duration")
        })?;
    Ok(TimelineEntry {
        t: element.u64("t")?,
        d,
        r: element.i64("r")?.unwrap_or(0),
    })
}

fn segment_list(element: &Element) -> Result<SegmentList, AttributeParseError> {
    let segment_urls = element
        .children("SegmentURL")
        .map(|url| -> Result<SegmentListEntry, AttributeParseError> {
            Ok(SegmentListEntry {
                media: url.string("media"),
                media_range: url.byte_range("mediaRange")?,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(SegmentList {
        timescale: element.u64("timescale")?,
        duration: element.u64("duration")?,
        initialization: element.child("Initialization").map(initialization).transpose()?,
        segment_urls,
    })
}

fn segment_base(element: &Element) -> Result<SegmentBase, AttributeParseError> {
    Ok(SegmentBase {
        timescale: element.u64("timescale")?,
        index_range: element.byte_range("indexRange")?,
        initialization: element.child("Initialization").map(initialization).transpose()?,
    })
}

fn initialization(element: &Element) -> Result<Initialization, AttributeParseError> {
    Ok(Initialization {
        source_url: element.string("sourceURL"),
        range: element.byte_range("range")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use media_types::ByteRange;

    const MPD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" mediaPresentationDuration="PT10S">
  <BaseURL>https://cdn.example.com/content/</BaseURL>
  <Period id="0">
    <AdaptationSet id="1" contentType="video" mimeType="video/mp4">
      <SegmentTemplate media="$RepresentationID$/$Number$.m4s" initialization="$RepresentationID$/init.mp4" timescale="1000" duration="4000" startNumber="1"/>
      <Representation id="v720" bandwidth="3000000" width="1280" height="720" codecs="avc1.64001f"/>
      <Representation id="v360" bandwidth="800000" width="640" height="360"/>
    </AdaptationSet>
    <AdaptationSet id="2" mimeType="audio/mp4" lang="en">
      <Representation id="a1" bandwidth="128000">
        <BaseURL>audio.mp4</BaseURL>
        <SegmentBase indexRange="800-1099"><Initialization range="0-799"/></SegmentBase>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#;

    #[test]
    fn parses_hierarchy() {
        let mpd = parse_mpd(MPD, ParseMode::Strict).unwrap();
        assert!(!mpd.is_dynamic());
        assert_eq!(mpd.media_presentation_duration, Some(10.0));
        assert_eq!(
            mpd.base_url.as_deref(),
            Some("https://cdn.example.com/content/")
        );

        let period = &mpd.periods[0];
        assert_eq!(period.adaptation_sets.len(), 2);

        let video = &period.adaptation_sets[0];
        assert_eq!(video.kind(), Some("video"));
        let template = video.segment_template.as_ref().unwrap();
        assert_eq!(template.duration, Some(4000));
        assert_eq!(template.start_number, Some(1));
        assert_eq!(video.representations[0].bandwidth, Some(3_000_000));
        assert_eq!(video.representations[1].height, Some(360));
        assert_eq!(
            video.representations[0].mime_type.as_deref(),
            Some("video/mp4")
        );

        let audio = &period.adaptation_sets[1];
        assert_eq!(audio.kind(), Some("audio"));
        assert_eq!(audio.lang.as_deref(), Some("en"));
        let base = audio.representations[0].segment_base.as_ref().unwrap();
        assert_eq!(base.index_range, Some(ByteRange::new(800, 300)));
        assert_eq!(
            base.initialization.as_ref().unwrap().range,
            Some(ByteRange::new(0, 800))
        );
    }

    #[test]
    fn timeline_entries() {
        let xml = r#"<MPD><Period><AdaptationSet><Representation id="r">
            <SegmentTemplate media="$Time$.m4s" timescale="90000">
              <SegmentTimeline><S t="0" d="180000" r="2"/><S d="90000"/><S d="45000" r="-1"/></SegmentTimeline>
            </SegmentTemplate></Representation></AdaptationSet></Period></MPD>"#;
        let mpd = parse_mpd(xml, ParseMode::Strict).unwrap();
        let rep = &mpd.periods[0].adaptation_sets[0].representations[0];
        let timeline = rep
            .segment_template
            .as_ref()
            .unwrap()
            .timeline
            .as_ref()
            .unwrap();
        assert_eq!(
            timeline,
            &vec![
                TimelineEntry { t: Some(0), d: 180_000, r: 2 },
                TimelineEntry { t: None, d: 90_000, r: 0 },
                TimelineEntry { t: None, d: 45_000, r: -1 },
            ]
        );
    }

    #[test]
    fn missing_root_is_fatal() {
        assert_eq!(
            parse_mpd("<html><body/></html>", ParseMode::Strict),
            Err(DashError::MissingRoot)
        );
        assert_eq!(
            parse_mpd("", ParseMode::Lenient),
            Err(DashError::MissingRoot)
        );
    }

    #[test]
    fn bad_numeric_attribute_names_attribute_and_value() {
        let xml = r#"<MPD><Period><AdaptationSet>
            <Representation id="bad" bandwidth="12x"/>
            <Representation id="good" bandwidth="1000"/>
        </AdaptationSet></Period></MPD>"#;

        let Err(DashError::Attribute(err)) = parse_mpd(xml, ParseMode::Strict) else {
            panic!("expected attribute error");
        };
        assert_eq!(err.name, "bandwidth");
        assert_eq!(err.value, "12x");

        let mpd = parse_mpd(xml, ParseMode::Lenient).unwrap();
        let reps = &mpd.periods[0].adaptation_sets[0].representations;
        assert_eq!(reps.len(), 1);
        assert_eq!(reps[0].id, "good");
    }

    #[test]
    fn period_duration_falls_back() {
        let xml = r#"<MPD mediaPresentationDuration="PT60S">
            <Period start="PT0S"/><Period start="PT20S"/></MPD>"#;
        let mpd = parse_mpd(xml, ParseMode::Strict).unwrap();
        assert_eq!(mpd.period_duration(0), Some(20.0));
        assert_eq!(mpd.period_duration(1), Some(40.0));
        assert_eq!(mpd.period_duration(2), None);
    }
}
