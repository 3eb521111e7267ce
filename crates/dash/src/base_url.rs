//! `BaseURL` inheritance.

use url::Url;

use crate::error::DashError;
use crate::model::{AdaptationSet, Initialization, Mpd, Period, Representation, SegmentBase, SegmentList};

/// Return a copy of `mpd` in which every node's `base_url` is its effective
/// absolute base: the manifest URL joined with each ancestor's `BaseURL`
/// and finally the node's own, left to right. `SegmentList` and
/// `Initialization` URLs are resolved against the base of the level that
/// declares them. `SegmentTemplate` patterns stay relative; they are
/// resolved after substitution.
pub fn resolve_base_urls(mpd: &Mpd, manifest_url: &Url) -> Result<Mpd, DashError> {
    let base = join(manifest_url, mpd.base_url.as_deref())?;
    let periods = mpd
        .periods
        .iter()
        .map(|period| resolve_period(period, &base))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Mpd {
        base_url: Some(base.to_string()),
        periods,
        ..mpd.clone()
    })
}

fn resolve_period(period: &Period, parent: &Url) -> Result<Period, DashError> {
    let base = join(parent, period.base_url.as_deref())?;
    let adaptation_sets = period
        .adaptation_sets
        .iter()
        .map(|set| resolve_adaptation_set(set, &base))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Period {
        base_url: Some(base.to_string()),
        adaptation_sets,
        ..period.clone()
    })
}

fn resolve_adaptation_set(set: &AdaptationSet, parent: &Url) -> Result<AdaptationSet, DashError> {
    let base = join(parent, set.base_url.as_deref())?;
    let representations = set
        .representations
        .iter()
        .map(|rep| resolve_representation(rep, &base))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(AdaptationSet {
        base_url: Some(base.to_string()),
        segment_list: set
            .segment_list
            .as_ref()
            .map(|list| resolve_segment_list(list, &base))
            .transpose()?,
        segment_base: set
            .segment_base
            .as_ref()
            .map(|sb| resolve_segment_base(sb, &base))
            .transpose()?,
        representations,
        ..set.clone()
    })
}

fn resolve_representation(rep: &Representation, parent: &Url) -> Result<Representation, DashError> {
    let base = join(parent, rep.base_url.as_deref())?;
    Ok(Representation {
        base_url: Some(base.to_string()),
        segment_list: rep
            .segment_list
            .as_ref()
            .map(|list| resolve_segment_list(list, &base))
            .transpose()?,
        segment_base: rep
            .segment_base
            .as_ref()
            .map(|sb| resolve_segment_base(sb, &base))
            .transpose()?,
        ..rep.clone()
    })
}

fn resolve_segment_list(list: &SegmentList, base: &Url) -> Result<SegmentList, DashError> {
    let mut list = list.clone();
    for entry in &mut list.segment_urls {
        if let Some(media) = entry.media.as_deref() {
            entry.media = Some(resolve(base, media)?);
        }
    }
    list.initialization = list
        .initialization
        .as_ref()
        .map(|init| resolve_initialization(init, base))
        .transpose()?;
    Ok(list)
}

fn resolve_segment_base(segment_base: &SegmentBase, base: &Url) -> Result<SegmentBase, DashError> {
    Ok(SegmentBase {
        initialization: segment_base
            .initialization
            .as_ref()
            .map(|init| resolve_initialization(init, base))
            .transpose()?,
        ..segment_base.clone()
    })
}

fn resolve_initialization(init: &Initialization, base: &Url) -> Result<Initialization, DashError> {
    Ok(Initialization {
        source_url: init
            .source_url
            .as_deref()
            .map(|url| resolve(base, url))
            .transpose()?,
        ..init.clone()
    })
}

fn join(parent: &Url, relative: Option<&str>) -> Result<Url, DashError> {
    match relative.map(str::trim).filter(|r| !r.is_empty()) {
        Some(relative) => parent
            .join(relative)
            .map_err(|e| DashError::invalid_uri(relative, e)),
        None => Ok(parent.clone()),
    }
}

/// Resolve `uri` against an absolute base.
pub fn resolve(base: &Url, uri: &str) -> Result<String, DashError> {
    join(base, Some(uri)).map(String::from)
}
