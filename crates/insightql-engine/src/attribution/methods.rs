//! Credit assignment for one converted user.

use std::collections::{BTreeSet, HashMap};

use insightql_core::attribution::{AttributionKeyWeight, AttributionMethodology, RangeTimestamp};
use insightql_core::query::{PROPERTY_VALUE_NONE, SECONDS_IN_DAY};

const TIME_DECAY_HALF_LIFE_DAYS: f64 = 7.0;

/// A touch qualifies when it is not after the conversion and within the
/// lookback. Engagement-based runs also require it inside `period`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Window {
    pub conversion_time: i64,
    pub lookback_secs: i64,
    pub period: Option<(i64, i64)>,
}

impl Window {
    fn admits(&self, touch: i64) -> bool {
        let within_lookback =
            self.conversion_time >= touch && self.conversion_time - touch <= self.lookback_secs;
        let within_period = self.period.map_or(true, |(from, to)| from <= touch && touch <= to);
        within_lookback && within_period
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Touch<'a> {
    key: &'a str,
    time: i64,
}

/// Every key's first and last timestamp, ordered by key then time.
fn touches(ranges: &HashMap<String, RangeTimestamp>) -> Vec<Touch<'_>> {
    let mut keys: Vec<&String> = ranges.keys().collect();
    keys.sort();
    let mut out = Vec::new();
    for key in keys {
        let range = &ranges[key];
        let times: BTreeSet<i64> = [range.min_timestamp, range.max_timestamp].into_iter().collect();
        out.extend(times.into_iter().map(|time| Touch { key: key.as_str(), time }));
    }
    out
}

fn single(key: &str) -> Vec<AttributionKeyWeight> {
    vec![AttributionKeyWeight {
        key: key.to_string(),
        weight: 1.0,
    }]
}

fn first_touch(
    ranges: &HashMap<String, RangeTimestamp>,
    window: &Window,
) -> Vec<AttributionKeyWeight> {
    let mut all = touches(ranges);
    all.sort_by_key(|t| t.time);
    all.iter()
        .find(|t| window.admits(t.time))
        .map(|t| single(t.key))
        .unwrap_or_default()
}

fn last_touch(
    ranges: &HashMap<String, RangeTimestamp>,
    window: &Window,
) -> Vec<AttributionKeyWeight> {
    let mut all = touches(ranges);
    all.sort_by_key(|t| std::cmp::Reverse(t.time));
    all.iter()
        .find(|t| window.admits(t.time))
        .map(|t| single(t.key))
        .unwrap_or_default()
}

/// Like first/last touch, but `$none` only wins when nothing else qualified.
fn non_direct(
    ranges: &HashMap<String, RangeTimestamp>,
    window: &Window,
    latest_first: bool,
) -> Vec<AttributionKeyWeight> {
    let mut all = touches(ranges);
    if latest_first {
        all.sort_by_key(|t| std::cmp::Reverse(t.time));
    } else {
        all.sort_by_key(|t| t.time);
    }
    let mut direct_seen = false;
    for touch in all.iter().filter(|t| window.admits(t.time)) {
        if touch.key == PROPERTY_VALUE_NONE {
            direct_seen = true;
            continue;
        }
        return single(touch.key);
    }
    if direct_seen {
        single(PROPERTY_VALUE_NONE)
    } else {
        Vec::new()
    }
}

fn linear(ranges: &HashMap<String, RangeTimestamp>, window: &Window) -> Vec<AttributionKeyWeight> {
    let keys: BTreeSet<&str> = touches(ranges)
        .into_iter()
        .filter(|t| window.admits(t.time))
        .map(|t| t.key)
        .collect();
    let weight = 1.0 / keys.len() as f64;
    keys.into_iter()
        .map(|key| AttributionKeyWeight {
            key: key.to_string(),
            weight,
        })
        .collect()
}

fn u_shaped(
    ranges: &HashMap<String, RangeTimestamp>,
    window: &Window,
) -> Vec<AttributionKeyWeight> {
    let mut keys = first_touch(ranges, window);
    keys.extend(last_touch(ranges, window));
    for key in &mut keys {
        key.weight = 0.5;
    }
    keys
}

/// `2^(-days / 7)`, counting whole days before the conversion.
pub(crate) fn time_decay_weight(conversion_time: i64, touch: i64) -> f64 {
    let days = (conversion_time - touch) / SECONDS_IN_DAY;
    2f64.powf(-(days as f64) / TIME_DECAY_HALF_LIFE_DAYS)
}

fn time_decay(
    ranges: &HashMap<String, RangeTimestamp>,
    window: &Window,
) -> Vec<AttributionKeyWeight> {
    let mut keys: Vec<AttributionKeyWeight> = touches(ranges)
        .into_iter()
        .filter(|t| window.admits(t.time))
        .map(|t| AttributionKeyWeight {
            key: t.key.to_string(),
            weight: time_decay_weight(window.conversion_time, t.time),
        })
        .collect();
    let total: f64 = keys.iter().map(|k| k.weight).sum();
    if total > 0.0 {
        for key in &mut keys {
            key.weight /= total;
        }
    }
    keys
}

/// Key weights for one conversion. Empty when no touch qualified.
pub(crate) fn attribute(
    methodology: AttributionMethodology,
    ranges: &HashMap<String, RangeTimestamp>,
    window: &Window,
) -> Vec<AttributionKeyWeight> {
    match methodology {
        AttributionMethodology::FirstTouch => first_touch(ranges, window),
        AttributionMethodology::LastTouch => last_touch(ranges, window),
        AttributionMethodology::FirstTouchNonDirect => non_direct(ranges, window, false),
        AttributionMethodology::LastTouchNonDirect => non_direct(ranges, window, true),
        AttributionMethodology::Linear => linear(ranges, window),
        AttributionMethodology::UShaped => u_shaped(ranges, window),
        AttributionMethodology::TimeDecay => time_decay(ranges, window),
    }
}
