//! Seismic intensity (shindo) labels and the ordinal scale used for
//! threshold comparisons.
//!
//! The provider spells the half-steps as `5-`, `5+`, `6-`, `6+` (or in
//! full-width Japanese, `震度５弱`).  String order on those tokens is
//! meaningless, so every "intensity ≥ floor" check goes through
//! [`to_ordinal`].

use std::cmp::Ordering;

/// Display label for an event whose intensity is still being collected.
pub const INVESTIGATING: &str = "調査中";

/// Map a raw provider token onto its display label.
///
/// `5-`→`5弱`, `5+`→`5強`, `6-`→`6弱`, `6+`→`6強`; `1`–`4` and `7` pass
/// through.  Full-width digits and a leading `震度` are accepted.  Anything
/// else is returned trimmed and unchanged.
pub fn normalize(token: &str) -> String {
    let ascii: String = token
        .trim()
        .trim_start_matches("震度")
        .chars()
        .map(to_ascii)
        .collect();

    match ascii.trim() {
        "5-" | "5弱" => "5弱".into(),
        "5+" | "5強" => "5強".into(),
        "6-" | "6弱" => "6弱".into(),
        "6+" | "6強" => "6強".into(),
        other => other.to_string(),
    }
}

/// Position of a label on the ordinal scale.  Unknown or empty → `0.0`.
pub fn to_ordinal(label: &str) -> f64 {
    match normalize(label).as_str() {
        "1" => 1.0,
        "2" => 2.0,
        "3" => 3.0,
        "4" => 4.0,
        "5弱" => 5.0,
        "5強" => 5.5,
        "6弱" => 6.0,
        "6強" => 6.5,
        "7" => 7.0,
        _ => 0.0,
    }
}

/// Numeric comparison on ordinals.
pub fn compare(a: &str, b: &str) -> Ordering {
    to_ordinal(a).total_cmp(&to_ordinal(b))
}

/// `true` when `label` sits at or above `floor` on the ordinal scale.
pub fn meets(label: &str, floor: f64) -> bool {
    to_ordinal(label) >= floor
}

/// Parse a configured floor: either a plain number (`3`, `5.5`) or a label
/// (`5弱`, `6+`).  Returns `None` for anything that maps to no intensity.
pub fn parse_floor(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if let Ok(v) = raw.parse::<f64>() {
        return v.is_finite().then_some(v);
    }
    let ordinal = to_ordinal(raw);
    (ordinal > 0.0).then_some(ordinal)
}

fn to_ascii(c: char) -> char {
    match c {
        '０'..='９' => char::from_digit(c as u32 - '０' as u32, 10).unwrap_or(c),
        '－' | '−' => '-',
        '＋' => '+',
        _ => c,
    }
}
