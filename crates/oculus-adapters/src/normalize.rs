//! Listing Normalizer: marketplace payload -> lake-ready [`NormalizedListing`].
//!
//! Blank strings, `"N/A"` and JSON null all mean "unknown" and come out as
//! `None`; numeric fields that do not parse are unknown rather than zero.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use oculus_core::{
    EquipmentItem, Marketplace, NormalizedListing, PipelineError, PipelineResult, RawListing,
};
use serde_json::Value;

use crate::{gebrauchtwagen, willhaben};

/// Listings without a model year and with less mileage than this are taken
/// to be new vehicles of the current model year.
pub const NEAR_NEW_MAX_KM: i64 = 1_000;
pub const SHORT_TEXT_MAX_CHARS: usize = 255;
pub const DESCRIPTION_MAX_CHARS: usize = 4_000;

const UNKNOWN_SENTINEL: &str = "N/A";

pub fn normalize(
    marketplace: Marketplace,
    details: &Value,
    equipment: &[EquipmentItem],
    now: DateTime<Utc>,
) -> PipelineResult<NormalizedListing> {
    let (mut listing, mut children) = match marketplace {
        Marketplace::Willhaben => willhaben::map_payload(details)?,
        Marketplace::Gebrauchtwagen => gebrauchtwagen::map_payload(details)?,
    };
    children.equipment = clean_equipment(equipment);

    apply_near_new(&mut listing, now);
    let missing = listing.missing_required();
    if !missing.is_empty() {
        return Err(PipelineError::IncompleteListing {
            marketplace,
            listing_id: listing.source_listing_id,
            missing,
        });
    }
    Ok(NormalizedListing { listing, children })
}

fn apply_near_new(listing: &mut RawListing, now: DateTime<Utc>) {
    if listing.year_model.is_some() {
        return;
    }
    if let Some(mileage) = listing.mileage_km {
        if mileage < NEAR_NEW_MAX_KM {
            listing.year_model = Some(now.year());
            listing.mileage_km = Some(0);
        }
    }
}

/// Replace non-breaking spaces and BOMs, collapse whitespace, drop sentinels.
pub fn clean_text(raw: &str) -> Option<String> {
    let cleaned = raw
        .replace(['\u{00a0}', '\u{feff}'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if cleaned.is_empty() || cleaned == UNKNOWN_SENTINEL {
        None
    } else {
        Some(cleaned)
    }
}

pub fn clean_truncated(raw: &str, max_chars: usize) -> Option<String> {
    clean_text(raw).map(|text| match text.char_indices().nth(max_chars) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text,
    })
}

/// Equipment items with cleaned labels; items whose code is unknown are dropped.
pub fn clean_equipment(items: &[EquipmentItem]) -> Vec<EquipmentItem> {
    items
        .iter()
        .filter_map(|item| {
            let code = clean_text(&item.code)?;
            let name = item.name.as_deref().and_then(clean_text);
            Some(EquipmentItem { code, name })
        })
        .collect()
}

/// `;`-separated list, each part cleaned, unknown parts dropped.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(';').filter_map(clean_text).collect()
}

/// Text form of a scalar JSON value; numbers are rendered, objects ignored.
pub(crate) fn json_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => clean_text(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub(crate) fn json_path<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter()
        .try_fold(value, |cur, segment| cur.get(*segment))
        .filter(|v| !v.is_null())
}

pub(crate) fn parse_i64(text: Option<&str>) -> Option<i64> {
    let text = text?.trim();
    text.parse::<i64>().ok().or_else(|| {
        text.parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(|f| f.round() as i64)
    })
}

pub(crate) fn parse_i32(text: Option<&str>) -> Option<i32> {
    parse_i64(text).and_then(|v| i32::try_from(v).ok())
}

pub(crate) fn parse_f64(text: Option<&str>) -> Option<f64> {
    text?.trim().parse::<f64>().ok().filter(|f| f.is_finite())
}

pub(crate) fn parse_bool(text: Option<&str>) -> Option<bool> {
    match text?.trim().to_lowercase().as_str() {
        "1" | "true" | "ja" | "yes" => Some(true),
        "0" | "false" | "nein" | "no" => Some(false),
        _ => None,
    }
}

/// Epoch milliseconds or RFC 3339.
pub(crate) fn parse_timestamp(text: Option<&str>) -> Option<DateTime<Utc>> {
    let text = text?.trim();
    if let Ok(millis) = text.parse::<i64>() {
        return Utc.timestamp_millis_opt(millis).single();
    }
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// `"lat,lon"` -> coordinates.
pub(crate) fn parse_coordinates(text: Option<&str>) -> (Option<f64>, Option<f64>) {
    let Some((lat, lon)) = text.and_then(|t| t.split_once(',')) else {
        return (None, None);
    };
    match (parse_f64(Some(lat)), parse_f64(Some(lon))) {
        (Some(lat), Some(lon)) => (Some(lat), Some(lon)),
        _ => (None, None),
    }
}
