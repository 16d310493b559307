use chrono::{DateTime, NaiveDate, SecondsFormat};
use tracing::debug;

use crate::record::{Scalar, VesselRecord, IDENTITY_KEY};

/// Fields holding Unix epoch seconds when they arrive as plain integers.
const EPOCH_FIELDS: &[&str] = &["ETA_UPDATED", "FIRST_POS_TIMESTAMP"];

const LAUNCH_DATE: &str = "LAUNCH_DATE";

/// Position, speed, course, draught and dimensions.
pub const NUMERIC_FIELDS: &[&str] = &[
    "LAT", "LON", "SPEED", "COURSE", "HEADING", "DRAUGHT", "LENGTH", "WIDTH", "DWT", "GT",
];

/// Fallbacks for identity when `SHIP_ID` is absent, in preference order.
const IDENTITY_FALLBACKS: &[&str] = &["IMO", "MMSI"];

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%B %d, %Y",
    "%B %d %Y",
    "%d %B %Y",
    "%d %B, %Y",
    "%m/%d/%Y",
    "%d.%m.%Y",
];

pub fn normalize(mut record: VesselRecord) -> VesselRecord {
    for field in EPOCH_FIELDS {
        if let Some(value) = record.get_mut(*field) {
            if let Some(iso) = epoch_to_iso(value) {
                *value = Scalar::Text(iso);
            }
        }
    }

    if let Some(value) = record.get_mut(LAUNCH_DATE).filter(|v| !v.is_null()) {
        *value = match parse_calendar_date(&value.to_string()) {
            Some(date) => Scalar::Text(date.format("%Y-%m-%d").to_string()),
            None => {
                debug!(value = %value, "unparsable launch date, nulling");
                Scalar::Null
            }
        };
    }

    for field in NUMERIC_FIELDS {
        if let Some(value) = record.get_mut(*field) {
            if let Scalar::Text(text) = &*value {
                if let Some(n) = parse_decimal(text) {
                    *value = Scalar::Number(n);
                }
            }
        }
    }

    ensure_identity(&mut record);
    record
}

/// Rewrites epoch seconds as an ISO-8601 UTC timestamp. Anything that is not a
/// plain integer is left alone.
fn epoch_to_iso(value: &Scalar) -> Option<String> {
    let secs = match value {
        Scalar::Text(s) => s.trim().parse::<i64>().ok()?,
        Scalar::Number(n) if n.fract() == 0.0 => *n as i64,
        _ => return None,
    };
    let ts = DateTime::from_timestamp(secs, 0)?;
    Some(ts.to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn parse_calendar_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.date_naive());
    }
    if let Some(date) = DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
    {
        return Some(date);
    }
    // bare year
    if s.len() == 4 {
        if let Ok(year) = s.parse::<i32>() {
            return NaiveDate::from_ymd_opt(year, 1, 1);
        }
    }
    None
}

fn parse_decimal(text: &str) -> Option<f64> {
    let cleaned = text.trim().replace(',', ".");
    cleaned.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Fills `SHIP_ID` from the first available fallback key and renders it as text.
fn ensure_identity(record: &mut VesselRecord) {
    let key = record
        .get(IDENTITY_KEY)
        .and_then(Scalar::as_key)
        .or_else(|| {
            IDENTITY_FALLBACKS
                .iter()
                .find_map(|k| record.get(*k).and_then(Scalar::as_key))
        });
    match key {
        Some(k) => {
            record.insert(IDENTITY_KEY.to_string(), Scalar::Text(k));
        }
        None => {
            record.remove(IDENTITY_KEY);
        }
    }
}
