//! Input normalization: accepted crawler payload shapes -> staged records.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use jobmerge_core::{field_str, RawRecord, RecordLifecycle, StagedRecord};

pub const CRATE_NAME: &str = "jobmerge-ingest";

/// Parse a crawler payload of unknown shape into an ordered sequence of raw
/// records. Three shapes are accepted, tried in order: a bare array, an
/// object wrapping an embedded array inside a `request` string, and a single
/// object carrying at least `title` and `company`. Anything else is treated
/// as "no data" rather than an error.
pub fn parse_payload(payload: &str) -> Vec<RawRecord> {
    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(e) => {
            warn!("payload is not valid JSON, treating as empty: {}", e);
            return Vec::new();
        }
    };

    match value {
        Value::Array(items) => collect_records(items),
        Value::Object(object) => {
            if let Some(request) = object.get("request").and_then(Value::as_str) {
                return parse_embedded_array(request);
            }
            if object.contains_key("title") && object.contains_key("company") {
                return vec![object];
            }
            warn!("unrecognized payload object shape, treating as empty");
            Vec::new()
        }
        _ => {
            warn!("unrecognized payload shape, treating as empty");
            Vec::new()
        }
    }
}

/// Locate the first `[` and last `]` inside an HTTP-like request string and
/// parse the substring as a record array.
fn parse_embedded_array(request: &str) -> Vec<RawRecord> {
    let Some(start) = request.find('[') else {
        warn!("request field has no embedded array, treating as empty");
        return Vec::new();
    };
    let Some(end) = request.rfind(']') else {
        warn!("request field has no embedded array, treating as empty");
        return Vec::new();
    };
    if end < start {
        warn!("request field has no embedded array, treating as empty");
        return Vec::new();
    }

    match serde_json::from_str::<Value>(&request[start..=end]) {
        Ok(Value::Array(items)) => collect_records(items),
        Ok(_) | Err(_) => {
            warn!("embedded request payload did not parse as an array, treating as empty");
            Vec::new()
        }
    }
}

fn collect_records(items: Vec<Value>) -> Vec<RawRecord> {
    items
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(object) => Some(object),
            _ => None,
        })
        .collect()
}

/// Parse a source timestamp: RFC 3339 first, then common crawler formats.
pub fn parse_record_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S") {
        return Some(parsed.and_utc());
    }
    if let Ok(parsed) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return parsed.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }
    None
}

/// Wrap a raw record with identity and timestamps for one batch run.
pub fn stage_record(raw: RawRecord) -> StagedRecord {
    let created_at = field_str(&raw, "date_posted").and_then(parse_record_timestamp);
    let source_url = field_str(&raw, "job_url").map(str::to_string);
    StagedRecord {
        id: Uuid::new_v4(),
        raw,
        created_at,
        imported_at: Utc::now(),
        source_url,
        status: RecordLifecycle::Opening,
    }
}

pub fn stage_records(records: Vec<RawRecord>) -> Vec<StagedRecord> {
    records.into_iter().map(stage_record).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn bare_array_preserves_order() {
        let records = parse_payload(
            r#"[{"title":"A","company":"X"},{"title":"B","company":"Y"},{"title":"C","company":"Z"}]"#,
        );
        assert_eq!(records.len(), 3);
        assert_eq!(field_str(&records[0], "title"), Some("A"));
        assert_eq!(field_str(&records[2], "title"), Some("C"));
    }

    #[test]
    fn non_object_array_elements_are_skipped() {
        let records = parse_payload(r#"[{"title":"A","company":"X"}, 42, "noise"]"#);
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn request_wrapped_array_is_extracted() {
        let records = parse_payload(
            r#"{"request":"POST /ingest HTTP/1.1\r\n\r\n[{\"title\":\"A\",\"company\":\"X\"},{\"title\":\"B\",\"company\":\"Y\"}] trailing"}"#,
        );
        assert_eq!(records.len(), 2);
        assert_eq!(field_str(&records[1], "company"), Some("Y"));
    }

    #[test]
    fn single_object_with_title_and_company_is_one_record() {
        let records = parse_payload(r#"{"title":"A","company":"X","job_url":"https://x/1"}"#);
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn unknown_shapes_yield_no_records() {
        assert!(parse_payload(r#"{"foo":"bar"}"#).is_empty());
        assert!(parse_payload(r#""just a string""#).is_empty());
        assert!(parse_payload("not json at all").is_empty());
        assert!(parse_payload(r#"{"request":"no array here"}"#).is_empty());
    }

    #[test]
    fn timestamp_formats_fall_back_in_order() {
        let expected = Utc.with_ymd_and_hms(2026, 3, 1, 8, 30, 0).single().unwrap();
        assert_eq!(parse_record_timestamp("2026-03-01T08:30:00Z"), Some(expected));
        assert_eq!(parse_record_timestamp("2026-03-01 08:30:00"), Some(expected));
        assert_eq!(
            parse_record_timestamp("2026-03-01"),
            Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single()
        );
        assert_eq!(parse_record_timestamp("next tuesday"), None);
        assert_eq!(parse_record_timestamp("  "), None);
    }

    #[test]
    fn staging_assigns_identity_and_parses_source_fields() {
        let raw: RawRecord = serde_json::from_str(
            r#"{"title":"A","company":"X","job_url":"https://x/1","date_posted":"2026-03-01"}"#,
        )
        .unwrap();
        let staged = stage_record(raw);
        assert_eq!(staged.status, RecordLifecycle::Opening);
        assert_eq!(staged.source_url.as_deref(), Some("https://x/1"));
        assert_eq!(
            staged.created_at,
            Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single()
        );
    }
}
