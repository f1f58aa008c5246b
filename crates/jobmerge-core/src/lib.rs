//! Core domain model, text/key normalization, and similarity scoring for jobmerge.

use std::collections::HashMap;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strsim::jaro_winkler;
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobmerge-core";

/// Sentinel company id carried by quarantined (PassJob) postings.
pub const UNRESOLVED_COMPANY_ID: Uuid = Uuid::nil();

/// Days a posting stays open when the source supplies no deadline.
pub const JOB_DEADLINE_DAYS: i64 = 30;

/// TTL for dedup cache entries, in seconds (30 days).
pub const DEDUP_TTL_SECS: u64 = 30 * 24 * 60 * 60;

pub const COMPANY_SIMILARITY_THRESHOLD: f64 = 0.9;
pub const TITLE_SIMILARITY_THRESHOLD: f64 = 0.9;

/// Descriptions shorter than this need the stricter similarity bar.
pub const SHORT_DESCRIPTION_LIMIT: usize = 200;
pub const SHORT_DESCRIPTION_THRESHOLD: f64 = 0.9;
pub const LONG_DESCRIPTION_THRESHOLD: f64 = 0.8;

/// Two postings whose effective deadlines differ by less than this many hours
/// are considered to come from the same crawl window.
pub const DEADLINE_WINDOW_HOURS: i64 = 24;

/// Untyped crawler payload record. Field sets vary by crawler source, so this
/// stays an open map with defensive accessors rather than a rigid schema.
pub type RawRecord = Map<String, Value>;

/// Lifecycle status assigned to a record while it moves through a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecordLifecycle {
    #[default]
    Opening,
    Closed,
}

/// A raw record wrapped with identity and timestamps, owned by the batch
/// executor for the duration of one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedRecord {
    pub id: Uuid,
    pub raw: RawRecord,
    pub created_at: Option<DateTime<Utc>>,
    pub imported_at: DateTime<Utc>,
    pub source_url: Option<String>,
    pub status: RecordLifecycle,
}

impl StagedRecord {
    /// Effective deadline used for crawl-window comparisons: creation time
    /// (import time when absent) plus the default posting lifetime.
    pub fn effective_deadline(&self) -> DateTime<Utc> {
        self.created_at.unwrap_or(self.imported_at) + Duration::days(JOB_DEADLINE_DAYS)
    }
}

/// Canonical company entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Company {
    pub id: Uuid,
    pub name: String,
    pub normalized_name: String,
    pub sector: String,
    pub industry: String,
    pub sub_industry: String,
    pub address: String,
    pub status: String,
}

/// Canonical job posting. A quarantined posting (PassJob) has the same shape
/// with `company_id` fixed to [`UNRESOLVED_COMPANY_ID`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub business_id: String,
    pub title: String,
    pub company_id: Uuid,
    pub company_name: String,
    pub description: String,
    pub location: String,
    pub salary_min: Option<f64>,
    pub salary_max: Option<f64>,
    pub salary_unit: Option<String>,
    pub skills: Vec<String>,
    pub job_type: String,
    pub source_url: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

pub type PassJob = Job;

/// Terminal outcome for one input record. Exactly one is recorded per record
/// per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    MigratedJob,
    MigratedPassjob,
    DedupRedis,
    DedupDb,
    Invalid,
    Error,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::MigratedJob => "migrated_job",
            MigrationStatus::MigratedPassjob => "migrated_passjob",
            MigrationStatus::DedupRedis => "dedup_redis",
            MigrationStatus::DedupDb => "dedup_db",
            MigrationStatus::Invalid => "invalid",
            MigrationStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only audit fact for one processed record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMigrationDetail {
    pub record_id: Uuid,
    pub title: String,
    pub company: String,
    pub url: String,
    pub status: MigrationStatus,
    pub message: String,
}

/// Aggregated outcome of one migration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_records: usize,
    pub jobs_migrated: usize,
    pub pass_jobs_migrated: usize,
    pub duplicates_found: usize,
    pub invalid_records: usize,
    pub failed_records: usize,
    pub record_details: Vec<RecordMigrationDetail>,
}

// ─── Raw record accessors ──────────────────────────────────────────────────

/// Non-empty trimmed string field, or None.
pub fn field_str<'a>(record: &'a RawRecord, key: &str) -> Option<&'a str> {
    record
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Numeric field parsed defensively: a JSON number, or a string that parses
/// as one. Anything else is None rather than an error.
pub fn field_f64(record: &RawRecord, key: &str) -> Option<f64> {
    match record.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', "").parse::<f64>().ok(),
        _ => None,
    }
}

/// List field parsed from either a JSON array of strings or a single
/// delimited string (comma, semicolon, or slash separated).
pub fn field_string_list(record: &RawRecord, key: &str) -> Vec<String> {
    match record.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) => s
            .split(|c| c == ',' || c == ';' || c == '/')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

// ─── Text/key normalization ────────────────────────────────────────────────

/// Lowercase, replace everything outside `[a-z0-9 ]` with a space, collapse
/// whitespace, trim.
pub fn normalize_text(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Company-name normalization: punctuation to spaces, common legal-suffix
/// abbreviations expanded, "limited company" collapsed to "limited".
pub fn normalize_company_name(input: &str) -> String {
    let spaced: String = input
        .to_lowercase()
        .chars()
        .map(|c| match c {
            '.' | ',' | '(' | ')' | '-' => ' ',
            other => other,
        })
        .collect();

    let expanded = spaced
        .split_whitespace()
        .map(|token| match token {
            "ltd" => "limited",
            "co" => "company",
            "corp" => "corporation",
            other => other,
        })
        .collect::<Vec<_>>()
        .join(" ");

    expanded
        .replace("limited company", "limited")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_tracking_param(name: &str) -> bool {
    matches!(name, "id" | "session") || name.starts_with("utm_")
}

/// Strip session/tracking query parameters, keeping path plus the remaining
/// query. Unparsable URLs pass through unchanged.
pub fn normalize_url(raw: &str) -> String {
    let Ok(parsed) = Url::parse(raw) else {
        return raw.to_string();
    };

    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(name, _)| !is_tracking_param(name))
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();

    let mut out = parsed.path().to_string();
    if !kept.is_empty() {
        let query = kept
            .iter()
            .map(|(name, value)| {
                if value.is_empty() {
                    name.clone()
                } else {
                    format!("{name}={value}")
                }
            })
            .collect::<Vec<_>>()
            .join("&");
        out.push('?');
        out.push_str(&query);
    }
    out
}

/// Composite dedup key. The timestamp component defaults to "now" when the
/// source record has no creation date, which makes the key time-sensitive.
pub fn build_dedup_key(
    title: &str,
    company: &str,
    created_at: Option<DateTime<Utc>>,
    url: &str,
) -> String {
    let stamp = created_at.unwrap_or_else(Utc::now);
    format!(
        "{}|||{}|||{}|||{}",
        normalize_text(title),
        normalize_company_name(company),
        stamp.to_rfc3339_opts(SecondsFormat::Secs, true),
        normalize_url(url)
    )
}

// ─── Similarity scoring ────────────────────────────────────────────────────

/// Jaro-Winkler over normalized company names, range [0, 1].
pub fn company_similarity(a: &str, b: &str) -> f64 {
    jaro_winkler(&normalize_company_name(a), &normalize_company_name(b))
}

/// Jaro-Winkler over normalized titles, range [0, 1].
pub fn title_similarity(a: &str, b: &str) -> f64 {
    jaro_winkler(&normalize_text(a), &normalize_text(b))
}

fn term_frequencies(text: &str) -> HashMap<String, f64> {
    let mut counts = HashMap::new();
    for token in normalize_text(text).split_whitespace() {
        *counts.entry(token.to_string()).or_insert(0.0) += 1.0;
    }
    counts
}

/// Cosine similarity over term-frequency vectors of whitespace-split
/// normalized tokens. Empty inputs score 0.
pub fn description_similarity(a: &str, b: &str) -> f64 {
    let ta = term_frequencies(a);
    let tb = term_frequencies(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }

    let dot: f64 = ta
        .iter()
        .filter_map(|(token, weight)| tb.get(token).map(|other| weight * other))
        .sum();
    let norm_a: f64 = ta.values().map(|w| w * w).sum::<f64>().sqrt();
    let norm_b: f64 = tb.values().map(|w| w * w).sum::<f64>().sqrt();
    dot / (norm_a * norm_b)
}

/// Shorter text needs a stricter bar to avoid accidental matches.
pub fn description_threshold(length: usize) -> f64 {
    if length < SHORT_DESCRIPTION_LIMIT {
        SHORT_DESCRIPTION_THRESHOLD
    } else {
        LONG_DESCRIPTION_THRESHOLD
    }
}

pub fn within_deadline_window(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    (a - b).num_hours().abs() < DEADLINE_WINDOW_HOURS
}

/// Duplicate verdict when both records carry a description.
pub fn is_duplicate_description(
    a: &str,
    b: &str,
    deadline_a: DateTime<Utc>,
    deadline_b: DateTime<Utc>,
) -> bool {
    let length = a.len().min(b.len());
    description_similarity(a, b) >= description_threshold(length)
        && within_deadline_window(deadline_a, deadline_b)
}

/// Duplicate verdict when no description is available to compare: title and
/// company must both clear the strict bar, and the deadlines must fall in the
/// same crawl window.
pub fn is_duplicate_without_description(
    title_a: &str,
    title_b: &str,
    company_a: &str,
    company_b: &str,
    deadline_a: DateTime<Utc>,
    deadline_b: DateTime<Utc>,
) -> bool {
    title_similarity(title_a, title_b) >= TITLE_SIMILARITY_THRESHOLD
        && company_similarity(company_a, company_b) >= COMPANY_SIMILARITY_THRESHOLD
        && within_deadline_window(deadline_a, deadline_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).single().unwrap()
    }

    #[test]
    fn normalize_text_strips_punctuation_and_collapses() {
        assert_eq!(normalize_text("  Sr. Data-Analyst  (Remote!) "), "sr data analyst remote");
        assert_eq!(normalize_text("C++ / Rust Dev"), "c rust dev");
    }

    #[test]
    fn company_abbreviations_expand() {
        assert_eq!(normalize_company_name("Acme Ltd."), "acme limited");
        assert_eq!(normalize_company_name("Acme Co"), "acme company");
        assert_eq!(normalize_company_name("Acme Corp."), "acme corporation");
    }

    #[test]
    fn limited_company_collapses_to_limited() {
        assert_eq!(normalize_company_name("Acme Limited Company"), "acme limited");
        assert_eq!(normalize_company_name("Acme Ltd Co"), "acme limited");
    }

    #[test]
    fn url_tracking_params_are_stripped() {
        assert_eq!(
            normalize_url("https://x/jobs/1?utm_source=rss&page=2&session=abc&id=9"),
            "/jobs/1?page=2"
        );
        assert_eq!(normalize_url("https://x/jobs/1?utm_medium=feed"), "/jobs/1");
    }

    #[test]
    fn unparsable_url_passes_through() {
        assert_eq!(normalize_url("not a url"), "not a url");
    }

    #[test]
    fn dedup_key_is_stable_for_fixed_timestamp() {
        let stamp = ts(8);
        let a = build_dedup_key("Data Analyst", "Acme Inc", Some(stamp), "https://x/jobs/1?utm_source=rss");
        let b = build_dedup_key("data  analyst!", "acme inc", Some(stamp), "https://x/jobs/1");
        assert_eq!(a, b);
        assert_eq!(a, "data analyst|||acme inc|||2026-03-01T08:00:00Z|||/jobs/1");
    }

    #[test]
    fn company_variants_score_above_threshold() {
        let score = company_similarity("Acme Corp.", "Acme Corporation");
        assert!(score >= COMPANY_SIMILARITY_THRESHOLD, "score was {score}");
    }

    #[test]
    fn unrelated_companies_score_below_threshold() {
        let score = company_similarity("Acme Corporation", "Globex Industries");
        assert!(score < COMPANY_SIMILARITY_THRESHOLD, "score was {score}");
    }

    #[test]
    fn identical_descriptions_score_one() {
        let text = "build dashboards and reports for the analytics team";
        assert!((description_similarity(text, text) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn empty_description_scores_zero() {
        assert_eq!(description_similarity("", "anything at all"), 0.0);
    }

    // Two descriptions built from 20 distinct single-count tokens sharing 17
    // have cosine similarity exactly 0.85.
    fn token_description(prefix: &str, shared: usize, total: usize, pad: usize) -> String {
        (0..total)
            .map(|i| {
                let tag = if i < shared { "s" } else { prefix };
                format!("{tag}{i:0width$}", width = pad)
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn short_descriptions_need_the_stricter_threshold() {
        let a = token_description("a", 17, 20, 2);
        let b = token_description("b", 17, 20, 2);
        assert!(a.len() < SHORT_DESCRIPTION_LIMIT);
        let score = description_similarity(&a, &b);
        assert!((score - 0.85).abs() < 1e-9, "score was {score}");
        assert!(!is_duplicate_description(&a, &b, ts(8), ts(9)));
    }

    #[test]
    fn long_descriptions_accept_the_relaxed_threshold() {
        let a = token_description("a", 17, 20, 9);
        let b = token_description("b", 17, 20, 9);
        assert!(a.len() >= SHORT_DESCRIPTION_LIMIT);
        let score = description_similarity(&a, &b);
        assert!((score - 0.85).abs() < 1e-9, "score was {score}");
        assert!(is_duplicate_description(&a, &b, ts(8), ts(9)));
    }

    #[test]
    fn deadline_window_splits_at_twenty_four_hours() {
        let base = ts(0);
        assert!(within_deadline_window(base, base + Duration::hours(23)));
        assert!(!within_deadline_window(base, base + Duration::hours(25)));
    }

    #[test]
    fn no_description_verdict_requires_title_company_and_window() {
        let base = ts(0);
        assert!(is_duplicate_without_description(
            "Data Analyst",
            "Data Analyst",
            "Acme Corp",
            "Acme Corporation",
            base,
            base + Duration::hours(23),
        ));
        assert!(!is_duplicate_without_description(
            "Data Analyst",
            "Data Analyst",
            "Acme Corp",
            "Acme Corporation",
            base,
            base + Duration::hours(25),
        ));
        assert!(!is_duplicate_without_description(
            "Data Analyst",
            "Forklift Operator",
            "Acme Corp",
            "Acme Corp",
            base,
            base,
        ));
    }

    #[test]
    fn raw_field_accessors_are_defensive() {
        let record: RawRecord = serde_json::from_str(
            r#"{
                "title": "  Data Analyst ",
                "salary_min": "4,500",
                "salary_max": 6000,
                "salary_bad": "negotiable",
                "skills": "sql, python; excel",
                "tags": ["a", "", "b"]
            }"#,
        )
        .unwrap();

        assert_eq!(field_str(&record, "title"), Some("Data Analyst"));
        assert_eq!(field_str(&record, "missing"), None);
        assert_eq!(field_f64(&record, "salary_min"), Some(4500.0));
        assert_eq!(field_f64(&record, "salary_max"), Some(6000.0));
        assert_eq!(field_f64(&record, "salary_bad"), None);
        assert_eq!(field_string_list(&record, "skills"), vec!["sql", "python", "excel"]);
        assert_eq!(field_string_list(&record, "tags"), vec!["a", "b"]);
    }

    #[test]
    fn effective_deadline_defaults_to_import_time() {
        let record = StagedRecord {
            id: Uuid::new_v4(),
            raw: RawRecord::new(),
            created_at: None,
            imported_at: ts(8),
            source_url: None,
            status: RecordLifecycle::Opening,
        };
        assert_eq!(record.effective_deadline(), ts(8) + Duration::days(JOB_DEADLINE_DAYS));
    }
}
