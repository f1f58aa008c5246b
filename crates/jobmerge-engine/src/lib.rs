//! Migration & deduplication pipeline: dedup cache gate, company resolver,
//! job/passjob router, batch executor, and reprocessor.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use jobmerge_core::{
    build_dedup_key, company_similarity, description_similarity, description_threshold,
    field_f64, field_str, field_string_list, is_duplicate_without_description,
    within_deadline_window, Company, Job, MigrationStatus, RawRecord, RecordMigrationDetail,
    RunSummary, StagedRecord, COMPANY_SIMILARITY_THRESHOLD, DEDUP_TTL_SECS, JOB_DEADLINE_DAYS,
    UNRESOLVED_COMPANY_ID,
};
use jobmerge_ingest::{parse_payload, stage_record, stage_records};
use jobmerge_storage::{
    DedupCache, DocumentStore, DuplicateLogSink, StorageError, BATCH_KEY_PREFIX,
    DEDUP_KEY_PREFIX, DESCRIPTION_KEY_PREFIX, FAILED_RECORD_PREFIX,
};

pub const CRATE_NAME: &str = "jobmerge-engine";

pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Staged batch entries expire on their own if a crash skips the cleanup.
const STAGING_TTL_SECS: u64 = 60 * 60;

// ─── Configuration ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Records per batch.
    pub batch_size: usize,
    /// Batches processed concurrently.
    pub max_concurrent_batches: usize,
    /// TTL for dedup cache entries.
    pub dedup_ttl: Duration,
    /// Destination for human-readable duplicate explanations.
    pub duplicate_log_path: Option<PathBuf>,
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .max(4)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_concurrent_batches: default_worker_count(),
            dedup_ttl: Duration::from_secs(DEDUP_TTL_SECS),
            duplicate_log_path: None,
        }
    }
}

impl EngineConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOBMERGE_BATCH_SIZE` | `1000` | Records per batch |
    /// | `JOBMERGE_MAX_CONCURRENT_BATCHES` | `max(4, cores)` | Concurrent batches |
    /// | `JOBMERGE_DUPLICATE_LOG` | unset | Duplicate explanation log path |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            batch_size: std::env::var("JOBMERGE_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(defaults.batch_size)
                .max(1),
            max_concurrent_batches: std::env::var("JOBMERGE_MAX_CONCURRENT_BATCHES")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(defaults.max_concurrent_batches)
                .max(1),
            dedup_ttl: defaults.dedup_ttl,
            duplicate_log_path: std::env::var("JOBMERGE_DUPLICATE_LOG")
                .ok()
                .map(PathBuf::from),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_duplicate_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.duplicate_log_path = Some(path.into());
        self
    }
}

// ─── Classifier collaborators ──────────────────────────────────────────────

/// External employment-type classifier seam. The keyword default stands in
/// for the remote service in tests and offline runs.
pub trait EmploymentClassifier: Send + Sync {
    fn classify(&self, title: &str, description: &str, raw_hint: Option<&str>) -> String;
}

#[derive(Default)]
pub struct KeywordEmploymentClassifier;

impl EmploymentClassifier for KeywordEmploymentClassifier {
    fn classify(&self, title: &str, description: &str, raw_hint: Option<&str>) -> String {
        let hint = raw_hint.unwrap_or_default().to_lowercase();
        let combined = format!("{} {} {}", hint, title.to_lowercase(), description.to_lowercase());

        if combined.contains("intern") {
            "internship".to_string()
        } else if combined.contains("part time") || combined.contains("part-time") {
            "part_time".to_string()
        } else if combined.contains("contract") || combined.contains("temporary") {
            "contract".to_string()
        } else {
            "full_time".to_string()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndustryLabel {
    pub sector: String,
    pub industry: String,
    pub sub_industry: String,
}

impl IndustryLabel {
    pub fn unknown() -> Self {
        Self {
            sector: "unknown".to_string(),
            industry: "unknown".to_string(),
            sub_industry: "unknown".to_string(),
        }
    }
}

/// External industry classifier seam.
pub trait IndustryClassifier: Send + Sync {
    fn classify(&self, company_name: &str) -> IndustryLabel;
}

struct IndustryRule {
    contains_any: &'static [&'static str],
    sector: &'static str,
    industry: &'static str,
    sub_industry: &'static str,
}

const INDUSTRY_RULES: &[IndustryRule] = &[
    IndustryRule {
        contains_any: &["software", "tech", "digital", "data", "cloud"],
        sector: "Information Technology",
        industry: "Software & Services",
        sub_industry: "Application Software",
    },
    IndustryRule {
        contains_any: &["bank", "capital", "finance", "insurance", "invest"],
        sector: "Financials",
        industry: "Financial Services",
        sub_industry: "Diversified Financials",
    },
    IndustryRule {
        contains_any: &["hospital", "clinic", "pharma", "health", "medical"],
        sector: "Health Care",
        industry: "Health Care Providers",
        sub_industry: "Health Care Facilities",
    },
    IndustryRule {
        contains_any: &["school", "college", "university", "academy", "education"],
        sector: "Education",
        industry: "Education Services",
        sub_industry: "Training & Education",
    },
];

#[derive(Default)]
pub struct KeywordIndustryClassifier;

impl IndustryClassifier for KeywordIndustryClassifier {
    fn classify(&self, company_name: &str) -> IndustryLabel {
        let name = company_name.to_lowercase();
        for rule in INDUSTRY_RULES {
            if rule.contains_any.iter().any(|needle| name.contains(needle)) {
                return IndustryLabel {
                    sector: rule.sector.to_string(),
                    industry: rule.industry.to_string(),
                    sub_industry: rule.sub_industry.to_string(),
                };
            }
        }
        IndustryLabel::unknown()
    }
}

// ─── Company resolver ──────────────────────────────────────────────────────

/// Per-run company cache: seeded once from the store, read-heavy afterwards.
/// Creation happens while holding the map lock so two concurrent batches
/// cannot create two companies for the same new name.
pub struct CompanyResolver {
    store: Arc<dyn DocumentStore>,
    industry: Arc<dyn IndustryClassifier>,
    cache: Mutex<HashMap<String, Uuid>>,
}

impl CompanyResolver {
    pub async fn seed(
        store: Arc<dyn DocumentStore>,
        industry: Arc<dyn IndustryClassifier>,
        hints: &HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        let mut cache = HashMap::new();
        for company in store.list_companies().await? {
            cache.insert(company.normalized_name.clone(), company.id);
        }
        for (name, id) in hints {
            match Uuid::parse_str(id) {
                Ok(id) => {
                    cache.insert(jobmerge_core::normalize_company_name(name), id);
                }
                Err(_) => warn!("ignoring company hint {} with unparsable id {}", name, id),
            }
        }
        debug!("company cache seeded with {} names", cache.len());
        Ok(Self {
            store,
            industry,
            cache: Mutex::new(cache),
        })
    }

    /// Resolve a display name to a company id: exact normalized lookup, then
    /// a linear fuzzy scan, then creation. Returns None only when the name
    /// carries no resolvable signal or the store refuses the new company.
    pub async fn resolve(&self, display_name: &str) -> Option<Uuid> {
        // Names with no alphanumeric content (punctuation-only placeholders)
        // carry no resolvable signal.
        if jobmerge_core::normalize_text(display_name).is_empty() {
            return None;
        }
        let normalized = jobmerge_core::normalize_company_name(display_name);

        let mut cache = self.cache.lock().await;
        if let Some(id) = cache.get(&normalized) {
            return Some(*id);
        }

        let mut best: Option<(f64, Uuid)> = None;
        for (candidate, id) in cache.iter() {
            let score = company_similarity(candidate, &normalized);
            if score >= COMPANY_SIMILARITY_THRESHOLD
                && best.map_or(true, |(top, _)| score > top)
            {
                best = Some((score, *id));
            }
        }
        if let Some((score, id)) = best {
            debug!(
                "merging company alias {:?} into existing company {} (similarity {:.3})",
                display_name, id, score
            );
            cache.insert(normalized, id);
            return Some(id);
        }

        let label = self.industry.classify(display_name);
        let company = Company {
            id: Uuid::new_v4(),
            name: display_name.trim().to_string(),
            normalized_name: normalized.clone(),
            sector: label.sector,
            industry: label.industry,
            sub_industry: label.sub_industry,
            address: "unknown".to_string(),
            status: "active".to_string(),
        };
        match self.store.insert_company(&company).await {
            Ok(()) => {
                info!("created company {:?} ({})", company.name, company.id);
                cache.insert(normalized, company.id);
                Some(company.id)
            }
            Err(e) => {
                warn!("failed to create company {:?}, quarantining posting: {}", display_name, e);
                None
            }
        }
    }

    pub async fn cached_names(&self) -> usize {
        self.cache.lock().await.len()
    }
}

// ─── Dedup cache gate ──────────────────────────────────────────────────────

enum GateOutcome {
    Admitted,
    Duplicate { reason: String },
}

struct DedupGate {
    cache: Arc<dyn DedupCache>,
    store: Arc<dyn DocumentStore>,
    ttl: Duration,
}

impl DedupGate {
    /// Atomic set-if-absent against the dedup key, then, only when the key
    /// already existed and a description is available, a similarity check
    /// against the cached or stored comparison text. The gate only ever
    /// produces false negatives: with nothing to compare it admits.
    async fn try_admit(
        &self,
        dedup_key: &str,
        title: &str,
        company: &str,
        description: &str,
        deadline: DateTime<Utc>,
    ) -> GateOutcome {
        let cache_key = format!("{DEDUP_KEY_PREFIX}{dedup_key}");
        let fresh = match self.cache.set_if_absent(&cache_key, "1", self.ttl).await {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!("dedup cache unavailable, admitting record: {}", e);
                true
            }
        };

        let description = description.trim();
        let desc_key = format!("{DESCRIPTION_KEY_PREFIX}{dedup_key}");

        if description.is_empty() {
            if fresh {
                return GateOutcome::Admitted;
            }
            return GateOutcome::Duplicate {
                reason: "dedup key already seen within the 30-day window \
                         (no description to compare)"
                    .to_string(),
            };
        }

        if !fresh {
            let cached = self.cache.get(&desc_key).await.unwrap_or_default();
            let verdict = match cached {
                // An identical composite key implies the same crawl window,
                // so the cached-text comparison uses equal deadlines.
                Some(prior) => duplicate_description_reason(description, &prior, deadline, deadline),
                None => match self.store.find_job_description(title, company).await {
                    Ok(Some((prior, prior_deadline))) if !prior.trim().is_empty() => {
                        duplicate_description_reason(description, &prior, deadline, prior_deadline)
                    }
                    Ok(Some((_, prior_deadline))) => {
                        // Matching posting exists but carries no text; fall
                        // back to the title/company/window verdict.
                        is_duplicate_without_description(
                            title,
                            title,
                            company,
                            company,
                            deadline,
                            prior_deadline,
                        )
                        .then(|| {
                            "matching title/company posting within the same crawl window"
                                .to_string()
                        })
                    }
                    Ok(None) => None,
                    Err(e) => {
                        warn!("description lookup failed, admitting record: {}", e);
                        None
                    }
                },
            };
            if let Some(reason) = verdict {
                return GateOutcome::Duplicate { reason };
            }
        }

        // Admission caches the description (refreshing the TTL) so later
        // lookups stay cheap.
        if let Err(e) = self.cache.set_with_ttl(&desc_key, description, self.ttl).await {
            warn!("failed to cache description for {}: {}", dedup_key, e);
        }
        GateOutcome::Admitted
    }
}

fn duplicate_description_reason(
    new_description: &str,
    prior_description: &str,
    deadline: DateTime<Utc>,
    prior_deadline: DateTime<Utc>,
) -> Option<String> {
    let score = description_similarity(new_description, prior_description);
    let threshold = description_threshold(new_description.len().min(prior_description.len()));
    if score >= threshold && within_deadline_window(deadline, prior_deadline) {
        Some(format!(
            "description similarity {score:.3} >= {threshold} within the same crawl window"
        ))
    } else {
        None
    }
}

// ─── Reports ───────────────────────────────────────────────────────────────

/// Entry-point view of one migration run.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub summary: String,
    pub jobs_migrated: usize,
    pub pass_jobs_migrated: usize,
    pub duplicates_found: usize,
    /// Human-readable duplicate explanations, also written to the log sink.
    pub details: Vec<String>,
    pub record_details: Vec<RecordMigrationDetail>,
    pub run: RunSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReprocessReport {
    pub message: String,
    pub reprocessed_count: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub details: Vec<RecordMigrationDetail>,
}

#[derive(Default)]
struct BatchOutcome {
    jobs: usize,
    pass_jobs: usize,
    duplicates: usize,
    invalid: usize,
    failed: usize,
    details: Vec<RecordMigrationDetail>,
}

impl BatchOutcome {
    fn tally(details: Vec<RecordMigrationDetail>) -> Self {
        let mut outcome = Self {
            details,
            ..Self::default()
        };
        for detail in &outcome.details {
            match detail.status {
                MigrationStatus::MigratedJob => outcome.jobs += 1,
                MigrationStatus::MigratedPassjob => outcome.pass_jobs += 1,
                MigrationStatus::DedupRedis | MigrationStatus::DedupDb => outcome.duplicates += 1,
                MigrationStatus::Invalid => outcome.invalid += 1,
                MigrationStatus::Error => outcome.failed += 1,
            }
        }
        outcome
    }
}

// ─── Engine ────────────────────────────────────────────────────────────────

/// Per-call state shared by the batches of one run. Nothing here outlives
/// the call, so concurrent runs never share mutable maps.
struct RunContext {
    run_id: Uuid,
    resolver: CompanyResolver,
    sink: DuplicateLogSink,
}

struct EngineInner {
    cache: Arc<dyn DedupCache>,
    store: Arc<dyn DocumentStore>,
    gate: DedupGate,
    employment: Arc<dyn EmploymentClassifier>,
    industry: Arc<dyn IndustryClassifier>,
    config: EngineConfig,
}

/// The migration & deduplication engine. Cheap to clone; all state behind
/// the clone is shared.
#[derive(Clone)]
pub struct MigrationEngine {
    inner: Arc<EngineInner>,
}

enum Evaluated {
    Terminal(RecordMigrationDetail),
    Pending { job: Job, quarantined: bool },
}

impl MigrationEngine {
    pub fn new(
        cache: Arc<dyn DedupCache>,
        store: Arc<dyn DocumentStore>,
        config: EngineConfig,
    ) -> Self {
        Self::with_classifiers(
            cache,
            store,
            config,
            Arc::new(KeywordEmploymentClassifier),
            Arc::new(KeywordIndustryClassifier),
        )
    }

    pub fn with_classifiers(
        cache: Arc<dyn DedupCache>,
        store: Arc<dyn DocumentStore>,
        config: EngineConfig,
        employment: Arc<dyn EmploymentClassifier>,
        industry: Arc<dyn IndustryClassifier>,
    ) -> Self {
        let gate = DedupGate {
            cache: cache.clone(),
            store: store.clone(),
            ttl: config.dedup_ttl,
        };
        Self {
            inner: Arc::new(EngineInner {
                cache,
                store,
                gate,
                employment,
                industry,
                config,
            }),
        }
    }

    /// Migrate a raw crawler payload in fixed-size batches. Every input
    /// record yields exactly one audit entry; the report aggregates batch
    /// outcomes in submission order so output is deterministic for a given
    /// input even under concurrent execution.
    pub async fn migrate_from_json_in_batches(
        &self,
        payload: &str,
        company_hints: &HashMap<String, String>,
        batch_size: Option<usize>,
    ) -> Result<MigrationReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let staged = stage_records(parse_payload(payload));
        let total = staged.len();
        let batch_size = batch_size.unwrap_or(self.inner.config.batch_size).max(1);
        info!(
            run_id = %run_id,
            records = total,
            batch_size = batch_size,
            "starting migration run"
        );

        let ctx = self.run_context(run_id, company_hints).await?;
        let outcomes = self.run_batches(ctx.clone(), staged, batch_size).await;
        let summary = aggregate(run_id, started_at, total, outcomes);
        let duplicate_lines = ctx
            .sink
            .flush()
            .await
            .context("flushing duplicate explanation log")?;

        info!(
            run_id = %run_id,
            jobs = summary.jobs_migrated,
            pass_jobs = summary.pass_jobs_migrated,
            duplicates = summary.duplicates_found,
            invalid = summary.invalid_records,
            errors = summary.failed_records,
            "migration run finished"
        );
        Ok(report_from(summary, duplicate_lines))
    }

    /// Replay previously failed/invalid records through the same pipeline.
    /// Raw payloads are recovered from the failed-record cache namespace;
    /// when the cache has forgotten one, a minimal record is rebuilt from the
    /// audit fields (lossy: the description is unrecoverable).
    pub async fn reprocess_failed_records(
        &self,
        failed: &[RecordMigrationDetail],
        company_hints: &HashMap<String, String>,
    ) -> Result<ReprocessReport> {
        let run_id = Uuid::new_v4();
        let mut seen = HashSet::new();
        let unique: Vec<&RecordMigrationDetail> = failed
            .iter()
            .filter(|detail| seen.insert(detail.record_id))
            .collect();
        info!(
            run_id = %run_id,
            submitted = failed.len(),
            unique = unique.len(),
            "reprocessing failed records"
        );

        let mut staged = Vec::with_capacity(unique.len());
        for detail in &unique {
            let key = format!("{FAILED_RECORD_PREFIX}{}", detail.record_id);
            let recovered: Option<RawRecord> = match self.inner.cache.get(&key).await {
                Ok(Some(json)) => serde_json::from_str(&json)
                    .map_err(|e| warn!("cached payload for {} is corrupt: {}", detail.record_id, e))
                    .ok(),
                Ok(None) => None,
                Err(e) => {
                    warn!("failed-record lookup error for {}: {}", detail.record_id, e);
                    None
                }
            };
            let raw = recovered.unwrap_or_else(|| reconstruct_raw(detail));
            let mut record = stage_record(raw);
            record.id = detail.record_id;
            staged.push(record);
        }

        let reprocessed_count = staged.len();
        let ctx = self.run_context(run_id, company_hints).await?;
        let outcome = self.process_batch(ctx.clone(), 0, staged).await;
        ctx.sink
            .flush()
            .await
            .context("flushing duplicate explanation log")?;

        let success_count = outcome.jobs + outcome.pass_jobs;
        let failed_count = reprocessed_count - success_count;
        Ok(ReprocessReport {
            message: format!(
                "reprocessed {reprocessed_count} records: {success_count} migrated, \
                 {failed_count} not migrated"
            ),
            reprocessed_count,
            success_count,
            failed_count,
            details: outcome.details,
        })
    }

    async fn run_context(
        &self,
        run_id: Uuid,
        company_hints: &HashMap<String, String>,
    ) -> Result<Arc<RunContext>> {
        let resolver = CompanyResolver::seed(
            self.inner.store.clone(),
            self.inner.industry.clone(),
            company_hints,
        )
        .await
        .context("seeding company cache")?;
        Ok(Arc::new(RunContext {
            run_id,
            resolver,
            sink: DuplicateLogSink::new(self.inner.config.duplicate_log_path.clone()),
        }))
    }

    async fn run_batches(
        &self,
        ctx: Arc<RunContext>,
        staged: Vec<StagedRecord>,
        batch_size: usize,
    ) -> Vec<BatchOutcome> {
        let mut batches = Vec::new();
        let mut current = Vec::with_capacity(batch_size);
        for record in staged {
            current.push(record);
            if current.len() == batch_size {
                batches.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            batches.push(current);
        }

        let semaphore = Arc::new(Semaphore::new(
            self.inner.config.max_concurrent_batches.max(1),
        ));
        let mut handles = Vec::with_capacity(batches.len());
        for (index, batch) in batches.into_iter().enumerate() {
            let engine = self.clone();
            let ctx = ctx.clone();
            let semaphore = semaphore.clone();
            let span = info_span!("batch", run_id = %ctx.run_id, batch = index);
            handles.push(tokio::spawn(
                async move {
                    // acquire_owned only fails on a closed semaphore, which
                    // this run never does; run unthrottled rather than drop
                    // the batch.
                    let _permit = semaphore.acquire_owned().await.ok();
                    engine.process_batch(ctx, index, batch).await
                }
                .instrument(span),
            ));
        }

        // Await in submission order so the aggregated trail is deterministic.
        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    error!("batch task panicked: {}", e);
                    outcomes.push(BatchOutcome::default());
                }
            }
        }
        outcomes
    }

    /// Process one batch: stage it in the cache, run every record through
    /// the gate/resolver/router, persist admitted records, and always tear
    /// the staging namespace down. A failing batch contributes zero
    /// successes but still emits a terminal audit entry per record.
    async fn process_batch(
        &self,
        ctx: Arc<RunContext>,
        batch_index: usize,
        records: Vec<StagedRecord>,
    ) -> BatchOutcome {
        let batch_key = format!("{BATCH_KEY_PREFIX}{}", Uuid::new_v4().simple());
        debug!(
            batch = batch_index,
            records = records.len(),
            staging_key = %batch_key,
            "processing batch"
        );

        let result = self.process_staged_batch(&ctx, &batch_key, &records).await;

        // Cleanup happens regardless of outcome.
        if let Err(e) = self.inner.cache.delete(&batch_key).await {
            warn!("failed to delete staging namespace {}: {}", batch_key, e);
        }

        match result {
            Ok(details) => BatchOutcome::tally(details),
            Err(e) => {
                error!(
                    "batch failed, recording {} records as errors: {:#}",
                    records.len(),
                    e
                );
                let mut details = Vec::with_capacity(records.len());
                for record in &records {
                    self.cache_failed_payload(record).await;
                    details.push(detail_for(
                        record,
                        MigrationStatus::Error,
                        format!("batch processing failed: {e}"),
                    ));
                }
                BatchOutcome::tally(details)
            }
        }
    }

    async fn process_staged_batch(
        &self,
        ctx: &RunContext,
        batch_key: &str,
        records: &[StagedRecord],
    ) -> Result<Vec<RecordMigrationDetail>> {
        for (index, record) in records.iter().enumerate() {
            let serialized =
                serde_json::to_string(record).context("serializing staged record")?;
            self.inner
                .cache
                .hash_set(batch_key, &index.to_string(), &serialized)
                .await
                .context("staging batch record")?;
        }
        self.inner
            .cache
            .expire(batch_key, Duration::from_secs(STAGING_TTL_SECS))
            .await
            .context("bounding staging namespace lifetime")?;

        let mut details: Vec<Option<RecordMigrationDetail>> = vec![None; records.len()];
        let mut pending_jobs: Vec<(usize, Job)> = Vec::new();
        let mut pending_pass_jobs: Vec<(usize, Job)> = Vec::new();

        for (index, record) in records.iter().enumerate() {
            match self.evaluate_record(ctx, record).await {
                Evaluated::Terminal(detail) => {
                    // Rejected records leave staging immediately to bound
                    // the namespace size.
                    if let Err(e) = self
                        .inner
                        .cache
                        .hash_delete(batch_key, &index.to_string())
                        .await
                    {
                        warn!("failed to evict staged record {}: {}", index, e);
                    }
                    if matches!(
                        detail.status,
                        MigrationStatus::Invalid | MigrationStatus::Error
                    ) {
                        self.cache_failed_payload(record).await;
                    }
                    details[index] = Some(detail);
                }
                Evaluated::Pending { job, quarantined } => {
                    if quarantined {
                        pending_pass_jobs.push((index, job));
                    } else {
                        pending_jobs.push((index, job));
                    }
                }
            }
        }

        self.persist_group(ctx, records, pending_jobs, false, &mut details)
            .await;
        self.persist_group(ctx, records, pending_pass_jobs, true, &mut details)
            .await;

        Ok(details
            .into_iter()
            .enumerate()
            .map(|(index, detail)| {
                detail.unwrap_or_else(|| {
                    // Unreachable by construction; keep the trail complete
                    // rather than dropping a record.
                    detail_for(
                        &records[index],
                        MigrationStatus::Error,
                        "record produced no outcome".to_string(),
                    )
                })
            })
            .collect())
    }

    async fn evaluate_record(&self, ctx: &RunContext, record: &StagedRecord) -> Evaluated {
        let title = field_str(&record.raw, "title");
        let company = field_str(&record.raw, "company");
        let (Some(title), Some(company)) = (title, company) else {
            return Evaluated::Terminal(detail_for(
                record,
                MigrationStatus::Invalid,
                "missing required field: title or company".to_string(),
            ));
        };

        let description = field_str(&record.raw, "job_description").unwrap_or("");
        let url = record.source_url.as_deref().unwrap_or("");
        let dedup_key = build_dedup_key(title, company, record.created_at, url);

        match self
            .inner
            .gate
            .try_admit(&dedup_key, title, company, description, record.effective_deadline())
            .await
        {
            GateOutcome::Duplicate { reason } => {
                ctx.sink
                    .append(format!(
                        "{} | {} @ {} | {} | {}",
                        Utc::now().to_rfc3339(),
                        title,
                        company,
                        url,
                        reason
                    ))
                    .await;
                Evaluated::Terminal(detail_for(record, MigrationStatus::DedupRedis, reason))
            }
            GateOutcome::Admitted => {
                let resolved = ctx.resolver.resolve(company).await;
                let quarantined = resolved.is_none();
                let job = self.build_job(record, resolved);
                Evaluated::Pending { job, quarantined }
            }
        }
    }

    /// Construct a Job (or PassJob when `company_id` is absent). Missing
    /// optional fields get explicit defaults; nothing here fails a record.
    fn build_job(&self, record: &StagedRecord, company_id: Option<Uuid>) -> Job {
        let raw = &record.raw;
        let title = field_str(raw, "title").unwrap_or("Unknown Title").to_string();
        let company_name = field_str(raw, "company")
            .unwrap_or("Unknown Company")
            .to_string();
        let description = field_str(raw, "job_description")
            .unwrap_or("No description")
            .to_string();
        let location = field_str(raw, "location").unwrap_or("Unknown").to_string();
        let raw_type = field_str(raw, "job_type");
        let job_type = self.inner.employment.classify(&title, &description, raw_type);
        let business_id = field_str(raw, "job_id")
            .map(str::to_string)
            .unwrap_or_else(|| format!("JM-{}", record.id.simple()));
        let created_at = record.created_at.unwrap_or(record.imported_at);

        Job {
            id: Uuid::new_v4(),
            business_id,
            title,
            company_id: company_id.unwrap_or(UNRESOLVED_COMPANY_ID),
            company_name,
            description,
            location,
            salary_min: field_f64(raw, "salary_min"),
            salary_max: field_f64(raw, "salary_max"),
            salary_unit: field_str(raw, "currency").map(str::to_string),
            skills: field_string_list(raw, "skills"),
            job_type,
            source_url: record.source_url.clone().unwrap_or_default(),
            status: "opening".to_string(),
            created_at,
            updated_at: Utc::now(),
            deadline: created_at + chrono::Duration::days(JOB_DEADLINE_DAYS),
        }
    }

    /// Bulk-write a group of admitted records; on a uniqueness violation
    /// fall back to inserting one at a time so only the genuinely
    /// conflicting records become `dedup_db`.
    async fn persist_group(
        &self,
        ctx: &RunContext,
        records: &[StagedRecord],
        group: Vec<(usize, Job)>,
        quarantined: bool,
        details: &mut [Option<RecordMigrationDetail>],
    ) {
        if group.is_empty() {
            return;
        }

        let success_status = if quarantined {
            MigrationStatus::MigratedPassjob
        } else {
            MigrationStatus::MigratedJob
        };
        let success_message = if quarantined {
            "migrated to quarantine (company unresolved)"
        } else {
            "migrated to canonical job store"
        };

        let jobs: Vec<Job> = group.iter().map(|(_, job)| job.clone()).collect();
        let bulk = if quarantined {
            self.inner.store.bulk_insert_pass_jobs(&jobs).await
        } else {
            self.inner.store.bulk_insert_jobs(&jobs).await
        };

        match bulk {
            Ok(()) => {
                for (index, _) in group {
                    details[index] = Some(detail_for(
                        &records[index],
                        success_status,
                        success_message.to_string(),
                    ));
                }
            }
            Err(e) if e.is_duplicate() => {
                debug!("bulk insert conflicted, falling back to per-record inserts");
                for (index, job) in group {
                    let single = if quarantined {
                        self.inner.store.insert_pass_job(&job).await
                    } else {
                        self.inner.store.insert_job(&job).await
                    };
                    match single {
                        Ok(()) => {
                            details[index] = Some(detail_for(
                                &records[index],
                                success_status,
                                success_message.to_string(),
                            ));
                        }
                        Err(e) if e.is_duplicate() => {
                            ctx.sink
                                .append(format!(
                                    "{} | {} @ {} | {} | store uniqueness violation on write",
                                    Utc::now().to_rfc3339(),
                                    job.title,
                                    job.company_name,
                                    job.source_url
                                ))
                                .await;
                            details[index] = Some(detail_for(
                                &records[index],
                                MigrationStatus::DedupDb,
                                "store rejected write as a uniqueness violation".to_string(),
                            ));
                        }
                        Err(e) => {
                            self.cache_failed_payload(&records[index]).await;
                            details[index] = Some(detail_for(
                                &records[index],
                                MigrationStatus::Error,
                                format!("store write failed: {e}"),
                            ));
                        }
                    }
                }
            }
            Err(e) => {
                warn!("bulk insert failed outright: {}", e);
                for (index, _) in group {
                    self.cache_failed_payload(&records[index]).await;
                    details[index] = Some(detail_for(
                        &records[index],
                        MigrationStatus::Error,
                        format!("store write failed: {e}"),
                    ));
                }
            }
        }
    }

    /// Keep the raw payload of a failed record around so the reprocessor can
    /// recover it with full fidelity.
    async fn cache_failed_payload(&self, record: &StagedRecord) {
        let json = match serde_json::to_string(&record.raw) {
            Ok(json) => json,
            Err(e) => {
                warn!("failed to serialize payload for {}: {}", record.id, e);
                return;
            }
        };
        let key = format!("{FAILED_RECORD_PREFIX}{}", record.id);
        if let Err(e) = self
            .inner
            .cache
            .set_with_ttl(&key, &json, self.inner.config.dedup_ttl)
            .await
        {
            warn!("failed to cache payload for {}: {}", record.id, e);
        }
    }
}

fn detail_for(record: &StagedRecord, status: MigrationStatus, message: String) -> RecordMigrationDetail {
    RecordMigrationDetail {
        record_id: record.id,
        title: field_str(&record.raw, "title").unwrap_or_default().to_string(),
        company: field_str(&record.raw, "company").unwrap_or_default().to_string(),
        url: record.source_url.clone().unwrap_or_default(),
        status,
        message,
    }
}

/// Minimal raw record rebuilt from an audit entry. Lossy: description and
/// the other optional fields are unrecoverable.
fn reconstruct_raw(detail: &RecordMigrationDetail) -> RawRecord {
    let mut raw = RawRecord::new();
    if !detail.title.is_empty() {
        raw.insert("title".to_string(), detail.title.clone().into());
    }
    if !detail.company.is_empty() {
        raw.insert("company".to_string(), detail.company.clone().into());
    }
    if !detail.url.is_empty() {
        raw.insert("job_url".to_string(), detail.url.clone().into());
    }
    raw
}

fn aggregate(
    run_id: Uuid,
    started_at: DateTime<Utc>,
    total_records: usize,
    outcomes: Vec<BatchOutcome>,
) -> RunSummary {
    let mut summary = RunSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        total_records,
        jobs_migrated: 0,
        pass_jobs_migrated: 0,
        duplicates_found: 0,
        invalid_records: 0,
        failed_records: 0,
        record_details: Vec::with_capacity(total_records),
    };
    for outcome in outcomes {
        summary.jobs_migrated += outcome.jobs;
        summary.pass_jobs_migrated += outcome.pass_jobs;
        summary.duplicates_found += outcome.duplicates;
        summary.invalid_records += outcome.invalid;
        summary.failed_records += outcome.failed;
        summary.record_details.extend(outcome.details);
    }
    summary
}

fn report_from(run: RunSummary, details: Vec<String>) -> MigrationReport {
    MigrationReport {
        summary: format!(
            "migrated {} jobs and {} pass jobs; {} duplicates, {} invalid, {} errors \
             out of {} records",
            run.jobs_migrated,
            run.pass_jobs_migrated,
            run.duplicates_found,
            run.invalid_records,
            run.failed_records,
            run.total_records
        ),
        jobs_migrated: run.jobs_migrated,
        pass_jobs_migrated: run.pass_jobs_migrated,
        duplicates_found: run.duplicates_found,
        details,
        record_details: run.record_details.clone(),
        run,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn employment_hint_takes_priority() {
        let classifier = KeywordEmploymentClassifier;
        assert_eq!(classifier.classify("Engineer", "", Some("Contract role")), "contract");
        assert_eq!(classifier.classify("Summer Intern", "", None), "internship");
        assert_eq!(
            classifier.classify("Cashier", "part-time weekend shifts", None),
            "part_time"
        );
        assert_eq!(classifier.classify("Engineer", "on-site role", None), "full_time");
    }

    #[test]
    fn industry_rules_match_on_company_name() {
        let classifier = KeywordIndustryClassifier;
        assert_eq!(
            classifier.classify("Northwind Software GmbH").sector,
            "Information Technology"
        );
        assert_eq!(classifier.classify("First National Bank").sector, "Financials");
        assert_eq!(classifier.classify("Totally Opaque Holdings"), IndustryLabel::unknown());
    }

    #[test]
    fn config_defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert!(config.max_concurrent_batches >= 4);
        assert_eq!(config.dedup_ttl, Duration::from_secs(DEDUP_TTL_SECS));
        assert!(config.duplicate_log_path.is_none());
    }

    #[test]
    fn reconstructed_record_carries_only_audit_fields() {
        let detail = RecordMigrationDetail {
            record_id: Uuid::new_v4(),
            title: "Data Analyst".into(),
            company: "Acme Inc".into(),
            url: "https://x/jobs/1".into(),
            status: MigrationStatus::Error,
            message: "boom".into(),
        };
        let raw = reconstruct_raw(&detail);
        assert_eq!(field_str(&raw, "title"), Some("Data Analyst"));
        assert_eq!(field_str(&raw, "company"), Some("Acme Inc"));
        assert_eq!(field_str(&raw, "job_url"), Some("https://x/jobs/1"));
        assert!(!raw.contains_key("job_description"));
    }

    #[test]
    fn batch_tally_counts_every_status_once() {
        let mk = |status: MigrationStatus| RecordMigrationDetail {
            record_id: Uuid::new_v4(),
            title: String::new(),
            company: String::new(),
            url: String::new(),
            status,
            message: String::new(),
        };
        let outcome = BatchOutcome::tally(vec![
            mk(MigrationStatus::MigratedJob),
            mk(MigrationStatus::MigratedPassjob),
            mk(MigrationStatus::DedupRedis),
            mk(MigrationStatus::DedupDb),
            mk(MigrationStatus::Invalid),
            mk(MigrationStatus::Error),
        ]);
        assert_eq!(outcome.jobs, 1);
        assert_eq!(outcome.pass_jobs, 1);
        assert_eq!(outcome.duplicates, 2);
        assert_eq!(outcome.invalid, 1);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.details.len(), 6);
    }
}
