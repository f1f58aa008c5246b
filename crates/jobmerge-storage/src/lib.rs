//! Collaborator interfaces for the migration engine: distributed dedup cache,
//! document store, and the duplicate-explanation log sink.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use sqlx::postgres::PgPool;
use sqlx::Row;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use jobmerge_core::{
    normalize_company_name, normalize_text, normalize_url, Company, Job, PassJob,
};

pub const CRATE_NAME: &str = "jobmerge-storage";

/// Cache key namespaces shared between the gate, the batch executor, and the
/// reprocessor.
pub const DEDUP_KEY_PREFIX: &str = "dedup:job:";
pub const DESCRIPTION_KEY_PREFIX: &str = "dedup:desc:";
pub const FAILED_RECORD_PREFIX: &str = "failed:record:";
pub const BATCH_KEY_PREFIX: &str = "migrate:batch:";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("duplicate key violation on {collection}")]
    DuplicateKey { collection: &'static str },
    #[error("cache backend error: {0}")]
    Cache(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, StorageError::DuplicateKey { .. })
    }
}

// ─── Distributed cache ─────────────────────────────────────────────────────

/// TTL-capable key-value cache with an atomic set-if-absent primitive and
/// hash-structured batch staging. The set-if-absent call is the only
/// cross-process synchronization point for deduplication.
#[async_trait]
pub trait DedupCache: Send + Sync {
    /// Atomically set `key` if absent. Returns true when the key was set
    /// (i.e. it did not exist before).
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, StorageError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration)
        -> Result<(), StorageError>;

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StorageError>;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StorageError>;

    async fn hash_delete(&self, key: &str, field: &str) -> Result<(), StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StorageError>;
}

enum CacheValue {
    Plain(String),
    Hash(HashMap<String, String>),
}

struct CacheEntry {
    value: CacheValue,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Process-local cache used in tests and single-node runs.
#[derive(Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn live<'a>(
        entries: &'a mut HashMap<String, CacheEntry>,
        key: &str,
    ) -> Option<&'a mut CacheEntry> {
        if entries.get(key).is_some_and(CacheEntry::is_expired) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }
}

#[async_trait]
impl DedupCache for InMemoryCache {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        let mut entries = self.entries.lock().await;
        if Self::live(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            CacheEntry {
                value: CacheValue::Plain(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut entries = self.entries.lock().await;
        Ok(Self::live(&mut entries, key).and_then(|entry| match &entry.value {
            CacheValue::Plain(value) => Some(value.clone()),
            CacheValue::Hash(_) => None,
        }))
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            CacheEntry {
                value: CacheValue::Plain(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().await;
        if entries.get(key).is_some_and(CacheEntry::is_expired) {
            entries.remove(key);
        }
        let entry = entries.entry(key.to_string()).or_insert_with(|| CacheEntry {
            value: CacheValue::Hash(HashMap::new()),
            expires_at: None,
        });
        if let CacheValue::Hash(fields) = &mut entry.value {
            fields.insert(field.to_string(), value.to_string());
        }
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StorageError> {
        let mut entries = self.entries.lock().await;
        Ok(Self::live(&mut entries, key).and_then(|entry| match &entry.value {
            CacheValue::Hash(fields) => fields.get(field).cloned(),
            CacheValue::Plain(_) => None,
        }))
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = Self::live(&mut entries, key) {
            if let CacheValue::Hash(fields) = &mut entry.value {
                fields.remove(field);
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().await;
        entries.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = Self::live(&mut entries, key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }
}

/// Redis-backed cache. Connection failures and command errors degrade to
/// cache misses: the cache is an optimization, never an authority, so it may
/// only produce false negatives.
pub struct RedisCache {
    connection: RwLock<Option<ConnectionManager>>,
}

impl RedisCache {
    /// Connect to Redis, or run disabled when the server is unreachable.
    pub async fn connect(redis_url: &str) -> Self {
        let connection = match redis::Client::open(redis_url) {
            Ok(client) => match ConnectionManager::new(client).await {
                Ok(conn) => {
                    info!("redis dedup cache connected");
                    Some(conn)
                }
                Err(e) => {
                    warn!("failed to connect to redis, cache disabled: {}", e);
                    None
                }
            },
            Err(e) => {
                warn!("invalid redis url, cache disabled: {}", e);
                None
            }
        };
        Self {
            connection: RwLock::new(connection),
        }
    }

    pub fn disabled() -> Self {
        Self {
            connection: RwLock::new(None),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.read().await.is_some()
    }
}

#[async_trait]
impl DedupCache for RedisCache {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        let mut guard = self.connection.write().await;
        let Some(conn) = guard.as_mut() else {
            return Ok(true);
        };
        match redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async::<Option<String>>(conn)
            .await
        {
            Ok(reply) => Ok(reply.is_some()),
            Err(e) => {
                warn!("redis SET NX error, treating {} as absent: {}", key, e);
                Ok(true)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut guard = self.connection.write().await;
        let Some(conn) = guard.as_mut() else {
            return Ok(None);
        };
        match conn.get::<_, Option<String>>(key).await {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!("redis GET error for {}: {}", key, e);
                Ok(None)
            }
        }
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StorageError> {
        let mut guard = self.connection.write().await;
        let Some(conn) = guard.as_mut() else {
            return Ok(());
        };
        if let Err(e) = conn.set_ex::<_, _, ()>(key, value, ttl.as_secs()).await {
            warn!("redis SETEX error for {}: {}", key, e);
        }
        Ok(())
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StorageError> {
        let mut guard = self.connection.write().await;
        let Some(conn) = guard.as_mut() else {
            return Ok(());
        };
        if let Err(e) = conn.hset::<_, _, _, ()>(key, field, value).await {
            warn!("redis HSET error for {}: {}", key, e);
        }
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StorageError> {
        let mut guard = self.connection.write().await;
        let Some(conn) = guard.as_mut() else {
            return Ok(None);
        };
        match conn.hget::<_, _, Option<String>>(key, field).await {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!("redis HGET error for {}: {}", key, e);
                Ok(None)
            }
        }
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<(), StorageError> {
        let mut guard = self.connection.write().await;
        let Some(conn) = guard.as_mut() else {
            return Ok(());
        };
        if let Err(e) = conn.hdel::<_, _, ()>(key, field).await {
            warn!("redis HDEL error for {}: {}", key, e);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut guard = self.connection.write().await;
        let Some(conn) = guard.as_mut() else {
            return Ok(());
        };
        if let Err(e) = conn.del::<_, ()>(key).await {
            warn!("redis DEL error for {}: {}", key, e);
        }
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StorageError> {
        let mut guard = self.connection.write().await;
        let Some(conn) = guard.as_mut() else {
            return Ok(());
        };
        if let Err(e) = conn.expire::<_, ()>(key, ttl.as_secs() as i64).await {
            warn!("redis EXPIRE error for {}: {}", key, e);
        }
        Ok(())
    }
}

// ─── Document store ────────────────────────────────────────────────────────

/// Document-oriented persistent store for companies, canonical jobs, and
/// quarantined jobs. Uniqueness violations surface as
/// [`StorageError::DuplicateKey`]; bulk inserts are atomic, so a conflicting
/// batch leaves no partial writes behind.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn list_companies(&self) -> Result<Vec<Company>, StorageError>;

    async fn insert_company(&self, company: &Company) -> Result<(), StorageError>;

    async fn insert_job(&self, job: &Job) -> Result<(), StorageError>;

    async fn insert_pass_job(&self, job: &PassJob) -> Result<(), StorageError>;

    async fn bulk_insert_jobs(&self, jobs: &[Job]) -> Result<(), StorageError>;

    async fn bulk_insert_pass_jobs(&self, jobs: &[PassJob]) -> Result<(), StorageError>;

    /// Description (and deadline) of an existing canonical job matching the
    /// given title and company, used as the fallback comparison text when
    /// the cache no longer holds one. Quarantined postings are excluded.
    /// Jobs with a description are preferred; a description-less match still
    /// surfaces so the caller can fall back to the title/company/window
    /// verdict.
    async fn find_job_description(
        &self,
        title: &str,
        company: &str,
    ) -> Result<Option<(String, DateTime<Utc>)>, StorageError>;

    async fn count_jobs(&self) -> Result<usize, StorageError>;
}

fn job_uniqueness_key(job: &Job) -> String {
    format!(
        "{}|{}|{}",
        normalize_text(&job.title),
        normalize_company_name(&job.company_name),
        normalize_url(&job.source_url)
    )
}

#[derive(Default)]
struct InMemoryStoreInner {
    companies: Vec<Company>,
    jobs: Vec<Job>,
    pass_jobs: Vec<PassJob>,
    job_keys: HashSet<String>,
    pass_job_keys: HashSet<String>,
}

/// Process-local document store used in tests and dry runs. Jobs are unique
/// on (normalized title, normalized company, normalized URL), mirroring the
/// unique index the Postgres store declares.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<InMemoryStoreInner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn jobs(&self) -> Vec<Job> {
        self.inner.lock().await.jobs.clone()
    }

    pub async fn pass_jobs(&self) -> Vec<PassJob> {
        self.inner.lock().await.pass_jobs.clone()
    }

    pub async fn companies(&self) -> Vec<Company> {
        self.inner.lock().await.companies.clone()
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn list_companies(&self) -> Result<Vec<Company>, StorageError> {
        Ok(self.inner.lock().await.companies.clone())
    }

    async fn insert_company(&self, company: &Company) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        if inner.companies.iter().any(|c| c.id == company.id) {
            return Err(StorageError::DuplicateKey {
                collection: "companies",
            });
        }
        inner.companies.push(company.clone());
        Ok(())
    }

    async fn insert_job(&self, job: &Job) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        let key = job_uniqueness_key(job);
        if !inner.job_keys.insert(key) {
            return Err(StorageError::DuplicateKey { collection: "jobs" });
        }
        inner.jobs.push(job.clone());
        Ok(())
    }

    async fn insert_pass_job(&self, job: &PassJob) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        let key = job_uniqueness_key(job);
        if !inner.pass_job_keys.insert(key) {
            return Err(StorageError::DuplicateKey {
                collection: "pass_jobs",
            });
        }
        inner.pass_jobs.push(job.clone());
        Ok(())
    }

    async fn bulk_insert_jobs(&self, jobs: &[Job]) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        let keys: Vec<String> = jobs.iter().map(job_uniqueness_key).collect();
        let mut seen = HashSet::new();
        for key in &keys {
            if inner.job_keys.contains(key) || !seen.insert(key.clone()) {
                return Err(StorageError::DuplicateKey { collection: "jobs" });
            }
        }
        for (job, key) in jobs.iter().zip(keys) {
            inner.job_keys.insert(key);
            inner.jobs.push(job.clone());
        }
        Ok(())
    }

    async fn bulk_insert_pass_jobs(&self, jobs: &[PassJob]) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        let keys: Vec<String> = jobs.iter().map(job_uniqueness_key).collect();
        let mut seen = HashSet::new();
        for key in &keys {
            if inner.pass_job_keys.contains(key) || !seen.insert(key.clone()) {
                return Err(StorageError::DuplicateKey {
                    collection: "pass_jobs",
                });
            }
        }
        for (job, key) in jobs.iter().zip(keys) {
            inner.pass_job_keys.insert(key);
            inner.pass_jobs.push(job.clone());
        }
        Ok(())
    }

    async fn find_job_description(
        &self,
        title: &str,
        company: &str,
    ) -> Result<Option<(String, DateTime<Utc>)>, StorageError> {
        let title_key = normalize_text(title);
        let company_key = normalize_company_name(company);
        let inner = self.inner.lock().await;
        let mut fallback = None;
        // Canonical jobs only; quarantined postings are not comparison
        // material.
        for job in inner.jobs.iter() {
            if normalize_text(&job.title) != title_key
                || normalize_company_name(&job.company_name) != company_key
            {
                continue;
            }
            if !job.description.trim().is_empty() {
                return Ok(Some((job.description.clone(), job.deadline)));
            }
            if fallback.is_none() {
                fallback = Some((job.description.clone(), job.deadline));
            }
        }
        Ok(fallback)
    }

    async fn count_jobs(&self) -> Result<usize, StorageError> {
        Ok(self.inner.lock().await.jobs.len())
    }
}

// ─── Postgres store ────────────────────────────────────────────────────────

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS companies (
    id              UUID PRIMARY KEY,
    name            TEXT NOT NULL,
    normalized_name TEXT NOT NULL,
    sector          TEXT NOT NULL,
    industry        TEXT NOT NULL,
    sub_industry    TEXT NOT NULL,
    address         TEXT NOT NULL,
    status          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS jobs (
    id           UUID PRIMARY KEY,
    business_id  TEXT NOT NULL,
    title        TEXT NOT NULL,
    title_key    TEXT NOT NULL,
    company_id   UUID NOT NULL,
    company_name TEXT NOT NULL,
    company_key  TEXT NOT NULL,
    description  TEXT NOT NULL,
    location     TEXT NOT NULL,
    salary_min   DOUBLE PRECISION,
    salary_max   DOUBLE PRECISION,
    salary_unit  TEXT,
    skills       JSONB NOT NULL,
    job_type     TEXT NOT NULL,
    source_url   TEXT NOT NULL,
    url_key      TEXT NOT NULL,
    status       TEXT NOT NULL,
    created_at   TIMESTAMPTZ NOT NULL,
    updated_at   TIMESTAMPTZ NOT NULL,
    deadline     TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS pass_jobs (LIKE jobs INCLUDING ALL);

CREATE UNIQUE INDEX IF NOT EXISTS jobs_dedup_idx
    ON jobs (title_key, company_key, url_key);
CREATE UNIQUE INDEX IF NOT EXISTS pass_jobs_dedup_idx
    ON pass_jobs (title_key, company_key, url_key);
"#;

const INSERT_JOB_SQL: &str = r#"
INSERT INTO {table}
    (id, business_id, title, title_key, company_id, company_name, company_key,
     description, location, salary_min, salary_max, salary_unit, skills,
     job_type, source_url, url_key, status, created_at, updated_at, deadline)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
     $17, $18, $19, $20)
"#;

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

/// Postgres-backed document store.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables and the dedup unique indexes when missing.
    pub async fn ensure_schema(&self) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        for statement in SCHEMA_SQL.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_job_into(
        &self,
        table: &'static str,
        job: &Job,
    ) -> Result<(), StorageError> {
        let result = bind_job(sqlx::query(&insert_sql(table)), job)
            .execute(&self.pool)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => {
                Err(StorageError::DuplicateKey { collection: table })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn bulk_insert_into(
        &self,
        table: &'static str,
        jobs: &[Job],
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        let sql = insert_sql(table);
        for job in jobs {
            if let Err(err) = bind_job(sqlx::query(&sql), job).execute(&mut *tx).await {
                tx.rollback().await?;
                if is_unique_violation(&err) {
                    return Err(StorageError::DuplicateKey { collection: table });
                }
                return Err(err.into());
            }
        }
        tx.commit().await?;
        Ok(())
    }
}

fn insert_sql(table: &str) -> String {
    INSERT_JOB_SQL.replace("{table}", table)
}

fn bind_job<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    job: &'q Job,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(job.id)
        .bind(&job.business_id)
        .bind(&job.title)
        .bind(normalize_text(&job.title))
        .bind(job.company_id)
        .bind(&job.company_name)
        .bind(normalize_company_name(&job.company_name))
        .bind(&job.description)
        .bind(&job.location)
        .bind(job.salary_min)
        .bind(job.salary_max)
        .bind(&job.salary_unit)
        .bind(serde_json::json!(job.skills))
        .bind(&job.job_type)
        .bind(&job.source_url)
        .bind(normalize_url(&job.source_url))
        .bind(&job.status)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.deadline)
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn list_companies(&self) -> Result<Vec<Company>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, normalized_name, sector, industry, sub_industry,
                   address, status
              FROM companies
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(Company {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                normalized_name: row.try_get("normalized_name")?,
                sector: row.try_get("sector")?,
                industry: row.try_get("industry")?,
                sub_industry: row.try_get("sub_industry")?,
                address: row.try_get("address")?,
                status: row.try_get("status")?,
            });
        }
        Ok(out)
    }

    async fn insert_company(&self, company: &Company) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO companies
                (id, name, normalized_name, sector, industry, sub_industry,
                 address, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(company.id)
        .bind(&company.name)
        .bind(&company.normalized_name)
        .bind(&company.sector)
        .bind(&company.industry)
        .bind(&company.sub_industry)
        .bind(&company.address)
        .bind(&company.status)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(StorageError::DuplicateKey {
                collection: "companies",
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn insert_job(&self, job: &Job) -> Result<(), StorageError> {
        self.insert_job_into("jobs", job).await
    }

    async fn insert_pass_job(&self, job: &PassJob) -> Result<(), StorageError> {
        self.insert_job_into("pass_jobs", job).await
    }

    async fn bulk_insert_jobs(&self, jobs: &[Job]) -> Result<(), StorageError> {
        self.bulk_insert_into("jobs", jobs).await
    }

    async fn bulk_insert_pass_jobs(&self, jobs: &[PassJob]) -> Result<(), StorageError> {
        self.bulk_insert_into("pass_jobs", jobs).await
    }

    async fn find_job_description(
        &self,
        title: &str,
        company: &str,
    ) -> Result<Option<(String, DateTime<Utc>)>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT description, deadline
              FROM jobs
             WHERE title_key = $1
               AND company_key = $2
             ORDER BY (description <> '') DESC
             LIMIT 1
            "#,
        )
        .bind(normalize_text(title))
        .bind(normalize_company_name(company))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let description: String = row.try_get("description")?;
                let deadline: DateTime<Utc> = row.try_get("deadline")?;
                Ok(Some((description, deadline)))
            }
            None => Ok(None),
        }
    }

    async fn count_jobs(&self) -> Result<usize, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM jobs")
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("n")?;
        Ok(count as usize)
    }
}

// ─── Duplicate log sink ────────────────────────────────────────────────────

/// Append-only text log of human-readable duplicate explanations. Lines are
/// buffered during the run and flushed once at run end.
pub struct DuplicateLogSink {
    path: Option<PathBuf>,
    lines: Mutex<Vec<String>>,
}

impl DuplicateLogSink {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            lines: Mutex::new(Vec::new()),
        }
    }

    pub async fn append(&self, line: String) {
        self.lines.lock().await.push(line);
    }

    pub async fn buffered(&self) -> usize {
        self.lines.lock().await.len()
    }

    /// Write all buffered lines, clear the buffer, and hand the lines back to
    /// the caller. A sink without a path still drains and returns its buffer.
    pub async fn flush(&self) -> anyhow::Result<Vec<String>> {
        let lines: Vec<String> = self.lines.lock().await.drain(..).collect();
        let Some(path) = &self.path else {
            return Ok(lines);
        };
        if lines.is_empty() {
            return Ok(lines);
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("opening duplicate log {}", path.display()))?;
        let mut body = lines.join("\n");
        body.push('\n');
        file.write_all(body.as_bytes())
            .await
            .with_context(|| format!("writing duplicate log {}", path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing duplicate log {}", path.display()))?;
        debug!("flushed {} duplicate log lines", lines.len());
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn sample_job(title: &str, company: &str, url: &str) -> Job {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap();
        Job {
            id: Uuid::new_v4(),
            business_id: "B-1".into(),
            title: title.into(),
            company_id: Uuid::new_v4(),
            company_name: company.into(),
            description: "desc".into(),
            location: "Remote".into(),
            salary_min: None,
            salary_max: None,
            salary_unit: None,
            skills: vec![],
            job_type: "full_time".into(),
            source_url: url.into(),
            status: "opening".into(),
            created_at: now,
            updated_at: now,
            deadline: now + chrono::Duration::days(30),
        }
    }

    #[tokio::test]
    async fn set_if_absent_rejects_second_write() {
        let cache = InMemoryCache::new();
        let ttl = Duration::from_secs(60);
        assert!(cache.set_if_absent("k", "1", ttl).await.unwrap());
        assert!(!cache.set_if_absent("k", "1", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_entries_behave_as_absent() {
        let cache = InMemoryCache::new();
        let ttl = Duration::from_millis(10);
        assert!(cache.set_if_absent("k", "1", ttl).await.unwrap());
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(cache.set_if_absent("k", "1", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn hash_staging_roundtrip_and_cleanup() {
        let cache = InMemoryCache::new();
        cache.hash_set("batch", "0", "a").await.unwrap();
        cache.hash_set("batch", "1", "b").await.unwrap();
        assert_eq!(cache.hash_get("batch", "0").await.unwrap(), Some("a".into()));

        cache.hash_delete("batch", "0").await.unwrap();
        assert_eq!(cache.hash_get("batch", "0").await.unwrap(), None);
        assert_eq!(cache.hash_get("batch", "1").await.unwrap(), Some("b".into()));

        cache.delete("batch").await.unwrap();
        assert_eq!(cache.hash_get("batch", "1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn disabled_redis_cache_always_admits() {
        let cache = RedisCache::disabled();
        let ttl = Duration::from_secs(60);
        assert!(cache.set_if_absent("k", "1", ttl).await.unwrap());
        assert!(cache.set_if_absent("k", "1", ttl).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let store = InMemoryStore::new();
        let job = sample_job("Data Analyst", "Acme Inc", "https://x/jobs/1");
        store.insert_job(&job).await.unwrap();

        let mut again = sample_job("Data  Analyst!", "acme inc", "https://x/jobs/1?utm_source=rss");
        again.id = Uuid::new_v4();
        let err = store.insert_job(&again).await.unwrap_err();
        assert!(err.is_duplicate());
        assert_eq!(store.count_jobs().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn conflicting_bulk_insert_leaves_no_partial_writes() {
        let store = InMemoryStore::new();
        store
            .insert_job(&sample_job("Data Analyst", "Acme Inc", "https://x/jobs/1"))
            .await
            .unwrap();

        let batch = vec![
            sample_job("Backend Engineer", "Globex", "https://x/jobs/2"),
            sample_job("Data Analyst", "Acme Inc", "https://x/jobs/1"),
        ];
        let err = store.bulk_insert_jobs(&batch).await.unwrap_err();
        assert!(err.is_duplicate());
        assert_eq!(store.count_jobs().await.unwrap(), 1);

        // The clean record still goes through on its own.
        store.insert_job(&batch[0]).await.unwrap();
        assert_eq!(store.count_jobs().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn description_lookup_matches_normalized_title_and_company() {
        let store = InMemoryStore::new();
        let mut job = sample_job("Data Analyst", "Acme Ltd", "https://x/jobs/1");
        job.description = "build dashboards".into();
        store.insert_job(&job).await.unwrap();

        let found = store
            .find_job_description("data  analyst", "Acme Limited")
            .await
            .unwrap();
        assert_eq!(found.map(|(d, _)| d), Some("build dashboards".to_string()));

        let missing = store
            .find_job_description("Forklift Operator", "Acme Ltd")
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn description_lookup_skips_quarantined_postings() {
        let store = InMemoryStore::new();
        let mut quarantined = sample_job("Data Analyst", "Acme Ltd", "https://x/jobs/1");
        quarantined.description = "quarantined text".into();
        store.insert_pass_job(&quarantined).await.unwrap();

        let found = store
            .find_job_description("Data Analyst", "Acme Ltd")
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn duplicate_log_flushes_once_at_run_end() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("logs").join("duplicates.log");
        let sink = DuplicateLogSink::new(Some(path.clone()));

        sink.append("first duplicate".into()).await;
        sink.append("second duplicate".into()).await;
        assert_eq!(sink.buffered().await, 2);

        let flushed = sink.flush().await.expect("flush");
        assert_eq!(flushed.len(), 2);
        assert_eq!(sink.buffered().await, 0);

        let body = std::fs::read_to_string(&path).expect("read log");
        assert_eq!(body, "first duplicate\nsecond duplicate\n");
    }

    #[tokio::test]
    async fn pathless_sink_still_returns_drained_lines() {
        let sink = DuplicateLogSink::new(None);
        sink.append("kept in memory only".into()).await;
        let flushed = sink.flush().await.expect("flush");
        assert_eq!(flushed, vec!["kept in memory only".to_string()]);
        assert_eq!(sink.buffered().await, 0);
    }
}
