use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::create_timestamp;
use crate::task::{CheckStatus, Mode};

const DATABASE_NAME: &str = "webjudge.sqlite3";

pub fn get_db_path() -> anyhow::Result<PathBuf> {
    use directories::ProjectDirs;

    let proj_dirs = ProjectDirs::from("", "", "webjudge")
        .ok_or_else(|| anyhow::anyhow!("Unable to find user directory"))?;
    let data_dir = proj_dirs.data_local_dir();

    fs::create_dir_all(data_dir)?;

    Ok(data_dir.join(DATABASE_NAME))
}

pub async fn init_db(db_path: impl AsRef<Path>) -> sqlx::Result<SqlitePool> {
    let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display()); // rwc = read/write/create
    let db_pool = SqlitePoolOptions::new()
        .max_connections(4)
        .min_connections(0)
        .connect(&db_url)
        .await?;

    // PRAGMA statements cannot run inside a transaction
    for pragma_sql in &[
        "PRAGMA busy_timeout = 2000;",
        "PRAGMA journal_mode = WAL;",
        "PRAGMA synchronous = NORMAL;",
    ] {
        sqlx::query(pragma_sql).execute(&db_pool).await?;
    }

    let mut tx = db_pool.begin().await?;

    for sql in &[
        r"
        CREATE TABLE IF NOT EXISTS queue_jobs (
            id               INTEGER  PRIMARY KEY AUTOINCREMENT,
            judge_record_id  INTEGER  NOT NULL,
            payload          TEXT     NOT NULL,
            state            TEXT     NOT NULL,
            attempts         INTEGER  NOT NULL DEFAULT 0,
            queued_at        TEXT     NOT NULL,
            updated_at       TEXT     NOT NULL
        );",
        "CREATE INDEX IF NOT EXISTS idx_queue_jobs_state ON queue_jobs(state, id);",
        r"
        CREATE TABLE IF NOT EXISTS judge_records (
            judge_record_id  INTEGER  PRIMARY KEY,
            problem_id       INTEGER  NOT NULL,
            user_id          INTEGER  NOT NULL,
            mode             TEXT     NOT NULL,
            state            TEXT     NOT NULL,
            passed           INTEGER  NOT NULL,
            total_score      REAL     NOT NULL,
            max_score        REAL     NOT NULL,
            judge_time       INTEGER  NOT NULL,
            results          TEXT     NOT NULL,
            first_screen     TEXT,
            message          TEXT     NOT NULL DEFAULT '',
            created_time     TEXT     NOT NULL,
            updated_time     TEXT     NOT NULL
        );",
        r"
        CREATE TABLE IF NOT EXISTS problem_stats (
            problem_id  INTEGER  NOT NULL,
            mode        TEXT     NOT NULL,
            passed      INTEGER  NOT NULL DEFAULT 0,
            failed      INTEGER  NOT NULL DEFAULT 0,
            PRIMARY KEY (problem_id, mode)
        );",
        r"
        CREATE TABLE IF NOT EXISTS problem_references (
            problem_id  INTEGER  NOT NULL,
            name        TEXT     NOT NULL,
            locator     TEXT     NOT NULL,
            PRIMARY KEY (problem_id, name)
        );",
    ] {
        sqlx::query(sql).execute(tx.as_mut()).await?;
    }

    tx.commit().await?;

    log::info!("Initialized database at {}", db_path.as_ref().display());

    Ok(db_pool)
}

pub fn remove_db(db_path: impl AsRef<Path>) {
    // WAL and SHM files might not exist
    let wal_path = format!("{}-wal", db_path.as_ref().display());
    let shm_path = format!("{}-shm", db_path.as_ref().display());
    let _ = fs::remove_file(wal_path);
    let _ = fs::remove_file(shm_path);

    if let Err(e) = std::fs::remove_file(&db_path) {
        log::warn!(
            "Unable to remove database at {}: {e}",
            db_path.as_ref().display()
        );
    } else {
        log::info!("Removed database at {}", db_path.as_ref().display());
    }
}

/// One checkpoint as stored, with artifacts replaced by their URLs
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCheckPoint {
    pub name: String,
    pub score: f64,
    pub total_score: f64,
    pub status: CheckStatus,
    pub details: String,
    pub cache_files: HashMap<String, String>,
}

/// Final state of a judge record
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeRecord {
    pub judge_record_id: i64,
    pub problem_id: i64,
    pub user_id: i64,
    pub mode: Mode,
    pub passed: bool,
    pub total_score: f64,
    pub max_score: f64,
    pub judge_time: u64,
    pub results: Vec<StoredCheckPoint>,
    pub first_screen: Option<String>,
    /// Empty for completed records, the failure reason otherwise
    pub message: String,
}

impl JudgeRecord {
    /// A record for a run that produced no result
    pub fn failed(
        judge_record_id: i64,
        problem_id: i64,
        user_id: i64,
        mode: Mode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            judge_record_id,
            problem_id,
            user_id,
            mode,
            passed: false,
            total_score: 0.0,
            max_score: 0.0,
            judge_time: 0,
            results: Vec::new(),
            first_screen: None,
            message: message.into(),
        }
    }

    fn state(&self) -> &'static str {
        if self.message.is_empty() {
            "completed"
        } else {
            "failed"
        }
    }
}

fn mode_name(mode: Mode) -> &'static str {
    match mode {
        Mode::Audit => "audit",
        Mode::Judge => "judge",
    }
}

/// Writes `record`, replacing an earlier write for the same id.
///
/// Pass/fail counters only move the first time a record id is seen, so a
/// redelivered job does not count twice. Returns whether this was that first time.
pub async fn save_record(record: &JudgeRecord, pool: &SqlitePool) -> anyhow::Result<bool> {
    let now = create_timestamp();
    let results = serde_json::to_string(&record.results)?;
    let mode = mode_name(record.mode);

    let mut tx = pool.begin().await?;

    let existing = sqlx::query("SELECT 1 FROM judge_records WHERE judge_record_id = ?")
        .bind(record.judge_record_id)
        .fetch_optional(tx.as_mut())
        .await?;
    let first = existing.is_none();

    sqlx::query(
        r"
        INSERT INTO judge_records (judge_record_id, problem_id, user_id, mode, state, passed,
            total_score, max_score, judge_time, results, first_screen, message, created_time, updated_time)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(judge_record_id) DO UPDATE SET
            state = excluded.state,
            passed = excluded.passed,
            total_score = excluded.total_score,
            max_score = excluded.max_score,
            judge_time = excluded.judge_time,
            results = excluded.results,
            first_screen = excluded.first_screen,
            message = excluded.message,
            updated_time = excluded.updated_time
        ",
    )
    .bind(record.judge_record_id)
    .bind(record.problem_id)
    .bind(record.user_id)
    .bind(mode)
    .bind(record.state())
    .bind(record.passed)
    .bind(record.total_score)
    .bind(record.max_score)
    .bind(i64::try_from(record.judge_time).unwrap_or(i64::MAX))
    .bind(results)
    .bind(&record.first_screen)
    .bind(&record.message)
    .bind(&now)
    .bind(&now)
    .execute(tx.as_mut())
    .await?;

    if first {
        let (passed, failed) = if record.passed { (1, 0) } else { (0, 1) };
        sqlx::query(
            r"
            INSERT INTO problem_stats (problem_id, mode, passed, failed) VALUES (?, ?, ?, ?)
            ON CONFLICT(problem_id, mode) DO UPDATE SET
                passed = passed + excluded.passed,
                failed = failed + excluded.failed
            ",
        )
        .bind(record.problem_id)
        .bind(mode)
        .bind(passed)
        .bind(failed)
        .execute(tx.as_mut())
        .await?;
    }

    tx.commit().await?;
    Ok(first)
}

/// `(passed, failed)` counters of a problem in `mode`
pub async fn fetch_stats(problem_id: i64, mode: Mode, pool: &SqlitePool) -> sqlx::Result<(i64, i64)> {
    let row = sqlx::query("SELECT passed, failed FROM problem_stats WHERE problem_id = ? AND mode = ?")
        .bind(problem_id)
        .bind(mode_name(mode))
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => Ok((row.try_get("passed")?, row.try_get("failed")?)),
        None => Ok((0, 0)),
    }
}

pub async fn fetch_record_state(
    judge_record_id: i64,
    pool: &SqlitePool,
) -> sqlx::Result<Option<(String, bool)>> {
    let row = sqlx::query("SELECT state, passed FROM judge_records WHERE judge_record_id = ?")
        .bind(judge_record_id)
        .fetch_optional(pool)
        .await?;

    row.map(|row| Ok((row.try_get("state")?, row.try_get("passed")?)))
        .transpose()
}

/// Reference locators recorded by the last passing audit of a problem
pub async fn fetch_references(
    problem_id: i64,
    pool: &SqlitePool,
) -> sqlx::Result<HashMap<String, String>> {
    let rows = sqlx::query("SELECT name, locator FROM problem_references WHERE problem_id = ?")
        .bind(problem_id)
        .fetch_all(pool)
        .await?;

    rows.into_iter()
        .map(|row| Ok((row.try_get("name")?, row.try_get("locator")?)))
        .collect()
}

/// Replaces every reference of a problem
pub async fn replace_references(
    problem_id: i64,
    references: &HashMap<String, String>,
    pool: &SqlitePool,
) -> sqlx::Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM problem_references WHERE problem_id = ?")
        .bind(problem_id)
        .execute(tx.as_mut())
        .await?;

    for (name, locator) in references {
        sqlx::query("INSERT INTO problem_references (problem_id, name, locator) VALUES (?, ?, ?)")
            .bind(problem_id)
            .bind(name)
            .bind(locator)
            .execute(tx.as_mut())
            .await?;
    }

    tx.commit().await
}

/// Where judge outcomes and problem references live
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Idempotent per record id; returns whether the record was new
    async fn save(&self, record: &JudgeRecord) -> anyhow::Result<bool>;

    async fn references(&self, problem_id: i64) -> anyhow::Result<HashMap<String, String>>;

    async fn replace_references(
        &self,
        problem_id: i64,
        references: &HashMap<String, String>,
    ) -> anyhow::Result<()>;
}

pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn save(&self, record: &JudgeRecord) -> anyhow::Result<bool> {
        save_record(record, &self.pool).await
    }

    async fn references(&self, problem_id: i64) -> anyhow::Result<HashMap<String, String>> {
        Ok(fetch_references(problem_id, &self.pool).await?)
    }

    async fn replace_references(
        &self,
        problem_id: i64,
        references: &HashMap<String, String>,
    ) -> anyhow::Result<()> {
        Ok(replace_references(problem_id, references, &self.pool).await?)
    }
}
