use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, ErrorCode, Transaction};
use tracing::warn;

pub const DB_SCHEMA_VERSION: &str = "0.1.0";

/// Bounded retry for transient storage failures (lock contention, busy
/// database). Wraps a transactional closure; exhaustion surfaces the last
/// error instead of looping forever.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }
}

fn is_transient(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::DatabaseBusy
                || failure.code == ErrorCode::DatabaseLocked
    )
}

/// Runs `body` inside a transaction, committing on Ok and rolling back on
/// Err. Transient failures are retried with exponential backoff up to the
/// policy's attempt limit; a rolled-back attempt is never partially visible.
pub fn with_transaction<T>(
    connection: &mut Connection,
    policy: &RetryPolicy,
    mut body: impl FnMut(&Transaction) -> rusqlite::Result<T>,
) -> rusqlite::Result<T> {
    let mut attempt = 0;
    loop {
        let result = connection.transaction().and_then(|tx| {
            let value = body(&tx)?;
            tx.commit()?;
            Ok(value)
        });

        match result {
            Ok(value) => return Ok(value),
            Err(error) if is_transient(&error) && attempt + 1 < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "transient storage failure, retrying");
                thread::sleep(delay);
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

pub struct Store {
    pub conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        configure_connection(&conn)?;
        ensure_schema(&conn)?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory store")?;
        ensure_schema(&conn)?;
        Ok(Self { conn })
    }
}

fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    Ok(())
}

pub fn ensure_schema(connection: &Connection) -> Result<()> {
    connection.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS dim_versions (
          surrogate_key INTEGER PRIMARY KEY AUTOINCREMENT,
          entity_type TEXT NOT NULL,
          natural_key TEXT NOT NULL,
          attributes TEXT NOT NULL,
          valid_from TEXT NOT NULL,
          valid_to TEXT,
          is_current INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS fact_rows (
          fact_id INTEGER PRIMARY KEY AUTOINCREMENT,
          fact_set TEXT NOT NULL,
          event_key TEXT NOT NULL,
          dim_keys TEXT NOT NULL,
          measures TEXT NOT NULL,
          recorded_at TEXT NOT NULL,
          UNIQUE(fact_set, event_key)
        );

        CREATE TABLE IF NOT EXISTS runs (
          run_id INTEGER PRIMARY KEY AUTOINCREMENT,
          entity_type TEXT NOT NULL,
          batch_date TEXT NOT NULL,
          batch_sha256 TEXT,
          started_at TEXT NOT NULL,
          finished_at TEXT,
          status TEXT NOT NULL,
          decision TEXT,
          records_in INTEGER NOT NULL DEFAULT 0,
          accepted INTEGER NOT NULL DEFAULT 0,
          rejected INTEGER NOT NULL DEFAULT 0,
          fixed INTEGER NOT NULL DEFAULT 0,
          changed INTEGER NOT NULL DEFAULT 0,
          inserted INTEGER NOT NULL DEFAULT 0,
          unchanged INTEGER NOT NULL DEFAULT 0,
          facts_updated INTEGER NOT NULL DEFAULT 0,
          facts_inserted INTEGER NOT NULL DEFAULT 0,
          duration_seconds REAL,
          detail TEXT
        );

        CREATE TABLE IF NOT EXISTS quality_findings (
          finding_id INTEGER PRIMARY KEY AUTOINCREMENT,
          run_id INTEGER NOT NULL,
          indicator TEXT NOT NULL,
          severity TEXT NOT NULL,
          measured REAL,
          threshold REAL,
          blocking INTEGER NOT NULL,
          passed INTEGER NOT NULL,
          detail TEXT NOT NULL,
          recorded_at TEXT NOT NULL,
          FOREIGN KEY (run_id) REFERENCES runs(run_id)
        );

        CREATE TABLE IF NOT EXISTS remediations (
          remediation_id INTEGER PRIMARY KEY AUTOINCREMENT,
          run_id INTEGER NOT NULL,
          entity_type TEXT NOT NULL,
          natural_key TEXT NOT NULL,
          attribute TEXT NOT NULL,
          old_value TEXT,
          new_value TEXT NOT NULL,
          strategy TEXT NOT NULL,
          confidence TEXT NOT NULL,
          recorded_at TEXT NOT NULL,
          FOREIGN KEY (run_id) REFERENCES runs(run_id)
        );

        CREATE INDEX IF NOT EXISTS idx_dim_versions_key
          ON dim_versions(entity_type, natural_key, is_current);
        CREATE INDEX IF NOT EXISTS idx_dim_versions_validity
          ON dim_versions(entity_type, natural_key, valid_from);
        CREATE INDEX IF NOT EXISTS idx_fact_rows_event ON fact_rows(fact_set, event_key);
        CREATE INDEX IF NOT EXISTS idx_findings_run ON quality_findings(run_id);
        CREATE INDEX IF NOT EXISTS idx_remediations_run ON remediations(run_id);
        CREATE INDEX IF NOT EXISTS idx_runs_entity ON runs(entity_type, started_at);
        ",
    )?;

    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [DB_SCHEMA_VERSION],
    )?;

    Ok(())
}
