use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde::Serialize;

use crate::config::Severity;
use crate::util::now_utc_string;

/// Final state of one logical engine execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failed,
    Partial,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Partial => "partial",
        }
    }
}

/// Quality-gate outcome for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Decision {
    Accepted,
    AcceptedWithWarnings,
    Rejected,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::AcceptedWithWarnings => "accepted-with-warnings",
            Self::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RunCounts {
    pub records_in: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub fixed: usize,
    pub changed: usize,
    pub inserted: usize,
    pub unchanged: usize,
    pub facts_updated: usize,
    pub facts_inserted: usize,
}

/// One quality finding as the ledger stores it. Immutable once written.
#[derive(Debug, Clone, Serialize)]
pub struct FindingRow {
    pub indicator: String,
    pub severity: Severity,
    pub measured: Option<f64>,
    pub threshold: Option<f64>,
    pub blocking: bool,
    pub passed: bool,
    pub detail: String,
}

/// One applied remediation as the ledger stores it. Immutable once written.
#[derive(Debug, Clone, Serialize)]
pub struct RemediationRow {
    pub entity_type: String,
    pub natural_key: String,
    pub attribute: String,
    pub old_value: Option<String>,
    pub new_value: String,
    pub strategy: String,
    pub confidence: String,
}

pub fn open_run(
    conn: &Connection,
    entity_type: &str,
    batch_date: NaiveDate,
    batch_sha256: Option<&str>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO runs(entity_type, batch_date, batch_sha256, started_at, status)
         VALUES(?1, ?2, ?3, ?4, 'in-progress')",
        params![
            entity_type,
            batch_date.to_string(),
            batch_sha256,
            now_utc_string()
        ],
    )
    .context("failed to open run record")?;
    Ok(conn.last_insert_rowid())
}

pub fn finish_run(
    conn: &Connection,
    run_id: i64,
    status: RunStatus,
    decision: Option<Decision>,
    counts: &RunCounts,
    detail: Option<&str>,
) -> Result<()> {
    let started_at: Option<String> = conn
        .query_row(
            "SELECT started_at FROM runs WHERE run_id = ?1",
            [run_id],
            |row| row.get(0),
        )
        .optional()
        .context("failed to read run start time")?;

    let finished_at = now_utc_string();
    let duration_seconds = started_at
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|start| (Utc::now() - start.with_timezone(&Utc)).num_milliseconds() as f64 / 1000.0);

    conn.execute(
        "UPDATE runs SET
           finished_at = ?1,
           status = ?2,
           decision = ?3,
           records_in = ?4,
           accepted = ?5,
           rejected = ?6,
           fixed = ?7,
           changed = ?8,
           inserted = ?9,
           unchanged = ?10,
           facts_updated = ?11,
           facts_inserted = ?12,
           duration_seconds = ?13,
           detail = ?14
         WHERE run_id = ?15",
        params![
            finished_at,
            status.as_str(),
            decision.map(Decision::as_str),
            counts.records_in as i64,
            counts.accepted as i64,
            counts.rejected as i64,
            counts.fixed as i64,
            counts.changed as i64,
            counts.inserted as i64,
            counts.unchanged as i64,
            counts.facts_updated as i64,
            counts.facts_inserted as i64,
            duration_seconds,
            detail,
            run_id
        ],
    )
    .context("failed to finish run record")?;
    Ok(())
}

pub fn insert_finding(tx: &Transaction, run_id: i64, finding: &FindingRow) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO quality_findings
           (run_id, indicator, severity, measured, threshold, blocking, passed, detail, recorded_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            run_id,
            finding.indicator,
            finding.severity.as_str(),
            finding.measured,
            finding.threshold,
            finding.blocking as i64,
            finding.passed as i64,
            finding.detail,
            now_utc_string()
        ],
    )?;
    Ok(())
}

pub fn insert_remediation(
    tx: &Transaction,
    run_id: i64,
    remediation: &RemediationRow,
) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO remediations
           (run_id, entity_type, natural_key, attribute, old_value, new_value,
            strategy, confidence, recorded_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            run_id,
            remediation.entity_type,
            remediation.natural_key,
            remediation.attribute,
            remediation.old_value,
            remediation.new_value,
            remediation.strategy,
            remediation.confidence,
            now_utc_string()
        ],
    )?;
    Ok(())
}

/// Merge-integrity breaches are flagged here rather than corrected in place.
pub fn flag_integrity_violation(
    conn: &mut Connection,
    run_id: i64,
    entity_type: &str,
    natural_key: &str,
    detail: &str,
) -> Result<()> {
    let tx = conn.transaction()?;
    insert_finding(
        &tx,
        run_id,
        &FindingRow {
            indicator: "merge_integrity".to_string(),
            severity: Severity::Critical,
            measured: None,
            threshold: None,
            blocking: false,
            passed: false,
            detail: format!("{entity_type}/{natural_key}: {detail}"),
        },
    )?;
    tx.commit()?;
    Ok(())
}

/// Storage errors that outlast the retry budget are recorded here; the key
/// is skipped and the rest of the batch proceeds.
pub fn flag_storage_failure(
    conn: &mut Connection,
    run_id: i64,
    entity_type: &str,
    natural_key: &str,
    detail: &str,
) -> Result<()> {
    let tx = conn.transaction()?;
    insert_finding(
        &tx,
        run_id,
        &FindingRow {
            indicator: "storage".to_string(),
            severity: Severity::High,
            measured: None,
            threshold: None,
            blocking: false,
            passed: false,
            detail: format!("{entity_type}/{natural_key}: {detail}"),
        },
    )?;
    tx.commit()?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: i64,
    pub entity_type: String,
    pub batch_date: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: String,
    pub decision: Option<String>,
    pub records_in: i64,
    pub accepted: i64,
    pub rejected: i64,
    pub fixed: i64,
    pub changed: i64,
    pub inserted: i64,
    pub unchanged: i64,
    pub facts_updated: i64,
    pub facts_inserted: i64,
    pub duration_seconds: Option<f64>,
    pub detail: Option<String>,
}

pub fn recent_runs(conn: &Connection, limit: usize) -> Result<Vec<RunSummary>> {
    let mut statement = conn.prepare(
        "SELECT run_id, entity_type, batch_date, started_at, finished_at, status, decision,
                records_in, accepted, rejected, fixed, changed, inserted, unchanged,
                facts_updated, facts_inserted, duration_seconds, detail
         FROM runs
         ORDER BY run_id DESC
         LIMIT ?1",
    )?;

    let rows = statement.query_map([limit as i64], |row| {
        Ok(RunSummary {
            run_id: row.get(0)?,
            entity_type: row.get(1)?,
            batch_date: row.get(2)?,
            started_at: row.get(3)?,
            finished_at: row.get(4)?,
            status: row.get(5)?,
            decision: row.get(6)?,
            records_in: row.get(7)?,
            accepted: row.get(8)?,
            rejected: row.get(9)?,
            fixed: row.get(10)?,
            changed: row.get(11)?,
            inserted: row.get(12)?,
            unchanged: row.get(13)?,
            facts_updated: row.get(14)?,
            facts_inserted: row.get(15)?,
            duration_seconds: row.get(16)?,
            detail: row.get(17)?,
        })
    })?;

    let mut summaries = Vec::new();
    for row in rows {
        summaries.push(row?);
    }
    Ok(summaries)
}

#[derive(Debug, Clone, Serialize)]
pub struct FindingSummary {
    pub finding_id: i64,
    pub run_id: i64,
    pub indicator: String,
    pub severity: String,
    pub measured: Option<f64>,
    pub threshold: Option<f64>,
    pub blocking: bool,
    pub passed: bool,
    pub detail: String,
    pub recorded_at: String,
}

pub fn findings_for_run(conn: &Connection, run_id: i64) -> Result<Vec<FindingSummary>> {
    let mut statement = conn.prepare(
        "SELECT finding_id, run_id, indicator, severity, measured, threshold,
                blocking, passed, detail, recorded_at
         FROM quality_findings
         WHERE run_id = ?1
         ORDER BY finding_id ASC",
    )?;

    let rows = statement.query_map([run_id], |row| {
        Ok(FindingSummary {
            finding_id: row.get(0)?,
            run_id: row.get(1)?,
            indicator: row.get(2)?,
            severity: row.get(3)?,
            measured: row.get(4)?,
            threshold: row.get(5)?,
            blocking: row.get::<_, i64>(6)? != 0,
            passed: row.get::<_, i64>(7)? != 0,
            detail: row.get(8)?,
            recorded_at: row.get(9)?,
        })
    })?;

    let mut findings = Vec::new();
    for row in rows {
        findings.push(row?);
    }
    Ok(findings)
}

#[derive(Debug, Clone, Serialize)]
pub struct RemediationSummary {
    pub remediation_id: i64,
    pub run_id: i64,
    pub entity_type: String,
    pub natural_key: String,
    pub attribute: String,
    pub old_value: Option<String>,
    pub new_value: String,
    pub strategy: String,
    pub confidence: String,
    pub recorded_at: String,
}

pub fn remediations_for_run(conn: &Connection, run_id: i64) -> Result<Vec<RemediationSummary>> {
    let mut statement = conn.prepare(
        "SELECT remediation_id, run_id, entity_type, natural_key, attribute,
                old_value, new_value, strategy, confidence, recorded_at
         FROM remediations
         WHERE run_id = ?1
         ORDER BY remediation_id ASC",
    )?;

    let rows = statement.query_map([run_id], |row| {
        Ok(RemediationSummary {
            remediation_id: row.get(0)?,
            run_id: row.get(1)?,
            entity_type: row.get(2)?,
            natural_key: row.get(3)?,
            attribute: row.get(4)?,
            old_value: row.get(5)?,
            new_value: row.get(6)?,
            strategy: row.get(7)?,
            confidence: row.get(8)?,
            recorded_at: row.get(9)?,
        })
    })?;

    let mut remediations = Vec::new();
    for row in rows {
        remediations.push(row?);
    }
    Ok(remediations)
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::store::Store;

    fn batch_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).expect("valid date")
    }

    #[test]
    fn run_lifecycle_records_status_decision_and_counts() {
        let store = Store::open_in_memory().expect("store opens");
        let run_id = open_run(&store.conn, "customers", batch_date(), Some("abc123"))
            .expect("run opens");

        let counts = RunCounts {
            records_in: 10,
            inserted: 4,
            changed: 2,
            unchanged: 4,
            ..RunCounts::default()
        };
        finish_run(
            &store.conn,
            run_id,
            RunStatus::Success,
            Some(Decision::Accepted),
            &counts,
            None,
        )
        .expect("run finishes");

        let runs = recent_runs(&store.conn, 5).expect("runs query");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, "success");
        assert_eq!(runs[0].decision.as_deref(), Some("accepted"));
        assert_eq!(runs[0].inserted, 4);
        assert!(runs[0].finished_at.is_some());
        assert!(runs[0].duration_seconds.is_some());
    }

    #[test]
    fn findings_and_remediations_are_appended_and_queryable() {
        let mut store = Store::open_in_memory().expect("store opens");
        let run_id =
            open_run(&store.conn, "customers", batch_date(), None).expect("run opens");

        let tx = store.conn.transaction().expect("tx opens");
        insert_finding(
            &tx,
            run_id,
            &FindingRow {
                indicator: "null_natural_key".to_string(),
                severity: Severity::Critical,
                measured: Some(3.0),
                threshold: Some(0.0),
                blocking: true,
                passed: false,
                detail: "3 records with null natural key".to_string(),
            },
        )
        .expect("finding inserts");
        insert_remediation(
            &tx,
            run_id,
            &RemediationRow {
                entity_type: "customers".to_string(),
                natural_key: "ALFKI".to_string(),
                attribute: "region".to_string(),
                old_value: None,
                new_value: "Western Europe".to_string(),
                strategy: "direct mapping".to_string(),
                confidence: "exact".to_string(),
            },
        )
        .expect("remediation inserts");
        tx.commit().expect("tx commits");

        let findings = findings_for_run(&store.conn, run_id).expect("findings query");
        assert_eq!(findings.len(), 1);
        assert!(findings[0].blocking);
        assert!(!findings[0].passed);

        let remediations = remediations_for_run(&store.conn, run_id).expect("remediations query");
        assert_eq!(remediations.len(), 1);
        assert_eq!(remediations[0].strategy, "direct mapping");
    }
}
