//! Orchestrates one quality-gated run: gate, remediate, merge, reconcile,
//! finalize. Every run leaves a ledger trail even when the batch is
//! rejected outright.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{EntityConfig, ReferenceData};
use crate::facts;
use crate::ledger::{self, Decision, RunCounts, RunStatus};
use crate::merge;
use crate::quality;
use crate::record::Record;
use crate::remedy;
use crate::store::Store;
use crate::util::sha256_hex;


#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: i64,
    pub status: RunStatus,
    pub decision: Decision,
    pub counts: RunCounts,
}

/// Processes one batch end to end. Dimension records are remediated in
/// place before the merge; fact records are reconciled afterwards against
/// the post-merge current versions.
pub fn run(
    store: &mut Store,
    config: &EntityConfig,
    reference: &ReferenceData,
    batch_date: NaiveDate,
    mut batch: Vec<Record>,
    fact_batch: Vec<Record>,
) -> Result<RunResult> {
    let payload = serde_json::to_vec(&batch).context("failed to serialize batch for hashing")?;
    let batch_sha256 = sha256_hex(&payload);

    let run_id = ledger::open_run(
        &store.conn,
        &config.entity_type,
        batch_date,
        Some(&batch_sha256),
    )?;
    info!(
        run_id,
        entity_type = %config.entity_type,
        batch_date = %batch_date,
        records = batch.len(),
        "run opened"
    );

    let mut counts = RunCounts {
        records_in: batch.len(),
        ..RunCounts::default()
    };

    let report = quality::evaluate(&mut store.conn, run_id, config, &batch)?;
    if report.decision == Decision::Rejected {
        warn!(run_id, "batch rejected by quality gate, no merge writes");
        counts.rejected = batch.len();
        ledger::finish_run(
            &store.conn,
            run_id,
            RunStatus::Success,
            Some(Decision::Rejected),
            &counts,
            Some("batch rejected by quality gate"),
        )?;
        return Ok(RunResult {
            run_id,
            status: RunStatus::Success,
            decision: Decision::Rejected,
            counts,
        });
    }

    counts.accepted = batch.len();

    let chain = remedy::remediate(&mut store.conn, run_id, config, reference, &mut batch)?;
    counts.fixed = chain.fixed;

    let merged = merge::merge_batch(&mut store.conn, run_id, config, batch_date, &batch)?;
    counts.inserted = merged.inserted;
    counts.changed = merged.changed;
    counts.unchanged = merged.unchanged;

    let mut facts_failed = 0;
    if let Some(fact_config) = &config.facts {
        if !fact_batch.is_empty() {
            let reconciled = facts::reconcile(&mut store.conn, run_id, fact_config, &fact_batch)?;
            counts.facts_updated = reconciled.updated;
            counts.facts_inserted = reconciled.inserted;
            facts_failed = reconciled.failed;
        }
    } else if !fact_batch.is_empty() {
        warn!(
            run_id,
            facts = fact_batch.len(),
            "fact records supplied but entity config has no fact policy, ignoring"
        );
    }

    let status = if merged.violations > 0 || merged.failed > 0 || facts_failed > 0 {
        RunStatus::Partial
    } else {
        RunStatus::Success
    };
    let detail = (status == RunStatus::Partial).then(|| {
        format!(
            "{} integrity violations, {} failed keys, {} failed facts",
            merged.violations, merged.failed, facts_failed
        )
    });

    ledger::finish_run(
        &store.conn,
        run_id,
        status,
        Some(report.decision),
        &counts,
        detail.as_deref(),
    )?;
    info!(
        run_id,
        status = status.as_str(),
        decision = report.decision.as_str(),
        inserted = counts.inserted,
        changed = counts.changed,
        unchanged = counts.unchanged,
        fixed = counts.fixed,
        "run finished"
    );

    Ok(RunResult {
        run_id,
        status,
        decision: report.decision,
        counts,
    })
}
