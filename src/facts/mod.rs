//! Fact reconciliation: incoming fact records are keyed by a business event
//! and re-pointed at the currently-active dimension surrogate keys. A seen
//! event is updated in place; an unseen one is inserted. Facts never
//! duplicate on re-runs.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use tracing::{debug, warn};

use crate::config::{DerivedTotal, FactConfig, Severity};
use crate::ledger::{FindingRow, insert_finding};
use crate::merge::{current_surrogate_key, violation_detail, violation_error};
use crate::record::{Record, value_f64, value_text};
use crate::store::{RetryPolicy, with_transaction};
use crate::util::now_utc_string;


#[derive(Debug, Default, Clone, Copy)]
pub struct FactCounts {
    pub updated: usize,
    pub inserted: usize,
    pub failed: usize,
}

enum FactOutcome {
    Updated,
    Inserted,
}

/// Writes each fact in its own transaction; surrogate keys are resolved
/// inside that same transaction so a concurrent dimension change can never
/// leave a fact pointing at an expired version. A fact with an unresolvable
/// reference is recorded and skipped; the rest of the batch proceeds.
pub fn reconcile(
    conn: &mut Connection,
    run_id: i64,
    config: &FactConfig,
    facts: &[Record],
) -> Result<FactCounts> {
    let policy = RetryPolicy::default();
    let mut counts = FactCounts::default();

    for record in facts {
        let Some(event_key) = record.natural_key(&config.event_key_attribute) else {
            record_failure(
                conn,
                run_id,
                config,
                "<missing event key>",
                "fact_reference",
                "fact record has no event key",
            )?;
            counts.failed += 1;
            continue;
        };

        let result = with_transaction(conn, &policy, |tx| {
            reconcile_event(tx, config, &event_key, record)
        });

        match result {
            Ok(FactOutcome::Updated) => counts.updated += 1,
            Ok(FactOutcome::Inserted) => counts.inserted += 1,
            Err(error) => match violation_detail(&error) {
                Some(detail) => {
                    warn!(
                        fact_set = %config.fact_set,
                        event_key = %event_key,
                        detail = %detail,
                        "fact skipped"
                    );
                    record_failure(conn, run_id, config, &event_key, "fact_reference", &detail)?;
                    counts.failed += 1;
                }
                None => {
                    warn!(
                        fact_set = %config.fact_set,
                        event_key = %event_key,
                        error = %error,
                        "fact transaction failed, event skipped"
                    );
                    record_failure(conn, run_id, config, &event_key, "storage", &error.to_string())?;
                    counts.failed += 1;
                }
            },
        }
    }

    Ok(counts)
}

fn reconcile_event(
    tx: &Transaction,
    config: &FactConfig,
    event_key: &str,
    record: &Record,
) -> rusqlite::Result<FactOutcome> {
    let mut dim_keys = BTreeMap::new();
    for (entity_type, attribute) in &config.dimension_refs {
        let natural_key = record
            .get(attribute)
            .and_then(value_text)
            .ok_or_else(|| {
                violation_error(format!("fact is missing dimension reference {attribute}"))
            })?;
        let surrogate_key = current_surrogate_key(tx, entity_type, &natural_key)?.ok_or_else(
            || {
                violation_error(format!(
                    "no current {entity_type} version for natural key {natural_key}"
                ))
            },
        )?;
        dim_keys.insert(entity_type.clone(), surrogate_key);
    }

    let measures = collect_measures(config, record)?;

    let serialized_keys = serde_json::to_string(&dim_keys)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    let serialized_measures = serde_json::to_string(&measures)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

    let existing: Option<i64> = tx
        .query_row(
            "SELECT fact_id FROM fact_rows WHERE fact_set = ?1 AND event_key = ?2",
            params![config.fact_set, event_key],
            |row| row.get(0),
        )
        .optional()?;

    match existing {
        Some(fact_id) => {
            tx.execute(
                "UPDATE fact_rows SET dim_keys = ?1, measures = ?2, recorded_at = ?3
                 WHERE fact_id = ?4",
                params![serialized_keys, serialized_measures, now_utc_string(), fact_id],
            )?;
            debug!(fact_set = %config.fact_set, event_key = %event_key, "fact updated");
            Ok(FactOutcome::Updated)
        }
        None => {
            tx.execute(
                "INSERT INTO fact_rows(fact_set, event_key, dim_keys, measures, recorded_at)
                 VALUES(?1, ?2, ?3, ?4, ?5)",
                params![
                    config.fact_set,
                    event_key,
                    serialized_keys,
                    serialized_measures,
                    now_utc_string()
                ],
            )?;
            Ok(FactOutcome::Inserted)
        }
    }
}

fn collect_measures(
    config: &FactConfig,
    record: &Record,
) -> rusqlite::Result<BTreeMap<String, f64>> {
    let mut measures = BTreeMap::new();
    for name in &config.measures {
        let value = record
            .get(name)
            .and_then(value_f64)
            .ok_or_else(|| violation_error(format!("fact measure {name} is not numeric")))?;
        measures.insert(name.clone(), value);
    }
    if let Some(derived) = &config.derived_total {
        let total = derive_total(derived, &measures)?;
        measures.insert(derived.name.clone(), total);
    }
    Ok(measures)
}

/// Line total recomputed at write time rather than trusted from the source.
fn derive_total(rule: &DerivedTotal, measures: &BTreeMap<String, f64>) -> rusqlite::Result<f64> {
    let price = *measures.get(&rule.price_measure).ok_or_else(|| {
        violation_error(format!("derived total needs measure {}", rule.price_measure))
    })?;
    let quantity = *measures.get(&rule.quantity_measure).ok_or_else(|| {
        violation_error(format!("derived total needs measure {}", rule.quantity_measure))
    })?;
    let discount = measures.get(&rule.discount_measure).copied().unwrap_or(0.0);
    Ok(round2(price * quantity * (1.0 - discount)))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn record_failure(
    conn: &mut Connection,
    run_id: i64,
    config: &FactConfig,
    event_key: &str,
    indicator: &str,
    detail: &str,
) -> Result<()> {
    let tx = conn.transaction()?;
    insert_finding(
        &tx,
        run_id,
        &FindingRow {
            indicator: indicator.to_string(),
            severity: Severity::High,
            measured: Some(1.0),
            threshold: Some(0.0),
            blocking: false,
            passed: false,
            detail: format!("{}/{event_key}: {detail}", config.fact_set),
        },
    )?;
    tx.commit()?;
    Ok(())
}

/// One stored fact row, for queries and tests.
#[derive(Debug, Clone)]
pub struct FactRow {
    pub fact_id: i64,
    pub event_key: String,
    pub dim_keys: BTreeMap<String, i64>,
    pub measures: BTreeMap<String, f64>,
}

pub fn facts_for_set(conn: &Connection, fact_set: &str) -> Result<Vec<FactRow>> {
    let mut statement = conn
        .prepare(
            "SELECT fact_id, event_key, dim_keys, measures
             FROM fact_rows WHERE fact_set = ?1 ORDER BY fact_id ASC",
        )
        .context("failed to prepare fact query")?;
    let rows = statement
        .query_map([fact_set], |row| {
            let raw_keys: String = row.get(2)?;
            let raw_measures: String = row.get(3)?;
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, raw_keys, raw_measures))
        })
        .context("failed to query facts")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("failed to read fact rows")?;

    let mut facts = Vec::with_capacity(rows.len());
    for (fact_id, event_key, raw_keys, raw_measures) in rows {
        facts.push(FactRow {
            fact_id,
            event_key,
            dim_keys: serde_json::from_str(&raw_keys)
                .with_context(|| format!("corrupt dim_keys on fact {fact_id}"))?,
            measures: serde_json::from_str(&raw_measures)
                .with_context(|| format!("corrupt measures on fact {fact_id}"))?,
        });
    }
    Ok(facts)
}

/// Facts whose dimension references point at versions that are no longer
/// current. Non-zero counts indicate history drifted under the fact set.
pub fn stale_reference_count(conn: &Connection, fact_set: &str) -> Result<i64> {
    let facts = facts_for_set(conn, fact_set)?;
    let mut stale = 0;
    for fact in &facts {
        for surrogate_key in fact.dim_keys.values() {
            let current: Option<i64> = conn
                .query_row(
                    "SELECT is_current FROM dim_versions WHERE surrogate_key = ?1",
                    [surrogate_key],
                    |row| row.get(0),
                )
                .optional()
                .context("failed to check fact reference")?;
            if current != Some(1) {
                stale += 1;
            }
        }
    }
    Ok(stale)
}
