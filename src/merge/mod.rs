//! Type 2 dimensional merge: every change to a tracked attribute expires the
//! current version and inserts a successor, so history is preserved as a
//! chain of non-overlapping `[valid_from, valid_to)` intervals. Exactly one
//! version per natural key is current at any time.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Transaction, ffi, params};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::EntityConfig;
use crate::ledger::{flag_integrity_violation, flag_storage_failure};
use crate::record::{Record, values_equal};
use crate::store::{RetryPolicy, with_transaction};


/// One stored version of a dimension member.
#[derive(Debug, Clone)]
pub struct DimVersion {
    pub surrogate_key: i64,
    pub natural_key: String,
    pub attributes: BTreeMap<String, Value>,
    pub valid_from: NaiveDate,
    pub valid_to: Option<NaiveDate>,
    pub is_current: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub attribute: String,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

/// Classification of an incoming record against the stored current version.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeOutcome {
    New,
    Unchanged,
    Changed(Vec<FieldChange>),
}

/// Compares only the tracked attributes; untracked attributes never trigger
/// a new version, and a tracked attribute absent from the incoming record
/// counts as not delivered rather than changed.
pub fn detect_change(
    current: Option<&DimVersion>,
    incoming: &Record,
    tracked: &[String],
) -> ChangeOutcome {
    let Some(version) = current else {
        return ChangeOutcome::New;
    };
    let changes = changed_attributes(version, incoming, tracked);
    if changes.is_empty() {
        ChangeOutcome::Unchanged
    } else {
        ChangeOutcome::Changed(changes)
    }
}

fn changed_attributes(version: &DimVersion, incoming: &Record, tracked: &[String]) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    for attribute in tracked {
        // An attribute absent from the incoming record was not delivered
        // this batch; only a present value (explicit null included) takes
        // part in the diff. The carry-forward keeps the stored value, so
        // the next comparison against the same batch converges.
        let Some(new) = incoming.get(attribute) else {
            continue;
        };
        let old = version.attributes.get(attribute);
        if !values_equal(old, Some(new)) {
            changes.push(FieldChange {
                attribute: attribute.clone(),
                old: old.cloned(),
                new: Some(new.clone()),
            });
        }
    }
    changes
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MergeCounts {
    pub inserted: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub violations: usize,
    pub failed: usize,
}

enum KeyOutcome {
    Inserted,
    Changed,
    Unchanged,
}

/// Merges the batch one natural key at a time. Each key runs in its own
/// transaction: an integrity violation rolls back that key, records a
/// blocking finding, and leaves every other key's outcome intact.
pub fn merge_batch(
    conn: &mut Connection,
    run_id: i64,
    config: &EntityConfig,
    batch_date: NaiveDate,
    batch: &[Record],
) -> Result<MergeCounts> {
    let policy = RetryPolicy::default();
    let mut counts = MergeCounts::default();

    for record in batch {
        let Some(natural_key) = record.natural_key(&config.natural_key) else {
            warn!(
                entity_type = %config.entity_type,
                "record without a natural key reached the merge, skipping"
            );
            continue;
        };

        let result = with_transaction(conn, &policy, |tx| {
            merge_key(tx, config, &natural_key, record, batch_date)
        });

        match result {
            Ok(KeyOutcome::Inserted) => counts.inserted += 1,
            Ok(KeyOutcome::Changed) => counts.changed += 1,
            Ok(KeyOutcome::Unchanged) => counts.unchanged += 1,
            Err(error) => match violation_detail(&error) {
                Some(detail) => {
                    warn!(
                        entity_type = %config.entity_type,
                        natural_key = %natural_key,
                        detail = %detail,
                        "merge integrity violation, key rolled back"
                    );
                    flag_integrity_violation(
                        conn,
                        run_id,
                        &config.entity_type,
                        &natural_key,
                        &detail,
                    )?;
                    counts.violations += 1;
                }
                None => {
                    warn!(
                        entity_type = %config.entity_type,
                        natural_key = %natural_key,
                        error = %error,
                        "merge transaction failed, key skipped"
                    );
                    flag_storage_failure(
                        conn,
                        run_id,
                        &config.entity_type,
                        &natural_key,
                        &error.to_string(),
                    )?;
                    counts.failed += 1;
                }
            },
        }
    }

    Ok(counts)
}

fn merge_key(
    tx: &Transaction,
    config: &EntityConfig,
    natural_key: &str,
    record: &Record,
    batch_date: NaiveDate,
) -> rusqlite::Result<KeyOutcome> {
    let current = current_version(tx, &config.entity_type, natural_key)?;

    let Some(version) = current else {
        insert_version(tx, &config.entity_type, natural_key, &record.attributes, batch_date)?;
        verify_key_integrity(tx, &config.entity_type, natural_key)?;
        return Ok(KeyOutcome::Inserted);
    };

    let changes = changed_attributes(&version, record, &config.tracked_attributes);
    if changes.is_empty() {
        return Ok(KeyOutcome::Unchanged);
    }

    debug!(
        entity_type = %config.entity_type,
        natural_key = %natural_key,
        changed = changes.len(),
        "tracked attributes changed, versioning"
    );

    expire_version(tx, version.surrogate_key, batch_date)?;

    // Carry forward attributes the incoming record does not mention.
    let mut attributes = version.attributes.clone();
    for (name, value) in &record.attributes {
        attributes.insert(name.clone(), value.clone());
    }
    insert_version(tx, &config.entity_type, natural_key, &attributes, batch_date)?;
    verify_key_integrity(tx, &config.entity_type, natural_key)?;

    Ok(KeyOutcome::Changed)
}

fn current_version(
    tx: &Transaction,
    entity_type: &str,
    natural_key: &str,
) -> rusqlite::Result<Option<DimVersion>> {
    tx.query_row(
        "SELECT surrogate_key, natural_key, attributes, valid_from, valid_to, is_current
         FROM dim_versions
         WHERE entity_type = ?1 AND natural_key = ?2 AND is_current = 1",
        params![entity_type, natural_key],
        version_from_row,
    )
    .optional()
}

fn version_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DimVersion> {
    let raw: String = row.get(2)?;
    let attributes: BTreeMap<String, Value> = serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
    Ok(DimVersion {
        surrogate_key: row.get(0)?,
        natural_key: row.get(1)?,
        attributes,
        valid_from: row.get(3)?,
        valid_to: row.get(4)?,
        is_current: row.get::<_, i64>(5)? != 0,
    })
}

fn insert_version(
    tx: &Transaction,
    entity_type: &str,
    natural_key: &str,
    attributes: &BTreeMap<String, Value>,
    valid_from: NaiveDate,
) -> rusqlite::Result<()> {
    let serialized = serde_json::to_string(attributes)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    tx.execute(
        "INSERT INTO dim_versions(entity_type, natural_key, attributes, valid_from, valid_to, is_current)
         VALUES(?1, ?2, ?3, ?4, NULL, 1)",
        params![entity_type, natural_key, serialized, valid_from],
    )?;
    Ok(())
}

fn expire_version(
    tx: &Transaction,
    surrogate_key: i64,
    valid_to: NaiveDate,
) -> rusqlite::Result<()> {
    tx.execute(
        "UPDATE dim_versions SET valid_to = ?1, is_current = 0 WHERE surrogate_key = ?2",
        params![valid_to, surrogate_key],
    )?;
    Ok(())
}

/// Checks the single-current and interval invariants for one key before the
/// transaction commits. A failure here aborts and rolls back the key.
fn verify_key_integrity(
    tx: &Transaction,
    entity_type: &str,
    natural_key: &str,
) -> rusqlite::Result<()> {
    let mut statement = tx.prepare(
        "SELECT valid_from, valid_to, is_current
         FROM dim_versions
         WHERE entity_type = ?1 AND natural_key = ?2
         ORDER BY valid_from ASC, surrogate_key ASC",
    )?;
    let rows = statement
        .query_map(params![entity_type, natural_key], |row| {
            Ok((
                row.get::<_, NaiveDate>(0)?,
                row.get::<_, Option<NaiveDate>>(1)?,
                row.get::<_, i64>(2)? != 0,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let current_count = rows.iter().filter(|(_, _, current)| *current).count();
    if current_count != 1 {
        return Err(violation_error(format!(
            "{current_count} current versions for {entity_type}/{natural_key}, expected exactly 1"
        )));
    }

    for (index, (valid_from, valid_to, is_current)) in rows.iter().enumerate() {
        let last = index + 1 == rows.len();
        if last {
            if !is_current || valid_to.is_some() {
                return Err(violation_error(format!(
                    "latest version of {entity_type}/{natural_key} is not open-ended current"
                )));
            }
            continue;
        }
        let Some(end) = valid_to else {
            return Err(violation_error(format!(
                "historical version of {entity_type}/{natural_key} has no expiry"
            )));
        };
        if end < valid_from {
            return Err(violation_error(format!(
                "version interval of {entity_type}/{natural_key} ends before it starts"
            )));
        }
        let (next_from, _, _) = rows[index + 1];
        if *end != next_from {
            return Err(violation_error(format!(
                "version intervals of {entity_type}/{natural_key} are not contiguous at {end}"
            )));
        }
    }

    Ok(())
}

pub(crate) fn violation_error(detail: String) -> rusqlite::Error {
    rusqlite::Error::SqliteFailure(ffi::Error::new(ffi::SQLITE_CONSTRAINT), Some(detail))
}

pub(crate) fn violation_detail(error: &rusqlite::Error) -> Option<String> {
    match error {
        rusqlite::Error::SqliteFailure(failure, Some(detail))
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            Some(detail.clone())
        }
        _ => None,
    }
}

/// Resolves the current surrogate key for a dimension member, if any.
pub fn current_surrogate_key(
    tx: &Transaction,
    entity_type: &str,
    natural_key: &str,
) -> rusqlite::Result<Option<i64>> {
    tx.query_row(
        "SELECT surrogate_key FROM dim_versions
         WHERE entity_type = ?1 AND natural_key = ?2 AND is_current = 1",
        params![entity_type, natural_key],
        |row| row.get(0),
    )
    .optional()
}

/// Full version chain for one key, oldest first.
pub fn version_history(
    conn: &Connection,
    entity_type: &str,
    natural_key: &str,
) -> Result<Vec<DimVersion>> {
    let mut statement = conn
        .prepare(
            "SELECT surrogate_key, natural_key, attributes, valid_from, valid_to, is_current
             FROM dim_versions
             WHERE entity_type = ?1 AND natural_key = ?2
             ORDER BY valid_from ASC, surrogate_key ASC",
        )
        .context("failed to prepare version history query")?;
    let rows = statement
        .query_map(params![entity_type, natural_key], version_from_row)
        .context("failed to query version history")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("failed to read version history rows")?;
    Ok(rows)
}
