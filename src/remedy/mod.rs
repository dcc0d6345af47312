use std::collections::BTreeMap;

use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::info;

use crate::config::{EntityConfig, ReferenceData, RemediationRule};
use crate::ledger::{self, RemediationRow};
use crate::record::{Record, value_text};

mod strategies;
#[cfg(test)]
mod tests;

use strategies::{Strategy, chain};

/// Read-only inputs a strategy may consult: the rule being applied, the
/// reference datasets, and the batch itself (for propagation).
pub struct StrategyContext<'a> {
    pub rule: &'a RemediationRule,
    pub reference: &'a ReferenceData,
    pub batch: &'a [Record],
    pub by_natural_key: &'a BTreeMap<String, usize>,
}

#[derive(Debug, Default)]
pub struct ChainOutcome {
    pub fixed: usize,
    pub records: Vec<RemediationRow>,
}

/// Repairs every flagged attribute across the batch, one entity-type pass.
/// Strategies run in fixed priority order per field; the first success wins
/// and later strategies never override it. All remediation records are
/// committed in a single transaction at the end of the pass, so a failure
/// mid-pass leaves nothing partially visible.
pub fn remediate(
    conn: &mut Connection,
    run_id: i64,
    config: &EntityConfig,
    reference: &ReferenceData,
    batch: &mut [Record],
) -> Result<ChainOutcome> {
    let mut outcome = ChainOutcome::default();
    let strategies = chain();

    for rule in &config.remediation {
        let by_natural_key = index_by_natural_key(&config.natural_key, batch);
        let ctx = StrategyContext {
            rule,
            reference,
            batch,
            by_natural_key: &by_natural_key,
        };

        // Plan against the pre-pass snapshot, then apply, so propagation
        // reads original values and borrows stay simple.
        let mut planned: Vec<(usize, RemediationRow, serde_json::Value)> = Vec::new();
        for (index, record) in batch.iter().enumerate() {
            if !record.is_missing(&rule.target_attribute) {
                continue;
            }

            let natural_key = record
                .natural_key(&config.natural_key)
                .unwrap_or_else(|| format!("<record {index}>"));
            let old_value = record.get(&rule.target_attribute).and_then(value_text);

            for strategy in &strategies {
                if let Some(value) = strategy.attempt(record, &ctx) {
                    planned.push((
                        index,
                        RemediationRow {
                            entity_type: config.entity_type.clone(),
                            natural_key,
                            attribute: rule.target_attribute.clone(),
                            old_value,
                            new_value: value_text(&value)
                                .unwrap_or_else(|| value.to_string()),
                            strategy: strategy.name().to_string(),
                            confidence: strategy.confidence().to_string(),
                        },
                        value,
                    ));
                    break;
                }
            }
        }

        for (index, row, value) in planned {
            batch[index].set(&rule.target_attribute, value);
            outcome.fixed += 1;
            outcome.records.push(row);
        }
    }

    let tx = conn
        .transaction()
        .context("failed to open remediation transaction")?;
    for row in &outcome.records {
        ledger::insert_remediation(&tx, run_id, row)
            .context("failed to record remediation")?;
    }
    tx.commit().context("failed to commit remediation pass")?;

    info!(
        entity_type = %config.entity_type,
        fixed = outcome.fixed,
        "remediation pass committed"
    );

    Ok(outcome)
}

fn index_by_natural_key(key_attribute: &str, batch: &[Record]) -> BTreeMap<String, usize> {
    let mut index = BTreeMap::new();
    for (position, record) in batch.iter().enumerate() {
        if let Some(key) = record.natural_key(key_attribute) {
            index.entry(key).or_insert(position);
        }
    }
    index
}
