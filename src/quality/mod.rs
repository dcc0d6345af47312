use anyhow::{Context, Result};
use regex::Regex;
use rusqlite::Connection;
use tracing::{info, warn};

use crate::config::{EntityConfig, IndicatorCheck, IndicatorSpec, Severity};
use crate::ledger::{self, Decision, FindingRow};
use crate::record::{Record, value_f64, value_text};

#[cfg(test)]
mod tests;

#[derive(Debug)]
pub struct QualityReport {
    pub findings: Vec<FindingRow>,
    pub decision: Decision,
}

/// Runs every indicator applicable to the batch, records each finding
/// durably, and only then returns the decision. A caller that crashes after
/// this returns can still audit why the batch was gated.
pub fn evaluate(
    conn: &mut Connection,
    run_id: i64,
    config: &EntityConfig,
    batch: &[Record],
) -> Result<QualityReport> {
    let mut findings = Vec::with_capacity(config.indicators.len());

    for spec in &config.indicators {
        let finding = match measure(spec, config, batch) {
            Ok(finding) => finding,
            Err(reason) => unevaluable_finding(spec, &reason),
        };
        if !finding.passed {
            warn!(
                indicator = %finding.indicator,
                severity = %finding.severity.as_str(),
                detail = %finding.detail,
                "quality indicator failed"
            );
        }
        findings.push(finding);
    }

    let tx = conn
        .transaction()
        .context("failed to open findings transaction")?;
    for finding in &findings {
        ledger::insert_finding(&tx, run_id, finding)
            .context("failed to record quality finding")?;
    }
    tx.commit().context("failed to commit quality findings")?;

    let decision = decide(&findings);
    info!(
        entity_type = %config.entity_type,
        indicators = findings.len(),
        decision = %decision.as_str(),
        "quality gate evaluated"
    );

    Ok(QualityReport { findings, decision })
}

pub fn decide(findings: &[FindingRow]) -> Decision {
    if findings.iter().any(|f| !f.passed && f.blocking) {
        Decision::Rejected
    } else if findings.iter().any(|f| !f.passed) {
        Decision::AcceptedWithWarnings
    } else {
        Decision::Accepted
    }
}

fn unevaluable_finding(spec: &IndicatorSpec, reason: &str) -> FindingRow {
    FindingRow {
        indicator: spec.name.clone(),
        severity: Severity::Critical,
        measured: None,
        threshold: None,
        blocking: true,
        passed: false,
        detail: format!("indicator unevaluable: {reason}"),
    }
}

/// Computes one indicator's measured value against the in-memory batch.
/// Err carries the unevaluable reason, which the caller escalates to a
/// critical finding rather than letting the indicator silently pass.
fn measure(
    spec: &IndicatorSpec,
    config: &EntityConfig,
    batch: &[Record],
) -> std::result::Result<FindingRow, String> {
    let (measured, threshold, passed, detail) = match &spec.check {
        IndicatorCheck::NullNaturalKey { max_count } => {
            let nulls = batch
                .iter()
                .filter(|record| record.is_missing(&config.natural_key))
                .count() as f64;
            (
                nulls,
                *max_count as f64,
                nulls <= *max_count as f64,
                format!(
                    "{nulls} of {} records with null natural key {}",
                    batch.len(),
                    config.natural_key
                ),
            )
        }
        IndicatorCheck::NullRate {
            attribute,
            max_ratio,
        } => {
            require_attribute(batch, attribute)?;
            let nulls = batch
                .iter()
                .filter(|record| record.is_missing(attribute))
                .count();
            let ratio = if batch.is_empty() {
                0.0
            } else {
                nulls as f64 / batch.len() as f64
            };
            (
                ratio,
                *max_ratio,
                ratio <= *max_ratio,
                format!("{nulls} of {} records null for {attribute}", batch.len()),
            )
        }
        IndicatorCheck::RangeCheck {
            attribute,
            min,
            max,
        } => {
            require_attribute(batch, attribute)?;
            let out_of_range = batch
                .iter()
                .filter_map(|record| record.get(attribute))
                .filter(|value| !value.is_null())
                .filter(|value| match value_f64(value) {
                    Some(number) => {
                        min.is_some_and(|floor| number < floor)
                            || max.is_some_and(|ceiling| number > ceiling)
                    }
                    // a non-numeric value cannot satisfy a numeric range
                    None => true,
                })
                .count() as f64;
            (
                out_of_range,
                0.0,
                out_of_range == 0.0,
                format!(
                    "{out_of_range} values of {attribute} outside range (min: {min:?}, max: {max:?})"
                ),
            )
        }
        IndicatorCheck::PatternMismatch { attribute, pattern } => {
            require_attribute(batch, attribute)?;
            let regex = Regex::new(pattern)
                .map_err(|error| format!("invalid pattern for {attribute}: {error}"))?;
            let mismatches = batch
                .iter()
                .filter_map(|record| record.get(attribute))
                .filter_map(value_text)
                .filter(|text| !regex.is_match(text))
                .count() as f64;
            (
                mismatches,
                0.0,
                mismatches == 0.0,
                format!("{mismatches} values of {attribute} not matching /{pattern}/"),
            )
        }
        IndicatorCheck::MinRecordCount { min } => {
            let count = batch.len() as f64;
            (
                count,
                *min as f64,
                count >= *min as f64,
                format!("{} records, minimum expected {min}", batch.len()),
            )
        }
    };

    Ok(FindingRow {
        indicator: spec.name.clone(),
        severity: spec.severity,
        measured: Some(measured),
        threshold: Some(threshold),
        blocking: spec.severity.blocks_batch(),
        passed,
        detail,
    })
}

/// An indicator referencing an attribute no record carries cannot be
/// measured; the batch may have been normalized against the wrong layout.
fn require_attribute(batch: &[Record], attribute: &str) -> std::result::Result<(), String> {
    if batch.is_empty() || batch.iter().any(|record| record.get(attribute).is_some()) {
        Ok(())
    } else {
        Err(format!("attribute {attribute} absent from every record"))
    }
}
