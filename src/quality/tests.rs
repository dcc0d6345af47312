use std::collections::BTreeMap;

use serde_json::{Value, json};

use super::*;
use crate::ledger::open_run;
use crate::store::Store;

fn customer(id: Option<&str>, price: f64) -> Record {
    let mut attributes = BTreeMap::new();
    attributes.insert(
        "customer_id".to_string(),
        id.map(|value| json!(value)).unwrap_or(Value::Null),
    );
    attributes.insert("unit_price".to_string(), json!(price));
    Record::new(attributes)
}

fn config_with(indicators: Vec<IndicatorSpec>) -> EntityConfig {
    EntityConfig {
        entity_type: "customers".to_string(),
        natural_key: "customer_id".to_string(),
        tracked_attributes: vec!["region".to_string()],
        indicators,
        remediation: Vec::new(),
        facts: None,
    }
}

fn spec(name: &str, severity: Severity, check: IndicatorCheck) -> IndicatorSpec {
    IndicatorSpec {
        name: name.to_string(),
        severity,
        check,
    }
}

#[test]
fn critical_null_key_breach_rejects_the_batch() {
    let mut store = Store::open_in_memory().expect("store opens");
    let config = config_with(vec![spec(
        "null_natural_key",
        Severity::Critical,
        IndicatorCheck::NullNaturalKey { max_count: 0 },
    )]);

    let mut batch: Vec<Record> = (0..97)
        .map(|index| customer(Some(&format!("C{index:03}")), 10.0))
        .collect();
    batch.extend((0..3).map(|_| customer(None, 10.0)));

    let run_id = open_run(
        &store.conn,
        "customers",
        chrono::NaiveDate::from_ymd_opt(2024, 3, 1).expect("valid date"),
        None,
    )
    .expect("run opens");

    let report = evaluate(&mut store.conn, run_id, &config, &batch).expect("evaluation runs");
    assert_eq!(report.decision, Decision::Rejected);
    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.findings[0].measured, Some(3.0));
    assert!(report.findings[0].blocking);
}

#[test]
fn non_critical_failures_warn_without_blocking() {
    let mut store = Store::open_in_memory().expect("store opens");
    let config = config_with(vec![
        spec(
            "null_natural_key",
            Severity::Critical,
            IndicatorCheck::NullNaturalKey { max_count: 0 },
        ),
        spec(
            "negative_prices",
            Severity::High,
            IndicatorCheck::RangeCheck {
                attribute: "unit_price".to_string(),
                min: Some(0.0),
                max: None,
            },
        ),
    ]);

    let batch = vec![customer(Some("C001"), 10.0), customer(Some("C002"), -4.0)];
    let run_id = open_run(
        &store.conn,
        "customers",
        chrono::NaiveDate::from_ymd_opt(2024, 3, 1).expect("valid date"),
        None,
    )
    .expect("run opens");

    let report = evaluate(&mut store.conn, run_id, &config, &batch).expect("evaluation runs");
    assert_eq!(report.decision, Decision::AcceptedWithWarnings);

    let range_finding = report
        .findings
        .iter()
        .find(|finding| finding.indicator == "negative_prices")
        .expect("range finding present");
    assert!(!range_finding.passed);
    assert!(!range_finding.blocking);
}

#[test]
fn findings_are_durable_before_the_decision_returns() {
    let mut store = Store::open_in_memory().expect("store opens");
    let config = config_with(vec![spec(
        "min_rows",
        Severity::Medium,
        IndicatorCheck::MinRecordCount { min: 5 },
    )]);

    let run_id = open_run(
        &store.conn,
        "customers",
        chrono::NaiveDate::from_ymd_opt(2024, 3, 1).expect("valid date"),
        None,
    )
    .expect("run opens");

    let batch = vec![customer(Some("C001"), 10.0)];
    evaluate(&mut store.conn, run_id, &config, &batch).expect("evaluation runs");

    let persisted = crate::ledger::findings_for_run(&store.conn, run_id).expect("findings query");
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].indicator, "min_rows");
    assert!(!persisted[0].passed);
}

#[test]
fn missing_attribute_makes_the_indicator_unevaluable_and_critical() {
    let mut store = Store::open_in_memory().expect("store opens");
    let config = config_with(vec![spec(
        "phantom_nulls",
        Severity::Low,
        IndicatorCheck::NullRate {
            attribute: "no_such_column".to_string(),
            max_ratio: 0.5,
        },
    )]);

    let run_id = open_run(
        &store.conn,
        "customers",
        chrono::NaiveDate::from_ymd_opt(2024, 3, 1).expect("valid date"),
        None,
    )
    .expect("run opens");

    let batch = vec![customer(Some("C001"), 10.0)];
    let report = evaluate(&mut store.conn, run_id, &config, &batch).expect("evaluation runs");

    assert_eq!(report.decision, Decision::Rejected);
    assert_eq!(report.findings[0].severity, Severity::Critical);
    assert!(report.findings[0].detail.contains("indicator unevaluable"));
}

#[test]
fn invalid_pattern_is_unevaluable_not_silently_passing() {
    let mut store = Store::open_in_memory().expect("store opens");
    let config = config_with(vec![spec(
        "postal_format",
        Severity::Medium,
        IndicatorCheck::PatternMismatch {
            attribute: "unit_price".to_string(),
            pattern: "[unclosed".to_string(),
        },
    )]);

    let run_id = open_run(
        &store.conn,
        "customers",
        chrono::NaiveDate::from_ymd_opt(2024, 3, 1).expect("valid date"),
        None,
    )
    .expect("run opens");

    let batch = vec![customer(Some("C001"), 10.0)];
    let report = evaluate(&mut store.conn, run_id, &config, &batch).expect("evaluation runs");

    assert_eq!(report.decision, Decision::Rejected);
    assert!(report.findings[0].detail.contains("indicator unevaluable"));
}

#[test]
fn clean_batch_is_accepted() {
    let mut store = Store::open_in_memory().expect("store opens");
    let config = config_with(vec![
        spec(
            "null_natural_key",
            Severity::Critical,
            IndicatorCheck::NullNaturalKey { max_count: 0 },
        ),
        spec(
            "min_rows",
            Severity::Medium,
            IndicatorCheck::MinRecordCount { min: 1 },
        ),
    ]);

    let run_id = open_run(
        &store.conn,
        "customers",
        chrono::NaiveDate::from_ymd_opt(2024, 3, 1).expect("valid date"),
        None,
    )
    .expect("run opens");

    let batch = vec![customer(Some("C001"), 10.0), customer(Some("C002"), 12.5)];
    let report = evaluate(&mut store.conn, run_id, &config, &batch).expect("evaluation runs");

    assert_eq!(report.decision, Decision::Accepted);
    assert!(report.findings.iter().all(|finding| finding.passed));
}
