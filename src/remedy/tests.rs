use chrono::NaiveDate;
use serde_json::{Value, json};

use super::*;
use crate::config::{BandInference, EnrichmentRow, InferenceBand};
use crate::ledger::{open_run, remediations_for_run};
use crate::store::Store;

fn region_rule() -> RemediationRule {
    RemediationRule {
        target_attribute: "region".to_string(),
        key_attribute: "country".to_string(),
        mapping_table: "country_region".to_string(),
        fuzzy_threshold: 0.8,
        enrichment_table: Some("world_data".to_string()),
        enrichment_key_attributes: vec!["country".to_string(), "city".to_string()],
        related_record_attribute: Some("parent_customer_id".to_string()),
        inference: None,
        default_value: json!("International Region"),
    }
}

fn config(rules: Vec<RemediationRule>) -> EntityConfig {
    EntityConfig {
        entity_type: "customers".to_string(),
        natural_key: "customer_id".to_string(),
        tracked_attributes: vec!["region".to_string()],
        indicators: Vec::new(),
        remediation: rules,
        facts: None,
    }
}

fn reference() -> ReferenceData {
    let mut data = ReferenceData::default();
    let mut table = std::collections::BTreeMap::new();
    table.insert("Germany".to_string(), json!("Western Europe"));
    table.insert("Brazil".to_string(), json!("South America"));
    table.insert("Japan".to_string(), json!("Asia"));
    data.mappings.insert("country_region".to_string(), table);
    data.enrichment.insert(
        "world_data".to_string(),
        vec![EnrichmentRow {
            keys: [
                ("country".to_string(), "Eire".to_string()),
                ("city".to_string(), "Cork".to_string()),
            ]
            .into_iter()
            .collect(),
            value: json!("Western Europe"),
        }],
    );
    data
}

fn customer(id: &str, pairs: &[(&str, Value)]) -> Record {
    let mut attributes = std::collections::BTreeMap::new();
    attributes.insert("customer_id".to_string(), json!(id));
    for (name, value) in pairs {
        attributes.insert((*name).to_string(), value.clone());
    }
    Record::new(attributes)
}

fn run_chain(batch: &mut [Record], rules: Vec<RemediationRule>) -> ChainOutcome {
    let mut store = Store::open_in_memory().expect("store opens");
    let run_id = open_run(
        &store.conn,
        "customers",
        NaiveDate::from_ymd_opt(2024, 3, 1).expect("valid date"),
        None,
    )
    .expect("run opens");

    remediate(&mut store.conn, run_id, &config(rules), &reference(), batch)
        .expect("chain runs")
}

#[test]
fn direct_mapping_fixes_null_region_from_country() {
    let mut batch = vec![customer(
        "C001",
        &[("country", json!("Germany")), ("region", Value::Null)],
    )];

    let outcome = run_chain(&mut batch, vec![region_rule()]);

    assert_eq!(outcome.fixed, 1);
    assert_eq!(batch[0].get("region"), Some(&json!("Western Europe")));
    assert_eq!(outcome.records[0].strategy, "direct mapping");
    assert_eq!(outcome.records[0].natural_key, "C001");
}

#[test]
fn earlier_strategy_success_suppresses_later_strategies() {
    let mut batch = vec![customer(
        "C001",
        &[
            ("country", json!("Germany")),
            ("city", json!("Cork")),
            ("region", Value::Null),
        ],
    )];

    let outcome = run_chain(&mut batch, vec![region_rule()]);

    assert_eq!(outcome.records.len(), 1);
    assert_eq!(outcome.records[0].strategy, "direct mapping");
}

#[test]
fn approximate_matching_accepts_scores_at_or_above_threshold() {
    let mut batch = vec![customer(
        "C002",
        &[("country", json!("Germny")), ("region", Value::Null)],
    )];

    let outcome = run_chain(&mut batch, vec![region_rule()]);

    assert_eq!(batch[0].get("region"), Some(&json!("Western Europe")));
    assert_eq!(outcome.records[0].strategy, "approximate matching");
    assert_eq!(outcome.records[0].confidence, "fuzzy");
}

#[test]
fn cross_source_enrichment_joins_on_secondary_attributes() {
    let mut batch = vec![customer(
        "C003",
        &[
            ("country", json!("Eire")),
            ("city", json!("Cork")),
            ("region", Value::Null),
        ],
    )];

    // "Eire" is nothing like any mapping key, so direct and fuzzy both miss.
    let outcome = run_chain(&mut batch, vec![region_rule()]);

    assert_eq!(batch[0].get("region"), Some(&json!("Western Europe")));
    assert_eq!(outcome.records[0].strategy, "cross-source enrichment");
}

#[test]
fn propagation_inherits_from_the_related_batch_record() {
    let mut batch = vec![
        customer(
            "C010",
            &[("country", json!("Atlantis")), ("region", json!("Oceania"))],
        ),
        customer(
            "C011",
            &[
                ("country", json!("Atlantis")),
                ("parent_customer_id", json!("C010")),
                ("region", Value::Null),
            ],
        ),
    ];

    let outcome = run_chain(&mut batch, vec![region_rule()]);

    assert_eq!(batch[1].get("region"), Some(&json!("Oceania")));
    assert_eq!(outcome.records[0].strategy, "propagation");
    assert_eq!(outcome.records[0].natural_key, "C011");
}

#[test]
fn statistical_inference_uses_band_multipliers() {
    let rule = RemediationRule {
        target_attribute: "minimum_wage".to_string(),
        key_attribute: "country".to_string(),
        mapping_table: "no_such_table".to_string(),
        fuzzy_threshold: 0.8,
        enrichment_table: None,
        enrichment_key_attributes: Vec::new(),
        related_record_attribute: None,
        inference: Some(BandInference {
            source_attribute: "gdp".to_string(),
            bands: vec![
                InferenceBand {
                    min_source: 50_000.0,
                    multiplier: 0.0003,
                },
                InferenceBand {
                    min_source: 20_000.0,
                    multiplier: 0.0002,
                },
                InferenceBand {
                    min_source: 5_000.0,
                    multiplier: 0.0001,
                },
            ],
            floor: 1.0,
        }),
        default_value: json!(1.0),
    };

    let mut batch = vec![
        customer(
            "W01",
            &[("gdp", json!(60_000.0)), ("minimum_wage", Value::Null)],
        ),
        customer(
            "W02",
            &[("gdp", json!(30_000.0)), ("minimum_wage", Value::Null)],
        ),
        customer(
            "W03",
            &[("gdp", json!(1_000.0)), ("minimum_wage", Value::Null)],
        ),
    ];

    let outcome = run_chain(&mut batch, vec![rule]);

    assert_eq!(batch[0].get("minimum_wage"), Some(&json!(18.0)));
    assert_eq!(batch[1].get("minimum_wage"), Some(&json!(6.0)));
    assert_eq!(batch[2].get("minimum_wage"), Some(&json!(1.0)));
    assert!(
        outcome
            .records
            .iter()
            .all(|record| record.strategy == "statistical inference")
    );
}

#[test]
fn chain_is_total_via_default_assignment() {
    let mut batch = vec![customer(
        "C099",
        &[("country", json!("Zzyzx")), ("region", Value::Null)],
    )];

    let outcome = run_chain(&mut batch, vec![region_rule()]);

    assert!(!batch[0].is_missing("region"));
    assert_eq!(batch[0].get("region"), Some(&json!("International Region")));
    assert_eq!(outcome.records[0].strategy, "default");
    assert_eq!(outcome.records[0].confidence, "sentinel");
}

#[test]
fn remediation_records_are_committed_per_pass() {
    let mut store = Store::open_in_memory().expect("store opens");
    let run_id = open_run(
        &store.conn,
        "customers",
        NaiveDate::from_ymd_opt(2024, 3, 1).expect("valid date"),
        None,
    )
    .expect("run opens");

    let mut batch = vec![
        customer(
            "C001",
            &[("country", json!("Germany")), ("region", Value::Null)],
        ),
        customer(
            "C002",
            &[("country", json!("Brazil")), ("region", Value::Null)],
        ),
    ];

    let outcome = remediate(
        &mut store.conn,
        run_id,
        &config(vec![region_rule()]),
        &reference(),
        &mut batch,
    )
    .expect("chain runs");
    assert_eq!(outcome.fixed, 2);

    let rows = remediations_for_run(&store.conn, run_id).expect("remediations query");
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|row| row.strategy == "direct mapping"));
    assert!(rows.iter().all(|row| row.old_value.is_none()));
}

#[test]
fn already_present_values_are_never_overridden() {
    let mut batch = vec![customer(
        "C050",
        &[("country", json!("Japan")), ("region", json!("Asia Pacific"))],
    )];

    let outcome = run_chain(&mut batch, vec![region_rule()]);

    assert_eq!(outcome.fixed, 0);
    assert!(outcome.records.is_empty());
    assert_eq!(batch[0].get("region"), Some(&json!("Asia Pacific")));
}
