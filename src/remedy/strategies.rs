use serde_json::{Value, json};

use crate::record::{Record, value_f64, value_text};

use super::StrategyContext;

/// One deterministic method for deriving a missing value. Strategies are
/// tried in fixed priority order; `attempt` returns None when the strategy
/// does not apply or finds nothing, and the chain moves on.
pub trait Strategy {
    fn name(&self) -> &'static str;
    fn confidence(&self) -> &'static str;
    fn attempt(&self, record: &Record, ctx: &StrategyContext<'_>) -> Option<Value>;
}

/// The full chain in priority order. Default assignment is last and always
/// succeeds, so the chain is total.
pub fn chain() -> Vec<Box<dyn Strategy>> {
    vec![
        Box::new(DirectMapping),
        Box::new(ApproximateMatching),
        Box::new(CrossSourceEnrichment),
        Box::new(Propagation),
        Box::new(StatisticalInference),
        Box::new(DefaultAssignment),
    ]
}

/// Exact lookup in a deterministic mapping table keyed by a related
/// attribute's value (e.g. country -> region).
pub struct DirectMapping;

impl Strategy for DirectMapping {
    fn name(&self) -> &'static str {
        "direct mapping"
    }

    fn confidence(&self) -> &'static str {
        "exact"
    }

    fn attempt(&self, record: &Record, ctx: &StrategyContext<'_>) -> Option<Value> {
        let key = record.get(&ctx.rule.key_attribute).and_then(value_text)?;
        let table = ctx.reference.mapping(&ctx.rule.mapping_table)?;
        table.get(&key).cloned()
    }
}

/// Jaro-Winkler similarity against candidate mapping keys when the exact
/// lookup misses. The best candidate wins iff its score reaches the rule's
/// threshold; a score exactly at the threshold is accepted.
pub struct ApproximateMatching;

impl Strategy for ApproximateMatching {
    fn name(&self) -> &'static str {
        "approximate matching"
    }

    fn confidence(&self) -> &'static str {
        "fuzzy"
    }

    fn attempt(&self, record: &Record, ctx: &StrategyContext<'_>) -> Option<Value> {
        let key = record.get(&ctx.rule.key_attribute).and_then(value_text)?;
        let table = ctx.reference.mapping(&ctx.rule.mapping_table)?;
        let needle = key.to_lowercase();

        let mut best: Option<(f64, &Value)> = None;
        for (candidate, value) in table {
            let score = strsim::jaro_winkler(&needle, &candidate.to_lowercase());
            if best.is_none_or(|(best_score, _)| score > best_score) {
                best = Some((score, value));
            }
        }

        best.and_then(|(score, value)| {
            if score >= ctx.rule.fuzzy_threshold {
                Some(value.clone())
            } else {
                None
            }
        })
    }
}

/// Secondary authoritative dataset joined on a different attribute set
/// (e.g. country + city) to derive the missing value.
pub struct CrossSourceEnrichment;

impl Strategy for CrossSourceEnrichment {
    fn name(&self) -> &'static str {
        "cross-source enrichment"
    }

    fn confidence(&self) -> &'static str {
        "enriched"
    }

    fn attempt(&self, record: &Record, ctx: &StrategyContext<'_>) -> Option<Value> {
        let table = ctx.rule.enrichment_table.as_deref()?;
        let rows = ctx.reference.enrichment_rows(table)?;

        rows.iter()
            .find(|row| {
                ctx.rule.enrichment_key_attributes.iter().all(|attribute| {
                    match (
                        row.keys.get(attribute),
                        record.get(attribute).and_then(value_text),
                    ) {
                        (Some(expected), Some(actual)) => expected.eq_ignore_ascii_case(&actual),
                        _ => false,
                    }
                })
            })
            .map(|row| row.value.clone())
    }
}

/// Inherits the value from a related record in the same batch, resolved
/// through the rule's relationship attribute.
pub struct Propagation;

impl Strategy for Propagation {
    fn name(&self) -> &'static str {
        "propagation"
    }

    fn confidence(&self) -> &'static str {
        "inherited"
    }

    fn attempt(&self, record: &Record, ctx: &StrategyContext<'_>) -> Option<Value> {
        let relationship = ctx.rule.related_record_attribute.as_deref()?;
        let related_key = record.get(relationship).and_then(value_text)?;
        let index = *ctx.by_natural_key.get(&related_key)?;
        let related = &ctx.batch[index];

        if related.is_missing(&ctx.rule.target_attribute) {
            None
        } else {
            related.get(&ctx.rule.target_attribute).cloned()
        }
    }
}

/// Monotonic band function of a correlated numeric attribute (e.g. wage
/// estimated from GDP). Bands are listed highest threshold first; a source
/// below every band gets the configured floor.
pub struct StatisticalInference;

impl Strategy for StatisticalInference {
    fn name(&self) -> &'static str {
        "statistical inference"
    }

    fn confidence(&self) -> &'static str {
        "estimated"
    }

    fn attempt(&self, record: &Record, ctx: &StrategyContext<'_>) -> Option<Value> {
        let inference = ctx.rule.inference.as_ref()?;
        let source = record
            .get(&inference.source_attribute)
            .and_then(value_f64)?;

        let estimate = inference
            .bands
            .iter()
            .find(|band| source >= band.min_source)
            .map(|band| round2(source * band.multiplier))
            .unwrap_or(inference.floor);

        Some(json!(estimate))
    }
}

/// Sentinel assignment. Always succeeds; no flagged field stays null.
pub struct DefaultAssignment;

impl Strategy for DefaultAssignment {
    fn name(&self) -> &'static str {
        "default"
    }

    fn confidence(&self) -> &'static str {
        "sentinel"
    }

    fn attempt(&self, _record: &Record, ctx: &StrategyContext<'_>) -> Option<Value> {
        Some(ctx.rule.default_value.clone())
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
