use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Failing-indicator severity. Critical failures reject the whole batch;
/// everything else downgrades the decision to accepted-with-warnings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    pub fn blocks_batch(self) -> bool {
        matches!(self, Self::Critical)
    }
}

/// Closed set of quality-check kinds. The catalog is configuration data, not
/// a dispatch table; the evaluator owns the measurement logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndicatorCheck {
    /// Records whose natural key is null, blank, or absent.
    NullNaturalKey { max_count: u64 },
    /// Fraction of records with a null/blank value for one attribute.
    NullRate { attribute: String, max_ratio: f64 },
    /// Numeric values outside [min, max]; any hit fails.
    RangeCheck {
        attribute: String,
        min: Option<f64>,
        max: Option<f64>,
    },
    /// Non-null values that do not match the regex; any hit fails.
    PatternMismatch { attribute: String, pattern: String },
    /// Batch must carry at least this many records.
    MinRecordCount { min: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorSpec {
    pub name: String,
    pub severity: Severity,
    #[serde(flatten)]
    pub check: IndicatorCheck,
}

/// One step of the statistical-inference band table: source values at or
/// above `min_source` map through `multiplier`. Bands are evaluated in the
/// order given, so they must be listed highest threshold first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceBand {
    pub min_source: f64,
    pub multiplier: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandInference {
    /// Correlated numeric attribute the estimate derives from.
    pub source_attribute: String,
    pub bands: Vec<InferenceBand>,
    /// Assigned when the source value falls below every band.
    pub floor: f64,
}

fn default_fuzzy_threshold() -> f64 {
    0.8
}

/// Declarative description of how one attribute gets repaired. Strategy
/// order is fixed by the chain; a rule only supplies the inputs each
/// strategy needs. Unconfigured strategies never match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationRule {
    /// Attribute that must be non-null after the chain runs.
    pub target_attribute: String,
    /// Related attribute whose value keys the direct-mapping lookup.
    pub key_attribute: String,
    /// Name of the direct-mapping table inside the reference data.
    pub mapping_table: String,
    /// Jaro-Winkler acceptance threshold for approximate matching. A score
    /// exactly at the threshold is accepted.
    #[serde(default = "default_fuzzy_threshold")]
    pub fuzzy_threshold: f64,
    /// Name of the enrichment dataset plus the attributes joined against it.
    #[serde(default)]
    pub enrichment_table: Option<String>,
    #[serde(default)]
    pub enrichment_key_attributes: Vec<String>,
    /// Attribute holding the natural key of a related record in the same
    /// batch to inherit the target value from.
    #[serde(default)]
    pub related_record_attribute: Option<String>,
    #[serde(default)]
    pub inference: Option<BandInference>,
    /// Sentinel guaranteeing the chain is total.
    pub default_value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivedTotal {
    /// Measure written with the recomputed value.
    pub name: String,
    pub price_measure: String,
    pub quantity_measure: String,
    pub discount_measure: String,
}

/// How fact-level records attach to dimensions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactConfig {
    /// Logical fact collection name; event keys are unique within it.
    pub fact_set: String,
    /// Attribute identifying the business event (e.g. order line id).
    pub event_key_attribute: String,
    /// Dimension entity type -> attribute carrying that dimension's natural key.
    pub dimension_refs: BTreeMap<String, String>,
    pub measures: Vec<String>,
    #[serde(default)]
    pub derived_total: Option<DerivedTotal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityConfig {
    pub entity_type: String,
    pub natural_key: String,
    /// Attributes whose change triggers a new dimension version. Everything
    /// else is carried along untracked.
    pub tracked_attributes: Vec<String>,
    #[serde(default)]
    pub indicators: Vec<IndicatorSpec>,
    #[serde(default)]
    pub remediation: Vec<RemediationRule>,
    #[serde(default)]
    pub facts: Option<FactConfig>,
}

impl EntityConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read(path)
            .with_context(|| format!("failed to read entity config {}", path.display()))?;
        let config: Self = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse entity config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.entity_type.trim().is_empty() {
            bail!("entity_type must not be empty");
        }
        if self.natural_key.trim().is_empty() {
            bail!("natural_key must not be empty");
        }
        for rule in &self.remediation {
            if rule.enrichment_table.is_some() && rule.enrichment_key_attributes.is_empty() {
                bail!(
                    "remediation rule for {} names an enrichment table but no join attributes",
                    rule.target_attribute
                );
            }
        }
        Ok(())
    }
}

/// A row of the cross-source enrichment dataset: join-attribute values plus
/// the value it contributes for the target attribute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentRow {
    pub keys: BTreeMap<String, String>,
    pub value: Value,
}

/// Read-only reference datasets supplied by external collaborators: the
/// direct-mapping tables and the enrichment datasets, keyed by table name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReferenceData {
    #[serde(default)]
    pub mappings: BTreeMap<String, BTreeMap<String, Value>>,
    #[serde(default)]
    pub enrichment: BTreeMap<String, Vec<EnrichmentRow>>,
}

impl ReferenceData {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read(path)
            .with_context(|| format!("failed to read reference data {}", path.display()))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse reference data {}", path.display()))
    }

    pub fn mapping(&self, table: &str) -> Option<&BTreeMap<String, Value>> {
        self.mappings.get(table)
    }

    pub fn enrichment_rows(&self, table: &str) -> Option<&[EnrichmentRow]> {
        self.enrichment.get(table).map(Vec::as_slice)
    }
}
