use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use serde::Deserialize;

use crate::record::Record;

/// One batch file as handed to the `run` command: normalized dimension
/// records plus any fact records that arrived with them.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchFile {
    pub entity_type: String,
    pub batch_date: NaiveDate,
    pub records: Vec<Record>,
    #[serde(default)]
    pub facts: Vec<Record>,
}

impl BatchFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let batch: BatchFile = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        if batch.entity_type.trim().is_empty() {
            bail!("batch file {} has an empty entity_type", path.display());
        }
        Ok(batch)
    }
}
