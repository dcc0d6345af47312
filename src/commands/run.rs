use anyhow::{Context, Result, bail};
use tracing::info;

use crate::cli::RunArgs;
use crate::config::{EntityConfig, ReferenceData};
use crate::engine;
use crate::model::BatchFile;
use crate::store::Store;
use crate::util::{ensure_directory, write_json_pretty};

pub fn run(args: RunArgs) -> Result<()> {
    let config = EntityConfig::load(&args.config_path)?;
    config.validate()?;

    let batch = BatchFile::load(&args.batch_path)?;
    if batch.entity_type != config.entity_type {
        bail!(
            "batch is for entity type {} but config describes {}",
            batch.entity_type,
            config.entity_type
        );
    }

    let reference = match &args.reference_path {
        Some(path) => ReferenceData::load(path)?,
        None => ReferenceData::default(),
    };

    if let Some(parent) = args.db_path.parent() {
        ensure_directory(parent)?;
    }
    let mut store = Store::open(&args.db_path)?;

    info!(
        entity_type = %config.entity_type,
        batch_date = %batch.batch_date,
        records = batch.records.len(),
        facts = batch.facts.len(),
        db = %args.db_path.display(),
        "run requested"
    );

    let result = engine::run(
        &mut store,
        &config,
        &reference,
        batch.batch_date,
        batch.records,
        batch.facts,
    )?;

    if let Some(path) = &args.result_path {
        write_json_pretty(path, &result)?;
        info!(path = %path.display(), "run result written");
    }
    if args.json {
        let rendered =
            serde_json::to_string_pretty(&result).context("failed to render run result")?;
        println!("{rendered}");
    }

    Ok(())
}
