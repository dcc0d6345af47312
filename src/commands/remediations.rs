use anyhow::{Context, Result};
use tracing::info;

use crate::cli::RemediationsArgs;
use crate::ledger::remediations_for_run;
use crate::store::Store;

pub fn run(args: RemediationsArgs) -> Result<()> {
    let store = Store::open(&args.db_path)?;
    let remediations = remediations_for_run(&store.conn, args.run_id)?;

    if args.json {
        let rendered =
            serde_json::to_string_pretty(&remediations).context("failed to render remediations")?;
        println!("{rendered}");
        return Ok(());
    }

    info!(
        run_id = args.run_id,
        remediations = remediations.len(),
        "remediations for run"
    );
    for remediation in &remediations {
        info!(
            entity_type = %remediation.entity_type,
            natural_key = %remediation.natural_key,
            attribute = %remediation.attribute,
            old_value = %remediation.old_value.clone().unwrap_or_default(),
            new_value = %remediation.new_value,
            strategy = %remediation.strategy,
            confidence = %remediation.confidence,
            "remediation"
        );
    }

    Ok(())
}
