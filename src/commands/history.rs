use anyhow::{Context, Result};
use serde_json::json;
use tracing::info;

use crate::cli::HistoryArgs;
use crate::merge::version_history;
use crate::store::Store;

pub fn run(args: HistoryArgs) -> Result<()> {
    let store = Store::open(&args.db_path)?;
    let history = version_history(&store.conn, &args.entity_type, &args.natural_key)?;

    if args.json {
        let rows: Vec<_> = history
            .iter()
            .map(|version| {
                json!({
                    "surrogate_key": version.surrogate_key,
                    "natural_key": version.natural_key,
                    "valid_from": version.valid_from,
                    "valid_to": version.valid_to,
                    "is_current": version.is_current,
                    "attributes": version.attributes,
                })
            })
            .collect();
        let rendered = serde_json::to_string_pretty(&rows).context("failed to render history")?;
        println!("{rendered}");
        return Ok(());
    }

    info!(
        entity_type = %args.entity_type,
        natural_key = %args.natural_key,
        versions = history.len(),
        "version history"
    );
    for version in &history {
        info!(
            surrogate_key = version.surrogate_key,
            valid_from = %version.valid_from,
            valid_to = %version.valid_to.map(|d| d.to_string()).unwrap_or_default(),
            is_current = version.is_current,
            "version"
        );
    }

    Ok(())
}
