use anyhow::{Context, Result};
use tracing::info;

use crate::cli::FindingsArgs;
use crate::ledger::findings_for_run;
use crate::store::Store;

pub fn run(args: FindingsArgs) -> Result<()> {
    let store = Store::open(&args.db_path)?;
    let findings = findings_for_run(&store.conn, args.run_id)?;

    if args.json {
        let rendered =
            serde_json::to_string_pretty(&findings).context("failed to render findings")?;
        println!("{rendered}");
        return Ok(());
    }

    info!(run_id = args.run_id, findings = findings.len(), "findings for run");
    for finding in &findings {
        info!(
            indicator = %finding.indicator,
            severity = %finding.severity,
            measured = finding.measured,
            threshold = finding.threshold,
            blocking = finding.blocking,
            passed = finding.passed,
            detail = %finding.detail,
            "finding"
        );
    }

    Ok(())
}
