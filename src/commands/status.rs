use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::facts::stale_reference_count;
use crate::ledger::recent_runs;
use crate::store::Store;

pub fn run(args: StatusArgs) -> Result<()> {
    if !args.db_path.exists() {
        warn!(path = %args.db_path.display(), "store missing, nothing to report");
        return Ok(());
    }

    let store = Store::open(&args.db_path)?;
    let conn = &store.conn;

    let entities = query_count(conn, "SELECT COUNT(DISTINCT entity_type) FROM dim_versions")?;
    let versions = query_count(conn, "SELECT COUNT(*) FROM dim_versions")?;
    let current = query_count(conn, "SELECT COUNT(*) FROM dim_versions WHERE is_current = 1")?;
    let facts = query_count(conn, "SELECT COUNT(*) FROM fact_rows")?;
    let runs = query_count(conn, "SELECT COUNT(*) FROM runs")?;

    info!(
        path = %args.db_path.display(),
        entity_types = entities,
        versions,
        current_versions = current,
        facts,
        runs,
        "store status"
    );

    for fact_set in fact_sets(conn)? {
        let stale = stale_reference_count(conn, &fact_set)?;
        if stale > 0 {
            warn!(fact_set = %fact_set, stale, "facts reference non-current versions");
        } else {
            info!(fact_set = %fact_set, "all fact references current");
        }
    }

    for run in recent_runs(conn, args.recent_runs)? {
        info!(
            run_id = run.run_id,
            entity_type = %run.entity_type,
            batch_date = %run.batch_date,
            status = %run.status,
            decision = %run.decision.unwrap_or_default(),
            records_in = run.records_in,
            accepted = run.accepted,
            inserted = run.inserted,
            changed = run.changed,
            unchanged = run.unchanged,
            fixed = run.fixed,
            rejected = run.rejected,
            "recent run"
        );
    }

    Ok(())
}

fn query_count(conn: &Connection, sql: &str) -> Result<i64> {
    let count = conn
        .query_row(sql, [], |row| row.get(0))
        .with_context(|| format!("status query failed: {sql}"))?;
    Ok(count)
}

fn fact_sets(conn: &Connection) -> Result<Vec<String>> {
    let mut statement = conn
        .prepare("SELECT DISTINCT fact_set FROM fact_rows ORDER BY fact_set")
        .context("failed to prepare fact-set query")?;
    let sets = statement
        .query_map([], |row| row.get(0))
        .context("failed to query fact sets")?
        .collect::<rusqlite::Result<Vec<String>>>()
        .context("failed to read fact sets")?;
    Ok(sets)
}
