use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use rusqlite::{Connection, OpenFlags};

use qprism_engine::analysis::{aggregate_metrics, compute_run_metrics};

/// Summarise a results database into one CSV file per metric.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Results database produced by run_variant
    #[arg(long)]
    db: PathBuf,

    /// Output directory for the CSV files
    #[arg(long, default_value = "results")]
    out: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let conn = Connection::open_with_flags(&cli.db, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .with_context(|| format!("open results database {}", cli.db.display()))?;

    let mut stmt = conn.prepare("SELECT run_id FROM runs ORDER BY run_id")?;
    let run_ids: Vec<i64> = stmt
        .query_map([], |r| r.get(0))?
        .collect::<std::result::Result<_, _>>()?;

    let per_run = run_ids
        .iter()
        .map(|&run_id| compute_run_metrics(&conn, run_id))
        .collect::<Result<Vec<_>>>()?;
    let summary = aggregate_metrics(&per_run);

    std::fs::create_dir_all(&cli.out)?;
    for (metric, stats) in &summary {
        let path = cli.out.join(format!("{metric}.csv"));
        let mut writer = csv::Writer::from_path(&path)
            .with_context(|| format!("create {}", path.display()))?;
        writer.write_record(["metric", "mean", "stdev", "count"])?;
        writer.write_record([
            metric.to_string(),
            stats.mean.to_string(),
            stats.stdev.to_string(),
            stats.count.to_string(),
        ])?;
        writer.flush()?;
    }
    tracing::info!(runs = run_ids.len(), metrics = summary.len(), out = %cli.out.display(), "export complete");
    Ok(())
}
