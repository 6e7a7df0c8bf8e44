//! SQLite results sink: one row per run, request, completion, and
//! completeness sample. Owned by the driver; fetch tasks report through
//! the driver rather than touching the sink directly.

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use qprism_common::types::{TileCompletion, TileRequest};

use crate::config::ExperimentConfig;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS runs (
    run_id INTEGER PRIMARY KEY AUTOINCREMENT,
    experiment_name TEXT NOT NULL,
    scheduler_variant TEXT NOT NULL,
    netem_profile TEXT NOT NULL,
    trace TEXT NOT NULL,
    seed INTEGER NOT NULL,
    notes TEXT,
    started_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS tile_requests (
    run_id INTEGER NOT NULL,
    tile_id TEXT NOT NULL,
    zoom INTEGER NOT NULL,
    ring INTEGER NOT NULL,
    requested_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS tile_completions (
    run_id INTEGER NOT NULL,
    tile_id TEXT NOT NULL,
    zoom INTEGER NOT NULL,
    ring INTEGER NOT NULL,
    requested_at INTEGER NOT NULL,
    completed_at INTEGER NOT NULL,
    cancelled INTEGER NOT NULL,
    bytes_transferred INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS viewport_samples (
    run_id INTEGER NOT NULL,
    ts_ms INTEGER NOT NULL,
    completeness REAL NOT NULL
);
";

pub struct EventSink {
    conn: Connection,
}

impl EventSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open results database {}", path.display()))?;
        conn.execute_batch(SCHEMA).context("create results schema")?;
        Ok(Self { conn })
    }

    /// Register a run and return its id. The stored seed is the actual
    /// per-run seed, `seed_base + run_idx`.
    pub fn log_run(&self, experiment: &ExperimentConfig, run_idx: u32) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO runs (experiment_name, scheduler_variant, netem_profile, trace, seed, notes, started_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    experiment.name,
                    experiment.scheduler_variant.as_str(),
                    experiment.netem_profile,
                    experiment
                        .trace_path
                        .as_ref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default(),
                    experiment.seed_base + u64::from(run_idx),
                    experiment.notes,
                    chrono::Utc::now().to_rfc3339(),
                ],
            )
            .context("insert run")?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn log_tile_requested(&self, run_id: i64, request: &TileRequest) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO tile_requests (run_id, tile_id, zoom, ring, requested_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    run_id,
                    request.tile_id,
                    request.zoom,
                    request.ring.as_u8(),
                    request.requested_at_ms
                ],
            )
            .context("insert tile request")?;
        Ok(())
    }

    pub fn log_tile_completed(&self, run_id: i64, completion: &TileCompletion) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO tile_completions \
                 (run_id, tile_id, zoom, ring, requested_at, completed_at, cancelled, bytes_transferred) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    run_id,
                    completion.tile_id,
                    completion.zoom,
                    completion.ring.as_u8(),
                    completion.requested_at_ms,
                    completion.completed_at_ms,
                    completion.cancelled,
                    completion.bytes_transferred
                ],
            )
            .context("insert tile completion")?;
        Ok(())
    }

    pub fn log_viewport_sample(&self, run_id: i64, ts_ms: u64, completeness: f64) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO viewport_samples (run_id, ts_ms, completeness) VALUES (?1, ?2, ?3)",
                params![run_id, ts_ms, completeness],
            )
            .context("insert viewport sample")?;
        Ok(())
    }

    /// Borrow the underlying connection for analysis queries.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}
