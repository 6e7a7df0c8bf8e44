//! Read-only MBTiles byte source.
//!
//! MBTiles stores `tile_row` in TMS convention, so lookups flip the slippy
//! `y` with `tms_y = (1 << z) - 1 - y`. Queries run on the blocking pool;
//! the caller stays on the async executor.

use std::path::Path;

use anyhow::{ensure, Context, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OpenFlags;

#[derive(Clone)]
pub struct MbtilesSource {
    pool: Pool<SqliteConnectionManager>,
}

impl MbtilesSource {
    /// Open the SQLite database and verify it actually carries a `tiles`
    /// table, so a bad path fails at boot instead of per request.
    pub fn open(path: &Path) -> Result<Self> {
        ensure!(path.is_file(), "MBTiles not found: {}", path.display());
        let manager = SqliteConnectionManager::file(path)
            .with_flags(OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX);
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .context("open MBTiles connection pool")?;
        let tiles_tables: i64 = pool.get()?.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type IN ('table', 'view') AND name = 'tiles'",
            [],
            |row| row.get(0),
        )?;
        ensure!(
            tiles_tables == 1,
            "{} has no tiles table",
            path.display()
        );
        Ok(Self { pool })
    }

    /// Fetch one tile payload. Unknown tiles (including out-of-range
    /// coordinates) return an empty buffer rather than an error.
    pub async fn tile_data(&self, z: u8, x: u32, y: u32) -> Result<Vec<u8>> {
        if z >= 31 || u64::from(y) >= (1u64 << z) || u64::from(x) >= (1u64 << z) {
            return Ok(Vec::new());
        }
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().context("checkout MBTiles connection")?;
            let tms_y = (1i64 << z) - 1 - i64::from(y);
            let mut stmt = conn.prepare_cached(
                "SELECT tile_data FROM tiles \
                 WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3",
            )?;
            match stmt.query_row(
                rusqlite::params![i64::from(z), i64::from(x), tms_y],
                |row| row.get::<_, Vec<u8>>(0),
            ) {
                Ok(data) => Ok(data),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(Vec::new()),
                Err(e) => Err(e).context("query MBTiles"),
            }
        })
        .await
        .context("MBTiles query task")?
    }
}
