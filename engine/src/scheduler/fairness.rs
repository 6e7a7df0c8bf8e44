//! Bounded anti-starvation: a tile skipped often enough gets promoted to
//! the front of the load queue, at most one promotion per schedule pass
//! so ring ordering is perturbed, not destroyed.

use rustc_hash::FxHashMap;

use qprism_common::types::{Tile, TileKey};

pub const DEFAULT_SKIP_THRESHOLD: u32 = 3;

#[derive(Debug)]
pub struct FairnessGuard {
    skip_counts: FxHashMap<TileKey, u32>,
    threshold: u32,
}

impl Default for FairnessGuard {
    fn default() -> Self {
        Self::new(DEFAULT_SKIP_THRESHOLD)
    }
}

impl FairnessGuard {
    pub fn new(threshold: u32) -> Self {
        Self {
            skip_counts: FxHashMap::default(),
            threshold,
        }
    }

    /// Count a deferred candidate. Kept as an extension point for
    /// policies that hold some candidates back under concurrency caps;
    /// the full policy currently loads everything it filters in.
    pub fn record_skips<'a>(&mut self, tiles: impl IntoIterator<Item = &'a Tile>) {
        for tile in tiles {
            *self.skip_counts.entry(tile.key()).or_insert(0) += 1;
        }
    }

    pub fn reset<'a>(&mut self, tiles: impl IntoIterator<Item = &'a Tile>) {
        for tile in tiles {
            self.skip_counts.remove(&tile.key());
        }
    }

    /// Move the first starved tile (skip count at or past the threshold)
    /// to the front of the queue. At most one promotion per call.
    pub fn promote(&self, queue: &mut Vec<Tile>) {
        let starved = queue
            .iter()
            .position(|tile| self.skip_counts.get(&tile.key()).copied().unwrap_or(0) >= self.threshold);
        if let Some(idx) = starved {
            let tile = queue.remove(idx);
            queue.insert(0, tile);
        }
    }
}
