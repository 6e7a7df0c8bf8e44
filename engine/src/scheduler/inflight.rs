//! Set of tiles currently being fetched, owned by one scheduler
//! instance for the duration of a run.

use rustc_hash::FxHashMap;

use qprism_common::types::{Tile, TileKey};

#[derive(Debug, Default)]
pub struct InflightTracker {
    inflight: FxHashMap<TileKey, Tile>,
}

impl InflightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, tile: Tile) {
        self.inflight.insert(tile.key(), tile);
    }

    pub fn remove(&mut self, tile: &Tile) {
        self.inflight.remove(&tile.key());
    }

    /// Transport-level cancellation is handled elsewhere; at this layer
    /// a cancel is just a removal.
    pub fn cancel(&mut self, tile: &Tile) {
        self.remove(tile);
    }

    pub fn is_in_flight(&self, tile: &Tile) -> bool {
        self.inflight.contains_key(&tile.key())
    }

    /// Current in-flight tiles; iteration order is not significant.
    pub fn snapshot(&self) -> Vec<Tile> {
        self.inflight.values().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }
}
