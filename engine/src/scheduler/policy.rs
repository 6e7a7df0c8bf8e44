//! The three scheduling policies under comparison.
//!
//! All share one contract: given the current viewport and the set of
//! visible candidate tiles, produce `(to_load, to_cancel)` and keep the
//! inflight tracker consistent with the decision.

use qprism_common::types::{SchedulerVariant, Tile};

use crate::geometry::{ring_distance, Viewport};
use crate::scheduler::{FairnessGuard, InflightTracker};

/// Tiles farther than this from the viewport are not worth fetching,
/// and in-flight tiles farther than this are worth abandoning.
const MAX_LOAD_RING: u16 = 3;

pub trait SchedulePolicy: Send {
    /// Decide load/cancel actions for one frame. `candidates` is the
    /// currently visible set, in no significant order, and may contain
    /// tiles already in flight.
    fn schedule(&mut self, viewport: &Viewport, candidates: &[Tile]) -> (Vec<Tile>, Vec<Tile>);

    /// Record a terminal fetch outcome so the tracker holds exactly the
    /// tiles that are requested but not yet completed.
    fn on_completion(&mut self, tile: &Tile);

    /// Read-only view of the tracker for callers that need membership
    /// checks; the tracker stays owned by the policy.
    fn inflight(&self) -> &InflightTracker;
}

/// Build the scheduler for a variant; the `*_default` variants run
/// without one.
pub fn scheduler_for(variant: SchedulerVariant) -> Option<Box<dyn SchedulePolicy>> {
    match variant {
        SchedulerVariant::QprismFull => Some(Box::new(QprismScheduler::new())),
        SchedulerVariant::QprismPriorityOnly => Some(Box::new(PriorityOnlyScheduler::new())),
        SchedulerVariant::QprismCancelOnly => Some(Box::new(CancelOnlyScheduler::new())),
        SchedulerVariant::Http2Default | SchedulerVariant::Http3Default => None,
    }
}

fn filter_candidates(
    inflight: &InflightTracker,
    viewport: &Viewport,
    candidates: &[Tile],
) -> Vec<Tile> {
    candidates
        .iter()
        .filter(|tile| !inflight.is_in_flight(tile))
        .filter(|tile| ring_distance(tile, viewport) <= MAX_LOAD_RING)
        .copied()
        .collect()
}

fn cancel_pass(inflight: &mut InflightTracker, viewport: &Viewport) -> Vec<Tile> {
    let mut cancelled = Vec::new();
    for tile in inflight.snapshot() {
        if ring_distance(&tile, viewport) > MAX_LOAD_RING {
            inflight.cancel(&tile);
            cancelled.push(tile);
        }
    }
    cancelled
}

/// Ring-sorted loads, no cancellation.
#[derive(Debug, Default)]
pub struct PriorityOnlyScheduler {
    inflight: InflightTracker,
}

impl PriorityOnlyScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SchedulePolicy for PriorityOnlyScheduler {
    fn schedule(&mut self, viewport: &Viewport, candidates: &[Tile]) -> (Vec<Tile>, Vec<Tile>) {
        let mut to_load = filter_candidates(&self.inflight, viewport, candidates);
        to_load.sort_by_key(|tile| ring_distance(tile, viewport));
        for tile in &to_load {
            self.inflight.add(*tile);
        }
        (to_load, Vec::new())
    }

    fn on_completion(&mut self, tile: &Tile) {
        self.inflight.remove(tile);
    }

    fn inflight(&self) -> &InflightTracker {
        &self.inflight
    }
}

/// Stale-fetch cancellation, loads kept in candidate order.
#[derive(Debug, Default)]
pub struct CancelOnlyScheduler {
    inflight: InflightTracker,
}

impl CancelOnlyScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SchedulePolicy for CancelOnlyScheduler {
    fn schedule(&mut self, viewport: &Viewport, candidates: &[Tile]) -> (Vec<Tile>, Vec<Tile>) {
        let to_cancel = cancel_pass(&mut self.inflight, viewport);
        let to_load = filter_candidates(&self.inflight, viewport, candidates);
        for tile in &to_load {
            self.inflight.add(*tile);
        }
        (to_load, to_cancel)
    }

    fn on_completion(&mut self, tile: &Tile) {
        self.inflight.remove(tile);
    }

    fn inflight(&self) -> &InflightTracker {
        &self.inflight
    }
}

/// The full policy: cancellation plus ring-sorted loads with a bounded
/// fairness promotion.
#[derive(Debug, Default)]
pub struct QprismScheduler {
    inflight: InflightTracker,
    fairness: FairnessGuard,
}

impl QprismScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SchedulePolicy for QprismScheduler {
    fn schedule(&mut self, viewport: &Viewport, candidates: &[Tile]) -> (Vec<Tile>, Vec<Tile>) {
        let to_cancel = cancel_pass(&mut self.inflight, viewport);
        self.fairness.reset(to_cancel.iter());

        let mut to_load = filter_candidates(&self.inflight, viewport, candidates);
        to_load.sort_by_key(|tile| ring_distance(tile, viewport));
        self.fairness.promote(&mut to_load);

        for tile in &to_load {
            self.inflight.add(*tile);
        }
        self.fairness.reset(to_load.iter());
        (to_load, to_cancel)
    }

    fn on_completion(&mut self, tile: &Tile) {
        self.inflight.remove(tile);
    }

    fn inflight(&self) -> &InflightTracker {
        &self.inflight
    }
}
