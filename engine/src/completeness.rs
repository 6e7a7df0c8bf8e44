//! Viewport completeness: what fraction of the tiles the user currently
//! needs has actually arrived.

use rustc_hash::FxHashSet;

use qprism_common::types::{parse_tile_id, Ring, Tile, TileCompletion, TileKey, TileRequest};

use crate::geometry::{latlon_to_tile, visible_tile_coords};
use crate::trace::TracePoint;

/// `(ts_ms, completeness)` sample.
pub type CompletenessSample = (u64, f64);

/// Derive the per-frame tile requests a client walking this trace would
/// issue: each frame requests the newly visible tiles, each `(z, x, y)`
/// at most once, rings taken from the Chebyshev distance to the centre
/// tile at request time.
pub fn generate_tile_requests(trace: &[TracePoint]) -> Vec<TileRequest> {
    let mut requests = Vec::new();
    let mut requested: FxHashSet<TileKey> = FxHashSet::default();
    let mut prev_visible: FxHashSet<(u32, u32)> = FxHashSet::default();

    for (i, tp) in trace.iter().enumerate() {
        let visible = visible_tile_coords(tp.lat, tp.lon, tp.zoom);
        let mut new_tiles: Vec<(u32, u32)> = if i == 0 {
            visible.iter().copied().collect()
        } else {
            visible.difference(&prev_visible).copied().collect()
        };
        new_tiles.sort_unstable();

        let (fx, fy) = latlon_to_tile(tp.lat, tp.lon, tp.zoom);
        let cx = fx.floor() as i64;
        let cy = fy.floor() as i64;

        for (tx, ty) in new_tiles {
            let key = (tp.zoom, tx, ty);
            if !requested.insert(key) {
                continue;
            }
            let dx = (i64::from(tx) - cx).unsigned_abs();
            let dy = (i64::from(ty) - cy).unsigned_abs();
            let dist = dx.max(dy).min(u64::from(u16::MAX)) as u16;
            requests.push(TileRequest {
                tile_id: Tile::new(tx, ty, tp.zoom).id(),
                zoom: tp.zoom,
                ring: Ring::from_distance(dist),
                requested_at_ms: tp.t_ms,
                deadline_ms: None,
            });
        }
        prev_visible = visible;
    }

    requests.sort_by_key(|r| r.requested_at_ms);
    requests
}

/// Fold a completion stream over a trace into a completeness series.
///
/// Within one trace interval every non-cancelled completion that lands
/// in the current `needed` set raises the fraction and emits a sample.
/// Each viewport change recomputes `needed`, drops loaded tiles that are
/// no longer needed, and emits a sample, so the series is non-decreasing
/// between changes and may step down at them. An empty `needed` set
/// reports completeness 1.0.
pub fn compute_completeness(
    trace: &[TracePoint],
    completions: &[TileCompletion],
) -> Vec<CompletenessSample> {
    let mut series = Vec::new();
    if trace.is_empty() {
        return series;
    }

    let mut completions: Vec<&TileCompletion> = completions.iter().collect();
    completions.sort_by_key(|tc| tc.completed_at_ms);

    let mut needed = needed_for(&trace[0]);
    let mut loaded: FxHashSet<TileKey> = FxHashSet::default();
    series.push((trace[0].t_ms, fraction(&loaded, &needed)));

    let mut comp_idx = 0;
    for v_idx in 1..=trace.len() {
        let next_view_time = trace.get(v_idx).map(|tp| tp.t_ms);

        while comp_idx < completions.len()
            && next_view_time.map_or(true, |t| completions[comp_idx].completed_at_ms <= t)
        {
            let tc = completions[comp_idx];
            comp_idx += 1;
            if tc.cancelled {
                continue;
            }
            let Some((tx, ty)) = parse_tile_id(&tc.tile_id) else {
                continue;
            };
            let key = (tc.zoom, tx, ty);
            if needed.contains(&key) && loaded.insert(key) {
                series.push((tc.completed_at_ms, fraction(&loaded, &needed)));
            }
        }

        if let Some(tp) = trace.get(v_idx) {
            needed = needed_for(tp);
            loaded.retain(|key| needed.contains(key));
            series.push((tp.t_ms, fraction(&loaded, &needed)));
        }
    }

    series
}

fn needed_for(tp: &TracePoint) -> FxHashSet<TileKey> {
    visible_tile_coords(tp.lat, tp.lon, tp.zoom)
        .into_iter()
        .map(|(x, y)| (tp.zoom, x, y))
        .collect()
}

fn fraction(loaded: &FxHashSet<TileKey>, needed: &FxHashSet<TileKey>) -> f64 {
    if needed.is_empty() {
        1.0
    } else {
        loaded.len() as f64 / needed.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_trace() -> Vec<TracePoint> {
        vec![
            TracePoint {
                t_ms: 0,
                lat: 0.0,
                lon: 0.0,
                zoom: 12,
            },
            TracePoint {
                t_ms: 2000,
                lat: 0.0,
                lon: 90.0,
                zoom: 12,
            },
            TracePoint {
                t_ms: 3000,
                lat: -75.0,
                lon: 90.0,
                zoom: 12,
            },
        ]
    }

    fn complete_after(requests: &[TileRequest], delay_ms: u64) -> Vec<TileCompletion> {
        requests
            .iter()
            .map(|req| TileCompletion {
                tile_id: req.tile_id.clone(),
                zoom: req.zoom,
                ring: req.ring,
                requested_at_ms: req.requested_at_ms,
                completed_at_ms: req.requested_at_ms + delay_ms,
                cancelled: false,
                bytes_transferred: 1024,
            })
            .collect()
    }

    #[test]
    fn requests_cover_each_tile_once() {
        let trace = reference_trace();
        let requests = generate_tile_requests(&trace);

        let times: FxHashSet<u64> = requests.iter().map(|r| r.requested_at_ms).collect();
        assert!(times.contains(&0) && times.contains(&2000));

        let mut seen = FxHashSet::default();
        for req in &requests {
            assert_eq!(req.zoom, 12);
            assert!(seen.insert((req.zoom, req.tile_id.clone())));
        }
        // first frame is a full 800x600 viewport at z=12: 4x4 tiles
        assert_eq!(
            requests.iter().filter(|r| r.requested_at_ms == 0).count(),
            16
        );
    }

    #[test]
    fn completeness_tracks_loads_and_viewport_changes() {
        let trace = reference_trace();
        let requests = generate_tile_requests(&trace);
        let completions = complete_after(&requests, 1000);

        let series = compute_completeness(&trace, &completions);

        // the run starts empty
        assert_eq!(series[0], (0, 0.0));
        // the first completion lands at t=1000 with 1 of 16 tiles loaded
        let first_at_1000 = series.iter().find(|(t, _)| *t == 1000).unwrap();
        assert!((first_at_1000.1 - 0.0625).abs() < 1e-9);
        // the viewport jump at t=2000 shares no tiles with frame 0
        let at_2000 = series.iter().find(|(t, _)| *t == 2000).unwrap();
        assert_eq!(at_2000.1, 0.0);
    }

    #[test]
    fn series_is_monotonic_between_viewport_changes() {
        let trace = reference_trace();
        let requests = generate_tile_requests(&trace);
        let completions = complete_after(&requests, 700);

        let series = compute_completeness(&trace, &completions);
        let change_times: FxHashSet<u64> = trace.iter().map(|tp| tp.t_ms).collect();

        for pair in series.windows(2) {
            let ((_, prev), (t, next)) = (pair[0], pair[1]);
            assert!((0.0..=1.0).contains(&next));
            if !change_times.contains(&t) {
                assert!(next >= prev, "series must not decrease at t={t}");
            }
        }
    }

    #[test]
    fn cancelled_completions_never_count() {
        let trace = reference_trace();
        let requests = generate_tile_requests(&trace);
        let mut completions = complete_after(&requests, 500);
        for tc in &mut completions {
            tc.cancelled = true;
            tc.bytes_transferred = 0;
        }

        let series = compute_completeness(&trace, &completions);
        assert!(series.iter().all(|(_, frac)| *frac == 0.0));
    }
}
