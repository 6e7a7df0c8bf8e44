//! Per-run quality metrics derived from the results database:
//! time-to-first-viewport, stall time, tail latency, cancellation rate,
//! and the anti-starvation check, plus cross-run aggregation.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use rusqlite::Connection;

pub const TTFV_THRESHOLD: f64 = 0.96;
pub const STALL_THRESHOLD: f64 = 0.98;
pub const STALL_DEBOUNCE_MS: u64 = 100;

/// Milliseconds until the viewport first reaches the completeness
/// threshold, relative to `motion_start_ms`. `None` if it never does.
pub fn time_to_first_viewport(
    samples: &[(u64, f64)],
    threshold: f64,
    motion_start_ms: u64,
) -> Option<u64> {
    let mut sorted: Vec<&(u64, f64)> = samples.iter().collect();
    sorted.sort_by_key(|(t, _)| *t);
    sorted
        .iter()
        .find(|(t, comp)| *t >= motion_start_ms && *comp >= threshold)
        .map(|(t, _)| t - motion_start_ms)
}

/// Total milliseconds the viewport spent below the stall threshold.
/// Dips shorter than `debounce_ms` are ignored.
pub fn viewport_stall_ms(samples: &[(u64, f64)], threshold: f64, debounce_ms: u64) -> u64 {
    let mut sorted: Vec<&(u64, f64)> = samples.iter().collect();
    sorted.sort_by_key(|(t, _)| *t);

    let mut total = 0u64;
    let mut stall_start: Option<u64> = None;
    for (t, comp) in sorted {
        match (stall_start, *comp < threshold) {
            (None, true) => stall_start = Some(*t),
            (Some(start), false) => {
                let len = t - start;
                if len >= debounce_ms {
                    total += len;
                }
                stall_start = None;
            }
            _ => {}
        }
    }
    total
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Percentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Linear-interpolated latency percentiles; zeros when empty.
pub fn latency_percentiles(latencies_ms: &[f64]) -> Percentiles {
    let mut values: Vec<f64> = latencies_ms.to_vec();
    values.sort_by(|a, b| a.total_cmp(b));
    Percentiles {
        p50: percentile(&values, 50.0),
        p95: percentile(&values, 95.0),
        p99: percentile(&values, 99.0),
    }
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let k = (sorted.len() - 1) as f64 * (p / 100.0);
    let f = k.floor() as usize;
    let c = (f + 1).min(sorted.len() - 1);
    if f == c {
        return sorted[f];
    }
    sorted[f] * (c as f64 - k) + sorted[c] * (k - f as f64)
}

pub fn cancel_ratio(requests: usize, cancelled: usize) -> f64 {
    if requests == 0 {
        0.0
    } else {
        cancelled as f64 / requests as f64
    }
}

/// Fraction of R0 service windows `(requested_at, completed_at)` during
/// which at least one non-R0 tile completed. 1.0 means priority service
/// never starved the lower rings outright.
pub fn fairness_progress_rate(r0_windows: &[(u64, u64)], non_r0_completions: &[u64]) -> f64 {
    if r0_windows.is_empty() {
        return 1.0;
    }
    let fed = r0_windows
        .iter()
        .filter(|(start, end)| {
            non_r0_completions
                .iter()
                .any(|t| t >= start && t <= end)
        })
        .count();
    fed as f64 / r0_windows.len() as f64
}

/// Everything we report for one run.
#[derive(Debug, Clone)]
pub struct RunMetrics {
    pub run_id: i64,
    pub ttfv_ms: Option<u64>,
    pub stall_ms: u64,
    pub latency: Percentiles,
    pub cancel_ratio: f64,
    pub fairness_rate: f64,
}

pub fn compute_run_metrics(conn: &Connection, run_id: i64) -> Result<RunMetrics> {
    let mut stmt = conn
        .prepare("SELECT ts_ms, completeness FROM viewport_samples WHERE run_id = ?1")
        .context("query viewport samples")?;
    let samples: Vec<(u64, f64)> = stmt
        .query_map([run_id], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<std::result::Result<_, _>>()?;

    let request_count: usize = conn.query_row(
        "SELECT count(*) FROM tile_requests WHERE run_id = ?1",
        [run_id],
        |r| r.get::<_, i64>(0).map(|n| n as usize),
    )?;

    let mut stmt = conn
        .prepare(
            "SELECT ring, requested_at, completed_at, cancelled \
             FROM tile_completions WHERE run_id = ?1",
        )
        .context("query tile completions")?;
    let completions: Vec<(u8, u64, u64, bool)> = stmt
        .query_map([run_id], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })?
        .collect::<std::result::Result<_, _>>()?;

    let latencies: Vec<f64> = completions
        .iter()
        .filter(|(_, _, _, cancelled)| !cancelled)
        .map(|(_, req, comp, _)| comp.saturating_sub(*req) as f64)
        .collect();
    let cancelled = completions.iter().filter(|(_, _, _, c)| *c).count();

    let r0_windows: Vec<(u64, u64)> = completions
        .iter()
        .filter(|(ring, _, _, cancelled)| *ring == 0 && !cancelled)
        .map(|(_, req, comp, _)| (*req, *comp))
        .collect();
    let non_r0: Vec<u64> = completions
        .iter()
        .filter(|(ring, _, _, cancelled)| *ring > 0 && !cancelled)
        .map(|(_, _, comp, _)| *comp)
        .collect();

    Ok(RunMetrics {
        run_id,
        ttfv_ms: time_to_first_viewport(&samples, TTFV_THRESHOLD, 0),
        stall_ms: viewport_stall_ms(&samples, STALL_THRESHOLD, STALL_DEBOUNCE_MS),
        latency: latency_percentiles(&latencies),
        cancel_ratio: cancel_ratio(request_count, cancelled),
        fairness_rate: fairness_progress_rate(&r0_windows, &non_r0),
    })
}

#[derive(Debug, Clone, Copy)]
pub struct Summary {
    pub mean: f64,
    pub stdev: f64,
    pub count: usize,
}

/// Aggregate per-run metrics into `metric -> (mean, stdev, count)`.
/// Runs that never reached the viewport threshold are excluded from the
/// `ttfv_ms` row only.
pub fn aggregate_metrics(metrics: &[RunMetrics]) -> BTreeMap<&'static str, Summary> {
    let mut columns: BTreeMap<&'static str, Vec<f64>> = BTreeMap::new();
    for m in metrics {
        if let Some(ttfv) = m.ttfv_ms {
            columns.entry("ttfv_ms").or_default().push(ttfv as f64);
        }
        columns.entry("stall_ms").or_default().push(m.stall_ms as f64);
        columns.entry("latency_p50_ms").or_default().push(m.latency.p50);
        columns.entry("latency_p95_ms").or_default().push(m.latency.p95);
        columns.entry("latency_p99_ms").or_default().push(m.latency.p99);
        columns.entry("cancel_ratio").or_default().push(m.cancel_ratio);
        columns.entry("fairness_rate").or_default().push(m.fairness_rate);
    }

    columns
        .into_iter()
        .map(|(name, values)| (name, summarise(&values)))
        .collect()
}

fn summarise(values: &[f64]) -> Summary {
    let count = values.len();
    if count == 0 {
        return Summary {
            mean: 0.0,
            stdev: 0.0,
            count: 0,
        };
    }
    let mean = values.iter().sum::<f64>() / count as f64;
    let stdev = if count > 1 {
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count - 1) as f64;
        var.sqrt()
    } else {
        0.0
    };
    Summary { mean, stdev, count }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttfv_finds_first_threshold_crossing() {
        let samples = vec![(0, 0.5), (100, 0.99)];
        assert_eq!(time_to_first_viewport(&samples, 0.96, 0), Some(100));
        assert_eq!(time_to_first_viewport(&samples, 0.96, 50), Some(50));
        assert_eq!(time_to_first_viewport(&samples, 0.999, 0), None);
    }

    #[test]
    fn stall_time_spans_below_threshold_intervals() {
        let samples = vec![(0, 1.0), (50, 0.0), (200, 1.0)];
        assert_eq!(viewport_stall_ms(&samples, 0.98, 100), 150);
        // a dip shorter than the debounce window is noise
        let blip = vec![(0, 1.0), (50, 0.0), (90, 1.0)];
        assert_eq!(viewport_stall_ms(&blip, 0.98, 100), 0);
        // an unrecovered stall at the end of the series is not counted
        let tail = vec![(0, 1.0), (50, 0.0)];
        assert_eq!(viewport_stall_ms(&tail, 0.98, 100), 0);
    }

    #[test]
    fn percentiles_interpolate() {
        let lat = [10.0, 20.0, 30.0, 40.0, 50.0];
        let p = latency_percentiles(&lat);
        assert_eq!(p.p50, 30.0);
        assert!((p.p95 - 48.0).abs() < 1e-9);
        assert!((p.p99 - 49.6).abs() < 1e-9);
        assert_eq!(latency_percentiles(&[]).p95, 0.0);
    }

    #[test]
    fn cancel_ratio_handles_empty_runs() {
        assert_eq!(cancel_ratio(10, 2), 0.2);
        assert_eq!(cancel_ratio(0, 0), 0.0);
    }

    #[test]
    fn fairness_rate_counts_fed_windows() {
        let r0 = [(0, 100), (200, 300)];
        assert_eq!(fairness_progress_rate(&r0, &[50, 250, 400]), 1.0);
        assert_eq!(fairness_progress_rate(&r0, &[150, 400]), 0.0);
        assert_eq!(fairness_progress_rate(&r0, &[250]), 0.5);
        assert_eq!(fairness_progress_rate(&[], &[1]), 1.0);
    }

    #[test]
    fn aggregation_reports_mean_and_spread() {
        let runs = vec![
            RunMetrics {
                run_id: 1,
                ttfv_ms: Some(100),
                stall_ms: 50,
                latency: latency_percentiles(&[10.0, 20.0]),
                cancel_ratio: 0.1,
                fairness_rate: 1.0,
            },
            RunMetrics {
                run_id: 2,
                ttfv_ms: None,
                stall_ms: 150,
                latency: latency_percentiles(&[30.0, 40.0]),
                cancel_ratio: 0.3,
                fairness_rate: 0.5,
            },
        ];
        let summary = aggregate_metrics(&runs);
        assert_eq!(summary["ttfv_ms"].count, 1);
        assert_eq!(summary["stall_ms"].count, 2);
        assert!((summary["stall_ms"].mean - 100.0).abs() < 1e-9);
        assert!((summary["cancel_ratio"].mean - 0.2).abs() < 1e-9);
        assert!(summary["stall_ms"].stdev > 0.0);
    }
}
