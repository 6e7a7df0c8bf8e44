//! Metrics for the experiment driver: request/completion counters and
//! fetch latency, labelled by ring. Facade calls only; no-ops unless a
//! recorder is installed.

use metrics::{counter, gauge, histogram};

pub fn tile_requested(ring: u8) {
    counter!("qprism_driver_tiles_requested_total", "ring" => ring.to_string()).increment(1);
}

pub fn tile_completed(ring: u8, bytes: u64, latency_ms: u64) {
    counter!("qprism_driver_tiles_completed_total", "ring" => ring.to_string()).increment(1);
    counter!("qprism_driver_bytes_transferred_total").increment(bytes);
    histogram!("qprism_driver_fetch_duration_ms", "ring" => ring.to_string())
        .record(latency_ms as f64);
}

pub fn tile_cancelled(ring: u8) {
    counter!("qprism_driver_tiles_cancelled_total", "ring" => ring.to_string()).increment(1);
}

pub fn fetch_failed(ring: u8) {
    counter!("qprism_driver_fetch_failures_total", "ring" => ring.to_string()).increment(1);
}

pub fn fetches_in_flight(count: usize) {
    gauge!("qprism_driver_fetches_in_flight").set(count as f64);
}
