//! Metrics for the tile transport layer.
//!
//! Counters and gauges for request admission, served bytes, and
//! mid-stream cancellations. These are facade calls only; they are
//! no-ops unless the hosting binary installs a recorder.

use metrics::{counter, gauge, histogram};

/// Record a request admitted to the prioritised queue.
pub fn request_admitted(urgency: u8) {
    counter!("qprism_requests_admitted_total", "urgency" => urgency.to_string()).increment(1);
}

/// Record a request rejected before any tile lookup.
pub fn request_rejected(reason: &'static str) {
    counter!("qprism_requests_rejected_total", "reason" => reason).increment(1);
}

/// Record a tile body fully sent.
pub fn tile_served(zoom: u8, size_bytes: usize) {
    counter!("qprism_tiles_served_total", "zoom" => zoom.to_string()).increment(1);
    histogram!("qprism_tile_size_bytes", "zoom" => zoom.to_string()).record(size_bytes as f64);
}

/// Record a tile lookup that produced no bytes.
pub fn tile_not_found(zoom: u8) {
    counter!("qprism_tiles_not_found_total", "zoom" => zoom.to_string()).increment(1);
}

/// Record a send abandoned because the peer reset the stream.
pub fn tile_send_cancelled(zoom: u8) {
    counter!("qprism_tile_sends_cancelled_total", "zoom" => zoom.to_string()).increment(1);
}

/// Set the current depth of a connection's admission queue.
pub fn admission_queue_depth(depth: usize) {
    gauge!("qprism_admission_queue_depth").set(depth as f64);
}
