//! Time-stamped viewport trajectories: loading, validation, and the
//! waypoint interpolator used to produce them.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// One centre-of-view sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TracePoint {
    pub t_ms: u64,
    pub lat: f64,
    pub lon: f64,
    pub zoom: u8,
}

/// Load a trace from a JSON array of `{t_ms, lat, lon, zoom}` records.
/// All four fields are required; the result is sorted ascending by
/// `t_ms`.
pub fn load_trace(path: &Path) -> Result<Vec<TracePoint>> {
    let file = File::open(path).with_context(|| format!("open trace file {}", path.display()))?;
    let mut trace: Vec<TracePoint> = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parse trace file {}", path.display()))?;
    trace.sort_by_key(|tp| tp.t_ms);
    Ok(trace)
}

pub fn save_trace(path: &Path, trace: &[TracePoint]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(trace)?;
    std::fs::write(path, json).with_context(|| format!("write trace file {}", path.display()))?;
    Ok(())
}

/// Interpolate a `(lon, lat)` waypoint path into a constant-rate trace.
/// `seconds_between` is the travel time between consecutive waypoints.
pub fn generate_trace(
    waypoints: &[(f64, f64)],
    zoom: u8,
    seconds_between: u64,
    fps: u32,
) -> Vec<TracePoint> {
    let mut frames = Vec::new();
    if waypoints.is_empty() || fps == 0 {
        return frames;
    }
    let ms_per_frame = 1000 / u64::from(fps);
    let steps = seconds_between * u64::from(fps);
    let mut t_ms = 0u64;

    for pair in waypoints.windows(2) {
        let (lon0, lat0) = pair[0];
        let (lon1, lat1) = pair[1];
        for i in 0..steps {
            let t = i as f64 / steps as f64;
            frames.push(TracePoint {
                t_ms,
                lat: lat0 + (lat1 - lat0) * t,
                lon: lon0 + (lon1 - lon0) * t,
                zoom,
            });
            t_ms += ms_per_frame;
        }
    }

    let (lon, lat) = *waypoints.last().unwrap();
    frames.push(TracePoint { t_ms, lat, lon, zoom });
    frames
}
