use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use qprism_engine::trace::{generate_trace, save_trace};

/// Generate the reference viewport traces from waypoint paths.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory the trace JSON files are written into
    #[arg(long, default_value = "data/traces")]
    out_dir: PathBuf,

    /// Seconds of travel between consecutive waypoints
    #[arg(long, default_value_t = 3)]
    seconds_between: u64,

    /// Viewport samples per second
    #[arg(long, default_value_t = 10)]
    fps: u32,
}

struct WaypointTrace {
    name: &'static str,
    zoom: u8,
    /// `(lon, lat)` pairs.
    waypoints: &'static [(f64, f64)],
}

/// National Mall drive at street zoom.
const DC_TRACE: WaypointTrace = WaypointTrace {
    name: "dc_trace",
    zoom: 14,
    waypoints: &[
        (-77.0559, 38.8893),
        (-77.0423, 38.8899),
        (-77.0352, 38.8895),
        (-77.0199, 38.8893),
        (-77.0091, 38.8899),
    ],
};

/// Short campus walk at building zoom.
const LU_TRACE: WaypointTrace = WaypointTrace {
    name: "lu_trace",
    zoom: 17,
    waypoints: &[
        (-79.18345, 37.35031),
        (-79.18219, 37.34951),
        (-79.18034, 37.34874),
        (-79.17743, 37.35030),
        (-79.17603, 37.35096),
    ],
};

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    for trace in [&LU_TRACE, &DC_TRACE] {
        let frames = generate_trace(trace.waypoints, trace.zoom, cli.seconds_between, cli.fps);
        let path = cli.out_dir.join(format!("{}.json", trace.name));
        save_trace(&path, &frames)?;
        tracing::info!(frames = frames.len(), path = %path.display(), "trace written");
    }
    Ok(())
}
