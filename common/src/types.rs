use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A 256x256 web-mercator square addressed by `(z, x, y)`.
///
/// Value type; equality and hashing are structural.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tile {
    pub x: u32,
    pub y: u32,
    pub z: u8,
}

/// Map key for per-tile tables, `(z, x, y)`.
pub type TileKey = (u8, u32, u32);

impl Tile {
    pub fn new(x: u32, y: u32, z: u8) -> Self {
        Self { x, y, z }
    }

    pub fn key(&self) -> TileKey {
        (self.z, self.x, self.y)
    }

    /// The `"{x}_{y}"` identifier used in request/completion events.
    pub fn id(&self) -> String {
        format!("{}_{}", self.x, self.y)
    }
}

impl fmt::Display for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tile({}, {}, z={})", self.x, self.y, self.z)
    }
}

/// Parse a `"{x}_{y}"` tile identifier back into coordinates.
pub fn parse_tile_id(id: &str) -> Option<(u32, u32)> {
    let (x, y) = id.split_once('_')?;
    Some((x.parse().ok()?, y.parse().ok()?))
}

/// Chebyshev distance from a tile to the viewport, clamped to 0..3.
///
/// Derived at request time only; never stored on the tile itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Ring {
    R0 = 0,
    R1 = 1,
    R2 = 2,
    R3 = 3,
}

impl Ring {
    /// Clamp a raw ring distance (including the 999 zoom-mismatch
    /// sentinel) into the bounded ordinal.
    pub fn from_distance(distance: u16) -> Self {
        match distance {
            0 => Ring::R0,
            1 => Ring::R1,
            2 => Ring::R2,
            _ => Ring::R3,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Tile-delivery strategy under comparison.
///
/// The two `*_default` variants run without a scheduler: every visible,
/// not-yet-requested tile is fetched and nothing is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerVariant {
    Http2Default,
    Http3Default,
    QprismFull,
    QprismPriorityOnly,
    QprismCancelOnly,
}

impl SchedulerVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerVariant::Http2Default => "http2_default",
            SchedulerVariant::Http3Default => "http3_default",
            SchedulerVariant::QprismFull => "qprism_full",
            SchedulerVariant::QprismPriorityOnly => "qprism_priority_only",
            SchedulerVariant::QprismCancelOnly => "qprism_cancel_only",
        }
    }
}

impl FromStr for SchedulerVariant {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http2_default" => Ok(SchedulerVariant::Http2Default),
            "http3_default" => Ok(SchedulerVariant::Http3Default),
            "qprism_full" => Ok(SchedulerVariant::QprismFull),
            "qprism_priority_only" => Ok(SchedulerVariant::QprismPriorityOnly),
            "qprism_cancel_only" => Ok(SchedulerVariant::QprismCancelOnly),
            other => Err(anyhow::anyhow!("unknown scheduler variant: {other}")),
        }
    }
}

impl fmt::Display for SchedulerVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emitted when the scheduler admits a fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct TileRequest {
    pub tile_id: String,
    pub zoom: u8,
    pub ring: Ring,
    pub requested_at_ms: u64,
    pub deadline_ms: Option<u64>,
}

/// Terminal event, emitted exactly once per `TileRequest`.
///
/// `cancelled == true` implies `bytes_transferred == 0`.
#[derive(Debug, Clone, PartialEq)]
pub struct TileCompletion {
    pub tile_id: String,
    pub zoom: u8,
    pub ring: Ring,
    pub requested_at_ms: u64,
    pub completed_at_ms: u64,
    pub cancelled: bool,
    pub bytes_transferred: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_id_round_trips() {
        let tile = Tile::new(1205, 1539, 12);
        assert_eq!(tile.id(), "1205_1539");
        assert_eq!(parse_tile_id(&tile.id()), Some((1205, 1539)));
        assert_eq!(parse_tile_id("nonsense"), None);
        assert_eq!(parse_tile_id("12_"), None);
    }

    #[test]
    fn ring_clamps_to_r3() {
        assert_eq!(Ring::from_distance(0), Ring::R0);
        assert_eq!(Ring::from_distance(3), Ring::R3);
        assert_eq!(Ring::from_distance(4), Ring::R3);
        assert_eq!(Ring::from_distance(999), Ring::R3);
    }

    #[test]
    fn variant_strings_round_trip() {
        for name in [
            "http2_default",
            "http3_default",
            "qprism_full",
            "qprism_priority_only",
            "qprism_cancel_only",
        ] {
            let variant: SchedulerVariant = name.parse().unwrap();
            assert_eq!(variant.as_str(), name);
        }
        assert!("qprism".parse::<SchedulerVariant>().is_err());
    }
}
