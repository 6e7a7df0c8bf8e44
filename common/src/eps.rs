//! RFC 9218 Extensible Priorities for tile responses.
//!
//! Ring distance maps straight onto the urgency scale (R0 -> u=0, most
//! urgent). Only R0 tiles are flagged incremental so the on-screen area
//! paints progressively; everything else is delivered atomically.

use crate::types::Ring;

/// HTTP Priority header fields: urgency 0 (highest) to 7 (lowest), plus
/// the incremental flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpsPriority {
    pub urgency: u8,
    pub incremental: bool,
}

pub const DEFAULT_URGENCY: u8 = 7;

pub fn eps_from_ring(ring: Ring) -> EpsPriority {
    EpsPriority {
        urgency: ring.as_u8().min(7),
        incremental: ring == Ring::R0,
    }
}

impl EpsPriority {
    /// Serialise to the `priority` header value, e.g. `u=0, i` or `u=3`.
    pub fn header_value(&self) -> String {
        if self.incremental {
            format!("u={}, i", self.urgency)
        } else {
            format!("u={}", self.urgency)
        }
    }
}

/// Pull the urgency out of a `priority` header value.
///
/// Takes the first `u=<int>` token (comma-separated, whitespace-trimmed)
/// clamped to `0..=7`; anything absent or unparsable falls back to the
/// default urgency 7.
pub fn parse_urgency(value: &str) -> u8 {
    for part in value.split(',') {
        let part = part.trim();
        if let Some(raw) = part.strip_prefix("u=") {
            if let Ok(u) = raw.trim().parse::<i64>() {
                return u.clamp(0, 7) as u8;
            }
        }
    }
    DEFAULT_URGENCY
}
