//! Web Mercator slippy-tile geometry: viewport projection, visible-set
//! enumeration, and ring distance.

use anyhow::{ensure, Result};
use rustc_hash::FxHashSet;

use qprism_common::types::{Ring, Tile};

pub const TILE_SIZE_PX: f64 = 256.0;

/// Default client viewport in pixels.
pub const VIEWPORT_W_PX: u32 = 800;
pub const VIEWPORT_H_PX: u32 = 600;

/// Ring distance reported for a tile at a different zoom than the
/// viewport: not comparable, never loadable.
pub const RING_OTHER_ZOOM: u16 = 999;

/// The rectangle of tile coordinates on screen at a single zoom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub min_x: u32,
    pub max_x: u32,
    pub min_y: u32,
    pub max_y: u32,
    pub z: u8,
}

/// Fractional tile coordinates of a lat/lon at a zoom; `floor` gives the
/// containing tile.
pub fn latlon_to_tile(lat: f64, lon: f64, zoom: u8) -> (f64, f64) {
    let n = (1u64 << zoom) as f64;
    let fx = (lon + 180.0) / 360.0 * n;
    let lat_rad = lat.to_radians();
    let fy = (1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / std::f64::consts::PI) / 2.0 * n;
    (fx, fy)
}

/// Tiles visible in the default 800x600 viewport centred on a lat/lon.
pub fn visible_tile_coords(lat: f64, lon: f64, zoom: u8) -> FxHashSet<(u32, u32)> {
    visible_tile_coords_sized(lat, lon, zoom, VIEWPORT_W_PX, VIEWPORT_H_PX)
}

/// Tiles visible in a `w_px` x `h_px` viewport centred on a lat/lon.
///
/// `x` wraps modulo `2^z`; `y` is clamped to `[0, 2^z)` since the top
/// and bottom of the world are not tiled.
pub fn visible_tile_coords_sized(
    lat: f64,
    lon: f64,
    zoom: u8,
    w_px: u32,
    h_px: u32,
) -> FxHashSet<(u32, u32)> {
    let (fx, fy) = latlon_to_tile(lat, lon, zoom);
    let px = fx * TILE_SIZE_PX;
    let py = fy * TILE_SIZE_PX;
    let half_w = f64::from(w_px) / 2.0;
    let half_h = f64::from(h_px) / 2.0;

    let x_min = ((px - half_w) / TILE_SIZE_PX).floor() as i64;
    let x_max = ((px + half_w) / TILE_SIZE_PX).floor() as i64;
    let y_min = ((py - half_h) / TILE_SIZE_PX).floor() as i64;
    let y_max = ((py + half_h) / TILE_SIZE_PX).floor() as i64;

    let n = 1i64 << zoom;
    let mut visible = FxHashSet::default();
    for ty in y_min..=y_max {
        if ty < 0 || ty >= n {
            continue;
        }
        for tx in x_min..=x_max {
            visible.insert((tx.rem_euclid(n) as u32, ty as u32));
        }
    }
    visible
}

/// Chebyshev distance from a tile to the viewport rectangle, zero
/// inside; `RING_OTHER_ZOOM` when the zooms differ.
pub fn ring_distance(tile: &Tile, viewport: &Viewport) -> u16 {
    if tile.z != viewport.z {
        return RING_OTHER_ZOOM;
    }
    let dx = if tile.x < viewport.min_x {
        viewport.min_x - tile.x
    } else if tile.x > viewport.max_x {
        tile.x - viewport.max_x
    } else {
        0
    };
    let dy = if tile.y < viewport.min_y {
        viewport.min_y - tile.y
    } else if tile.y > viewport.max_y {
        tile.y - viewport.max_y
    } else {
        0
    };
    dx.max(dy).min(u32::from(u16::MAX)) as u16
}

pub fn ring_enum(tile: &Tile, viewport: &Viewport) -> Ring {
    Ring::from_distance(ring_distance(tile, viewport))
}

/// Tight bounding rectangle of a visible set.
pub fn viewport_from_visible(visible: &FxHashSet<(u32, u32)>, z: u8) -> Result<Viewport> {
    ensure!(!visible.is_empty(), "visible tile set is empty");
    let mut iter = visible.iter();
    let &(x0, y0) = iter.next().unwrap();
    let (mut min_x, mut max_x, mut min_y, mut max_y) = (x0, x0, y0, y0);
    for &(x, y) in iter {
        min_x = min_x.min(x);
        max_x = max_x.max(x);
        min_y = min_y.min(y);
        max_y = max_y.max(y);
    }
    Ok(Viewport {
        min_x,
        max_x,
        min_y,
        max_y,
        z,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equator_maps_to_tile_grid_center() {
        let (fx, fy) = latlon_to_tile(0.0, 0.0, 1);
        assert!((fx - 1.0).abs() < 1e-9);
        assert!((fy - 1.0).abs() < 1e-9);
    }

    #[test]
    fn antimeridian_wraps() {
        let (x_west, _) = latlon_to_tile(0.0, -180.0, 2);
        let (x_east, _) = latlon_to_tile(0.0, 180.0, 2);
        assert!((x_west - 0.0).abs() < 1e-9);
        assert!((x_east - 4.0).abs() < 1e-9);
        let n = 4i64;
        assert_eq!((x_west.floor() as i64).rem_euclid(n), (x_east.floor() as i64).rem_euclid(n));
    }

    #[test]
    fn visible_set_at_low_zoom() {
        let visible = visible_tile_coords(0.0, 0.0, 1);
        let expected: FxHashSet<(u32, u32)> =
            [(0, 0), (0, 1), (1, 0), (1, 1)].into_iter().collect();
        assert_eq!(visible, expected);
    }

    #[test]
    fn y_is_clamped_not_wrapped() {
        // near the mercator top, the viewport sticks off the tiled area
        let visible = visible_tile_coords(84.9, 0.0, 1);
        assert!(visible.iter().all(|&(_, y)| y < 2));
    }

    #[test]
    fn ring_distances_match_reference_viewport() {
        let viewport = Viewport {
            min_x: 4,
            max_x: 6,
            min_y: 4,
            max_y: 6,
            z: 10,
        };
        assert_eq!(ring_distance(&Tile::new(5, 5, 10), &viewport), 0);
        assert_eq!(ring_distance(&Tile::new(4, 5, 10), &viewport), 0);
        assert_eq!(ring_distance(&Tile::new(3, 5, 10), &viewport), 1);
        assert_eq!(ring_distance(&Tile::new(8, 6, 10), &viewport), 2);
        assert_eq!(ring_distance(&Tile::new(9, 6, 10), &viewport), 3);
        assert_eq!(ring_distance(&Tile::new(5, 5, 9), &viewport), RING_OTHER_ZOOM);
    }

    #[test]
    fn ring_zero_iff_inside() {
        let viewport = Viewport {
            min_x: 4,
            max_x: 6,
            min_y: 4,
            max_y: 6,
            z: 10,
        };
        for x in 0..12 {
            for y in 0..12 {
                let inside = (4..=6).contains(&x) && (4..=6).contains(&y);
                let d = ring_distance(&Tile::new(x, y, 10), &viewport);
                assert_eq!(d == 0, inside, "tile ({x}, {y})");
            }
        }
    }

    #[test]
    fn bounding_viewport_is_tight() {
        let visible: FxHashSet<(u32, u32)> =
            [(4, 7), (5, 5), (6, 6)].into_iter().collect();
        let viewport = viewport_from_visible(&visible, 9).unwrap();
        assert_eq!(
            viewport,
            Viewport {
                min_x: 4,
                max_x: 6,
                min_y: 5,
                max_y: 7,
                z: 9
            }
        );
        assert!(viewport_from_visible(&FxHashSet::default(), 9).is_err());
    }
}
