//! # Level-of-Detail Conversions
//!
//! Query parameters express scale as a map *resolution* (ground meters per
//! pixel at the equator, web-mercator convention); storage expresses it as an
//! integer *LOD* — the tile zoom level at which a feature becomes eligible
//! for display. These helpers convert between the two.
//!
//! Zoom level 0 covers the full world in one 256px tile, giving the base
//! resolution below. Each level halves the resolution.

/// Ground resolution of web-mercator zoom level 0, in meters per pixel.
const LEVEL_0_RESOLUTION: f64 = 156_543.034;

/// Returns the tile zoom level whose resolution is closest to (at or finer
/// than) `resolution`.
///
/// Resolutions coarser than level 0 clamp to 0; non-finite or non-positive
/// input also maps to 0 so a degenerate filter never excludes everything.
pub fn tile_level(resolution: f64) -> i32 {
    if !resolution.is_finite() || resolution <= 0.0 {
        return 0;
    }
    let level = (LEVEL_0_RESOLUTION / resolution).log2();
    if level <= 0.0 {
        0
    } else {
        level.ceil() as i32
    }
}

/// Returns the ground resolution, in meters per pixel, of tile zoom `level`.
pub fn tile_resolution(level: i32) -> f64 {
    LEVEL_0_RESOLUTION / f64::powi(2.0, level.max(0))
}
