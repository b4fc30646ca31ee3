//! # Domain Types
//!
//! Core value types for the feature store: geometries (as envelope-prefixed
//! opaque payloads), styles, feature and feature set records, and the query
//! parameter structures consumed by the query compiler.
//!
//! Geometry and style *interpretation* is the business of the rendering
//! layers; this crate stores and filters them. A [`Geometry`] therefore
//! carries only what the store itself needs: a bounding envelope for spatial
//! predicates plus the encoded payload it hands back untouched.

use std::collections::HashSet;

use crate::attrs::AttributeSet;

// =============================================================================
// Field selection masks
// =============================================================================
// Queries can exclude expensive columns from the select list. Bits follow the
// "ignored fields" convention: a set bit means the field is NOT fetched and
// the corresponding accessor returns None.

/// Skip the feature name column.
pub const FIELD_NAME: u32 = 0x01;
/// Skip the geometry column.
pub const FIELD_GEOMETRY: u32 = 0x02;
/// Skip the style join and column.
pub const FIELD_STYLE: u32 = 0x04;
/// Skip the attributes join and column.
pub const FIELD_ATTRIBUTES: u32 = 0x08;
/// Skip the altitude mode and extrude columns.
pub const FIELD_ALTITUDE: u32 = 0x10;

pub(crate) fn has_bits(value: u32, bits: u32) -> bool {
    (value & bits) == bits
}

// =============================================================================
// Geometry
// =============================================================================

/// An axis-aligned bounding box in map coordinates (longitude/latitude).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Envelope {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Envelope {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x: min_x.min(max_x),
            min_y: min_y.min(max_y),
            max_x: min_x.max(max_x),
            max_y: min_y.max(max_y),
        }
    }

    /// A degenerate envelope covering a single point.
    pub fn point(x: f64, y: f64) -> Self {
        Self {
            min_x: x,
            min_y: y,
            max_x: x,
            max_y: y,
        }
    }

    pub fn intersects(&self, other: &Envelope) -> bool {
        self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_x + self.max_x) / 2.0,
            (self.min_y + self.max_y) / 2.0,
        )
    }
}

/// A vector geometry: bounding envelope plus the encoded payload (WKB or any
/// other coding the producing layer chose).
///
/// The stored blob layout is the envelope as four big-endian `f64`s followed
/// by the payload bytes; the registered spatial SQL functions only ever read
/// the 32-byte envelope prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    envelope: Envelope,
    payload: Vec<u8>,
}

/// Byte length of the envelope prefix on a stored geometry blob.
pub(crate) const ENVELOPE_PREFIX_LEN: usize = 32;

impl Geometry {
    pub fn new(envelope: Envelope, payload: Vec<u8>) -> Self {
        Self { envelope, payload }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Serializes to the stored blob form.
    pub fn to_blob(&self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(ENVELOPE_PREFIX_LEN + self.payload.len());
        blob.extend_from_slice(&self.envelope.min_x.to_be_bytes());
        blob.extend_from_slice(&self.envelope.min_y.to_be_bytes());
        blob.extend_from_slice(&self.envelope.max_x.to_be_bytes());
        blob.extend_from_slice(&self.envelope.max_y.to_be_bytes());
        blob.extend_from_slice(&self.payload);
        blob
    }

    /// Parses the stored blob form.
    pub fn from_blob(blob: &[u8]) -> crate::Result<Self> {
        let envelope = envelope_from_blob(blob)?;
        Ok(Self {
            envelope,
            payload: blob[ENVELOPE_PREFIX_LEN..].to_vec(),
        })
    }
}

/// Reads the envelope prefix off a stored geometry blob.
pub(crate) fn envelope_from_blob(blob: &[u8]) -> crate::Result<Envelope> {
    if blob.len() < ENVELOPE_PREFIX_LEN {
        return Err(crate::Error::Io(format!(
            "geometry blob too short: {} bytes",
            blob.len()
        )));
    }
    let f = |i: usize| {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&blob[i * 8..i * 8 + 8]);
        f64::from_be_bytes(buf)
    };
    Ok(Envelope {
        min_x: f(0),
        min_y: f(1),
        max_x: f(2),
        max_y: f(3),
    })
}

// =============================================================================
// Style
// =============================================================================

/// An encoded feature style.
///
/// Stored and compared as opaque text (OGR style-string convention); styles
/// with identical encodings are interned to a single row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Style(String);

impl Style {
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    pub fn encoded(&self) -> &str {
        &self.0
    }
}

// =============================================================================
// Altitude
// =============================================================================

/// How a feature's geometry relates to terrain elevation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AltitudeMode {
    #[default]
    ClampToGround,
    Relative,
    Absolute,
}

impl AltitudeMode {
    pub(crate) fn code(self) -> i32 {
        match self {
            AltitudeMode::ClampToGround => 0,
            AltitudeMode::Relative => 1,
            AltitudeMode::Absolute => 2,
        }
    }

    pub(crate) fn from_code(code: i32) -> Self {
        match code {
            1 => AltitudeMode::Relative,
            2 => AltitudeMode::Absolute,
            _ => AltitudeMode::ClampToGround,
        }
    }
}

// =============================================================================
// Records
// =============================================================================

/// A fully materialized feature row.
///
/// Fields excluded by the query's ignored-fields mask are `None`.
#[derive(Debug, Clone)]
pub struct Feature {
    pub id: i64,
    pub feature_set_id: i64,
    pub version: i64,
    pub name: Option<String>,
    pub geometry: Option<Geometry>,
    pub style: Option<Style>,
    pub attributes: Option<AttributeSet>,
    pub altitude_mode: AltitudeMode,
    pub extrude: f64,
}

/// A feature set: a named layer grouping features, with its own visibility
/// and LOD-range defaults.
#[derive(Debug, Clone)]
pub struct FeatureSet {
    pub id: i64,
    pub name: String,
    pub provider: String,
    pub type_name: String,
    pub min_lod: i32,
    pub max_lod: i32,
    pub visible: bool,
    /// Read-only sets reject content mutations (feature inserts, updates,
    /// deletes); set-level state such as visibility stays editable.
    pub read_only: bool,
    /// Sum of the per-property version counters; changes whenever any
    /// property of the set changes.
    pub version: i64,
}

// =============================================================================
// Query parameters
// =============================================================================

/// One ordering clause for a feature query. Clause declaration order is the
/// tie-break order.
#[derive(Debug, Clone, PartialEq)]
pub enum Order {
    /// Ascending feature id.
    FeatureId,
    /// Ascending feature name, case-insensitively.
    FeatureName,
    /// Group by owning feature set id.
    FeatureSet,
    /// Ascending distance from a point, computed on geometry envelopes.
    Distance { x: f64, y: f64 },
    /// Coarsest-first resolution (descending max LOD).
    Resolution,
}

/// A spatial restriction on a feature query.
#[derive(Debug, Clone, PartialEq)]
pub enum SpatialFilter {
    /// Features whose envelope intersects the region.
    Region(Envelope),
    /// Features within `radius_meters` of a point.
    Radius {
        x: f64,
        y: f64,
        radius_meters: f64,
    },
}

/// Parameters for a feature query.
///
/// `None`/empty collections mean "no restriction". The default value matches
/// an unfiltered full scan.
#[derive(Debug, Clone, Default)]
pub struct FeatureQueryParameters {
    /// Restrict to these owning feature set ids.
    pub feature_set_ids: Option<HashSet<i64>>,
    /// Restrict to feature sets whose name matches any of these patterns
    /// (`%` is the wildcard).
    pub feature_set_names: Option<Vec<String>>,
    /// Restrict to feature sets of these types (wildcard patterns).
    pub types: Option<Vec<String>>,
    /// Restrict to feature sets from these providers (wildcard patterns).
    pub providers: Option<Vec<String>>,
    /// Restrict to these feature ids.
    pub feature_ids: Option<HashSet<i64>>,
    /// Restrict to features whose name matches any of these patterns.
    pub feature_names: Option<Vec<String>>,
    /// Only return features currently visible.
    pub visible_only: bool,
    /// Coarsest resolution of interest, meters per pixel.
    pub min_resolution: Option<f64>,
    /// Finest resolution of interest, meters per pixel.
    pub max_resolution: Option<f64>,
    /// Spatial restriction.
    pub spatial_filter: Option<SpatialFilter>,
    /// Ordering clauses, in tie-break order.
    pub order: Vec<Order>,
    /// Bitmask of `FIELD_*` constants to exclude from the results.
    pub ignored_fields: u32,
    /// Maximum number of rows to return.
    pub limit: Option<usize>,
    /// Number of leading rows to skip.
    pub offset: usize,
}

/// Parameters for a feature set query.
#[derive(Debug, Clone, Default)]
pub struct FeatureSetQueryParameters {
    pub ids: Option<HashSet<i64>>,
    /// Name patterns (`%` is the wildcard).
    pub names: Option<Vec<String>>,
    pub types: Option<Vec<String>>,
    pub providers: Option<Vec<String>>,
    pub visible_only: bool,
}

/// Great-circle distance in meters between two lon/lat points.
pub(crate) fn haversine_meters(x1: f64, y1: f64, x2: f64, y2: f64) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_378_137.0;
    let (lon1, lat1) = (x1.to_radians(), y1.to_radians());
    let (lon2, lat2) = (x2.to_radians(), y2.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().min(1.0).asin()
}

/// Matches `value` against any of `patterns`, where `%` in a pattern matches
/// any run of characters (including none).
pub(crate) fn matches_any(patterns: &[String], value: &str) -> bool {
    patterns.iter().any(|p| wildcard_matches(p, value))
}

fn wildcard_matches(pattern: &str, value: &str) -> bool {
    // Segments between '%' must appear in order; anchored at both ends when
    // the pattern does not begin/end with '%'.
    let segments: Vec<&str> = pattern.split('%').collect();
    if segments.len() == 1 {
        return pattern == value;
    }
    let mut pos = 0usize;
    for (i, seg) in segments.iter().enumerate() {
        if seg.is_empty() {
            continue;
        }
        if i == 0 {
            if !value.starts_with(seg) {
                return false;
            }
            pos = seg.len();
        } else if i == segments.len() - 1 {
            return value.len() >= pos + seg.len() && value.ends_with(seg);
        } else {
            match value[pos..].find(seg) {
                Some(found) => pos = pos + found + seg.len(),
                None => return false,
            }
        }
    }
    true
}
