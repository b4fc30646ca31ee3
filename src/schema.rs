//! # Database Schema
//!
//! Table definitions, schema versioning, triggers, the spatial index, and the
//! registered spatial SQL functions.
//!
//! ## Versioning protocol in the schema
//!
//! Visibility and LOD overrides on individual features are only meaningful
//! relative to the version of the owning set's corresponding property. The
//! triggers below maintain that protocol entirely inside the database:
//!
//! - updating a feature's `visible` stamps the row with the owning set's
//!   current `visible_version` and raises the set's `visible_check` flag;
//! - updating a set's `visible` bumps its `visible_version` (orphaning every
//!   stamped override) and clears the check flag;
//! - the same pair exists for the `min_lod`/`max_lod` columns;
//! - deleting a set cascades to its features, and deleting a feature cleans
//!   its spatial index entry.
//!
//! ## Spatial support
//!
//! Geometries are blobs with a fixed 32-byte envelope prefix (see
//! [`crate::types::Geometry`]). Spatial predicates are ordinary scalar SQL
//! functions registered on every connection; the spatial index is a SQLite
//! R*Tree virtual table keyed by feature id and maintained by the mutation
//! paths (inserts/updates) and the delete trigger.

use std::path::Path;

use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::types::{envelope_from_blob, haversine_meters, Envelope};
use crate::{Error, Result};

/// Current database schema version. Bump on any table/trigger change.
pub const DATABASE_SCHEMA_VERSION: i64 = 1;

// =============================================================================
// DDL
// =============================================================================

const CREATE_METADATA_TABLE: &str = "
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)";

const CREATE_FEATURESETS_TABLE: &str = "
CREATE TABLE IF NOT EXISTS featuresets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    name_version INTEGER NOT NULL,
    visible INTEGER NOT NULL,
    visible_version INTEGER NOT NULL,
    visible_check INTEGER NOT NULL,
    min_lod INTEGER NOT NULL,
    max_lod INTEGER NOT NULL,
    lod_version INTEGER NOT NULL,
    lod_check INTEGER NOT NULL,
    type TEXT NOT NULL,
    provider TEXT NOT NULL,
    read_only INTEGER NOT NULL
)";

const CREATE_FEATURES_TABLE: &str = "
CREATE TABLE IF NOT EXISTS features (
    fid INTEGER PRIMARY KEY AUTOINCREMENT,
    fsid INTEGER NOT NULL,
    name TEXT,
    geometry BLOB NOT NULL,
    style_id INTEGER,
    attribs_id INTEGER,
    altitude_mode INTEGER NOT NULL,
    extrude REAL NOT NULL,
    visible INTEGER NOT NULL,
    visible_version INTEGER NOT NULL,
    min_lod INTEGER NOT NULL,
    max_lod INTEGER NOT NULL,
    lod_version INTEGER NOT NULL,
    version INTEGER NOT NULL
)";

const CREATE_STYLES_TABLE: &str = "
CREATE TABLE IF NOT EXISTS styles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    coding TEXT NOT NULL
)";

const CREATE_ATTRIBUTES_TABLE: &str = "
CREATE TABLE IF NOT EXISTS attributes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    value BLOB NOT NULL
)";

const CREATE_ATTRIBS_SCHEMA_TABLE: &str = "
CREATE TABLE IF NOT EXISTS attribs_schema (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    coding INTEGER NOT NULL
)";

const CREATE_SPATIAL_INDEX: &str = "
CREATE VIRTUAL TABLE IF NOT EXISTS idx_features_geometry USING rtree (
    id, min_x, max_x, min_y, max_y
)";

const CREATE_INDICES: &str = "
CREATE INDEX IF NOT EXISTS idx_features_fsid ON features (fsid);
CREATE INDEX IF NOT EXISTS idx_features_name ON features (name);
CREATE INDEX IF NOT EXISTS idx_features_lod ON features (min_lod, max_lod);
";

const CREATE_TRIGGERS: &str = "
CREATE TRIGGER IF NOT EXISTS features_visible_update
AFTER UPDATE OF visible ON features
BEGIN
    UPDATE featuresets SET visible_check = 1 WHERE id = OLD.fsid;
    UPDATE features SET visible_version =
        (SELECT visible_version FROM featuresets WHERE id = OLD.fsid)
    WHERE fid = OLD.fid;
END;

CREATE TRIGGER IF NOT EXISTS features_lod_update
AFTER UPDATE OF min_lod, max_lod ON features
BEGIN
    UPDATE featuresets SET lod_check = 1 WHERE id = OLD.fsid;
    UPDATE features SET lod_version =
        (SELECT lod_version FROM featuresets WHERE id = OLD.fsid)
    WHERE fid = OLD.fid;
END;

CREATE TRIGGER IF NOT EXISTS featuresets_visible_update
AFTER UPDATE OF visible ON featuresets
BEGIN
    UPDATE featuresets SET visible_version = visible_version + 1, visible_check = 0
    WHERE id = OLD.id;
END;

CREATE TRIGGER IF NOT EXISTS featuresets_lod_update
AFTER UPDATE OF min_lod, max_lod ON featuresets
BEGIN
    UPDATE featuresets SET lod_version = lod_version + 1, lod_check = 0
    WHERE id = OLD.id;
END;

CREATE TRIGGER IF NOT EXISTS featuresets_name_update
AFTER UPDATE OF name ON featuresets
BEGIN
    UPDATE featuresets SET name_version = name_version + 1 WHERE id = OLD.id;
END;

CREATE TRIGGER IF NOT EXISTS featuresets_delete
AFTER DELETE ON featuresets
BEGIN
    DELETE FROM features WHERE fsid = OLD.id;
END;

CREATE TRIGGER IF NOT EXISTS features_delete
AFTER DELETE ON features
BEGIN
    DELETE FROM idx_features_geometry WHERE id = OLD.fid;
    DELETE FROM attributes WHERE id = OLD.attribs_id;
END;
";

// =============================================================================
// Database
// =============================================================================

/// An open, initialized database connection.
#[derive(Debug)]
pub(crate) struct Database {
    pub(crate) conn: Connection,
}

impl Database {
    /// Opens (creating if necessary) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        // Cascading deletes fire nested triggers (set delete -> feature
        // delete -> index cleanup).
        conn.execute_batch("PRAGMA recursive_triggers = ON;")?;

        register_spatial_functions(&conn)?;

        conn.execute_batch(CREATE_METADATA_TABLE)?;
        verify_schema_version(&conn)?;

        conn.execute_batch(CREATE_FEATURESETS_TABLE)?;
        conn.execute_batch(CREATE_FEATURES_TABLE)?;
        conn.execute_batch(CREATE_STYLES_TABLE)?;
        conn.execute_batch(CREATE_ATTRIBUTES_TABLE)?;
        conn.execute_batch(CREATE_ATTRIBS_SCHEMA_TABLE)?;
        conn.execute_batch(CREATE_SPATIAL_INDEX)?;
        conn.execute_batch(CREATE_INDICES)?;
        conn.execute_batch(CREATE_TRIGGERS)?;

        debug!("database initialized");
        Ok(Self { conn })
    }
}

/// Verifies the stored schema version matches this build, recording it on
/// first open. A mismatch refuses the database rather than guessing.
fn verify_schema_version(conn: &Connection) -> Result<()> {
    let stored: Option<String> = conn
        .query_row(
            "SELECT value FROM metadata WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    match stored {
        None => {
            conn.execute(
                "INSERT INTO metadata (key, value) VALUES ('schema_version', ?)",
                params![DATABASE_SCHEMA_VERSION.to_string()],
            )?;
            Ok(())
        }
        Some(v) if v == DATABASE_SCHEMA_VERSION.to_string() => Ok(()),
        Some(v) => Err(Error::Unsupported(format!(
            "database schema version {} is not supported (expected {})",
            v, DATABASE_SCHEMA_VERSION
        ))),
    }
}

// =============================================================================
// Spatial SQL functions
// =============================================================================

/// Registers the scalar spatial functions used by compiled queries:
///
/// - `BuildMbr(min_x, min_y, max_x, max_y)` -> geometry blob (envelope only)
/// - `MakePoint(x, y)` -> geometry blob (degenerate envelope)
/// - `Intersects(a, b)` -> 0/1 on envelope intersection
/// - `Distance(a, b)` -> meters between envelope centers
pub(crate) fn register_spatial_functions(conn: &Connection) -> Result<()> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;

    conn.create_scalar_function("BuildMbr", 4, flags, |ctx| {
        let env = Envelope::new(
            ctx.get::<f64>(0)?,
            ctx.get::<f64>(1)?,
            ctx.get::<f64>(2)?,
            ctx.get::<f64>(3)?,
        );
        Ok(envelope_blob(&env))
    })?;

    conn.create_scalar_function("MakePoint", 2, flags, |ctx| {
        let env = Envelope::point(ctx.get::<f64>(0)?, ctx.get::<f64>(1)?);
        Ok(envelope_blob(&env))
    })?;

    conn.create_scalar_function("Intersects", 2, flags, |ctx| {
        match (geometry_arg(ctx, 0)?, geometry_arg(ctx, 1)?) {
            (Some(a), Some(b)) => Ok(a.intersects(&b) as i64),
            _ => Ok(0i64),
        }
    })?;

    conn.create_scalar_function("Distance", 2, flags, |ctx| {
        match (geometry_arg(ctx, 0)?, geometry_arg(ctx, 1)?) {
            (Some(a), Some(b)) => {
                let (ax, ay) = a.center();
                let (bx, by) = b.center();
                Ok(haversine_meters(ax, ay, bx, by))
            }
            _ => Ok(f64::MAX),
        }
    })?;

    Ok(())
}

fn envelope_blob(env: &Envelope) -> Vec<u8> {
    let mut blob = Vec::with_capacity(32);
    blob.extend_from_slice(&env.min_x.to_be_bytes());
    blob.extend_from_slice(&env.min_y.to_be_bytes());
    blob.extend_from_slice(&env.max_x.to_be_bytes());
    blob.extend_from_slice(&env.max_y.to_be_bytes());
    blob
}

fn geometry_arg(ctx: &Context<'_>, idx: usize) -> rusqlite::Result<Option<Envelope>> {
    let blob: Option<Vec<u8>> = ctx.get(idx)?;
    match blob {
        None => Ok(None),
        Some(b) => envelope_from_blob(&b)
            .map(Some)
            .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e))),
    }
}
