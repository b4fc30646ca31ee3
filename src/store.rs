//! # Feature Store
//!
//! The public surface: a synchronous, thread-safe store of feature sets and
//! features over an embedded SQLite database.
//!
//! ## Concurrency
//!
//! One `RwLock` guards the connection, the directory cache, and the attribute
//! schema registry. Every operation takes the write half (even reads may
//! trigger a lazy cache reload), holds it only while compiling and executing
//! SQL, and releases it before the caller iterates: query results are
//! buffered cursors, valid for as long as the caller keeps them.
//!
//! ## Transactions
//!
//! Multi-statement mutations run inside an explicit `BEGIN IMMEDIATE` /
//! `COMMIT` pair and roll back on any error. Bulk loading goes through
//! [`FeatureStore::bulk_insert`], which stretches a single such transaction
//! across many inserts and holds the store lock for its whole lifetime;
//! dropping the guard without committing rolls everything back.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{RwLock, RwLockWriteGuard};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use crate::attrs::{encode_attributes, AttributeSchemaRegistry, AttributeSet};
use crate::cursor::{FeatureCursor, FeatureSetCursor};
use crate::directory::{set_visibility_qualifies, DirectoryCache};
use crate::query;
use crate::schema::Database;
use crate::types::{
    AltitudeMode, Feature, FeatureQueryParameters, FeatureSet, FeatureSetQueryParameters,
    Geometry, Style, FIELD_ALTITUDE, FIELD_ATTRIBUTES, FIELD_GEOMETRY, FIELD_NAME, FIELD_STYLE,
};
use crate::{Error, Result};

/// Everything a feature insert carries besides the owning set.
#[derive(Debug, Clone)]
pub struct FeatureInsert {
    pub name: Option<String>,
    pub geometry: Geometry,
    pub style: Option<Style>,
    pub attributes: Option<AttributeSet>,
    pub altitude_mode: AltitudeMode,
    pub extrude: f64,
}

impl FeatureInsert {
    pub fn new(geometry: Geometry) -> Self {
        Self {
            name: None,
            geometry,
            style: None,
            attributes: None,
            altitude_mode: AltitudeMode::default(),
            extrude: 0.0,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn style(mut self, style: Style) -> Self {
        self.style = Some(style);
        self
    }

    pub fn attributes(mut self, attributes: AttributeSet) -> Self {
        self.attributes = Some(attributes);
        self
    }

    pub fn altitude(mut self, mode: AltitudeMode, extrude: f64) -> Self {
        self.altitude_mode = mode;
        self.extrude = extrude;
        self
    }
}

struct Inner {
    db: Database,
    directory: DirectoryCache,
    schema: AttributeSchemaRegistry,
}

impl Inner {
    fn validate(&mut self) -> Result<()> {
        self.directory.validate(&self.db.conn)?;
        self.schema.validate(&self.db.conn)?;
        Ok(())
    }

    fn mark_dirty(&mut self) {
        self.directory.mark_dirty();
    }
}

/// A versioned spatial feature store backed by a SQLite database.
pub struct FeatureStore {
    inner: RwLock<Inner>,
}

impl FeatureStore {
    /// Opens (creating if necessary) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::wrap(Database::open(path)?))
    }

    /// Opens a private in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::wrap(Database::open_in_memory()?))
    }

    fn wrap(db: Database) -> Self {
        Self {
            inner: RwLock::new(Inner {
                db,
                directory: DirectoryCache::new(),
                schema: AttributeSchemaRegistry::new(),
            }),
        }
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| Error::IllegalState("store lock poisoned".to_string()))
    }

    /// Forces a reload of the directory and attribute schema caches.
    pub fn refresh(&self) -> Result<()> {
        let mut inner = self.write()?;
        inner.directory.mark_dirty();
        inner.schema.mark_dirty();
        inner.validate()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Queries features. The returned cursor is fully independent of the
    /// store lock.
    pub fn query_features(
        &self,
        params: &FeatureQueryParameters,
    ) -> Result<Box<dyn FeatureCursor + Send>> {
        let mut inner = self.write()?;
        inner.validate()?;
        query::query_features(
            &inner.db.conn,
            &inner.directory,
            inner.schema.snapshot(),
            params,
        )
    }

    /// Counts the features a query would return, honoring limit/offset.
    pub fn query_features_count(&self, params: &FeatureQueryParameters) -> Result<usize> {
        let mut inner = self.write()?;
        inner.validate()?;
        query::query_features_count(&inner.db.conn, &inner.directory, params)
    }

    /// Queries feature sets, ordered by name (case-insensitively).
    pub fn query_feature_sets(
        &self,
        params: &FeatureSetQueryParameters,
    ) -> Result<FeatureSetCursor> {
        let mut inner = self.write()?;
        inner.validate()?;
        let sets = inner.directory.query_sets(&inner.db.conn, params)?;
        Ok(FeatureSetCursor::new(sets))
    }

    pub fn query_feature_sets_count(&self, params: &FeatureSetQueryParameters) -> Result<usize> {
        let mut inner = self.write()?;
        inner.validate()?;
        Ok(inner.directory.query_sets(&inner.db.conn, params)?.len())
    }

    /// Fetches a single feature by id.
    pub fn get_feature(&self, fid: i64) -> Result<Feature> {
        let mut params = FeatureQueryParameters::default();
        params.feature_ids = Some([fid].into_iter().collect());
        let mut cursor = self.query_features(&params)?;
        if !cursor.move_to_next()? {
            return Err(Error::InvalidArgument(format!("no such feature {}", fid)));
        }
        cursor.get()
    }

    /// Fetches a single feature set by id.
    pub fn get_feature_set(&self, fsid: i64) -> Result<FeatureSet> {
        let mut inner = self.write()?;
        inner.validate()?;
        inner
            .directory
            .get(fsid)
            .map(|d| d.to_feature_set())
            .ok_or_else(|| Error::InvalidArgument(format!("no such feature set {}", fsid)))
    }

    // =========================================================================
    // Visibility and LOD
    // =========================================================================

    /// Overrides one feature's visibility. The row is stamped against the
    /// owning set's current visibility version by trigger.
    pub fn set_feature_visible(&self, fid: i64, visible: bool) -> Result<()> {
        let mut inner = self.write()?;
        inner.validate()?;
        let n = inner.db.conn.execute(
            "UPDATE features SET visible = ? WHERE fid = ?",
            params![visible as i64, fid],
        )?;
        if n == 0 {
            return Err(Error::InvalidArgument(format!("no such feature {}", fid)));
        }
        inner.mark_dirty();
        Ok(())
    }

    /// Overrides visibility for every feature matching `params`.
    pub fn set_features_visible(
        &self,
        params: &FeatureQueryParameters,
        visible: bool,
    ) -> Result<()> {
        let mut inner = self.write()?;
        inner.validate()?;

        let mut narrowed = params.clone();
        narrowed.ignored_fields =
            FIELD_NAME | FIELD_GEOMETRY | FIELD_STYLE | FIELD_ATTRIBUTES | FIELD_ALTITUDE;
        narrowed.order = Vec::new();
        let mut cursor = query::query_features(
            &inner.db.conn,
            &inner.directory,
            inner.schema.snapshot(),
            &narrowed,
        )?;
        let mut fids = Vec::new();
        while cursor.move_to_next()? {
            fids.push(cursor.id()?);
        }
        drop(cursor);

        with_tx(&inner.db.conn, |conn| {
            for chunk in fids.chunks(500) {
                let marks = vec!["?"; chunk.len()].join(", ");
                let sql = format!("UPDATE features SET visible = ? WHERE fid IN ({})", marks);
                let mut stmt = conn.prepare(&sql)?;
                let mut args: Vec<i64> = Vec::with_capacity(chunk.len() + 1);
                args.push(visible as i64);
                args.extend_from_slice(chunk);
                stmt.execute(rusqlite::params_from_iter(args.iter()))?;
            }
            Ok(())
        })?;
        inner.mark_dirty();
        Ok(())
    }

    /// Sets a feature set's default visibility, invalidating all per-feature
    /// overrides (the version bump happens by trigger).
    pub fn set_feature_set_visible(&self, fsid: i64, visible: bool) -> Result<()> {
        let mut inner = self.write()?;
        inner.validate()?;
        let n = inner.db.conn.execute(
            "UPDATE featuresets SET visible = ? WHERE id = ?",
            params![visible as i64, fsid],
        )?;
        if n == 0 {
            return Err(Error::InvalidArgument(format!("no such feature set {}", fsid)));
        }
        inner.mark_dirty();
        Ok(())
    }

    /// Sets default visibility on every set matching `params`.
    pub fn set_feature_sets_visible(
        &self,
        params: &FeatureSetQueryParameters,
        visible: bool,
    ) -> Result<()> {
        let mut inner = self.write()?;
        inner.validate()?;
        let ids = inner.directory.matching_set_ids(params);
        with_tx(&inner.db.conn, |conn| {
            for id in &ids {
                conn.execute(
                    "UPDATE featuresets SET visible = ? WHERE id = ?",
                    params![visible as i64, id],
                )?;
            }
            Ok(())
        })?;
        inner.mark_dirty();
        Ok(())
    }

    /// Whether a feature is currently visible, resolving its override
    /// against the owning set's visibility version.
    pub fn is_feature_visible(&self, fid: i64) -> Result<bool> {
        let mut inner = self.write()?;
        inner.validate()?;
        let row: Option<(i64, i64, i64)> = inner
            .db
            .conn
            .query_row(
                "SELECT fsid, visible, visible_version FROM features WHERE fid = ?",
                params![fid],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let (fsid, visible, visible_version) = row
            .ok_or_else(|| Error::InvalidArgument(format!("no such feature {}", fid)))?;
        let defn = inner
            .directory
            .get(fsid)
            .ok_or_else(|| Error::IllegalState(format!("feature {} has no feature set", fid)))?;
        if visible_version == defn.visible_version {
            Ok(visible != 0)
        } else {
            Ok(defn.visible)
        }
    }

    /// Whether a feature set is visible: its default when no live overrides
    /// exist, otherwise whether any of its features currently qualifies.
    pub fn is_feature_set_visible(&self, fsid: i64) -> Result<bool> {
        let mut inner = self.write()?;
        inner.validate()?;
        let defn = inner
            .directory
            .get(fsid)
            .ok_or_else(|| Error::InvalidArgument(format!("no such feature set {}", fsid)))?;
        set_visibility_qualifies(&inner.db.conn, defn)
    }

    /// Overrides one feature's LOD range.
    pub fn set_feature_lod(&self, fid: i64, min_lod: i32, max_lod: i32) -> Result<()> {
        if min_lod > max_lod {
            return Err(Error::InvalidArgument(format!(
                "empty LOD range {}..{}",
                min_lod, max_lod
            )));
        }
        let mut inner = self.write()?;
        inner.validate()?;
        let n = inner.db.conn.execute(
            "UPDATE features SET min_lod = ?, max_lod = ? WHERE fid = ?",
            params![min_lod, max_lod, fid],
        )?;
        if n == 0 {
            return Err(Error::InvalidArgument(format!("no such feature {}", fid)));
        }
        inner.mark_dirty();
        Ok(())
    }

    /// Sets a feature set's LOD range, invalidating per-feature overrides.
    pub fn set_feature_set_lod(&self, fsid: i64, min_lod: i32, max_lod: i32) -> Result<()> {
        if min_lod > max_lod {
            return Err(Error::InvalidArgument(format!(
                "empty LOD range {}..{}",
                min_lod, max_lod
            )));
        }
        let mut inner = self.write()?;
        inner.validate()?;
        let n = inner.db.conn.execute(
            "UPDATE featuresets SET min_lod = ?, max_lod = ? WHERE id = ?",
            params![min_lod, max_lod, fsid],
        )?;
        if n == 0 {
            return Err(Error::InvalidArgument(format!("no such feature set {}", fsid)));
        }
        inner.mark_dirty();
        Ok(())
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Creates a feature set, initially visible.
    pub fn insert_feature_set(
        &self,
        name: &str,
        provider: &str,
        type_name: &str,
        min_lod: i32,
        max_lod: i32,
    ) -> Result<i64> {
        if min_lod > max_lod {
            return Err(Error::InvalidArgument(format!(
                "empty LOD range {}..{}",
                min_lod, max_lod
            )));
        }
        let mut inner = self.write()?;
        let id = insert_feature_set_row(&inner.db.conn, name, provider, type_name, min_lod, max_lod)?;
        inner.mark_dirty();
        Ok(id)
    }

    pub fn update_feature_set_name(&self, fsid: i64, name: &str) -> Result<()> {
        let mut inner = self.write()?;
        let n = inner.db.conn.execute(
            "UPDATE featuresets SET name = ? WHERE id = ?",
            params![name, fsid],
        )?;
        if n == 0 {
            return Err(Error::InvalidArgument(format!("no such feature set {}", fsid)));
        }
        inner.mark_dirty();
        Ok(())
    }

    /// Marks a set read-only (or clears the mark). Read-only sets reject
    /// feature inserts, updates, and deletes; set-level state stays editable.
    pub fn set_feature_set_read_only(&self, fsid: i64, read_only: bool) -> Result<()> {
        let mut inner = self.write()?;
        let n = inner.db.conn.execute(
            "UPDATE featuresets SET read_only = ? WHERE id = ?",
            params![read_only as i64, fsid],
        )?;
        if n == 0 {
            return Err(Error::InvalidArgument(format!("no such feature set {}", fsid)));
        }
        inner.mark_dirty();
        Ok(())
    }

    /// Deletes a feature set and, by trigger cascade, all of its features.
    pub fn delete_feature_set(&self, fsid: i64) -> Result<()> {
        let mut inner = self.write()?;
        let n = inner
            .db
            .conn
            .execute("DELETE FROM featuresets WHERE id = ?", params![fsid])?;
        if n == 0 {
            return Err(Error::InvalidArgument(format!("no such feature set {}", fsid)));
        }
        inner.mark_dirty();
        Ok(())
    }

    /// Empties the store of all content.
    pub fn delete_all_feature_sets(&self) -> Result<()> {
        let mut inner = self.write()?;
        with_tx(&inner.db.conn, |conn| {
            conn.execute("DELETE FROM featuresets", [])?;
            conn.execute("DELETE FROM styles", [])?;
            Ok(())
        })?;
        inner.mark_dirty();
        Ok(())
    }

    /// Inserts one feature into `fsid`.
    pub fn insert_feature(&self, fsid: i64, insert: &FeatureInsert) -> Result<i64> {
        let mut inner = self.write()?;
        inner.validate()?;
        ensure_writable(&inner.directory, fsid)?;
        let inner = &mut *inner;
        let schema = &mut inner.schema;
        let mut memo = HashMap::new();
        let result = with_tx(&inner.db.conn, |conn| {
            insert_feature_row(conn, schema, &mut memo, fsid, insert)
        });
        if result.is_err() {
            // rolled-back schema registrations must not linger in memory
            inner.schema.mark_dirty();
        }
        result
    }

    pub fn update_feature_name(&self, fid: i64, name: &str) -> Result<()> {
        let inner = self.write()?;
        let n = inner.db.conn.execute(
            "UPDATE features SET name = ?, version = version + 1 WHERE fid = ?",
            params![name, fid],
        )?;
        if n == 0 {
            return Err(Error::InvalidArgument(format!("no such feature {}", fid)));
        }
        Ok(())
    }

    pub fn update_feature_geometry(&self, fid: i64, geometry: &Geometry) -> Result<()> {
        let inner = self.write()?;
        with_tx(&inner.db.conn, |conn| {
            let n = conn.execute(
                "UPDATE features SET geometry = ?, version = version + 1 WHERE fid = ?",
                params![geometry.to_blob(), fid],
            )?;
            if n == 0 {
                return Err(Error::InvalidArgument(format!("no such feature {}", fid)));
            }
            let env = geometry.envelope();
            conn.execute(
                "INSERT OR REPLACE INTO idx_features_geometry \
                 (id, min_x, max_x, min_y, max_y) VALUES (?, ?, ?, ?, ?)",
                params![fid, env.min_x, env.max_x, env.min_y, env.max_y],
            )?;
            Ok(())
        })
    }

    pub fn update_feature_style(&self, fid: i64, style: Option<&Style>) -> Result<()> {
        let inner = self.write()?;
        with_tx(&inner.db.conn, |conn| {
            let style_id = match style {
                None => None,
                Some(s) => Some(intern_style(conn, &mut HashMap::new(), s)?),
            };
            let n = conn.execute(
                "UPDATE features SET style_id = ?, version = version + 1 WHERE fid = ?",
                params![style_id, fid],
            )?;
            if n == 0 {
                return Err(Error::InvalidArgument(format!("no such feature {}", fid)));
            }
            Ok(())
        })
    }

    /// Replaces a feature's attributes. An empty set clears them.
    pub fn update_feature_attributes(&self, fid: i64, attrs: &AttributeSet) -> Result<()> {
        let mut inner = self.write()?;
        inner.validate()?;
        let inner = &mut *inner;
        let schema = &mut inner.schema;
        let result = with_tx(&inner.db.conn, |conn| {
            let old: Option<Option<i64>> = conn
                .query_row(
                    "SELECT attribs_id FROM features WHERE fid = ?",
                    params![fid],
                    |row| row.get(0),
                )
                .optional()?;
            let old = old
                .ok_or_else(|| Error::InvalidArgument(format!("no such feature {}", fid)))?;

            let new_id = if attrs.is_empty() {
                None
            } else {
                let blob = encode_attributes(conn, schema, attrs)?;
                match old {
                    Some(id) => {
                        conn.execute(
                            "UPDATE attributes SET value = ? WHERE id = ?",
                            params![blob, id],
                        )?;
                        Some(id)
                    }
                    None => {
                        conn.execute("INSERT INTO attributes (value) VALUES (?)", params![blob])?;
                        Some(conn.last_insert_rowid())
                    }
                }
            };
            if new_id.is_none() {
                if let Some(id) = old {
                    conn.execute("DELETE FROM attributes WHERE id = ?", params![id])?;
                }
            }
            conn.execute(
                "UPDATE features SET attribs_id = ?, version = version + 1 WHERE fid = ?",
                params![new_id, fid],
            )?;
            Ok(())
        });
        if result.is_err() {
            inner.schema.mark_dirty();
        }
        result
    }

    pub fn delete_feature(&self, fid: i64) -> Result<()> {
        let mut inner = self.write()?;
        let n = inner
            .db
            .conn
            .execute("DELETE FROM features WHERE fid = ?", params![fid])?;
        if n == 0 {
            return Err(Error::InvalidArgument(format!("no such feature {}", fid)));
        }
        inner.mark_dirty();
        Ok(())
    }

    /// Deletes every feature of `fsid`, keeping the set itself.
    pub fn delete_all_features(&self, fsid: i64) -> Result<()> {
        let mut inner = self.write()?;
        inner.validate()?;
        ensure_writable(&inner.directory, fsid)?;
        inner
            .db
            .conn
            .execute("DELETE FROM features WHERE fsid = ?", params![fsid])?;
        inner.mark_dirty();
        Ok(())
    }

    // =========================================================================
    // Bulk insertion
    // =========================================================================

    /// Begins a bulk insertion. The returned guard holds the store lock and
    /// one open transaction; nothing is durable until
    /// [`BulkInsertion::commit`].
    pub fn bulk_insert(&self) -> Result<BulkInsertion<'_>> {
        let mut guard = self.write()?;
        guard.validate()?;
        guard.db.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(BulkInsertion {
            guard,
            style_ids: HashMap::new(),
            finished: false,
        })
    }
}

/// An in-progress bulk insertion: one transaction, one style memo, the store
/// lock held throughout.
pub struct BulkInsertion<'a> {
    guard: RwLockWriteGuard<'a, Inner>,
    style_ids: HashMap<String, i64>,
    finished: bool,
}

impl BulkInsertion<'_> {
    pub fn insert_feature_set(
        &mut self,
        name: &str,
        provider: &str,
        type_name: &str,
        min_lod: i32,
        max_lod: i32,
    ) -> Result<i64> {
        if min_lod > max_lod {
            return Err(Error::InvalidArgument(format!(
                "empty LOD range {}..{}",
                min_lod, max_lod
            )));
        }
        insert_feature_set_row(
            &self.guard.db.conn,
            name,
            provider,
            type_name,
            min_lod,
            max_lod,
        )
    }

    pub fn insert_feature(&mut self, fsid: i64, insert: &FeatureInsert) -> Result<i64> {
        // sets created within this bulk are not in the directory; they are
        // never read-only
        if let Some(defn) = self.guard.directory.get(fsid) {
            if defn.read_only {
                return Err(Error::InvalidArgument(format!(
                    "feature set {} is read-only",
                    fsid
                )));
            }
        }
        let inner = &mut *self.guard;
        insert_feature_row(
            &inner.db.conn,
            &mut inner.schema,
            &mut self.style_ids,
            fsid,
            insert,
        )
    }

    /// Commits everything inserted through this guard.
    pub fn commit(mut self) -> Result<()> {
        self.guard.db.conn.execute_batch("COMMIT")?;
        self.finished = true;
        self.guard.mark_dirty();
        Ok(())
    }

    /// Discards everything inserted through this guard.
    pub fn rollback(mut self) -> Result<()> {
        self.guard.db.conn.execute_batch("ROLLBACK")?;
        self.finished = true;
        self.guard.schema.mark_dirty();
        Ok(())
    }
}

impl Drop for BulkInsertion<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.guard.db.conn.execute_batch("ROLLBACK") {
                warn!(error = %e, "bulk insertion rollback failed");
            }
            // rolled-back schema registrations must not linger in memory
            self.guard.schema.mark_dirty();
        }
    }
}

// =============================================================================
// Shared helpers
// =============================================================================

fn with_tx<T>(conn: &Connection, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
    conn.execute_batch("BEGIN IMMEDIATE")?;
    match f(conn) {
        Ok(v) => {
            conn.execute_batch("COMMIT")?;
            Ok(v)
        }
        Err(e) => {
            if let Err(rb) = conn.execute_batch("ROLLBACK") {
                warn!(error = %rb, "rollback failed");
            }
            Err(e)
        }
    }
}

/// Rejects content mutations against unknown or read-only sets.
fn ensure_writable(directory: &DirectoryCache, fsid: i64) -> Result<()> {
    let defn = directory
        .get(fsid)
        .ok_or_else(|| Error::InvalidArgument(format!("no such feature set {}", fsid)))?;
    if directory.any_read_only() && defn.read_only {
        return Err(Error::InvalidArgument(format!(
            "feature set {} is read-only",
            fsid
        )));
    }
    Ok(())
}

fn insert_feature_set_row(
    conn: &Connection,
    name: &str,
    provider: &str,
    type_name: &str,
    min_lod: i32,
    max_lod: i32,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO featuresets \
         (name, name_version, visible, visible_version, visible_check, \
          min_lod, max_lod, lod_version, lod_check, type, provider, read_only) \
         VALUES (?, 1, 1, 1, 0, ?, ?, 1, 0, ?, ?, 0)",
        params![name, min_lod, max_lod, type_name, provider],
    )?;
    let id = conn.last_insert_rowid();
    debug!(fsid = id, name, "feature set created");
    Ok(id)
}

/// Looks up or creates the interned row for an encoded style.
fn intern_style(
    conn: &Connection,
    memo: &mut HashMap<String, i64>,
    style: &Style,
) -> Result<i64> {
    if let Some(id) = memo.get(style.encoded()) {
        return Ok(*id);
    }
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM styles WHERE coding = ?",
            params![style.encoded()],
            |row| row.get(0),
        )
        .optional()?;
    let id = match existing {
        Some(id) => id,
        None => {
            conn.execute(
                "INSERT INTO styles (coding) VALUES (?)",
                params![style.encoded()],
            )?;
            conn.last_insert_rowid()
        }
    };
    memo.insert(style.encoded().to_string(), id);
    Ok(id)
}

/// Inserts one feature row plus its style, attributes, and spatial index
/// entries. Caller supplies the transaction.
fn insert_feature_row(
    conn: &Connection,
    schema: &mut AttributeSchemaRegistry,
    style_memo: &mut HashMap<String, i64>,
    fsid: i64,
    insert: &FeatureInsert,
) -> Result<i64> {
    let style_id = match &insert.style {
        None => None,
        Some(s) => Some(intern_style(conn, style_memo, s)?),
    };
    let attribs_id = match &insert.attributes {
        Some(attrs) if !attrs.is_empty() => {
            let blob = encode_attributes(conn, schema, attrs)?;
            conn.execute("INSERT INTO attributes (value) VALUES (?)", params![blob])?;
            Some(conn.last_insert_rowid())
        }
        _ => None,
    };
    conn.execute(
        "INSERT INTO features \
         (fsid, name, geometry, style_id, attribs_id, altitude_mode, extrude, \
          visible, visible_version, min_lod, max_lod, lod_version, version) \
         VALUES (?, ?, ?, ?, ?, ?, ?, 1, 0, 0, ?, 0, 1)",
        params![
            fsid,
            insert.name,
            insert.geometry.to_blob(),
            style_id,
            attribs_id,
            insert.altitude_mode.code(),
            insert.extrude,
            i32::MAX,
        ],
    )?;
    let fid = conn.last_insert_rowid();
    let env = insert.geometry.envelope();
    conn.execute(
        "INSERT INTO idx_features_geometry (id, min_x, max_x, min_y, max_y) \
         VALUES (?, ?, ?, ?, ?)",
        params![fid, env.min_x, env.max_x, env.min_y, env.max_y],
    )?;
    Ok(fid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs::AttributeValue;
    use crate::types::Envelope;

    fn point(x: f64, y: f64) -> Geometry {
        Geometry::new(Envelope::point(x, y), vec![])
    }

    fn store_with_set() -> (FeatureStore, i64) {
        let store = FeatureStore::open_in_memory().unwrap();
        let fsid = store
            .insert_feature_set("roads", "import", "geojson", 0, 21)
            .unwrap();
        (store, fsid)
    }

    #[test]
    fn test_insert_and_get_feature() {
        let (store, fsid) = store_with_set();
        let mut attrs = AttributeSet::new();
        attrs.insert("lanes", AttributeValue::Int(2));
        let fid = store
            .insert_feature(
                fsid,
                &FeatureInsert::new(point(10.0, 20.0))
                    .name("main st")
                    .style(Style::new("PEN(c:#ff0000)"))
                    .attributes(attrs.clone()),
            )
            .unwrap();

        let feature = store.get_feature(fid).unwrap();
        assert_eq!(feature.id, fid);
        assert_eq!(feature.feature_set_id, fsid);
        assert_eq!(feature.version, 1);
        assert_eq!(feature.name.as_deref(), Some("main st"));
        assert_eq!(feature.style, Some(Style::new("PEN(c:#ff0000)")));
        assert_eq!(feature.attributes, Some(attrs));
        assert_eq!(
            feature.geometry.unwrap().envelope(),
            &Envelope::point(10.0, 20.0)
        );
    }

    #[test]
    fn test_get_feature_unknown_id() {
        let (store, _) = store_with_set();
        assert!(matches!(
            store.get_feature(999),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_insert_feature_unknown_set() {
        let store = FeatureStore::open_in_memory().unwrap();
        let err = store.insert_feature(42, &FeatureInsert::new(point(0.0, 0.0)));
        assert!(matches!(err, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_feature_version_increments_on_update() {
        let (store, fsid) = store_with_set();
        let fid = store
            .insert_feature(fsid, &FeatureInsert::new(point(0.0, 0.0)).name("a"))
            .unwrap();
        assert_eq!(store.get_feature(fid).unwrap().version, 1);
        store.update_feature_name(fid, "b").unwrap();
        assert_eq!(store.get_feature(fid).unwrap().version, 2);
        store
            .update_feature_geometry(fid, &point(1.0, 1.0))
            .unwrap();
        assert_eq!(store.get_feature(fid).unwrap().version, 3);
        store
            .update_feature_style(fid, Some(&Style::new("PEN(c:#00ff00)")))
            .unwrap();
        assert_eq!(store.get_feature(fid).unwrap().version, 4);
    }

    #[test]
    fn test_update_feature_attributes_replaces() {
        let (store, fsid) = store_with_set();
        let fid = store
            .insert_feature(fsid, &FeatureInsert::new(point(0.0, 0.0)))
            .unwrap();
        let mut attrs = AttributeSet::new();
        attrs.insert("k", AttributeValue::Long(5));
        store.update_feature_attributes(fid, &attrs).unwrap();
        assert_eq!(store.get_feature(fid).unwrap().attributes, Some(attrs));
        // clearing
        store
            .update_feature_attributes(fid, &AttributeSet::new())
            .unwrap();
        assert_eq!(store.get_feature(fid).unwrap().attributes, None);
    }

    #[test]
    fn test_style_interned_across_features() {
        let (store, fsid) = store_with_set();
        let style = Style::new("PEN(c:#0000ff)");
        for i in 0..3 {
            store
                .insert_feature(
                    fsid,
                    &FeatureInsert::new(point(i as f64, 0.0)).style(style.clone()),
                )
                .unwrap();
        }
        let inner = store.inner.write().unwrap();
        let count: i64 = inner
            .db
            .conn
            .query_row("SELECT COUNT(1) FROM styles", [], |r| r.get(0))
            .unwrap();
        drop(inner);
        assert_eq!(count, 1);
    }

    #[test]
    fn test_delete_feature_set_cascades() {
        let (store, fsid) = store_with_set();
        let mut attrs = AttributeSet::new();
        attrs.insert("k", AttributeValue::Int(1));
        store
            .insert_feature(
                fsid,
                &FeatureInsert::new(point(0.0, 0.0)).attributes(attrs),
            )
            .unwrap();
        store.delete_feature_set(fsid).unwrap();

        let inner = store.inner.write().unwrap();
        for (table, expect) in [
            ("features", 0i64),
            ("attributes", 0),
            ("idx_features_geometry", 0),
        ] {
            let n: i64 = inner
                .db
                .conn
                .query_row(&format!("SELECT COUNT(1) FROM {}", table), [], |r| r.get(0))
                .unwrap();
            assert_eq!(n, expect, "table {}", table);
        }
    }

    #[test]
    fn test_bulk_insert_commit_and_rollback() {
        let (store, fsid) = store_with_set();
        {
            let mut bulk = store.bulk_insert().unwrap();
            for i in 0..10 {
                bulk.insert_feature(fsid, &FeatureInsert::new(point(i as f64, 0.0)))
                    .unwrap();
            }
            bulk.commit().unwrap();
        }
        assert_eq!(
            store
                .query_features_count(&FeatureQueryParameters::default())
                .unwrap(),
            10
        );
        {
            let mut bulk = store.bulk_insert().unwrap();
            bulk.insert_feature(fsid, &FeatureInsert::new(point(99.0, 0.0)))
                .unwrap();
            // dropped without commit
        }
        assert_eq!(
            store
                .query_features_count(&FeatureQueryParameters::default())
                .unwrap(),
            10
        );
    }

    #[test]
    fn test_read_only_set_rejects_content_mutations() {
        let (store, fsid) = store_with_set();
        let fid = store
            .insert_feature(fsid, &FeatureInsert::new(point(0.0, 0.0)))
            .unwrap();

        store.set_feature_set_read_only(fsid, true).unwrap();
        assert!(store.get_feature_set(fsid).unwrap().read_only);
        assert!(matches!(
            store.insert_feature(fsid, &FeatureInsert::new(point(1.0, 1.0))),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            store.delete_all_features(fsid),
            Err(Error::InvalidArgument(_))
        ));
        {
            let mut bulk = store.bulk_insert().unwrap();
            assert!(matches!(
                bulk.insert_feature(fsid, &FeatureInsert::new(point(1.0, 1.0))),
                Err(Error::InvalidArgument(_))
            ));
        }
        // set-level state stays editable
        store.set_feature_set_visible(fsid, false).unwrap();
        assert!(!store.get_feature_set(fsid).unwrap().visible);

        store.set_feature_set_read_only(fsid, false).unwrap();
        assert!(!store.get_feature_set(fsid).unwrap().read_only);
        store
            .insert_feature(fsid, &FeatureInsert::new(point(1.0, 1.0)))
            .unwrap();
        assert_eq!(store.get_feature(fid).unwrap().id, fid);
    }

    #[test]
    fn test_set_lod_range_validation() {
        let (store, fsid) = store_with_set();
        assert!(matches!(
            store.set_feature_set_lod(fsid, 10, 5),
            Err(Error::InvalidArgument(_))
        ));
    }
}
