//! # Feature Set Directory Cache
//!
//! An in-memory mirror of the `featuresets` table. Query compilation needs
//! every set's version counters and check flags up front, so rather than
//! joining `featuresets` into every feature query the store keeps the whole
//! (small) table cached and reloads it lazily: mutations mark the cache dirty
//! and the next query pulls a fresh copy.
//!
//! The cache also answers the *partitioning* question at the heart of query
//! compilation. A set whose relevant check flag is clear has no live per-row
//! overrides, so set-level state fully decides visibility/LOD eligibility —
//! a cheap in-memory "soft" test either admits all of its features or rejects
//! the whole set. A set with a check flag raised has overrides of unknown
//! effect; it gets a "hard" probe against the features table and, if anything
//! qualifies, its own version-guarded statement in the compiled query.

use std::collections::HashMap;

use rusqlite::Connection;
use tracing::debug;

use crate::bind::WhereClauseBuilder;
use crate::query;
use crate::types::{matches_any, FeatureQueryParameters, FeatureSet, FeatureSetQueryParameters};
use crate::Result;

/// Cached row of the `featuresets` table.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FeatureSetDefn {
    pub id: i64,
    pub name: String,
    pub name_version: i64,
    pub visible: bool,
    pub visible_version: i64,
    pub visible_check: bool,
    pub min_lod: i32,
    pub max_lod: i32,
    pub lod_version: i64,
    pub lod_check: bool,
    pub type_name: String,
    pub provider: String,
    pub read_only: bool,
}

impl FeatureSetDefn {
    pub fn to_feature_set(&self) -> FeatureSet {
        FeatureSet {
            id: self.id,
            name: self.name.clone(),
            provider: self.provider.clone(),
            type_name: self.type_name.clone(),
            min_lod: self.min_lod,
            max_lod: self.max_lod,
            visible: self.visible,
            read_only: self.read_only,
            version: self.name_version + self.visible_version + self.lod_version,
        }
    }
}

/// Outcome of partitioning the directory against feature query parameters.
#[derive(Debug, Default)]
pub(crate) struct FilterResult {
    /// Sets whose features all qualify on visibility/LOD grounds; they share
    /// one statement with no version-guard predicates.
    pub no_check: Vec<i64>,
    /// Sets with live overrides and at least one qualifying row; each gets
    /// its own version-guarded statement.
    pub check: Vec<FeatureSetDefn>,
}

#[derive(Debug)]
pub(crate) struct DirectoryCache {
    entries: HashMap<i64, FeatureSetDefn>,
    // LOD envelope across all sets, for fast whole-query rejection.
    agg_min_lod: i32,
    agg_max_lod: i32,
    any_lod_check: bool,
    any_read_only: bool,
    dirty: bool,
}

impl DirectoryCache {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            agg_min_lod: 0,
            agg_max_lod: 0,
            any_lod_check: false,
            any_read_only: false,
            dirty: true,
        }
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Reloads from the table if stale and recomputes the aggregates.
    pub fn validate(&mut self, conn: &Connection) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let mut entries = HashMap::new();
        let mut stmt = conn.prepare(
            "SELECT id, name, name_version, visible, visible_version, visible_check, \
                    min_lod, max_lod, lod_version, lod_check, type, provider, \
                    read_only \
             FROM featuresets",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let defn = FeatureSetDefn {
                id: row.get(0)?,
                name: row.get(1)?,
                name_version: row.get(2)?,
                visible: row.get::<_, i64>(3)? != 0,
                visible_version: row.get(4)?,
                visible_check: row.get::<_, i64>(5)? != 0,
                min_lod: row.get(6)?,
                max_lod: row.get(7)?,
                lod_version: row.get(8)?,
                lod_check: row.get::<_, i64>(9)? != 0,
                type_name: row.get(10)?,
                provider: row.get(11)?,
                read_only: row.get::<_, i64>(12)? != 0,
            };
            entries.insert(defn.id, defn);
        }
        drop(rows);
        drop(stmt);

        self.agg_min_lod = entries.values().map(|d| d.min_lod).min().unwrap_or(0);
        self.agg_max_lod = entries.values().map(|d| d.max_lod).max().unwrap_or(0);
        self.any_lod_check = entries.values().any(|d| d.lod_check);
        self.any_read_only = entries.values().any(|d| d.read_only);
        debug!(sets = entries.len(), "feature set directory reloaded");
        self.entries = entries;
        self.dirty = false;
        Ok(())
    }

    pub fn get(&self, id: i64) -> Option<&FeatureSetDefn> {
        self.entries.get(&id)
    }

    pub fn contains(&self, id: i64) -> bool {
        self.entries.contains_key(&id)
    }

    /// Whether any set in the directory is flagged read-only. Clear means
    /// content mutations can skip the per-set lookup entirely.
    pub fn any_read_only(&self) -> bool {
        self.any_read_only
    }

    /// Feature sets matching `params`, by in-memory state alone except for
    /// the visibility probe on check-flagged sets.
    pub fn query_sets(
        &self,
        conn: &Connection,
        params: &FeatureSetQueryParameters,
    ) -> Result<Vec<FeatureSet>> {
        let mut out = Vec::new();
        for defn in self.entries.values() {
            if !Self::set_matches(defn, params) {
                continue;
            }
            if params.visible_only && !set_visibility_qualifies(conn, defn)? {
                continue;
            }
            out.push(defn.to_feature_set());
        }
        out.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then(a.id.cmp(&b.id))
        });
        Ok(out)
    }

    /// Ids of the sets matching `params` on in-memory state alone
    /// (visibility is ignored here; mutations target matching sets whether
    /// currently visible or not).
    pub fn matching_set_ids(&self, params: &FeatureSetQueryParameters) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .entries
            .values()
            .filter(|d| Self::set_matches(d, params))
            .map(|d| d.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    fn set_matches(defn: &FeatureSetDefn, params: &FeatureSetQueryParameters) -> bool {
        if let Some(ids) = &params.ids {
            if !ids.contains(&defn.id) {
                return false;
            }
        }
        if let Some(names) = &params.names {
            if !matches_any(names, &defn.name) {
                return false;
            }
        }
        if let Some(types) = &params.types {
            if !matches_any(types, &defn.type_name) {
                return false;
            }
        }
        if let Some(providers) = &params.providers {
            if !matches_any(providers, &defn.provider) {
                return false;
            }
        }
        true
    }

    fn feature_params_match(defn: &FeatureSetDefn, params: &FeatureQueryParameters) -> bool {
        if let Some(ids) = &params.feature_set_ids {
            if !ids.contains(&defn.id) {
                return false;
            }
        }
        if let Some(names) = &params.feature_set_names {
            if !matches_any(names, &defn.name) {
                return false;
            }
        }
        if let Some(types) = &params.types {
            if !matches_any(types, &defn.type_name) {
                return false;
            }
        }
        if let Some(providers) = &params.providers {
            if !matches_any(providers, &defn.provider) {
                return false;
            }
        }
        true
    }

    /// Partitions the directory for a feature query.
    pub fn filter(
        &self,
        conn: &Connection,
        params: &FeatureQueryParameters,
    ) -> Result<FilterResult> {
        let (query_min_lod, query_max_lod) = query::query_lod_band(params);
        let mut result = FilterResult::default();

        // whole-directory rejection on the LOD envelope
        if !self.entries.is_empty() && !self.any_lod_check {
            if let Some(qmin) = query_min_lod {
                if self.agg_max_lod < qmin {
                    return Ok(result);
                }
            }
            if let Some(qmax) = query_max_lod {
                if self.agg_min_lod > qmax {
                    return Ok(result);
                }
            }
        }

        for defn in self.entries.values() {
            if !Self::feature_params_match(defn, params) {
                continue;
            }

            let visibility_checked = params.visible_only && defn.visible_check;
            let lod_filtered = query_min_lod.is_some() || query_max_lod.is_some();
            let lod_checked = lod_filtered && defn.lod_check;

            // soft tests where the check flag is clear
            if params.visible_only && !defn.visible_check && !defn.visible {
                continue;
            }
            if lod_filtered && !defn.lod_check {
                if !lod_band_intersects(defn, query_min_lod, query_max_lod) {
                    continue;
                }
            }

            if !visibility_checked && !lod_checked {
                result.no_check.push(defn.id);
                continue;
            }

            // hard probe: does any row survive the version guards?
            let mut probe = WhereClauseBuilder::new();
            probe.begin_condition();
            probe.append("features.fsid = ?");
            probe.add_arg(crate::bind::BindArgument::Long(defn.id));
            if visibility_checked {
                probe.begin_condition();
                query::append_visibility_guard(&mut probe, defn);
            }
            if lod_checked {
                probe.begin_condition();
                query::append_lod_guard(&mut probe, defn, query_min_lod, query_max_lod);
            }
            let (selection, args) = probe.into_parts();
            let sql = format!(
                "SELECT 1 FROM features WHERE {} LIMIT 1",
                selection.unwrap_or_else(|| "1".to_string())
            );
            let mut stmt = conn.prepare(&sql)?;
            let hit = stmt
                .query(rusqlite::params_from_iter(args.iter()))?
                .next()?
                .is_some();
            if hit {
                result.check.push(defn.clone());
            }
        }

        result.no_check.sort_unstable();
        result.check.sort_by_key(|d| d.id);
        Ok(result)
    }
}

/// Whether the set's LOD range intersects the query band.
pub(crate) fn lod_band_intersects(defn: &FeatureSetDefn, qmin: Option<i32>, qmax: Option<i32>) -> bool {
    if let Some(qmin) = qmin {
        if defn.max_lod < qmin {
            return false;
        }
    }
    if let Some(qmax) = qmax {
        if defn.min_lod > qmax {
            return false;
        }
    }
    true
}

/// Set-level visibility answer: soft when the check flag is clear, a count
/// probe over the version guard otherwise.
pub(crate) fn set_visibility_qualifies(conn: &Connection, defn: &FeatureSetDefn) -> Result<bool> {
    if !defn.visible_check {
        return Ok(defn.visible);
    }
    let mut probe = WhereClauseBuilder::new();
    probe.begin_condition();
    probe.append("features.fsid = ?");
    probe.add_arg(crate::bind::BindArgument::Long(defn.id));
    probe.begin_condition();
    query::append_visibility_guard(&mut probe, defn);
    let (selection, args) = probe.into_parts();
    let sql = format!(
        "SELECT 1 FROM features WHERE {} LIMIT 1",
        selection.unwrap_or_else(|| "1".to_string())
    );
    let mut stmt = conn.prepare(&sql)?;
    let found = stmt
        .query(rusqlite::params_from_iter(args.iter()))?
        .next()?
        .is_some();
    Ok(found)
}

impl Default for DirectoryCache {
    fn default() -> Self {
        Self::new()
    }
}
