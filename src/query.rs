//! # Query Compilation
//!
//! Translates [`FeatureQueryParameters`] into one or more SQL statements over
//! the `features` table and stitches their results into a single cursor.
//!
//! The statement count is driven by the directory partition (see
//! [`crate::directory`]): all sets without live overrides share one statement
//! carrying no version guards, while every set with live overrides gets its
//! own statement whose `WHERE` clause embeds that set's version counters.
//! With a single statement, ordering and pagination push down into SQL; with
//! several, each statement is sorted individually, a merging cursor restores
//! the global order, and pagination is applied client-side on top (each
//! statement still bounded to `limit + offset` rows so no sub-query fetches
//! more than the page could ever need).
//!
//! Spatial restrictions prefer the R*Tree index via an `IN (SELECT id FROM
//! idx_features_geometry ...)` subselect; for very coarse query resolutions
//! (tile level 2 and below, where most of the table qualifies anyway) they
//! fall back to an `Intersects(BuildMbr(...), geometry)` scan. Regions that
//! cross the anti-meridian are split into in-range envelopes and OR-ed.

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::{params_from_iter, Connection};
use tracing::debug;

use crate::attrs::AttributeSpec;
use crate::bind::{BindArgument, WhereClauseBuilder};
use crate::cursor::{
    empty_specs, FeatureCursor, LimitOffsetCursor, MergingCursor, RawRow, RowCursor,
};
use crate::directory::{lod_band_intersects, DirectoryCache, FeatureSetDefn, FilterResult};
use crate::lod;
use crate::types::{
    has_bits, Envelope, FeatureQueryParameters, Order, SpatialFilter, FIELD_ALTITUDE,
    FIELD_ATTRIBUTES, FIELD_GEOMETRY, FIELD_NAME, FIELD_STYLE,
};
use crate::Result;

/// One compiled SQL statement with its bind arguments.
#[derive(Debug)]
pub(crate) struct Statement {
    pub sql: String,
    pub args: Vec<BindArgument>,
}

/// The query LOD band implied by the resolution range, as tile levels.
pub(crate) fn query_lod_band(params: &FeatureQueryParameters) -> (Option<i32>, Option<i32>) {
    (
        params.min_resolution.map(lod::tile_level),
        params.max_resolution.map(lod::tile_level),
    )
}

// =============================================================================
// Version guards
// =============================================================================

/// Appends the visibility predicate for a set with live visibility overrides.
///
/// Only overrides stamped with the set's *current* `visible_version` count;
/// rows with a stale stamp fall back to the set default. When the default is
/// visible that means stale rows pass, otherwise only current visible
/// overrides pass.
pub(crate) fn append_visibility_guard(b: &mut WhereClauseBuilder, defn: &FeatureSetDefn) {
    if defn.visible {
        b.append(
            "(features.visible_version != ? OR \
             (features.visible_version = ? AND features.visible = 1))",
        );
        b.add_arg(BindArgument::Long(defn.visible_version));
        b.add_arg(BindArgument::Long(defn.visible_version));
    } else {
        b.append("(features.visible_version = ? AND features.visible = 1)");
        b.add_arg(BindArgument::Long(defn.visible_version));
    }
}

/// Appends the LOD predicate for a set with live LOD overrides, against the
/// query band `[qmin, qmax]`. Same stale-stamp rule as visibility: stale rows
/// inherit the set range, so they pass exactly when the set range intersects
/// the band.
pub(crate) fn append_lod_guard(
    b: &mut WhereClauseBuilder,
    defn: &FeatureSetDefn,
    qmin: Option<i32>,
    qmax: Option<i32>,
) {
    let mut range = String::new();
    let mut range_args = Vec::new();
    if let Some(qmin) = qmin {
        range.push_str("features.max_lod >= ?");
        range_args.push(BindArgument::Int(qmin));
    }
    if let Some(qmax) = qmax {
        if !range.is_empty() {
            range.push_str(" AND ");
        }
        range.push_str("features.min_lod <= ?");
        range_args.push(BindArgument::Int(qmax));
    }
    if range.is_empty() {
        return;
    }
    if lod_band_intersects(defn, qmin, qmax) {
        b.append(&format!(
            "(features.lod_version != ? OR (features.lod_version = ? AND {}))",
            range
        ));
        b.add_arg(BindArgument::Long(defn.lod_version));
        b.add_arg(BindArgument::Long(defn.lod_version));
    } else {
        b.append(&format!("(features.lod_version = ? AND {})", range));
        b.add_arg(BindArgument::Long(defn.lod_version));
    }
    for arg in range_args {
        b.add_arg(arg);
    }
}

// =============================================================================
// Statement assembly
// =============================================================================

fn select_columns(ignored: u32, for_count: bool) -> String {
    if for_count {
        return "COUNT(1)".to_string();
    }
    let mut cols = vec![
        "features.fid".to_string(),
        "features.fsid".to_string(),
        "features.version".to_string(),
    ];
    cols.push(if has_bits(ignored, FIELD_NAME) {
        "NULL".to_string()
    } else {
        "features.name".to_string()
    });
    cols.push(if has_bits(ignored, FIELD_GEOMETRY) {
        "NULL".to_string()
    } else {
        "features.geometry".to_string()
    });
    cols.push(if has_bits(ignored, FIELD_STYLE) {
        "NULL".to_string()
    } else {
        "styles.coding".to_string()
    });
    cols.push(if has_bits(ignored, FIELD_ATTRIBUTES) {
        "NULL".to_string()
    } else {
        "attributes.value".to_string()
    });
    if has_bits(ignored, FIELD_ALTITUDE) {
        cols.push("0".to_string());
        cols.push("0.0".to_string());
    } else {
        cols.push("features.altitude_mode".to_string());
        cols.push("features.extrude".to_string());
    }
    cols.push("features.min_lod".to_string());
    cols.push("features.max_lod".to_string());
    cols.join(", ")
}

fn from_clause(ignored: u32, for_count: bool) -> String {
    let mut from = "features".to_string();
    if !for_count && !has_bits(ignored, FIELD_STYLE) {
        from.push_str(" LEFT JOIN styles ON features.style_id = styles.id");
    }
    if !for_count && !has_bits(ignored, FIELD_ATTRIBUTES) {
        from.push_str(" LEFT JOIN attributes ON features.attribs_id = attributes.id");
    }
    from
}

/// Splits a query region into envelopes within `[-180, 180]` longitude,
/// unwrapping anti-meridian crossings.
fn split_idl(env: &Envelope) -> Vec<Envelope> {
    if env.max_x - env.min_x >= 360.0 {
        return vec![Envelope::new(-180.0, env.min_y, 180.0, env.max_y)];
    }
    if env.min_x >= -180.0 && env.max_x <= 180.0 {
        return vec![*env];
    }
    let mut out = Vec::new();
    if env.min_x < -180.0 {
        out.push(Envelope::new(-180.0, env.min_y, env.max_x, env.max_y));
        out.push(Envelope::new(env.min_x + 360.0, env.min_y, 180.0, env.max_y));
    } else {
        out.push(Envelope::new(env.min_x, env.min_y, 180.0, env.max_y));
        out.push(Envelope::new(-180.0, env.min_y, env.max_x - 360.0, env.max_y));
    }
    out
}

/// Bounding envelope of a radius around a point, for index prefiltering.
fn radius_envelope(x: f64, y: f64, radius_meters: f64) -> Envelope {
    const METERS_PER_DEGREE: f64 = 111_320.0;
    let dlat = radius_meters / METERS_PER_DEGREE;
    let cos_lat = y.to_radians().cos().abs().max(0.01);
    let dlon = radius_meters / (METERS_PER_DEGREE * cos_lat);
    Envelope::new(x - dlon, y - dlat, x + dlon, y + dlat)
}

fn append_spatial_filter(
    b: &mut WhereClauseBuilder,
    filter: &SpatialFilter,
    indexed: bool,
) {
    let region = match filter {
        SpatialFilter::Region(env) => *env,
        SpatialFilter::Radius {
            x,
            y,
            radius_meters,
        } => radius_envelope(*x, *y, *radius_meters),
    };

    let regions = split_idl(&region);
    let mut terms = Vec::new();
    let mut args = Vec::new();
    for env in &regions {
        if indexed {
            terms.push(
                "features.fid IN (SELECT id FROM idx_features_geometry \
                 WHERE max_x >= ? AND min_x <= ? AND max_y >= ? AND min_y <= ?)"
                    .to_string(),
            );
        } else {
            terms.push("Intersects(BuildMbr(?, ?, ?, ?), features.geometry) = 1".to_string());
        }
        if indexed {
            args.push(BindArgument::Double(env.min_x));
            args.push(BindArgument::Double(env.max_x));
            args.push(BindArgument::Double(env.min_y));
            args.push(BindArgument::Double(env.max_y));
        } else {
            args.push(BindArgument::Double(env.min_x));
            args.push(BindArgument::Double(env.min_y));
            args.push(BindArgument::Double(env.max_x));
            args.push(BindArgument::Double(env.max_y));
        }
    }
    let fragment = if terms.len() > 1 {
        format!("({})", terms.join(" OR "))
    } else {
        terms.remove(0)
    };
    b.append(&fragment);
    for arg in args {
        b.add_arg(arg);
    }

    if let SpatialFilter::Radius {
        x,
        y,
        radius_meters,
    } = filter
    {
        b.begin_condition();
        b.append("Distance(features.geometry, MakePoint(?, ?)) <= ?");
        b.add_arg(BindArgument::Double(*x));
        b.add_arg(BindArgument::Double(*y));
        b.add_arg(BindArgument::Double(*radius_meters));
    }
}

/// Predicates shared by every statement of the query: feature ids, feature
/// names, and the spatial restriction.
fn append_common_filters(b: &mut WhereClauseBuilder, params: &FeatureQueryParameters) {
    if let Some(ids) = &params.feature_ids {
        let mut ids: Vec<i64> = ids.iter().copied().collect();
        ids.sort_unstable();
        b.begin_condition();
        b.append_in_args(
            "features.fid",
            ids.into_iter().map(BindArgument::Long).collect(),
        );
    }
    if let Some(names) = &params.feature_names {
        b.begin_condition();
        b.append_in("features.name", names);
    }
    if let Some(filter) = &params.spatial_filter {
        let (_, qmax) = query_lod_band(params);
        // below level 3 the region covers most of the table; the index
        // subselect just adds overhead there
        let indexed = qmax.map_or(true, |l| l > 2);
        b.begin_condition();
        append_spatial_filter(b, filter, indexed);
    }
}

fn order_clause(order: &[Order]) -> (String, Vec<BindArgument>) {
    let mut terms = Vec::new();
    let mut args = Vec::new();
    for clause in order {
        match clause {
            Order::FeatureId => terms.push("features.fid ASC".to_string()),
            Order::FeatureName => terms.push("features.name COLLATE NOCASE ASC".to_string()),
            Order::FeatureSet => terms.push("features.fsid ASC".to_string()),
            Order::Distance { x, y } => {
                terms.push("Distance(features.geometry, MakePoint(?, ?)) ASC".to_string());
                args.push(BindArgument::Double(*x));
                args.push(BindArgument::Double(*y));
            }
            Order::Resolution => terms.push("features.max_lod DESC".to_string()),
        }
    }
    if !order.contains(&Order::FeatureId) {
        // deterministic total order
        terms.push("features.fid ASC".to_string());
    }
    (terms.join(", "), args)
}

/// Builds the statements for a partitioned query. `for_count` strips the
/// column list down to `COUNT(1)` and drops ordering and pagination.
pub(crate) fn build_feature_statements(
    filter: &FilterResult,
    params: &FeatureQueryParameters,
    for_count: bool,
) -> Vec<Statement> {
    let (qmin, qmax) = query_lod_band(params);
    let multi = (usize::from(!filter.no_check.is_empty()) + filter.check.len()) > 1;

    let effective_order: Vec<Order> = if !for_count && multi && params.order.is_empty() {
        vec![Order::FeatureId]
    } else {
        params.order.clone()
    };

    let mut statements = Vec::new();
    let mut push = |builder: WhereClauseBuilder| {
        let (selection, mut args) = builder.into_parts();
        let mut sql = format!(
            "SELECT {} FROM {}",
            select_columns(params.ignored_fields, for_count),
            from_clause(params.ignored_fields, for_count)
        );
        if let Some(sel) = selection {
            sql.push_str(" WHERE ");
            sql.push_str(&sel);
        }
        if !for_count {
            if !effective_order.is_empty() {
                let (order_sql, order_args) = order_clause(&effective_order);
                sql.push_str(" ORDER BY ");
                sql.push_str(&order_sql);
                args.extend(order_args);
            }
            match (params.limit, multi) {
                (Some(limit), false) => {
                    sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, params.offset));
                }
                (Some(limit), true) => {
                    // each sub-query need never produce more than one page
                    // plus the skipped prefix
                    sql.push_str(&format!(" LIMIT {}", limit + params.offset));
                }
                (None, false) if params.offset > 0 => {
                    sql.push_str(&format!(" LIMIT -1 OFFSET {}", params.offset));
                }
                _ => {}
            }
        }
        statements.push(Statement { sql, args });
    };

    if !filter.no_check.is_empty() {
        let mut b = WhereClauseBuilder::new();
        b.begin_condition();
        b.append_in_args(
            "features.fsid",
            filter.no_check.iter().map(|id| BindArgument::Long(*id)).collect(),
        );
        append_common_filters(&mut b, params);
        push(b);
    }

    for defn in &filter.check {
        let mut b = WhereClauseBuilder::new();
        b.begin_condition();
        b.append("features.fsid = ?");
        b.add_arg(BindArgument::Long(defn.id));
        if params.visible_only && defn.visible_check {
            b.begin_condition();
            append_visibility_guard(&mut b, defn);
        }
        if (qmin.is_some() || qmax.is_some()) && defn.lod_check {
            b.begin_condition();
            append_lod_guard(&mut b, defn, qmin, qmax);
        }
        append_common_filters(&mut b, params);
        push(b);
    }

    statements
}

// =============================================================================
// Execution
// =============================================================================

fn execute_statement(
    conn: &Connection,
    stmt: &Statement,
    specs: &Arc<HashMap<i64, AttributeSpec>>,
) -> Result<RowCursor> {
    let mut prepared = conn.prepare(&stmt.sql)?;
    let mut rows = prepared.query(params_from_iter(stmt.args.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(RawRow {
            fid: row.get(0)?,
            fsid: row.get(1)?,
            version: row.get(2)?,
            name: row.get(3)?,
            geometry: row.get(4)?,
            style: row.get(5)?,
            attribs: row.get(6)?,
            altitude_mode: row.get(7)?,
            extrude: row.get(8)?,
            min_lod: row.get(9)?,
            max_lod: row.get(10)?,
        });
    }
    Ok(RowCursor::new(out, Arc::clone(specs)))
}

/// Compiles and executes a feature query, returning the combined cursor.
pub(crate) fn query_features(
    conn: &Connection,
    directory: &DirectoryCache,
    specs: Arc<HashMap<i64, AttributeSpec>>,
    params: &FeatureQueryParameters,
) -> Result<Box<dyn FeatureCursor + Send>> {
    let filter = directory.filter(conn, params)?;
    let statements = build_feature_statements(&filter, params, false);
    debug!(statements = statements.len(), "feature query compiled");
    if statements.is_empty() {
        return Ok(Box::new(RowCursor::empty()));
    }

    let specs = if has_bits(params.ignored_fields, FIELD_ATTRIBUTES) {
        empty_specs()
    } else {
        specs
    };

    if statements.len() == 1 {
        // ordering and pagination already pushed into the SQL
        return Ok(Box::new(execute_statement(conn, &statements[0], &specs)?));
    }

    let mut subs: Vec<Box<dyn FeatureCursor + Send>> = Vec::with_capacity(statements.len());
    for stmt in &statements {
        subs.push(Box::new(execute_statement(conn, stmt, &specs)?));
    }
    let order = if params.order.is_empty() {
        vec![Order::FeatureId]
    } else {
        params.order.clone()
    };
    let merged = MergingCursor::new(subs, order);
    if params.limit.is_some() || params.offset > 0 {
        Ok(Box::new(LimitOffsetCursor::new(
            Box::new(merged),
            params.offset,
            params.limit,
        )))
    } else {
        Ok(Box::new(merged))
    }
}

/// Counts the features a query would return, honoring limit/offset.
pub(crate) fn query_features_count(
    conn: &Connection,
    directory: &DirectoryCache,
    params: &FeatureQueryParameters,
) -> Result<usize> {
    let filter = directory.filter(conn, params)?;
    let statements = build_feature_statements(&filter, params, true);
    let mut total: usize = 0;
    for stmt in &statements {
        let mut prepared = conn.prepare(&stmt.sql)?;
        let n: i64 = prepared.query_row(params_from_iter(stmt.args.iter()), |row| row.get(0))?;
        total += n.max(0) as usize;
    }
    let after_offset = total.saturating_sub(params.offset);
    Ok(match params.limit {
        Some(limit) => after_offset.min(limit),
        None => after_offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defn(id: i64) -> FeatureSetDefn {
        FeatureSetDefn {
            id,
            name: format!("set-{}", id),
            name_version: 1,
            visible: true,
            visible_version: 4,
            visible_check: true,
            min_lod: 0,
            max_lod: 21,
            lod_version: 2,
            lod_check: false,
            type_name: "geojson".to_string(),
            provider: "import".to_string(),
            read_only: false,
        }
    }

    #[test]
    fn test_visibility_guard_default_visible() {
        let mut b = WhereClauseBuilder::new();
        b.begin_condition();
        append_visibility_guard(&mut b, &defn(1));
        assert_eq!(
            b.selection(),
            Some(
                "(features.visible_version != ? OR \
                 (features.visible_version = ? AND features.visible = 1))"
            )
        );
        assert_eq!(b.args().len(), 2);
    }

    #[test]
    fn test_visibility_guard_default_invisible() {
        let mut d = defn(1);
        d.visible = false;
        let mut b = WhereClauseBuilder::new();
        b.begin_condition();
        append_visibility_guard(&mut b, &d);
        assert_eq!(
            b.selection(),
            Some("(features.visible_version = ? AND features.visible = 1)")
        );
        assert_eq!(b.args().len(), 1);
    }

    #[test]
    fn test_lod_guard_set_range_intersecting() {
        let mut d = defn(1);
        d.lod_check = true;
        let mut b = WhereClauseBuilder::new();
        b.begin_condition();
        append_lod_guard(&mut b, &d, Some(5), Some(10));
        let sel = b.selection().unwrap().to_string();
        assert!(sel.starts_with("(features.lod_version != ? OR"), "{}", sel);
        assert!(sel.contains("features.max_lod >= ?"));
        assert!(sel.contains("features.min_lod <= ?"));
    }

    #[test]
    fn test_lod_guard_set_range_disjoint() {
        let mut d = defn(1);
        d.lod_check = true;
        d.min_lod = 0;
        d.max_lod = 3;
        let mut b = WhereClauseBuilder::new();
        b.begin_condition();
        append_lod_guard(&mut b, &d, Some(5), None);
        let sel = b.selection().unwrap().to_string();
        // stale rows inherit a disjoint set range, so only current
        // overrides may pass
        assert!(sel.starts_with("(features.lod_version = ?"), "{}", sel);
    }

    #[test]
    fn test_single_statement_pushes_pagination_down() {
        let filter = FilterResult {
            no_check: vec![1, 2],
            check: vec![],
        };
        let mut params = FeatureQueryParameters::default();
        params.limit = Some(10);
        params.offset = 5;
        params.order = vec![Order::FeatureName];
        let stmts = build_feature_statements(&filter, &params, false);
        assert_eq!(stmts.len(), 1);
        assert!(stmts[0].sql.contains("features.fsid IN (?, ?)"));
        assert!(stmts[0].sql.contains("ORDER BY features.name COLLATE NOCASE ASC"));
        assert!(stmts[0].sql.ends_with("LIMIT 10 OFFSET 5"));
    }

    #[test]
    fn test_multi_statement_bounds_each_page() {
        let filter = FilterResult {
            no_check: vec![1],
            check: vec![defn(2)],
        };
        let mut params = FeatureQueryParameters::default();
        params.visible_only = true;
        params.limit = Some(10);
        params.offset = 5;
        let stmts = build_feature_statements(&filter, &params, false);
        assert_eq!(stmts.len(), 2);
        for stmt in &stmts {
            assert!(stmt.sql.ends_with("LIMIT 15"), "{}", stmt.sql);
            // ordering is forced so the merge precondition holds
            assert!(stmt.sql.contains("ORDER BY features.fid ASC"));
        }
        // the no-check statement carries no version guard
        assert!(!stmts[0].sql.contains("visible_version"));
        assert!(stmts[1].sql.contains("visible_version"));
    }

    #[test]
    fn test_count_statements_have_no_order_or_limit() {
        let filter = FilterResult {
            no_check: vec![1],
            check: vec![defn(2)],
        };
        let mut params = FeatureQueryParameters::default();
        params.visible_only = true;
        params.limit = Some(10);
        let stmts = build_feature_statements(&filter, &params, true);
        for stmt in &stmts {
            assert!(stmt.sql.starts_with("SELECT COUNT(1) FROM features"));
            assert!(!stmt.sql.contains("ORDER BY"));
            assert!(!stmt.sql.contains("LIMIT"));
        }
    }

    #[test]
    fn test_ignored_fields_drop_joins() {
        let filter = FilterResult {
            no_check: vec![1],
            check: vec![],
        };
        let mut params = FeatureQueryParameters::default();
        params.ignored_fields = FIELD_STYLE | FIELD_ATTRIBUTES;
        let stmts = build_feature_statements(&filter, &params, false);
        assert!(!stmts[0].sql.contains("LEFT JOIN"));
        assert!(!stmts[0].sql.contains("styles.coding"));
        let unmasked = build_feature_statements(
            &filter,
            &FeatureQueryParameters::default(),
            false,
        );
        assert!(unmasked[0].sql.contains("LEFT JOIN styles"));
        assert!(unmasked[0].sql.contains("LEFT JOIN attributes"));
    }

    #[test]
    fn test_spatial_filter_indexed_subselect() {
        let filter = FilterResult {
            no_check: vec![1],
            check: vec![],
        };
        let mut params = FeatureQueryParameters::default();
        params.spatial_filter = Some(SpatialFilter::Region(Envelope::new(
            0.0, 0.0, 10.0, 10.0,
        )));
        let stmts = build_feature_statements(&filter, &params, false);
        assert!(stmts[0].sql.contains("SELECT id FROM idx_features_geometry"));
    }

    #[test]
    fn test_spatial_filter_coarse_query_skips_index() {
        let filter = FilterResult {
            no_check: vec![1],
            check: vec![],
        };
        let mut params = FeatureQueryParameters::default();
        params.spatial_filter = Some(SpatialFilter::Region(Envelope::new(
            0.0, 0.0, 10.0, 10.0,
        )));
        // level 1: whole-world scale
        params.max_resolution = Some(crate::lod::tile_resolution(1));
        let stmts = build_feature_statements(&filter, &params, false);
        assert!(!stmts[0].sql.contains("idx_features_geometry"));
        assert!(stmts[0].sql.contains("Intersects(BuildMbr(?, ?, ?, ?)"));
    }

    #[test]
    fn test_split_idl() {
        let inside = Envelope::new(-10.0, -10.0, 10.0, 10.0);
        assert_eq!(split_idl(&inside), vec![inside]);

        let east = split_idl(&Envelope::new(170.0, 0.0, 190.0, 10.0));
        assert_eq!(east.len(), 2);
        assert_eq!(east[0], Envelope::new(170.0, 0.0, 180.0, 10.0));
        assert_eq!(east[1], Envelope::new(-180.0, 0.0, -170.0, 10.0));

        let west = split_idl(&Envelope::new(-190.0, 0.0, -170.0, 10.0));
        assert_eq!(west.len(), 2);
        assert_eq!(west[0], Envelope::new(-180.0, 0.0, -170.0, 10.0));
        assert_eq!(west[1], Envelope::new(170.0, 0.0, 180.0, 10.0));

        let whole = split_idl(&Envelope::new(-200.0, -80.0, 200.0, 80.0));
        assert_eq!(whole, vec![Envelope::new(-180.0, -80.0, 180.0, 80.0)]);
    }

    #[test]
    fn test_radius_spatial_filter_adds_distance_term() {
        let filter = FilterResult {
            no_check: vec![1],
            check: vec![],
        };
        let mut params = FeatureQueryParameters::default();
        params.spatial_filter = Some(SpatialFilter::Radius {
            x: 10.0,
            y: 20.0,
            radius_meters: 500.0,
        });
        let stmts = build_feature_statements(&filter, &params, false);
        assert!(stmts[0]
            .sql
            .contains("Distance(features.geometry, MakePoint(?, ?)) <= ?"));
    }

    #[test]
    fn test_query_lod_band() {
        let mut params = FeatureQueryParameters::default();
        assert_eq!(query_lod_band(&params), (None, None));
        params.min_resolution = Some(crate::lod::tile_resolution(5));
        params.max_resolution = Some(crate::lod::tile_resolution(12));
        assert_eq!(query_lod_band(&params), (Some(5), Some(12)));
    }
}
