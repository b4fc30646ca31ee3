//! # Feature Cursors
//!
//! Query results come back through cursors rather than materialized vectors
//! so callers can stop early and so column work (geometry parsing, attribute
//! decoding) happens only for rows actually touched.
//!
//! Every cursor follows the same three-phase life: *before first* (freshly
//! returned, not yet on a row), *positioned* (after `move_to_next` returned
//! `true`), and *exhausted* (after it returned `false`). Column accessors are
//! only legal while positioned; elsewhere they fail with
//! [`Error::IllegalState`](crate::Error::IllegalState). Exhaustion itself is
//! not an error.
//!
//! Three implementations compose: [`RowCursor`] walks the rows of one
//! compiled statement, [`MergingCursor`] interleaves several sorted cursors
//! preserving a shared ordering, and [`LimitOffsetCursor`] applies pagination
//! client-side when it cannot be pushed into SQL.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use crate::attrs::{decode_attributes, AttributeSet, AttributeSpec};
use crate::types::{
    envelope_from_blob, haversine_meters, AltitudeMode, Envelope, Feature, FeatureSet, Geometry,
    Order, Style,
};
use crate::{Error, Result};

// =============================================================================
// Trait
// =============================================================================

/// A forward-only cursor over feature query results.
pub trait FeatureCursor {
    /// Advances to the next row. Returns `false` once the cursor is
    /// exhausted; further calls keep returning `false`.
    fn move_to_next(&mut self) -> Result<bool>;

    fn id(&self) -> Result<i64>;
    fn feature_set_id(&self) -> Result<i64>;
    fn version(&self) -> Result<i64>;
    /// `None` when the name field was excluded from the query.
    fn name(&self) -> Result<Option<String>>;
    /// The geometry's bounding envelope, without materializing the payload.
    fn envelope(&self) -> Result<Option<Envelope>>;
    fn geometry(&self) -> Result<Option<Geometry>>;
    fn style(&self) -> Result<Option<Style>>;
    /// Decodes the row's attributes; the decode is cached per row.
    fn attributes(&mut self) -> Result<Option<AttributeSet>>;
    fn altitude_mode(&self) -> Result<AltitudeMode>;
    fn extrude(&self) -> Result<f64>;
    /// The row's LOD eligibility range.
    fn min_lod(&self) -> Result<i32>;
    fn max_lod(&self) -> Result<i32>;

    /// Materializes the current row as a [`Feature`].
    fn get(&mut self) -> Result<Feature> {
        Ok(Feature {
            id: self.id()?,
            feature_set_id: self.feature_set_id()?,
            version: self.version()?,
            name: self.name()?,
            geometry: self.geometry()?,
            style: self.style()?,
            attributes: self.attributes()?,
            altitude_mode: self.altitude_mode()?,
            extrude: self.extrude()?,
        })
    }
}

// =============================================================================
// RowCursor
// =============================================================================

/// One row of a compiled feature statement, fetched eagerly.
///
/// Rows are buffered at execution time: prepared statements borrow the
/// database connection, and cursors must remain iterable after the store's
/// lock is released. Geometry and attributes stay in their raw encoded form
/// until a caller asks for them.
#[derive(Debug, Clone, Default)]
pub(crate) struct RawRow {
    pub fid: i64,
    pub fsid: i64,
    pub version: i64,
    pub name: Option<String>,
    pub geometry: Option<Vec<u8>>,
    pub style: Option<String>,
    pub attribs: Option<Vec<u8>>,
    pub altitude_mode: i32,
    pub extrude: f64,
    pub min_lod: i32,
    pub max_lod: i32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    BeforeFirst,
    At(usize),
    Exhausted,
}

/// Cursor over the buffered rows of a single statement.
pub(crate) struct RowCursor {
    rows: Vec<RawRow>,
    state: State,
    specs: Arc<HashMap<i64, AttributeSpec>>,
    // per-row decode cache, cleared on every advance
    attr_cache: Option<Option<AttributeSet>>,
}

impl RowCursor {
    pub fn new(rows: Vec<RawRow>, specs: Arc<HashMap<i64, AttributeSpec>>) -> Self {
        Self {
            rows,
            state: State::BeforeFirst,
            specs,
            attr_cache: None,
        }
    }

    /// An always-empty cursor.
    pub fn empty() -> Self {
        Self::new(Vec::new(), Arc::new(HashMap::new()))
    }

    fn row(&self) -> Result<&RawRow> {
        match self.state {
            State::At(i) => Ok(&self.rows[i]),
            _ => Err(Error::IllegalState(
                "cursor is not positioned on a row".to_string(),
            )),
        }
    }
}

impl FeatureCursor for RowCursor {
    fn move_to_next(&mut self) -> Result<bool> {
        self.attr_cache = None;
        let next = match self.state {
            State::BeforeFirst => 0,
            State::At(i) => i + 1,
            State::Exhausted => return Ok(false),
        };
        if next < self.rows.len() {
            self.state = State::At(next);
            Ok(true)
        } else {
            self.state = State::Exhausted;
            Ok(false)
        }
    }

    fn id(&self) -> Result<i64> {
        Ok(self.row()?.fid)
    }

    fn feature_set_id(&self) -> Result<i64> {
        Ok(self.row()?.fsid)
    }

    fn version(&self) -> Result<i64> {
        Ok(self.row()?.version)
    }

    fn name(&self) -> Result<Option<String>> {
        Ok(self.row()?.name.clone())
    }

    fn envelope(&self) -> Result<Option<Envelope>> {
        match &self.row()?.geometry {
            None => Ok(None),
            Some(blob) => Ok(Some(envelope_from_blob(blob)?)),
        }
    }

    fn geometry(&self) -> Result<Option<Geometry>> {
        match &self.row()?.geometry {
            None => Ok(None),
            Some(blob) => Ok(Some(Geometry::from_blob(blob)?)),
        }
    }

    fn style(&self) -> Result<Option<Style>> {
        Ok(self.row()?.style.clone().map(Style::new))
    }

    fn attributes(&mut self) -> Result<Option<AttributeSet>> {
        if let Some(cached) = &self.attr_cache {
            return Ok(cached.clone());
        }
        let decoded = match &self.row()?.attribs {
            None => None,
            Some(blob) => Some(decode_attributes(blob, &self.specs)?),
        };
        self.attr_cache = Some(decoded.clone());
        Ok(decoded)
    }

    fn altitude_mode(&self) -> Result<AltitudeMode> {
        Ok(AltitudeMode::from_code(self.row()?.altitude_mode))
    }

    fn extrude(&self) -> Result<f64> {
        Ok(self.row()?.extrude)
    }

    fn min_lod(&self) -> Result<i32> {
        Ok(self.row()?.min_lod)
    }

    fn max_lod(&self) -> Result<i32> {
        Ok(self.row()?.max_lod)
    }
}

// =============================================================================
// MergingCursor
// =============================================================================

/// Interleaves several sub-cursors, each already sorted by the shared
/// ordering, into one sorted stream.
///
/// Sub-cursors live in one of three places: `pending` (positioned on a row,
/// kept sorted by that row), `invalid` (need advancing before they can be
/// compared again), or `current` (supplying the row accessors). Advancing
/// moves `current` to `invalid`, advances everything invalid (dropping the
/// exhausted), re-sorts, and promotes the smallest head.
pub(crate) struct MergingCursor {
    pending: Vec<Box<dyn FeatureCursor + Send>>,
    invalid: Vec<Box<dyn FeatureCursor + Send>>,
    current: Option<Box<dyn FeatureCursor + Send>>,
    order: Vec<Order>,
}

impl MergingCursor {
    pub fn new(cursors: Vec<Box<dyn FeatureCursor + Send>>, order: Vec<Order>) -> Self {
        Self {
            pending: Vec::new(),
            invalid: cursors,
            current: None,
            order,
        }
    }

    fn current(&self) -> Result<&(dyn FeatureCursor + Send)> {
        self.current.as_deref().ok_or_else(|| {
            Error::IllegalState("cursor is not positioned on a row".to_string())
        })
    }
}

impl FeatureCursor for MergingCursor {
    fn move_to_next(&mut self) -> Result<bool> {
        if let Some(cur) = self.current.take() {
            self.invalid.push(cur);
        }
        for mut cursor in self.invalid.drain(..) {
            if cursor.move_to_next()? {
                self.pending.push(cursor);
            }
            // exhausted sub-cursors are retired here
        }
        let order = std::mem::take(&mut self.order);
        self.pending
            .sort_by(|a, b| compare_heads(a.as_ref(), b.as_ref(), &order));
        self.order = order;
        if self.pending.is_empty() {
            return Ok(false);
        }
        self.current = Some(self.pending.remove(0));
        Ok(true)
    }

    fn id(&self) -> Result<i64> {
        self.current()?.id()
    }

    fn feature_set_id(&self) -> Result<i64> {
        self.current()?.feature_set_id()
    }

    fn version(&self) -> Result<i64> {
        self.current()?.version()
    }

    fn name(&self) -> Result<Option<String>> {
        self.current()?.name()
    }

    fn envelope(&self) -> Result<Option<Envelope>> {
        self.current()?.envelope()
    }

    fn geometry(&self) -> Result<Option<Geometry>> {
        self.current()?.geometry()
    }

    fn style(&self) -> Result<Option<Style>> {
        self.current()?.style()
    }

    fn attributes(&mut self) -> Result<Option<AttributeSet>> {
        match self.current.as_deref_mut() {
            Some(cur) => cur.attributes(),
            None => Err(Error::IllegalState(
                "cursor is not positioned on a row".to_string(),
            )),
        }
    }

    fn altitude_mode(&self) -> Result<AltitudeMode> {
        self.current()?.altitude_mode()
    }

    fn extrude(&self) -> Result<f64> {
        self.current()?.extrude()
    }

    fn min_lod(&self) -> Result<i32> {
        self.current()?.min_lod()
    }

    fn max_lod(&self) -> Result<i32> {
        self.current()?.max_lod()
    }
}

/// Orders two positioned cursors by the shared ordering clauses, falling
/// back to feature id so the merge is total and deterministic.
fn compare_heads(
    a: &(dyn FeatureCursor + Send),
    b: &(dyn FeatureCursor + Send),
    order: &[Order],
) -> Ordering {
    for clause in order {
        let ord = match clause {
            Order::FeatureId => cmp_key(a, b, |c| c.id().unwrap_or(i64::MAX)),
            // ASCII-only folding, matching SQLite's NOCASE collation
            Order::FeatureName => cmp_key(a, b, |c| {
                c.name().ok().flatten().unwrap_or_default().to_ascii_lowercase()
            }),
            Order::FeatureSet => cmp_key(a, b, |c| c.feature_set_id().unwrap_or(i64::MAX)),
            Order::Distance { x, y } => {
                let dist = |c: &(dyn FeatureCursor + Send)| match c.envelope() {
                    Ok(Some(env)) => {
                        let (cx, cy) = env.center();
                        haversine_meters(cx, cy, *x, *y)
                    }
                    _ => f64::MAX,
                };
                dist(a).partial_cmp(&dist(b)).unwrap_or(Ordering::Equal)
            }
            // coarsest first
            Order::Resolution => cmp_key(b, a, |c| c.max_lod().unwrap_or(i32::MIN)),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    cmp_key(a, b, |c| c.id().unwrap_or(i64::MAX))
}

fn cmp_key<K: Ord>(
    a: &(dyn FeatureCursor + Send),
    b: &(dyn FeatureCursor + Send),
    key: impl Fn(&(dyn FeatureCursor + Send)) -> K,
) -> Ordering {
    key(a).cmp(&key(b))
}

// =============================================================================
// LimitOffsetCursor
// =============================================================================

/// Applies `LIMIT`/`OFFSET` semantics over an inner cursor, for queries
/// where pagination could not be pushed into the SQL.
pub(crate) struct LimitOffsetCursor {
    inner: Box<dyn FeatureCursor + Send>,
    // rows still owed to the offset; decremented per skip so an error
    // mid-skip leaves the remainder for the next call
    to_skip: usize,
    limit: Option<usize>,
    returned: usize,
}

impl LimitOffsetCursor {
    pub fn new(inner: Box<dyn FeatureCursor + Send>, offset: usize, limit: Option<usize>) -> Self {
        Self {
            inner,
            to_skip: offset,
            limit,
            returned: 0,
        }
    }
}

impl FeatureCursor for LimitOffsetCursor {
    fn move_to_next(&mut self) -> Result<bool> {
        while self.to_skip > 0 {
            if !self.inner.move_to_next()? {
                self.to_skip = 0;
                return Ok(false);
            }
            self.to_skip -= 1;
        }
        if let Some(limit) = self.limit {
            if self.returned >= limit {
                return Ok(false);
            }
        }
        if self.inner.move_to_next()? {
            self.returned += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn id(&self) -> Result<i64> {
        self.inner.id()
    }

    fn feature_set_id(&self) -> Result<i64> {
        self.inner.feature_set_id()
    }

    fn version(&self) -> Result<i64> {
        self.inner.version()
    }

    fn name(&self) -> Result<Option<String>> {
        self.inner.name()
    }

    fn envelope(&self) -> Result<Option<Envelope>> {
        self.inner.envelope()
    }

    fn geometry(&self) -> Result<Option<Geometry>> {
        self.inner.geometry()
    }

    fn style(&self) -> Result<Option<Style>> {
        self.inner.style()
    }

    fn attributes(&mut self) -> Result<Option<AttributeSet>> {
        self.inner.attributes()
    }

    fn altitude_mode(&self) -> Result<AltitudeMode> {
        self.inner.altitude_mode()
    }

    fn extrude(&self) -> Result<f64> {
        self.inner.extrude()
    }

    fn min_lod(&self) -> Result<i32> {
        self.inner.min_lod()
    }

    fn max_lod(&self) -> Result<i32> {
        self.inner.max_lod()
    }
}

// =============================================================================
// FeatureSetCursor
// =============================================================================

/// Cursor over feature set query results.
pub struct FeatureSetCursor {
    sets: Vec<FeatureSet>,
    state: State,
}

impl FeatureSetCursor {
    pub(crate) fn new(sets: Vec<FeatureSet>) -> Self {
        Self {
            sets,
            state: State::BeforeFirst,
        }
    }

    pub fn move_to_next(&mut self) -> Result<bool> {
        let next = match self.state {
            State::BeforeFirst => 0,
            State::At(i) => i + 1,
            State::Exhausted => return Ok(false),
        };
        if next < self.sets.len() {
            self.state = State::At(next);
            Ok(true)
        } else {
            self.state = State::Exhausted;
            Ok(false)
        }
    }

    pub fn get(&self) -> Result<&FeatureSet> {
        match self.state {
            State::At(i) => Ok(&self.sets[i]),
            _ => Err(Error::IllegalState(
                "cursor is not positioned on a row".to_string(),
            )),
        }
    }
}

// decoding snapshot for cursors compiled without the attributes column
pub(crate) fn empty_specs() -> Arc<HashMap<i64, AttributeSpec>> {
    Arc::new(HashMap::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(fid: i64, name: &str) -> RawRow {
        RawRow {
            fid,
            fsid: 1,
            version: 1,
            name: Some(name.to_string()),
            extrude: 0.0,
            altitude_mode: 0,
            min_lod: 0,
            max_lod: 21,
            ..Default::default()
        }
    }

    fn ids(mut cursor: impl FeatureCursor) -> Vec<i64> {
        let mut out = Vec::new();
        while cursor.move_to_next().unwrap() {
            out.push(cursor.id().unwrap());
        }
        out
    }

    #[test]
    fn test_row_cursor_state_machine() {
        let mut c = RowCursor::new(vec![row(1, "a"), row(2, "b")], empty_specs());
        // before first: accessors fail
        assert!(matches!(c.id(), Err(Error::IllegalState(_))));
        assert!(c.move_to_next().unwrap());
        assert_eq!(c.id().unwrap(), 1);
        assert!(c.move_to_next().unwrap());
        assert_eq!(c.id().unwrap(), 2);
        assert!(!c.move_to_next().unwrap());
        // exhausted: accessors fail, further advances stay false
        assert!(matches!(c.id(), Err(Error::IllegalState(_))));
        assert!(!c.move_to_next().unwrap());
    }

    #[test]
    fn test_empty_row_cursor() {
        let mut c = RowCursor::empty();
        assert!(!c.move_to_next().unwrap());
    }

    #[test]
    fn test_merge_single_cursor_passthrough() {
        let sub = RowCursor::new(vec![row(1, "a"), row(2, "b")], empty_specs());
        let merged = MergingCursor::new(vec![Box::new(sub)], vec![Order::FeatureId]);
        assert_eq!(ids(merged), vec![1, 2]);
    }

    #[test]
    fn test_merge_two_cursors_by_id() {
        let a = RowCursor::new(vec![row(1, "a"), row(4, "d"), row(5, "e")], empty_specs());
        let b = RowCursor::new(vec![row(2, "b"), row(3, "c")], empty_specs());
        let merged = MergingCursor::new(
            vec![Box::new(a), Box::new(b)],
            vec![Order::FeatureId],
        );
        assert_eq!(ids(merged), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_merge_five_cursors_by_name() {
        let names = [
            vec!["Alpha", "echo"],
            vec!["BRAVO"],
            vec!["charlie", "Foxtrot"],
            vec![],
            vec!["delta"],
        ];
        let mut subs: Vec<Box<dyn FeatureCursor + Send>> = Vec::new();
        let mut fid = 0;
        for group in &names {
            let rows: Vec<RawRow> = group
                .iter()
                .map(|n| {
                    fid += 1;
                    row(fid, n)
                })
                .collect();
            subs.push(Box::new(RowCursor::new(rows, empty_specs())));
        }
        let mut merged = MergingCursor::new(subs, vec![Order::FeatureName]);
        let mut out = Vec::new();
        while merged.move_to_next().unwrap() {
            out.push(merged.name().unwrap().unwrap());
        }
        assert_eq!(
            out,
            vec!["Alpha", "BRAVO", "charlie", "delta", "echo", "Foxtrot"]
        );
    }

    #[test]
    fn test_merge_resolution_orders_coarsest_first() {
        let mut a1 = row(1, "a");
        a1.max_lod = 5;
        let mut a2 = row(2, "b");
        a2.max_lod = 15;
        let mut b1 = row(3, "c");
        b1.max_lod = 10;
        // each sub-cursor sorted by max_lod descending
        let a = RowCursor::new(vec![a2, a1], empty_specs());
        let b = RowCursor::new(vec![b1], empty_specs());
        let merged = MergingCursor::new(
            vec![Box::new(a), Box::new(b)],
            vec![Order::Resolution],
        );
        assert_eq!(ids(merged), vec![2, 3, 1]);
    }

    #[test]
    fn test_merge_tie_breaks_on_id() {
        let a = RowCursor::new(vec![row(2, "same")], empty_specs());
        let b = RowCursor::new(vec![row(1, "same")], empty_specs());
        let merged = MergingCursor::new(
            vec![Box::new(a), Box::new(b)],
            vec![Order::FeatureName],
        );
        assert_eq!(ids(merged), vec![1, 2]);
    }

    #[test]
    fn test_merge_name_folding_matches_nocase() {
        // NOCASE folds A-Z only, so "Ä" keeps its bytes and sorts before
        // "à"; Unicode folding would reverse them
        let a = RowCursor::new(vec![row(1, "\u{e0}")], empty_specs());
        let b = RowCursor::new(vec![row(2, "\u{c4}")], empty_specs());
        let merged = MergingCursor::new(
            vec![Box::new(a), Box::new(b)],
            vec![Order::FeatureName],
        );
        assert_eq!(ids(merged), vec![2, 1]);
    }

    #[test]
    fn test_limit_offset_combinations() {
        let rows: Vec<RawRow> = (1..=5).map(|i| row(i, "r")).collect();
        for (offset, limit, expect) in [
            (0usize, None, vec![1i64, 2, 3, 4, 5]),
            (0, Some(2), vec![1, 2]),
            (2, None, vec![3, 4, 5]),
            (2, Some(2), vec![3, 4]),
            (5, None, vec![]),
            (9, Some(3), vec![]),
            (0, Some(0), vec![]),
        ] {
            let inner = RowCursor::new(rows.clone(), empty_specs());
            let c = LimitOffsetCursor::new(Box::new(inner), offset, limit);
            assert_eq!(ids(c), expect, "offset={} limit={:?}", offset, limit);
        }
    }

    /// Delegates to an inner cursor but fails one advance call, then
    /// recovers.
    struct FailingOnceCursor {
        inner: RowCursor,
        fail_at: usize,
        calls: usize,
    }

    impl FeatureCursor for FailingOnceCursor {
        fn move_to_next(&mut self) -> Result<bool> {
            self.calls += 1;
            if self.calls == self.fail_at {
                return Err(Error::Io("interrupted".to_string()));
            }
            self.inner.move_to_next()
        }

        fn id(&self) -> Result<i64> {
            self.inner.id()
        }

        fn feature_set_id(&self) -> Result<i64> {
            self.inner.feature_set_id()
        }

        fn version(&self) -> Result<i64> {
            self.inner.version()
        }

        fn name(&self) -> Result<Option<String>> {
            self.inner.name()
        }

        fn envelope(&self) -> Result<Option<Envelope>> {
            self.inner.envelope()
        }

        fn geometry(&self) -> Result<Option<Geometry>> {
            self.inner.geometry()
        }

        fn style(&self) -> Result<Option<Style>> {
            self.inner.style()
        }

        fn attributes(&mut self) -> Result<Option<AttributeSet>> {
            self.inner.attributes()
        }

        fn altitude_mode(&self) -> Result<AltitudeMode> {
            self.inner.altitude_mode()
        }

        fn extrude(&self) -> Result<f64> {
            self.inner.extrude()
        }

        fn min_lod(&self) -> Result<i32> {
            self.inner.min_lod()
        }

        fn max_lod(&self) -> Result<i32> {
            self.inner.max_lod()
        }
    }

    #[test]
    fn test_limit_offset_resumes_skip_after_error() {
        let rows: Vec<RawRow> = (1..=5).map(|i| row(i, "r")).collect();
        let inner = FailingOnceCursor {
            inner: RowCursor::new(rows, empty_specs()),
            fail_at: 2,
            calls: 0,
        };
        let mut c = LimitOffsetCursor::new(Box::new(inner), 3, None);
        // first advance dies partway through the offset skip
        assert!(c.move_to_next().is_err());
        // retry finishes the remaining skips instead of forgetting them
        assert!(c.move_to_next().unwrap());
        assert_eq!(c.id().unwrap(), 4);
        assert!(c.move_to_next().unwrap());
        assert_eq!(c.id().unwrap(), 5);
        assert!(!c.move_to_next().unwrap());
    }

    #[test]
    fn test_feature_set_cursor() {
        let sets = vec![FeatureSet {
            id: 1,
            name: "roads".to_string(),
            provider: "import".to_string(),
            type_name: "geojson".to_string(),
            min_lod: 0,
            max_lod: 21,
            visible: true,
            read_only: false,
            version: 3,
        }];
        let mut c = FeatureSetCursor::new(sets);
        assert!(c.get().is_err());
        assert!(c.move_to_next().unwrap());
        assert_eq!(c.get().unwrap().name, "roads");
        assert!(!c.move_to_next().unwrap());
        assert!(c.get().is_err());
    }
}
