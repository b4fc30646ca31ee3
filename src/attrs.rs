//! # Attributes: Values, Schema Registry, Binary Codec
//!
//! Features carry an open-ended bag of typed attributes. Rather than storing
//! them as text, the store codes each attribute set into a compact binary
//! blob keyed by a persistent *schema registry*: every `(key, type)` pair
//! observed across the database is assigned a stable integer id in the
//! `attribs_schema` table, and blobs reference attributes by that id instead
//! of repeating key strings.
//!
//! ## Blob format
//!
//! All integers are big-endian.
//!
//! ```text
//! i32 codec version (currently 1)
//! i32 entry count
//! per entry:
//!   i32 schema id          -- row id in attribs_schema
//!   value payload          -- layout determined by the schema's type code
//! ```
//!
//! Value payloads: scalars are fixed-width (`i32`, `i64`, `f64`); strings and
//! blobs are an `i32` byte length (`-1` = null) followed by the bytes; arrays
//! are an `i32` element count (`-1` = null) followed by the elements; nested
//! attribute sets recurse into the full format, version header included.
//!
//! The registry grows append-only: ids are never reused or remapped, so any
//! historical blob remains decodable. Decoding works off an [`Arc`] snapshot
//! of the id map, letting open cursors decode safely while the registry is
//! reloaded or extended behind them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::{Buf, BufMut};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::{Error, Result};

/// Blob format version written by this build.
const CODEC_VERSION: i32 = 1;

// =============================================================================
// Type codes
// =============================================================================
// Stable wire/database identifiers for attribute value types. Appending new
// codes is fine; renumbering is not.

pub(crate) const TYPE_INT: u8 = 0;
pub(crate) const TYPE_LONG: u8 = 1;
pub(crate) const TYPE_DOUBLE: u8 = 2;
pub(crate) const TYPE_STRING: u8 = 3;
pub(crate) const TYPE_BINARY: u8 = 4;
pub(crate) const TYPE_NESTED: u8 = 5;
pub(crate) const TYPE_INT_ARRAY: u8 = 6;
pub(crate) const TYPE_LONG_ARRAY: u8 = 7;
pub(crate) const TYPE_DOUBLE_ARRAY: u8 = 8;
pub(crate) const TYPE_STRING_ARRAY: u8 = 9;
pub(crate) const TYPE_BINARY_ARRAY: u8 = 10;

/// True if `code` names a type this build can code.
pub(crate) fn code_is_valid(code: u8) -> bool {
    code <= TYPE_BINARY_ARRAY
}

// =============================================================================
// Values
// =============================================================================

/// A single typed attribute value.
///
/// String, blob, and array variants admit null (`None`); binary array
/// *elements* may additionally be individually null.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Int(i32),
    Long(i64),
    Double(f64),
    Text(Option<String>),
    Blob(Option<Vec<u8>>),
    Nested(AttributeSet),
    IntArray(Option<Vec<i32>>),
    LongArray(Option<Vec<i64>>),
    DoubleArray(Option<Vec<f64>>),
    TextArray(Option<Vec<String>>),
    BlobArray(Option<Vec<Option<Vec<u8>>>>),
}

impl AttributeValue {
    pub(crate) fn type_code(&self) -> u8 {
        match self {
            AttributeValue::Int(_) => TYPE_INT,
            AttributeValue::Long(_) => TYPE_LONG,
            AttributeValue::Double(_) => TYPE_DOUBLE,
            AttributeValue::Text(_) => TYPE_STRING,
            AttributeValue::Blob(_) => TYPE_BINARY,
            AttributeValue::Nested(_) => TYPE_NESTED,
            AttributeValue::IntArray(_) => TYPE_INT_ARRAY,
            AttributeValue::LongArray(_) => TYPE_LONG_ARRAY,
            AttributeValue::DoubleArray(_) => TYPE_DOUBLE_ARRAY,
            AttributeValue::TextArray(_) => TYPE_STRING_ARRAY,
            AttributeValue::BlobArray(_) => TYPE_BINARY_ARRAY,
        }
    }
}

/// An ordered map of attribute name to value.
///
/// Iteration (and therefore encoding) order is the key order, so equal sets
/// always produce byte-identical blobs.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AttributeSet {
    entries: BTreeMap<String, AttributeValue>,
}

impl AttributeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: AttributeValue) {
        self.entries.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<AttributeValue> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttributeValue)> {
        self.entries.iter()
    }
}

// =============================================================================
// Schema registry
// =============================================================================

/// One registered `(key, type)` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeSpec {
    pub id: i64,
    pub key: String,
    pub type_code: u8,
}

/// In-memory mirror of the `attribs_schema` table.
///
/// A key may appear under several type codes (a *secondary definition*, e.g.
/// when a producer changes an attribute from `Int` to `Long`); each pairing
/// gets its own id. The registry is reloaded lazily: mutations elsewhere
/// mark it dirty and the next use pulls the full table.
#[derive(Debug)]
pub struct AttributeSchemaRegistry {
    by_id: Arc<HashMap<i64, AttributeSpec>>,
    by_key: HashMap<String, HashMap<u8, i64>>,
    dirty: bool,
}

impl AttributeSchemaRegistry {
    pub fn new() -> Self {
        Self {
            by_id: Arc::new(HashMap::new()),
            by_key: HashMap::new(),
            dirty: true,
        }
    }

    /// Flags the in-memory mirror stale; the next [`validate`](Self::validate)
    /// reloads from the table.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Reloads the mirror from `attribs_schema` if stale.
    pub fn validate(&mut self, conn: &Connection) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let mut by_id: HashMap<i64, AttributeSpec> = HashMap::new();
        let mut by_key: HashMap<String, HashMap<u8, i64>> = HashMap::new();
        let mut stmt = conn.prepare("SELECT id, name, coding FROM attribs_schema")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let key: String = row.get(1)?;
            let coding: i64 = row.get(2)?;
            if coding < 0 || coding > TYPE_BINARY_ARRAY as i64 {
                return Err(Error::Unsupported(format!(
                    "attribute schema {} has unknown type code {}",
                    id, coding
                )));
            }
            let type_code = coding as u8;
            by_key.entry(key.clone()).or_default().insert(type_code, id);
            by_id.insert(
                id,
                AttributeSpec {
                    id,
                    key,
                    type_code,
                },
            );
        }
        debug!(specs = by_id.len(), "attribute schema reloaded");
        self.by_id = Arc::new(by_id);
        self.by_key = by_key;
        self.dirty = false;
        Ok(())
    }

    /// A shared snapshot of the id map for use by decoders outside the lock.
    pub fn snapshot(&self) -> Arc<HashMap<i64, AttributeSpec>> {
        Arc::clone(&self.by_id)
    }

    /// Returns the schema id for `(key, type_code)`, registering it in the
    /// table on first use. New ids are persisted immediately so concurrent
    /// blobs can never reference an id the table lacks.
    pub fn schema_id(&mut self, conn: &Connection, key: &str, type_code: u8) -> Result<i64> {
        if let Some(id) = self.by_key.get(key).and_then(|m| m.get(&type_code)) {
            return Ok(*id);
        }
        // Another connection may have registered it since our last reload.
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM attribs_schema WHERE name = ? AND coding = ?",
                params![key, type_code as i64],
                |row| row.get(0),
            )
            .optional()?;
        let id = match existing {
            Some(id) => id,
            None => {
                conn.execute(
                    "INSERT INTO attribs_schema (name, coding) VALUES (?, ?)",
                    params![key, type_code as i64],
                )?;
                conn.last_insert_rowid()
            }
        };
        Arc::make_mut(&mut self.by_id).insert(
            id,
            AttributeSpec {
                id,
                key: key.to_string(),
                type_code,
            },
        );
        self.by_key
            .entry(key.to_string())
            .or_default()
            .insert(type_code, id);
        Ok(id)
    }
}

impl Default for AttributeSchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Encoding
// =============================================================================

/// Encodes `attrs` into the binary blob form, registering any unseen
/// `(key, type)` pairs along the way.
pub fn encode_attributes(
    conn: &Connection,
    registry: &mut AttributeSchemaRegistry,
    attrs: &AttributeSet,
) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64);
    encode_set(conn, registry, attrs, &mut buf)?;
    Ok(buf)
}

fn encode_set(
    conn: &Connection,
    registry: &mut AttributeSchemaRegistry,
    attrs: &AttributeSet,
    buf: &mut Vec<u8>,
) -> Result<()> {
    buf.put_i32(CODEC_VERSION);
    buf.put_i32(attrs.len() as i32);
    for (key, value) in attrs.iter() {
        let id = registry.schema_id(conn, key, value.type_code())?;
        // the entry header carries the schema id as an i32
        let id = i32::try_from(id).map_err(|_| {
            Error::Unsupported(format!("attribute schema id {} exceeds codec range", id))
        })?;
        buf.put_i32(id);
        encode_value(conn, registry, value, buf)?;
    }
    Ok(())
}

fn encode_value(
    conn: &Connection,
    registry: &mut AttributeSchemaRegistry,
    value: &AttributeValue,
    buf: &mut Vec<u8>,
) -> Result<()> {
    match value {
        AttributeValue::Int(v) => buf.put_i32(*v),
        AttributeValue::Long(v) => buf.put_i64(*v),
        AttributeValue::Double(v) => buf.put_f64(*v),
        AttributeValue::Text(v) => put_opt_bytes(buf, v.as_ref().map(|s| s.as_bytes())),
        AttributeValue::Blob(v) => put_opt_bytes(buf, v.as_deref()),
        AttributeValue::Nested(set) => encode_set(conn, registry, set, buf)?,
        AttributeValue::IntArray(v) => put_array(buf, v.as_deref(), |b, e| b.put_i32(*e)),
        AttributeValue::LongArray(v) => put_array(buf, v.as_deref(), |b, e| b.put_i64(*e)),
        AttributeValue::DoubleArray(v) => put_array(buf, v.as_deref(), |b, e| b.put_f64(*e)),
        AttributeValue::TextArray(v) => put_array(buf, v.as_deref(), |b, e: &String| {
            put_opt_bytes(b, Some(e.as_bytes()))
        }),
        AttributeValue::BlobArray(v) => put_array(buf, v.as_deref(), |b, e: &Option<Vec<u8>>| {
            put_opt_bytes(b, e.as_deref())
        }),
    }
    Ok(())
}

fn put_opt_bytes(buf: &mut Vec<u8>, bytes: Option<&[u8]>) {
    match bytes {
        None => buf.put_i32(-1),
        Some(b) => {
            buf.put_i32(b.len() as i32);
            buf.put_slice(b);
        }
    }
}

fn put_array<T>(buf: &mut Vec<u8>, arr: Option<&[T]>, mut put: impl FnMut(&mut Vec<u8>, &T)) {
    match arr {
        None => buf.put_i32(-1),
        Some(elems) => {
            buf.put_i32(elems.len() as i32);
            for e in elems {
                put(buf, e);
            }
        }
    }
}

// =============================================================================
// Decoding
// =============================================================================

/// Decodes an attribute blob against a registry snapshot.
pub fn decode_attributes(
    blob: &[u8],
    specs: &HashMap<i64, AttributeSpec>,
) -> Result<AttributeSet> {
    let mut buf = blob;
    let set = decode_set(&mut buf, specs)?;
    Ok(set)
}

fn decode_set(buf: &mut &[u8], specs: &HashMap<i64, AttributeSpec>) -> Result<AttributeSet> {
    let version = take_i32(buf)?;
    if version != CODEC_VERSION {
        return Err(Error::Unsupported(format!(
            "attribute blob version {} not supported",
            version
        )));
    }
    let count = take_i32(buf)?;
    if count < 0 {
        return Err(Error::Io(format!("negative attribute count {}", count)));
    }
    let mut set = AttributeSet::new();
    for _ in 0..count {
        let id = i64::from(take_i32(buf)?);
        let spec = specs.get(&id).ok_or_else(|| {
            Error::InvalidArgument(format!("attribute blob references unknown schema id {}", id))
        })?;
        let value = decode_value(buf, specs, spec.type_code)?;
        set.insert(spec.key.clone(), value);
    }
    Ok(set)
}

fn decode_value(
    buf: &mut &[u8],
    specs: &HashMap<i64, AttributeSpec>,
    type_code: u8,
) -> Result<AttributeValue> {
    Ok(match type_code {
        TYPE_INT => AttributeValue::Int(take_i32(buf)?),
        TYPE_LONG => AttributeValue::Long(take_i64(buf)?),
        TYPE_DOUBLE => AttributeValue::Double(take_f64(buf)?),
        TYPE_STRING => AttributeValue::Text(match take_opt_bytes(buf)? {
            None => None,
            Some(b) => Some(String::from_utf8(b).map_err(|e| Error::Io(e.to_string()))?),
        }),
        TYPE_BINARY => AttributeValue::Blob(take_opt_bytes(buf)?),
        TYPE_NESTED => AttributeValue::Nested(decode_set(buf, specs)?),
        TYPE_INT_ARRAY => AttributeValue::IntArray(take_array(buf, take_i32)?),
        TYPE_LONG_ARRAY => AttributeValue::LongArray(take_array(buf, take_i64)?),
        TYPE_DOUBLE_ARRAY => AttributeValue::DoubleArray(take_array(buf, take_f64)?),
        TYPE_STRING_ARRAY => AttributeValue::TextArray(take_array(buf, |b| {
            match take_opt_bytes(b)? {
                None => Err(Error::Io("null element in string array".to_string())),
                Some(bytes) => {
                    String::from_utf8(bytes).map_err(|e| Error::Io(e.to_string()))
                }
            }
        })?),
        TYPE_BINARY_ARRAY => AttributeValue::BlobArray(take_array(buf, take_opt_bytes)?),
        other => {
            return Err(Error::Unsupported(format!(
                "unknown attribute type code {}",
                other
            )))
        }
    })
}

fn need(buf: &[u8], n: usize) -> Result<()> {
    if buf.remaining() < n {
        Err(Error::Io(format!(
            "truncated attribute blob: need {} bytes, have {}",
            n,
            buf.remaining()
        )))
    } else {
        Ok(())
    }
}

fn take_i32(buf: &mut &[u8]) -> Result<i32> {
    need(buf, 4)?;
    Ok(buf.get_i32())
}

fn take_i64(buf: &mut &[u8]) -> Result<i64> {
    need(buf, 8)?;
    Ok(buf.get_i64())
}

fn take_f64(buf: &mut &[u8]) -> Result<f64> {
    need(buf, 8)?;
    Ok(buf.get_f64())
}

fn take_opt_bytes(buf: &mut &[u8]) -> Result<Option<Vec<u8>>> {
    let len = take_i32(buf)?;
    if len < 0 {
        return Ok(None);
    }
    let len = len as usize;
    need(buf, len)?;
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(Some(out))
}

fn take_array<T>(
    buf: &mut &[u8],
    mut take: impl FnMut(&mut &[u8]) -> Result<T>,
) -> Result<Option<Vec<T>>> {
    let count = take_i32(buf)?;
    if count < 0 {
        return Ok(None);
    }
    let mut out = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        out.push(take(buf)?);
    }
    Ok(Some(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE attribs_schema (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 name TEXT,
                 coding INTEGER
             );",
        )
        .unwrap();
        conn
    }

    fn rich_set() -> AttributeSet {
        let mut nested = AttributeSet::new();
        nested.insert("speed", AttributeValue::Double(12.5));
        nested.insert("unit", AttributeValue::Text(Some("m/s".to_string())));

        let mut set = AttributeSet::new();
        set.insert("count", AttributeValue::Int(7));
        set.insert("timestamp", AttributeValue::Long(1_700_000_000_000));
        set.insert("elevation", AttributeValue::Double(184.25));
        set.insert("callsign", AttributeValue::Text(Some("VIPER-2".to_string())));
        set.insert("remarks", AttributeValue::Text(None));
        set.insert("icon", AttributeValue::Blob(Some(vec![0xde, 0xad, 0xbe])));
        set.insert("track", AttributeValue::Nested(nested));
        set.insert("lods", AttributeValue::IntArray(Some(vec![3, 7, 12])));
        set.insert("ids", AttributeValue::LongArray(None));
        set.insert(
            "samples",
            AttributeValue::DoubleArray(Some(vec![1.0, -2.5])),
        );
        set.insert(
            "tags",
            AttributeValue::TextArray(Some(vec!["a".to_string(), "b".to_string()])),
        );
        set.insert(
            "chunks",
            AttributeValue::BlobArray(Some(vec![Some(vec![1, 2]), None])),
        );
        set
    }

    #[test]
    fn test_roundtrip_rich_set() {
        let conn = test_conn();
        let mut registry = AttributeSchemaRegistry::new();
        registry.validate(&conn).unwrap();

        let set = rich_set();
        let blob = encode_attributes(&conn, &mut registry, &set).unwrap();
        let decoded = decode_attributes(&blob, &registry.snapshot()).unwrap();
        assert_eq!(decoded, set);
    }

    #[test]
    fn test_deterministic_encoding() {
        let conn = test_conn();
        let mut registry = AttributeSchemaRegistry::new();
        registry.validate(&conn).unwrap();

        let set = rich_set();
        let a = encode_attributes(&conn, &mut registry, &set).unwrap();
        let b = encode_attributes(&conn, &mut registry, &set).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_registry_persists_and_survives_reload() {
        let conn = test_conn();
        let mut registry = AttributeSchemaRegistry::new();
        registry.validate(&conn).unwrap();

        let mut set = AttributeSet::new();
        set.insert("name", AttributeValue::Text(Some("x".to_string())));
        let blob = encode_attributes(&conn, &mut registry, &set).unwrap();

        // A fresh registry over the same connection must decode the blob.
        let mut fresh = AttributeSchemaRegistry::new();
        fresh.validate(&conn).unwrap();
        let decoded = decode_attributes(&blob, &fresh.snapshot()).unwrap();
        assert_eq!(decoded, set);
    }

    #[test]
    fn test_secondary_definition_gets_new_id() {
        let conn = test_conn();
        let mut registry = AttributeSchemaRegistry::new();
        registry.validate(&conn).unwrap();

        let a = registry.schema_id(&conn, "count", TYPE_INT).unwrap();
        let b = registry.schema_id(&conn, "count", TYPE_LONG).unwrap();
        assert_ne!(a, b);
        // repeat lookups are stable
        assert_eq!(registry.schema_id(&conn, "count", TYPE_INT).unwrap(), a);
    }

    #[test]
    fn test_snapshot_survives_registry_growth() {
        let conn = test_conn();
        let mut registry = AttributeSchemaRegistry::new();
        registry.validate(&conn).unwrap();

        let mut set = AttributeSet::new();
        set.insert("a", AttributeValue::Int(1));
        let blob = encode_attributes(&conn, &mut registry, &set).unwrap();
        let snapshot = registry.snapshot();

        // growth after the snapshot must not disturb it
        registry.schema_id(&conn, "b", TYPE_DOUBLE).unwrap();
        let decoded = decode_attributes(&blob, &snapshot).unwrap();
        assert_eq!(decoded, set);
    }

    #[test]
    fn test_unknown_schema_id_rejected() {
        let conn = test_conn();
        let mut registry = AttributeSchemaRegistry::new();
        registry.validate(&conn).unwrap();

        let mut set = AttributeSet::new();
        set.insert("a", AttributeValue::Int(1));
        let blob = encode_attributes(&conn, &mut registry, &set).unwrap();

        let empty = HashMap::new();
        let err = decode_attributes(&blob, &empty).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_truncated_blob_rejected() {
        let conn = test_conn();
        let mut registry = AttributeSchemaRegistry::new();
        registry.validate(&conn).unwrap();

        let mut set = AttributeSet::new();
        set.insert("name", AttributeValue::Text(Some("hello".to_string())));
        let blob = encode_attributes(&conn, &mut registry, &set).unwrap();

        for cut in 1..blob.len() {
            let err = decode_attributes(&blob[..cut], &registry.snapshot());
            assert!(err.is_err(), "truncation at {} should fail", cut);
        }
    }

    #[test]
    fn test_bad_version_rejected() {
        let mut blob = Vec::new();
        blob.put_i32(99);
        blob.put_i32(0);
        let err = decode_attributes(&blob, &HashMap::new()).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn test_entry_schema_id_is_four_bytes() {
        let conn = test_conn();
        let mut registry = AttributeSchemaRegistry::new();
        registry.validate(&conn).unwrap();

        let mut set = AttributeSet::new();
        set.insert("count", AttributeValue::Int(7));
        let blob = encode_attributes(&conn, &mut registry, &set).unwrap();
        // version + entry count + schema id + i32 payload
        assert_eq!(blob.len(), 16);

        let id = registry.schema_id(&conn, "count", TYPE_INT).unwrap();
        let mut cursor = &blob[8..];
        assert_eq!(i64::from(take_i32(&mut cursor).unwrap()), id);
        assert_eq!(decode_attributes(&blob, &registry.snapshot()).unwrap(), set);
    }

    #[test]
    fn test_empty_set_roundtrip() {
        let conn = test_conn();
        let mut registry = AttributeSchemaRegistry::new();
        registry.validate(&conn).unwrap();

        let set = AttributeSet::new();
        let blob = encode_attributes(&conn, &mut registry, &set).unwrap();
        assert_eq!(blob.len(), 8);
        let decoded = decode_attributes(&blob, &registry.snapshot()).unwrap();
        assert!(decoded.is_empty());
    }
}
