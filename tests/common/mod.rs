//! Shared fixtures for integration tests.
#![allow(dead_code)]

use featuredb::{Envelope, FeatureInsert, FeatureStore, Geometry, Style};

pub fn point(x: f64, y: f64) -> Geometry {
    Geometry::new(Envelope::point(x, y), vec![])
}

/// A store with `sets` feature sets, each holding `per_set` features named
/// `f-<set>-<n>` at distinct points. Returns (store, set ids, feature ids
/// grouped by set).
pub fn seed_store(sets: usize, per_set: usize) -> (FeatureStore, Vec<i64>, Vec<Vec<i64>>) {
    let store = FeatureStore::open_in_memory().expect("open store");
    let mut set_ids = Vec::new();
    let mut feature_ids = Vec::new();
    for s in 0..sets {
        let fsid = store
            .insert_feature_set(&format!("layer-{}", s), "import", "geojson", 0, 21)
            .expect("insert set");
        set_ids.push(fsid);
        let mut fids = Vec::new();
        for n in 0..per_set {
            let insert = FeatureInsert::new(point(s as f64 * 10.0, n as f64))
                .name(format!("f-{}-{}", s, n))
                .style(Style::new("PEN(c:#000000)"));
            fids.push(store.insert_feature(fsid, &insert).expect("insert feature"));
        }
        feature_ids.push(fids);
    }
    (store, set_ids, feature_ids)
}

/// Drains a cursor into the list of feature names.
pub fn collect_names(
    cursor: &mut Box<dyn featuredb::FeatureCursor + Send>,
) -> Vec<String> {
    let mut out = Vec::new();
    while cursor.move_to_next().expect("advance") {
        out.push(cursor.name().expect("name").unwrap_or_default());
    }
    out
}

/// Drains a cursor into the list of feature ids.
pub fn collect_ids(cursor: &mut Box<dyn featuredb::FeatureCursor + Send>) -> Vec<i64> {
    let mut out = Vec::new();
    while cursor.move_to_next().expect("advance") {
        out.push(cursor.id().expect("id"));
    }
    out
}
