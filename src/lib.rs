//! # featuredb
//!
//! A versioned spatial feature store on embedded SQLite.
//!
//! Features (named geometries with styles and typed attributes) are grouped
//! into feature sets, each carrying default visibility and a level-of-detail
//! range. Individual features may override either default; overrides are
//! *versioned* against the owning set, so flipping the set's default
//! atomically invalidates every stale override without touching feature rows.
//!
//! Queries compile to one SQL statement per feature set with live overrides
//! plus one shared statement for the rest; results come back through
//! forward-only cursors that stay valid after the store's internal lock is
//! released.
//!
//! ```no_run
//! use featuredb::{FeatureStore, FeatureInsert, FeatureQueryParameters, Geometry, Envelope};
//!
//! # fn main() -> featuredb::Result<()> {
//! let store = FeatureStore::open("features.db")?;
//! let fsid = store.insert_feature_set("roads", "import", "geojson", 0, 21)?;
//! store.insert_feature(
//!     fsid,
//!     &FeatureInsert::new(Geometry::new(Envelope::point(-78.8, 35.9), vec![])).name("main st"),
//! )?;
//!
//! let mut params = FeatureQueryParameters::default();
//! params.visible_only = true;
//! let mut cursor = store.query_features(&params)?;
//! while cursor.move_to_next()? {
//!     println!("{}", cursor.name()?.unwrap_or_default());
//! }
//! # Ok(())
//! # }
//! ```

mod attrs;
mod bind;
mod cursor;
mod directory;
mod error;
mod lod;
mod query;
mod schema;
mod store;
mod types;

pub use attrs::{AttributeSet, AttributeSpec, AttributeValue};
pub use bind::{BindArgument, WhereClauseBuilder};
pub use cursor::{FeatureCursor, FeatureSetCursor};
pub use error::{Error, Result};
pub use lod::{tile_level, tile_resolution};
pub use schema::DATABASE_SCHEMA_VERSION;
pub use store::{BulkInsertion, FeatureInsert, FeatureStore};
pub use types::{
    AltitudeMode, Envelope, Feature, FeatureQueryParameters, FeatureSet,
    FeatureSetQueryParameters, Geometry, Order, SpatialFilter, Style, FIELD_ALTITUDE,
    FIELD_ATTRIBUTES, FIELD_GEOMETRY, FIELD_NAME, FIELD_STYLE,
};
