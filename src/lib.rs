//! Attribute lookup core - product attribute filtering for storefronts
//!
//! Compiles layered navigation attribute filters into SQL over a
//! denormalized product attributes lookup table, counts products per term
//! behind an expiring cache, and normalizes URLs and filesystem paths.

pub mod cache;
pub mod config;
pub mod filterer;
pub mod lookup;
pub mod sql;
pub mod url;

pub use cache::{Clock, MemoryCache, SqliteTransientStore, SystemClock, TransientCache};
pub use config::{ConfigError, FilterSettings};
pub use filterer::{
    AttributeFilter, AttributeFilterRequest, ClauseSet, CountsByQuery, Filterer, MainQuery,
    QueryContext, QueryExecutor, QueryType, TermCounts, TermId, TermResolver,
};
pub use lookup::{Catalog, LookupRow, LookupStore, ProductRecord, StoreStats};
pub use sql::{SqlFragment, SqlValue};
pub use url::{Url, UrlError};
