//! veridex — embeddable in-memory document database core.
//!
//! Layering, bottom up:
//!
//! ```text
//! wire      varint serializer, variant codec
//! payload   PayloadValue (refcounted COW cell), PayloadType, accessors
//! cjson     TagsMatcher + tag-prefixed binary JSON
//! query     Query model, entries tree, binary/DSL/SQL codecs, expressions
//! ft        full-text index: commit steps, suffix/typo maps, merge planner
//! results   QueryResults + flag-driven result framing
//! core      namespaces, minimal executor, transactions, cancellation ctx
//! binding   handle-based surface: result pool, context table, buffers
//! ```
//!
//! Relational join execution, storage and networking live outside the
//! core; everything they need (query shapes, result frames, payload
//! access) is defined here.

pub mod binding;
pub mod cjson;
pub mod core;
pub mod ft;
pub mod payload;
pub mod query;
pub mod results;
pub mod wire;

pub use crate::core::database::Database;
pub use crate::core::error::{Error, ErrorKind, Result};
pub use crate::core::item::Item;
pub use crate::core::transaction::Transaction;
pub use crate::core::variant::{KeyValueType, Point, Variant, VariantArray};
pub use crate::payload::value::PayloadValue;
pub use crate::query::query::Query;
pub use crate::results::QueryResults;
