//! Key/value item store.
//!
//! Items are JSON objects addressed by a table name and a small string key.
//! The write operations are conditional so that concurrent workers get
//! deterministic first-writer-wins behavior.

mod content;
mod memory;
mod sqlite;

pub use content::{select_latest_variant, ContentEntry, CONTENT_ENCODING_RAW, CONTENT_ENCODING_XZ};
pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

/// Maps numeric channel ids to tag handles.
pub const HANDLES_TABLE: &str = "handles";

/// Scraped channel posts and their comment captures.
pub const POSTS_TABLE: &str = "posts";

/// Item key. Ordered so its serialized form is canonical.
pub type ItemKey = BTreeMap<String, String>;

/// Item attributes (key attributes excluded).
pub type Item = Map<String, Value>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("attribute '{attr}' is not {expected}")]
    TypeMismatch { attr: String, expected: &'static str },

    #[error("content stored under '{hash}' does not match its digest")]
    DigestMismatch { hash: String },

    #[error("compression error: {0}")]
    Compression(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Compression(e.to_string())
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Build an [`ItemKey`] from pairs.
pub fn item_key<const N: usize>(pairs: [(&str, &str); N]) -> ItemKey {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_item(&self, table: &str, key: &ItemKey) -> StoreResult<Option<Item>>;

    /// Set `attr` unless it already exists. Returns the existing value when
    /// the write did not happen.
    async fn put_attribute_if_absent(
        &self,
        table: &str,
        key: &ItemKey,
        attr: &str,
        value: Value,
    ) -> StoreResult<Option<Value>>;

    /// Create `main_attr` as `{nested_attr: value}`, or insert `nested_attr`
    /// into the existing map.
    async fn set_attribute_if_absent_else_nested(
        &self,
        table: &str,
        key: &ItemKey,
        main_attr: &str,
        nested_attr: &str,
        value: Value,
    ) -> StoreResult<()>;

    /// Add strings to a set-valued attribute.
    async fn add_to_set(
        &self,
        table: &str,
        key: &ItemKey,
        attr: &str,
        values: &[String],
    ) -> StoreResult<()>;

    /// Create the item if missing, optionally setting one tag attribute.
    async fn touch_item(
        &self,
        table: &str,
        key: &ItemKey,
        tag: Option<(&str, Value)>,
    ) -> StoreResult<()>;

    /// Every item of a table, ordered by key.
    async fn scan(&self, table: &str) -> StoreResult<Vec<(ItemKey, Item)>>;
}

// Item mutations shared by the backends.

fn apply_put_if_absent(item: &mut Item, attr: &str, value: Value) -> Option<Value> {
    match item.get(attr) {
        Some(existing) => Some(existing.clone()),
        None => {
            item.insert(attr.to_string(), value);
            None
        }
    }
}

fn apply_nested(item: &mut Item, main_attr: &str, nested_attr: &str, value: Value) -> StoreResult<()> {
    let entry = item
        .entry(main_attr.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    match entry {
        Value::Object(map) => {
            map.insert(nested_attr.to_string(), value);
            Ok(())
        }
        _ => Err(StoreError::TypeMismatch {
            attr: main_attr.to_string(),
            expected: "a map",
        }),
    }
}

fn apply_add_to_set(item: &mut Item, attr: &str, values: &[String]) -> StoreResult<()> {
    let entry = item
        .entry(attr.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    let Value::Array(set) = entry else {
        return Err(StoreError::TypeMismatch {
            attr: attr.to_string(),
            expected: "a set",
        });
    };
    for value in values {
        if !set.iter().any(|v| v.as_str() == Some(value)) {
            set.push(Value::String(value.clone()));
        }
    }
    Ok(())
}

fn apply_tag(item: &mut Item, tag: Option<(&str, Value)>) {
    if let Some((path, value)) = tag {
        item.insert(path.to_string(), value);
    }
}
