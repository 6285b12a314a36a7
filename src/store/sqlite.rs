//! SQLite-backed store.
//!
//! One row per item; attributes are a JSON document. Conditional writes run
//! in `BEGIN IMMEDIATE` transactions so the read-modify-write is atomic
//! across processes sharing the file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rusqlite::{params, Connection, TransactionBehavior};
use serde_json::Value;

use super::{
    apply_add_to_set, apply_nested, apply_put_if_absent, apply_tag, Item, ItemKey, Store,
    StoreResult,
};
use crate::sqlite::{connect, to_option};

pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn new(db_path: &Path) -> StoreResult<Self> {
        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn connect(&self) -> StoreResult<Connection> {
        Ok(connect(&self.db_path)?)
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS items (
                table_name TEXT NOT NULL,
                item_key TEXT NOT NULL,
                attributes TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (table_name, item_key)
            );
        "#,
        )?;
        Ok(())
    }

    fn update<T>(
        &self,
        table: &str,
        key: &ItemKey,
        f: impl FnOnce(&mut Item) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let key_json = serde_json::to_string(key)?;
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<String> = to_option(tx.query_row(
            "SELECT attributes FROM items WHERE table_name = ? AND item_key = ?",
            params![table, key_json],
            |row| row.get(0),
        ))?;
        let mut item: Item = match existing {
            Some(json) => serde_json::from_str(&json)?,
            None => Item::new(),
        };

        let result = f(&mut item)?;

        tx.execute(
            "INSERT INTO items (table_name, item_key, attributes, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT (table_name, item_key) DO UPDATE SET
                attributes = excluded.attributes,
                updated_at = excluded.updated_at",
            params![
                table,
                key_json,
                serde_json::to_string(&item)?,
                chrono::Utc::now().to_rfc3339()
            ],
        )?;
        tx.commit()?;
        Ok(result)
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_item(&self, table: &str, key: &ItemKey) -> StoreResult<Option<Item>> {
        let conn = self.connect()?;
        let key_json = serde_json::to_string(key)?;
        let json: Option<String> = to_option(conn.query_row(
            "SELECT attributes FROM items WHERE table_name = ? AND item_key = ?",
            params![table, key_json],
            |row| row.get(0),
        ))?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn put_attribute_if_absent(
        &self,
        table: &str,
        key: &ItemKey,
        attr: &str,
        value: Value,
    ) -> StoreResult<Option<Value>> {
        self.update(table, key, |item| Ok(apply_put_if_absent(item, attr, value)))
    }

    async fn set_attribute_if_absent_else_nested(
        &self,
        table: &str,
        key: &ItemKey,
        main_attr: &str,
        nested_attr: &str,
        value: Value,
    ) -> StoreResult<()> {
        self.update(table, key, |item| apply_nested(item, main_attr, nested_attr, value))
    }

    async fn add_to_set(
        &self,
        table: &str,
        key: &ItemKey,
        attr: &str,
        values: &[String],
    ) -> StoreResult<()> {
        self.update(table, key, |item| apply_add_to_set(item, attr, values))
    }

    async fn touch_item(
        &self,
        table: &str,
        key: &ItemKey,
        tag: Option<(&str, Value)>,
    ) -> StoreResult<()> {
        self.update(table, key, |item| {
            apply_tag(item, tag);
            Ok(())
        })
    }

    async fn scan(&self, table: &str) -> StoreResult<Vec<(ItemKey, Item)>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT item_key, attributes FROM items WHERE table_name = ? ORDER BY item_key",
        )?;
        let rows = stmt
            .query_map(params![table], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(key, attrs)| Ok((serde_json::from_str(&key)?, serde_json::from_str(&attrs)?)))
            .collect()
    }
}
