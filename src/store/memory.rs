//! In-memory store for tests and single-process runs.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{
    apply_add_to_set, apply_nested, apply_put_if_absent, apply_tag, Item, ItemKey, Store,
    StoreResult,
};

#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<HashMap<String, BTreeMap<ItemKey, Item>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn update<T>(
        &self,
        table: &str,
        key: &ItemKey,
        f: impl FnOnce(&mut Item) -> StoreResult<T> + Send,
    ) -> StoreResult<T> {
        let mut tables = self.tables.write().await;
        let item = tables
            .entry(table.to_string())
            .or_default()
            .entry(key.clone())
            .or_default();
        f(item)
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_item(&self, table: &str, key: &ItemKey) -> StoreResult<Option<Item>> {
        let tables = self.tables.read().await;
        Ok(tables.get(table).and_then(|items| items.get(key)).cloned())
    }

    async fn put_attribute_if_absent(
        &self,
        table: &str,
        key: &ItemKey,
        attr: &str,
        value: Value,
    ) -> StoreResult<Option<Value>> {
        self.update(table, key, |item| Ok(apply_put_if_absent(item, attr, value)))
            .await
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
            .await
    }

    async fn add_to_set(
        &self,
        table: &str,
        key: &ItemKey,
        attr: &str,
        values: &[String],
    ) -> StoreResult<()> {
        self.update(table, key, |item| apply_add_to_set(item, attr, values))
            .await
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
        .await
    }

    async fn scan(&self, table: &str) -> StoreResult<Vec<(ItemKey, Item)>> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(table)
            .map(|items| {
                items
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::item_key;
    use serde_json::json;

    #[tokio::test]
    async fn test_roundtrip_and_scan() {
        let store = InMemoryStore::new();
        let key = item_key([("numeric_id", "-1001234567890")]);

        assert!(store.get_item("handles", &key).await.unwrap().is_none());
        store
            .put_attribute_if_absent("handles", &key, "tag_handle", json!("somechan"))
            .await
            .unwrap();

        let item = store.get_item("handles", &key).await.unwrap().unwrap();
        assert_eq!(item["tag_handle"], json!("somechan"));

        let all = store.scan("handles").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, key);
        assert!(store.scan("posts").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_touch_item_tags() {
        let store = InMemoryStore::new();
        let key = item_key([("main_tag_handle", "chan1"), ("message_id", "5")]);
        store.touch_item("posts", &key, None).await.unwrap();
        assert_eq!(store.get_item("posts", &key).await.unwrap(), Some(Item::new()));

        store
            .touch_item("posts", &key, Some(("seen_by", json!("worker-1"))))
            .await
            .unwrap();
        let item = store.get_item("posts", &key).await.unwrap().unwrap();
        assert_eq!(item["seen_by"], json!("worker-1"));
    }
}
