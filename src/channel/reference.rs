//! Tag handle / numeric id resolution backed by the store.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{ChannelError, ChannelRef, NumericId, TagHandle};
use crate::store::{item_key, ItemKey, Store, HANDLES_TABLE};

const TAG_HANDLE_ATTR: &str = "tag_handle";

/// Where the current tag/id pair came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// Seen on the page or given by a job; not yet known to the store.
    Observed,
    /// Read from the store, or found there already when storing.
    Fetched,
    /// Written to the store by this reference.
    Stored,
}

/// Identity of one channel.
///
/// At least one half is known from construction on. Once both halves are
/// known they never change; the mapping is persisted at most once and a
/// conflicting stored mapping is an error.
#[derive(Debug, Clone)]
pub struct ChannelReference {
    tag_handle: Option<TagHandle>,
    numeric_id: Option<NumericId>,
    provenance: Provenance,
}

impl ChannelReference {
    pub fn new(
        tag_handle: Option<TagHandle>,
        numeric_id: Option<NumericId>,
    ) -> Result<Self, ChannelError> {
        if tag_handle.is_none() && numeric_id.is_none() {
            return Err(ChannelError::Empty);
        }
        Ok(Self {
            tag_handle,
            numeric_id,
            provenance: Provenance::Observed,
        })
    }

    pub fn from_tag(tag_handle: TagHandle) -> Self {
        Self {
            tag_handle: Some(tag_handle),
            numeric_id: None,
            provenance: Provenance::Observed,
        }
    }

    pub fn from_numeric_id(numeric_id: NumericId) -> Self {
        Self {
            tag_handle: None,
            numeric_id: Some(numeric_id),
            provenance: Provenance::Observed,
        }
    }

    pub fn tag_handle(&self) -> Option<&TagHandle> {
        self.tag_handle.as_ref()
    }

    pub fn numeric_id(&self) -> Option<&NumericId> {
        self.numeric_id.as_ref()
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    pub fn is_complete(&self) -> bool {
        self.tag_handle.is_some() && self.numeric_id.is_some()
    }

    /// Both halves, or `Incomplete`.
    pub fn pair(&self) -> Result<(&TagHandle, &NumericId), ChannelError> {
        match (&self.tag_handle, &self.numeric_id) {
            (Some(tag), Some(id)) => Ok((tag, id)),
            _ => Err(ChannelError::Incomplete),
        }
    }

    /// Record the numeric id observed on the page.
    pub fn observe_numeric_id(&mut self, numeric_id: NumericId) -> Result<(), ChannelError> {
        match &self.numeric_id {
            Some(known) if *known != numeric_id => Err(ChannelError::IdChanged {
                known: known.clone(),
                observed: numeric_id,
            }),
            Some(_) => Ok(()),
            None => {
                self.numeric_id = Some(numeric_id);
                Ok(())
            }
        }
    }

    /// Fill in the tag handle from the store. No-op when already complete.
    pub async fn complete(&mut self, store: &dyn Store) -> Result<(), ChannelError> {
        if self.tag_handle.is_none() {
            let numeric_id = self.numeric_id.clone().ok_or(ChannelError::Empty)?;
            let tag = fetch_tag_handle(store, &numeric_id)
                .await?
                .ok_or(ChannelError::NotFound(numeric_id))?;
            self.tag_handle = Some(tag);
            self.provenance = Provenance::Fetched;
        }
        if self.numeric_id.is_none() {
            return Err(ChannelError::ReverseLookupUnsupported);
        }
        Ok(())
    }

    /// Persist the mapping unless it came from (or already went to) the
    /// store. First writer wins; a different stored tag is an error.
    pub async fn store(&mut self, store: &dyn Store) -> Result<(), ChannelError> {
        let (tag, numeric_id) = self.pair()?;
        if self.provenance != Provenance::Observed {
            return Ok(());
        }

        let existing = store
            .put_attribute_if_absent(
                HANDLES_TABLE,
                &handle_key(numeric_id),
                TAG_HANDLE_ATTR,
                Value::String(tag.to_string()),
            )
            .await?;

        match existing {
            None => {
                info!("Stored tag handle '{}' for numeric id {}", tag, numeric_id);
                self.provenance = Provenance::Stored;
            }
            Some(Value::String(stored)) if stored == tag.as_str() => {
                debug!("Tag handle '{}' for numeric id {} was already stored", tag, numeric_id);
                self.provenance = Provenance::Fetched;
            }
            Some(other) => {
                let stored = match &other {
                    Value::String(s) => TagHandle::new(s)?,
                    _ => return Err(ChannelError::InvalidTag(other.to_string())),
                };
                return Err(ChannelError::InconsistentMapping {
                    numeric_id: numeric_id.clone(),
                    stored,
                    observed: tag.clone(),
                });
            }
        }
        Ok(())
    }
}

fn handle_key(numeric_id: &NumericId) -> ItemKey {
    item_key([("numeric_id", numeric_id.as_str())])
}

async fn fetch_tag_handle(
    store: &dyn Store,
    numeric_id: &NumericId,
) -> Result<Option<TagHandle>, ChannelError> {
    let Some(item) = store.get_item(HANDLES_TABLE, &handle_key(numeric_id)).await? else {
        return Ok(None);
    };
    match item.get(TAG_HANDLE_ATTR) {
        Some(Value::String(tag)) => Ok(Some(TagHandle::new(tag)?)),
        Some(other) => Err(ChannelError::InvalidTag(other.to_string())),
        None => Ok(None),
    }
}

/// Process-local cache of resolved pairs in front of the store.
///
/// Only pairs that were read from or written to the store are cached, so a
/// cache hit carries `Fetched` provenance.
pub struct ChannelDirectory {
    store: Arc<dyn Store>,
    by_id: RwLock<HashMap<NumericId, TagHandle>>,
    by_tag: RwLock<HashMap<TagHandle, NumericId>>,
}

impl ChannelDirectory {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            by_id: RwLock::new(HashMap::new()),
            by_tag: RwLock::new(HashMap::new()),
        }
    }

    /// Start a reference for a job's channel, pre-filled from the cache.
    pub async fn reference(&self, channel: &ChannelRef) -> ChannelReference {
        match channel {
            ChannelRef::Tag(tag) => match self.by_tag.read().await.get(tag) {
                Some(id) => cached(tag.clone(), id.clone()),
                None => ChannelReference::from_tag(tag.clone()),
            },
            ChannelRef::Numeric(id) => match self.by_id.read().await.get(id) {
                Some(tag) => cached(tag.clone(), id.clone()),
                None => ChannelReference::from_numeric_id(id.clone()),
            },
        }
    }

    pub async fn complete(&self, reference: &mut ChannelReference) -> Result<(), ChannelError> {
        reference.complete(self.store.as_ref()).await?;
        self.remember(reference).await;
        Ok(())
    }

    pub async fn store(&self, reference: &mut ChannelReference) -> Result<(), ChannelError> {
        reference.store(self.store.as_ref()).await?;
        self.remember(reference).await;
        Ok(())
    }

    async fn remember(&self, reference: &ChannelReference) {
        if reference.provenance() == Provenance::Observed {
            return;
        }
        if let Ok((tag, id)) = reference.pair() {
            self.by_id.write().await.insert(id.clone(), tag.clone());
            self.by_tag.write().await.insert(tag.clone(), id.clone());
        }
    }
}

fn cached(tag: TagHandle, id: NumericId) -> ChannelReference {
    ChannelReference {
        tag_handle: Some(tag),
        numeric_id: Some(id),
        provenance: Provenance::Fetched,
    }
}
