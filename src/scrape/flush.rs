//! Writing session state to the `posts` table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{ListingState, MergeState, ScrapeError, ScrapeResult};
use crate::channel::TagHandle;
use crate::store::{item_key, ContentEntry, ItemKey, Store, StoreError, POSTS_TABLE};
use crate::surface::{digest_bytes, RawMarkup};

/// Map attribute holding every capture of a post.
pub const OUTER_HTML_BY_HASH: &str = "outer_html_by_hash";

/// Map attribute holding every scraped comment thread of a post.
pub const SCRAPED_COMMENTS: &str = "scraped_comments";

/// One comment of a stored thread with all of its captured variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentRecord {
    pub message_id: String,
    /// Base64 of each raw capture.
    pub variants: Vec<String>,
}

pub fn post_key(tag: &TagHandle, message_id: &str) -> ItemKey {
    item_key([("main_tag_handle", tag.as_str()), ("message_id", message_id)])
}

/// Store every capture of a channel listing under its own post.
pub async fn flush_listing(
    store: &dyn Store,
    tag: &TagHandle,
    listing: &ListingState,
    captured_at: DateTime<Utc>,
) -> ScrapeResult<usize> {
    let mut written = 0;
    for (digest, message_id, markup) in listing.captures() {
        let entry = ContentEntry::new(markup.as_bytes(), captured_at)?;
        store
            .set_attribute_if_absent_else_nested(
                POSTS_TABLE,
                &post_key(tag, message_id),
                OUTER_HTML_BY_HASH,
                digest,
                entry.to_value()?,
            )
            .await?;
        written += 1;
    }
    info!("Stored {} captures for '{}'", written, tag);
    Ok(written)
}

/// Store a comment thread as one JSON document under the post it belongs
/// to. Returns the digest it is stored under.
pub async fn flush_replies(
    store: &dyn Store,
    tag: &TagHandle,
    post_message_id: &str,
    thread: &MergeState,
    captured_at: DateTime<Utc>,
) -> ScrapeResult<String> {
    let records: Vec<CommentRecord> = thread
        .entries()
        .map(|(message_id, variants)| CommentRecord {
            message_id: message_id.to_string(),
            variants: variants.iter().map(RawMarkup::to_base64).collect(),
        })
        .collect();
    let json = serde_json::to_vec(&records).map_err(StoreError::from)?;

    let decoded: Vec<CommentRecord> = serde_json::from_slice(&json).map_err(StoreError::from)?;
    if !decoded.iter().map(|r| r.message_id.as_str()).eq(thread.ids()) {
        return Err(ScrapeError::FlushMismatch(
            "serialized thread lost or reordered items".to_string(),
        ));
    }

    let digest = digest_bytes(&json);
    let key = post_key(tag, post_message_id);
    let entry = ContentEntry::json(&json, captured_at)?;
    store
        .set_attribute_if_absent_else_nested(
            POSTS_TABLE,
            &key,
            SCRAPED_COMMENTS,
            &digest,
            entry.to_value()?,
        )
        .await?;

    let stored = store
        .get_item(POSTS_TABLE, &key)
        .await?
        .and_then(|item| item.get(SCRAPED_COMMENTS)?.get(&digest).cloned())
        .ok_or_else(|| ScrapeError::FlushMismatch(format!("'{}' missing after write", digest)))?;
    let stored = ContentEntry::deserialize(stored).map_err(StoreError::from)?;
    stored.decode(&digest)?;

    info!(
        "Stored {} comments of '{}' post {} as {}",
        records.len(),
        tag,
        post_message_id,
        digest
    );
    Ok(digest)
}

/// Decode a stored comment thread.
pub fn decode_comment_thread(entry: &ContentEntry, digest: &str) -> ScrapeResult<Vec<CommentRecord>> {
    let bytes = entry.decode(digest)?;
    Ok(serde_json::from_slice(&bytes).map_err(StoreError::from)?)
}
