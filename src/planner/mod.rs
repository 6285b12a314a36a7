//! Comment job planning.
//!
//! Reads the channel posts collected by listing sessions, works out which of
//! them have discussions worth scraping, and queues `scrape_comments` jobs
//! for those.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::channel::{ChannelError, NumericId, TagHandle};
use crate::content::{ContentError, ContentExtractor};
use crate::markup::{MarkupError, MarkupParser};
use crate::scrape::OUTER_HTML_BY_HASH;
use crate::store::{item_key, select_latest_variant, Item, Store, StoreError, POSTS_TABLE};
use crate::work_queue::{JobPayload, JobTarget, JobType, WorkQueue, WorkQueueError};

/// Set attribute recording when a post was queued for a comment scrape.
pub const QUEUE_PUSH_TIMESTAMPS: &str = "queue_push_timestamps";

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("stored post '{tag}' {message_id} is a service bubble")]
    ServiceItem { tag: String, message_id: String },

    #[error("stored post '{tag}' {key_message_id} carries message id {found:?}")]
    MessageIdMismatch {
        tag: String,
        key_message_id: String,
        found: Option<String>,
    },

    #[error("stored post '{tag}' {message_id} has no channel id")]
    MissingChannelId { tag: String, message_id: String },

    #[error("stored post is missing its '{0}' key")]
    MalformedKey(&'static str),

    #[error("'{0}' is tied to more than one channel id, or shares its id with another tag")]
    InconsistentChannels(String),

    #[error(transparent)]
    Content(#[from] ContentError),

    #[error(transparent)]
    Markup(#[from] MarkupError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] WorkQueueError),
}

pub type PlannerResult<T> = Result<T, PlannerError>;

#[derive(Debug, Clone)]
pub struct PlannerSettings {
    pub min_comments: u64,
    /// Queue a post again once its last push is older than this. Posts that
    /// were pushed before are never queued again when unset.
    pub repush_after: Option<Duration>,
    /// Posts never queued, whatever they show.
    pub ignored_message_ids: Vec<String>,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            min_comments: 500,
            repush_after: None,
            ignored_message_ids: Vec::new(),
        }
    }
}

/// A stored channel post that has a discussion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentJobCandidate {
    pub tag: TagHandle,
    pub numeric_id: NumericId,
    pub message_id: String,
    /// `None` when the footer could not be read.
    pub comment_count: Option<u64>,
    pub last_pushed: Option<DateTime<FixedOffset>>,
}

impl CommentJobCandidate {
    pub fn payload(&self) -> JobPayload {
        JobPayload::new(
            JobType::ScrapeComments,
            JobTarget::Post {
                channel_id: self.numeric_id.to_string(),
                message_id: self.message_id.clone(),
            },
        )
    }
}

pub struct Planner {
    store: Arc<dyn Store>,
    extractor: ContentExtractor,
    settings: PlannerSettings,
}

impl Planner {
    pub fn new(store: Arc<dyn Store>, settings: PlannerSettings) -> Self {
        Self {
            store,
            extractor: ContentExtractor::new(),
            settings,
        }
    }

    /// Use `extractor` to read posts, e.g. one with a service allow-list.
    pub fn with_extractor(mut self, extractor: ContentExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    /// Every stored post with a replies element.
    pub async fn candidates(&self) -> PlannerResult<Vec<CommentJobCandidate>> {
        let posts = self.store.scan(POSTS_TABLE).await?;
        info!("Reading {} stored posts", posts.len());

        let mut parser = MarkupParser::new();
        let mut candidates = Vec::new();
        let mut tag_ids: HashMap<TagHandle, NumericId> = HashMap::new();
        let mut id_tags: HashMap<NumericId, TagHandle> = HashMap::new();

        for (parsed, (key, item)) in posts.iter().enumerate() {
            if (parsed + 1) % 1000 == 0 {
                info!("Parsed {} posts", parsed + 1);
            }
            let tag = key
                .get("main_tag_handle")
                .ok_or(PlannerError::MalformedKey("main_tag_handle"))?;
            let message_id = key
                .get("message_id")
                .ok_or(PlannerError::MalformedKey("message_id"))?;

            let Some(variants) = item.get(OUTER_HTML_BY_HASH).and_then(Value::as_object) else {
                debug!("'{}' {} has no captures", tag, message_id);
                continue;
            };
            let Some((digest, entry)) = select_latest_variant(variants) else {
                debug!("'{}' {} has no readable captures", tag, message_id);
                continue;
            };
            let text = entry.decode_text(digest)?;

            parser.reset();
            let tree = parser.parse(&text)?;
            if self.extractor.is_service(&tree)? {
                if self.extractor.is_allow_listed(Some(message_id)) {
                    continue;
                }
                return Err(PlannerError::ServiceItem {
                    tag: tag.clone(),
                    message_id: message_id.clone(),
                });
            }

            let summary = self.extractor.summarize_post(&tree)?;
            if summary.message_id.as_deref() != Some(message_id.as_str()) {
                return Err(PlannerError::MessageIdMismatch {
                    tag: tag.clone(),
                    key_message_id: message_id.clone(),
                    found: summary.message_id,
                });
            }
            let tag = TagHandle::new(tag)?;
            let numeric_id = summary
                .numeric_id
                .as_deref()
                .ok_or_else(|| PlannerError::MissingChannelId {
                    tag: tag.to_string(),
                    message_id: message_id.clone(),
                })
                .and_then(|id| NumericId::new(id).map_err(PlannerError::from))?;

            let known_id = tag_ids.entry(tag.clone()).or_insert_with(|| numeric_id.clone());
            let known_tag = id_tags.entry(numeric_id.clone()).or_insert_with(|| tag.clone());
            if *known_id != numeric_id || *known_tag != tag {
                return Err(PlannerError::InconsistentChannels(tag.to_string()));
            }

            if !summary.has_replies_element
                || self.settings.ignored_message_ids.contains(message_id)
            {
                continue;
            }
            candidates.push(CommentJobCandidate {
                tag,
                numeric_id,
                message_id: message_id.clone(),
                comment_count: summary.comment_count,
                last_pushed: last_pushed(item),
            });
        }
        info!(
            "Found {} posts with discussions across {} channels",
            candidates.len(),
            tag_ids.len()
        );
        Ok(candidates)
    }

    /// Candidates with enough comments that are due for a push.
    pub fn select(
        &self,
        candidates: Vec<CommentJobCandidate>,
        now: DateTime<Utc>,
    ) -> Vec<CommentJobCandidate> {
        candidates
            .into_iter()
            .filter(|c| c.comment_count.is_some_and(|n| n >= self.settings.min_comments))
            .filter(|c| match (c.last_pushed, self.settings.repush_after) {
                (None, _) => true,
                (Some(_), None) => false,
                (Some(pushed), Some(after)) => now.signed_duration_since(pushed) > after,
            })
            .collect()
    }

    /// Queue a comment job for each chosen post and record the push.
    pub async fn push(
        &self,
        queue: &WorkQueue,
        chosen: &[CommentJobCandidate],
    ) -> PlannerResult<usize> {
        for candidate in chosen {
            queue.submit_payload(&candidate.payload()).await?;
            self.store
                .add_to_set(
                    POSTS_TABLE,
                    &item_key([
                        ("main_tag_handle", candidate.tag.as_str()),
                        ("message_id", candidate.message_id.as_str()),
                    ]),
                    QUEUE_PUSH_TIMESTAMPS,
                    &[Utc::now().to_rfc3339()],
                )
                .await?;
        }
        info!("Queued {} comment jobs", chosen.len());
        Ok(chosen.len())
    }
}

/// Candidates per comment count, unknown counts first.
pub fn comment_histogram(candidates: &[CommentJobCandidate]) -> BTreeMap<Option<u64>, usize> {
    let mut histogram = BTreeMap::new();
    for candidate in candidates {
        *histogram.entry(candidate.comment_count).or_insert(0) += 1;
    }
    histogram
}

fn last_pushed(item: &Item) -> Option<DateTime<FixedOffset>> {
    item.get(QUEUE_PUSH_TIMESTAMPS)?
        .as_array()?
        .iter()
        .filter_map(Value::as_str)
        .filter_map(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scrape::post_key;
    use crate::store::{ContentEntry, InMemoryStore};
    use crate::surface::RawMarkup;
    use crate::work_queue::{InMemoryQueueBackend, QueueBackend};
    use chrono::TimeZone;
    use serde_json::json;

    const PEER: &str = "-1001234567890";

    fn post(message_id: &str, footer: Option<&str>) -> String {
        let replies = footer
            .map(|text| {
                format!(
                    "<replies-element><span class=\"replies-footer-text\">{}</span></replies-element>",
                    text
                )
            })
            .unwrap_or_default();
        format!(
            "<div class=\"bubble channel-post\" data-mid=\"{}\" data-peer-id=\"{}\"><div class=\"message\">hi</div>{}</div>",
            message_id, PEER, replies
        )
    }

    async fn stored(store: &InMemoryStore, tag: &str, message_id: &str, markup: &str) {
        stored_raw(store, tag, message_id, &RawMarkup::from_text(markup)).await;
    }

    async fn stored_raw(store: &InMemoryStore, tag: &str, message_id: &str, markup: &RawMarkup) {
        let captured_at = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let entry = ContentEntry::new(markup.as_bytes(), captured_at).unwrap();
        store
            .set_attribute_if_absent_else_nested(
                POSTS_TABLE,
                &post_key(&TagHandle::new(tag).unwrap(), message_id),
                OUTER_HTML_BY_HASH,
                &markup.digest(),
                entry.to_value().unwrap(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_captures_with_lone_surrogates_are_read() {
        let store = Arc::new(InMemoryStore::new());
        let markup = post("10", Some("812 Comments")).replace("hi", "h\u{1}");
        let mut points: Vec<u32> = markup.chars().map(u32::from).collect();
        let broken = points.iter().position(|&cp| cp == 1).unwrap();
        points[broken] = 0xD83D;
        stored_raw(&store, "somechan", "10", &RawMarkup::from_code_points(&points).unwrap()).await;

        let planner = Planner::new(store, PlannerSettings::default());
        let candidates = planner.candidates().await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].comment_count, Some(812));
    }

    #[tokio::test]
    async fn test_candidates_and_selection() {
        let store = Arc::new(InMemoryStore::new());
        stored(&store, "somechan", "10", &post("10", Some("812 Comments"))).await;
        stored(&store, "somechan", "11", &post("11", Some("Leave a comment"))).await;
        stored(&store, "somechan", "12", &post("12", None)).await;
        stored(&store, "somechan", "13", &post("13", Some("see below"))).await;

        let planner = Planner::new(store.clone(), PlannerSettings::default());
        let candidates = planner.candidates().await.unwrap();
        let counts: Vec<_> = candidates
            .iter()
            .map(|c| (c.message_id.as_str(), c.comment_count))
            .collect();
        assert_eq!(
            counts,
            vec![("10", Some(812)), ("11", Some(0)), ("13", None)]
        );

        let chosen = planner.select(candidates, Utc::now());
        assert_eq!(chosen.len(), 1);
        assert_eq!(
            chosen[0].payload().to_body().unwrap(),
            format!(
                r#"{{"type":"scrape_comments","target":{{"channel_id":"{}","message_id":"10"}}}}"#,
                PEER
            )
        );
    }

    #[tokio::test]
    async fn test_push_records_timestamp_and_blocks_repush() {
        let store = Arc::new(InMemoryStore::new());
        stored(&store, "somechan", "10", &post("10", Some("900 Comments"))).await;
        let backend = Arc::new(InMemoryQueueBackend::new(std::time::Duration::from_secs(60)));
        let queue = WorkQueue::new(backend.clone());

        let planner = Planner::new(store.clone(), PlannerSettings::default());
        let chosen = planner.select(planner.candidates().await.unwrap(), Utc::now());
        assert_eq!(planner.push(&queue, &chosen).await.unwrap(), 1);
        assert_eq!(backend.depth().await.unwrap(), 1);

        let candidates = planner.candidates().await.unwrap();
        assert!(candidates[0].last_pushed.is_some());
        assert!(planner.select(candidates.clone(), Utc::now()).is_empty());

        let repushing = Planner::new(
            store.clone(),
            PlannerSettings {
                repush_after: Some(Duration::hours(1)),
                ..PlannerSettings::default()
            },
        );
        assert!(repushing.select(candidates.clone(), Utc::now()).is_empty());
        let later = Utc::now() + Duration::hours(2);
        assert_eq!(repushing.select(candidates, later).len(), 1);
    }

    #[tokio::test]
    async fn test_service_bubbles_fail_unless_allow_listed() {
        let store = Arc::new(InMemoryStore::new());
        stored(
            &store,
            "somechan",
            "5",
            "<div class=\"bubble service\" data-mid=\"5\"><div class=\"service-msg\">joined</div></div>",
        )
        .await;

        let planner = Planner::new(store.clone(), PlannerSettings::default());
        assert!(matches!(
            planner.candidates().await,
            Err(PlannerError::ServiceItem { .. })
        ));

        let lenient = Planner::new(store.clone(), PlannerSettings::default())
            .with_extractor(ContentExtractor::with_service_allow_list(["5"]));
        assert!(lenient.candidates().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_key_must_match_markup() {
        let store = Arc::new(InMemoryStore::new());
        stored(&store, "somechan", "10", &post("11", Some("600 Comments"))).await;
        let planner = Planner::new(store, PlannerSettings::default());
        assert!(matches!(
            planner.candidates().await,
            Err(PlannerError::MessageIdMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_tag_must_map_to_one_channel() {
        let store = Arc::new(InMemoryStore::new());
        stored(&store, "somechan", "10", &post("10", None)).await;
        let other_peer = post("11", None).replace(PEER, "-1009999999999");
        stored(&store, "somechan", "11", &other_peer).await;

        let planner = Planner::new(store, PlannerSettings::default());
        assert!(matches!(
            planner.candidates().await,
            Err(PlannerError::InconsistentChannels(_))
        ));
    }

    #[test]
    fn test_last_pushed_takes_latest() {
        let mut item = Item::new();
        assert_eq!(last_pushed(&item), None);
        item.insert(
            QUEUE_PUSH_TIMESTAMPS.to_string(),
            json!(["2024-01-01T00:00:00+00:00", "2024-03-01T00:00:00+00:00", "bogus"]),
        );
        assert_eq!(
            last_pushed(&item).unwrap().to_rfc3339(),
            "2024-03-01T00:00:00+00:00"
        );
    }
}
