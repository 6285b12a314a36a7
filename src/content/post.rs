//! Channel post summaries used when planning comment jobs.

use std::sync::LazyLock;

use regex::Regex;

use crate::markup::{find_captures, find_nodes, MarkupNode, MatchCriterion};

use super::extractor::bubble_element;
use super::{ContentError, ContentExtractor, ContentResult};

static COMMENT_COUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)Leave a comment|([0-9]+) Comments?").expect("valid comment count pattern")
});

/// What a stored channel post says about its discussion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPostSummary {
    pub numeric_id: Option<String>,
    pub message_id: Option<String>,
    pub has_replies_element: bool,
    /// `None` when the footer is missing or unreadable.
    pub comment_count: Option<u64>,
}

impl ContentExtractor {
    /// Summarize a channel post bubble.
    ///
    /// Non-post bubbles are an error unless their message id is allow-listed.
    pub fn summarize_post(&self, tree: &MarkupNode) -> ContentResult<ChannelPostSummary> {
        let bubble = bubble_element(tree)?;

        let replies = find_nodes(tree, &[MatchCriterion::element("replies-element")]);
        if replies.len() > 1 {
            return Err(ContentError::MultipleRepliesElements(replies.len()));
        }
        let comment_count = replies.first().and_then(|el| comment_count(el));

        let message_id = bubble.attr("data-mid")?;
        if !bubble.has_class("channel-post") && !self.is_allow_listed(message_id) {
            return Err(ContentError::NotAChannelPost {
                classes: bubble.attr("class")?.unwrap_or_default().to_string(),
            });
        }

        Ok(ChannelPostSummary {
            numeric_id: bubble.attr("data-peer-id")?.map(str::to_string),
            message_id: message_id.map(str::to_string),
            has_replies_element: !replies.is_empty(),
            comment_count,
        })
    }
}

fn comment_count(replies: &MarkupNode) -> Option<u64> {
    let found = find_captures(
        replies,
        &[
            MatchCriterion::element("span").with_class("replies-footer-text"),
            MatchCriterion::text(COMMENT_COUNT.clone()),
        ],
    );
    match found.as_slice() {
        [(_, groups)] => match groups.first() {
            Some(Some(count)) => count.parse().ok(),
            _ => Some(0),
        },
        _ => None,
    }
}
