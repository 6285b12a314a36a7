//! Message classification.
//!
//! Turns one parsed bubble into either extracted text or a filter reason.
//! The set of recognized body shapes is closed: anything else is an error,
//! because guessing would silently skew everything computed downstream.

mod extractor;
mod post;

pub use extractor::ContentExtractor;
pub use post::ChannelPostSummary;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::markup::MarkupError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    ChannelPost,
    Comment,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::ChannelPost => "channel-post",
            MessageKind::Comment => "comment",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a bubble yields no text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterReason {
    Poll,
    GeoFooter,
    I18n,
    Blockquote,
    AudioDocument,
    DocumentMessage,
    NestedLink,
    ComplexFormattingInLink,
    FormattedLink,
    ProbableLoneSurrogate,
    /// Allow-listed service notice.
    ServiceItem,
}

impl FilterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterReason::Poll => "poll",
            FilterReason::GeoFooter => "geo_footer",
            FilterReason::I18n => "i18n",
            FilterReason::Blockquote => "blockquote",
            FilterReason::AudioDocument => "audio_document",
            FilterReason::DocumentMessage => "document_message",
            FilterReason::NestedLink => "nested_link",
            FilterReason::ComplexFormattingInLink => "complex_formatting_in_link",
            FilterReason::FormattedLink => "formatted_link",
            FilterReason::ProbableLoneSurrogate => "probable_lone_surrogate",
            FilterReason::ServiceItem => "service_item",
        }
    }
}

impl fmt::Display for FilterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying one bubble. A filtered bubble carries no text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BubbleContent {
    Extracted {
        text: String,
        kind: Option<MessageKind>,
        is_reply: bool,
        was_edited: bool,
    },
    Filtered(FilterReason),
}

impl BubbleContent {
    pub fn text(&self) -> Option<&str> {
        match self {
            BubbleContent::Extracted { text, .. } => Some(text),
            BubbleContent::Filtered(_) => None,
        }
    }

    pub fn filter_reason(&self) -> Option<FilterReason> {
        match self {
            BubbleContent::Extracted { .. } => None,
            BubbleContent::Filtered(reason) => Some(*reason),
        }
    }

    pub fn kind(&self) -> Option<MessageKind> {
        match self {
            BubbleContent::Extracted { kind, .. } => *kind,
            BubbleContent::Filtered(_) => None,
        }
    }

    pub fn is_reply(&self) -> bool {
        matches!(self, BubbleContent::Extracted { is_reply: true, .. })
    }

    pub fn was_edited(&self) -> bool {
        matches!(self, BubbleContent::Extracted { was_edited: true, .. })
    }
}

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("top-level element is not a '.bubble' div: {0}")]
    NotABubble(String),

    #[error("service bubble with message id {message_id:?} is not allow-listed")]
    UnexpectedServiceItem { message_id: Option<String> },

    #[error("expected a '.channel-post' bubble, got classes '{classes}'")]
    NotAChannelPost { classes: String },

    #[error("unknown message structure:\n{tree}")]
    UnknownStructure { tree: String },

    #[error("expected at most 1 replies element, found {0}")]
    MultipleRepliesElements(usize),

    #[error("missing attribute '{name}' on <{tag}>")]
    MissingAttribute { tag: String, name: &'static str },

    #[error(transparent)]
    Markup(#[from] MarkupError),
}

pub type ContentResult<T> = Result<T, ContentError>;
