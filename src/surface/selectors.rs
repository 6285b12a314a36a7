//! CSS selectors for the chat client's DOM.

/// Message bubbles, excluding date separators and service notices.
pub const CONTENT_BUBBLE: &str = ".bubble:not(.is-date):not(.service)";

/// The channel post shown at the top of a discussion view.
pub const CHANNEL_POST_BUBBLE: &str = ".bubble:not(.is-date):not(.service).channel-post";

/// Direct container of the bubbles; its parent is the scrollable element.
pub const BUBBLES_INNER: &str = ".bubbles-inner";

/// Spinner of a bubble whose media is still loading.
pub const PRELOADER: &str = ".preloader-container";

/// Thumbnail of a replied-to message that has not loaded yet.
pub const REPLY_THUMBNAIL: &str = ".reply-media .thumbnail";

/// The comments view opened from a channel post.
pub const DISCUSSION_VIEW: &str = ".chat[data-type=\"discussion\"]";

pub const PROFILE_DETAILS: &str = ".profile-content .sidebar-left-section-content";

pub const ROW_TITLE: &str = ".row-title";

pub const PERSON_AVATAR: &str = ".person-avatar";

pub const REPLIES_ELEMENT: &str = "replies-element";

/// A specific post bubble of a channel.
pub fn post_bubble(numeric_id: &str, message_id: &str) -> String {
    format!(
        ".bubble:not(.is-date)[data-peer-id=\"{}\"][data-mid=\"{}\"]",
        numeric_id, message_id
    )
}
