//! chatscrape - ordered message logs from virtualized chat feeds.
//!
//! Workers lease scrape jobs from a queue, drive a rendering surface
//! through a channel or a discussion page by page, merge the overlapping
//! windows they capture into one ordered log and store every observed
//! variant of each message.

pub mod channel;
pub mod cli;
pub mod config;
pub mod content;
pub mod markup;
pub mod planner;
pub mod scrape;
pub mod sqlite;
pub mod store;
pub mod surface;
pub mod work_queue;
