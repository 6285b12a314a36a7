//! Unordered per-item state for whole-channel scrapes.

use std::collections::HashSet;

use indexmap::IndexMap;

use crate::surface::{selectors::REPLIES_ELEMENT, RawMarkup};

/// Every distinct capture seen so far, keyed by its digest.
///
/// Bubbles keep changing while people react to them, so one item can yield
/// many captures. Staleness only resets when a new item id shows up.
#[derive(Debug, Default)]
pub struct ListingState {
    captures: IndexMap<String, (String, RawMarkup)>,
    ids: HashSet<String>,
    staleness: u32,
}

impl ListingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one pass worth of captures. Returns the number of new item ids.
    pub fn observe_window<I>(&mut self, captures: I) -> usize
    where
        I: IntoIterator<Item = (String, RawMarkup)>,
    {
        let mut discovered = 0;
        for (message_id, markup) in captures {
            let digest = markup.digest();
            if self.captures.contains_key(&digest) {
                continue;
            }
            if self.ids.insert(message_id.clone()) {
                discovered += 1;
            }
            self.captures.insert(digest, (message_id, markup));
        }

        if discovered > 0 {
            self.staleness = 0;
        } else {
            self.staleness += 1;
        }
        discovered
    }

    /// Number of distinct captures.
    pub fn capture_count(&self) -> usize {
        self.captures.len()
    }

    pub fn item_count(&self) -> usize {
        self.ids.len()
    }

    pub fn staleness(&self) -> u32 {
        self.staleness
    }

    /// Whether any capture carries a replies footer.
    pub fn mentions_replies(&self) -> bool {
        self.captures
            .values()
            .any(|(_, markup)| markup.contains(REPLIES_ELEMENT))
    }

    /// `(digest, message id, capture)` in order of first sighting.
    pub fn captures(&self) -> impl Iterator<Item = (&str, &str, &RawMarkup)> {
        self.captures
            .iter()
            .map(|(digest, (id, markup))| (digest.as_str(), id.as_str(), markup))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture(id: &str, body: &str) -> (String, RawMarkup) {
        (id.to_string(), RawMarkup::from_text(body))
    }

    #[test]
    fn test_new_ids_reset_staleness() {
        let mut state = ListingState::new();
        assert_eq!(state.observe_window(vec![capture("1", "a"), capture("2", "b")]), 2);
        assert_eq!(state.staleness(), 0);

        // A changed capture of a known item is kept but is not progress.
        assert_eq!(state.observe_window(vec![capture("1", "a2")]), 0);
        assert_eq!(state.staleness(), 1);
        assert_eq!(state.capture_count(), 3);
        assert_eq!(state.item_count(), 2);

        assert_eq!(state.observe_window(vec![capture("1", "a")]), 0);
        assert_eq!(state.staleness(), 2);
        assert_eq!(state.capture_count(), 3);

        assert_eq!(state.observe_window(vec![capture("3", "c")]), 1);
        assert_eq!(state.staleness(), 0);
    }

    #[test]
    fn test_mentions_replies() {
        let mut state = ListingState::new();
        state.observe_window(vec![capture("1", "<div class=\"bubble\"></div>")]);
        assert!(!state.mentions_replies());
        state.observe_window(vec![capture(
            "2",
            "<div class=\"bubble\"><replies-element></replies-element></div>",
        )]);
        assert!(state.mentions_replies());
    }
}
