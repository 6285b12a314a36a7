//! Splice-merge of overlapping windows into one ordered item log.
//!
//! The list only ever shows a window of items. Each new window has to
//! contain the last item merged so far (the tail), or at least end on an
//! item that is already known. Everything in the window up to the tail is
//! reconciled with the established order; everything after it is new.

use std::collections::HashSet;

use indexmap::{IndexMap, IndexSet};

use super::{ScrapeError, ScrapeResult};
use crate::surface::RawMarkup;

/// One bubble of a captured window, in list order.
#[derive(Debug, Clone)]
pub enum WindowEntry {
    Captured {
        message_id: String,
        markup: RawMarkup,
    },
    /// Present but not captured this pass (still loading, or went stale).
    /// Breaks the contiguous run it sits in.
    Skipped { message_id: Option<String> },
}

impl WindowEntry {
    pub fn captured(message_id: impl Into<String>, markup: RawMarkup) -> Self {
        WindowEntry::Captured {
            message_id: message_id.into(),
            markup,
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        match self {
            WindowEntry::Captured { message_id, .. } => Some(message_id),
            WindowEntry::Skipped { message_id } => message_id.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Items added to the order by this window.
    pub discovered: usize,
    /// The tail was not in the window, but the window ended on a known item.
    pub tail_assumed_ahead: bool,
    /// The merged run extends to the last bubble of the window.
    pub run_reaches_end: bool,
}

/// Ordered item log with every observed variant per item.
#[derive(Debug, Default)]
pub struct MergeState {
    order: IndexMap<String, IndexSet<RawMarkup>>,
    staleness: u32,
}

impl MergeState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a confirmed anchor item.
    pub fn seeded(message_id: impl Into<String>, markup: RawMarkup) -> Self {
        let mut order = IndexMap::new();
        order.insert(message_id.into(), IndexSet::from([markup]));
        Self {
            order,
            staleness: 0,
        }
    }

    pub fn tail(&self) -> Option<&str> {
        self.order.last().map(|(id, _)| id.as_str())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn staleness(&self) -> u32 {
        self.staleness
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.order.keys().map(String::as_str)
    }

    pub fn variants(&self, message_id: &str) -> Option<&IndexSet<RawMarkup>> {
        self.order.get(message_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &IndexSet<RawMarkup>)> {
        self.order.iter().map(|(id, variants)| (id.as_str(), variants))
    }

    /// Fold one captured window into the order.
    pub fn merge_window(&mut self, window: Vec<WindowEntry>) -> ScrapeResult<MergeOutcome> {
        let tail = self.tail().map(str::to_string);
        let last_index = window.len().saturating_sub(1);

        // The contiguous run of captured bubbles that contains the tail.
        let mut run: Vec<(String, RawMarkup)> = Vec::new();
        let mut contains_tail = tail.is_none();
        let mut run_reaches_end = false;
        for (index, entry) in window.into_iter().enumerate() {
            match entry {
                WindowEntry::Skipped { message_id } => {
                    if contains_tail {
                        break;
                    }
                    run.clear();
                    run_reaches_end = false;
                    if message_id.is_some() && message_id == tail {
                        contains_tail = true;
                    }
                }
                WindowEntry::Captured { message_id, markup } => {
                    let is_tail = Some(&message_id) == tail.as_ref();
                    run.push((message_id, markup));
                    run_reaches_end = index == last_index;
                    if is_tail {
                        contains_tail = true;
                    }
                }
            }
        }

        let mut tail_assumed_ahead = false;
        if !contains_tail {
            match run.last() {
                Some((last, _)) if self.order.contains_key(last) => {
                    tail_assumed_ahead = true;
                    run_reaches_end = false;
                }
                _ => {
                    return Err(ScrapeError::LostTrack {
                        tail: tail.unwrap_or_default(),
                        run: run.into_iter().map(|(id, _)| id).collect(),
                    })
                }
            }
        }

        // Split the run after the tail (or keep it whole when the tail is
        // assumed to be further down).
        let split = match &tail {
            Some(tail) if !tail_assumed_ahead => run
                .iter()
                .position(|(id, _)| id == tail)
                .map_or(0, |i| i + 1),
            Some(_) => run.len(),
            None => 0,
        };
        let fresh = run.split_off(split);

        let mut discovered = self.reconcile(run)?;
        for (message_id, markup) in fresh {
            if self.order.contains_key(&message_id) {
                return Err(ScrapeError::DuplicateOrder(message_id));
            }
            self.order.insert(message_id, IndexSet::from([markup]));
            discovered += 1;
        }

        if discovered > 0 {
            self.staleness = 0;
        } else {
            self.staleness += 1;
        }

        Ok(MergeOutcome {
            discovered,
            tail_assumed_ahead,
            run_reaches_end,
        })
    }

    /// Match the part of the run that overlaps the established order. Known
    /// items must follow each other without gaps; unknown items are spliced
    /// in front of the next known item.
    fn reconcile(&mut self, overlap: Vec<(String, RawMarkup)>) -> ScrapeResult<usize> {
        let mut cursor: Option<usize> = None;
        let mut pending: Vec<(String, RawMarkup)> = Vec::new();
        let mut pending_ids = HashSet::new();
        let mut discovered = 0;

        for (message_id, markup) in overlap {
            let Some(mut index) = self.order.get_index_of(&message_id) else {
                if !pending_ids.insert(message_id.clone()) {
                    return Err(ScrapeError::DuplicateOrder(message_id));
                }
                pending.push((message_id, markup));
                continue;
            };
            if let Some(previous) = cursor {
                if index != previous + 1 {
                    return Err(ScrapeError::InconsistentOrder(message_id));
                }
            }
            for (new_id, new_markup) in pending.drain(..) {
                self.order
                    .shift_insert(index, new_id, IndexSet::from([new_markup]));
                index += 1;
                discovered += 1;
            }
            pending_ids.clear();

            if let Some((_, variants)) = self.order.get_index_mut(index) {
                variants.insert(markup);
            }
            cursor = Some(index);
        }

        // The overlap always ends on a known item, so nothing is left pending.
        if let Some((message_id, _)) = pending.into_iter().next() {
            return Err(ScrapeError::InconsistentOrder(message_id));
        }
        Ok(discovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn bubble(id: &str) -> WindowEntry {
        WindowEntry::captured(id, RawMarkup::from_text(&format!("<div data-mid=\"{id}\"></div>")))
    }

    fn edited(id: &str, text: &str) -> WindowEntry {
        WindowEntry::captured(id, RawMarkup::from_text(&format!("<div data-mid=\"{id}\">{text}</div>")))
    }

    fn skipped(id: &str) -> WindowEntry {
        WindowEntry::Skipped {
            message_id: Some(id.to_string()),
        }
    }

    fn window(ids: &[&str]) -> Vec<WindowEntry> {
        ids.iter().map(|id| bubble(id)).collect()
    }

    fn order(state: &MergeState) -> Vec<&str> {
        state.ids().collect()
    }

    #[test]
    fn test_three_overlapping_windows() {
        let mut state = MergeState::new();
        state.merge_window(window(&["1", "2", "3"])).unwrap();
        state.merge_window(window(&["2", "3", "4"])).unwrap();
        let outcome = state.merge_window(window(&["4", "5"])).unwrap();

        assert_eq!(order(&state), vec!["1", "2", "3", "4", "5"]);
        assert_eq!(outcome.discovered, 1);
        assert!(outcome.run_reaches_end);
        assert_eq!(state.staleness(), 0);
    }

    #[test]
    fn test_variants_accumulate() {
        let mut state = MergeState::seeded("1", RawMarkup::from_text("<div>a</div>"));
        state.merge_window(vec![edited("1", "b"), bubble("2")]).unwrap();
        state.merge_window(vec![edited("1", "b"), edited("2", "c")]).unwrap();

        assert_eq!(state.variants("1").unwrap().len(), 2);
        assert_eq!(state.variants("2").unwrap().len(), 2);
        assert_eq!(state.staleness(), 1);
    }

    #[test]
    fn test_tail_ahead_of_window_is_not_lost() {
        let mut state = MergeState::new();
        state.merge_window(window(&["1", "2", "3", "4"])).unwrap();
        let outcome = state.merge_window(window(&["2", "3"])).unwrap();
        assert!(outcome.tail_assumed_ahead);
        assert!(!outcome.run_reaches_end);
        assert_eq!(outcome.discovered, 0);
        assert_eq!(order(&state), vec!["1", "2", "3", "4"]);
    }

    #[test]
    fn test_lost_track() {
        let mut state = MergeState::new();
        state.merge_window(window(&["1", "2", "3"])).unwrap();
        let err = state.merge_window(window(&["7", "8"])).unwrap_err();
        assert!(matches!(err, ScrapeError::LostTrack { tail, .. } if tail == "3"));
    }

    #[test]
    fn test_known_id_after_tail_is_duplicate() {
        let mut state = MergeState::new();
        state.merge_window(window(&["1", "2", "3"])).unwrap();
        let err = state.merge_window(window(&["3", "4", "1"])).unwrap_err();
        assert!(matches!(err, ScrapeError::DuplicateOrder(id) if id == "1"));
    }

    #[test]
    fn test_reordered_overlap_is_inconsistent() {
        let mut state = MergeState::new();
        state.merge_window(window(&["1", "2", "3"])).unwrap();
        let err = state.merge_window(window(&["1", "3", "2"])).unwrap_err();
        assert!(matches!(err, ScrapeError::InconsistentOrder(_)));
    }

    #[test]
    fn test_new_item_is_spliced_before_tail() {
        let mut state = MergeState::new();
        state.merge_window(window(&["1", "2", "3"])).unwrap();
        let outcome = state.merge_window(window(&["2", "2b", "3", "4"])).unwrap();
        assert_eq!(order(&state), vec!["1", "2", "2b", "3", "4"]);
        assert_eq!(outcome.discovered, 2);
    }

    #[test]
    fn test_skipped_bubble_breaks_run() {
        let mut state = MergeState::new();
        state.merge_window(window(&["1", "2"])).unwrap();

        // The run before the skip does not hold the tail and is dropped.
        let outcome = state
            .merge_window(vec![bubble("0"), skipped("1"), bubble("2"), bubble("3")])
            .unwrap();
        assert_eq!(order(&state), vec!["1", "2", "3"]);
        assert!(outcome.run_reaches_end);

        // A skip after the tail ends the run; later bubbles wait for the next pass.
        let outcome = state
            .merge_window(vec![bubble("3"), bubble("4"), skipped("5"), bubble("6")])
            .unwrap();
        assert_eq!(order(&state), vec!["1", "2", "3", "4"]);
        assert!(!outcome.run_reaches_end);
    }

    #[test]
    fn test_skipped_tail_keeps_following_items() {
        let mut state = MergeState::new();
        state.merge_window(window(&["1", "2"])).unwrap();
        state
            .merge_window(vec![bubble("1"), skipped("2"), bubble("3")])
            .unwrap();
        assert_eq!(order(&state), vec!["1", "2", "3"]);
    }

    #[test]
    fn test_staleness_counts_empty_passes() {
        let mut state = MergeState::new();
        state.merge_window(window(&["1", "2"])).unwrap();
        for expected in 1..=3 {
            state.merge_window(window(&["1", "2"])).unwrap();
            assert_eq!(state.staleness(), expected);
        }
        state.merge_window(window(&["2", "3"])).unwrap();
        assert_eq!(state.staleness(), 0);
    }

    /// The window shown after one scroll step over `source`: it starts up to
    /// `back` items before the tail, shows up to `ahead` items past it, and
    /// the bubbles at the `skips` offsets are not captured.
    fn slide(
        source: &[String],
        state: &MergeState,
        back: usize,
        ahead: usize,
        skips: &[usize],
    ) -> Vec<WindowEntry> {
        let (start, end) = match state.len() {
            0 => (0, (ahead + 1).min(source.len())),
            len => {
                let tail = len - 1;
                (tail - back.min(tail), (tail + 1 + ahead).min(source.len()))
            }
        };
        source[start..end]
            .iter()
            .enumerate()
            .map(|(offset, id)| {
                if skips.contains(&offset) {
                    WindowEntry::Skipped {
                        message_id: Some(id.clone()),
                    }
                } else {
                    bubble(id)
                }
            })
            .collect()
    }

    fn scroll_passes() -> impl Strategy<Value = Vec<(usize, usize, Vec<usize>)>> {
        prop::collection::vec(
            (0..8usize, 0..6usize, prop::collection::vec(0..16usize, 0..3)),
            1..40,
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]

        #[test]
        fn test_sliding_windows_rebuild_the_source(len in 1..60usize, passes in scroll_passes()) {
            let source: Vec<String> = (0..len).map(|i| format!("{}", 1000 + i)).collect();
            let mut state = MergeState::new();

            for (back, ahead, skips) in passes {
                let window = slide(&source, &state, back, ahead, &skips);
                let result = state.merge_window(window);
                prop_assert!(result.is_ok(), "{:?}", result);

                let ids: Vec<&str> = state.ids().collect();
                prop_assert!(ids.len() <= source.len());
                prop_assert!(ids.iter().zip(&source).all(|(id, expected)| *id == expected.as_str()));
                let unique: HashSet<&str> = ids.iter().copied().collect();
                prop_assert_eq!(unique.len(), ids.len());
            }

            // One clean pass from the tail to the bottom completes the log.
            let window = slide(&source, &state, 0, len, &[]);
            let result = state.merge_window(window);
            prop_assert!(result.is_ok(), "{:?}", result);
            prop_assert!(state.ids().eq(source.iter().map(String::as_str)));
        }
    }
}
