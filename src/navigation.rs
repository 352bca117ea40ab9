//! Next/previous index determination under shuffle and repeat.
//!
//! The navigator owns the shuffle history and recomputes the navigation
//! cursor from the current index and list length. It never caches a result
//! across mutations; callers invoke [`Navigator::determine`] after every
//! structural or mode change.

use log::trace;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::protocol::RepeatMode;

/// Smallest list that is actually shuffled.
const MIN_SHUFFLE_LEN: usize = 3;

/// Derived navigation cursor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NavigationCursor {
    pub next: Option<usize>,
    pub prev: Option<usize>,
}

/// Shuffle/repeat state plus the visited-index history.
pub struct Navigator {
    shuffle: bool,
    repeat_mode: RepeatMode,
    history: Vec<usize>,
    cursor: NavigationCursor,
    rng: StdRng,
}

impl Navigator {
    pub fn new() -> Self {
        let mut seed = [0u8; 32];
        if let Err(err) = getrandom::fill(&mut seed) {
            log::warn!("Navigator: failed to gather random seed, using time: {}", err);
            let nanos = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|elapsed| elapsed.as_nanos())
                .unwrap_or_default();
            seed[..16].copy_from_slice(&nanos.to_le_bytes());
        }
        Self::with_rng(StdRng::from_seed(seed))
    }

    /// Deterministic navigator for reproducible shuffles.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            shuffle: false,
            repeat_mode: RepeatMode::None,
            history: Vec::new(),
            cursor: NavigationCursor::default(),
            rng,
        }
    }

    pub fn shuffle(&self) -> bool {
        self.shuffle
    }

    /// Sets the shuffle flag. Toggling in either direction drops the history.
    /// Returns `false` when the flag was already in that state.
    pub fn set_shuffle(&mut self, shuffle: bool) -> bool {
        if self.shuffle == shuffle {
            return false;
        }
        self.history.clear();
        self.shuffle = shuffle;
        true
    }

    pub fn repeat_mode(&self) -> RepeatMode {
        self.repeat_mode
    }

    pub fn set_repeat_mode(&mut self, repeat_mode: RepeatMode) -> bool {
        if self.repeat_mode == repeat_mode {
            return false;
        }
        self.repeat_mode = repeat_mode;
        true
    }

    pub fn cursor(&self) -> NavigationCursor {
        self.cursor
    }

    pub fn next(&self) -> Option<usize> {
        self.cursor.next
    }

    pub fn prev(&self) -> Option<usize> {
        self.cursor.prev
    }

    /// Overrides the cursor after the current item expanded into sub-items:
    /// playback continues at the first of them and there is no previous.
    pub fn set_next(&mut self, next: Option<usize>) {
        self.cursor = NavigationCursor { next, prev: None };
    }

    pub fn history(&self) -> &[usize] {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Records `index` as visited. An index appears at most once; a repeat
    /// visit moves it to the top of the stack.
    pub fn push_history(&mut self, index: usize) {
        self.history.retain(|visited| *visited != index);
        self.history.push(index);
    }

    pub fn pop_history(&mut self) -> Option<usize> {
        self.history.pop()
    }

    /// Drops `index` from the history; the current index is never kept there.
    pub fn forget(&mut self, index: usize) {
        self.history.retain(|visited| *visited != index);
    }

    /// Whether shuffle applies to a list of `len` entries.
    pub fn is_shuffling(&self, len: usize) -> bool {
        self.shuffle && len >= MIN_SHUFFLE_LEN
    }

    /// Recomputes the cursor for `current` in a list of `len` entries.
    pub fn determine(&mut self, current: Option<usize>, len: usize) -> NavigationCursor {
        self.cursor = self.compute(current, len);
        trace!(
            "Navigator: current={:?} len={} next={:?} prev={:?} history={:?}",
            current,
            len,
            self.cursor.next,
            self.cursor.prev,
            self.history
        );
        self.cursor
    }

    fn compute(&mut self, current: Option<usize>, len: usize) -> NavigationCursor {
        if self.repeat_mode == RepeatMode::One {
            let current = current.filter(|index| *index < len);
            return NavigationCursor {
                next: current,
                prev: current,
            };
        }

        if self.is_shuffling(len) {
            return self.compute_shuffled(current, len);
        }

        let prev = current.filter(|index| *index > 0 && *index <= len).map(|index| index - 1);
        let next = match current {
            Some(index) if index + 1 < len => Some(index + 1),
            None if len > 0 => Some(0),
            _ if self.repeat_mode == RepeatMode::None || len == 0 => None,
            _ => Some(0),
        };
        NavigationCursor { next, prev }
    }

    fn compute_shuffled(&mut self, current: Option<usize>, len: usize) -> NavigationCursor {
        let mut prev = None;
        while let Some(&top) = self.history.last() {
            if top < len && Some(top) != current {
                prev = Some(top);
                break;
            }
            self.history.pop();
        }
        if let Some(current) = current {
            self.forget(current);
        }

        let visited = self.history.iter().filter(|index| **index < len).count();
        if visited + 1 >= len {
            if self.repeat_mode == RepeatMode::None {
                return NavigationCursor { next: None, prev };
            }
            self.history.clear();
        }

        let candidates: Vec<usize> = (0..len)
            .filter(|index| Some(*index) != current && !self.history.contains(index))
            .collect();
        let next = if candidates.is_empty() {
            None
        } else {
            Some(candidates[self.rng.random_range(0..candidates.len())])
        };
        NavigationCursor { next, prev }
    }
}

impl Default for Navigator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// Walks the playlist the way the manager does on `next()`.
    fn advance(navigator: &mut Navigator, current: &mut Option<usize>, len: usize) -> bool {
        let cursor = navigator.determine(*current, len);
        let Some(next) = cursor.next else {
            return false;
        };
        if let Some(index) = *current {
            navigator.push_history(index);
        }
        navigator.forget(next);
        *current = Some(next);
        true
    }

    #[test]
    fn test_sequential_next_at_last_index_without_repeat_is_none() {
        let mut navigator = Navigator::with_seed(1);
        let cursor = navigator.determine(Some(2), 3);
        assert_eq!(cursor.next, None);
        assert_eq!(cursor.prev, Some(1));
    }

    #[test]
    fn test_sequential_next_at_last_index_with_repeat_all_wraps() {
        let mut navigator = Navigator::with_seed(1);
        navigator.set_repeat_mode(RepeatMode::All);
        let cursor = navigator.determine(Some(2), 3);
        assert_eq!(cursor.next, Some(0));
    }

    #[test]
    fn test_sequential_first_index_has_no_previous() {
        let mut navigator = Navigator::with_seed(1);
        let cursor = navigator.determine(Some(0), 3);
        assert_eq!(cursor, NavigationCursor { next: Some(1), prev: None });
    }

    #[test]
    fn test_repeat_one_pins_cursor_regardless_of_shuffle() {
        for shuffle in [false, true] {
            let mut navigator = Navigator::with_seed(7);
            navigator.set_shuffle(shuffle);
            navigator.set_repeat_mode(RepeatMode::One);
            for current in 0..5 {
                let cursor = navigator.determine(Some(current), 5);
                assert_eq!(cursor.next, Some(current));
                assert_eq!(cursor.prev, Some(current));
            }
        }
    }

    #[test]
    fn test_shuffle_without_repeat_visits_every_index_once() {
        for len in 3..12 {
            for seed in 0..20 {
                let mut navigator = Navigator::with_seed(seed);
                navigator.set_shuffle(true);
                let mut current = Some(0);
                let mut visited = vec![0];
                while advance(&mut navigator, &mut current, len) {
                    visited.push(current.expect("advance sets current"));
                    assert!(visited.len() <= len, "walk exceeded playlist length");
                }
                let unique: HashSet<usize> = visited.iter().copied().collect();
                assert_eq!(unique.len(), visited.len(), "duplicate in {visited:?}");
                assert_eq!(visited.len(), len);
            }
        }
    }

    #[test]
    fn test_shuffle_with_repeat_all_reshuffles_after_exhaustion() {
        let mut navigator = Navigator::with_seed(3);
        navigator.set_shuffle(true);
        navigator.set_repeat_mode(RepeatMode::All);
        let mut current = Some(0);
        for _ in 0..50 {
            assert!(advance(&mut navigator, &mut current, 4));
        }
    }

    #[test]
    fn test_shuffle_previous_skips_stale_history_entries() {
        let mut navigator = Navigator::with_seed(5);
        navigator.set_shuffle(true);
        navigator.push_history(1);
        navigator.push_history(9);
        navigator.push_history(12);
        let cursor = navigator.determine(Some(0), 5);
        assert_eq!(cursor.prev, Some(1));
        assert_eq!(navigator.history(), &[1]);
        assert!(cursor.next.is_some_and(|next| next != 0 && next != 1));
    }

    #[test]
    fn test_shuffle_is_ignored_for_two_item_lists() {
        let mut navigator = Navigator::with_seed(5);
        navigator.set_shuffle(true);
        let cursor = navigator.determine(Some(0), 2);
        assert_eq!(cursor.next, Some(1));
        assert!(navigator.shuffle());
    }

    #[test]
    fn test_duplicate_history_entries_do_not_trigger_early_end() {
        let mut navigator = Navigator::with_seed(11);
        navigator.set_shuffle(true);
        navigator.push_history(1);
        navigator.push_history(1);
        navigator.push_history(1);
        let cursor = navigator.determine(Some(0), 4);
        assert!(cursor.next.is_some());
        assert_eq!(navigator.history(), &[1]);
    }

    #[test]
    fn test_current_index_in_history_is_dropped() {
        let mut navigator = Navigator::with_seed(11);
        navigator.set_shuffle(true);
        navigator.push_history(2);
        navigator.push_history(0);
        let cursor = navigator.determine(Some(0), 3);
        assert_eq!(navigator.history(), &[2]);
        assert_eq!(cursor.prev, Some(2));
        assert_eq!(cursor.next, Some(1));
    }

    #[test]
    fn test_toggling_shuffle_clears_history() {
        let mut navigator = Navigator::with_seed(2);
        navigator.push_history(1);
        assert!(navigator.set_shuffle(true));
        assert!(navigator.history().is_empty());
        navigator.push_history(3);
        assert!(!navigator.set_shuffle(true));
        assert_eq!(navigator.history(), &[3]);
        assert!(navigator.set_shuffle(false));
        assert!(navigator.history().is_empty());
    }

    #[test]
    fn test_empty_list_has_no_cursor() {
        let mut navigator = Navigator::with_seed(2);
        assert_eq!(navigator.determine(None, 0), NavigationCursor::default());
        navigator.set_repeat_mode(RepeatMode::All);
        assert_eq!(navigator.determine(None, 0), NavigationCursor::default());
    }
}
