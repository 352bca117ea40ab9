//! Single-flight coalescing of structural playlist updates.
//!
//! Snapshots go into a one-slot `watch` channel. A consumer thread wakes on
//! change, diffs the newest snapshot against the last applied one, and
//! publishes [`PlaylistMessage::ListUpdated`]. Snapshots overwritten while a
//! cycle runs are never applied.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use log::{debug, error, trace};
use tokio::sync::broadcast::Sender;
use tokio::sync::watch;

use crate::media::MediaItem;
use crate::protocol::{ListDiff, Message, PlaylistMessage, PlaylistSnapshot};

type Slot = Option<PlaylistSnapshot>;

pub struct UpdateCoalescer {
    slot: watch::Sender<Slot>,
    applied: Arc<AtomicU64>,
}

impl UpdateCoalescer {
    /// Creates the slot and spawns its consumer thread. The consumer exits
    /// once the coalescer is dropped.
    pub fn new(bus_producer: Sender<Message>) -> Self {
        let (slot, receiver) = watch::channel(None);
        let applied = Arc::new(AtomicU64::new(0));
        spawn_consumer(receiver, bus_producer, Arc::clone(&applied));
        Self { slot, applied }
    }

    /// Replaces whatever is pending with `snapshot`.
    pub fn submit(&self, snapshot: PlaylistSnapshot) {
        trace!(
            "UpdateCoalescer: submit size={} current={:?}",
            snapshot.items.len(),
            snapshot.current_index
        );
        self.slot.send_replace(Some(snapshot));
    }

    /// Most recent submission, applied or not.
    pub fn peek_last(&self) -> Option<PlaylistSnapshot> {
        self.slot.borrow().clone()
    }

    /// Number of completed diff/publish cycles.
    pub fn applied_count(&self) -> u64 {
        self.applied.load(Ordering::SeqCst)
    }
}

fn spawn_consumer(
    mut receiver: watch::Receiver<Slot>,
    bus_producer: Sender<Message>,
    applied: Arc<AtomicU64>,
) {
    let spawned = thread::Builder::new()
        .name("playlist-updates".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().build() {
                Ok(runtime) => runtime,
                Err(err) => {
                    error!("UpdateCoalescer: failed to build consumer runtime: {}", err);
                    return;
                }
            };

            runtime.block_on(async move {
                let mut previous: Vec<MediaItem> = Vec::new();
                while receiver.changed().await.is_ok() {
                    let Some(snapshot) = receiver.borrow_and_update().clone() else {
                        continue;
                    };
                    let diff = diff_items(&previous, &snapshot.items);
                    previous = snapshot.items.clone();
                    applied.fetch_add(1, Ordering::SeqCst);
                    debug!(
                        "UpdateCoalescer: applied size={} removed={} inserted={} moved={}",
                        snapshot.items.len(),
                        diff.removed.len(),
                        diff.inserted.len(),
                        diff.moved.len()
                    );
                    let _ = bus_producer.send(Message::Playlist(PlaylistMessage::ListUpdated {
                        snapshot,
                        diff,
                    }));
                }
                debug!("UpdateCoalescer: slot closed, consumer exiting");
            });
        });
    if let Err(err) = spawned {
        error!("UpdateCoalescer: failed to spawn consumer thread: {}", err);
    }
}

/// Diffs two lists by item id.
pub fn diff_items(old: &[MediaItem], new: &[MediaItem]) -> ListDiff {
    let old_positions: HashMap<&str, usize> = old
        .iter()
        .enumerate()
        .map(|(position, item)| (item.id.as_str(), position))
        .collect();
    let new_positions: HashMap<&str, usize> = new
        .iter()
        .enumerate()
        .map(|(position, item)| (item.id.as_str(), position))
        .collect();

    let removed: Vec<usize> = old
        .iter()
        .enumerate()
        .filter(|(_, item)| !new_positions.contains_key(item.id.as_str()))
        .map(|(position, _)| position)
        .collect();
    let inserted: Vec<usize> = new
        .iter()
        .enumerate()
        .filter(|(_, item)| !old_positions.contains_key(item.id.as_str()))
        .map(|(position, _)| position)
        .collect();

    // Compare survivor ranks so pure insertions and removals do not count
    // as moves.
    let old_survivors: Vec<&str> = old
        .iter()
        .map(|item| item.id.as_str())
        .filter(|id| new_positions.contains_key(id))
        .collect();
    let new_rank: HashMap<&str, usize> = new
        .iter()
        .map(|item| item.id.as_str())
        .filter(|id| old_positions.contains_key(id))
        .enumerate()
        .map(|(rank, id)| (id, rank))
        .collect();
    let moved = old_survivors
        .iter()
        .enumerate()
        .filter(|(rank, id)| new_rank.get(*id) != Some(rank))
        .filter_map(|(_, id)| Some((*old_positions.get(id)?, *new_positions.get(id)?)))
        .collect();

    ListDiff {
        removed,
        inserted,
        moved,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaKind;
    use std::time::{Duration, Instant};
    use tokio::sync::broadcast::{self, error::TryRecvError, Receiver};

    fn items(count: usize) -> Vec<MediaItem> {
        (0..count)
            .map(|index| MediaItem::new(format!("/music/{index}.mp3"), MediaKind::Audio))
            .collect()
    }

    fn snapshot(items: Vec<MediaItem>) -> PlaylistSnapshot {
        PlaylistSnapshot {
            items,
            current_index: Some(0),
        }
    }

    fn collect_updates(
        receiver: &mut Receiver<Message>,
        until: impl Fn(&PlaylistSnapshot) -> bool,
    ) -> Vec<(PlaylistSnapshot, ListDiff)> {
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut updates = Vec::new();
        while Instant::now() < deadline {
            match receiver.try_recv() {
                Ok(Message::Playlist(PlaylistMessage::ListUpdated { snapshot, diff })) => {
                    let done = until(&snapshot);
                    updates.push((snapshot, diff));
                    if done {
                        return updates;
                    }
                }
                Ok(_) | Err(TryRecvError::Lagged(_)) => {}
                Err(TryRecvError::Empty) => thread::sleep(Duration::from_millis(5)),
                Err(TryRecvError::Closed) => break,
            }
        }
        panic!("timed out waiting for list update");
    }

    #[test]
    fn test_pending_snapshots_collapse_to_the_last_one() {
        let (bus_sender, mut receiver) = broadcast::channel(64);
        let (slot, slot_receiver) = watch::channel::<Slot>(None);
        let applied = Arc::new(AtomicU64::new(0));

        let first = items(1);
        let mut second = first.clone();
        second.extend(items(1));
        let mut last = second.clone();
        last.extend(items(1));
        slot.send_replace(Some(snapshot(first)));
        slot.send_replace(Some(snapshot(second)));
        slot.send_replace(Some(snapshot(last.clone())));

        spawn_consumer(slot_receiver, bus_sender, Arc::clone(&applied));
        let updates = collect_updates(&mut receiver, |snapshot| snapshot.items.len() == 3);

        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0.items, last);
        assert_eq!(updates[0].1.inserted, vec![0, 1, 2]);
        assert_eq!(applied.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_burst_of_submissions_always_applies_the_last() {
        let (bus_sender, mut receiver) = broadcast::channel(256);
        let coalescer = UpdateCoalescer::new(bus_sender);

        let mut list = Vec::new();
        for _ in 0..50 {
            list.extend(items(1));
            coalescer.submit(snapshot(list.clone()));
        }

        let updates = collect_updates(&mut receiver, |snapshot| snapshot.items.len() == 50);
        let (final_snapshot, _) = updates.last().expect("at least one update");
        assert_eq!(final_snapshot.items, list);
        assert_eq!(coalescer.peek_last().map(|snapshot| snapshot.items), Some(list));
        assert!(coalescer.applied_count() >= 1);
        assert!(coalescer.applied_count() <= 50);
    }

    #[test]
    fn test_peek_last_is_empty_before_any_submission() {
        let (bus_sender, _receiver) = broadcast::channel(8);
        let coalescer = UpdateCoalescer::new(bus_sender);
        assert!(coalescer.peek_last().is_none());
        assert_eq!(coalescer.applied_count(), 0);
    }

    #[test]
    fn test_diff_reports_removals_insertions_and_moves_by_id() {
        let old = items(4);
        let added = items(1);
        // [a, b, c, d] -> [c, a, new, d]
        let new = vec![
            old[2].clone(),
            old[0].clone(),
            added[0].clone(),
            old[3].clone(),
        ];

        let diff = diff_items(&old, &new);
        assert_eq!(diff.removed, vec![1]);
        assert_eq!(diff.inserted, vec![2]);
        assert_eq!(diff.moved, vec![(0, 1), (2, 0)]);
    }

    #[test]
    fn test_diff_of_identical_lists_is_empty() {
        let list = items(3);
        assert!(diff_items(&list, &list).is_empty());
    }
}
