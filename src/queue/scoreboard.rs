//! In-flight delivery tracking
//!
//! The scoreboard is advisory: it is not durable and is rebuilt implicitly by
//! the stuck sweep after a restart. It guarantees at most one delivery task per
//! message ID within a process.

use super::Section;
use crate::message::MessageId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

/// What the scoreboard knows about an active message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreEntry {
    pub section: Section,
    pub since: Instant,
}

/// Registry of message IDs under active processing
#[derive(Debug, Default)]
pub struct Scoreboard {
    entries: Mutex<HashMap<MessageId, ScoreEntry>>,
}

impl Scoreboard {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<MessageId, ScoreEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `id` as in flight; false if it already was
    pub fn try_acquire(&self, id: MessageId, section: Section) -> bool {
        let mut entries = self.entries();
        if entries.contains_key(&id) {
            return false;
        }
        entries.insert(
            id,
            ScoreEntry {
                section,
                since: Instant::now(),
            },
        );
        true
    }

    pub fn release(&self, id: &MessageId) {
        self.entries().remove(id);
    }

    pub fn is_active(&self, id: &MessageId) -> bool {
        self.entries().contains_key(id)
    }

    pub fn get(&self, id: &MessageId) -> Option<ScoreEntry> {
        self.entries().get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Acquire `id` and get a guard that releases it when dropped
    ///
    /// The guard is moved into the delivery task, so release happens on every
    /// exit path, including panics.
    pub fn claim(self: &Arc<Self>, id: MessageId, section: Section) -> Option<ScoreGuard> {
        self.try_acquire(id, section).then(|| ScoreGuard {
            scoreboard: Arc::clone(self),
            id,
        })
    }
}

/// Releases its scoreboard entry on drop
#[derive(Debug)]
pub struct ScoreGuard {
    scoreboard: Arc<Scoreboard>,
    id: MessageId,
}

impl ScoreGuard {
    pub fn id(&self) -> &MessageId {
        &self.id
    }
}

impl Drop for ScoreGuard {
    fn drop(&mut self) {
        self.scoreboard.release(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn test_acquire_release() {
        let board = Scoreboard::new();
        let id = MessageId::new();

        assert!(!board.is_active(&id));
        assert!(board.try_acquire(id, Section::Processing));
        assert!(board.is_active(&id));
        assert!(!board.try_acquire(id, Section::Processing));
        assert_eq!(board.get(&id).unwrap().section, Section::Processing);

        board.release(&id);
        assert!(!board.is_active(&id));
        assert!(board.try_acquire(id, Section::Retry));
    }

    #[test]
    fn test_concurrent_acquire_exactly_one_wins() {
        for _ in 0..50 {
            let board = Arc::new(Scoreboard::new());
            let id = MessageId::new();
            let barrier = Arc::new(Barrier::new(2));

            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let board = Arc::clone(&board);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        board.try_acquire(id, Section::Processing)
                    })
                })
                .collect();

            let wins = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count();
            assert_eq!(wins, 1);
        }
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let board = Arc::new(Scoreboard::new());
        let id = MessageId::new();

        let guard = board.claim(id, Section::Processing).unwrap();
        assert_eq!(guard.id(), &id);
        assert!(board.claim(id, Section::Processing).is_none());

        drop(guard);
        assert!(board.is_empty());
    }

    #[test]
    fn test_guard_releases_on_panic() {
        let board = Arc::new(Scoreboard::new());
        let id = MessageId::new();
        let guard = board.claim(id, Section::Processing).unwrap();

        let result = thread::spawn(move || {
            let _guard = guard;
            panic!("delivery task blew up");
        })
        .join();

        assert!(result.is_err());
        assert!(!board.is_active(&id));
    }
}
