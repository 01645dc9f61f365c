//! In-memory queue backend
//!
//! Same semantics as the filesystem backend without durability. A single mutex
//! guards the whole map, so every operation is trivially atomic.

use super::{QueueError, QueueStore, Result, Section, StaleIter};
use crate::message::{Header, MessageArtifacts, MessageId};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

struct Slot {
    section: Section,
    entered_at: Instant,
    attempts: u32,
    artifacts: MessageArtifacts,
}

/// In-memory queue store
#[derive(Default)]
pub struct MemoryQueue {
    slots: Mutex<HashMap<MessageId, Slot>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<MessageId, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_slot<T>(
        &self,
        section: Section,
        id: &MessageId,
        f: impl FnOnce(&mut Slot) -> T,
    ) -> Result<T> {
        let mut slots = self.slots();
        match slots.get_mut(id) {
            Some(slot) if slot.section == section => Ok(f(slot)),
            _ => Err(QueueError::not_found(section, id)),
        }
    }
}

impl QueueStore for MemoryQueue {
    fn enqueue(&self, section: Section, artifacts: &MessageArtifacts) -> Result<()> {
        let mut slots = self.slots();
        if let Some(existing) = slots.get(&artifacts.id) {
            return Err(QueueError::exists(existing.section, &artifacts.id));
        }
        slots.insert(
            artifacts.id,
            Slot {
                section,
                entered_at: Instant::now(),
                attempts: 0,
                artifacts: artifacts.clone(),
            },
        );
        Ok(())
    }

    fn move_message(&self, from: Section, to: Section, id: &MessageId) -> Result<()> {
        self.with_slot(from, id, |slot| {
            slot.section = to;
            slot.entered_at = Instant::now();
        })
    }

    fn list(&self, section: Section) -> Result<Vec<MessageId>> {
        let mut ids: Vec<MessageId> = self
            .slots()
            .iter()
            .filter(|(_, slot)| slot.section == section)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn list_stale(&self, section: Section, age: Duration) -> Result<StaleIter<'_>> {
        // Snapshot the candidates; the lock is not held while the caller iterates
        let candidates: Vec<(MessageId, Instant)> = self
            .slots()
            .iter()
            .filter(|(_, slot)| slot.section == section)
            .map(|(id, slot)| (*id, slot.entered_at))
            .collect();

        Ok(Box::new(
            candidates
                .into_iter()
                .filter(move |(_, entered_at)| entered_at.elapsed() >= age)
                .map(|(id, _)| Ok(id)),
        ))
    }

    fn remove(&self, section: Section, id: &MessageId) -> Result<()> {
        let mut slots = self.slots();
        match slots.get(id) {
            Some(slot) if slot.section == section => {
                slots.remove(id);
                Ok(())
            }
            _ => Err(QueueError::not_found(section, id)),
        }
    }

    fn contains(&self, section: Section, id: &MessageId) -> Result<bool> {
        Ok(self
            .slots()
            .get(id)
            .is_some_and(|slot| slot.section == section))
    }

    fn load_header(&self, section: Section, id: &MessageId) -> Result<Header> {
        self.with_slot(section, id, |slot| slot.artifacts.header.clone())
    }

    fn load(&self, section: Section, id: &MessageId) -> Result<MessageArtifacts> {
        self.with_slot(section, id, |slot| slot.artifacts.clone())
    }

    fn record_attempt(&self, section: Section, id: &MessageId) -> Result<u32> {
        self.with_slot(section, id, |slot| {
            slot.attempts += 1;
            slot.attempts
        })
    }

    fn locate(&self, id: &MessageId) -> Result<Option<Section>> {
        Ok(self.slots().get(id).map(|slot| slot.section))
    }
}
