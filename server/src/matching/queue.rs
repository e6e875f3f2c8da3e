//! Waiting queue: one FIFO bucket per filter value.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;

use super::category::{Category, Filter};
use super::registry::DeviceRegistry;
use crate::ws::ConnectionSender;

/// A device waiting to be paired.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub device_id: String,
    pub filter: Filter,
    pub connection: ConnectionSender,
    pub enqueued_at: DateTime<Utc>,
}

/// Position of a candidate inside the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    bucket: usize,
    index: usize,
}

#[derive(Debug, Default)]
pub struct MatchQueue {
    buckets: [VecDeque<QueueEntry>; Filter::BUCKETS],
}

impl MatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, entry: QueueEntry) {
        self.buckets[entry.filter.bucket_index()].push_back(entry);
    }

    /// Remove the device from every bucket. Returns true if anything was removed.
    pub fn remove(&mut self, device_id: &str) -> bool {
        let mut removed = false;
        for bucket in &mut self.buckets {
            let before = bucket.len();
            bucket.retain(|e| e.device_id != device_id);
            removed |= bucket.len() != before;
        }
        removed
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.position(device_id).is_some()
    }

    /// Filter of the bucket currently holding the device.
    pub fn filter_of(&self, device_id: &str) -> Option<Filter> {
        self.position(device_id)
            .map(|slot| self.buckets[slot.bucket][slot.index].filter)
    }

    fn position(&self, device_id: &str) -> Option<Slot> {
        self.buckets.iter().enumerate().find_map(|(bucket, entries)| {
            entries
                .iter()
                .position(|e| e.device_id == device_id)
                .map(|index| Slot { bucket, index })
        })
    }

    /// First eligible waiting device for `joiner` with `filter`.
    ///
    /// Buckets are scanned male, female, non-binary, prefer-not-to-say, any;
    /// each bucket oldest first. Only the joiner's filter is checked against
    /// the candidate's stored category; the candidate's own filter is not
    /// checked against the joiner.
    pub fn find_candidate(
        &self,
        joiner: &str,
        filter: Filter,
        registry: &DeviceRegistry,
    ) -> Option<Slot> {
        for (bucket, entries) in self.buckets.iter().enumerate() {
            for (index, entry) in entries.iter().enumerate() {
                if entry.device_id == joiner {
                    continue;
                }
                let category: Option<Category> =
                    registry.get(&entry.device_id).and_then(|p| p.category);
                if filter.admits(category) {
                    return Some(Slot { bucket, index });
                }
            }
        }
        None
    }

    pub fn take(&mut self, slot: Slot) -> Option<QueueEntry> {
        self.buckets[slot.bucket].remove(slot.index)
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(VecDeque::is_empty)
    }

    pub fn device_ids(&self) -> impl Iterator<Item = &str> {
        self.buckets
            .iter()
            .flat_map(|b| b.iter().map(|e| e.device_id.as_str()))
    }
}
