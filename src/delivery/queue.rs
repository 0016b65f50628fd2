//! In-memory local queue for items awaiting redelivery.
//!
//! New failures are pushed to the front, so the front always holds the most
//! recently queued item. Nothing here is persisted; a crash loses the queue.

use crate::delivery::config::DrainOrder;
use crate::delivery::item::OutboundItem;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use uuid::Uuid;

/// A queued item with its retry bookkeeping
#[derive(Debug, Clone)]
pub struct QueuedEntry {
    pub item: Arc<OutboundItem>,
    /// Consecutive flush cycles in which redelivery failed
    pub failed_cycles: u32,
    pub queued_at: DateTime<Utc>,
}

impl QueuedEntry {
    pub fn id(&self) -> Uuid {
        self.item.id
    }
}

/// Mutex-guarded queue shared by the send path and the flusher
#[derive(Debug)]
pub struct LocalQueue {
    entries: Mutex<VecDeque<QueuedEntry>>,
    order: DrainOrder,
}

impl LocalQueue {
    pub fn new(order: DrainOrder) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            order,
        }
    }

    pub fn drain_order(&self) -> DrainOrder {
        self.order
    }

    /// Prepend an item; returns the new depth
    pub fn push(&self, item: OutboundItem) -> usize {
        let mut entries = self.entries.lock();
        entries.push_front(QueuedEntry {
            item: Arc::new(item),
            failed_cycles: 0,
            queued_at: Utc::now(),
        });
        entries.len()
    }

    /// Copy of the queue in drain order
    pub fn snapshot(&self) -> Vec<QueuedEntry> {
        let entries = self.entries.lock();
        match self.order {
            DrainOrder::NewestFirst => entries.iter().cloned().collect(),
            DrainOrder::OldestFirst => entries.iter().rev().cloned().collect(),
        }
    }

    /// Remove an entry by item ID
    pub fn remove(&self, id: Uuid) -> Option<QueuedEntry> {
        let mut entries = self.entries.lock();
        let index = entries.iter().position(|e| e.id() == id)?;
        entries.remove(index)
    }

    /// Count a failed cycle; returns the new count if the entry is still queued
    pub fn record_failure(&self, id: Uuid) -> Option<u32> {
        let mut entries = self.entries.lock();
        let entry = entries.iter_mut().find(|e| e.id() == id)?;
        entry.failed_cycles += 1;
        Some(entry.failed_cycles)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
