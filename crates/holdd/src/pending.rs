//! Buffer for entries whose author chain is not yet held far enough back.
//!
//! Items leave the queue to be re-validated and come back if they are
//! still incomplete. Tick-driven retries count against a budget; an item
//! that exhausts it is parked. Parked items keep waiting and are only
//! woken by new chain data for their author. Nothing here is ever
//! promoted to valid.

use chainhold_core::types::*;
use chainhold_net::PeerId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// An entry waiting for its author's chain
#[derive(Debug, Clone)]
pub struct PendingItem {
    pub entry: Entry,
    pub header: Header,
    pub header_address: HeaderAddress,
    /// Peer it came from, excluded when re-gossiping
    pub from: Option<PeerId>,
    /// First seq of the author's chain that was missing last time
    pub missing_seq: u64,
    /// Tick-driven retries so far
    pub attempts: u32,
    pub parked: bool,
    pub first_seen: Instant,
    arrival: u64,
}

impl PendingItem {
    pub fn new(
        entry: Entry,
        header: Header,
        header_address: HeaderAddress,
        from: Option<PeerId>,
        missing_seq: u64,
    ) -> Self {
        Self {
            entry,
            header,
            header_address,
            from,
            missing_seq,
            attempts: 0,
            parked: false,
            first_seen: Instant::now(),
            arrival: 0,
        }
    }

    pub fn author(&self) -> &AgentKey {
        self.header.author()
    }
}

/// What happened on insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queued {
    Inserted,
    /// Same pair was already waiting
    AlreadyPending,
    /// Inserted, and this older item was evicted to make room
    Evicted(HeaderAddress),
}

/// Pending queue statistics
#[derive(Debug, Clone, Default)]
pub struct PendingStats {
    pub active: usize,
    pub parked: usize,
    pub evicted: u64,
}

struct Inner {
    items: HashMap<HeaderAddress, PendingItem>,
    next_arrival: u64,
    evicted: u64,
}

/// Bounded queue of incomplete entries
pub struct PendingQueue {
    inner: Mutex<Inner>,
    retry_budget: u32,
    max_pending: usize,
}

impl PendingQueue {
    pub fn new(retry_budget: u32, max_pending: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: HashMap::new(),
                next_arrival: 0,
                evicted: 0,
            }),
            retry_budget,
            max_pending: max_pending.max(1),
        }
    }

    /// Add a newly incomplete item
    pub fn insert(&self, mut item: PendingItem) -> Queued {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.items.get_mut(&item.header_address) {
            existing.missing_seq = item.missing_seq;
            return Queued::AlreadyPending;
        }

        item.arrival = inner.next_arrival;
        inner.next_arrival += 1;
        trace!(
            header = %item.header_address,
            missing_seq = item.missing_seq,
            "entry pending"
        );
        self.place(&mut inner, item)
    }

    /// Put back an item that is still incomplete after a retry.
    /// Tick-driven retries consume budget and park the item once it is spent.
    pub fn requeue(&self, mut item: PendingItem, missing_seq: u64, tick_driven: bool) -> Queued {
        item.missing_seq = missing_seq;
        if tick_driven {
            item.attempts += 1;
            if item.attempts >= self.retry_budget && !item.parked {
                debug!(
                    header = %item.header_address,
                    author = %item.author(),
                    missing_seq,
                    "retry budget spent, parking entry"
                );
                item.parked = true;
            }
        }

        let mut inner = self.inner.lock();
        if inner.items.contains_key(&item.header_address) {
            return Queued::AlreadyPending;
        }
        // Keeps its original arrival for eviction ordering
        self.place(&mut inner, item)
    }

    fn place(&self, inner: &mut Inner, item: PendingItem) -> Queued {
        let mut evicted = None;
        if inner.items.len() >= self.max_pending {
            evicted = Self::eviction_victim(&inner.items);
            if let Some(addr) = evicted {
                inner.items.remove(&addr);
                inner.evicted += 1;
                warn!(header = %addr, "pending queue full, evicted oldest item");
            }
        }
        inner.items.insert(item.header_address, item);
        match evicted {
            Some(addr) => Queued::Evicted(addr),
            None => Queued::Inserted,
        }
    }

    /// Remove every item of an author, parked or not, for re-validation.
    /// Woken items get a fresh retry budget.
    pub fn take_author(&self, author: &AgentKey) -> Vec<PendingItem> {
        let mut inner = self.inner.lock();
        let keys: Vec<HeaderAddress> = inner
            .items
            .values()
            .filter(|item| item.author() == author)
            .map(|item| item.header_address)
            .collect();
        let mut taken: Vec<PendingItem> = keys
            .iter()
            .filter_map(|key| inner.items.remove(key))
            .map(|mut item| {
                item.parked = false;
                item.attempts = 0;
                item
            })
            .collect();
        taken.sort_by_key(|item| item.header.seq());
        taken
    }

    /// Remove all active items for a tick-driven retry
    pub fn take_active(&self) -> Vec<PendingItem> {
        let mut inner = self.inner.lock();
        let keys: Vec<HeaderAddress> = inner
            .items
            .values()
            .filter(|item| !item.parked)
            .map(|item| item.header_address)
            .collect();
        let mut taken: Vec<PendingItem> =
            keys.iter().filter_map(|key| inner.items.remove(key)).collect();
        taken.sort_by_key(|item| (*item.author(), item.header.seq()));
        taken
    }

    pub fn contains(&self, header: &HeaderAddress) -> bool {
        self.inner.lock().items.contains_key(header)
    }

    /// Items still being retried on ticks
    pub fn active_count(&self) -> usize {
        self.inner.lock().items.values().filter(|i| !i.parked).count()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    pub fn stats(&self) -> PendingStats {
        let inner = self.inner.lock();
        let parked = inner.items.values().filter(|i| i.parked).count();
        PendingStats {
            active: inner.items.len() - parked,
            parked,
            evicted: inner.evicted,
        }
    }

    /// Oldest parked item, else oldest active one
    fn eviction_victim(items: &HashMap<HeaderAddress, PendingItem>) -> Option<HeaderAddress> {
        items
            .values()
            .min_by_key(|item| (!item.parked, item.arrival))
            .map(|item| item.header_address)
    }
}
