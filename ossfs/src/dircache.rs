//! Listing cache keyed by normalized directory path.
//!
//! Entries never expire; they are dropped only by explicit invalidation.
//! Each value is one complete listing of a directory's immediate children.
//! A fill that started before an invalidation is discarded on insert, so a
//! listing fetched before a mutation can never be cached after it.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ossfs_common::entry::EntryInfo;
use ossfs_common::path;

/// Proof of when a listing fetch began.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillTicket(u64);

#[derive(Default)]
struct CacheState {
    listings: HashMap<String, Arc<Vec<EntryInfo>>>,
    /// Bumped by every invalidation.
    epoch: u64,
}

#[derive(Default)]
pub struct DirCache {
    state: RwLock<CacheState>,
}

impl DirCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a ticket before querying the backend for a listing.
    pub fn begin_fill(&self) -> FillTicket {
        FillTicket(self.read().epoch)
    }

    pub fn get(&self, dir: &str) -> Option<Arc<Vec<EntryInfo>>> {
        self.read().listings.get(&path::normalize(dir)).cloned()
    }

    pub fn contains(&self, dir: &str) -> bool {
        self.read().listings.contains_key(&path::normalize(dir))
    }

    /// Store a complete listing. Returns false (and stores nothing) when an
    /// invalidation happened after `ticket` was taken.
    pub fn insert(&self, dir: &str, entries: Vec<EntryInfo>, ticket: FillTicket) -> bool {
        let mut state = self.write();
        if state.epoch != ticket.0 {
            return false;
        }
        state.listings.insert(path::normalize(dir), Arc::new(entries));
        true
    }

    /// Drop the listing of `target`, of all its ancestors, and of everything
    /// beneath it.
    pub fn invalidate(&self, target: &str) {
        let target = path::normalize(target);
        let mut state = self.write();
        state.epoch += 1;
        if target == path::ROOT {
            state.listings.clear();
            return;
        }
        let ancestors = path::ancestors(&target);
        state
            .listings
            .retain(|dir, _| !path::is_within(dir, &target) && !ancestors.contains(dir));
    }

    pub fn clear(&self) {
        let mut state = self.write();
        state.epoch += 1;
        state.listings.clear();
    }

    pub fn len(&self) -> usize {
        self.read().listings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
