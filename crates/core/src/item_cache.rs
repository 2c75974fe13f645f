//! Local cache of items the client has loaded.
//!
//! Each inbound channel owns a distinct set of fields: lock responses and
//! lock notifications write lock fields, save responses and update
//! notifications write payload fields, and list operations add or drop
//! whole entries. The cache never lets one channel overwrite another
//! channel's fields.

use std::collections::HashMap;

use crate::item::{ItemKey, LockableItem};
use crate::locks::Lock;
use crate::types::Etag;

#[derive(Debug, Clone, Default)]
pub struct ItemCache {
    items: HashMap<ItemKey, LockableItem>,
}

impl ItemCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ItemKey) -> Option<&LockableItem> {
        self.items.get(key)
    }

    pub fn contains(&self, key: &ItemKey) -> bool {
        self.items.contains_key(key)
    }

    pub fn etag(&self, key: &ItemKey) -> Option<&Etag> {
        self.items.get(key).and_then(|item| item.etag.as_ref())
    }

    /// Insert an item read from the server, replacing any cached copy.
    pub fn insert(&mut self, item: LockableItem) {
        self.items.insert(item.key(), item);
    }

    /// Drop an item from the cache.
    pub fn remove(&mut self, key: &ItemKey) -> Option<LockableItem> {
        self.items.remove(key)
    }

    /// Write the lock fields of `source` onto the cached copy, inserting
    /// `source` when the item is not cached yet.
    pub fn apply_lock(&mut self, source: &LockableItem) {
        match self.items.get_mut(&source.key()) {
            Some(cached) => cached.apply_lock_fields(source),
            None => self.insert(source.clone()),
        }
    }

    /// Write a lock learned from a notification onto a cached item. Returns
    /// `false` if the item is not cached; notifications carry no payload, so
    /// nothing is inserted in that case.
    pub fn set_lock(&mut self, key: &ItemKey, lock: &Lock, etag: Option<Etag>) -> bool {
        let Some(cached) = self.items.get_mut(key) else {
            return false;
        };
        cached.lock_user = Some(lock.user.clone());
        cached.lock_session = Some(lock.session.clone());
        cached.lock_action = lock.action.clone();
        cached.lock_time = lock.time;
        if etag.is_some() {
            cached.etag = etag;
        }
        true
    }

    /// Clear the lock fields of a cached item. Returns `false` if the item
    /// is not cached.
    pub fn clear_lock(&mut self, key: &ItemKey, etag: Option<Etag>) -> bool {
        match self.items.get_mut(key) {
            Some(cached) => {
                cached.clear_lock_fields();
                if etag.is_some() {
                    cached.etag = etag;
                }
                true
            }
            None => false,
        }
    }

    /// Write the payload fields of `source` onto the cached copy. Returns
    /// `false` if the item is not cached; nothing is inserted in that case.
    pub fn merge_payload(&mut self, source: &LockableItem) -> bool {
        match self.items.get_mut(&source.key()) {
            Some(cached) => {
                cached.merge_payload(source);
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &LockableItem> {
        self.items.values()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}
