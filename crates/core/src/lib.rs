//! Domain model for collaborative item locking and autosave.
//!
//! This crate has no I/O: it holds the item and lock types, the lock
//! registry, the item cache, the push-notification protocol and the
//! payload shape translation shared by the backend client and the sync
//! engine.

pub mod canonical;
pub mod draft;
pub mod error;
pub mod item;
pub mod item_cache;
pub mod locks;
pub mod notifications;
pub mod types;
