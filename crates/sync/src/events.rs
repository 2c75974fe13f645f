//! Client-facing events emitted by the sync engine.
//!
//! Consumers (a UI shell, the daemon's log) subscribe through
//! [`PlanningContext::subscribe`](crate::context::PlanningContext::subscribe).

use planning_core::item::ItemType;
use planning_core::locks::{Lock, LockResource};
use planning_core::types::ItemId;
use serde::Serialize;

use crate::reconciler::Surface;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Why an editor surface was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Saved,
    Cancelled,
    /// The lock was released by another session.
    UnlockedElsewhere,
    /// Another session took the lock.
    LockedElsewhere,
    /// The item changed on the server and the lock is no longer ours.
    UpdatedElsewhere,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SyncEvent {
    /// This session acquired a lock.
    LockAcquired { lock: Lock },

    /// A lock was released, by this or another session.
    LockReleased {
        resource: LockResource,
        item_id: ItemId,
    },

    /// The lock registry was replaced by a bulk load.
    LocksReloaded { count: usize },

    /// A new item exists on the server.
    ItemCreated { item_type: ItemType, item_id: ItemId },

    /// A cached item was refetched after a remote change.
    ItemRefreshed { item_type: ItemType, item_id: ItemId },

    EditorClosed {
        surface: Surface,
        item_type: ItemType,
        item_id: ItemId,
        reason: CloseReason,
    },

    /// A message for the user.
    Notice { level: NoticeLevel, message: String },
}
