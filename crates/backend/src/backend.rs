//! The REST collaborator contract consumed by the sync engine.

use async_trait::async_trait;
use planning_core::item::{ItemType, LockableItem};
use planning_core::locks::Lock;
use planning_core::types::Payload;

use crate::error::BackendError;

/// Request/response operations the planning server offers.
///
/// The caller's user and session are implied by the connection
/// (auth token), not passed per call.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Fetch one item.
    async fn get_item(&self, item_type: ItemType, id: &str) -> Result<LockableItem, BackendError>;

    /// Persist `updates` on top of `original`, guarded by its `_etag`.
    async fn save_item(
        &self,
        original: &LockableItem,
        updates: &Payload,
    ) -> Result<LockableItem, BackendError>;

    /// Acquire the lock on an item for `action`.
    async fn lock_item(
        &self,
        item_type: ItemType,
        id: &str,
        etag: Option<&str>,
        action: &str,
    ) -> Result<LockableItem, BackendError>;

    /// Release the lock on an item.
    async fn unlock_item(
        &self,
        item_type: ItemType,
        id: &str,
        etag: Option<&str>,
    ) -> Result<LockableItem, BackendError>;

    /// Every currently locked item of a type.
    async fn query_locked(&self, item_type: ItemType) -> Result<Vec<LockableItem>, BackendError>;

    /// The featured-stories singleton lock, if held.
    async fn get_featured_lock(&self) -> Result<Option<Lock>, BackendError>;

    async fn lock_featured(&self) -> Result<Lock, BackendError>;

    async fn unlock_featured(&self) -> Result<(), BackendError>;

    /// Every draft in `resource` owned by `user`, in server shape.
    async fn query_autosaves(&self, resource: &str, user: &str)
        -> Result<Vec<Payload>, BackendError>;

    async fn get_autosave(&self, resource: &str, id: &str) -> Result<Payload, BackendError>;

    async fn create_autosave(
        &self,
        resource: &str,
        document: &Payload,
    ) -> Result<Payload, BackendError>;

    async fn update_autosave(
        &self,
        resource: &str,
        id: &str,
        etag: &str,
        document: &Payload,
    ) -> Result<Payload, BackendError>;

    async fn delete_autosave(&self, resource: &str, id: &str, etag: &str)
        -> Result<(), BackendError>;
}
