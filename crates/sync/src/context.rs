//! Shared client state of one planning session.
//!
//! [`PlanningContext`] owns the lock registry, the item cache and the local
//! autosave map, and is handed to every component as an `Arc`. State is only
//! reachable through closures so no guard can be held across an `.await`.

use std::collections::HashMap;
use std::sync::Arc;

use planning_backend::Backend;
use planning_core::draft::AutosaveDraft;
use planning_core::item::{ItemKey, LockableItem};
use planning_core::item_cache::ItemCache;
use planning_core::locks::{Lock, LockRegistry};
use planning_core::types::{Etag, SessionIdentity};
use tokio::sync::{broadcast, RwLock};

use crate::error::SyncError;
use crate::events::{NoticeLevel, SyncEvent};

/// Broadcast channel capacity for client events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct PlanningContext {
    backend: Arc<dyn Backend>,
    identity: RwLock<Option<SessionIdentity>>,
    locks: RwLock<LockRegistry>,
    items: RwLock<ItemCache>,
    drafts: RwLock<HashMap<ItemKey, AutosaveDraft>>,
    event_tx: broadcast::Sender<SyncEvent>,
}

impl PlanningContext {
    /// An uninitialized context. Call [`init`](Self::init) before use.
    pub fn new(backend: Arc<dyn Backend>) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            backend,
            identity: RwLock::new(None),
            locks: RwLock::new(LockRegistry::new()),
            items: RwLock::new(ItemCache::new()),
            drafts: RwLock::new(HashMap::new()),
            event_tx,
        })
    }

    /// Bind the context to a user session, starting from empty state.
    pub async fn init(&self, identity: SessionIdentity) {
        tracing::info!(user = %identity.user, session = %identity.session, "Planning context initialized");
        self.clear_state().await;
        *self.identity.write().await = Some(identity);
    }

    /// Drop the session binding and all cached state.
    pub async fn reset(&self) {
        *self.identity.write().await = None;
        self.clear_state().await;
        tracing::info!("Planning context reset");
    }

    async fn clear_state(&self) {
        self.locks.write().await.clear();
        self.items.write().await.clear();
        self.drafts.write().await.clear();
    }

    pub async fn identity(&self) -> Result<SessionIdentity, SyncError> {
        self.identity
            .read()
            .await
            .clone()
            .ok_or(SyncError::NotInitialized)
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    // ---- events ----

    /// Subscribe to client events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }

    pub fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    pub fn notify(&self, level: NoticeLevel, message: impl Into<String>) {
        self.emit(SyncEvent::Notice {
            level,
            message: message.into(),
        });
    }

    /// Surface an error to the user and hand it back for propagation.
    pub fn report(&self, err: SyncError) -> SyncError {
        tracing::warn!(error = %err, "Sync operation failed");
        self.notify(NoticeLevel::Error, err.to_string());
        err
    }

    // ---- lock registry ----

    pub async fn with_locks<R>(&self, f: impl FnOnce(&LockRegistry) -> R) -> R {
        f(&*self.locks.read().await)
    }

    pub async fn with_locks_mut<R>(&self, f: impl FnOnce(&mut LockRegistry) -> R) -> R {
        f(&mut *self.locks.write().await)
    }

    /// The lock governing `item`, if any.
    pub async fn get_lock(&self, item: &LockableItem) -> Option<Lock> {
        self.with_locks(|registry| registry.get_lock(item).cloned()).await
    }

    /// `true` iff the lock governing `item` belongs to this session.
    pub async fn is_locked_in_session(&self, item: &LockableItem) -> bool {
        let Ok(identity) = self.identity().await else {
            return false;
        };
        self.with_locks(|registry| registry.is_locked_in_session(item, &identity.session))
            .await
    }

    // ---- item cache ----

    pub async fn with_items<R>(&self, f: impl FnOnce(&ItemCache) -> R) -> R {
        f(&*self.items.read().await)
    }

    pub async fn with_items_mut<R>(&self, f: impl FnOnce(&mut ItemCache) -> R) -> R {
        f(&mut *self.items.write().await)
    }

    pub async fn cached_item(&self, key: &ItemKey) -> Option<LockableItem> {
        self.with_items(|cache| cache.get(key).cloned()).await
    }

    pub async fn cached_etag(&self, key: &ItemKey) -> Option<Etag> {
        self.with_items(|cache| cache.etag(key).cloned()).await
    }

    /// Cache an item read from the server.
    pub async fn cache_item(&self, item: LockableItem) {
        self.with_items_mut(|cache| cache.insert(item)).await;
    }

    // ---- autosave drafts ----

    pub async fn draft(&self, key: &ItemKey) -> Option<AutosaveDraft> {
        self.drafts.read().await.get(key).cloned()
    }

    pub async fn with_drafts_mut<R>(
        &self,
        f: impl FnOnce(&mut HashMap<ItemKey, AutosaveDraft>) -> R,
    ) -> R {
        f(&mut *self.drafts.write().await)
    }
}
