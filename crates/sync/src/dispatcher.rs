//! Single consumer of the push-notification queue.
//!
//! [`NotificationDispatcher`] applies each [`Notification`] to the lock
//! registry and item cache, then lets the reconciler close editors that
//! lost their lock. Handlers are idempotent: replaying a notification, or
//! receiving one for an item the client never loaded, changes nothing.

use std::sync::Arc;

use planning_core::item::{ItemKey, ItemType};
use planning_core::locks::{Lock, LockResource, FEATURED_STORIES_ID};
use planning_core::notifications::{ItemChange, Notification};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::context::PlanningContext;
use crate::coordinator::LockCoordinator;
use crate::events::SyncEvent;
use crate::reconciler::EditReconciler;

pub struct NotificationDispatcher {
    ctx: Arc<PlanningContext>,
    coordinator: Arc<LockCoordinator>,
    reconciler: Arc<EditReconciler>,
}

impl NotificationDispatcher {
    pub fn new(
        ctx: Arc<PlanningContext>,
        coordinator: Arc<LockCoordinator>,
        reconciler: Arc<EditReconciler>,
    ) -> Self {
        Self {
            ctx,
            coordinator,
            reconciler,
        }
    }

    /// Drain `rx` until it closes or `cancel` fires.
    pub async fn run(
        &self,
        mut rx: mpsc::UnboundedReceiver<Notification>,
        cancel: CancellationToken,
    ) {
        loop {
            let notification = tokio::select! {
                _ = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(notification) => notification,
                    None => break,
                },
            };
            self.handle(notification).await;
        }
        tracing::info!("Notification dispatcher stopped");
    }

    /// Apply one notification.
    pub async fn handle(&self, notification: Notification) {
        tracing::debug!(?notification, "Dispatching notification");
        match notification {
            Notification::Created { item_type, item_id } => {
                self.ctx.emit(SyncEvent::ItemCreated { item_type, item_id });
            }
            Notification::Updated { item_type, items } => {
                for change in items {
                    self.handle_updated(item_type, change).await;
                }
            }
            Notification::Deleted { item_type, item_id } => {
                let key = ItemKey::new(item_type, item_id);
                self.ctx.with_items_mut(|cache| cache.remove(&key)).await;
                // Cached or not, a deleted item never sends an unlock frame.
                self.ctx
                    .with_locks_mut(|registry| registry.remove(item_type.into(), &key.id))
                    .await;
                self.reconciler.on_remote_delete(&key).await;
            }
            Notification::Locked {
                item_type,
                lock,
                etag,
            } => self.handle_locked(item_type, lock, etag).await,
            Notification::Unlocked {
                item_type,
                item_id,
                session,
                etag,
                ..
            } => {
                let key = ItemKey::new(item_type, item_id);
                self.ctx
                    .with_locks_mut(|registry| registry.remove(item_type.into(), &key.id))
                    .await;
                self.ctx.with_items_mut(|cache| cache.clear_lock(&key, etag)).await;
                self.ctx.emit(SyncEvent::LockReleased {
                    resource: item_type.into(),
                    item_id: key.id.clone(),
                });
                if !self.is_own_session(session.as_deref()).await {
                    self.reconciler.on_remote_unlock(&key).await;
                }
            }
            Notification::FeaturedLocked { user, session } => {
                self.ctx
                    .with_locks_mut(|registry| registry.insert(Lock::featured(user, session)))
                    .await;
            }
            Notification::FeaturedUnlocked { .. } => {
                self.ctx
                    .with_locks_mut(|registry| {
                        registry.remove(LockResource::FeaturedStories, FEATURED_STORIES_ID)
                    })
                    .await;
                self.ctx.emit(SyncEvent::LockReleased {
                    resource: LockResource::FeaturedStories,
                    item_id: FEATURED_STORIES_ID.to_string(),
                });
            }
            Notification::Reconnected => {
                if let Err(e) = self.coordinator.reload_on_reconnect().await {
                    tracing::error!(error = %e, "Lock reload after reconnect failed");
                }
            }
        }
    }

    // ---- private helpers ----

    /// Refetch a cached item whose `_etag` moved on.
    async fn handle_updated(&self, item_type: ItemType, change: ItemChange) {
        let key = ItemKey::new(item_type, change.id);
        let Some(cached) = self.ctx.cached_item(&key).await else {
            return;
        };
        if change.etag.is_some() && change.etag == cached.etag {
            tracing::trace!(item = %key, "Cached item already current");
            return;
        }

        match self.ctx.backend().get_item(item_type, &key.id).await {
            Ok(fresh) => {
                self.ctx.with_items_mut(|cache| cache.merge_payload(&fresh)).await;
                self.ctx.emit(SyncEvent::ItemRefreshed {
                    item_type,
                    item_id: key.id.clone(),
                });
            }
            Err(e) => {
                tracing::warn!(item = %key, error = %e, "Failed to refetch updated item");
            }
        }
        self.reconciler.on_remote_update(&key).await;
    }

    async fn handle_locked(&self, item_type: ItemType, lock: Lock, etag: Option<String>) {
        let key = ItemKey::new(item_type, lock.item_id.clone());
        let own = self.is_own_session(Some(&lock.session)).await;

        self.ctx
            .with_items_mut(|cache| cache.set_lock(&key, &lock, etag))
            .await;
        self.ctx.with_locks_mut(|registry| registry.insert(lock)).await;

        if !own {
            self.reconciler.on_remote_lock(&key).await;
        }
    }

    async fn is_own_session(&self, session: Option<&str>) -> bool {
        match (self.ctx.identity().await, session) {
            (Ok(identity), Some(session)) => identity.session == session,
            _ => false,
        }
    }
}
