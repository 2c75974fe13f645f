//! Lock acquisition and release against the planning server.
//!
//! [`LockCoordinator`] is the only component that issues lock and unlock
//! requests. Every successful response is written to the lock registry and
//! to the lock fields of the cached item; every failure is surfaced as a
//! [`SyncEvent::Notice`] and returned.

use std::collections::HashSet;
use std::sync::Arc;

use planning_core::error::CoreError;
use planning_core::item::{validate_lock_action, ItemKey, ItemType, LockableItem};
use planning_core::locks::{Lock, LockResource, FEATURED_STORIES_ID};

use crate::context::PlanningContext;
use crate::error::SyncError;
use crate::events::{NoticeLevel, SyncEvent};

const LOAD_LOCKS_FAILED: &str = "Failed to load locked items";
const LOCK_FAILED: &str = "Failed to lock the item";
const UNLOCK_FAILED: &str = "Failed to unlock the item";
const ALREADY_LOCKED: &str = "The item was already locked by another session";

pub struct LockCoordinator {
    ctx: Arc<PlanningContext>,
}

impl LockCoordinator {
    pub fn new(ctx: Arc<PlanningContext>) -> Self {
        Self { ctx }
    }

    /// Replace the lock registry with the server's current locks.
    ///
    /// Locked events, locked planning items and the featured-stories lock
    /// are queried in parallel. If any query fails the registry is left
    /// untouched. Returns the number of locks loaded.
    pub async fn load_all_locks(&self) -> Result<usize, SyncError> {
        let backend = self.ctx.backend();
        let (events, planning, featured) = futures::try_join!(
            backend.query_locked(ItemType::Event),
            backend.query_locked(ItemType::Planning),
            backend.get_featured_lock(),
        )
        .map_err(|e| self.ctx.report(SyncError::from_backend(e, LOAD_LOCKS_FAILED)))?;

        let locked_items: Vec<LockableItem> = events.into_iter().chain(planning).collect();
        let locks: Vec<Lock> = locked_items
            .iter()
            .filter_map(Lock::from_item)
            .chain(featured)
            .collect();
        let count = locks.len();

        self.ctx.with_locks_mut(|registry| registry.replace_all(locks)).await;

        // Bring cached lock fields in line with the fresh registry.
        let locked_keys: HashSet<ItemKey> = locked_items.iter().map(LockableItem::key).collect();
        self.ctx
            .with_items_mut(|cache| {
                let stale: Vec<ItemKey> = cache
                    .iter()
                    .filter(|item| item.is_locked() && !locked_keys.contains(&item.key()))
                    .map(LockableItem::key)
                    .collect();
                for key in &stale {
                    cache.clear_lock(key, None);
                }
                for item in &locked_items {
                    if cache.contains(&item.key()) {
                        cache.apply_lock(item);
                    }
                }
            })
            .await;

        tracing::info!(count, "Lock registry loaded");
        self.ctx.emit(SyncEvent::LocksReloaded { count });
        Ok(count)
    }

    /// Reload every lock after the push channel reconnected, since lock
    /// notifications may have been missed while it was down.
    pub async fn reload_on_reconnect(&self) -> Result<usize, SyncError> {
        tracing::info!("Push channel reconnected, reloading locks");
        self.load_all_locks().await
    }

    /// Lock `item` for `action` in this session.
    ///
    /// Items that were never persisted are locked locally only.
    pub async fn lock(&self, item: &LockableItem, action: &str) -> Result<LockableItem, SyncError> {
        let identity = self.ctx.identity().await?;
        validate_lock_action(action).map_err(|e| self.ctx.report(CoreError::Validation(e).into()))?;

        if !item.is_persisted() {
            let mut locked = item.clone();
            locked.lock_user = Some(identity.user.clone());
            locked.lock_session = Some(identity.session.clone());
            locked.lock_action = Some(action.to_string());
            self.record_lock(&locked).await;
            return Ok(locked);
        }

        let key = item.key();
        let etag = match self.ctx.cached_etag(&key).await {
            Some(etag) => Some(etag),
            None => item.etag.clone(),
        };

        let locked = self
            .ctx
            .backend()
            .lock_item(item.item_type, &item.id, etag.as_deref(), action)
            .await
            .map_err(|e| self.ctx.report(SyncError::from_backend(e, LOCK_FAILED)))?;

        if !locked.is_locked_by(&identity.session) {
            return Err(self.ctx.report(SyncError::LockConflict {
                message: ALREADY_LOCKED.to_string(),
            }));
        }

        tracing::info!(item = %key, action, etag = ?locked.etag, "Item locked");
        self.record_lock(&locked).await;
        Ok(locked)
    }

    /// Release the lock governing `item`.
    ///
    /// The lock may be carried by another item of the chain (the event of a
    /// planning item, the planning item of an assignment, the series owner);
    /// that item is the one unlocked and returned.
    pub async fn unlock(&self, item: &LockableItem) -> Result<LockableItem, SyncError> {
        self.ctx.identity().await?;
        let key = item.key();

        if !item.is_persisted() {
            self.ctx
                .with_locks_mut(|registry| registry.remove(item.item_type.into(), &item.id))
                .await;
            self.ctx.with_items_mut(|cache| cache.clear_lock(&key, None)).await;
            self.ctx.with_drafts_mut(|drafts| drafts.remove(&key)).await;
            self.ctx.emit(SyncEvent::LockReleased {
                resource: item.item_type.into(),
                item_id: item.id.clone(),
            });
            let mut unlocked = item.clone();
            unlocked.clear_lock_fields();
            return Ok(unlocked);
        }

        let owner = match self.ctx.get_lock(item).await {
            Some(Lock {
                resource,
                item_id,
                ..
            }) => match resource.item_type() {
                Some(owner_type) => ItemKey::new(owner_type, item_id),
                None => key.clone(),
            },
            None => key.clone(),
        };
        let etag = match self.ctx.cached_etag(&owner).await {
            Some(etag) => Some(etag),
            None if owner == key => item.etag.clone(),
            None => None,
        };

        let unlocked = self
            .ctx
            .backend()
            .unlock_item(owner.item_type, &owner.id, etag.as_deref())
            .await
            .map_err(|e| self.ctx.report(SyncError::from_backend(e, UNLOCK_FAILED)))?;

        tracing::info!(item = %owner, etag = ?unlocked.etag, "Item unlocked");
        self.ctx
            .with_locks_mut(|registry| registry.remove(owner.item_type.into(), &owner.id))
            .await;
        self.ctx.with_items_mut(|cache| cache.apply_lock(&unlocked)).await;
        self.ctx.emit(SyncEvent::LockReleased {
            resource: owner.item_type.into(),
            item_id: owner.id.clone(),
        });
        Ok(unlocked)
    }

    /// Lock an assignment together with its planning item.
    pub async fn lock_and_planning(
        &self,
        assignment: &LockableItem,
        action: &str,
    ) -> Result<LockableItem, SyncError> {
        let planning = self.planning_of(assignment).await?;
        let (assignment_result, planning_result) =
            futures::join!(self.lock(assignment, action), self.lock(&planning, action));
        self.combine(assignment_result, planning_result)
    }

    /// Unlock an assignment together with its planning item.
    pub async fn unlock_and_planning(
        &self,
        assignment: &LockableItem,
    ) -> Result<LockableItem, SyncError> {
        let planning = self.planning_of(assignment).await?;
        let (assignment_result, planning_result) =
            futures::join!(self.unlock_direct(assignment), self.unlock_direct(&planning));
        self.combine(assignment_result, planning_result)
    }

    /// Take the featured-stories lock.
    pub async fn lock_featured(&self) -> Result<Lock, SyncError> {
        self.ctx.identity().await?;
        let lock = self
            .ctx
            .backend()
            .lock_featured()
            .await
            .map_err(|e| self.ctx.report(SyncError::from_backend(e, LOCK_FAILED)))?;

        self.ctx.with_locks_mut(|registry| registry.insert(lock.clone())).await;
        self.ctx.emit(SyncEvent::LockAcquired { lock: lock.clone() });
        Ok(lock)
    }

    pub async fn unlock_featured(&self) -> Result<(), SyncError> {
        self.ctx.identity().await?;
        self.ctx
            .backend()
            .unlock_featured()
            .await
            .map_err(|e| self.ctx.report(SyncError::from_backend(e, UNLOCK_FAILED)))?;

        self.ctx
            .with_locks_mut(|registry| registry.remove(LockResource::FeaturedStories, FEATURED_STORIES_ID))
            .await;
        self.ctx.emit(SyncEvent::LockReleased {
            resource: LockResource::FeaturedStories,
            item_id: FEATURED_STORIES_ID.to_string(),
        });
        Ok(())
    }

    // ---- private helpers ----

    async fn record_lock(&self, locked: &LockableItem) {
        let Some(lock) = Lock::from_item(locked) else {
            return;
        };
        self.ctx.with_locks_mut(|registry| registry.insert(lock.clone())).await;
        self.ctx.with_items_mut(|cache| cache.apply_lock(locked)).await;
        self.ctx.emit(SyncEvent::LockAcquired { lock });
    }

    /// Unlock exactly this item, without following the lock chain. The
    /// composite operations address each half explicitly.
    async fn unlock_direct(&self, item: &LockableItem) -> Result<LockableItem, SyncError> {
        let key = item.key();
        let etag = match self.ctx.cached_etag(&key).await {
            Some(etag) => Some(etag),
            None => item.etag.clone(),
        };
        let unlocked = self
            .ctx
            .backend()
            .unlock_item(item.item_type, &item.id, etag.as_deref())
            .await
            .map_err(|e| self.ctx.report(SyncError::from_backend(e, UNLOCK_FAILED)))?;

        self.ctx
            .with_locks_mut(|registry| registry.remove(item.item_type.into(), &item.id))
            .await;
        self.ctx.with_items_mut(|cache| cache.apply_lock(&unlocked)).await;
        self.ctx.emit(SyncEvent::LockReleased {
            resource: item.item_type.into(),
            item_id: item.id.clone(),
        });
        Ok(unlocked)
    }

    async fn planning_of(&self, assignment: &LockableItem) -> Result<LockableItem, SyncError> {
        let planning_id = assignment.planning_item.clone().ok_or_else(|| {
            self.ctx.report(
                CoreError::Validation(format!(
                    "Assignment {} has no planning item",
                    assignment.id
                ))
                .into(),
            )
        })?;
        let key = ItemKey::new(ItemType::Planning, planning_id.clone());
        Ok(self
            .ctx
            .cached_item(&key)
            .await
            .unwrap_or_else(|| LockableItem::new(planning_id, ItemType::Planning)))
    }

    /// Fold the two halves of a composite operation into the assignment
    /// result. A half that succeeded is kept as is.
    fn combine(
        &self,
        assignment: Result<LockableItem, SyncError>,
        planning: Result<LockableItem, SyncError>,
    ) -> Result<LockableItem, SyncError> {
        let (succeeded, failed, err) = match (assignment, planning) {
            (Ok(assignment), Ok(_)) => return Ok(assignment),
            (Err(err), Err(_)) => return Err(err),
            (Ok(_), Err(err)) => (ItemType::Assignment, ItemType::Planning, err),
            (Err(err), Ok(_)) => (ItemType::Planning, ItemType::Assignment, err),
        };
        tracing::warn!(%succeeded, %failed, error = %err, "Composite lock operation partially failed");
        let partial = SyncError::PartialCompositeFailure {
            succeeded,
            failed,
            message: err.to_string(),
        };
        self.ctx.notify(NoticeLevel::Warning, partial.to_string());
        Err(partial)
    }
}
