//! Autosave drafts: local map plus server persistence.
//!
//! [`AutosaveStore`] keeps the drafts of the current user in the planning
//! context and mirrors them to the `<type>_autosave` resources. Drafts are
//! held in editor shape locally and written in server shape.
//!
//! [`AutosaveFlusher`] debounces writes for one editor surface.

use std::sync::Arc;
use std::time::Duration;

use planning_core::draft::AutosaveDraft;
use planning_core::error::CoreError;
use planning_core::item::{ItemKey, ItemType, LockableItem};
use planning_core::types::Payload;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::PlanningContext;
use crate::error::SyncError;

const FETCH_FAILED: &str = "Failed to load autosaved drafts";
const SAVE_FAILED: &str = "Failed to save the autosave";
const DELETE_FAILED: &str = "Failed to delete the autosave";

pub struct AutosaveStore {
    ctx: Arc<PlanningContext>,
}

impl AutosaveStore {
    pub fn new(ctx: Arc<PlanningContext>) -> Self {
        Self { ctx }
    }

    /// Load every draft of `item_type` owned by the current user and replace
    /// the local drafts of that type with them.
    pub async fn fetch(&self, item_type: ItemType) -> Result<Vec<AutosaveDraft>, SyncError> {
        let Some(resource) = item_type.autosave_resource() else {
            return Ok(Vec::new());
        };
        let identity = self.ctx.identity().await?;

        let documents = self
            .ctx
            .backend()
            .query_autosaves(resource, &identity.user)
            .await
            .map_err(|e| self.ctx.report(SyncError::from_backend(e, FETCH_FAILED)))?;

        let drafts: Vec<AutosaveDraft> = documents
            .iter()
            .filter_map(|doc| match AutosaveDraft::from_document(item_type, doc) {
                Ok(draft) => Some(draft),
                Err(e) => {
                    tracing::warn!(resource, error = %e, "Skipping malformed autosave");
                    None
                }
            })
            .collect();

        self.ctx
            .with_drafts_mut(|map| {
                map.retain(|key, _| key.item_type != item_type);
                for draft in &drafts {
                    map.insert(ItemKey::new(item_type, draft.item_id.clone()), draft.clone());
                }
            })
            .await;

        tracing::debug!(resource, count = drafts.len(), "Autosaves fetched");
        Ok(drafts)
    }

    /// The draft of one item: local copy first, otherwise a single server
    /// lookup. A missing draft is `None`, not an error.
    pub async fn fetch_by_id(
        &self,
        item_type: ItemType,
        item_id: &str,
    ) -> Result<Option<AutosaveDraft>, SyncError> {
        let key = ItemKey::new(item_type, item_id);
        if let Some(draft) = self.ctx.draft(&key).await {
            return Ok(Some(draft));
        }
        let Some(resource) = item_type.autosave_resource() else {
            return Ok(None);
        };
        self.ctx.identity().await?;

        let document = match self.ctx.backend().get_autosave(resource, item_id).await {
            Ok(document) => document,
            Err(e) if e.is_not_found() => {
                tracing::debug!(item = %key, "No autosave on the server");
                return Ok(None);
            }
            Err(e) => return Err(self.ctx.report(SyncError::from_backend(e, FETCH_FAILED))),
        };

        let draft = AutosaveDraft::from_document(item_type, &document)?;
        self.ctx
            .with_drafts_mut(|map| map.insert(key, draft.clone()))
            .await;
        Ok(Some(draft))
    }

    /// Persist the in-progress edit of `original`.
    ///
    /// `updates` (editor shape) is laid over this session's existing draft.
    /// The first save creates the server document; later saves replace it
    /// under the stored `_etag`, even when another session wrote it.
    pub async fn save(
        &self,
        original: &LockableItem,
        updates: &Payload,
    ) -> Result<AutosaveDraft, SyncError> {
        let item_type = original.item_type;
        let resource = item_type.autosave_resource().ok_or_else(|| {
            CoreError::Validation(format!("{} items have no autosave", item_type.entity_name()))
        })?;
        let identity = self.ctx.identity().await?;
        let key = original.key();

        // A draft of another session of this user only lends its `_etag`.
        let existing = self.ctx.draft(&key).await;
        let mut payload = match &existing {
            Some(draft) if draft.is_owned_by(&identity.session) => draft.payload.clone(),
            _ => Payload::new(),
        };
        payload.extend(updates.clone());

        let draft = AutosaveDraft::new(
            item_type,
            original.id.clone(),
            payload,
            Some(identity.user),
            Some(identity.session),
        );
        let document = draft.to_document()?;

        let backend = self.ctx.backend();
        let stored = match existing.and_then(|draft| draft.etag) {
            None => backend.create_autosave(resource, &document).await,
            Some(etag) => {
                backend
                    .update_autosave(resource, &original.id, &etag, &document)
                    .await
            }
        }
        .map_err(|e| self.ctx.report(SyncError::from_backend(e, SAVE_FAILED)))?;

        let saved = AutosaveDraft::from_document(item_type, &stored)?;
        tracing::debug!(item = %key, etag = ?saved.etag, "Autosave stored");
        self.ctx
            .with_drafts_mut(|map| map.insert(key, saved.clone()))
            .await;
        Ok(saved)
    }

    /// Delete a draft locally, and on the server when it was ever stored
    /// there.
    pub async fn remove(&self, draft: &AutosaveDraft) -> Result<(), SyncError> {
        let key = ItemKey::new(draft.item_type, draft.item_id.clone());
        self.ctx.with_drafts_mut(|map| map.remove(&key)).await;

        let (Some(etag), Some(resource)) = (&draft.etag, draft.item_type.autosave_resource())
        else {
            return Ok(());
        };
        match self
            .ctx
            .backend()
            .delete_autosave(resource, &draft.item_id, etag)
            .await
        {
            Ok(()) => {
                tracing::debug!(item = %key, "Autosave deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                tracing::debug!(item = %key, "Autosave already gone");
                Ok(())
            }
            Err(e) => Err(self.ctx.report(SyncError::from_backend(e, DELETE_FAILED))),
        }
    }

    /// Delete the draft of an item, wherever it lives.
    pub async fn remove_by_id(&self, item_type: ItemType, item_id: &str) -> Result<(), SyncError> {
        match self.fetch_by_id(item_type, item_id).await? {
            Some(draft) => self.remove(&draft).await,
            None => {
                self.discard_local(item_type, item_id).await;
                Ok(())
            }
        }
    }

    /// Drop the local draft without touching the server.
    pub async fn discard_local(&self, item_type: ItemType, item_id: &str) {
        let key = ItemKey::new(item_type, item_id);
        self.ctx.with_drafts_mut(|map| map.remove(&key)).await;
    }
}

// ---------------------------------------------------------------------------
// Debounced flushing
// ---------------------------------------------------------------------------

struct PendingFlush {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Debounced autosave writer for one editor surface.
///
/// Every [`schedule`](Self::schedule) supersedes the previous one. A flush
/// that already reached the server is waited for, never raced.
pub struct AutosaveFlusher {
    store: Arc<AutosaveStore>,
    debounce: Duration,
    pending: Mutex<Option<PendingFlush>>,
}

impl AutosaveFlusher {
    pub fn new(store: Arc<AutosaveStore>, debounce: Duration) -> Self {
        Self {
            store,
            debounce,
            pending: Mutex::new(None),
        }
    }

    /// Write `diff` as the draft of `item` once no newer edit arrives within
    /// the debounce window.
    pub async fn schedule(&self, item: LockableItem, diff: Payload) {
        let mut pending = self.pending.lock().await;
        let previous = pending.take().map(|prev| {
            prev.cancel.cancel();
            prev.handle
        });

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let store = Arc::clone(&self.store);
        let debounce = self.debounce;

        let handle = tokio::spawn(async move {
            let superseded = tokio::select! {
                _ = token.cancelled() => true,
                _ = tokio::time::sleep(debounce) => false,
            };
            // Writes for one surface go out in order.
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            if superseded {
                return;
            }
            if let Err(e) = store.save(&item, &diff).await {
                tracing::warn!(item_id = %item.id, error = %e, "Autosave flush failed");
            }
        });

        *pending = Some(PendingFlush { cancel, handle });
    }

    /// Drop the pending flush and wait for one already in flight.
    pub async fn cancel(&self) {
        let Some(pending) = self.pending.lock().await.take() else {
            return;
        };
        pending.cancel.cancel();
        let _ = pending.handle.await;
    }

    /// Wait until the pending flush, if any, has been written.
    pub async fn flush(&self) {
        let Some(pending) = self.pending.lock().await.take() else {
            return;
        };
        let _ = pending.handle.await;
    }
}
