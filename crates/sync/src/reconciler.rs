//! Editor sessions and their reconciliation with remote changes.
//!
//! Each [`Surface`] shows at most one item. A surface moves through
//! `Closed -> Hydrating -> Editing -> (Saving -> Editing | Closed)`.
//! Every open gets a fresh generation number; a response that comes back
//! after its surface was closed or reopened finds a different generation
//! and only refreshes cached payload fields.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use planning_core::canonical::{to_editor_shape, to_server_shape};
use planning_core::error::CoreError;
use planning_core::item::{ItemKey, LockableItem};
use planning_core::types::Payload;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::autosave::{AutosaveFlusher, AutosaveStore};
use crate::context::PlanningContext;
use crate::coordinator::LockCoordinator;
use crate::error::SyncError;
use crate::events::{CloseReason, SyncEvent};

const SAVE_FAILED: &str = "Failed to save the item";

/// An independent editing area of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Surface {
    Inline,
    Popup,
}

impl Surface {
    pub const ALL: [Surface; 2] = [Surface::Inline, Surface::Popup];
}

impl fmt::Display for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Surface::Inline => f.write_str("inline"),
            Surface::Popup => f.write_str("popup"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EditorState {
    #[default]
    Closed,
    Hydrating,
    Editing,
    Saving,
}

/// Where the editor's current diff came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffSource {
    Server,
    Autosave,
}

/// What happens to the lock and the surface after a save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveFlow {
    /// Keep the lock and keep editing from the saved state.
    Continue,
    /// Release the lock and close the surface.
    Close,
    /// Close the surface but keep the lock for a follow-up action.
    HandOff,
}

/// One item open in one surface.
#[derive(Debug, Clone, PartialEq)]
pub struct EditorSession {
    /// Server-confirmed item, lock fields included.
    pub item: LockableItem,
    pub action: String,
    /// Payload of `item` in editor shape.
    pub initial_values: Payload,
    /// The edit in progress.
    pub diff: Payload,
    pub source: DiffSource,
    pub generation: u64,
}

impl EditorSession {
    pub fn key(&self) -> ItemKey {
        self.item.key()
    }

    pub fn is_dirty(&self) -> bool {
        self.diff != self.initial_values
    }
}

#[derive(Default)]
struct Slot {
    state: EditorState,
    generation: u64,
    /// Item being hydrated, set once its lock is held.
    opening: Option<LockableItem>,
    session: Option<EditorSession>,
}

#[derive(Default)]
struct Slots {
    inline: Slot,
    popup: Slot,
}

impl Slots {
    fn get(&self, surface: Surface) -> &Slot {
        match surface {
            Surface::Inline => &self.inline,
            Surface::Popup => &self.popup,
        }
    }

    fn get_mut(&mut self, surface: Surface) -> &mut Slot {
        match surface {
            Surface::Inline => &mut self.inline,
            Surface::Popup => &mut self.popup,
        }
    }
}

pub struct EditReconciler {
    ctx: Arc<PlanningContext>,
    coordinator: Arc<LockCoordinator>,
    autosaves: Arc<AutosaveStore>,
    inline_flusher: AutosaveFlusher,
    popup_flusher: AutosaveFlusher,
    slots: Mutex<Slots>,
    generations: AtomicU64,
}

impl EditReconciler {
    pub fn new(
        ctx: Arc<PlanningContext>,
        coordinator: Arc<LockCoordinator>,
        autosaves: Arc<AutosaveStore>,
        autosave_debounce: Duration,
    ) -> Self {
        Self {
            inline_flusher: AutosaveFlusher::new(Arc::clone(&autosaves), autosave_debounce),
            popup_flusher: AutosaveFlusher::new(Arc::clone(&autosaves), autosave_debounce),
            ctx,
            coordinator,
            autosaves,
            slots: Mutex::new(Slots::default()),
            generations: AtomicU64::new(0),
        }
    }

    pub async fn state(&self, surface: Surface) -> EditorState {
        self.slots.lock().await.get(surface).state
    }

    pub async fn session(&self, surface: Surface) -> Option<EditorSession> {
        self.slots.lock().await.get(surface).session.clone()
    }

    /// The autosave writer of a surface.
    pub fn flusher(&self, surface: Surface) -> &AutosaveFlusher {
        match surface {
            Surface::Inline => &self.inline_flusher,
            Surface::Popup => &self.popup_flusher,
        }
    }

    // -----------------------------------------------------------------------
    // Local lifecycle
    // -----------------------------------------------------------------------

    /// Open `item` for `action` in `surface`.
    ///
    /// Locks the item unless this session already holds its lock, then
    /// hydrates the editor from the locked item and this session's autosave
    /// draft, if one exists.
    pub async fn open(
        &self,
        surface: Surface,
        item: &LockableItem,
        action: &str,
    ) -> Result<EditorSession, SyncError> {
        let identity = self.ctx.identity().await?;
        let key = item.key();

        let generation = {
            let mut slots = self.slots.lock().await;
            let slot = slots.get_mut(surface);
            if let Some(session) = &slot.session {
                if session.key() == key {
                    return Ok(session.clone());
                }
                return Err(CoreError::Validation(format!(
                    "The {surface} editor is already editing {}",
                    session.key()
                ))
                .into());
            }
            if slot.state != EditorState::Closed {
                return Err(
                    CoreError::Validation(format!("The {surface} editor is busy")).into(),
                );
            }
            let generation = self.next_generation();
            slot.state = EditorState::Hydrating;
            slot.generation = generation;
            generation
        };

        let (base, took_lock) = if self.ctx.is_locked_in_session(item).await {
            let cached = self.ctx.cached_item(&key).await;
            (cached.unwrap_or_else(|| item.clone()), false)
        } else {
            match self.coordinator.lock(item, action).await {
                Ok(locked) => (locked, true),
                Err(e) => {
                    self.take_slot(surface, generation).await;
                    return Err(e);
                }
            }
        };

        {
            let mut slots = self.slots.lock().await;
            let slot = slots.get_mut(surface);
            if slot.generation == generation {
                slot.opening = Some(base.clone());
            }
        }

        let mut session = match self.hydrate(base, action, &identity.session).await {
            Ok(session) => session,
            Err(e) => {
                self.take_slot(surface, generation).await;
                if took_lock {
                    if let Err(unlock_err) = self.coordinator.unlock(item).await {
                        tracing::warn!(item = %key, error = %unlock_err, "Failed to release lock after hydration error");
                    }
                }
                return Err(e);
            }
        };
        session.generation = generation;

        // An unlock handled after this check finds the slot through
        // `opening` and closes it.
        let still_locked = self.ctx.is_locked_in_session(&session.item).await;
        {
            let mut slots = self.slots.lock().await;
            let slot = slots.get_mut(surface);
            if slot.generation == generation && slot.state == EditorState::Hydrating {
                if still_locked {
                    slot.state = EditorState::Editing;
                    slot.opening = None;
                    slot.session = Some(session.clone());
                    tracing::info!(%surface, item = %key, source = ?session.source, "Editor opened");
                    return Ok(session);
                }
                self.close_slot(slot, generation);
            }
        }

        if !still_locked {
            tracing::info!(%surface, item = %key, "Lock released elsewhere while opening");
            return Err(self.ctx.report(SyncError::LockConflict {
                message: format!("The lock on {key} was released by another session"),
            }));
        }

        tracing::info!(%surface, item = %key, "Editor closed while opening");
        if took_lock {
            if let Err(e) = self.coordinator.unlock(&session.item).await {
                tracing::warn!(item = %key, error = %e, "Failed to release lock of abandoned open");
            }
        }
        Err(CoreError::Conflict(format!("The {surface} editor was closed while opening {key}")).into())
    }

    /// Merge `changes` into the diff and schedule an autosave.
    pub async fn update(&self, surface: Surface, changes: Payload) -> Result<(), SyncError> {
        let (item, diff) = {
            let mut slots = self.slots.lock().await;
            let slot = slots.get_mut(surface);
            match (slot.state, slot.session.as_mut()) {
                (EditorState::Editing, Some(session)) => {
                    session.diff.extend(changes);
                    (session.item.clone(), session.diff.clone())
                }
                _ => {
                    return Err(CoreError::Validation(format!(
                        "The {surface} editor is not editing"
                    ))
                    .into())
                }
            }
        };

        if item.item_type.autosave_resource().is_some() {
            self.flusher(surface).schedule(item, diff).await;
        }
        Ok(())
    }

    /// Save the edit of `surface`, then continue, close or hand off
    /// according to `flow`.
    pub async fn save(&self, surface: Surface, flow: SaveFlow) -> Result<LockableItem, SyncError> {
        let (session, generation) = {
            let mut slots = self.slots.lock().await;
            let slot = slots.get_mut(surface);
            match (slot.state, &slot.session) {
                (EditorState::Editing, Some(session)) => {
                    let session = session.clone();
                    slot.state = EditorState::Saving;
                    (session, slot.generation)
                }
                _ => {
                    return Err(CoreError::Validation(format!(
                        "The {surface} editor has nothing to save"
                    ))
                    .into())
                }
            }
        };
        let key = session.key();

        self.flusher(surface).cancel().await;

        let saved = match self.persist(&session).await {
            Ok(saved) => saved,
            Err(e) => {
                let mut slots = self.slots.lock().await;
                let slot = slots.get_mut(surface);
                if slot.generation == generation && slot.state == EditorState::Saving {
                    slot.state = EditorState::Editing;
                }
                return Err(e);
            }
        };
        self.ctx.with_items_mut(|cache| cache.merge_payload(&saved)).await;

        {
            let slots = self.slots.lock().await;
            let slot = slots.get(surface);
            if slot.generation != generation || slot.state != EditorState::Saving {
                tracing::info!(%surface, item = %key, "Editor closed during save, cache refreshed only");
                return Ok(saved);
            }
        }

        if let Err(e) = self.autosaves.remove_by_id(key.item_type, &key.id).await {
            tracing::warn!(item = %key, error = %e, "Failed to delete autosave after save");
        }

        match flow {
            SaveFlow::Continue => {
                let initial_values = to_editor_shape(saved.item_type, &saved.fields)
                    .unwrap_or_else(|e| {
                        tracing::warn!(item = %key, error = %e, "Keeping local values after save");
                        session.diff.clone()
                    });
                let mut slots = self.slots.lock().await;
                let slot = slots.get_mut(surface);
                if slot.generation == generation {
                    if let Some(current) = slot.session.as_mut() {
                        current.item.merge_payload(&saved);
                        current.initial_values = initial_values.clone();
                        current.diff = initial_values;
                        current.source = DiffSource::Server;
                        slot.state = EditorState::Editing;
                    }
                }
                Ok(saved)
            }
            SaveFlow::Close => {
                self.take_slot(surface, generation).await;
                self.emit_closed(surface, &key, CloseReason::Saved);
                let unlocked = self.coordinator.unlock(&saved).await?;
                Ok(if unlocked.key() == key { unlocked } else { saved })
            }
            SaveFlow::HandOff => {
                self.take_slot(surface, generation).await;
                self.emit_closed(surface, &key, CloseReason::Saved);
                Ok(saved)
            }
        }
    }

    /// Abandon the edit of `surface`: release the lock, delete the autosave
    /// and close.
    pub async fn cancel(&self, surface: Surface) -> Result<(), SyncError> {
        let session = {
            let mut slots = self.slots.lock().await;
            let generation = slots.get(surface).generation;
            self.close_slot(slots.get_mut(surface), generation)
        };
        self.flusher(surface).cancel().await;

        let Some(session) = session else {
            return Ok(());
        };
        let key = session.key();

        let released = if self.ctx.is_locked_in_session(&session.item).await {
            self.coordinator.unlock(&session.item).await.map(|_| ())
        } else {
            Ok(())
        };
        if let Err(e) = self.autosaves.remove_by_id(key.item_type, &key.id).await {
            tracing::warn!(item = %key, error = %e, "Failed to delete autosave on cancel");
        }

        self.emit_closed(surface, &key, CloseReason::Cancelled);
        released
    }

    // -----------------------------------------------------------------------
    // Remote invalidation
    // -----------------------------------------------------------------------

    /// Another session released a lock.
    pub async fn on_remote_unlock(&self, key: &ItemKey) {
        self.close_unlocked(key, CloseReason::UnlockedElsewhere).await;
    }

    /// Another session took a lock.
    pub async fn on_remote_lock(&self, key: &ItemKey) {
        self.close_unlocked(key, CloseReason::LockedElsewhere).await;
    }

    /// An item changed on the server. Editors keep going while this
    /// session still holds the lock.
    pub async fn on_remote_update(&self, key: &ItemKey) {
        self.close_unlocked(key, CloseReason::UpdatedElsewhere).await;
    }

    /// An item was deleted on the server.
    pub async fn on_remote_delete(&self, key: &ItemKey) {
        for (surface, generation, item) in self.open_items().await {
            if item.key() == *key {
                self.discard(surface, generation, CloseReason::Deleted).await;
            }
        }
    }

    // ---- private helpers ----

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn hydrate(
        &self,
        base: LockableItem,
        action: &str,
        session_id: &str,
    ) -> Result<EditorSession, SyncError> {
        let initial_values = to_editor_shape(base.item_type, &base.fields)?;

        let draft = match self.autosaves.fetch_by_id(base.item_type, &base.id).await {
            Ok(draft) => draft,
            Err(e) => {
                tracing::warn!(item = %base.key(), error = %e, "Opening without autosave");
                None
            }
        };

        let (diff, source) = match draft {
            Some(draft) if draft.is_owned_by(session_id) => {
                let mut diff = initial_values.clone();
                diff.extend(draft.payload);
                (diff, DiffSource::Autosave)
            }
            _ => (initial_values.clone(), DiffSource::Server),
        };

        Ok(EditorSession {
            item: base,
            action: action.to_string(),
            initial_values,
            diff,
            source,
            generation: 0,
        })
    }

    async fn persist(&self, session: &EditorSession) -> Result<LockableItem, SyncError> {
        let key = session.key();
        let mut original = session.item.clone();
        if let Some(etag) = self.ctx.cached_etag(&key).await {
            original.etag = Some(etag);
        }
        let updates = to_server_shape(key.item_type, &session.diff)?;

        let saved = self
            .ctx
            .backend()
            .save_item(&original, &updates)
            .await
            .map_err(|e| self.ctx.report(SyncError::from_backend(e, SAVE_FAILED)))?;
        tracing::info!(item = %key, etag = ?saved.etag, "Item saved");
        Ok(saved)
    }

    /// Snapshot of the items currently open or being hydrated, with their
    /// generations.
    async fn open_items(&self) -> Vec<(Surface, u64, LockableItem)> {
        let slots = self.slots.lock().await;
        Surface::ALL
            .into_iter()
            .filter_map(|surface| {
                let slot = slots.get(surface);
                slot.session
                    .as_ref()
                    .map(|session| session.item.clone())
                    .or_else(|| slot.opening.clone())
                    .map(|item| (surface, slot.generation, item))
            })
            .collect()
    }

    /// Close every surface whose item this session no longer holds the lock
    /// for. `key` names the item the triggering notification was about; a
    /// chained item (a planning item under an event lock) can lose its lock
    /// through it too.
    async fn close_unlocked(&self, key: &ItemKey, reason: CloseReason) {
        for (surface, generation, item) in self.open_items().await {
            if self.ctx.is_locked_in_session(&item).await {
                continue;
            }
            if item.key() != *key {
                tracing::debug!(%surface, item = %item.key(), trigger = %key, "Lock lost through item chain");
            }
            self.discard(surface, generation, reason).await;
        }
    }

    /// Close a surface without saving or autosaving its diff. The lock and
    /// any stored draft are left alone.
    async fn discard(&self, surface: Surface, generation: u64, reason: CloseReason) {
        let Some(session) = self.take_slot(surface, generation).await else {
            return;
        };
        self.flusher(surface).cancel().await;
        tracing::info!(%surface, item = %session.key(), ?reason, "Editor discarded");
        self.emit_closed(surface, &session.key(), reason);
    }

    /// Close `surface` if it is still at `generation`.
    async fn take_slot(&self, surface: Surface, generation: u64) -> Option<EditorSession> {
        let mut slots = self.slots.lock().await;
        self.close_slot(slots.get_mut(surface), generation)
    }

    fn close_slot(&self, slot: &mut Slot, generation: u64) -> Option<EditorSession> {
        if slot.generation != generation {
            return None;
        }
        slot.state = EditorState::Closed;
        slot.generation = self.next_generation();
        slot.opening = None;
        slot.session.take()
    }

    fn emit_closed(&self, surface: Surface, key: &ItemKey, reason: CloseReason) {
        self.ctx.emit(SyncEvent::EditorClosed {
            surface,
            item_type: key.item_type,
            item_id: key.id.clone(),
            reason,
        });
    }
}
