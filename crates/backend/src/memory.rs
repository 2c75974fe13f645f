//! In-memory planning server for tests.
//!
//! [`MemoryServer`] keeps items, locks and autosave documents in memory and
//! enforces the same rules as the real server: `_etag` checks on writes,
//! lock ownership by session, and autosave partitioning by user. Each
//! [`MemoryBackend`] is one client session connected to the shared server.
//! Every call is logged so tests can assert on network traffic, and every
//! lock change is recorded as a push frame that tests can feed to another
//! session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use planning_core::item::{ItemKey, ItemType, LockableItem};
use planning_core::locks::Lock;
use planning_core::types::{Payload, SessionIdentity};
use serde_json::{json, Value};

use crate::backend::Backend;
use crate::error::BackendError;

/// One logged backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: &'static str,
    pub target: String,
    pub etag: Option<String>,
}

#[derive(Default)]
struct ServerState {
    items: HashMap<ItemKey, LockableItem>,
    autosaves: HashMap<(String, String), Payload>,
    featured: Option<Lock>,
    calls: Vec<Call>,
    failures: HashMap<&'static str, (u16, String)>,
    pushed: Vec<String>,
}

/// Shared in-memory server.
#[derive(Default)]
pub struct MemoryServer {
    state: Mutex<ServerState>,
}

impl MemoryServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A client session connected to this server.
    pub fn connect(self: &Arc<Self>, identity: SessionIdentity) -> MemoryBackend {
        MemoryBackend {
            server: Arc::clone(self),
            identity,
        }
    }

    /// Store an item as if it had been created earlier.
    pub fn seed(&self, item: LockableItem) {
        self.state().items.insert(item.key(), item);
    }

    pub fn item(&self, item_type: ItemType, id: &str) -> Option<LockableItem> {
        self.state().items.get(&ItemKey::new(item_type, id)).cloned()
    }

    pub fn autosave(&self, resource: &str, id: &str) -> Option<Payload> {
        self.state()
            .autosaves
            .get(&(resource.to_string(), id.to_string()))
            .cloned()
    }

    /// Make every call of `op` fail with `status` and `message` until
    /// [`clear_failures`](Self::clear_failures).
    pub fn fail(&self, op: &'static str, status: u16, message: &str) {
        self.state()
            .failures
            .insert(op, (status, json!({ "_message": message }).to_string()));
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    /// Number of logged calls of `op`.
    pub fn count(&self, op: &str) -> usize {
        self.state().calls.iter().filter(|c| c.op == op).count()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Drain the push frames produced since the last call.
    pub fn take_pushed(&self) -> Vec<String> {
        std::mem::take(&mut self.state().pushed)
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        // A panicking test thread must not hide later assertions.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One client session of a [`MemoryServer`].
pub struct MemoryBackend {
    server: Arc<MemoryServer>,
    identity: SessionIdentity,
}

impl MemoryBackend {
    pub fn server(&self) -> &Arc<MemoryServer> {
        &self.server
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

impl ServerState {
    /// Log the call and return the injected failure for `op`, if any.
    fn enter(&mut self, op: &'static str, target: String, etag: Option<&str>) -> Result<(), BackendError> {
        self.calls.push(Call {
            op,
            target,
            etag: etag.map(str::to_string),
        });
        match self.failures.get(op) {
            Some((status, body)) => Err(BackendError::Api {
                status: *status,
                body: body.clone(),
            }),
            None => Ok(()),
        }
    }

    fn push(&mut self, event: String, extra: Value) {
        self.pushed
            .push(json!({ "event": event, "extra": extra }).to_string());
    }
}

fn api_error(status: u16, message: &str) -> BackendError {
    BackendError::Api {
        status,
        body: json!({ "_message": message }).to_string(),
    }
}

/// `t1` -> `t2`; anything else restarts the sequence at `<prefix>1`.
fn bump_etag(prefix: &str, current: Option<&str>) -> String {
    let next = current
        .and_then(|etag| etag.strip_prefix(prefix))
        .and_then(|n| n.parse::<u64>().ok())
        .map_or(1, |n| n + 1);
    format!("{prefix}{next}")
}

fn check_etag(stored: Option<&str>, given: Option<&str>) -> Result<(), BackendError> {
    match (stored, given) {
        (Some(stored), Some(given)) if stored != given => Err(api_error(
            412,
            "Client and server etags don't match",
        )),
        _ => Ok(()),
    }
}

fn autosave_key(resource: &str, id: &str) -> (String, String) {
    (resource.to_string(), id.to_string())
}

// ---------------------------------------------------------------------------
// Backend impl
// ---------------------------------------------------------------------------

#[async_trait]
impl Backend for MemoryBackend {
    async fn get_item(&self, item_type: ItemType, id: &str) -> Result<LockableItem, BackendError> {
        let mut state = self.server.state();
        state.enter("get_item", format!("{}/{id}", item_type.resource()), None)?;
        state
            .items
            .get(&ItemKey::new(item_type, id))
            .cloned()
            .ok_or_else(|| api_error(404, "Item not found"))
    }

    async fn save_item(
        &self,
        original: &LockableItem,
        updates: &Payload,
    ) -> Result<LockableItem, BackendError> {
        let mut state = self.server.state();
        state.enter(
            "save_item",
            format!("{}/{}", original.item_type.resource(), original.id),
            original.etag.as_deref(),
        )?;
        let session = self.identity.session.clone();
        let stored = state
            .items
            .entry(original.key())
            .or_insert_with(|| LockableItem::new(original.id.clone(), original.item_type));

        check_etag(stored.etag.as_deref(), original.etag.as_deref())?;
        if stored.is_locked() && !stored.is_locked_by(&session) {
            return Err(api_error(403, "The item is locked by another session"));
        }
        stored.fields.extend(updates.clone());
        stored.etag = Some(bump_etag("t", stored.etag.as_deref()));
        let saved = stored.clone();

        let resource = saved.item_type.resource();
        state.push(
            format!("{resource}:updated"),
            json!({ "item": saved.id, "etag": saved.etag, "user": self.identity.user }),
        );
        Ok(saved)
    }

    async fn lock_item(
        &self,
        item_type: ItemType,
        id: &str,
        etag: Option<&str>,
        action: &str,
    ) -> Result<LockableItem, BackendError> {
        let mut state = self.server.state();
        state.enter("lock_item", format!("{}/{id}", item_type.lock_endpoint()), etag)?;
        let identity = self.identity.clone();
        let stored = state
            .items
            .get_mut(&ItemKey::new(item_type, id))
            .ok_or_else(|| api_error(404, "Item not found"))?;

        check_etag(stored.etag.as_deref(), etag)?;
        if stored.is_locked() && !stored.is_locked_by(&identity.session) {
            return Err(api_error(409, "The item was already locked"));
        }
        stored.lock_user = Some(identity.user.clone());
        stored.lock_session = Some(identity.session.clone());
        stored.lock_action = Some(action.to_string());
        stored.lock_time = Some(Utc::now());
        stored.etag = Some(bump_etag("t", stored.etag.as_deref()));
        let locked = stored.clone();

        state.push(
            format!("{}:lock", item_type.resource()),
            json!({
                "item": locked.id,
                "user": identity.user,
                "lock_session": identity.session,
                "lock_action": action,
                "etag": locked.etag,
                "event_item": locked.event_item,
                "recurrence_id": locked.recurrence_id,
            }),
        );
        Ok(locked)
    }

    async fn unlock_item(
        &self,
        item_type: ItemType,
        id: &str,
        etag: Option<&str>,
    ) -> Result<LockableItem, BackendError> {
        let mut state = self.server.state();
        state.enter("unlock_item", format!("{}/{id}", item_type.unlock_endpoint()), etag)?;
        let identity = self.identity.clone();
        let stored = state
            .items
            .get_mut(&ItemKey::new(item_type, id))
            .ok_or_else(|| api_error(404, "Item not found"))?;

        check_etag(stored.etag.as_deref(), etag)?;
        if !stored.is_locked() {
            return Err(api_error(400, "The item was not locked"));
        }
        stored.clear_lock_fields();
        stored.etag = Some(bump_etag("t", stored.etag.as_deref()));
        let unlocked = stored.clone();

        state.push(
            format!("{}:unlock", item_type.resource()),
            json!({
                "item": unlocked.id,
                "user": identity.user,
                "session": identity.session,
                "etag": unlocked.etag,
            }),
        );
        Ok(unlocked)
    }

    async fn query_locked(&self, item_type: ItemType) -> Result<Vec<LockableItem>, BackendError> {
        let mut state = self.server.state();
        state.enter("query_locked", item_type.resource().to_string(), None)?;
        Ok(state
            .items
            .values()
            .filter(|item| item.item_type == item_type && item.is_locked())
            .cloned()
            .collect())
    }

    async fn get_featured_lock(&self) -> Result<Option<Lock>, BackendError> {
        let mut state = self.server.state();
        state.enter("get_featured_lock", "planning_featured_lock".into(), None)?;
        Ok(state.featured.clone())
    }

    async fn lock_featured(&self) -> Result<Lock, BackendError> {
        let mut state = self.server.state();
        state.enter("lock_featured", "planning_featured_lock".into(), None)?;
        if let Some(held) = &state.featured {
            if held.session != self.identity.session {
                return Err(api_error(409, "Featured stories already locked"));
            }
        }
        let mut lock = Lock::featured(self.identity.user.clone(), self.identity.session.clone());
        lock.time = Some(Utc::now());
        state.featured = Some(lock.clone());
        state.push(
            "planning_featured_lock:lock".into(),
            json!({ "user": self.identity.user, "session": self.identity.session }),
        );
        Ok(lock)
    }

    async fn unlock_featured(&self) -> Result<(), BackendError> {
        let mut state = self.server.state();
        state.enter("unlock_featured", "planning_featured_unlock".into(), None)?;
        state.featured = None;
        state.push(
            "planning_featured_lock:unlock".into(),
            json!({ "user": self.identity.user, "session": self.identity.session }),
        );
        Ok(())
    }

    async fn query_autosaves(
        &self,
        resource: &str,
        user: &str,
    ) -> Result<Vec<Payload>, BackendError> {
        let mut state = self.server.state();
        state.enter("query_autosaves", resource.to_string(), None)?;
        Ok(state
            .autosaves
            .iter()
            .filter(|((res, _), doc)| {
                res == resource && doc.get("lock_user").and_then(Value::as_str) == Some(user)
            })
            .map(|(_, doc)| doc.clone())
            .collect())
    }

    async fn get_autosave(&self, resource: &str, id: &str) -> Result<Payload, BackendError> {
        let mut state = self.server.state();
        state.enter("get_autosave", format!("{resource}/{id}"), None)?;
        let user = self.identity.user.as_str();
        state
            .autosaves
            .get(&autosave_key(resource, id))
            .filter(|doc| doc.get("lock_user").and_then(Value::as_str) == Some(user))
            .cloned()
            .ok_or_else(|| api_error(404, "Autosave not found"))
    }

    async fn create_autosave(
        &self,
        resource: &str,
        document: &Payload,
    ) -> Result<Payload, BackendError> {
        let id = document
            .get("_id")
            .and_then(Value::as_str)
            .ok_or_else(|| api_error(400, "Autosave requires an _id"))?
            .to_string();
        let mut state = self.server.state();
        state.enter("create_autosave", format!("{resource}/{id}"), None)?;
        if state.autosaves.contains_key(&autosave_key(resource, &id)) {
            return Err(api_error(409, "Autosave already exists"));
        }
        let mut stored = document.clone();
        stored.insert("_etag".into(), Value::String(bump_etag("d", None)));
        state.autosaves.insert(autosave_key(resource, &id), stored.clone());
        Ok(stored)
    }

    async fn update_autosave(
        &self,
        resource: &str,
        id: &str,
        etag: &str,
        document: &Payload,
    ) -> Result<Payload, BackendError> {
        let mut state = self.server.state();
        state.enter("update_autosave", format!("{resource}/{id}"), Some(etag))?;
        let stored = state
            .autosaves
            .get_mut(&autosave_key(resource, id))
            .ok_or_else(|| api_error(404, "Autosave not found"))?;
        let current = stored.get("_etag").and_then(Value::as_str).map(str::to_string);
        check_etag(current.as_deref(), Some(etag))?;

        let mut replacement = document.clone();
        replacement.insert(
            "_etag".into(),
            Value::String(bump_etag("d", current.as_deref())),
        );
        *stored = replacement.clone();
        Ok(replacement)
    }

    async fn delete_autosave(
        &self,
        resource: &str,
        id: &str,
        etag: &str,
    ) -> Result<(), BackendError> {
        let mut state = self.server.state();
        state.enter("delete_autosave", format!("{resource}/{id}"), Some(etag))?;
        match state.autosaves.remove(&autosave_key(resource, id)) {
            Some(_) => Ok(()),
            None => Err(api_error(404, "Autosave not found")),
        }
    }
}
