//! Push notifications from other sessions applied through the dispatcher.

mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use async_trait::async_trait;
use planning_backend::memory::{MemoryBackend, MemoryServer};
use planning_backend::{Backend, BackendError};
use planning_core::error::CoreError;
use planning_core::item::{ItemKey, ItemType, LockableItem};
use planning_core::locks::Lock;
use planning_core::notifications::Notification;
use planning_core::types::Payload;
use planning_sync::events::{CloseReason, SyncEvent};
use planning_sync::reconciler::{EditorState, Surface};
use planning_sync::{PlanningSync, SyncError};
use serde_json::json;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use common::{client, deliver, drain, event, identity, payload, planning, DEBOUNCE};

fn frame(event: &str, extra: serde_json::Value) -> String {
    json!({ "event": event, "extra": extra }).to_string()
}

/// `a` editing `e1` inline with an autosaved draft, `b` connected to the
/// same server, no push frames pending.
async fn editing_with_draft(server: &Arc<MemoryServer>) -> (PlanningSync, PlanningSync) {
    server.seed(event("e1", "t1"));
    let a = client(server, "a").await;
    let b = client(server, "b").await;

    a.reconciler
        .open(Surface::Inline, &event("e1", "t1"), "edit")
        .await
        .unwrap();
    a.reconciler
        .update(Surface::Inline, payload(json!({"name": "Mine"})))
        .await
        .unwrap();
    a.reconciler.flusher(Surface::Inline).flush().await;
    server.take_pushed();
    (a, b)
}

// ---------------------------------------------------------------------------
// Losing the lock
// ---------------------------------------------------------------------------

#[tokio::test]
async fn force_unlock_closes_the_editor_and_keeps_the_draft() {
    let server = MemoryServer::new();
    let (a, b) = editing_with_draft(&server).await;
    let mut events = a.context.subscribe();

    b.coordinator.unlock(&event("e1", "t2")).await.unwrap();
    deliver(&a, &server.take_pushed()).await;

    assert_eq!(a.reconciler.state(Surface::Inline).await, EditorState::Closed);
    assert!(!a.context.is_locked_in_session(&event("e1", "t3")).await);
    assert!(drain(&mut events).contains(&SyncEvent::EditorClosed {
        surface: Surface::Inline,
        item_type: ItemType::Event,
        item_id: "e1".into(),
        reason: CloseReason::UnlockedElsewhere,
    }));

    // The orphaned draft survives for a later recovery.
    assert!(server.autosave("event_autosave", "e1").is_some());
    let draft = a
        .autosaves
        .fetch_by_id(ItemType::Event, "e1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(draft.payload["name"], "Mine");
    assert_eq!(server.count("delete_autosave"), 0);
}

#[tokio::test]
async fn unlock_and_update_converge_in_either_order() {
    for reversed in [false, true] {
        let server = MemoryServer::new();
        let (a, b) = editing_with_draft(&server).await;

        b.coordinator.unlock(&event("e1", "t2")).await.unwrap();
        b.context
            .backend()
            .save_item(&event("e1", "t3"), &payload(json!({"name": "Theirs"})))
            .await
            .unwrap();

        let mut frames = server.take_pushed();
        assert_eq!(frames.len(), 2);
        if reversed {
            frames.reverse();
        }
        deliver(&a, &frames).await;

        assert_eq!(
            a.reconciler.state(Surface::Inline).await,
            EditorState::Closed,
            "reversed: {reversed}"
        );
        let cached = a
            .context
            .cached_item(&ItemKey::new(ItemType::Event, "e1"))
            .await
            .unwrap();
        assert_eq!(cached.fields["name"], "Theirs", "reversed: {reversed}");
        assert!(!cached.is_locked(), "reversed: {reversed}");
    }
}

#[tokio::test]
async fn lock_taken_elsewhere_closes_the_editor() {
    let server = MemoryServer::new();
    let (a, b) = editing_with_draft(&server).await;
    let mut events = a.context.subscribe();

    b.coordinator.unlock(&event("e1", "t2")).await.unwrap();
    b.coordinator.lock(&event("e1", "t3"), "edit").await.unwrap();
    let frames = server.take_pushed();
    // Only the lock frame arrives.
    deliver(&a, &frames[1..]).await;

    assert_eq!(a.reconciler.state(Surface::Inline).await, EditorState::Closed);
    assert_eq!(
        a.context.get_lock(&event("e1", "t4")).await.unwrap().session,
        "session-b"
    );
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        SyncEvent::EditorClosed { reason: CloseReason::LockedElsewhere, .. }
    )));
}

#[tokio::test]
async fn own_frames_leave_the_editor_open() {
    let server = MemoryServer::new();
    server.seed(event("e1", "t1"));
    let a = client(&server, "a").await;

    a.reconciler
        .open(Surface::Inline, &event("e1", "t1"), "edit")
        .await
        .unwrap();
    deliver(&a, &server.take_pushed()).await;

    assert_eq!(a.reconciler.state(Surface::Inline).await, EditorState::Editing);
    assert!(a.context.is_locked_in_session(&event("e1", "t2")).await);
}

#[tokio::test]
async fn releasing_the_event_closes_its_planning_editor() {
    let server = MemoryServer::new();
    server.seed(event("e1", "t1"));
    server.seed(planning("p1", "t1", Some("e1")));
    let a = client(&server, "a").await;
    let b = client(&server, "b").await;

    a.coordinator
        .lock(&event("e1", "t1"), "add_to_planning")
        .await
        .unwrap();
    a.reconciler
        .open(Surface::Popup, &planning("p1", "t1", Some("e1")), "edit")
        .await
        .unwrap();
    server.take_pushed();

    b.coordinator.unlock(&event("e1", "t2")).await.unwrap();
    let mut events = a.context.subscribe();
    deliver(&a, &server.take_pushed()).await;

    assert_eq!(a.reconciler.state(Surface::Popup).await, EditorState::Closed);
    assert!(drain(&mut events).contains(&SyncEvent::EditorClosed {
        surface: Surface::Popup,
        item_type: ItemType::Planning,
        item_id: "p1".into(),
        reason: CloseReason::UnlockedElsewhere,
    }));
}

/// Holds every autosave lookup until released, so frames can land while
/// an editor is hydrating.
struct GatedBackend {
    inner: MemoryBackend,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl Backend for GatedBackend {
    async fn get_item(&self, item_type: ItemType, id: &str) -> Result<LockableItem, BackendError> {
        self.inner.get_item(item_type, id).await
    }

    async fn save_item(
        &self,
        original: &LockableItem,
        updates: &Payload,
    ) -> Result<LockableItem, BackendError> {
        self.inner.save_item(original, updates).await
    }

    async fn lock_item(
        &self,
        item_type: ItemType,
        id: &str,
        etag: Option<&str>,
        action: &str,
    ) -> Result<LockableItem, BackendError> {
        self.inner.lock_item(item_type, id, etag, action).await
    }

    async fn unlock_item(
        &self,
        item_type: ItemType,
        id: &str,
        etag: Option<&str>,
    ) -> Result<LockableItem, BackendError> {
        self.inner.unlock_item(item_type, id, etag).await
    }

    async fn query_locked(&self, item_type: ItemType) -> Result<Vec<LockableItem>, BackendError> {
        self.inner.query_locked(item_type).await
    }

    async fn get_featured_lock(&self) -> Result<Option<Lock>, BackendError> {
        self.inner.get_featured_lock().await
    }

    async fn lock_featured(&self) -> Result<Lock, BackendError> {
        self.inner.lock_featured().await
    }

    async fn unlock_featured(&self) -> Result<(), BackendError> {
        self.inner.unlock_featured().await
    }

    async fn query_autosaves(
        &self,
        resource: &str,
        user: &str,
    ) -> Result<Vec<Payload>, BackendError> {
        self.inner.query_autosaves(resource, user).await
    }

    async fn get_autosave(&self, resource: &str, id: &str) -> Result<Payload, BackendError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.get_autosave(resource, id).await
    }

    async fn create_autosave(
        &self,
        resource: &str,
        document: &Payload,
    ) -> Result<Payload, BackendError> {
        self.inner.create_autosave(resource, document).await
    }

    async fn update_autosave(
        &self,
        resource: &str,
        id: &str,
        etag: &str,
        document: &Payload,
    ) -> Result<Payload, BackendError> {
        self.inner.update_autosave(resource, id, etag, document).await
    }

    async fn delete_autosave(&self, resource: &str, id: &str, etag: &str) -> Result<(), BackendError> {
        self.inner.delete_autosave(resource, id, etag).await
    }
}

#[tokio::test]
async fn unlock_while_hydrating_aborts_the_open() {
    let server = MemoryServer::new();
    server.seed(event("e1", "t1"));
    let gated = Arc::new(GatedBackend {
        inner: server.connect(identity("a")),
        entered: Notify::new(),
        release: Notify::new(),
    });
    let a = PlanningSync::start(gated.clone(), identity("a"), DEBOUNCE).await;
    let b = client(&server, "b").await;

    let reconciler = Arc::clone(&a.reconciler);
    let opening = tokio::spawn(async move {
        reconciler
            .open(Surface::Inline, &event("e1", "t1"), "edit")
            .await
    });
    gated.entered.notified().await;
    assert_eq!(a.reconciler.state(Surface::Inline).await, EditorState::Hydrating);

    server.take_pushed();
    b.coordinator.unlock(&event("e1", "t2")).await.unwrap();
    deliver(&a, &server.take_pushed()).await;
    gated.release.notify_one();

    let result = opening.await.unwrap();
    assert_matches!(result, Err(SyncError::LockConflict { .. }));
    assert_eq!(a.reconciler.state(Surface::Inline).await, EditorState::Closed);
    assert!(a.reconciler.session(Surface::Inline).await.is_none());
    assert!(!a.context.is_locked_in_session(&event("e1", "t3")).await);
}

#[tokio::test]
async fn failed_release_of_an_abandoned_open_is_not_returned() {
    let server = MemoryServer::new();
    server.seed(event("e1", "t1"));
    let gated = Arc::new(GatedBackend {
        inner: server.connect(identity("a")),
        entered: Notify::new(),
        release: Notify::new(),
    });
    let a = PlanningSync::start(gated.clone(), identity("a"), DEBOUNCE).await;

    let reconciler = Arc::clone(&a.reconciler);
    let opening = tokio::spawn(async move {
        reconciler
            .open(Surface::Inline, &event("e1", "t1"), "edit")
            .await
    });
    gated.entered.notified().await;

    a.reconciler.cancel(Surface::Inline).await.unwrap();
    server.fail("unlock_item", 500, "Lock service unavailable");
    gated.release.notify_one();

    let result = opening.await.unwrap();
    assert_matches!(result, Err(SyncError::Core(CoreError::Conflict(_))));
    assert_eq!(a.reconciler.state(Surface::Inline).await, EditorState::Closed);
    assert_eq!(server.count("unlock_item"), 1);
    assert!(server.item(ItemType::Event, "e1").unwrap().is_locked());
}

// ---------------------------------------------------------------------------
// Item changes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn updates_refetch_only_stale_cached_items() {
    let server = MemoryServer::new();
    server.seed(event("e1", "t1"));
    let a = client(&server, "a").await;
    a.coordinator.lock(&event("e1", "t1"), "edit").await.unwrap();
    server.clear_calls();

    deliver(
        &a,
        &[
            frame("events:updated", json!({"item": "e9", "etag": "t5"})),
            frame("events:updated", json!({"item": "e1", "etag": "t2"})),
        ],
    )
    .await;
    assert_eq!(server.count("get_item"), 0);

    deliver(&a, &[frame("events:updated", json!({"item": "e1", "etag": "t7"}))]).await;
    assert_eq!(server.count("get_item"), 1);
}

#[tokio::test]
async fn deleted_item_closes_its_editor() {
    let server = MemoryServer::new();
    server.seed(event("e1", "t1"));
    let a = client(&server, "a").await;
    let mut events = a.context.subscribe();
    a.reconciler
        .open(Surface::Inline, &event("e1", "t1"), "edit")
        .await
        .unwrap();

    deliver(&a, &[frame("events:deleted", json!({"item": "e1"}))]).await;

    let key = ItemKey::new(ItemType::Event, "e1");
    assert_eq!(a.reconciler.state(Surface::Inline).await, EditorState::Closed);
    assert!(a.context.cached_item(&key).await.is_none());
    assert!(a.context.with_locks(|r| r.is_empty()).await);
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        SyncEvent::EditorClosed { reason: CloseReason::Deleted, .. }
    )));
}

#[tokio::test]
async fn deleting_an_uncached_item_drops_its_lock() {
    let server = MemoryServer::new();
    server.seed(event("e1", "t1"));
    let a = client(&server, "a").await;
    let b = client(&server, "b").await;

    b.coordinator.lock(&event("e1", "t1"), "edit").await.unwrap();
    deliver(&a, &server.take_pushed()).await;
    let key = ItemKey::new(ItemType::Event, "e1");
    assert!(a.context.cached_item(&key).await.is_none());
    assert!(!a.context.with_locks(|r| r.is_empty()).await);

    deliver(&a, &[frame("events:deleted", json!({"item": "e1"}))]).await;

    assert!(a.context.with_locks(|r| r.is_empty()).await);
}

#[tokio::test]
async fn created_items_are_announced() {
    let server = MemoryServer::new();
    let a = client(&server, "a").await;
    let mut events = a.context.subscribe();

    deliver(&a, &[frame("planning:created", json!({"item": "p7"}))]).await;

    assert_eq!(
        drain(&mut events),
        [SyncEvent::ItemCreated {
            item_type: ItemType::Planning,
            item_id: "p7".into(),
        }]
    );
}

// ---------------------------------------------------------------------------
// Registry upkeep
// ---------------------------------------------------------------------------

#[tokio::test]
async fn featured_frames_track_the_featured_lock() {
    let server = MemoryServer::new();
    let a = client(&server, "a").await;
    let b = client(&server, "b").await;

    a.coordinator.lock_featured().await.unwrap();
    deliver(&b, &server.take_pushed()).await;
    assert_eq!(
        b.context
            .with_locks(|r| r.featured().map(|lock| lock.session.clone()))
            .await
            .as_deref(),
        Some("session-a")
    );

    a.coordinator.unlock_featured().await.unwrap();
    deliver(&b, &server.take_pushed()).await;
    assert!(b.context.with_locks(|r| r.featured().is_none()).await);
}

#[tokio::test]
async fn reconnect_reloads_missed_locks() {
    let server = MemoryServer::new();
    server.seed(event("e1", "t1"));
    let a = client(&server, "a").await;
    let b = client(&server, "b").await;
    let mut events = a.context.subscribe();

    // The lock frame is lost while the channel is down.
    b.coordinator.lock(&event("e1", "t1"), "edit").await.unwrap();
    server.take_pushed();

    a.dispatcher.handle(Notification::Reconnected).await;

    assert_eq!(
        a.context.get_lock(&event("e1", "t2")).await.unwrap().session,
        "session-b"
    );
    assert_eq!(drain(&mut events), [SyncEvent::LocksReloaded { count: 1 }]);
}

#[tokio::test]
async fn run_stops_when_the_channel_closes() {
    let server = MemoryServer::new();
    let a = client(&server, "a").await;
    let mut events = a.context.subscribe();
    let (tx, rx) = mpsc::unbounded_channel();

    let dispatcher = Arc::clone(&a.dispatcher);
    let task = tokio::spawn(async move { dispatcher.run(rx, CancellationToken::new()).await });

    tx.send(Notification::Created {
        item_type: ItemType::Event,
        item_id: "e3".into(),
    })
    .unwrap();
    drop(tx);
    task.await.unwrap();

    assert_eq!(
        drain(&mut events),
        [SyncEvent::ItemCreated {
            item_type: ItemType::Event,
            item_id: "e3".into(),
        }]
    );
}
