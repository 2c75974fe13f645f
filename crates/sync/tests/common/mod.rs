//! Shared harness: sync engines connected to one in-memory server.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use planning_backend::memory::MemoryServer;
use planning_core::item::{ItemType, LockableItem};
use planning_core::notifications::parse_frame;
use planning_core::types::{Payload, SessionIdentity};
use planning_sync::events::SyncEvent;
use planning_sync::PlanningSync;
use serde_json::Value;
use tokio::sync::broadcast;

/// Debounce used by test engines.
pub const DEBOUNCE: Duration = Duration::from_millis(10);

pub fn identity(name: &str) -> SessionIdentity {
    SessionIdentity::new(format!("user-{name}"), format!("session-{name}"))
}

/// A sync engine for `user-<name>` / `session-<name>`.
pub async fn client(server: &Arc<MemoryServer>, name: &str) -> PlanningSync {
    connect(server, identity(name)).await
}

pub async fn connect(server: &Arc<MemoryServer>, identity: SessionIdentity) -> PlanningSync {
    let backend = Arc::new(server.connect(identity.clone()));
    PlanningSync::start(backend, identity, DEBOUNCE).await
}

pub fn event(id: &str, etag: &str) -> LockableItem {
    LockableItem::new(id, ItemType::Event)
        .with_etag(etag)
        .with_field("name", Value::String(format!("Event {id}")))
}

pub fn planning(id: &str, etag: &str, event_item: Option<&str>) -> LockableItem {
    let mut item = LockableItem::new(id, ItemType::Planning).with_etag(etag);
    item.event_item = event_item.map(str::to_string);
    item.with_field("slugline", Value::String(format!("Planning {id}")))
}

pub fn assignment(id: &str, etag: &str, planning_item: &str) -> LockableItem {
    let mut item = LockableItem::new(id, ItemType::Assignment).with_etag(etag);
    item.planning_item = Some(planning_item.to_string());
    item
}

pub fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        other => panic!("Expected a JSON object, got {other}"),
    }
}

/// Feed raw push frames to an engine's dispatcher, in order.
pub async fn deliver(engine: &PlanningSync, frames: &[String]) {
    for frame in frames {
        if let Some(notification) = parse_frame(frame).expect("valid push frame") {
            engine.dispatcher.handle(notification).await;
        }
    }
}

/// Every event currently buffered on `rx`.
pub fn drain(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
