//! Lockable planning items (events, planning items, assignments).
//!
//! The item type is a closed enum; everything that used to be picked by
//! matching on a type string (lock endpoints, autosave resources, entity
//! names for errors) is a method on [`ItemType`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::canonical;
use crate::types::{is_temp_id, Etag, ItemId, Payload, SessionId, Timestamp, UserId};

// ---------------------------------------------------------------------------
// Item types
// ---------------------------------------------------------------------------

/// The kinds of items that can be locked and edited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Event,
    Planning,
    Assignment,
}

impl ItemType {
    pub const ALL: [ItemType; 3] = [ItemType::Event, ItemType::Planning, ItemType::Assignment];

    /// Singular entity name, as used in error messages and the `type` field.
    pub fn entity_name(self) -> &'static str {
        match self {
            ItemType::Event => "event",
            ItemType::Planning => "planning",
            ItemType::Assignment => "assignment",
        }
    }

    /// REST collection for this type.
    pub fn resource(self) -> &'static str {
        match self {
            ItemType::Event => "events",
            ItemType::Planning => "planning",
            ItemType::Assignment => "assignments",
        }
    }

    /// Dedicated lock endpoint (`<resource>_lock`).
    pub fn lock_endpoint(self) -> &'static str {
        match self {
            ItemType::Event => "events_lock",
            ItemType::Planning => "planning_lock",
            ItemType::Assignment => "assignments_lock",
        }
    }

    /// Dedicated unlock endpoint (`<resource>_unlock`).
    pub fn unlock_endpoint(self) -> &'static str {
        match self {
            ItemType::Event => "events_unlock",
            ItemType::Planning => "planning_unlock",
            ItemType::Assignment => "assignments_unlock",
        }
    }

    /// Side-channel autosave resource, if this type supports drafts.
    ///
    /// Assignments are edited through small modals and have no drafts.
    pub fn autosave_resource(self) -> Option<&'static str> {
        match self {
            ItemType::Event => Some("event_autosave"),
            ItemType::Planning => Some("planning_autosave"),
            ItemType::Assignment => None,
        }
    }

    /// Map a push-channel resource name to an item type.
    ///
    /// Both the singular and the collection spelling are accepted.
    pub fn from_resource(name: &str) -> Option<Self> {
        match name {
            "event" | "events" => Some(ItemType::Event),
            "planning" => Some(ItemType::Planning),
            "assignment" | "assignments" => Some(ItemType::Assignment),
            _ => None,
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.entity_name())
    }
}

// ---------------------------------------------------------------------------
// Lock actions
// ---------------------------------------------------------------------------

/// Known lock actions. The server may add more; unknown values are carried
/// through untouched.
pub mod lock_actions {
    pub const EDIT: &str = "edit";
    pub const CREATE: &str = "create";
    pub const SPIKE: &str = "spike";
    pub const UNSPIKE: &str = "unspike";
    pub const ADD_TO_PLANNING: &str = "add_to_planning";
    pub const CANCEL_EVENT: &str = "cancel_event";
    pub const POSTPONE_EVENT: &str = "postpone_event";
    pub const RESCHEDULE_EVENT: &str = "reschedule_event";
    pub const UPDATE_TIME: &str = "update_time";
    pub const UPDATE_REPETITIONS: &str = "update_repetitions";
    pub const CONVERT_RECURRING: &str = "convert_recurring";
    pub const REASSIGN: &str = "reassign";
    pub const COMPLETE: &str = "complete";
    pub const REMOVE_ASSIGNMENT: &str = "remove_assignment";
    pub const FEATURED_STORIES: &str = "featured_stories";
}

/// Lock actions that apply to a whole recurring series rather than to a
/// single occurrence.
pub const SERIES_LOCK_ACTIONS: &[&str] = &[
    lock_actions::UPDATE_REPETITIONS,
    lock_actions::CONVERT_RECURRING,
    lock_actions::RESCHEDULE_EVENT,
    lock_actions::POSTPONE_EVENT,
    lock_actions::CANCEL_EVENT,
];

/// Validate a lock action supplied by a caller.
pub fn validate_lock_action(action: &str) -> Result<(), String> {
    if action.trim().is_empty() {
        return Err("Lock action must not be empty".to_string());
    }
    if action.chars().any(|c| c.is_whitespace()) {
        return Err(format!("Lock action '{action}' must not contain whitespace"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// LockableItem
// ---------------------------------------------------------------------------

/// An Event, Planning item or Assignment as seen by the locking protocol.
///
/// Lock fields and chain references are typed; everything else is kept in
/// [`fields`](Self::fields) as payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockableItem {
    #[serde(rename = "_id")]
    pub id: ItemId,

    #[serde(rename = "type")]
    pub item_type: ItemType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_action: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_user: Option<UserId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_session: Option<SessionId>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "canonical::opt_datetime"
    )]
    pub lock_time: Option<Timestamp>,

    #[serde(rename = "_etag", default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<Etag>,

    /// Planning item -> the event it covers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_item: Option<ItemId>,

    /// Assignment -> the planning item it belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planning_item: Option<ItemId>,

    /// Event series identifier shared by all occurrences.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence_id: Option<String>,

    #[serde(flatten)]
    pub fields: Payload,
}

impl LockableItem {
    /// A bare, unlocked item with no payload.
    pub fn new(id: impl Into<ItemId>, item_type: ItemType) -> Self {
        Self {
            id: id.into(),
            item_type,
            lock_action: None,
            lock_user: None,
            lock_session: None,
            lock_time: None,
            etag: None,
            event_item: None,
            planning_item: None,
            recurrence_id: None,
            fields: Payload::new(),
        }
    }

    pub fn with_etag(mut self, etag: impl Into<Etag>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// `false` for items that only exist client-side (temporary id).
    pub fn is_persisted(&self) -> bool {
        !is_temp_id(&self.id)
    }

    /// An item is locked iff it has a lock user.
    pub fn is_locked(&self) -> bool {
        self.lock_user.is_some()
    }

    /// Locked, and the lock belongs to `session`.
    pub fn is_locked_by(&self, session: &str) -> bool {
        self.is_locked() && self.lock_session.as_deref() == Some(session)
    }

    /// Copy the lock fields and `_etag` of `source` onto this item.
    pub fn apply_lock_fields(&mut self, source: &LockableItem) {
        self.lock_action = source.lock_action.clone();
        self.lock_user = source.lock_user.clone();
        self.lock_session = source.lock_session.clone();
        self.lock_time = source.lock_time;
        if source.etag.is_some() {
            self.etag = source.etag.clone();
        }
    }

    pub fn clear_lock_fields(&mut self) {
        self.lock_action = None;
        self.lock_user = None;
        self.lock_session = None;
        self.lock_time = None;
    }

    /// Copy payload fields, chain references and `_etag` of `source`,
    /// leaving this item's lock fields alone.
    pub fn merge_payload(&mut self, source: &LockableItem) {
        self.fields = source.fields.clone();
        self.event_item = source.event_item.clone();
        self.planning_item = source.planning_item.clone();
        self.recurrence_id = source.recurrence_id.clone();
        if source.etag.is_some() {
            self.etag = source.etag.clone();
        }
    }

    /// Key under which the item is cached.
    pub fn key(&self) -> ItemKey {
        ItemKey::new(self.item_type, self.id.clone())
    }
}

/// Cache key: item type plus id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemKey {
    pub item_type: ItemType,
    pub id: ItemId,
}

impl ItemKey {
    pub fn new(item_type: ItemType, id: impl Into<ItemId>) -> Self {
        Self {
            item_type,
            id: id.into(),
        }
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.item_type, self.id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // -----------------------------------------------------------------------
    // ItemType capabilities
    // -----------------------------------------------------------------------

    #[test]
    fn endpoints_follow_resource_names() {
        assert_eq!(ItemType::Event.lock_endpoint(), "events_lock");
        assert_eq!(ItemType::Planning.unlock_endpoint(), "planning_unlock");
        assert_eq!(ItemType::Assignment.lock_endpoint(), "assignments_lock");
    }

    #[test]
    fn assignments_have_no_autosave_resource() {
        assert_eq!(ItemType::Event.autosave_resource(), Some("event_autosave"));
        assert_eq!(ItemType::Planning.autosave_resource(), Some("planning_autosave"));
        assert!(ItemType::Assignment.autosave_resource().is_none());
    }

    #[test]
    fn from_resource_accepts_both_spellings() {
        assert_eq!(ItemType::from_resource("events"), Some(ItemType::Event));
        assert_eq!(ItemType::from_resource("event"), Some(ItemType::Event));
        assert_eq!(ItemType::from_resource("assignments"), Some(ItemType::Assignment));
        assert_eq!(ItemType::from_resource("agenda"), None);
    }

    // -----------------------------------------------------------------------
    // Lock action validation
    // -----------------------------------------------------------------------

    #[test]
    fn lock_action_validation() {
        assert!(validate_lock_action(lock_actions::EDIT).is_ok());
        assert!(validate_lock_action("").is_err());
        assert!(validate_lock_action("add to planning").is_err());
    }

    // -----------------------------------------------------------------------
    // LockableItem
    // -----------------------------------------------------------------------

    #[test]
    fn deserializes_lock_fields_and_keeps_payload() {
        let item: LockableItem = serde_json::from_value(json!({
            "_id": "e1",
            "type": "event",
            "_etag": "t1",
            "lock_user": "u1",
            "lock_session": "s1",
            "lock_action": "edit",
            "lock_time": "2026-10-19T10:00:00+0000",
            "name": "Council meeting",
        }))
        .unwrap();

        assert_eq!(item.id, "e1");
        assert_eq!(item.item_type, ItemType::Event);
        assert!(item.is_locked_by("s1"));
        assert!(!item.is_locked_by("s2"));
        assert!(item.lock_time.is_some());
        assert_eq!(item.fields["name"], "Council meeting");
        assert!(!item.fields.contains_key("_etag"));
    }

    #[test]
    fn temp_items_are_not_persisted() {
        assert!(!LockableItem::new("tempId-42", ItemType::Planning).is_persisted());
        assert!(LockableItem::new("p1", ItemType::Planning).is_persisted());
    }

    #[test]
    fn merge_payload_leaves_lock_fields() {
        let mut cached = LockableItem::new("p1", ItemType::Planning);
        cached.lock_user = Some("u1".into());
        cached.lock_session = Some("s1".into());

        let incoming = LockableItem::new("p1", ItemType::Planning)
            .with_etag("t9")
            .with_field("slugline", json!("Budget"));
        cached.merge_payload(&incoming);

        assert!(cached.is_locked_by("s1"));
        assert_eq!(cached.etag.as_deref(), Some("t9"));
        assert_eq!(cached.fields["slugline"], "Budget");
    }

    #[test]
    fn apply_lock_fields_keeps_etag_when_source_has_none() {
        let mut cached = LockableItem::new("p1", ItemType::Planning).with_etag("t1");
        let mut source = LockableItem::new("p1", ItemType::Planning);
        source.lock_user = Some("u2".into());

        cached.apply_lock_fields(&source);

        assert_eq!(cached.lock_user.as_deref(), Some("u2"));
        assert_eq!(cached.etag.as_deref(), Some("t1"));
    }
}
