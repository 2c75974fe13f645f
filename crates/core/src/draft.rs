//! Autosave drafts: per-session shadow copies of in-progress edits.

use serde_json::Value;

use crate::canonical::{to_editor_shape, to_server_shape};
use crate::error::CoreError;
use crate::item::ItemType;
use crate::types::{Etag, ItemId, Payload, SessionId, UserId};

/// Document keys that describe the draft rather than the edited item.
const DRAFT_KEYS: &[&str] = &["_id", "type", "lock_user", "lock_session", "_etag"];

/// The latest unsaved draft of one item, in editor shape.
#[derive(Debug, Clone, PartialEq)]
pub struct AutosaveDraft {
    pub item_type: ItemType,
    pub item_id: ItemId,
    pub payload: Payload,
    /// Present once the server has stored the draft.
    pub etag: Option<Etag>,
    pub lock_user: Option<UserId>,
    pub lock_session: Option<SessionId>,
}

impl AutosaveDraft {
    pub fn new(
        item_type: ItemType,
        item_id: impl Into<ItemId>,
        payload: Payload,
        lock_user: Option<UserId>,
        lock_session: Option<SessionId>,
    ) -> Self {
        Self {
            item_type,
            item_id: item_id.into(),
            payload,
            etag: None,
            lock_user,
            lock_session,
        }
    }

    /// `true` once the server has acknowledged the draft.
    pub fn is_persisted(&self) -> bool {
        self.etag.is_some()
    }

    /// Drafts only ever hydrate the editor of the session that wrote them.
    pub fn is_owned_by(&self, session: &str) -> bool {
        self.lock_session.as_deref() == Some(session)
    }

    /// Build a draft from a stored server document.
    pub fn from_document(item_type: ItemType, document: &Payload) -> Result<Self, CoreError> {
        let item_id = string_field(document, "_id")
            .ok_or_else(|| CoreError::Validation("Autosave document has no '_id'".to_string()))?;

        let body: Payload = document
            .iter()
            .filter(|(key, _)| !DRAFT_KEYS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(Self {
            item_type,
            item_id,
            payload: to_editor_shape(item_type, &body)?,
            etag: string_field(document, "_etag"),
            lock_user: string_field(document, "lock_user"),
            lock_session: string_field(document, "lock_session"),
        })
    }

    /// Server document for this draft, without `_etag` (which travels in
    /// the `If-Match` header).
    pub fn to_document(&self) -> Result<Payload, CoreError> {
        let mut document = to_server_shape(self.item_type, &self.payload)?;
        document.insert("_id".into(), Value::String(self.item_id.clone()));
        document.insert(
            "type".into(),
            Value::String(self.item_type.entity_name().to_string()),
        );
        if let Some(user) = &self.lock_user {
            document.insert("lock_user".into(), Value::String(user.clone()));
        }
        if let Some(session) = &self.lock_session {
            document.insert("lock_session".into(), Value::String(session.clone()));
        }
        Ok(document)
    }
}

fn string_field(document: &Payload, key: &str) -> Option<String> {
    document.get(key).and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn document_fields_are_split_from_payload() {
        let doc = json!({
            "_id": "p1",
            "type": "planning",
            "_etag": "d1",
            "lock_user": "u1",
            "lock_session": "s1",
            "slugline": "Storm",
            "planning_date": "2026-10-19T08:00:00+0000",
        });

        let draft = AutosaveDraft::from_document(ItemType::Planning, doc.as_object().unwrap()).unwrap();

        assert_eq!(draft.item_id, "p1");
        assert_eq!(draft.etag.as_deref(), Some("d1"));
        assert!(draft.is_owned_by("s1"));
        assert!(!draft.payload.contains_key("_id"));
        assert_eq!(draft.payload["planning_date"], "2026-10-19T08:00:00+00:00");
    }

    #[test]
    fn document_without_id_is_rejected() {
        let doc = json!({"slugline": "Storm"});
        assert!(AutosaveDraft::from_document(ItemType::Planning, doc.as_object().unwrap()).is_err());
    }

    #[test]
    fn to_document_carries_owner_and_server_dates() {
        let payload = json!({"dates": {"start": "2026-10-19T10:00:00+00:00"}});
        let draft = AutosaveDraft::new(
            ItemType::Event,
            "e1",
            payload.as_object().cloned().unwrap(),
            Some("u1".into()),
            Some("s1".into()),
        );

        let doc = draft.to_document().unwrap();

        assert_eq!(doc["_id"], "e1");
        assert_eq!(doc["type"], "event");
        assert_eq!(doc["lock_session"], "s1");
        assert_eq!(doc["dates"]["start"], "2026-10-19T10:00:00+0000");
        assert!(!doc.contains_key("_etag"));
    }
}
