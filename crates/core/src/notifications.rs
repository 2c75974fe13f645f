//! Push-channel message protocol.
//!
//! The server pushes JSON frames of the shape
//! `{"event": "<resource>:<kind>", "extra": {...}}`. [`parse_frame`] turns
//! the frames this client cares about into typed [`Notification`]s; frames
//! for other resources (agendas, calendars, …) parse to `None`.

use serde::Deserialize;

use crate::canonical::opt_datetime;
use crate::item::ItemType;
use crate::locks::{is_series_action, Lock, LockResource};
use crate::types::{Etag, ItemId, SessionId, Timestamp, UserId};

/// Resource name of the featured-stories singleton lock.
pub const FEATURED_LOCK_RESOURCE: &str = "planning_featured_lock";

/// Kinds that announce a state change applied to one or many items at once.
pub const BULK_UPDATE_KINDS: &[&str] = &[
    "spiked",
    "unspiked",
    "cancelled",
    "posted",
    "rescheduled",
    "postponed",
];

// ---------------------------------------------------------------------------
// Typed notifications
// ---------------------------------------------------------------------------

/// One changed item inside an update notification.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemChange {
    pub id: ItemId,
    pub etag: Option<Etag>,
}

/// A push notification relevant to locking and editing.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A new item exists on the server.
    Created { item_type: ItemType, item_id: ItemId },

    /// One or more items changed on the server.
    Updated {
        item_type: ItemType,
        items: Vec<ItemChange>,
    },

    /// An item was deleted on the server.
    Deleted { item_type: ItemType, item_id: ItemId },

    /// A session acquired a lock.
    Locked {
        item_type: ItemType,
        lock: Lock,
        etag: Option<Etag>,
    },

    /// A session released a lock.
    ///
    /// `session` is the session that performed the release, which is not
    /// necessarily the session that held the lock.
    Unlocked {
        item_type: ItemType,
        item_id: ItemId,
        user: Option<UserId>,
        session: Option<SessionId>,
        etag: Option<Etag>,
    },

    /// The featured-stories lock was taken.
    FeaturedLocked { user: UserId, session: SessionId },

    /// The featured-stories lock was released.
    FeaturedUnlocked { session: Option<SessionId> },

    /// The push channel was re-established; local lock state may be stale.
    Reconnected,
}

impl Notification {
    /// Item type the notification refers to, if any.
    pub fn item_type(&self) -> Option<ItemType> {
        match self {
            Notification::Created { item_type, .. }
            | Notification::Updated { item_type, .. }
            | Notification::Deleted { item_type, .. }
            | Notification::Locked { item_type, .. }
            | Notification::Unlocked { item_type, .. } => Some(*item_type),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PushFrame {
    event: String,
    #[serde(default)]
    extra: Extra,
}

#[derive(Debug, Default, Deserialize)]
struct Extra {
    item: Option<ItemId>,
    user: Option<UserId>,
    #[serde(alias = "lock_session")]
    session: Option<SessionId>,
    lock_action: Option<String>,
    #[serde(default, with = "opt_datetime")]
    lock_time: Option<Timestamp>,
    #[serde(alias = "_etag")]
    etag: Option<Etag>,
    recurrence_id: Option<String>,
    event_item: Option<ItemId>,
    #[serde(default)]
    items: Vec<BulkEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BulkEntry {
    Id(ItemId),
    Item {
        #[serde(alias = "_id")]
        id: ItemId,
        #[serde(default, alias = "_etag")]
        etag: Option<Etag>,
    },
}

impl From<BulkEntry> for ItemChange {
    fn from(entry: BulkEntry) -> Self {
        match entry {
            BulkEntry::Id(id) => ItemChange { id, etag: None },
            BulkEntry::Item { id, etag } => ItemChange { id, etag },
        }
    }
}

/// Errors from [`parse_frame`].
#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("Malformed push frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Push event '{event}' is missing '{field}'")]
    MissingField { event: String, field: &'static str },
}

/// Parse a push-channel text frame.
///
/// Returns `Ok(None)` for well-formed frames about resources or kinds this
/// client does not track.
pub fn parse_frame(text: &str) -> Result<Option<Notification>, NotificationError> {
    let frame: PushFrame = serde_json::from_str(text)?;
    let Some((resource, kind)) = frame.event.split_once(':') else {
        return Ok(None);
    };

    if resource == FEATURED_LOCK_RESOURCE {
        return parse_featured(&frame.event, kind, frame.extra);
    }

    let Some(item_type) = ItemType::from_resource(resource) else {
        return Ok(None);
    };
    let event = frame.event.as_str();
    let extra = frame.extra;

    let notification = match kind {
        "created" => Notification::Created {
            item_type,
            item_id: require(event, "item", extra.item)?,
        },
        "deleted" => Notification::Deleted {
            item_type,
            item_id: require(event, "item", extra.item)?,
        },
        "lock" => {
            let item_id = require(event, "item", extra.item)?;
            let lock = Lock {
                resource: LockResource::from(item_type),
                item_id,
                user: require(event, "user", extra.user)?,
                session: require(event, "session", extra.session)?,
                recurrence_id: match item_type {
                    ItemType::Event if is_series_action(extra.lock_action.as_deref()) => {
                        extra.recurrence_id
                    }
                    _ => None,
                },
                event_item: match item_type {
                    ItemType::Planning => extra.event_item,
                    _ => None,
                },
                action: extra.lock_action,
                time: extra.lock_time,
            };
            Notification::Locked {
                item_type,
                lock,
                etag: extra.etag,
            }
        }
        "unlock" => Notification::Unlocked {
            item_type,
            item_id: require(event, "item", extra.item)?,
            user: extra.user,
            session: extra.session,
            etag: extra.etag,
        },
        "updated" => updated(event, item_type, extra)?,
        k if BULK_UPDATE_KINDS.contains(&k) => updated(event, item_type, extra)?,
        _ => return Ok(None),
    };
    Ok(Some(notification))
}

fn updated(
    event: &str,
    item_type: ItemType,
    extra: Extra,
) -> Result<Notification, NotificationError> {
    let items: Vec<ItemChange> = if extra.items.is_empty() {
        vec![ItemChange {
            id: require(event, "item", extra.item)?,
            etag: extra.etag,
        }]
    } else {
        extra.items.into_iter().map(ItemChange::from).collect()
    };
    Ok(Notification::Updated { item_type, items })
}

fn parse_featured(
    event: &str,
    kind: &str,
    extra: Extra,
) -> Result<Option<Notification>, NotificationError> {
    match kind {
        "lock" => Ok(Some(Notification::FeaturedLocked {
            user: require(event, "user", extra.user)?,
            session: require(event, "session", extra.session)?,
        })),
        "unlock" => Ok(Some(Notification::FeaturedUnlocked {
            session: extra.session,
        })),
        _ => Ok(None),
    }
}

fn require<T>(event: &str, field: &'static str, value: Option<T>) -> Result<T, NotificationError> {
    value.ok_or_else(|| NotificationError::MissingField {
        event: event.to_string(),
        field,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
