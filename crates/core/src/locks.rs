//! In-memory mirror of the locks the server holds.
//!
//! [`LockRegistry`] is pure data: it never talks to the network. It is
//! replaced wholesale on bulk load and patched incrementally by lock/unlock
//! responses and push notifications.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::item::{ItemType, LockableItem, SERIES_LOCK_ACTIONS};
use crate::types::{ItemId, SessionId, Timestamp, UserId};

/// Pseudo item id used for the featured-stories singleton lock.
pub const FEATURED_STORIES_ID: &str = "featured_stories";

// ---------------------------------------------------------------------------
// Lock
// ---------------------------------------------------------------------------

/// What a registry entry locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockResource {
    Event,
    Planning,
    Assignment,
    FeaturedStories,
}

impl LockResource {
    /// The item type behind this resource; `None` for the featured singleton.
    pub fn item_type(self) -> Option<ItemType> {
        match self {
            LockResource::Event => Some(ItemType::Event),
            LockResource::Planning => Some(ItemType::Planning),
            LockResource::Assignment => Some(ItemType::Assignment),
            LockResource::FeaturedStories => None,
        }
    }
}

impl From<ItemType> for LockResource {
    fn from(item_type: ItemType) -> Self {
        match item_type {
            ItemType::Event => LockResource::Event,
            ItemType::Planning => LockResource::Planning,
            ItemType::Assignment => LockResource::Assignment,
        }
    }
}

/// A registry entry: one per locked item known to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lock {
    pub resource: LockResource,
    /// The item that actually carries the lock on the server.
    pub item_id: ItemId,
    pub user: UserId,
    pub session: SessionId,
    pub action: Option<String>,
    pub time: Option<Timestamp>,
    /// Set when the lock covers a whole event series.
    pub recurrence_id: Option<String>,
    /// Set when a planning item lock also governs its event.
    pub event_item: Option<ItemId>,
}

impl Lock {
    /// Derive a registry entry from an item's lock fields.
    ///
    /// Returns `None` when the item is not locked.
    pub fn from_item(item: &LockableItem) -> Option<Self> {
        let user = item.lock_user.clone()?;
        let recurrence_id = match item.item_type {
            ItemType::Event if is_series_action(item.lock_action.as_deref()) => {
                item.recurrence_id.clone()
            }
            _ => None,
        };
        Some(Self {
            resource: item.item_type.into(),
            item_id: item.id.clone(),
            user,
            session: item.lock_session.clone().unwrap_or_default(),
            action: item.lock_action.clone(),
            time: item.lock_time,
            recurrence_id,
            event_item: match item.item_type {
                ItemType::Planning => item.event_item.clone(),
                _ => None,
            },
        })
    }

    /// The featured-stories singleton lock.
    pub fn featured(user: impl Into<UserId>, session: impl Into<SessionId>) -> Self {
        Self {
            resource: LockResource::FeaturedStories,
            item_id: FEATURED_STORIES_ID.to_string(),
            user: user.into(),
            session: session.into(),
            action: Some(crate::item::lock_actions::FEATURED_STORIES.to_string()),
            time: None,
            recurrence_id: None,
            event_item: None,
        }
    }
}

/// Lock actions that apply to a whole event series.
pub(crate) fn is_series_action(action: Option<&str>) -> bool {
    action.is_some_and(|a| SERIES_LOCK_ACTIONS.contains(&a))
}

// ---------------------------------------------------------------------------
// LockRegistry
// ---------------------------------------------------------------------------

/// Flat collection of locks, partitioned for lookup.
#[derive(Debug, Clone, Default)]
pub struct LockRegistry {
    events: HashMap<ItemId, Lock>,
    planning: HashMap<ItemId, Lock>,
    recurring: HashMap<String, Lock>,
    assignments: HashMap<ItemId, Lock>,
    featured: Option<Lock>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a flat list of locks.
    pub fn from_locks(locks: impl IntoIterator<Item = Lock>) -> Self {
        let mut registry = Self::new();
        for lock in locks {
            registry.insert(lock);
        }
        registry
    }

    /// Replace every entry with `locks`.
    pub fn replace_all(&mut self, locks: impl IntoIterator<Item = Lock>) {
        *self = Self::from_locks(locks);
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Record a lock, replacing any previous entry for the same item.
    pub fn insert(&mut self, lock: Lock) {
        match lock.resource {
            LockResource::Event => {
                if let Some(series) = lock.recurrence_id.clone() {
                    self.recurring.insert(series, lock.clone());
                }
                self.events.insert(lock.item_id.clone(), lock);
            }
            LockResource::Planning => {
                self.planning.insert(lock.item_id.clone(), lock);
            }
            LockResource::Assignment => {
                self.assignments.insert(lock.item_id.clone(), lock);
            }
            LockResource::FeaturedStories => self.featured = Some(lock),
        }
    }

    /// Drop the entry for an item. Returns the removed lock, if any.
    ///
    /// A series entry is dropped together with the event that carries it.
    pub fn remove(&mut self, resource: LockResource, item_id: &str) -> Option<Lock> {
        match resource {
            LockResource::Event => {
                let removed = self.events.remove(item_id);
                self.recurring.retain(|_, lock| lock.item_id != item_id);
                removed
            }
            LockResource::Planning => self.planning.remove(item_id),
            LockResource::Assignment => self.assignments.remove(item_id),
            LockResource::FeaturedStories => self.featured.take(),
        }
    }

    pub fn featured(&self) -> Option<&Lock> {
        self.featured.as_ref()
    }

    /// Entry stored for exactly this resource and id, without chain lookup.
    pub fn direct(&self, resource: LockResource, item_id: &str) -> Option<&Lock> {
        match resource {
            LockResource::Event => self.events.get(item_id),
            LockResource::Planning => self.planning.get(item_id),
            LockResource::Assignment => self.assignments.get(item_id),
            LockResource::FeaturedStories => self.featured.as_ref(),
        }
    }

    /// Resolve the lock that governs `item`, following item chains to the
    /// root lock owner.
    pub fn get_lock(&self, item: &LockableItem) -> Option<&Lock> {
        match item.item_type {
            ItemType::Event => self
                .events
                .get(&item.id)
                .or_else(|| self.series_lock(item.recurrence_id.as_deref()))
                .or_else(|| {
                    self.planning
                        .values()
                        .find(|lock| lock.event_item.as_deref() == Some(item.id.as_str()))
                }),
            ItemType::Planning => self
                .planning
                .get(&item.id)
                .or_else(|| item.event_item.as_ref().and_then(|e| self.events.get(e)))
                .or_else(|| self.series_lock(item.recurrence_id.as_deref())),
            ItemType::Assignment => self.assignments.get(&item.id).or_else(|| {
                item.planning_item
                    .as_ref()
                    .and_then(|p| self.planning.get(p))
            }),
        }
    }

    /// `true` iff a lock governs `item` and it belongs to `session`.
    pub fn is_locked_in_session(&self, item: &LockableItem, session: &str) -> bool {
        self.get_lock(item)
            .is_some_and(|lock| lock.session == session)
    }

    /// Every lock as a flat list (series entries are not duplicated).
    pub fn all(&self) -> Vec<&Lock> {
        self.events
            .values()
            .chain(self.planning.values())
            .chain(self.assignments.values())
            .chain(self.featured.iter())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.len() + self.planning.len() + self.assignments.len() + self.featured.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn series_lock(&self, recurrence_id: Option<&str>) -> Option<&Lock> {
        recurrence_id.and_then(|series| self.recurring.get(series))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::lock_actions;

    fn locked(id: &str, item_type: ItemType, session: &str, action: &str) -> LockableItem {
        let mut item = LockableItem::new(id, item_type);
        item.lock_user = Some("u1".into());
        item.lock_session = Some(session.into());
        item.lock_action = Some(action.into());
        item
    }

    // -----------------------------------------------------------------------
    // Lock::from_item
    // -----------------------------------------------------------------------

    #[test]
    fn unlocked_item_yields_no_lock() {
        assert!(Lock::from_item(&LockableItem::new("e1", ItemType::Event)).is_none());
    }

    #[test]
    fn series_action_records_recurrence_id() {
        let mut event = locked("e1", ItemType::Event, "s1", lock_actions::UPDATE_REPETITIONS);
        event.recurrence_id = Some("r1".into());

        let lock = Lock::from_item(&event).unwrap();
        assert_eq!(lock.recurrence_id.as_deref(), Some("r1"));

        event.lock_action = Some(lock_actions::EDIT.into());
        assert!(Lock::from_item(&event).unwrap().recurrence_id.is_none());
    }

    // -----------------------------------------------------------------------
    // get_lock chain resolution
    // -----------------------------------------------------------------------

    #[test]
    fn direct_lock_is_found() {
        let event = locked("e1", ItemType::Event, "s1", lock_actions::EDIT);
        let registry = LockRegistry::from_locks(Lock::from_item(&event));

        let lock = registry.get_lock(&LockableItem::new("e1", ItemType::Event)).unwrap();
        assert_eq!(lock.item_id, "e1");
        assert!(registry.get_lock(&LockableItem::new("e2", ItemType::Event)).is_none());
    }

    #[test]
    fn planning_resolves_to_event_lock() {
        let event = locked("e1", ItemType::Event, "s1", lock_actions::ADD_TO_PLANNING);
        let registry = LockRegistry::from_locks(Lock::from_item(&event));

        let mut planning = LockableItem::new("p1", ItemType::Planning);
        planning.event_item = Some("e1".into());

        let lock = registry.get_lock(&planning).unwrap();
        assert_eq!(lock.resource, LockResource::Event);
        assert_eq!(lock.item_id, "e1");
    }

    #[test]
    fn event_resolves_to_planning_lock_that_references_it() {
        let mut planning = locked("p1", ItemType::Planning, "s1", lock_actions::EDIT);
        planning.event_item = Some("e1".into());
        let registry = LockRegistry::from_locks(Lock::from_item(&planning));

        let lock = registry.get_lock(&LockableItem::new("e1", ItemType::Event)).unwrap();
        assert_eq!(lock.resource, LockResource::Planning);
        assert_eq!(lock.item_id, "p1");
    }

    #[test]
    fn occurrence_resolves_to_series_lock() {
        let mut event = locked("e1", ItemType::Event, "s1", lock_actions::CONVERT_RECURRING);
        event.recurrence_id = Some("r1".into());
        let registry = LockRegistry::from_locks(Lock::from_item(&event));

        let mut sibling = LockableItem::new("e2", ItemType::Event);
        sibling.recurrence_id = Some("r1".into());

        assert_eq!(registry.get_lock(&sibling).unwrap().item_id, "e1");
    }

    #[test]
    fn assignment_resolves_to_root_planning_lock() {
        let planning = locked("p1", ItemType::Planning, "s1", lock_actions::EDIT);
        let registry = LockRegistry::from_locks(Lock::from_item(&planning));

        let mut assignment = LockableItem::new("a1", ItemType::Assignment);
        assignment.planning_item = Some("p1".into());

        assert_eq!(registry.get_lock(&assignment).unwrap().item_id, "p1");
    }

    // -----------------------------------------------------------------------
    // Session checks
    // -----------------------------------------------------------------------

    #[test]
    fn locked_in_session_matches_get_lock() {
        let event = locked("e1", ItemType::Event, "s1", lock_actions::EDIT);
        let registry = LockRegistry::from_locks(Lock::from_item(&event));
        let held = LockableItem::new("e1", ItemType::Event);
        let unlocked = LockableItem::new("e9", ItemType::Event);

        for session in ["s1", "s2"] {
            for item in [&held, &unlocked] {
                let expected = registry
                    .get_lock(item)
                    .is_some_and(|lock| lock.session == session);
                assert_eq!(registry.is_locked_in_session(item, session), expected);
            }
        }
        assert!(registry.is_locked_in_session(&held, "s1"));
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    #[test]
    fn removing_series_owner_drops_series_entry() {
        let mut event = locked("e1", ItemType::Event, "s1", lock_actions::CANCEL_EVENT);
        event.recurrence_id = Some("r1".into());
        let mut registry = LockRegistry::from_locks(Lock::from_item(&event));

        registry.remove(LockResource::Event, "e1");

        let mut sibling = LockableItem::new("e2", ItemType::Event);
        sibling.recurrence_id = Some("r1".into());
        assert!(registry.get_lock(&sibling).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn replace_all_drops_previous_entries() {
        let mut registry = LockRegistry::from_locks(Lock::from_item(&locked(
            "e1",
            ItemType::Event,
            "s1",
            lock_actions::EDIT,
        )));

        registry.replace_all(vec![Lock::featured("u2", "s2")]);

        assert_eq!(registry.len(), 1);
        assert!(registry.featured().is_some());
        assert!(registry.direct(LockResource::Event, "e1").is_none());
    }
}
