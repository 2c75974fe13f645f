//! Client-side engine for collaborative planning: item locking, autosave
//! drafts, and reconciliation of open editors with push notifications from
//! other sessions.

pub mod autosave;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod reconciler;

pub use engine::PlanningSync;
pub use error::SyncError;
