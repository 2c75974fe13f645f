//! Planning server REST collaborator.
//!
//! Provides the [`Backend`] trait the sync engine talks to, the
//! reqwest-based [`PlanningApi`] implementation, and (behind the `testing`
//! feature) an in-memory server for tests.

pub mod api;
pub mod backend;
pub mod error;
#[cfg(any(test, feature = "testing"))]
pub mod memory;

pub use api::PlanningApi;
pub use backend::Backend;
pub use error::{extract_error_message, BackendError};
