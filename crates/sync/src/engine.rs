//! One fully wired sync engine for a user session.

use std::sync::Arc;
use std::time::Duration;

use planning_backend::Backend;
use planning_core::types::SessionIdentity;

use crate::autosave::AutosaveStore;
use crate::context::PlanningContext;
use crate::coordinator::LockCoordinator;
use crate::dispatcher::NotificationDispatcher;
use crate::reconciler::EditReconciler;

/// The components of the sync engine, sharing one [`PlanningContext`].
#[derive(Clone)]
pub struct PlanningSync {
    pub context: Arc<PlanningContext>,
    pub coordinator: Arc<LockCoordinator>,
    pub autosaves: Arc<AutosaveStore>,
    pub reconciler: Arc<EditReconciler>,
    pub dispatcher: Arc<NotificationDispatcher>,
}

impl PlanningSync {
    /// Build the components and initialize the context for `identity`.
    ///
    /// Nothing is loaded from the server yet; call
    /// [`LockCoordinator::load_all_locks`] and [`AutosaveStore::fetch`] next.
    pub async fn start(
        backend: Arc<dyn Backend>,
        identity: SessionIdentity,
        autosave_debounce: Duration,
    ) -> Self {
        let context = PlanningContext::new(backend);
        context.init(identity).await;

        let coordinator = Arc::new(LockCoordinator::new(Arc::clone(&context)));
        let autosaves = Arc::new(AutosaveStore::new(Arc::clone(&context)));
        let reconciler = Arc::new(EditReconciler::new(
            Arc::clone(&context),
            Arc::clone(&coordinator),
            Arc::clone(&autosaves),
            autosave_debounce,
        ));
        let dispatcher = Arc::new(NotificationDispatcher::new(
            Arc::clone(&context),
            Arc::clone(&coordinator),
            Arc::clone(&reconciler),
        ));

        Self {
            context,
            coordinator,
            autosaves,
            reconciler,
            dispatcher,
        }
    }
}
