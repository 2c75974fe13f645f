//! `planning-sync` -- headless collaborative planning client.
//!
//! Loads the current locks and this user's autosave drafts, then keeps the
//! local lock registry and item cache in step with the planning server's
//! push channel. Client events are written to the log.
//!
//! # Environment variables
//!
//! | Variable               | Required | Default     | Description                      |
//! |------------------------|----------|-------------|----------------------------------|
//! | `PLANNING_API_URL`     | yes      | --          | REST base, e.g. `http://host:5000/api` |
//! | `PLANNING_WS_URL`      | yes      | --          | Push channel, e.g. `ws://host:5100` |
//! | `PLANNING_USER_ID`     | yes      | --          | User the client acts as          |
//! | `PLANNING_SESSION_ID`  | no       | UUID v4     | Session id of this client        |
//! | `PLANNING_AUTH_TOKEN`  | no       | --          | Bearer token for REST calls      |
//! | `AUTOSAVE_DEBOUNCE_MS` | no       | `1500`      | Delay before a draft is written  |
//! | `REQUEST_TIMEOUT_SECS` | no       | `30`        | HTTP request timeout             |

use std::sync::Arc;

use planning_backend::{Backend, PlanningApi};
use planning_core::item::ItemType;
use planning_realtime::{run_push_channel, PushClient, ReconnectConfig};
use planning_sync::config::SyncConfig;
use planning_sync::PlanningSync;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "planning_sync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = SyncConfig::from_env().unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    });

    tracing::info!(
        api_url = %config.api_url,
        ws_url = %config.ws_url,
        user = %config.user_id,
        session = %config.session_id,
        "Starting planning-sync",
    );

    let backend: Arc<dyn Backend> = Arc::new(PlanningApi::new(
        config.api_url.clone(),
        config.auth_token.clone(),
        config.request_timeout,
    ));
    let engine = PlanningSync::start(backend, config.identity(), config.autosave_debounce).await;
    let mut events = engine.context.subscribe();

    if let Err(e) = engine.coordinator.load_all_locks().await {
        tracing::error!(error = %e, "Initial lock load failed, waiting for reconnect");
    }
    for item_type in [ItemType::Event, ItemType::Planning] {
        match engine.autosaves.fetch(item_type).await {
            Ok(drafts) => tracing::info!(%item_type, count = drafts.len(), "Autosaves loaded"),
            Err(e) => tracing::error!(%item_type, error = %e, "Autosave load failed"),
        }
    }

    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::unbounded_channel();

    let push_task = {
        let cancel = cancel.clone();
        let client = PushClient::new(config.ws_url.clone(), config.session_id.clone());
        tokio::spawn(async move {
            run_push_channel(&client, &ReconnectConfig::default(), &tx, &cancel).await;
        })
    };
    let dispatch_task = {
        let cancel = cancel.clone();
        let dispatcher = Arc::clone(&engine.dispatcher);
        tokio::spawn(async move { dispatcher.run(rx, cancel).await })
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown requested");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => tracing::info!(?event, "Sync event"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Sync event log lagging");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    cancel.cancel();
    let _ = push_task.await;
    let _ = dispatch_task.await;
    engine.context.reset().await;
    tracing::info!("planning-sync stopped");
}
