use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::schema::Settings;
use crate::dispatch::Dispatcher;
use crate::engine;
use crate::error::Result;
use crate::rpc::{self, AppState};
use crate::session::SessionRegistry;
use crate::status::StatusBroadcaster;
use crate::store::ConfigStore;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Run the castdeckd daemon.
///
/// # Errors
/// Returns `CastError` if the store cannot be opened or the listener
/// cannot bind; subsystem failures after startup are logged, not fatal.
pub async fn run(settings: Settings) -> Result<()> {
    let cancel = CancellationToken::new();

    let store = Arc::new(ConfigStore::open(settings.store.path.clone())?);
    info!(
        "configuration store ready: {} configurations, current '{}'",
        store.count(),
        store.current_id()
    );

    let (engine, engine_task) = engine::spawn(&settings.engine, cancel.clone());

    let registry = Arc::new(SessionRegistry::new(
        settings.sessions.queue_capacity,
        settings.sessions.failure_threshold,
    ));
    let broadcaster = Arc::new(StatusBroadcaster::new(Arc::clone(&registry)));
    let broadcaster_task = tokio::spawn(Arc::clone(&broadcaster).run(
        engine.watch_state(),
        engine.watch_status(),
        cancel.clone(),
    ));

    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        engine.clone(),
        settings.engine.action_timeout(),
    );
    let state = Arc::new(AppState {
        store,
        dispatcher,
        engine,
        registry,
        broadcaster,
    });

    let listener = TcpListener::bind(&settings.server.bind).await?;
    info!("castdeckd listening on {}", settings.server.bind);
    let rpc_task = spawn_rpc(listener, Arc::clone(&state), &cancel);

    tokio::select! {
        () = cancel.cancelled() => {}
        () = async { tokio::signal::ctrl_c().await.ok(); } => {
            info!("received SIGINT, shutting down");
            cancel.cancel();
        }
    }

    info!("daemon shutting down...");
    cancel.cancel();

    let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
        let _ = rpc_task.await;
        let _ = broadcaster_task.await;
        let _ = engine_task.await;
    })
    .await;

    info!("daemon stopped");
    Ok(())
}

fn spawn_rpc(
    listener: TcpListener,
    state: Arc<AppState>,
    cancel: &CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let rpc_cancel = cancel.clone();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = rpc::serve(listener, state, rpc_cancel).await {
            error!("rpc server error: {e}");
            // The daemon is useless without its API; take everything down.
            shutdown.cancel();
        }
    })
}
