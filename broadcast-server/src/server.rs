use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocket, Query, State, WebSocketUpgrade},
    response::Response,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, select, time::timeout};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    config::{ServerConfig, SessionConfig, DEFAULT_USERNAME},
    connection::split_websocket,
    hub::{Hub, HubHandle},
    service::BroadcastService,
    session::Session,
};

pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
    hub: Hub,
    hub_handle: HubHandle,
    service: BroadcastService,
}

impl Server {
    pub fn new(listener: TcpListener, config: ServerConfig) -> Self {
        let (hub, hub_handle) = Hub::new(&config.hub);
        let service = BroadcastService::new(Arc::new(hub_handle.clone()));
        Self {
            listener,
            config,
            hub,
            hub_handle,
            service,
        }
    }

    /// Binds the configured address. Failing here is the only fatal server error.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let addr = SocketAddr::new(config.host, config.port);
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        Ok(Self::new(listener, config))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The facade connections use; handy for observing the hub from outside.
    pub fn service(&self) -> BroadcastService {
        self.service.clone()
    }

    /// Serves until `shutdown` resolves, then stops accepting connections,
    /// closes every session and waits up to the grace period for them to finish.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            config,
            hub,
            hub_handle,
            service,
        } = self;
        tokio::pin!(shutdown);

        let hub_task = tokio::spawn(hub.run());
        let tracker = TaskTracker::new();
        let app = router(AppState {
            service,
            session: config.session.clone(),
            tracker: tracker.clone(),
        });

        let stop_accepting = CancellationToken::new();
        let serve = axum::serve(listener, app)
            .with_graceful_shutdown(stop_accepting.clone().cancelled_owned());
        let mut serve_task = tokio::spawn(async move { serve.await });

        select! {
            () = &mut shutdown => info!("server shutting down"),
            joined = &mut serve_task => {
                hub_handle.shutdown();
                joined
                    .context("server task panicked")?
                    .context("server stopped unexpectedly")?;
                return Ok(());
            }
        }

        stop_accepting.cancel();
        hub_handle.shutdown();
        tracker.close();

        let grace = config.shutdown_grace;
        let drained = timeout(grace, async {
            tracker.wait().await;
            let _ = hub_task.await;
            let _ = serve_task.await;
        })
        .await;
        if drained.is_err() {
            warn!(?grace, "grace period elapsed before every session finished");
        }

        info!("server stopped");
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }
}

/// Resolves on ctrl-c, or on SIGTERM where available.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = ?err, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = ?err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

#[derive(Clone)]
struct AppState {
    service: BroadcastService,
    session: SessionConfig,
    tracker: TaskTracker,
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    username: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthResponse {
    pub status: String,
    pub clients: usize,
}

/// GET /ws?username=<name>
async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let username = params
        .username
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_USERNAME.to_string());

    ws.max_message_size(state.session.max_message_size)
        .on_upgrade(move |socket| accept_session(socket, username, state))
}

async fn accept_session(socket: WebSocket, username: String, state: AppState) {
    let (sink, stream) = split_websocket(socket);
    let session = Session::new(username, sink, stream, state.session.clone());
    let handle = session.handle();

    if let Err(err) = state.service.register_client(Arc::clone(&handle)).await {
        warn!(identity = handle.identity(), error = %err, "rejecting connection");
        return;
    }

    info!(session_id = %handle.id(), identity = handle.identity(), "new connection");
    session.spawn(&state.tracker, state.service);
}

/// GET /health
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        clients: state.service.client_count(),
    })
}
