//! Coordinator process: one axum listener serving the worker WebSocket
//! endpoint and the REST ingestion/inspection API.

pub mod engine;
pub mod http;
pub mod registry;
pub mod store;

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::config::CoordinatorConfig;
use crate::discovery::DiscoveryResponder;
use crate::error::Result;
use crate::protocol::WorkerEvent;

pub use engine::{AssignmentEngine, LoggingSink, ResultSink, TaskSource};

pub struct Coordinator {
    config: CoordinatorConfig,
    engine: Arc<AssignmentEngine>,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        sink: Arc<dyn ResultSink>,
        source: Option<Arc<dyn TaskSource>>,
    ) -> Self {
        Self {
            config,
            engine: Arc::new(AssignmentEngine::new(sink, source)),
        }
    }

    pub fn engine(&self) -> Arc<AssignmentEngine> {
        self.engine.clone()
    }

    /// Build the router serving `/ws` plus the REST API.
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(http::health))
            .route("/api/tasks", post(http::add_task).get(http::list_tasks))
            .route("/api/tasks/batch", post(http::add_tasks))
            .route("/api/tasks/{id}", get(http::task_status))
            .layer(cors)
            .with_state(self.engine.clone())
    }

    /// Run the coordinator until the shutdown token fires. Spawns the
    /// discovery responder and the watchdog sweep when configured.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        if let Some(port) = self.config.discovery_port {
            let advertise = self
                .config
                .advertise_addr
                .clone()
                .unwrap_or_else(|| self.config.listen_addr.to_string());
            let responder = DiscoveryResponder::bind(
                port,
                self.config.service_type.clone(),
                format!("ws://{}/ws", advertise),
            )
            .await?;
            let token = shutdown.clone();
            tokio::spawn(async move {
                responder.run(token).await;
            });
        }

        if let Some(max_age) = self.config.reclaim_after {
            let engine = self.engine.clone();
            let token = shutdown.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(max_age);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = interval.tick() => {
                            let reclaimed = engine.reclaim_stale(max_age).await;
                            if reclaimed > 0 {
                                tracing::info!(reclaimed, "Watchdog re-queued stale tasks");
                            }
                        }
                    }
                }
            });
        }

        let listener = tokio::net::TcpListener::bind(self.config.listen_addr).await?;
        tracing::info!(addr = %self.config.listen_addr, "Coordinator listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(engine): State<Arc<AssignmentEngine>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, engine))
}

/// Per-connection loop. Events are read and dispatched one at a time, which
/// gives the required per-connection serialization: a worker never has two
/// of its events processed concurrently.
async fn handle_socket(mut socket: WebSocket, engine: Arc<AssignmentEngine>) {
    let worker_id = Uuid::new_v4();
    engine.connect(worker_id).await;

    'conn: while let Some(msg) = socket.recv().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<WorkerEvent>(&text) {
                Ok(event) => {
                    for reply in engine.handle_event(worker_id, event).await {
                        let json = match serde_json::to_string(&reply) {
                            Ok(json) => json,
                            Err(e) => {
                                tracing::error!(error = %e, "Failed to encode reply");
                                continue;
                            }
                        };
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            tracing::debug!(worker_id = %worker_id, "Send failed, worker gone");
                            break 'conn;
                        }
                    }
                }
                Err(e) => {
                    // A malformed report must never take the coordinator down.
                    tracing::warn!(worker_id = %worker_id, error = %e, "Unparseable worker event");
                }
            },
            Ok(Message::Ping(data)) => {
                if socket.send(Message::Pong(data)).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(worker_id = %worker_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    engine.disconnect(worker_id).await;
}
