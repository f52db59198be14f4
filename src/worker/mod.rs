//! Worker-side protocol driver.
//!
//! Resolves the coordinator (configured address or UDP discovery), keeps a
//! WebSocket connection alive per the reconnect policy, and drives the
//! pull / setup / execute / report loop. All events on a connection are
//! handled one at a time: a second task setup never starts before the
//! previous task's full report sequence has been sent.

pub mod executor;
pub mod setup;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::{PullMode, ReconnectPolicy, WorkerConfig};
use crate::discovery;
use crate::error::{HiveError, Result};
use crate::protocol::{CoordinatorEvent, InstallStatus, Task, TaskResult, WorkerEvent};

pub use executor::{ExecutionResult, TaskExecutor};
pub use setup::Workspace;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Why a connection ended.
enum ConnEnd {
    /// Transport closed; reconnect per policy.
    Disconnected,
    /// The coordinator said `noMoreTasks` (batch mode); the driver is done.
    Finished,
}

pub struct WorkerDriver {
    config: WorkerConfig,
    workspace: Workspace,
    executor: TaskExecutor,
}

impl WorkerDriver {
    pub fn new(config: WorkerConfig) -> Self {
        let workspace = Workspace::new(config.work_dir.clone());
        let executor = TaskExecutor::new(config.exec.clone());
        Self {
            config,
            workspace,
            executor,
        }
    }

    /// Run until the batch is exhausted (batch mode) or the reconnect
    /// policy gives up. Dynamic-mode drivers otherwise run forever.
    pub async fn run(&self) -> Result<()> {
        let url = self.resolve_url().await?;
        let mut failures: u32 = 0;

        loop {
            match connect_async(url.as_str()).await {
                Ok((ws, _response)) => {
                    tracing::info!(url = %url, "Connected to coordinator");
                    failures = 0;
                    match self.serve_connection(ws).await {
                        Ok(ConnEnd::Finished) => return Ok(()),
                        Ok(ConnEnd::Disconnected) => {
                            tracing::warn!("Lost connection to coordinator");
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Connection error");
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(url = %url, attempt = failures, error = %e, "Connect failed");
                }
            }

            match &self.config.reconnect {
                ReconnectPolicy::Bounded { attempts, delay } => {
                    if failures >= *attempts {
                        return Err(HiveError::ConnectExhausted(*attempts));
                    }
                    tokio::time::sleep(*delay).await;
                }
                ReconnectPolicy::Fixed { delay } => {
                    tokio::time::sleep(*delay).await;
                }
            }
        }
    }

    /// Configured address wins; otherwise broadcast a discovery query.
    /// Failure here is fatal to startup.
    async fn resolve_url(&self) -> Result<String> {
        if let Some(url) = &self.config.coordinator_url {
            return Ok(url.clone());
        }
        tracing::info!(
            service_type = %self.config.service_type,
            port = self.config.discovery_port,
            "Discovering coordinator"
        );
        let url = discovery::discover(
            &self.config.service_type,
            self.config.discovery_port,
            self.config.discovery_timeout,
        )
        .await?;
        tracing::info!(url = %url, "Coordinator discovered");
        Ok(url)
    }

    async fn serve_connection(&self, mut ws: WsStream) -> Result<ConnEnd> {
        self.announce(&mut ws).await?;
        match self.config.pull_mode {
            PullMode::Dynamic => self.send(&mut ws, &WorkerEvent::RequestTask).await?,
            PullMode::Batch => self.send(&mut ws, &WorkerEvent::RequestTasks).await?,
        }

        while let Some(message) = ws.next().await {
            match message? {
                Message::Text(text) => match serde_json::from_str::<CoordinatorEvent>(&text) {
                    Ok(event) => {
                        if let Some(end) = self.handle_event(&mut ws, event).await? {
                            return Ok(end);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Unparseable coordinator event");
                    }
                },
                Message::Ping(data) => ws.send(Message::Pong(data)).await?,
                Message::Close(_) => break,
                _ => {}
            }
        }
        Ok(ConnEnd::Disconnected)
    }

    async fn announce(&self, ws: &mut WsStream) -> Result<()> {
        self.send(
            ws,
            &WorkerEvent::RegisterCapabilities {
                task_types: self.config.task_types.clone(),
            },
        )
        .await?;
        self.send(
            ws,
            &WorkerEvent::NotifyReady {
                task_types: self.config.task_types.clone(),
            },
        )
        .await
    }

    async fn handle_event(
        &self,
        ws: &mut WsStream,
        event: CoordinatorEvent,
    ) -> Result<Option<ConnEnd>> {
        match event {
            CoordinatorEvent::AssignTask { task } => {
                self.run_assigned_task(ws, task).await?;
                self.send(ws, &WorkerEvent::RequestTask).await?;
                Ok(None)
            }
            CoordinatorEvent::NoTask { message } => {
                tracing::debug!(message = %message, "No task available, backing off");
                tokio::time::sleep(self.config.no_task_backoff).await;
                self.send(
                    ws,
                    &WorkerEvent::NotifyReady {
                        task_types: self.config.task_types.clone(),
                    },
                )
                .await?;
                self.send(ws, &WorkerEvent::RequestTask).await?;
                Ok(None)
            }
            CoordinatorEvent::ProvideTasks { tasks } => {
                tracing::info!(count = tasks.len(), "Received task batch");
                let mut results = Vec::with_capacity(tasks.len());
                for task in tasks {
                    results.push(self.run_batch_task(task).await);
                }
                self.send(ws, &WorkerEvent::TaskResults { results }).await?;
                self.send(ws, &WorkerEvent::RequestTasks).await?;
                Ok(None)
            }
            CoordinatorEvent::NoMoreTasks => {
                tracing::info!("Batch exhausted, worker done");
                Ok(Some(ConnEnd::Finished))
            }
        }
    }

    /// Dynamic-protocol task: setup, report installation, execute, report
    /// completion. Setup failure is self-reported; execution failure is
    /// captured into the result, never raised.
    async fn run_assigned_task(&self, ws: &mut WsStream, task: Task) -> Result<()> {
        tracing::info!(task_id = %task.task_id, task_type = %task.task_type, "Task assigned");

        match self.workspace.prepare(&task).await {
            Err(e) => {
                let error = e.to_string();
                tracing::warn!(task_id = %task.task_id, error = %error, "Setup failed");
                self.send(
                    ws,
                    &WorkerEvent::InstallationStatus {
                        task_id: task.task_id.clone(),
                        status: InstallStatus::Failure,
                        error: Some(error.clone()),
                    },
                )
                .await?;
                self.send(
                    ws,
                    &WorkerEvent::TaskCompleted {
                        task_id: task.task_id,
                        result: json!({ "error": error }),
                    },
                )
                .await
            }
            Ok(prepared) => {
                self.send(
                    ws,
                    &WorkerEvent::InstallationStatus {
                        task_id: task.task_id.clone(),
                        status: InstallStatus::Success,
                        error: None,
                    },
                )
                .await?;
                let result = self.executor.execute(&task, &prepared.dir).await;
                self.send(
                    ws,
                    &WorkerEvent::TaskCompleted {
                        task_id: task.task_id,
                        result: result.to_value(),
                    },
                )
                .await
            }
        }
    }

    /// Batch-protocol task: no installation reports, errors go into the
    /// collected result.
    async fn run_batch_task(&self, task: Task) -> TaskResult {
        let task_id = task.task_id.clone();
        match self.workspace.prepare(&task).await {
            Err(e) => TaskResult {
                task_id,
                result: json!({ "error": e.to_string() }),
            },
            Ok(prepared) => {
                let result = self.executor.execute(&task, &prepared.dir).await;
                TaskResult {
                    task_id,
                    result: result.to_value(),
                }
            }
        }
    }

    async fn send(&self, ws: &mut WsStream, event: &WorkerEvent) -> Result<()> {
        let json = serde_json::to_string(event)?;
        ws.send(Message::Text(json.into())).await?;
        Ok(())
    }
}
