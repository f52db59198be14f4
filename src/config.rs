use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the coordinator process.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Address the WebSocket + HTTP listener binds to.
    pub listen_addr: SocketAddr,
    /// Service type announced to discovery queries.
    pub service_type: String,
    /// UDP port for the discovery responder. `None` disables discovery.
    pub discovery_port: Option<u16>,
    /// Address advertised in discovery answers. Defaults to `listen_addr`,
    /// which is wrong when binding to 0.0.0.0 - set this explicitly then.
    pub advertise_addr: Option<String>,
    /// Watchdog: re-queue `installed` tasks that have not reported back
    /// within this window. `None` means only disconnects reclaim tasks.
    pub reclaim_after: Option<Duration>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7400"
                .parse()
                .expect("default listen address is valid"),
            service_type: "taskhive".to_string(),
            discovery_port: None,
            advertise_addr: None,
            reclaim_after: None,
        }
    }
}

/// How a worker retries a lost or failed coordinator connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Give up after `attempts` consecutive failures.
    Bounded { attempts: u32, delay: Duration },
    /// Retry forever with a fixed delay.
    Fixed { delay: Duration },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Bounded {
            attempts: 5,
            delay: Duration::from_secs(1),
        }
    }
}

/// How the worker pulls work from the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PullMode {
    /// One task at a time via `requestTask` / `assignTask`.
    #[default]
    Dynamic,
    /// Whole remaining batch via `requestTasks` / `provideTasks`.
    Batch,
}

/// Execute-phase settings.
#[derive(Debug, Clone)]
pub struct ExecConfig {
    /// Interpreter the entry point is passed to.
    pub interpreter: String,
    /// Timeout applied when the task payload does not carry one.
    pub default_timeout: Duration,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            interpreter: "sh".to_string(),
            default_timeout: Duration::from_secs(30),
        }
    }
}

/// Configuration for a worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Coordinator WebSocket URL. When `None`, the worker discovers one.
    pub coordinator_url: Option<String>,
    /// Service type used for discovery queries.
    pub service_type: String,
    /// UDP port discovery queries are broadcast to.
    pub discovery_port: u16,
    /// How long to wait for a discovery answer before failing startup.
    pub discovery_timeout: Duration,
    /// Capabilities announced to the coordinator.
    pub task_types: Vec<String>,
    /// Root directory task workspaces are materialized under.
    pub work_dir: PathBuf,
    /// Wait after a `noTask` reply before re-announcing and asking again.
    pub no_task_backoff: Duration,
    pub reconnect: ReconnectPolicy,
    pub pull_mode: PullMode,
    pub exec: ExecConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            coordinator_url: None,
            service_type: "taskhive".to_string(),
            discovery_port: 7401,
            discovery_timeout: Duration::from_secs(5),
            task_types: Vec::new(),
            work_dir: PathBuf::from("taskhive-work"),
            no_task_backoff: Duration::from_secs(2),
            reconnect: ReconnectPolicy::default(),
            pull_mode: PullMode::default(),
            exec: ExecConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_coordinator(mut self, url: impl Into<String>) -> Self {
        self.coordinator_url = Some(url.into());
        self
    }

    pub fn with_task_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.task_types = types.into_iter().map(Into::into).collect();
        self
    }
}
