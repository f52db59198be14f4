//! Worker-side tests: workspace setup with hash-based skipping, task
//! execution, and a full driver run against a live coordinator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::time::timeout;

use taskhive::config::{CoordinatorConfig, ExecConfig, PullMode, ReconnectPolicy, WorkerConfig};
use taskhive::coordinator::{AssignmentEngine, Coordinator, ResultSink};
use taskhive::protocol::{Task, TaskPayload, TaskResult, TaskState};
use taskhive::worker::{TaskExecutor, WorkerDriver, Workspace};
use taskhive::HiveError;

const TEST_TIMEOUT: Duration = Duration::from_secs(20);

fn shell_task(id: &str, script: &str) -> Task {
    let mut files = HashMap::new();
    files.insert("entry.sh".to_string(), script.to_string());
    Task::new(id, "shell").with_payload(TaskPayload {
        entry_point: "entry.sh".to_string(),
        files,
        ..TaskPayload::default()
    })
}

// ── Setup phase ──────────────────────────────────────────────────────────

#[tokio::test]
async fn setup_runs_once_per_fileset() {
    let tmp = tempfile::tempdir().unwrap();
    let workspace = Workspace::new(tmp.path());

    let mut task = shell_task("s1", "echo hi");
    task.payload.setup_commands = vec!["echo ran >> setup.log".to_string()];

    let first = workspace.prepare(&task).await.unwrap();
    assert!(!first.setup_skipped);
    assert_eq!(
        std::fs::read_to_string(first.dir.join("entry.sh")).unwrap(),
        "echo hi"
    );

    // Same fileset again: files rewritten, setup skipped.
    let second = workspace.prepare(&task).await.unwrap();
    assert!(second.setup_skipped);
    assert_eq!(
        std::fs::read_to_string(second.dir.join("setup.log")).unwrap(),
        "ran\n"
    );
}

#[tokio::test]
async fn changed_fileset_reruns_setup() {
    let tmp = tempfile::tempdir().unwrap();
    let workspace = Workspace::new(tmp.path());

    let mut task = shell_task("s2", "echo one");
    task.payload.setup_commands = vec!["echo ran >> setup.log".to_string()];
    let prepared = workspace.prepare(&task).await.unwrap();
    assert!(!prepared.setup_skipped);

    task.payload
        .files
        .insert("entry.sh".to_string(), "echo two".to_string());
    let prepared = workspace.prepare(&task).await.unwrap();
    assert!(!prepared.setup_skipped);
    assert_eq!(
        std::fs::read_to_string(prepared.dir.join("setup.log")).unwrap(),
        "ran\nran\n"
    );
}

#[tokio::test]
async fn failing_setup_command_is_an_error() {
    let tmp = tempfile::tempdir().unwrap();
    let workspace = Workspace::new(tmp.path());

    let mut task = shell_task("s3", "echo hi");
    task.payload.setup_commands = vec!["echo broken >&2; exit 3".to_string()];

    match workspace.prepare(&task).await {
        Err(HiveError::Setup(detail)) => assert!(detail.contains("broken")),
        other => panic!("expected setup error, got {other:?}"),
    }

    // No marker was written, so the next attempt runs setup again.
    task.payload.setup_commands = vec!["true".to_string()];
    let prepared = workspace.prepare(&task).await.unwrap();
    assert!(!prepared.setup_skipped);
}

#[tokio::test]
async fn traversal_in_file_names_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let workspace = Workspace::new(tmp.path());

    let mut task = shell_task("s4", "echo hi");
    task.payload
        .files
        .insert("../escape.sh".to_string(), "echo evil".to_string());

    assert!(matches!(
        workspace.prepare(&task).await,
        Err(HiveError::InvalidFilePath(_))
    ));
    assert!(!tmp.path().join("escape.sh").exists());
}

// ── Execute phase ────────────────────────────────────────────────────────

#[tokio::test]
async fn executor_captures_output_and_exit_code() {
    let tmp = tempfile::tempdir().unwrap();
    let workspace = Workspace::new(tmp.path());
    let executor = TaskExecutor::new(ExecConfig::default());

    let task = shell_task("e1", "echo out; echo err >&2");
    let prepared = workspace.prepare(&task).await.unwrap();
    let result = executor.execute(&task, &prepared.dir).await;

    assert!(result.ok());
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.stdout, "out\n");
    assert_eq!(result.stderr, "err\n");
    assert_eq!(result.to_value()["ok"], json!(true));
}

#[tokio::test]
async fn executor_sees_env_and_args() {
    let tmp = tempfile::tempdir().unwrap();
    let workspace = Workspace::new(tmp.path());
    let executor = TaskExecutor::new(ExecConfig::default());

    let mut task = shell_task("e2", "echo \"$GREETING $1\"");
    task.payload
        .env
        .insert("GREETING".to_string(), "hello".to_string());
    task.payload.args = vec!["world".to_string()];

    let prepared = workspace.prepare(&task).await.unwrap();
    let result = executor.execute(&task, &prepared.dir).await;
    assert_eq!(result.stdout, "hello world\n");
}

#[tokio::test]
async fn executor_reports_nonzero_exit() {
    let tmp = tempfile::tempdir().unwrap();
    let workspace = Workspace::new(tmp.path());
    let executor = TaskExecutor::new(ExecConfig::default());

    let task = shell_task("e3", "exit 4");
    let prepared = workspace.prepare(&task).await.unwrap();
    let result = executor.execute(&task, &prepared.dir).await;

    assert!(!result.ok());
    assert_eq!(result.exit_code, Some(4));
    assert!(!result.timed_out);
}

#[tokio::test]
async fn executor_enforces_timeout() {
    let tmp = tempfile::tempdir().unwrap();
    let workspace = Workspace::new(tmp.path());
    let executor = TaskExecutor::new(ExecConfig::default());

    let mut task = shell_task("e4", "sleep 5");
    task.payload.timeout_ms = Some(200);

    let prepared = workspace.prepare(&task).await.unwrap();
    let result = executor.execute(&task, &prepared.dir).await;

    assert!(result.timed_out);
    assert!(!result.ok());
    assert!(result.duration < Duration::from_secs(4));
    assert_eq!(result.to_value()["timedOut"], json!(true));
}

// ── Driver against a live coordinator ────────────────────────────────────

struct RecordingSink {
    deliveries: Mutex<Vec<TaskResult>>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            deliveries: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ResultSink for RecordingSink {
    async fn handle_results(&self, results: Vec<TaskResult>) {
        self.deliveries.lock().await.extend(results);
    }
}

async fn start_coordinator(sink: Arc<dyn ResultSink>) -> (u16, Arc<AssignmentEngine>) {
    let coordinator = Coordinator::new(CoordinatorConfig::default(), sink, None);
    let engine = coordinator.engine();
    let app = coordinator.router();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    (port, engine)
}

fn driver_config(port: u16, work_dir: &std::path::Path) -> WorkerConfig {
    let mut config = WorkerConfig::default()
        .with_coordinator(format!("ws://127.0.0.1:{port}/ws"))
        .with_task_types(["shell"]);
    config.work_dir = work_dir.to_path_buf();
    config.no_task_backoff = Duration::from_millis(100);
    config.reconnect = ReconnectPolicy::Bounded {
        attempts: 3,
        delay: Duration::from_millis(100),
    };
    config
}

async fn wait_for_state(engine: &AssignmentEngine, task_id: &str, state: TaskState) {
    for _ in 0..200 {
        if engine.task_status(task_id).await.map(|s| s.state) == Some(state) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("task {task_id} never reached state {state}");
}

#[tokio::test]
async fn driver_completes_a_task_end_to_end() {
    timeout(TEST_TIMEOUT, async {
        let sink = RecordingSink::new();
        let (port, engine) = start_coordinator(sink.clone()).await;
        engine.enqueue(shell_task("e2e-1", "echo done")).await;

        let tmp = tempfile::tempdir().unwrap();
        let driver = WorkerDriver::new(driver_config(port, tmp.path()));
        let handle = tokio::spawn(async move { driver.run().await });

        wait_for_state(&engine, "e2e-1", TaskState::Completed).await;
        handle.abort();

        let delivered = sink.deliveries.lock().await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].task_id, "e2e-1");
        assert_eq!(delivered[0].result["ok"], json!(true));
        assert_eq!(delivered[0].result["stdout"], json!("done\n"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn driver_reports_setup_failure() {
    timeout(TEST_TIMEOUT, async {
        let sink = RecordingSink::new();
        let (port, engine) = start_coordinator(sink.clone()).await;

        let mut task = shell_task("e2e-2", "echo never");
        task.payload.setup_commands = vec!["exit 1".to_string()];
        engine.enqueue(task).await;

        let tmp = tempfile::tempdir().unwrap();
        let driver = WorkerDriver::new(driver_config(port, tmp.path()));
        let handle = tokio::spawn(async move { driver.run().await });

        // The worker self-reports the failed setup and completes the task
        // with an error payload; the handled-set keeps later retries of the
        // re-queued task from reaching the sink twice.
        loop {
            if !sink.deliveries.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        handle.abort();

        let delivered = sink.deliveries.lock().await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].task_id, "e2e-2");
        assert!(delivered[0].result["error"].as_str().is_some());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn batch_driver_runs_to_completion() {
    timeout(TEST_TIMEOUT, async {
        let sink = RecordingSink::new();
        let (port, engine) = start_coordinator(sink.clone()).await;
        engine
            .seed_batch(vec![
                shell_task("batch-1", "echo one"),
                shell_task("batch-2", "echo two"),
            ])
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let mut config = driver_config(port, tmp.path());
        config.pull_mode = PullMode::Batch;
        let driver = WorkerDriver::new(config);

        // Batch mode terminates on noMoreTasks, so run() returns.
        driver.run().await.unwrap();

        wait_for_state(&engine, "batch-1", TaskState::Completed).await;
        wait_for_state(&engine, "batch-2", TaskState::Completed).await;

        let delivered = sink.deliveries.lock().await;
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].result["stdout"], json!("one\n"));
        assert_eq!(delivered[1].result["stdout"], json!("two\n"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn driver_gives_up_after_bounded_reconnects() {
    timeout(TEST_TIMEOUT, async {
        // Nothing is listening on this port.
        let tmp = tempfile::tempdir().unwrap();
        let mut config = driver_config(1, tmp.path());
        config.coordinator_url = Some("ws://127.0.0.1:9/ws".to_string());
        config.reconnect = ReconnectPolicy::Bounded {
            attempts: 2,
            delay: Duration::from_millis(50),
        };

        let driver = WorkerDriver::new(config);
        match driver.run().await {
            Err(HiveError::ConnectExhausted(attempts)) => assert_eq!(attempts, 2),
            other => panic!("expected connect exhaustion, got {other:?}"),
        }
    })
    .await
    .expect("test timed out");
}
