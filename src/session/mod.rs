//! Worker session manager.
//!
//! Owns at most one worker process per session key, started lazily on
//! first use. Submissions are routed under a per-session async mutex so
//! only one task is ever in flight per session: a shell line arriving
//! while the worker awaits input is forwarded as input; a program
//! arriving mid-interaction forces a worker restart (the blocked process
//! cannot be safely reused). Dead or unresponsive workers are replaced
//! transparently and the task retried once; a second failure surfaces an
//! internal-error event, never a crash of the serving process.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::worker::protocol::{SourceTag, TaskSpec, WorkerEvent, WorkerRequest};

/// Learner-facing text for engine-side failures.
pub const INTERNAL_ERROR_MESSAGE: &str =
    "Something went wrong running your code. This is not your fault. Please try again.";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Executable spawned with `--worker` for each session.
    pub worker_program: PathBuf,
    /// Maximum quiet time between worker events before the worker is
    /// declared unresponsive.
    pub task_timeout: Duration,
}

impl SessionConfig {
    pub fn from_env() -> Result<Self> {
        let worker_program = match std::env::var("WORKER_PROGRAM") {
            Ok(path) => PathBuf::from(path),
            Err(_) => std::env::current_exe().context("cannot locate worker executable")?,
        };
        let task_timeout = std::env::var("WORKER_TASK_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(30));
        Ok(Self {
            worker_program,
            task_timeout,
        })
    }
}

/// Explicit registry mapping session key to session object. Passed by
/// reference into the manager; sessions are evicted on teardown.
#[derive(Default)]
pub struct SessionStore {
    sessions: StdMutex<HashMap<String, Arc<Mutex<Session>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_or_create(&self, key: &str) -> Arc<Mutex<Session>> {
        let mut sessions = self.sessions.lock().expect("session store poisoned");
        sessions
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Session::new(key))))
            .clone()
    }

    fn remove(&self, key: &str) -> Option<Arc<Mutex<Session>>> {
        let mut sessions = self.sessions.lock().expect("session store poisoned");
        sessions.remove(key)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().expect("session store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A live worker process and its channels.
struct Worker {
    child: Child,
    stdin: ChildStdin,
    events: mpsc::Receiver<WorkerEvent>,
    reader_task: JoinHandle<()>,
    stderr_task: JoinHandle<()>,
}

impl Worker {
    async fn spawn(config: &SessionConfig) -> Result<Worker> {
        let mut child = Command::new(&config.worker_program)
            .arg("--worker")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| {
                format!("failed to spawn worker {:?}", config.worker_program)
            })?;

        let stdout = child.stdout.take().context("worker stdout unavailable")?;
        let stderr = child.stderr.take().context("worker stderr unavailable")?;
        let stdin = child.stdin.take().context("worker stdin unavailable")?;

        let (tx, events) = mpsc::channel(256);
        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<WorkerEvent>(&line) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!("Unparseable worker event: {} ({})", err, line),
                }
            }
        });
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!("worker: {}", line);
            }
        });

        Ok(Worker {
            child,
            stdin,
            events,
            reader_task,
            stderr_task,
        })
    }
}

/// Exclusive owner of one worker process for one learner.
pub struct Session {
    key: String,
    worker: Option<Worker>,
    awaiting_input: bool,
}

impl Session {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            worker: None,
            awaiting_input: false,
        }
    }

    async fn ensure_worker(&mut self, config: &SessionConfig) -> Result<()> {
        if self.worker.is_none() {
            info!("Starting worker process for session {}", self.key);
            self.worker = Some(Worker::spawn(config).await?);
        }
        Ok(())
    }

    async fn shutdown_worker(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.reader_task.abort();
            worker.stderr_task.abort();
            let _ = worker.child.start_kill();
            let _ = worker.child.wait().await;
            info!("Stopped worker process for session {}", self.key);
        }
        self.awaiting_input = false;
    }

    async fn send(&mut self, request: &WorkerRequest) -> Result<()> {
        let worker = self.worker.as_mut().context("no live worker")?;
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        worker
            .stdin
            .write_all(line.as_bytes())
            .await
            .context("failed to write to worker")?;
        worker.stdin.flush().await.context("failed to flush worker stdin")?;
        Ok(())
    }
}

pub struct SessionManager {
    config: Arc<SessionConfig>,
    store: Arc<SessionStore>,
}

impl SessionManager {
    /// The store is handed in explicitly so its lifecycle (creation,
    /// teardown, tests) is the caller's decision, not a hidden global.
    pub fn new(config: SessionConfig, store: Arc<SessionStore>) -> Self {
        Self {
            config: Arc::new(config),
            store,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Submit one task. Returns the event stream for this submission:
    /// output events in emission order, ending with `input_request`
    /// (session now awaits input), `completed` or `internal_error`. The
    /// next submission continues an awaiting session's cycle.
    pub fn submit(&self, session_key: &str, task: TaskSpec) -> mpsc::Receiver<WorkerEvent> {
        let (tx, rx) = mpsc::channel(64);
        let session = self.store.get_or_create(session_key);
        let config = self.config.clone();
        tokio::spawn(async move {
            let mut session = session.lock().await;
            if let Err(err) = run_submission(&mut session, &task, &tx, &config).await {
                error!("Submission handling failed: {:#}", err);
                let _ = tx
                    .send(WorkerEvent::InternalError {
                        details: format!("{:#}", err),
                    })
                    .await;
            }
        });
        rx
    }

    /// Abort a run blocked on input. The abort sentinel makes the worker
    /// unwind the run; its terminal `completed` event (flagged
    /// interrupted) arrives on the returned stream. A no-op when the
    /// session is not awaiting input.
    pub fn cancel(&self, session_key: &str) -> mpsc::Receiver<WorkerEvent> {
        let (tx, rx) = mpsc::channel(16);
        let session = self.store.get_or_create(session_key);
        let config = self.config.clone();
        tokio::spawn(async move {
            let mut session = session.lock().await;
            if !session.awaiting_input {
                return;
            }
            session.awaiting_input = false;
            let sent = session.send(&WorkerRequest::Cancel).await.is_ok();
            if sent && relay(&mut session, &tx, &config).await.is_ok() {
                return;
            }
            warn!("Worker for session {} lost during cancel", session.key);
            session.shutdown_worker().await;
            let _ = tx
                .send(WorkerEvent::InternalError {
                    details: "worker lost while cancelling".to_string(),
                })
                .await;
        });
        rx
    }

    /// Evict a session and kill its worker.
    pub async fn teardown(&self, session_key: &str) {
        if let Some(session) = self.store.remove(session_key) {
            let mut session = session.lock().await;
            session.shutdown_worker().await;
        }
    }
}

async fn run_submission(
    session: &mut Session,
    task: &TaskSpec,
    tx: &mpsc::Sender<WorkerEvent>,
    config: &SessionConfig,
) -> Result<()> {
    if session.awaiting_input && task.source == SourceTag::Shell {
        // A bare shell line while blocked on input() feeds that input.
        session.awaiting_input = false;
        session
            .send(&WorkerRequest::Input {
                text: task.code.clone(),
            })
            .await?;
        match relay(session, tx, config).await {
            Ok(()) => Ok(()),
            Err(failure) => {
                warn!(
                    "Worker for session {} lost mid-interaction: {}",
                    session.key, failure
                );
                // The interactive run's state died with the process.
                session.shutdown_worker().await;
                let _ = tx
                    .send(WorkerEvent::InternalError {
                        details: failure.to_string(),
                    })
                    .await;
                Ok(())
            }
        }
    } else {
        if session.awaiting_input {
            // A new program cannot interrupt a blocked interactive run;
            // the old process may be stuck in an inconsistent state.
            info!(
                "Session {} got a new program mid-interaction, restarting worker",
                session.key
            );
            session.shutdown_worker().await;
        }

        let mut last_failure = None;
        for _attempt in 0..2 {
            session.ensure_worker(config).await?;
            let result = async {
                session.send(&WorkerRequest::Task(task.clone())).await?;
                relay(session, tx, config).await
            }
            .await;
            match result {
                Ok(()) => return Ok(()),
                Err(failure) => {
                    warn!(
                        "Worker for session {} unresponsive ({}), replacing process",
                        session.key, failure
                    );
                    session.shutdown_worker().await;
                    last_failure = Some(failure);
                }
            }
        }

        let details = last_failure
            .map(|failure| failure.to_string())
            .unwrap_or_else(|| "worker failed".to_string());
        let _ = tx.send(WorkerEvent::InternalError { details }).await;
        Ok(())
    }
}

/// Forward events until the terminal one, updating the session's
/// awaiting-input state. Errors mean the worker died or went quiet.
async fn relay(
    session: &mut Session,
    tx: &mpsc::Sender<WorkerEvent>,
    config: &SessionConfig,
) -> Result<()> {
    let awaiting;
    {
        let worker = session.worker.as_mut().context("no live worker")?;
        loop {
            let event = timeout(config.task_timeout, worker.events.recv())
                .await
                .map_err(|_| anyhow!("timed out waiting for worker output"))?
                .ok_or_else(|| anyhow!("worker exited before completing the task"))?;
            let terminal = event.is_terminal();
            let is_input_request = matches!(event, WorkerEvent::InputRequest);
            // The caller may have gone away; the session state machine
            // still has to advance to the terminal event.
            let _ = tx.send(event).await;
            if terminal {
                awaiting = is_input_request;
                break;
            }
        }
    }
    session.awaiting_input = awaiting;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::os::unix::fs::PermissionsExt;

    /// Write a fake worker script and return a config pointing at it.
    fn fake_worker(script_body: &str, timeout_ms: u64) -> (tempfile::TempDir, SessionConfig) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.sh");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/bash\n{}", script_body).unwrap();
        drop(file);
        let mut permissions = std::fs::metadata(&path).unwrap().permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(&path, permissions).unwrap();
        let config = SessionConfig {
            worker_program: path,
            task_timeout: Duration::from_millis(timeout_ms),
        };
        (dir, config)
    }

    fn task(code: &str, source: SourceTag) -> TaskSpec {
        TaskSpec {
            code: code.to_string(),
            source,
            page_slug: "p".to_string(),
            step_name: "s".to_string(),
        }
    }

    async fn drain(mut rx: mpsc::Receiver<WorkerEvent>) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    const ECHO_WORKER: &str = r#"while read line; do
  echo '{"kind":"output","stream":"stdout","text":"hi\n"}'
  echo '{"kind":"completed","passed":true}'
done"#;

    #[tokio::test]
    async fn test_submit_streams_events_in_order() {
        let (_dir, config) = fake_worker(ECHO_WORKER, 2000);
        let manager = SessionManager::new(config, Arc::new(SessionStore::new()));
        let events = drain(manager.submit("alice", task("print(1)", SourceTag::Editor))).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], WorkerEvent::Output { .. }));
        assert!(matches!(events[1], WorkerEvent::Completed(_)));
    }

    #[tokio::test]
    async fn test_sessions_are_isolated_processes() {
        let (_dir, config) = fake_worker(ECHO_WORKER, 2000);
        let manager = SessionManager::new(config, Arc::new(SessionStore::new()));
        let a = drain(manager.submit("alice", task("x", SourceTag::Editor))).await;
        let b = drain(manager.submit("bob", task("y", SourceTag::Editor))).await;
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 2);
        assert_eq!(manager.store().len(), 2);
    }

    #[tokio::test]
    async fn test_crashed_worker_is_replaced_and_next_task_succeeds() {
        // First process dies instantly; the retry spawns a fresh one
        // which also dies, surfacing an internal error. A later
        // submission must still work once the script cooperates.
        let (dir, config) = fake_worker("exit 1", 500);
        let manager = SessionManager::new(config.clone(), Arc::new(SessionStore::new()));
        let events = drain(manager.submit("alice", task("x", SourceTag::Editor))).await;
        assert!(matches!(
            events.last(),
            Some(WorkerEvent::InternalError { .. })
        ));

        // Replace the script with a working one; same session recovers.
        let path = dir.path().join("worker.sh");
        std::fs::write(
            &path,
            format!("#!/bin/bash\n{}", ECHO_WORKER),
        )
        .unwrap();
        let mut permissions = std::fs::metadata(&path).unwrap().permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(&path, permissions).unwrap();

        let events = drain(manager.submit("alice", task("x", SourceTag::Editor))).await;
        assert!(matches!(events.last(), Some(WorkerEvent::Completed(_))));
    }

    #[tokio::test]
    async fn test_unresponsive_worker_times_out() {
        let (_dir, config) = fake_worker("sleep 60", 100);
        let manager = SessionManager::new(config, Arc::new(SessionStore::new()));
        let events = drain(manager.submit("alice", task("x", SourceTag::Editor))).await;
        assert!(matches!(
            events.last(),
            Some(WorkerEvent::InternalError { .. })
        ));
    }

    #[tokio::test]
    async fn test_input_routing_and_interactive_cycle() {
        // Fake worker: first line produces an input request, second line
        // (the input) produces output + completion.
        let script = r#"read line
echo '{"kind":"input_request"}'
read line
echo '{"kind":"output","stream":"stdout","text":"resumed\n"}'
echo '{"kind":"completed","passed":true}'
"#;
        let (_dir, config) = fake_worker(script, 2000);
        let manager = SessionManager::new(config, Arc::new(SessionStore::new()));

        let first = drain(manager.submit("alice", task("input()", SourceTag::Editor))).await;
        assert!(matches!(first.last(), Some(WorkerEvent::InputRequest)));

        // The shell line is routed as input and the run resumes.
        let second = drain(manager.submit("alice", task("Alice", SourceTag::Shell))).await;
        assert!(matches!(second.first(), Some(WorkerEvent::Output { .. })));
        assert!(matches!(second.last(), Some(WorkerEvent::Completed(_))));
    }

    #[tokio::test]
    async fn test_program_mid_interaction_restarts_worker() {
        // Worker announces an input request, then would misbehave if fed
        // a task as input. The manager must restart instead of feeding.
        let script = r#"read line
echo '{"kind":"input_request"}'
read line
echo '{"kind":"output","stream":"stdout","text":"WRONG\n"}'
echo '{"kind":"completed","passed":true}'
"#;
        let (_dir, config) = fake_worker(script, 2000);
        let manager = SessionManager::new(config, Arc::new(SessionStore::new()));

        let first = drain(manager.submit("alice", task("input()", SourceTag::Editor))).await;
        assert!(matches!(first.last(), Some(WorkerEvent::InputRequest)));

        // A fresh program run: the old process is discarded, the new one
        // answers with its own first exchange (an input request again),
        // never the WRONG output.
        let second = drain(manager.submit("alice", task("input()", SourceTag::Editor))).await;
        assert!(matches!(second.last(), Some(WorkerEvent::InputRequest)));
        assert!(!second
            .iter()
            .any(|event| matches!(event, WorkerEvent::Output { text, .. } if text.contains("WRONG"))));
    }

    #[tokio::test]
    async fn test_cancel_aborts_awaiting_run() {
        let script = r#"read line
echo '{"kind":"input_request"}'
read line
echo '{"kind":"completed","passed":false,"interrupted":true}'
"#;
        let (_dir, config) = fake_worker(script, 2000);
        let manager = SessionManager::new(config, Arc::new(SessionStore::new()));

        let first = drain(manager.submit("alice", task("input()", SourceTag::Editor))).await;
        assert!(matches!(first.last(), Some(WorkerEvent::InputRequest)));

        let cancelled = drain(manager.cancel("alice")).await;
        match cancelled.last() {
            Some(WorkerEvent::Completed(outcome)) => assert!(outcome.interrupted),
            other => panic!("expected completed, got {:?}", other),
        }

        // Cancelling an idle session does nothing.
        let idle = drain(manager.cancel("alice")).await;
        assert!(idle.is_empty());
    }

    #[test]
    fn test_teardown_removes_session() {
        tokio_test::block_on(async {
            let (_dir, config) = fake_worker(ECHO_WORKER, 2000);
            let manager = SessionManager::new(config, Arc::new(SessionStore::new()));
            drain(manager.submit("alice", task("x", SourceTag::Editor))).await;
            assert_eq!(manager.store().len(), 1);
            manager.teardown("alice").await;
            assert!(manager.store().is_empty());
        });
    }
}
