//! Sequential shell worker.
//!
//! Runs each submitted snippet with `<shell> -c <payload>` on a single executor
//! task, strictly in submission order, and writes the resulting events onto one
//! shared stream:
//! - `status: busy` when a unit starts
//! - one `stream` event per stdout/stderr line
//! - an `error` event on non-zero exit, spawn failure or interrupt
//! - `status: idle` when the unit is finished

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::event::{CorrelationId, StreamEvent, state};
use super::session::{WorkerLauncher, WorkerSession};
use crate::config::ServerConfig;
use crate::error::WorkerError;

/// How the shell worker runs snippets.
#[derive(Debug, Clone)]
pub struct ShellWorkerConfig {
    /// Shell binary; invoked as `<shell> -c <payload>`.
    pub shell: String,
    /// Working directory for every snippet (process cwd when `None`).
    pub working_dir: Option<PathBuf>,
}

impl Default for ShellWorkerConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            working_dir: None,
        }
    }
}

impl From<&ServerConfig> for ShellWorkerConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            shell: config.shell.clone(),
            working_dir: config.working_dir.clone(),
        }
    }
}

struct Job {
    id: CorrelationId,
    command: String,
}

struct Executor {
    jobs_tx: mpsc::UnboundedSender<Job>,
    handle: JoinHandle<()>,
}

/// Kill signal for the unit currently running, if any.
type KillSwitch = Arc<StdMutex<Option<oneshot::Sender<()>>>>;

enum JobExit {
    Success,
    Failed(Option<i32>),
    Interrupted,
}

/// Worker session backed by shell subprocesses.
pub struct ShellWorker {
    config: ShellWorkerConfig,
    executor: StdMutex<Option<Executor>>,
    events_tx: mpsc::UnboundedSender<StreamEvent>,
    events_rx: Mutex<mpsc::UnboundedReceiver<StreamEvent>>,
    kill_switch: KillSwitch,
}

impl ShellWorker {
    /// Create a stopped worker. Call `start()` before submitting.
    pub fn new(config: ShellWorkerConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            executor: StdMutex::new(None),
            events_tx,
            events_rx: Mutex::new(events_rx),
            kill_switch: Arc::new(StdMutex::new(None)),
        }
    }

    fn stop_executor(&self) -> bool {
        let executor = lock(&self.executor).take();
        lock(&self.kill_switch).take();
        match executor {
            Some(executor) => {
                // Aborting drops the running child (kill_on_drop) and every queued job.
                executor.handle.abort();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl WorkerSession for ShellWorker {
    async fn submit(&self, payload: &str) -> Result<CorrelationId, WorkerError> {
        let id = CorrelationId::new(Uuid::new_v4().to_string());
        let executor = lock(&self.executor);
        let executor = executor.as_ref().ok_or(WorkerError::NotRunning)?;
        executor
            .jobs_tx
            .send(Job {
                id: id.clone(),
                command: payload.to_string(),
            })
            .map_err(|_| WorkerError::NotRunning)?;
        debug!(msg_id = %id, "Queued shell snippet");
        Ok(id)
    }

    async fn poll_next_event(
        &self,
        timeout: Duration,
    ) -> Result<Option<StreamEvent>, WorkerError> {
        let next = tokio::time::timeout(timeout, async {
            self.events_rx.lock().await.recv().await
        })
        .await;

        match next {
            Ok(Some(event)) => Ok(Some(event)),
            Ok(None) => Err(WorkerError::StreamClosed),
            Err(_) => Ok(None),
        }
    }

    async fn interrupt(&self) -> Result<(), WorkerError> {
        match lock(&self.kill_switch).take() {
            Some(kill) => {
                if kill.send(()).is_err() {
                    debug!("Interrupt raced with unit completion");
                }
                info!("Interrupt sent to running shell unit");
            }
            None => debug!("Interrupt requested with nothing running"),
        }
        Ok(())
    }

    async fn restart(&self) -> Result<(), WorkerError> {
        self.stop_executor();
        self.start().await?;
        let _ = self.events_tx.send(StreamEvent::status(None, state::STARTING));
        info!("Shell worker restarted");
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), WorkerError> {
        if self.stop_executor() {
            info!("Shell worker stopped");
        }
        Ok(())
    }

    async fn start(&self) -> Result<(), WorkerError> {
        let mut executor = lock(&self.executor);
        if executor.as_ref().is_some_and(|e| !e.handle.is_finished()) {
            return Ok(());
        }

        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_executor(
            self.config.clone(),
            jobs_rx,
            self.events_tx.clone(),
            Arc::clone(&self.kill_switch),
        ));
        *executor = Some(Executor { jobs_tx, handle });
        Ok(())
    }
}

impl Drop for ShellWorker {
    fn drop(&mut self) {
        self.stop_executor();
    }
}

/// Launches started shell workers.
pub struct ShellLauncher {
    config: ShellWorkerConfig,
}

impl ShellLauncher {
    pub fn new(config: ShellWorkerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl WorkerLauncher for ShellLauncher {
    async fn launch(&self) -> Result<Arc<dyn WorkerSession>, WorkerError> {
        let worker = ShellWorker::new(self.config.clone());
        worker.start().await?;
        info!(shell = %self.config.shell, "Launched shell worker");
        Ok(Arc::new(worker))
    }
}

async fn run_executor(
    config: ShellWorkerConfig,
    mut jobs_rx: mpsc::UnboundedReceiver<Job>,
    events: mpsc::UnboundedSender<StreamEvent>,
    kill_switch: KillSwitch,
) {
    while let Some(job) = jobs_rx.recv().await {
        let _ = events.send(StreamEvent::busy(&job.id));

        let (kill_tx, kill_rx) = oneshot::channel();
        *lock(&kill_switch) = Some(kill_tx);

        let exit = run_job(&config, &job, &events, kill_rx).await;
        lock(&kill_switch).take();

        match exit {
            Ok(JobExit::Success) => {}
            Ok(JobExit::Failed(code)) => {
                let evalue = match code {
                    Some(code) => format!("exit code {code}"),
                    None => "terminated by signal".to_string(),
                };
                let _ = events.send(StreamEvent::error(&job.id, "ExitStatus", evalue));
            }
            Ok(JobExit::Interrupted) => {
                let _ = events.send(StreamEvent::error(
                    &job.id,
                    "Interrupted",
                    "execution interrupted",
                ));
            }
            Err(e) => {
                warn!(msg_id = %job.id, error = %e, "Shell snippet failed to run");
                let _ = events.send(StreamEvent::error(&job.id, "SpawnError", e.to_string()));
            }
        }

        let _ = events.send(StreamEvent::idle(&job.id));
    }
}

async fn run_job(
    config: &ShellWorkerConfig,
    job: &Job,
    events: &mpsc::UnboundedSender<StreamEvent>,
    mut kill_rx: oneshot::Receiver<()>,
) -> std::io::Result<JobExit> {
    let mut command = Command::new(&config.shell);
    command
        .arg("-c")
        .arg(&job.command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(ref dir) = config.working_dir {
        command.current_dir(dir);
    }

    let mut child = command.spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("stderr not captured"))?;

    let mut out = BufReader::new(stdout);
    let mut err = BufReader::new(stderr);
    let mut out_buf = Vec::new();
    let mut err_buf = Vec::new();
    let mut out_open = true;
    let mut err_open = true;
    let mut kill_armed = true;

    let status = loop {
        tokio::select! {
            read = out.read_until(b'\n', &mut out_buf), if out_open => match read {
                Ok(0) | Err(_) => out_open = false,
                Ok(_) => {
                    let _ = events.send(StreamEvent::stream(&job.id, "stdout", decode_line(&out_buf)));
                    out_buf.clear();
                }
            },
            read = err.read_until(b'\n', &mut err_buf), if err_open => match read {
                Ok(0) | Err(_) => err_open = false,
                Ok(_) => {
                    let _ = events.send(StreamEvent::stream(&job.id, "stderr", decode_line(&err_buf)));
                    err_buf.clear();
                }
            },
            signal = &mut kill_rx, if kill_armed => {
                if signal.is_ok() {
                    let _ = child.kill().await;
                    return Ok(JobExit::Interrupted);
                }
                kill_armed = false;
            }
            status = child.wait(), if !out_open && !err_open => break status?,
        }
    };

    if status.success() {
        Ok(JobExit::Success)
    } else {
        Ok(JobExit::Failed(status.code()))
    }
}

/// One raw output line as text ending in a single `\n`. Invalid UTF-8 is
/// replaced, never fatal.
fn decode_line(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let text = text.strip_suffix('\n').unwrap_or(&text);
    let text = text.strip_suffix('\r').unwrap_or(text);
    format!("{text}\n")
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    const STEP: Duration = Duration::from_millis(100);

    async fn started(config: ShellWorkerConfig) -> ShellWorker {
        let worker = ShellWorker::new(config);
        worker.start().await.unwrap();
        worker
    }

    /// Poll until the idle event for `id`, returning everything seen for it.
    async fn run_to_idle(worker: &ShellWorker, id: &CorrelationId) -> Vec<StreamEvent> {
        tokio::time::timeout(Duration::from_secs(10), async {
            let mut seen = Vec::new();
            loop {
                if let Some(event) = worker.poll_next_event(STEP).await.unwrap() {
                    if !event.belongs_to(id) {
                        continue;
                    }
                    let idle = event.is_idle();
                    seen.push(event);
                    if idle {
                        return seen;
                    }
                }
            }
        })
        .await
        .expect("worker never went idle")
    }

    #[tokio::test]
    async fn echo_produces_busy_output_idle() {
        let worker = started(ShellWorkerConfig::default()).await;
        let id = worker.submit("echo hello").await.unwrap();

        let events = run_to_idle(&worker, &id).await;
        assert_eq!(events.first().unwrap().execution_state(), Some("busy"));
        assert!(
            events
                .iter()
                .any(|e| e.stream_text("stdout") == Some("hello\n"))
        );
        assert!(events.last().unwrap().is_idle());
    }

    #[tokio::test]
    async fn stderr_is_streamed_separately() {
        let worker = started(ShellWorkerConfig::default()).await;
        let id = worker.submit("echo oops >&2").await.unwrap();

        let events = run_to_idle(&worker, &id).await;
        assert!(
            events
                .iter()
                .any(|e| e.stream_text("stderr") == Some("oops\n"))
        );
    }

    #[tokio::test]
    async fn invalid_utf8_and_large_output_still_reach_idle() {
        let worker = started(ShellWorkerConfig::default()).await;
        let id = worker
            .submit("printf 'ok\\n\\377\\n'; head -c 200000 /dev/zero | tr '\\0' 'a'; echo")
            .await
            .unwrap();

        let events = run_to_idle(&worker, &id).await;
        let stdout: Vec<&str> = events.iter().filter_map(|e| e.stream_text("stdout")).collect();
        assert_eq!(stdout[0], "ok\n");
        assert_eq!(stdout[1], "\u{FFFD}\n");
        assert_eq!(stdout[2].len(), 200_001);
        assert!(events.iter().all(|e| e.kind != "error"));
    }

    #[test]
    fn decode_line_normalises_terminators() {
        assert_eq!(decode_line(b"plain\n"), "plain\n");
        assert_eq!(decode_line(b"crlf\r\n"), "crlf\n");
        assert_eq!(decode_line(b"no newline at eof"), "no newline at eof\n");
        assert_eq!(decode_line(b"bad \xff byte\n"), "bad \u{FFFD} byte\n");
    }

    #[tokio::test]
    async fn non_zero_exit_emits_error_before_idle() {
        let worker = started(ShellWorkerConfig::default()).await;
        let id = worker.submit("exit 3").await.unwrap();

        let events = run_to_idle(&worker, &id).await;
        let error = events.iter().find(|e| e.kind == "error").unwrap();
        assert_eq!(error.payload["ename"], "ExitStatus");
        assert_eq!(error.payload["evalue"], "exit code 3");
    }

    #[tokio::test]
    async fn units_run_in_submission_order() {
        let worker = started(ShellWorkerConfig::default()).await;
        let first = worker.submit("echo one").await.unwrap();
        let second = worker.submit("echo two").await.unwrap();

        let mut outputs = Vec::new();
        let mut idles = Vec::new();
        tokio::time::timeout(Duration::from_secs(10), async {
            while idles.len() < 2 {
                if let Some(event) = worker.poll_next_event(STEP).await.unwrap() {
                    if let Some(text) = event.stream_text("stdout") {
                        outputs.push(text.to_string());
                    }
                    if event.is_idle() {
                        idles.push(event.parent_correlation_id.clone().unwrap());
                    }
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(outputs, vec!["one\n", "two\n"]);
        assert_eq!(idles, vec![first, second]);
    }

    #[tokio::test]
    async fn interrupt_kills_running_unit() {
        let worker = started(ShellWorkerConfig::default()).await;
        let id = worker.submit("sleep 30").await.unwrap();

        // Wait until the unit is actually running.
        let busy = worker
            .poll_next_event(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(busy.execution_state(), Some("busy"));

        worker.interrupt().await.unwrap();
        let events = run_to_idle(&worker, &id).await;
        let error = events.iter().find(|e| e.kind == "error").unwrap();
        assert_eq!(error.payload["ename"], "Interrupted");
    }

    #[tokio::test]
    async fn interrupt_when_idle_is_harmless() {
        let worker = started(ShellWorkerConfig::default()).await;
        worker.interrupt().await.unwrap();

        let id = worker.submit("echo still-alive").await.unwrap();
        let events = run_to_idle(&worker, &id).await;
        assert!(events.iter().all(|e| e.kind != "error"));
    }

    #[tokio::test]
    async fn submit_after_shutdown_fails_until_started() {
        let worker = started(ShellWorkerConfig::default()).await;
        worker.shutdown().await.unwrap();
        assert!(matches!(
            worker.submit("echo hi").await,
            Err(WorkerError::NotRunning)
        ));

        worker.start().await.unwrap();
        let id = worker.submit("echo hi").await.unwrap();
        run_to_idle(&worker, &id).await;
    }

    #[tokio::test]
    async fn restart_announces_starting() {
        let worker = started(ShellWorkerConfig::default()).await;
        worker.restart().await.unwrap();

        let event = worker
            .poll_next_event(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.execution_state(), Some("starting"));
        assert!(event.parent_correlation_id.is_none());
    }

    #[tokio::test]
    async fn snippets_run_in_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();

        let worker = started(ShellWorkerConfig {
            working_dir: Some(dir.path().to_path_buf()),
            ..ShellWorkerConfig::default()
        })
        .await;
        let id = worker.submit("ls").await.unwrap();

        let events = run_to_idle(&worker, &id).await;
        assert!(
            events
                .iter()
                .any(|e| e.stream_text("stdout") == Some("marker.txt\n"))
        );
    }

    #[tokio::test]
    async fn missing_shell_reports_spawn_error() {
        let worker = started(ShellWorkerConfig {
            shell: "/nonexistent/shell".to_string(),
            working_dir: None,
        })
        .await;
        let id = worker.submit("echo hi").await.unwrap();

        let events = run_to_idle(&worker, &id).await;
        let error = events.iter().find(|e| e.kind == "error").unwrap();
        assert_eq!(error.payload["ename"], "SpawnError");
    }

    #[tokio::test]
    async fn launcher_returns_started_worker() {
        let launcher = ShellLauncher::new(ShellWorkerConfig::default());
        let session = launcher.launch().await.unwrap();
        let id = session.submit("echo launched").await.unwrap();

        let seen = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(event) = session.poll_next_event(STEP).await.unwrap() {
                    if event.belongs_to(&id) && event.stream_text("stdout").is_some() {
                        return event;
                    }
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(seen.stream_text("stdout"), Some("launched\n"));
    }
}
