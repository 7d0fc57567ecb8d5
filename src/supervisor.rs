//! Job supervisor (spec §4.6) — the host-side subprocess lifecycle owner.
//!
//! Holds the one piece of mutable shared state the HTTP facade touches
//! (spec §5 "confine to one owning structure"): a single
//! `tokio::sync::Mutex<SupervisorState>` behind an `Arc`, so at most one
//! HTTP handler mutates it at a time.

use crate::ipc::{drain_available, ExceptionPayload, WorkerMessage};
use crate::log_entry::LogEntry;
use crate::manifest::load_manifest;
use crate::worker::JobRequest;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// Startup window: the subprocess must be alive (or have sent a first
/// update) within this long (spec §4.6 `SUBPROCESS_STARTUP_TIME_LIMIT`).
pub const SUBPROCESS_STARTUP_TIME_LIMIT: Duration = Duration::from_secs(30);

/// Window reserved for in-flight IPC messages to drain after the worker is
/// observed dead (spec §4.6 `ABNORMAL_TERMINATION_GRACE_PERIOD`).
pub const ABNORMAL_TERMINATION_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Fixed fd number the worker's IPC write end is dup'd onto in the child
/// (spec §4.5, SPEC_FULL §4.5 "anonymous OS pipe... inherited from the
/// parent").
const IPC_CHILD_FD: RawFd = 3;

pub const API_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Host-side execution state (spec §3 "Execution state").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Pending,
    Running,
    Complete,
    Terminated,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Complete | JobState::Failed | JobState::Terminated)
    }
}

/// The `GET /` / post-job response body (spec §6).
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<HashMap<String, Value>>,
    pub log: Vec<LogEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<ExceptionPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<Stats>,
    pub api_version: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    #[serde(rename = "peakMemoryUsage", skip_serializing_if = "Option::is_none")]
    pub peak_memory_usage: Option<u64>,
}

struct RunningWorker {
    child: Child,
    receiver: tokio::net::unix::pipe::Receiver,
    pending: Vec<u8>,
}

struct SupervisorState {
    worker: Option<RunningWorker>,
    model_id: Option<String>,
    state: JobState,
    message: Option<String>,
    progress: Option<f64>,
    results: Option<HashMap<String, Value>>,
    log: Vec<LogEntry>,
    exception: Option<ExceptionPayload>,
    peak_memory_usage: Option<u64>,
    started_at: Option<Instant>,
    failed_at: Option<Instant>,
    received_first_update: bool,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl SupervisorState {
    fn fresh() -> Self {
        Self {
            worker: None,
            model_id: None,
            state: JobState::Pending,
            message: None,
            progress: None,
            results: None,
            log: Vec::new(),
            exception: None,
            peak_memory_usage: None,
            started_at: None,
            failed_at: None,
            received_first_update: false,
            shutdown: None,
        }
    }

    fn is_alive(&self) -> bool {
        self.worker.is_some()
    }

    /// Terminal states are sticky — never overwritten by a late non-terminal
    /// update (spec §5 "Ordering guarantees").
    fn set_state(&mut self, new_state: JobState) {
        if self.state.is_terminal() {
            return;
        }
        self.state = new_state;
    }
}

pub struct Supervisor {
    state: Mutex<SupervisorState>,
}

impl Supervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { state: Mutex::new(SupervisorState::fresh()) })
    }

    /// Wire the HTTP server's graceful-shutdown trigger into the supervisor,
    /// so `POST /terminate` can also stop the listener (spec §4.7).
    pub async fn register_shutdown(self: &Arc<Self>, tx: tokio::sync::oneshot::Sender<()>) {
        self.state.lock().await.shutdown = Some(tx);
    }

    /// `POST /` — spawn a new job (spec §4.7).
    pub async fn start_job(
        self: &Arc<Self>,
        model_path: &std::path::Path,
        raw_body: Value,
    ) -> Result<StateSnapshot, crate::error::HostError> {
        let mut state = self.state.lock().await;
        if state.is_alive() {
            return Err(crate::error::HostError::JobAlreadyRunning);
        }

        let model_id = raw_body
            .get("modelId")
            .and_then(Value::as_str)
            .ok_or(crate::error::HostError::MissingModelId)?
            .to_string();

        let loaded = load_manifest(model_path)
            .map_err(|e| crate::error::HostError::Internal(e.to_string()))?;
        if loaded.manifest.find_model(&model_id).is_none() {
            return Err(crate::error::HostError::UnknownModel(model_id.clone()));
        }

        let supplied: std::collections::HashSet<String> = raw_body
            .get("ports")
            .and_then(Value::as_object)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        let missing = loaded.manifest.missing_required_ports(&model_id, &supplied);

        *state = SupervisorState::fresh();
        state.model_id = Some(model_id.clone());
        state.started_at = Some(Instant::now());

        if !missing.is_empty() {
            state.log.push(LogEntry::new(
                format!("Missing required port(s): {}", missing.join(", ")),
                crate::log_entry::LogLevel::Warning,
            ));
        }

        let job_request: JobRequest = serde_json::from_value(raw_body)
            .map_err(|e| crate::error::HostError::Internal(e.to_string()))?;

        match spawn_worker(model_path, job_request) {
            Ok(worker) => {
                state.worker = Some(worker);
            }
            Err(e) => {
                state.set_state(JobState::Failed);
                state.exception = Some(ExceptionPayload {
                    developer_msg: format!("failed to start worker: {e}"),
                    msg: "failed to start worker".to_string(),
                    data: Value::Null,
                    model_id: model_id.clone(),
                });
            }
        }

        drop(state);
        Ok(self.snapshot().await)
    }

    /// Drain IPC, detect abnormal termination, and return a snapshot with
    /// the accumulated log purged (spec §4.6 "Log retention").
    pub async fn snapshot(self: &Arc<Self>) -> StateSnapshot {
        let mut state = self.state.lock().await;
        self.poll_ipc(&mut state).await;
        self.detect_abnormal_termination(&mut state).await;
        self.refresh_peak_memory(&mut state);
        self.build_snapshot(&mut state)
    }

    async fn poll_ipc(&self, state: &mut SupervisorState) {
        let Some(worker) = state.worker.as_mut() else { return };
        let messages = match drain_available(&mut worker.receiver, &mut worker.pending).await {
            Ok(messages) => messages,
            Err(_) => Vec::new(),
        };
        for message in messages {
            state.received_first_update = true;
            match message {
                WorkerMessage::Update { message, progress } => {
                    state.set_state(JobState::Running);
                    if message.is_some() {
                        state.message = message;
                    }
                    if progress.is_some() {
                        state.progress = progress;
                    }
                }
                WorkerMessage::Log { entries } => state.log.extend(entries),
                WorkerMessage::Complete { results } => {
                    state.set_state(JobState::Complete);
                    state.progress = Some(1.0);
                    state.results = Some(results);
                }
                WorkerMessage::Fail { exception } => {
                    state.set_state(JobState::Failed);
                    state.exception = Some(exception);
                }
            }
        }
    }

    async fn detect_abnormal_termination(&self, state: &mut SupervisorState) {
        if state.state.is_terminal() {
            return;
        }
        let Some(worker) = state.worker.as_mut() else { return };

        let alive = matches!(worker.child.try_wait(), Ok(None));
        let startup_elapsed = state.started_at.map(|t| t.elapsed()).unwrap_or_default();

        if alive {
            state.failed_at = None;
            return;
        }

        if state.failed_at.is_none() {
            state.failed_at = Some(Instant::now());
        }
        let since_failed = state.failed_at.unwrap().elapsed();
        if since_failed < ABNORMAL_TERMINATION_GRACE_PERIOD {
            return;
        }

        // One more drain attempt before finalizing, in case final IPC
        // messages arrived during the grace window.
        let _ = drain_available(&mut worker.receiver, &mut worker.pending).await;

        // `ExitStatus::code()` is `None` when the process died from a signal
        // (SIGKILL/SIGTERM — exactly how an externally-killed worker exits),
        // so fall back to the negated signal number, matching the exitcode
        // convention of a forked-and-signaled child process.
        let exit_code = worker
            .child
            .wait()
            .await
            .ok()
            .and_then(|status| status.code().or_else(|| status.signal().map(|s| -s)));

        let model_id = state.model_id.clone().unwrap_or_default();
        let failed_to_start = !state.received_first_update && startup_elapsed < SUBPROCESS_STARTUP_TIME_LIMIT;

        let msg = if failed_to_start {
            format!("Model {model_id} failed to start.")
        } else {
            format!("Model {model_id} terminated abnormally.")
        };

        state.set_state(JobState::Failed);
        state.exception = Some(ExceptionPayload {
            developer_msg: msg.clone(),
            msg,
            data: serde_json::json!({ "exitCode": exit_code }),
            model_id,
        });
        state.worker = None;
    }

    fn refresh_peak_memory(&self, state: &mut SupervisorState) {
        let Some(worker) = state.worker.as_ref() else { return };
        let pid = worker.child.id();
        if let Some(pid) = pid {
            state.peak_memory_usage = read_peak_rss_kb(pid);
        }
    }

    /// Pull accumulated log entries out of state — delivered exactly once
    /// per snapshot (spec §4.6 "Log retention"). Reads the length first, then
    /// drains exactly that many entries off the head, so an entry appended
    /// after the length was read (i.e. one that raced this purge) is left in
    /// place for the next snapshot instead of being silently dropped (spec §5
    /// "a head-deletion loop driven by the pre-read length").
    fn take_log(&self, state: &mut SupervisorState) -> Vec<LogEntry> {
        let len = state.log.len();
        state.log.drain(0..len).collect()
    }

    fn build_snapshot(&self, state: &mut SupervisorState) -> StateSnapshot {
        let log = self.take_log(state);
        let stats = if state.state == JobState::Running {
            Some(Stats { peak_memory_usage: state.peak_memory_usage })
        } else {
            None
        };
        StateSnapshot {
            state: state.state,
            message: state.message.clone(),
            progress: state.progress,
            results: state.results.clone(),
            log,
            exception: state.exception.clone(),
            stats,
            api_version: API_VERSION,
        }
    }

    /// `POST /terminate` (spec §4.6 "Termination protocol").
    pub async fn terminate(self: &Arc<Self>, timeout: Duration) -> StateSnapshot {
        let mut state = self.state.lock().await;
        if let Some(worker) = state.worker.as_mut() {
            if let Some(pid) = worker.child.id() {
                let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }

            let joined = tokio::time::timeout(timeout, worker.child.wait()).await;
            if joined.is_err() {
                if let Some(pid) = worker.child.id() {
                    let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
                }
                let _ = worker.child.wait().await;
            }
            state.worker = None;
        }

        state.set_state(JobState::Terminated);

        if let Some(tx) = state.shutdown.take() {
            let _ = tx.send(());
        } else {
            tracing::warn!("terminate called with no HTTP shutdown hook registered");
        }

        self.build_snapshot(&mut state)
    }

    /// Invoked by the 500 handler (spec §4.7) when a host-side exception
    /// escapes a request handler: best-effort 5s termination, then both
    /// tracebacks are recorded in `state.exception` and the resulting
    /// snapshot is returned so the 500 response carries it (spec §4.7
    /// "returns 500 with the snapshot").
    pub async fn handle_host_panic(self: &Arc<Self>, original_msg: String) -> StateSnapshot {
        // `terminate` purges the log via its own snapshot (spec §4.6 "Log
        // retention" — delivered exactly once); keep that batch and prepend
        // it below so it still reaches the caller through the response this
        // method actually returns, rather than being silently dropped.
        let termination = self.terminate(Duration::from_secs(5)).await;
        let mut state = self.state.lock().await;
        let model_id = state.model_id.clone().unwrap_or_default();
        state.exception = Some(ExceptionPayload {
            developer_msg: format!(
                "host internal error: {original_msg}\n-- termination attempted after host error: final state {:?} --",
                termination.state
            ),
            msg: "internal host error".to_string(),
            data: Value::Null,
            model_id,
        });
        let mut snapshot = self.build_snapshot(&mut state);
        let mut log = termination.log;
        log.append(&mut snapshot.log);
        snapshot.log = log;
        snapshot
    }
}

fn spawn_worker(model_path: &std::path::Path, job_request: JobRequest) -> std::io::Result<RunningWorker> {
    let current_exe = std::env::current_exe()?;

    let job_file = tempfile::NamedTempFile::new()?;
    serde_json::to_writer(job_file.as_file(), &job_request)?;
    let job_path: PathBuf = job_file.path().to_path_buf();
    // Keep the tempfile alive until the child has had a chance to read it by
    // leaking the handle — the OS cleans up tmp dirs independently and the
    // worker reads it within its startup window.
    std::mem::forget(job_file);

    let (read_fd, write_fd) = nix::unistd::pipe()?;
    let read_raw: RawFd = read_fd.as_raw_fd();
    let write_raw: RawFd = write_fd.as_raw_fd();
    // The host reads non-blockingly (it only drains whatever is currently
    // buffered on each poll); the worker's write end stays blocking.
    nix::fcntl::fcntl(read_raw, nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK))?;

    let mut cmd = Command::new(&current_exe);
    cmd.arg("--worker-harness")
        .arg(&job_path)
        .arg("--worker-manifest")
        .arg(model_path)
        .arg("--ipc-fd")
        .arg(IPC_CHILD_FD.to_string())
        .stdin(Stdio::null())
        .kill_on_drop(true);

    unsafe {
        cmd.pre_exec(move || {
            nix::unistd::dup2(write_raw, IPC_CHILD_FD)?;
            if write_raw != IPC_CHILD_FD {
                let _ = nix::unistd::close(write_raw);
            }
            Ok(())
        });
    }

    let child = cmd.spawn()?;
    drop(write_fd);

    let read_file = std::fs::File::from(read_fd);
    let receiver = tokio::net::unix::pipe::Receiver::from_file(read_file)?;

    Ok(RunningWorker { child, receiver, pending: Vec::new() })
}

/// Best-effort peak RSS read from `/proc/<pid>/status` (spec §4.6
/// "Peak-memory reporting"). Failures are swallowed — stats are optional.
fn read_peak_rss_kb(pid: u32) -> Option<u64> {
    let contents = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("VmHWM:") {
            let digits: String = rest.trim().split_whitespace().next()?.to_string();
            return digits.parse::<u64>().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_exactly_complete_failed_terminated() {
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Complete.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Terminated.is_terminal());
    }

    #[test]
    fn set_state_is_sticky_once_terminal() {
        let mut state = SupervisorState::fresh();
        state.set_state(JobState::Running);
        assert_eq!(state.state, JobState::Running);

        state.set_state(JobState::Complete);
        assert_eq!(state.state, JobState::Complete);

        // A late abnormal-termination or update must never overwrite a
        // terminal state (spec §5 "Ordering guarantees").
        state.set_state(JobState::Failed);
        assert_eq!(state.state, JobState::Complete);
        state.set_state(JobState::Running);
        assert_eq!(state.state, JobState::Complete);
    }

    #[test]
    fn fresh_state_starts_pending_and_not_alive() {
        let state = SupervisorState::fresh();
        assert_eq!(state.state, JobState::Pending);
        assert!(!state.is_alive());
        assert!(state.log.is_empty());
    }

    #[test]
    fn read_peak_rss_kb_parses_real_proc_self_status() {
        let pid = std::process::id();
        let peak = read_peak_rss_kb(pid);
        assert!(peak.unwrap_or(0) > 0, "expected a positive VmHWM for the running test process");
    }

    #[test]
    fn read_peak_rss_kb_returns_none_for_nonexistent_pid() {
        assert_eq!(read_peak_rss_kb(u32::MAX), None);
    }

    #[test]
    fn take_log_drains_exactly_the_entries_present_at_read_time() {
        let supervisor = Supervisor::new();
        let mut state = SupervisorState::fresh();
        state.log.push(LogEntry::new("first".to_string(), crate::log_entry::LogLevel::Info));
        state.log.push(LogEntry::new("second".to_string(), crate::log_entry::LogLevel::Info));

        let drained = supervisor.take_log(&mut state);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].message, "first");
        assert_eq!(drained[1].message, "second");
        assert!(state.log.is_empty(), "drained entries must be removed from state");

        // A subsequent take with nothing appended yields nothing — the purge
        // does not reach into entries delivered by the prior call.
        assert!(supervisor.take_log(&mut state).is_empty());
    }

    #[test]
    fn state_snapshot_omits_null_fields_and_uses_camel_case_stats() {
        let snapshot = StateSnapshot {
            state: JobState::Running,
            message: Some("working".to_string()),
            progress: Some(0.5),
            results: None,
            log: Vec::new(),
            exception: None,
            stats: Some(Stats { peak_memory_usage: Some(4096) }),
            api_version: API_VERSION,
        };
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["state"], "RUNNING");
        assert!(value.get("results").is_none());
        assert!(value.get("exception").is_none());
        assert_eq!(value["stats"]["peakMemoryUsage"], 4096);
    }
}
