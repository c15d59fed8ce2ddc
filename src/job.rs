//! Job lifecycle around one OS process.
//!
//! A [`Job`] wraps a single shell command run through `sh -c`. The
//! scheduler starts, pauses, resumes, and terminates jobs through the
//! signal layer; a monitor task reaps the process and publishes the exit
//! status. All lifecycle methods take `&self` so jobs can be shared as
//! `Arc<Job>` between the scheduler and other callers.

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::JobError;
use crate::signals::signal_name;
use crate::spec::TaskInstance;
use crate::template::{Renderer, discard_instance_files};

/// State of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum JobState {
    /// Job is waiting to be started.
    Pending = 0,
    /// Job's process is running.
    Running = 1,
    /// Job's process has exited or was terminated. Terminal.
    Finished = 2,
    /// Job's process is suspended by the scheduler.
    Stopped = 3,
}

impl JobState {
    /// Decode a raw cell value. Anything outside the four states is
    /// invalid.
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Pending),
            1 => Some(Self::Running),
            2 => Some(Self::Finished),
            3 => Some(Self::Stopped),
            _ => None,
        }
    }

    /// Check if this is the terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// Shared job-state cell.
///
/// Written from the job's monitor context when the process exits and from
/// the scheduler side on pause/resume/terminate, read lock-free
/// everywhere. Finished is terminal: a store racing the monitor task's
/// verdict loses, so the cell never leaves Finished. A raw value outside
/// the four states means the cell was corrupted and [`StateCell::load`]
/// panics rather than guessing.
#[derive(Debug, Clone)]
pub struct StateCell(Arc<AtomicU8>);

impl StateCell {
    pub fn new(state: JobState) -> Self {
        Self(Arc::new(AtomicU8::new(state as u8)))
    }

    pub fn load(&self) -> JobState {
        let raw = self.0.load(Ordering::SeqCst);
        match JobState::from_raw(raw) {
            Some(state) => state,
            None => panic!("invalid job state value {raw}"),
        }
    }

    /// Publish a new state. Once the cell holds Finished, every later
    /// store is a no-op.
    pub fn store(&self, state: JobState) {
        let _ = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |raw| {
                match JobState::from_raw(raw) {
                    Some(current) if current.is_terminal() => None,
                    _ => Some(state as u8),
                }
            });
    }
}

/// Standard stream sinks for a job's process, supplied by whoever creates
/// the job. The job duplicates the handles for each spawn attempt and
/// never closes the creator's side.
#[derive(Debug)]
pub struct OutputSinks {
    pub stdout: File,
    pub stderr: File,
}

/// Decoded exit status.
#[derive(Debug, Clone, Copy, Serialize)]
struct Outcome {
    code: Option<i32>,
    signal: Option<i32>,
}

/// Serializable read-only view of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub name: String,
    pub command: String,
    pub state: JobState,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
}

/// One schedulable unit of work backed by one OS process.
pub struct Job {
    id: Uuid,
    name: String,
    command: String,
    niceness: i32,
    state: StateCell,
    pid: OnceLock<u32>,
    outcome: OnceLock<Outcome>,
    wait_rx: Mutex<Option<oneshot::Receiver<std::io::Result<ExitStatus>>>>,
    sinks: OutputSinks,
    instance_files: HashMap<PathBuf, PathBuf>,
}

impl Job {
    /// Create a pending job. The command must be non-blank and the
    /// niceness within the scheduler range `-20..=19`; both are checked
    /// here so no invalid job is ever constructed.
    pub fn new(
        command: impl Into<String>,
        name: Option<String>,
        niceness: i32,
        sinks: OutputSinks,
    ) -> Result<Self, JobError> {
        let command = command.into();
        if command.trim().is_empty() {
            return Err(JobError::EmptyCommand);
        }
        if !(-20..=19).contains(&niceness) {
            return Err(JobError::NicenessOutOfRange { niceness });
        }
        let name = name.unwrap_or_else(|| command.clone());
        Ok(Self {
            id: Uuid::new_v4(),
            name,
            command,
            niceness,
            state: StateCell::new(JobState::Pending),
            pid: OnceLock::new(),
            outcome: OnceLock::new(),
            wait_rx: Mutex::new(None),
            sinks,
            instance_files: HashMap::new(),
        })
    }

    /// Create a job from an expanded task instance, materializing any
    /// template-file conversions left in its command. Instance files are
    /// written to the current directory.
    pub fn from_instance(
        instance: &TaskInstance,
        niceness: i32,
        sinks: OutputSinks,
    ) -> crate::error::Result<Self> {
        Self::from_instance_in(instance, niceness, sinks, Path::new("."))
    }

    /// Like [`Job::from_instance`] with an explicit directory for
    /// instance files.
    pub fn from_instance_in(
        instance: &TaskInstance,
        niceness: i32,
        sinks: OutputSinks,
        instance_dir: &Path,
    ) -> crate::error::Result<Self> {
        let rendered = Renderer::new(&instance.record)
            .with_instance_dir(instance_dir)
            .materialize(&instance.command)?;
        match Self::new(rendered.text, Some(instance.name.clone()), niceness, sinks) {
            Ok(mut job) => {
                job.instance_files = rendered.instance_files;
                Ok(job)
            }
            Err(e) => {
                // A rejected job leaves nobody to own the files.
                discard_instance_files(&rendered.instance_files);
                Err(e.into())
            }
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn niceness(&self) -> i32 {
        self.niceness
    }

    /// Process id, absent until the first successful spawn.
    pub fn pid(&self) -> Option<u32> {
        self.pid.get().copied()
    }

    pub fn state(&self) -> JobState {
        self.state.load()
    }

    /// Exit code, absent until the process was reaped (and absent for
    /// signal-terminated processes).
    pub fn exit_code(&self) -> Option<i32> {
        self.outcome.get().and_then(|o| o.code)
    }

    /// Terminating signal, absent unless the process died from one.
    pub fn exit_signal(&self) -> Option<i32> {
        self.outcome.get().and_then(|o| o.signal)
    }

    /// Instance files written for this job, keyed by instance path with
    /// the original template path as value.
    pub fn instance_files(&self) -> &HashMap<PathBuf, PathBuf> {
        &self.instance_files
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            name: self.name.clone(),
            command: self.command.clone(),
            state: self.state(),
            pid: self.pid(),
            exit_code: self.exit_code(),
            exit_signal: self.exit_signal(),
        }
    }

    /// Short outcome tag for listings: `[0]` for a clean exit, `[1]` for
    /// a failing one, `[SIGTERM]` for a signal death. `None` while the
    /// exit status is unknown.
    pub fn describe_outcome(&self) -> Option<String> {
        let outcome = self.outcome.get()?;
        Some(match (outcome.code, outcome.signal) {
            (Some(code), _) => format!("[{code}]"),
            (None, Some(sig)) => match signal_name(sig) {
                Some(name) => format!("[{name}]"),
                None => format!("[signal {sig}]"),
            },
            (None, None) => "[?]".to_string(),
        })
    }

    /// Whether the job finished with a zero exit code and no terminating
    /// signal. `None` while the exit status is unknown.
    pub fn succeeded(&self) -> Option<bool> {
        self.outcome
            .get()
            .map(|o| o.code == Some(0) && o.signal.is_none())
    }

    /// Spawn the job's process and transition to Running.
    ///
    /// The process runs `sh -c <command>` in its own process group with
    /// the configured niceness and the creator's output sinks. A monitor
    /// task reaps it, publishes the exit status, and stores Finished.
    ///
    /// A spawn failure from momentary resource contention is logged and
    /// swallowed, leaving the job Pending without a pid so the next
    /// reconciliation pass retries it. Any other spawn failure is
    /// propagated.
    pub async fn start(&self) -> Result<(), JobError> {
        let stdout = self.sinks.stdout.try_clone()?;
        let stderr = self.sinks.stderr.try_clone()?;

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .process_group(0);
        if self.niceness != 0 {
            let niceness = self.niceness;
            unsafe {
                command.pre_exec(move || {
                    if libc::setpriority(libc::PRIO_PROCESS, 0, niceness) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return self.spawn_failed(e),
        };

        if let Some(pid) = child.id() {
            let _ = self.pid.set(pid);
        }
        self.state.store(JobState::Running);
        debug!(job = %self.name, pid = ?child.id(), "started");

        let (tx, rx) = oneshot::channel();
        *self.wait_rx.lock().await = Some(rx);
        let state = self.state.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            let result = child.wait().await;
            if let Err(e) = &result {
                warn!(job = %name, error = %e, "waiting for job process failed");
            }
            // Send before the state flip: anyone observing Finished can
            // collect the status without blocking.
            let _ = tx.send(result);
            state.store(JobState::Finished);
        });

        Ok(())
    }

    /// Transient failures are logged and swallowed, leaving the job
    /// Pending with no pid for the next pass to retry; the rest
    /// propagate.
    fn spawn_failed(&self, err: std::io::Error) -> Result<(), JobError> {
        if is_transient_spawn(&err) {
            warn!(job = %self.name, error = %err, "transient spawn failure, retrying next pass");
            return Ok(());
        }
        Err(JobError::Spawn(err))
    }

    /// Suspend the process group. Requires a pid; a process that is
    /// already gone is left for the monitor task to finish, and a job
    /// that already finished stays finished even if the stop signal
    /// lands on surviving group members.
    pub fn pause(&self) -> Result<(), JobError> {
        let pid = self.pid().ok_or(JobError::NotStarted)?;
        match killpg(Pid::from_raw(pid as i32), Signal::SIGSTOP) {
            Ok(()) => {
                self.state.store(JobState::Stopped);
                debug!(job = %self.name, pid, "paused");
                Ok(())
            }
            Err(Errno::ESRCH) => {
                debug!(job = %self.name, pid, "process gone before pause");
                Ok(())
            }
            Err(e) => Err(JobError::Signal {
                signal: "SIGSTOP".to_string(),
                pid,
                source: e,
            }),
        }
    }

    /// Continue a suspended process group. A finished job stays
    /// finished.
    pub fn resume(&self) -> Result<(), JobError> {
        let pid = self.pid().ok_or(JobError::NotStarted)?;
        match killpg(Pid::from_raw(pid as i32), Signal::SIGCONT) {
            Ok(()) => {
                self.state.store(JobState::Running);
                debug!(job = %self.name, pid, "resumed");
                Ok(())
            }
            Err(Errno::ESRCH) => {
                debug!(job = %self.name, pid, "process gone before resume");
                Ok(())
            }
            Err(e) => Err(JobError::Signal {
                signal: "SIGCONT".to_string(),
                pid,
                source: e,
            }),
        }
    }

    /// Fire-and-forget termination: SIGTERM the process group if one
    /// exists and force the state to Finished without waiting for the OS.
    /// The SIGCONT chaser lets a stopped process act on the SIGTERM.
    pub fn terminate(&self) {
        if let Some(pid) = self.pid() {
            let pgid = Pid::from_raw(pid as i32);
            let _ = killpg(pgid, Signal::SIGTERM);
            let _ = killpg(pgid, Signal::SIGCONT);
            debug!(job = %self.name, pid, "terminated");
        }
        self.state.store(JobState::Finished);
    }

    /// Collect the process's exit status, blocking until the monitor task
    /// reports it. Idempotent; a job that never started is a no-op.
    pub async fn await_exit(&self) -> Result<(), JobError> {
        if self.outcome.get().is_some() {
            return Ok(());
        }
        let rx = self.wait_rx.lock().await.take();
        let Some(rx) = rx else {
            return Ok(());
        };
        let status = rx
            .await
            .map_err(|_| JobError::Wait("job monitor went away".to_string()))?
            .map_err(|e| JobError::Wait(e.to_string()))?;

        let outcome = Outcome {
            code: status.code(),
            signal: status.signal(),
        };
        let _ = self.outcome.set(outcome);
        self.state.store(JobState::Finished);
        debug!(
            job = %self.name,
            outcome = self.describe_outcome().as_deref().unwrap_or("[?]"),
            "finished"
        );
        Ok(())
    }

    /// Delete the instance files written for this job's template-file
    /// conversions. Called when a finished job is discarded.
    pub fn remove_instance_files(&self) {
        discard_instance_files(&self.instance_files);
    }
}

/// Whether a spawn failure is momentary resource exhaustion rather than
/// a broken job. `EAGAIN` from `fork` surfaces as `WouldBlock`.
fn is_transient_spawn(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("pid", &self.pid())
            .finish_non_exhaustive()
    }
}
