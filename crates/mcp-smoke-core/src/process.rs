use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tracing::{debug, error, info, warn};

/// Upper bound on reaping a process after SIGKILL
const REAP_BOUND: Duration = Duration::from_secs(5);

/// Unique identifier for a process
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::From, derive_more::Display,
)]
pub struct ProcessId(pub u32);

/// Status of a process as observed by the harness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Process is currently running
    Running,
    /// Process exited, either with a code or killed by a signal
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
}

impl ProcessStatus {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessStatus::Exited { code, .. } => *code,
            ProcessStatus::Running => None,
        }
    }

    pub fn has_exited(&self) -> bool {
        matches!(self, ProcessStatus::Exited { .. })
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessStatus::Running => f.write_str("running"),
            ProcessStatus::Exited {
                code: Some(code), ..
            } => write!(f, "exit code {code}"),
            ProcessStatus::Exited {
                signal: Some(signal),
                ..
            } => write!(f, "killed by signal {signal}"),
            ProcessStatus::Exited { .. } => f.write_str("exited"),
        }
    }
}

/// Result of a process termination operation
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// Signal delivered or process reaped
    Success,
    /// Process was not found (already exited)
    ProcessNotFound,
    /// Permission denied (insufficient privileges)
    AccessDenied,
    /// Operation timed out
    Timeout,
    /// Operation failed with specific error message
    Failed(String),
}

/// What a full graceful-then-forced termination achieved
#[derive(Debug, Clone, PartialEq)]
pub struct TerminationOutcome {
    /// Final status once reaped, `None` if reaping did not complete
    pub status: Option<ProcessStatus>,
    /// SIGKILL was needed
    pub escalated: bool,
    pub result: TerminationResult,
    /// Descendants killed after the root exited
    pub stragglers_killed: usize,
}

/// Where the standard streams of a spawned service go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioRouting {
    /// stdin/stdout carry the protocol, stderr is drained
    Protocol,
    /// stdin is closed, stdout and stderr are both drained
    Diagnostics,
}

/// Everything needed to launch one service instance
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub stdio: StdioRouting,
    pub diagnostic_lines: usize,
}

impl SpawnSpec {
    pub fn new(command: impl Into<String>, stdio: StdioRouting) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            stdio,
            diagnostic_lines: 200,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<S: Into<String>, I: IntoIterator<Item = S>>(mut self, args: I) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// A freshly spawned process together with the pipes it was given
pub struct SpawnedProcess<H> {
    pub handle: H,
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

/// Trait representing a handle to a running process
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// Get the process ID (None once the process has been reaped)
    fn get_pid(&self) -> Option<ProcessId>;

    /// Get the command that started this process
    fn get_command(&self) -> &str;

    /// Try to get exit status without blocking
    async fn try_wait(&mut self) -> Result<Option<ProcessStatus>>;

    /// Wait for the process to exit and reap it
    async fn wait(&mut self) -> Result<ProcessStatus>;

    /// Kill the process and reap it
    async fn kill(&mut self) -> Result<()>;
}

/// Spawning and observing processes
#[async_trait]
pub trait ProcessLifecycle: Send + Sync {
    /// The type of process handle this lifecycle manager produces
    type Handle: ProcessHandle;

    /// Spawn a new process with all standard streams captured
    async fn spawn_process(&self, spec: &SpawnSpec) -> Result<SpawnedProcess<Self::Handle>>;
}

/// Signal-level termination of a process and its descendants
#[async_trait]
pub trait ProcessTermination: Send + Sync {
    /// Ask the process (group) to terminate (SIGTERM on Unix)
    async fn terminate_gracefully(&self, handle: &mut dyn ProcessHandle) -> TerminationResult;

    /// Force kill the process (group) (SIGKILL on Unix)
    async fn force_kill(&self, handle: &mut dyn ProcessHandle) -> TerminationResult;

    /// Find all descendants of a given process
    async fn find_child_processes(&self, pid: ProcessId) -> Result<Vec<ProcessId>>;

    /// Kill whichever of `pids` are still alive, returning how many were
    async fn kill_stragglers(&self, pids: &[ProcessId]) -> usize;

    /// Graceful termination with escalation: SIGTERM, wait `grace`, SIGKILL, reap.
    ///
    /// Safe to call on a process that already exited; in that case it only reaps.
    async fn terminate_with_grace(
        &self,
        handle: &mut dyn ProcessHandle,
        grace: Duration,
    ) -> TerminationOutcome {
        match handle.try_wait().await {
            Ok(Some(status)) => {
                debug!(command = handle.get_command(), %status, "Process already exited");
                return TerminationOutcome {
                    status: Some(status),
                    escalated: false,
                    result: TerminationResult::ProcessNotFound,
                    stragglers_killed: 0,
                };
            }
            Ok(None) => {}
            Err(e) => warn!(command = handle.get_command(), error = %e, "try_wait failed"),
        }

        // Descendants re-parent once the root dies, so capture them up front
        let descendants = match handle.get_pid() {
            Some(pid) => self.find_child_processes(pid).await.unwrap_or_else(|e| {
                warn!(pid = %pid, error = %e, "Failed to enumerate descendants");
                Vec::new()
            }),
            None => Vec::new(),
        };

        let graceful = self.terminate_gracefully(handle).await;
        if matches!(
            graceful,
            TerminationResult::Success | TerminationResult::ProcessNotFound
        ) {
            match tokio::time::timeout(grace, handle.wait()).await {
                Ok(Ok(status)) => {
                    info!(command = handle.get_command(), %status, "Process exited after SIGTERM");
                    let stragglers_killed = self.kill_stragglers(&descendants).await;
                    return TerminationOutcome {
                        status: Some(status),
                        escalated: false,
                        result: TerminationResult::Success,
                        stragglers_killed,
                    };
                }
                Ok(Err(e)) => {
                    warn!(command = handle.get_command(), error = %e, "Wait after SIGTERM failed")
                }
                Err(_) => warn!(
                    command = handle.get_command(),
                    grace_ms = grace.as_millis() as u64,
                    "Process ignored SIGTERM, escalating to SIGKILL"
                ),
            }
        }

        let forced = self.force_kill(handle).await;
        let status = match tokio::time::timeout(REAP_BOUND, handle.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                error!(command = handle.get_command(), error = %e, "Failed to reap process");
                None
            }
            Err(_) => {
                error!(command = handle.get_command(), "Process could not be reaped after SIGKILL");
                None
            }
        };
        let stragglers_killed = self.kill_stragglers(&descendants).await;

        let result = match (&status, forced) {
            (Some(_), _) => TerminationResult::Success,
            (None, TerminationResult::Success) => TerminationResult::Timeout,
            (None, other) => other,
        };

        TerminationOutcome {
            status,
            escalated: true,
            result,
            stragglers_killed,
        }
    }
}

/// Platform process manager combining lifecycle and termination
pub trait ProcessManager: ProcessLifecycle + ProcessTermination {
    /// Create a new process manager instance
    fn new() -> Self
    where
        Self: Sized;
}

/// Factory trait for creating platform-specific process managers
pub trait ProcessManagerFactory {
    /// The type of process manager this factory creates
    type Manager: ProcessManager;

    /// Create a process manager for the current platform
    fn create_process_manager() -> Self::Manager;

    /// Get the platform name for logging and debugging
    fn platform_name() -> &'static str;
}
