use crate::diagnostics::{DiagnosticLog, DrainTask};
use crate::error::SmokeError;
use crate::process::{
    ProcessHandle, ProcessId, ProcessStatus, ProcessTermination, SpawnSpec, SpawnedProcess,
    StdioRouting,
};
use crate::report::TeardownRecord;
use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{ChildStdin, ChildStdout};
use tracing::{debug, info, warn};

/// Liveness of a supervised service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Starting,
    Ready,
    Exited(ProcessStatus),
}

/// How to decide that a freshly started service can be talked to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessCheck {
    /// The process stayed alive for the settle period
    Alive { settle: Duration },
    /// The address accepts TCP connections
    TcpListening { addr: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    StillStarting,
    Exited(ProcessStatus),
}

/// stdin/stdout of a service that speaks the protocol over pipes
pub struct ProtocolPipes {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

/// One running service instance, owned by exactly one mode run
pub struct ServiceHandle<H: ProcessHandle> {
    process: H,
    pid: Option<ProcessId>,
    command: String,
    state: ServiceState,
    diagnostics: DiagnosticLog,
    drains: Vec<DrainTask>,
    pipes: Option<ProtocolPipes>,
    teardown: Option<TeardownRecord>,
}

impl<H: ProcessHandle> ServiceHandle<H> {
    /// Wrap a spawned process, starting one drain task per diagnostic stream
    pub fn from_spawned(spawned: SpawnedProcess<H>, spec: &SpawnSpec) -> Self {
        let SpawnedProcess {
            handle,
            stdin,
            stdout,
            stderr,
        } = spawned;
        let diagnostics = DiagnosticLog::new(spec.diagnostic_lines);
        let mut drains = Vec::new();

        if let Some(stderr) = stderr {
            drains.push(DrainTask::spawn(stderr, "stderr", diagnostics.clone()));
        }

        let pipes = match spec.stdio {
            StdioRouting::Protocol => match (stdin, stdout) {
                (Some(stdin), Some(stdout)) => Some(ProtocolPipes { stdin, stdout }),
                _ => None,
            },
            StdioRouting::Diagnostics => {
                if let Some(stdout) = stdout {
                    drains.push(DrainTask::spawn(stdout, "stdout", diagnostics.clone()));
                }
                None
            }
        };

        Self {
            pid: handle.get_pid(),
            process: handle,
            command: spec.command.clone(),
            state: ServiceState::Starting,
            diagnostics,
            drains,
            pipes,
            teardown: None,
        }
    }

    /// Pid assigned at spawn time, kept after the process is reaped
    pub fn pid(&self) -> Option<ProcessId> {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn diagnostics(&self) -> &DiagnosticLog {
        &self.diagnostics
    }

    pub fn process_mut(&mut self) -> &mut H {
        &mut self.process
    }

    pub fn take_protocol_pipes(&mut self) -> Option<ProtocolPipes> {
        self.pipes.take()
    }

    pub fn mark_ready(&mut self) {
        if self.state == ServiceState::Starting {
            self.state = ServiceState::Ready;
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.teardown.is_some()
    }

    pub fn teardown(&self) -> Option<&TeardownRecord> {
        self.teardown.as_ref()
    }

    /// Non-blocking liveness check; records the exit when it happened
    pub async fn poll_exit(&mut self) -> Option<ProcessStatus> {
        if let ServiceState::Exited(status) = self.state {
            return Some(status);
        }
        match self.process.try_wait().await {
            Ok(Some(status)) => {
                info!(pid = ?self.pid, %status, "Service exited");
                self.state = ServiceState::Exited(status);
                Some(status)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(pid = ?self.pid, error = %e, "Failed to poll service status");
                None
            }
        }
    }

    /// Terminate, reap and stop draining. Repeated calls return the first record.
    pub async fn shutdown<T>(&mut self, terminator: &T, grace: Duration, drain_bound: Duration) -> TeardownRecord
    where
        T: ProcessTermination + ?Sized,
    {
        if let Some(record) = &self.teardown {
            debug!(pid = ?self.pid, "Service already stopped");
            return record.clone();
        }

        let already_exited = self.poll_exit().await.is_some();
        // Closing stdin lets a piped service notice the end of the session
        self.pipes = None;

        let outcome = terminator
            .terminate_with_grace(&mut self.process, grace)
            .await;
        if let Some(status) = outcome.status {
            self.state = ServiceState::Exited(status);
        }

        for drain in std::mem::take(&mut self.drains) {
            let source = drain.source();
            let lines = drain.shutdown(drain_bound).await;
            debug!(pid = ?self.pid, source, lines, "Diagnostic drain stopped");
        }

        let record = TeardownRecord {
            already_exited,
            escalated: outcome.escalated,
            exit: outcome.status.map(|status| status.to_string()),
            reaped: outcome.status.is_some(),
            stragglers_killed: outcome.stragglers_killed,
        };
        if !record.reaped {
            warn!(pid = ?self.pid, command = %self.command, "Service could not be reaped");
        }
        self.teardown = Some(record.clone());
        record
    }
}

impl<H: ProcessHandle> Drop for ServiceHandle<H> {
    fn drop(&mut self) {
        if self.teardown.is_none() {
            // kill_on_drop on the child covers the process itself
            warn!(pid = ?self.pid, command = %self.command, "Service handle dropped without stop");
            for drain in &self.drains {
                drain.cancel();
            }
        }
    }
}

/// Poll `check` every `interval` until it holds, the process exits or `max_wait` passes
pub async fn await_ready<H: ProcessHandle>(
    handle: &mut ServiceHandle<H>,
    check: &ReadinessCheck,
    max_wait: Duration,
    interval: Duration,
) -> Readiness {
    if let Some(status) = handle.poll_exit().await {
        return Readiness::Exited(status);
    }

    let interval = interval.max(Duration::from_millis(1));
    let readiness = match check {
        ReadinessCheck::Alive { settle } => {
            let settle = (*settle).min(max_wait);
            tokio::select! {
                biased;
                status = watch_exit(&mut handle.process, interval) => Readiness::Exited(status),
                _ = tokio::time::sleep(settle) => Readiness::Ready,
            }
        }
        ReadinessCheck::TcpListening { addr } => {
            let attempts = (max_wait.as_millis() / interval.as_millis()) as usize + 1;
            let poll = ConstantBuilder::default()
                .with_delay(interval)
                .with_max_times(attempts);
            let probe = (|| TcpStream::connect(addr.as_str())).retry(poll);
            tokio::select! {
                biased;
                status = watch_exit(&mut handle.process, interval) => Readiness::Exited(status),
                connected = tokio::time::timeout(max_wait, probe) => match connected {
                    Ok(Ok(_)) => Readiness::Ready,
                    Ok(Err(e)) => {
                        debug!(addr = %addr, error = %e, "Service port never accepted a connection");
                        Readiness::StillStarting
                    }
                    Err(_) => Readiness::StillStarting,
                },
            }
        }
    };

    match readiness {
        Readiness::Ready => {
            handle.mark_ready();
            info!(pid = ?handle.pid, "Service ready");
        }
        Readiness::Exited(status) => {
            info!(pid = ?handle.pid, %status, "Service exited during startup");
            handle.state = ServiceState::Exited(status);
        }
        Readiness::StillStarting => {
            warn!(pid = ?handle.pid, max_wait_ms = max_wait.as_millis() as u64, "Service not ready in time");
        }
    }
    readiness
}

async fn watch_exit<H: ProcessHandle>(process: &mut H, interval: Duration) -> ProcessStatus {
    loop {
        if let Ok(Some(status)) = process.try_wait().await {
            return status;
        }
        tokio::time::sleep(interval).await;
    }
}

/// Starts, observes and stops service instances
#[async_trait]
pub trait ServiceSupervisor: Send + Sync {
    type Handle: ProcessHandle;

    /// Launch a service without waiting for readiness
    async fn start(&self, spec: &SpawnSpec) -> Result<ServiceHandle<Self::Handle>, SmokeError>;

    async fn await_ready(
        &self,
        handle: &mut ServiceHandle<Self::Handle>,
        check: &ReadinessCheck,
        max_wait: Duration,
        interval: Duration,
    ) -> Readiness {
        await_ready(handle, check, max_wait, interval).await
    }

    /// Graceful-then-forced termination. Idempotent and never fails.
    async fn stop(&self, handle: &mut ServiceHandle<Self::Handle>, grace: Duration)
    -> TeardownRecord;

    /// Kill the process group of a service whose handle is going away unstopped.
    /// Synchronous so it can run from `Drop`; the pid is no longer tracked afterwards.
    fn abandon(&self, pid: ProcessId);

    /// Pids started by this supervisor and not yet stopped
    fn tracked_pids(&self) -> Vec<ProcessId>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::collections::VecDeque;

    /// Handle whose exit is scripted by a queue of try_wait answers
    struct ScriptedHandle {
        answers: VecDeque<Option<ProcessStatus>>,
        exited: Option<ProcessStatus>,
    }

    impl ScriptedHandle {
        fn new(answers: Vec<Option<ProcessStatus>>) -> Self {
            Self {
                answers: answers.into(),
                exited: None,
            }
        }
    }

    #[async_trait]
    impl ProcessHandle for ScriptedHandle {
        fn get_pid(&self) -> Option<ProcessId> {
            Some(ProcessId(1))
        }

        fn get_command(&self) -> &str {
            "scripted"
        }

        async fn try_wait(&mut self) -> Result<Option<ProcessStatus>> {
            if self.exited.is_some() {
                return Ok(self.exited);
            }
            let answer = self.answers.pop_front().flatten();
            self.exited = answer;
            Ok(answer)
        }

        async fn wait(&mut self) -> Result<ProcessStatus> {
            let status = ProcessStatus::Exited {
                code: Some(0),
                signal: None,
            };
            self.exited = Some(status);
            Ok(status)
        }

        async fn kill(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn handle(answers: Vec<Option<ProcessStatus>>) -> ServiceHandle<ScriptedHandle> {
        let spawned = SpawnedProcess {
            handle: ScriptedHandle::new(answers),
            stdin: None,
            stdout: None,
            stderr: None,
        };
        ServiceHandle::from_spawned(spawned, &SpawnSpec::new("scripted", StdioRouting::Protocol))
    }

    const EXIT_1: ProcessStatus = ProcessStatus::Exited {
        code: Some(1),
        signal: None,
    };

    #[tokio::test]
    async fn test_alive_check_ready_when_process_survives() {
        let mut handle = handle(vec![]);
        let check = ReadinessCheck::Alive {
            settle: Duration::from_millis(30),
        };
        let readiness =
            await_ready(&mut handle, &check, Duration::from_secs(1), Duration::from_millis(5)).await;
        assert_eq!(readiness, Readiness::Ready);
        assert_eq!(handle.state(), ServiceState::Ready);
    }

    #[tokio::test]
    async fn test_exit_during_settle_is_reported() {
        let mut handle = handle(vec![None, None, Some(EXIT_1)]);
        let check = ReadinessCheck::Alive {
            settle: Duration::from_secs(5),
        };
        let readiness =
            await_ready(&mut handle, &check, Duration::from_secs(5), Duration::from_millis(5)).await;
        assert_eq!(readiness, Readiness::Exited(EXIT_1));
        assert_eq!(handle.state(), ServiceState::Exited(EXIT_1));
        assert_eq!(handle.poll_exit().await, Some(EXIT_1));
    }

    #[tokio::test]
    async fn test_tcp_check_still_starting_when_nothing_listens() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut handle = handle(vec![]);
        let check = ReadinessCheck::TcpListening { addr };
        let started = std::time::Instant::now();
        let readiness = await_ready(
            &mut handle,
            &check,
            Duration::from_millis(200),
            Duration::from_millis(20),
        )
        .await;
        assert_eq!(readiness, Readiness::StillStarting);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(handle.state(), ServiceState::Starting);
    }

    #[tokio::test]
    async fn test_tcp_check_ready_when_listening() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let mut handle = handle(vec![]);
        let check = ReadinessCheck::TcpListening { addr };
        let readiness = await_ready(
            &mut handle,
            &check,
            Duration::from_secs(1),
            Duration::from_millis(20),
        )
        .await;
        assert_eq!(readiness, Readiness::Ready);
    }
}
