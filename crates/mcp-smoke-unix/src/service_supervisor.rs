use crate::unix_process_manager::{UnixProcessHandle, UnixProcessManager};
use async_trait::async_trait;
use mcp_smoke_core::{
    ProcessId, ProcessLifecycle, ProcessManager, ServiceHandle, ServiceSupervisor, SmokeError,
    SpawnSpec, TeardownRecord,
};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid as NixPid;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{error, info, warn};

/// Unix service supervisor
///
/// Composes [`UnixProcessManager`] for spawning and signalling, tracks every pid it
/// started until that process has been reaped, and kills whatever is still tracked
/// when it is dropped.
pub struct UnixServiceSupervisor {
    platform_manager: Arc<UnixProcessManager>,
    active_processes: Arc<Mutex<HashMap<ProcessId, String>>>,
    drain_bound: Duration,
}

impl UnixServiceSupervisor {
    /// `drain_bound` caps how long stop waits for each diagnostic drain task
    pub fn new(drain_bound: Duration) -> Self {
        Self {
            platform_manager: Arc::new(UnixProcessManager::new()),
            active_processes: Arc::new(Mutex::new(HashMap::new())),
            drain_bound,
        }
    }

    fn active(&self) -> std::sync::MutexGuard<'_, HashMap<ProcessId, String>> {
        self.active_processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for UnixServiceSupervisor {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[async_trait]
impl ServiceSupervisor for UnixServiceSupervisor {
    type Handle = UnixProcessHandle;

    async fn start(&self, spec: &SpawnSpec) -> Result<ServiceHandle<UnixProcessHandle>, SmokeError> {
        let spawned = self
            .platform_manager
            .spawn_process(spec)
            .await
            .map_err(|e| SmokeError::SpawnFailed(format!("{e:#}")))?;

        let handle = ServiceHandle::from_spawned(spawned, spec);
        if let Some(pid) = handle.pid() {
            self.active().insert(pid, format!("service:{}", spec.command));
        }
        Ok(handle)
    }

    async fn stop(
        &self,
        handle: &mut ServiceHandle<UnixProcessHandle>,
        grace: Duration,
    ) -> TeardownRecord {
        let record = handle
            .shutdown(self.platform_manager.as_ref(), grace, self.drain_bound)
            .await;

        if let Some(pid) = handle.pid() {
            if record.reaped {
                self.active().remove(&pid);
            }
            info!(
                pid = %pid,
                escalated = record.escalated,
                exit = ?record.exit,
                "Service stopped"
            );
        }
        record
    }

    fn abandon(&self, pid: ProcessId) {
        warn!(pid = %pid, "Killing abandoned service");
        kill_group(pid);
        self.active().remove(&pid);
    }

    fn tracked_pids(&self) -> Vec<ProcessId> {
        self.active().keys().copied().collect()
    }
}

/// SIGKILL the group led by `pid`, falling back to the single process
fn kill_group(pid: ProcessId) {
    let nix_pid = NixPid::from_raw(pid.0 as i32);
    match signal::killpg(nix_pid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => {
            warn!(pid = %pid, error = %e, "Failed to kill process group");
            if let Err(e) = signal::kill(nix_pid, Signal::SIGKILL) {
                error!(pid = %pid, error = %e, "Failed to kill process");
            }
        }
    }
}

impl Drop for UnixServiceSupervisor {
    fn drop(&mut self) {
        // Emergency cleanup using Unix signals
        let active_processes = self.tracked_pids();
        if active_processes.is_empty() {
            return;
        }

        warn!(
            count = active_processes.len(),
            "Emergency cleanup: killing tracked services during drop"
        );

        for pid in active_processes {
            kill_group(pid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp_smoke_core::{Readiness, ReadinessCheck, ServiceState, StdioRouting};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn sh(script: &str, stdio: StdioRouting) -> SpawnSpec {
        SpawnSpec::new("sh", stdio).args(["-c", script])
    }

    fn is_alive(pid: ProcessId) -> bool {
        signal::kill(NixPid::from_raw(pid.0 as i32), None).is_ok()
    }

    const INTERVAL: Duration = Duration::from_millis(20);

    /// Alive and not a zombie waiting on a parent that never reaps it
    fn is_running(pid: u32) -> bool {
        let pid = sysinfo::Pid::from_u32(pid);
        let mut system = sysinfo::System::new();
        system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
        system
            .process(pid)
            .is_some_and(|process| process.status() != sysinfo::ProcessStatus::Zombie)
    }

    async fn wait_until_gone(pid: u32) -> bool {
        for _ in 0..100 {
            if !is_running(pid) {
                return true;
            }
            tokio::time::sleep(INTERVAL).await;
        }
        false
    }

    #[tokio::test]
    async fn test_start_ready_stop() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let supervisor = UnixServiceSupervisor::default();
        let mut handle = supervisor
            .start(&sh(
                "echo hello; echo oops >&2; sleep 30",
                StdioRouting::Diagnostics,
            ))
            .await
            .unwrap();
        let pid = handle.pid().unwrap();
        assert_eq!(supervisor.tracked_pids(), vec![pid]);

        let check = ReadinessCheck::Alive {
            settle: Duration::from_millis(200),
        };
        let readiness = supervisor
            .await_ready(&mut handle, &check, Duration::from_secs(2), INTERVAL)
            .await;
        assert_eq!(readiness, Readiness::Ready);
        assert_eq!(handle.state(), ServiceState::Ready);

        let record = supervisor.stop(&mut handle, Duration::from_secs(3)).await;
        assert!(!record.already_exited);
        assert!(!record.escalated);
        assert!(record.reaped);
        assert!(!is_alive(pid));
        assert!(supervisor.tracked_pids().is_empty());

        let lines = handle.diagnostics().lines();
        assert!(lines.contains(&"[stdout] hello".to_string()), "{lines:?}");
        assert!(lines.contains(&"[stderr] oops".to_string()), "{lines:?}");
    }

    #[tokio::test]
    async fn test_abandon_kills_the_whole_group() {
        let supervisor = UnixServiceSupervisor::default();
        let mut handle = supervisor
            .start(&sh("sleep 60 & echo $!; wait", StdioRouting::Protocol))
            .await
            .unwrap();
        let pid = handle.pid().unwrap();
        let pipes = handle.take_protocol_pipes().unwrap();
        let mut lines = BufReader::new(pipes.stdout).lines();
        let grandchild: u32 = lines.next_line().await.unwrap().unwrap().parse().unwrap();
        assert!(is_running(grandchild));

        supervisor.abandon(pid);
        assert!(supervisor.tracked_pids().is_empty());
        drop(handle);

        assert!(wait_until_gone(grandchild).await, "grandchild {grandchild} survived");
        assert!(wait_until_gone(pid.0).await, "service {pid} survived");
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let supervisor = UnixServiceSupervisor::default();
        let mut handle = supervisor
            .start(&sh("sleep 30", StdioRouting::Diagnostics))
            .await
            .unwrap();

        let first = supervisor.stop(&mut handle, Duration::from_secs(3)).await;
        let second = supervisor.stop(&mut handle, Duration::from_secs(3)).await;
        assert_eq!(first, second);
        assert!(handle.is_stopped());
    }

    #[tokio::test]
    async fn test_immediate_exit_is_reported() {
        let supervisor = UnixServiceSupervisor::default();
        let mut handle = supervisor
            .start(&sh("echo fatal >&2; exit 3", StdioRouting::Protocol))
            .await
            .unwrap();

        let check = ReadinessCheck::Alive {
            settle: Duration::from_secs(2),
        };
        let readiness = supervisor
            .await_ready(&mut handle, &check, Duration::from_secs(2), INTERVAL)
            .await;
        let Readiness::Exited(status) = readiness else {
            panic!("expected exit, got {readiness:?}");
        };
        assert_eq!(status.exit_code(), Some(3));

        let record = supervisor.stop(&mut handle, Duration::from_secs(1)).await;
        assert!(record.already_exited);
        assert!(!record.escalated);
        assert_eq!(record.exit.as_deref(), Some("exit code 3"));
        assert!(handle.diagnostics().lines().contains(&"[stderr] fatal".to_string()));
    }

    #[tokio::test]
    async fn test_sigterm_ignored_escalates() {
        let supervisor = UnixServiceSupervisor::default();
        let mut handle = supervisor
            .start(&sh("trap '' TERM; echo armed; sleep 30", StdioRouting::Diagnostics))
            .await
            .unwrap();
        let pid = handle.pid().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let record = supervisor
            .stop(&mut handle, Duration::from_millis(200))
            .await;
        assert!(record.escalated);
        assert_eq!(record.exit.as_deref(), Some("killed by signal 9"));
        assert!(!is_alive(pid));
    }

    #[tokio::test]
    async fn test_protocol_pipes_reach_the_process() {
        let supervisor = UnixServiceSupervisor::default();
        let mut handle = supervisor
            .start(&SpawnSpec::new("cat", StdioRouting::Protocol))
            .await
            .unwrap();

        let pipes = handle.take_protocol_pipes().unwrap();
        assert!(handle.take_protocol_pipes().is_none());
        let mut stdin = pipes.stdin;
        let mut lines = BufReader::new(pipes.stdout).lines();
        stdin.write_all(b"{\"ping\":1}\n").await.unwrap();
        stdin.flush().await.unwrap();
        let echoed = lines.next_line().await.unwrap();
        assert_eq!(echoed.as_deref(), Some("{\"ping\":1}"));

        drop(stdin);
        let record = supervisor.stop(&mut handle, Duration::from_secs(2)).await;
        assert!(record.reaped);
    }

    #[tokio::test]
    async fn test_tcp_readiness_fails_for_silent_process() {
        let supervisor = UnixServiceSupervisor::default();
        let mut handle = supervisor
            .start(&sh("sleep 30", StdioRouting::Diagnostics))
            .await
            .unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let readiness = supervisor
            .await_ready(
                &mut handle,
                &ReadinessCheck::TcpListening { addr },
                Duration::from_millis(300),
                INTERVAL,
            )
            .await;
        assert_eq!(readiness, Readiness::StillStarting);
        supervisor.stop(&mut handle, Duration::from_secs(2)).await;
    }
}
