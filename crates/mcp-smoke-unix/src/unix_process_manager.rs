use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use mcp_smoke_core::{
    ProcessHandle, ProcessId, ProcessLifecycle, ProcessManager, ProcessStatus, ProcessTermination,
    SpawnSpec, SpawnedProcess, StdioRouting, TerminationResult,
};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid as NixPid;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::{Mutex, PoisonError};
use sysinfo::System;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Unix-specific process handle implementation
pub struct UnixProcessHandle {
    child: Child,
    command: String,
}

impl UnixProcessHandle {
    pub fn new(child: Child, command: String) -> Self {
        Self { child, command }
    }
}

fn to_status(status: ExitStatus) -> ProcessStatus {
    ProcessStatus::Exited {
        code: status.code(),
        signal: status.signal(),
    }
}

#[async_trait]
impl ProcessHandle for UnixProcessHandle {
    fn get_pid(&self) -> Option<ProcessId> {
        self.child.id().map(ProcessId::from)
    }

    fn get_command(&self) -> &str {
        &self.command
    }

    async fn try_wait(&mut self) -> Result<Option<ProcessStatus>> {
        Ok(self.child.try_wait()?.map(to_status))
    }

    async fn wait(&mut self) -> Result<ProcessStatus> {
        let status = self.child.wait().await?;
        Ok(to_status(status))
    }

    async fn kill(&mut self) -> Result<()> {
        self.child
            .kill()
            .await
            .map_err(|e| anyhow!("Failed to kill process: {}", e))
    }
}

/// Unix-specific process manager: process groups for signalling, sysinfo for descendants
pub struct UnixProcessManager {
    system: Mutex<System>,
}

impl Default for UnixProcessManager {
    fn default() -> Self {
        <Self as ProcessManager>::new()
    }
}

#[async_trait]
impl ProcessLifecycle for UnixProcessManager {
    type Handle = UnixProcessHandle;

    async fn spawn_process(&self, spec: &SpawnSpec) -> Result<SpawnedProcess<UnixProcessHandle>> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match spec.stdio {
            StdioRouting::Protocol => cmd.stdin(Stdio::piped()),
            StdioRouting::Diagnostics => cmd.stdin(Stdio::null()),
        };

        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        // Own process group so the whole tree can be signalled at once
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn `{}`", spec.command))?;

        info!(
            pid = ?child.id(),
            command = %spec.command,
            args = ?spec.args,
            "Spawned service process"
        );

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        Ok(SpawnedProcess {
            handle: UnixProcessHandle::new(child, spec.command.clone()),
            stdin,
            stdout,
            stderr,
        })
    }
}

#[async_trait]
impl ProcessTermination for UnixProcessManager {
    async fn terminate_gracefully(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
        match handle.get_pid() {
            Some(pid) => signal_group(pid, Signal::SIGTERM),
            None => TerminationResult::ProcessNotFound,
        }
    }

    async fn force_kill(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
        let Some(pid) = handle.get_pid() else {
            return TerminationResult::ProcessNotFound;
        };
        match signal_group(pid, Signal::SIGKILL) {
            TerminationResult::Success => TerminationResult::Success,
            other => {
                // Fall back to the child handle itself
                debug!(pid = %pid, result = ?other, "Group SIGKILL failed, killing child directly");
                match handle.kill().await {
                    Ok(()) => TerminationResult::Success,
                    Err(e) => TerminationResult::Failed(e.to_string()),
                }
            }
        }
    }

    async fn find_child_processes(&self, parent_pid: ProcessId) -> Result<Vec<ProcessId>> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes_specifics(
            sysinfo::ProcessesToUpdate::All,
            true,
            sysinfo::ProcessRefreshKind::default(),
        );

        let mut children = Vec::new();
        Self::find_children_recursive(&system, parent_pid.0, &mut children);

        Ok(children.into_iter().map(ProcessId::from).collect())
    }

    async fn kill_stragglers(&self, pids: &[ProcessId]) -> usize {
        let mut killed = 0;
        for pid in pids {
            let nix_pid = NixPid::from_raw(pid.0 as i32);
            match signal::kill(nix_pid, Signal::SIGKILL) {
                Ok(()) => {
                    warn!(pid = %pid, "Killed descendant that outlived the service");
                    killed += 1;
                }
                Err(Errno::ESRCH) => {}
                Err(e) => warn!(pid = %pid, error = %e, "Failed to kill descendant"),
            }
        }
        killed
    }
}

/// Signal the process group led by `pid`, falling back to the single process
fn signal_group(pid: ProcessId, sig: Signal) -> TerminationResult {
    let nix_pid = NixPid::from_raw(pid.0 as i32);
    let result = match signal::killpg(nix_pid, sig) {
        Err(Errno::ESRCH) => signal::kill(nix_pid, sig),
        other => other,
    };

    match result {
        Ok(()) => {
            info!(pid = %pid, signal = %sig, "Signalled process group");
            TerminationResult::Success
        }
        Err(Errno::ESRCH) => {
            info!(pid = %pid, "Process not found (already terminated)");
            TerminationResult::ProcessNotFound
        }
        Err(Errno::EPERM) => {
            warn!(pid = %pid, signal = %sig, "Permission denied");
            TerminationResult::AccessDenied
        }
        Err(e) => {
            warn!(pid = %pid, signal = %sig, error = %e, "Failed to send signal");
            TerminationResult::Failed(format!("{sig} failed: {e}"))
        }
    }
}

impl UnixProcessManager {
    /// Recursively find all child processes, deepest first
    fn find_children_recursive(system: &System, parent_pid: u32, result: &mut Vec<u32>) {
        for (pid, process) in system.processes() {
            if process.parent().map(|ppid| ppid.as_u32()) == Some(parent_pid) {
                let child_pid = pid.as_u32();
                Self::find_children_recursive(system, child_pid, result);
                result.push(child_pid);
            }
        }
    }
}

impl ProcessManager for UnixProcessManager {
    fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}
