//! Runs each transport mode end to end: start, await readiness, drive the scenario, tear down

use crate::channel::{HttpChannel, PipedChannel, SseChannel, TransportChannel};
use crate::scenario::{Halt, ProgressSink, ScenarioRunner, Step, script};
use mcp_smoke_core::{
    CorrelationIds, FinalReport, HarnessConfig, ModeReport, ModeStatus, Readiness, ReadinessCheck,
    ServiceHandle, ServiceSupervisor, StepOutcome, TeardownRecord, TransportMode,
};
use reqwest::Client;
use std::fmt;
use std::time::Duration;
use tracing::{error, info, warn};

/// Lines of drained diagnostic output attached to a failed mode
pub const DIAGNOSTIC_TAIL: usize = 40;

/// Observes a whole run as it progresses
pub trait Reporter: ProgressSink {
    fn mode_started(&mut self, mode: TransportMode);

    fn mode_finished(&mut self, report: &ModeReport);
}

impl Reporter for () {
    fn mode_started(&mut self, _mode: TransportMode) {}

    fn mode_finished(&mut self, _report: &ModeReport) {}
}

/// Lifecycle of one mode run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeState {
    NotStarted,
    Starting,
    Running,
    Completed,
    Crashed,
}

impl ModeState {
    pub fn can_advance_to(self, next: ModeState) -> bool {
        use ModeState::*;
        matches!(
            (self, next),
            (NotStarted, Starting)
                | (Starting, Running)
                | (Starting, Completed)
                | (Starting, Crashed)
                | (Running, Completed)
                | (Running, Crashed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ModeState::Completed | ModeState::Crashed)
    }
}

impl fmt::Display for ModeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModeState::NotStarted => "not-started",
            ModeState::Starting => "starting",
            ModeState::Running => "running",
            ModeState::Completed => "completed",
            ModeState::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

struct ModeRun {
    mode: TransportMode,
    state: ModeState,
}

impl ModeRun {
    fn new(mode: TransportMode) -> Self {
        Self {
            mode,
            state: ModeState::NotStarted,
        }
    }

    fn advance(&mut self, next: ModeState) {
        if !self.state.can_advance_to(next) {
            warn!(mode = %self.mode, from = %self.state, to = %next, "Unexpected mode transition");
        }
        info!(mode = %self.mode, from = %self.state, to = %next, "Mode transition");
        self.state = next;
    }
}

/// Exclusive ownership of a running service until it is released
///
/// `release` stops the service through its supervisor. A lease dropped without
/// release has the supervisor kill the service's process group on the spot.
pub struct ServiceLease<'s, S: ServiceSupervisor> {
    supervisor: &'s S,
    handle: ServiceHandle<S::Handle>,
    mode: TransportMode,
}

impl<'s, S: ServiceSupervisor> ServiceLease<'s, S> {
    pub fn new(supervisor: &'s S, handle: ServiceHandle<S::Handle>, mode: TransportMode) -> Self {
        Self {
            supervisor,
            handle,
            mode,
        }
    }

    pub fn handle(&mut self) -> &mut ServiceHandle<S::Handle> {
        &mut self.handle
    }

    pub async fn release(mut self, grace: Duration) -> TeardownRecord {
        self.supervisor.stop(&mut self.handle, grace).await
    }
}

impl<S: ServiceSupervisor> Drop for ServiceLease<'_, S> {
    fn drop(&mut self) {
        if self.handle.is_stopped() {
            return;
        }
        error!(mode = %self.mode, pid = ?self.handle.pid(), "Service lease dropped without release");
        if let Some(pid) = self.handle.pid() {
            self.supervisor.abandon(pid);
        }
    }
}

pub struct Orchestrator<'c, S: ServiceSupervisor> {
    config: &'c HarnessConfig,
    supervisor: S,
    client: Client,
    ids: CorrelationIds,
}

impl<'c, S: ServiceSupervisor> Orchestrator<'c, S> {
    pub fn new(config: &'c HarnessConfig, supervisor: S) -> Self {
        Self::with_client(config, supervisor, Client::new())
    }

    pub fn with_client(config: &'c HarnessConfig, supervisor: S, client: Client) -> Self {
        Self {
            config,
            supervisor,
            client,
            ids: CorrelationIds::new(),
        }
    }

    pub fn supervisor(&self) -> &S {
        &self.supervisor
    }

    /// Run every configured mode in order
    pub async fn run_all<R: Reporter>(&self, reporter: &mut R) -> FinalReport {
        let mut report = FinalReport::new();
        for mode in &self.config.modes {
            if report.get(*mode).is_some() {
                warn!(mode = %mode, "Mode listed twice, running it once");
                continue;
            }
            report.insert(self.run_mode(*mode, reporter).await);
        }
        report
    }

    pub async fn run_mode<R: Reporter>(&self, mode: TransportMode, reporter: &mut R) -> ModeReport {
        reporter.mode_started(mode);
        let report = if mode.is_implemented() {
            self.attempt(mode, reporter).await
        } else {
            info!(mode = %mode, "Skipping unimplemented mode");
            ModeReport::skipped(mode, "not implemented")
        };
        reporter.mode_finished(&report);
        report
    }

    async fn attempt<R: Reporter>(&self, mode: TransportMode, reporter: &mut R) -> ModeReport {
        let config = self.config;
        let steps = script(mode, config);
        let mut report = ModeReport::pending(mode);
        let mut run = ModeRun::new(mode);

        run.advance(ModeState::Starting);
        let handle = match self.supervisor.start(&config.spawn_spec(mode)).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(mode = %mode, error = %e, "Service failed to start");
                report.fail(format!("service failed to start: {e}"));
                record_not_run(&mut report, &steps, "service failed to start", reporter);
                run.advance(ModeState::Crashed);
                report.finalize();
                return report;
            }
        };

        let mut lease = ServiceLease::new(&self.supervisor, handle, mode);
        report.pid = lease.handle().pid().map(|pid| pid.0);
        let diagnostics = lease.handle().diagnostics().clone();

        self.drive(&mut run, &steps, &mut lease, &mut report, reporter)
            .await;

        let teardown = lease.release(config.timeouts.stop_grace()).await;
        report.teardown = Some(teardown);
        report.finalize();
        if report.status == ModeStatus::Failed {
            report.diagnostics = diagnostics.tail(DIAGNOSTIC_TAIL);
        }
        info!(
            mode = %mode,
            state = %run.state,
            passed = report.passed_steps(),
            total = report.steps.len(),
            "Mode finished"
        );
        report
    }

    /// Everything between start and teardown; never stops the service itself
    async fn drive<R: Reporter>(
        &self,
        run: &mut ModeRun,
        steps: &[Step],
        lease: &mut ServiceLease<'_, S>,
        report: &mut ModeReport,
        reporter: &mut R,
    ) {
        let config = self.config;
        let mode = run.mode;

        let check = readiness_check(mode, config);
        let readiness = self
            .supervisor
            .await_ready(
                lease.handle(),
                &check,
                config.timeouts.ready_max_wait(),
                config.timeouts.ready_poll_interval(),
            )
            .await;
        match readiness {
            Readiness::Ready => run.advance(ModeState::Running),
            Readiness::Exited(status) => {
                run.advance(ModeState::Crashed);
                report.fail(format!("service exited during startup ({status})"));
                record_not_run(report, steps, "service exited during startup", reporter);
                return;
            }
            Readiness::StillStarting => {
                run.advance(ModeState::Completed);
                report.fail(format!(
                    "service not ready after {}ms",
                    config.timeouts.ready_max_wait().as_millis()
                ));
                record_not_run(report, steps, "service never became ready", reporter);
                return;
            }
        }

        let mut channel = match self.open_channel(mode, lease.handle()) {
            Ok(channel) => channel,
            Err(reason) => {
                run.advance(ModeState::Completed);
                report.fail(reason.clone());
                record_not_run(report, steps, &reason, reporter);
                return;
            }
        };

        let runner = ScenarioRunner::new(config, &self.ids, &self.client);
        let scenario = runner
            .run(steps, channel.as_mut(), lease.handle(), reporter)
            .await;
        channel.close().await;

        report.discovered_tool_count = scenario.tool_count;
        report.steps.extend(scenario.steps);
        match scenario.halt {
            Some(Halt::Crashed(status)) => {
                run.advance(ModeState::Crashed);
                report.fail(format!("service crashed mid-run ({status})"));
                return;
            }
            Some(halt) => report.fail(halt.to_string()),
            None => {}
        }

        if let Some(status) = lease.handle().poll_exit().await {
            run.advance(ModeState::Crashed);
            report.fail(format!("service exited after the last step ({status})"));
            return;
        }
        run.advance(ModeState::Completed);
    }

    fn open_channel(
        &self,
        mode: TransportMode,
        handle: &mut ServiceHandle<S::Handle>,
    ) -> Result<Box<dyn TransportChannel>, String> {
        let leniency = self.config.leniency;
        let base_url = self.config.base_url(mode);
        match (mode, base_url) {
            (TransportMode::PipedStream, _) => {
                let pipes = handle
                    .take_protocol_pipes()
                    .ok_or_else(|| "service protocol pipes unavailable".to_string())?;
                Ok(Box::new(PipedChannel::new(pipes.stdin, pipes.stdout)))
            }
            (TransportMode::Sse, Some(base)) => {
                Ok(Box::new(SseChannel::new(self.client.clone(), base, leniency)))
            }
            (TransportMode::HttpUnary, Some(base)) => Ok(Box::new(HttpChannel::new(
                self.client.clone(),
                &base,
                leniency,
            ))),
            (mode, _) => Err(format!("no channel for mode {mode}")),
        }
    }
}

pub fn readiness_check(mode: TransportMode, config: &HarnessConfig) -> ReadinessCheck {
    match config.port(mode) {
        Some(port) => ReadinessCheck::TcpListening {
            addr: format!("{}:{port}", config.host),
        },
        None => ReadinessCheck::Alive {
            settle: config.timeouts.ready_settle(),
        },
    }
}

fn record_not_run<R: Reporter>(
    report: &mut ModeReport,
    steps: &[Step],
    why: &str,
    reporter: &mut R,
) {
    for step in steps {
        let outcome = StepOutcome::not_run(step.name(), why);
        reporter.step_finished(report.mode, &outcome);
        report.record(outcome);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::factory::create_supervisor;
    use mcp_smoke_core::{StepStatus, TimeoutConfig};

    #[derive(Default)]
    struct Recording {
        events: Vec<String>,
    }

    impl ProgressSink for Recording {
        fn step_finished(&mut self, mode: TransportMode, step: &StepOutcome) {
            self.events.push(format!("{mode}:{}:{}", step.step_name, step.status));
        }
    }

    impl Reporter for Recording {
        fn mode_started(&mut self, mode: TransportMode) {
            self.events.push(format!("start:{mode}"));
        }

        fn mode_finished(&mut self, report: &ModeReport) {
            self.events.push(format!("finish:{}", report.mode));
        }
    }

    fn shell_config(script: &str, modes: Vec<TransportMode>) -> HarnessConfig {
        HarnessConfig::builder()
            .command("sh")
            .args(["-c", script])
            .modes(modes)
            .timeouts(TimeoutConfig::quick())
            .build()
            .unwrap()
    }

    #[test]
    fn test_state_transitions() {
        assert!(ModeState::NotStarted.can_advance_to(ModeState::Starting));
        assert!(ModeState::Starting.can_advance_to(ModeState::Crashed));
        assert!(ModeState::Running.can_advance_to(ModeState::Completed));
        assert!(!ModeState::NotStarted.can_advance_to(ModeState::Running));
        assert!(!ModeState::Completed.can_advance_to(ModeState::Running));
        assert!(ModeState::Crashed.is_terminal());
    }

    #[test]
    fn test_readiness_check_per_mode() {
        let config = HarnessConfig::default();
        assert_eq!(
            readiness_check(TransportMode::PipedStream, &config),
            ReadinessCheck::Alive {
                settle: config.timeouts.ready_settle()
            }
        );
        assert_eq!(
            readiness_check(TransportMode::HttpUnary, &config),
            ReadinessCheck::TcpListening {
                addr: format!("127.0.0.1:{}", config.http_port)
            }
        );
    }

    #[tokio::test]
    async fn test_immediate_exit_fails_with_zero_passes() {
        let config = shell_config("echo 'fatal: no browser' >&2; exit 3", vec![TransportMode::PipedStream]);
        let orchestrator = Orchestrator::new(&config, create_supervisor(&config));
        let mut recording = Recording::default();
        let report = orchestrator.run_all(&mut recording).await;

        let mode = report.get(TransportMode::PipedStream).unwrap();
        assert_eq!(mode.status, ModeStatus::Failed);
        assert_eq!(mode.passed_steps(), 0);
        assert_eq!(mode.steps.len(), 3);
        assert!(mode.failure.as_deref().unwrap().contains("exit code 3"));
        assert!(mode.diagnostics.iter().any(|line| line.contains("fatal: no browser")));
        assert!(mode.teardown.as_ref().unwrap().already_exited);
        assert_eq!(report.exit_code(), 1);
        assert!(orchestrator.supervisor().tracked_pids().is_empty());
        assert_eq!(recording.events.first().map(String::as_str), Some("start:piped-stream"));
        assert_eq!(recording.events.last().map(String::as_str), Some("finish:piped-stream"));
    }

    #[tokio::test]
    async fn test_silent_service_times_out_and_is_torn_down() {
        let config = shell_config("exec sleep 30", vec![TransportMode::PipedStream]);
        let orchestrator = Orchestrator::new(&config, create_supervisor(&config));
        let report = orchestrator.run_all(&mut ()).await;

        let mode = report.get(TransportMode::PipedStream).unwrap();
        assert_eq!(mode.status, ModeStatus::Failed);
        assert_eq!(mode.steps[0].status, StepStatus::Timeout);
        assert!(mode.steps[1..].iter().all(|step| !step.is_pass()));
        let teardown = mode.teardown.as_ref().unwrap();
        assert!(teardown.reaped);
        assert!(!teardown.already_exited);
        assert!(orchestrator.supervisor().tracked_pids().is_empty());
    }

    #[tokio::test]
    async fn test_port_never_opens_is_not_ready() {
        let mut config = shell_config("exec sleep 30", vec![TransportMode::HttpUnary]);
        config.timeouts.ready_max_wait_ms = 300;
        config.http_port = free_port();
        let orchestrator = Orchestrator::new(&config, create_supervisor(&config));
        let report = orchestrator.run_all(&mut ()).await;

        let mode = report.get(TransportMode::HttpUnary).unwrap();
        assert_eq!(mode.status, ModeStatus::Failed);
        assert!(mode.failure.as_deref().unwrap().contains("not ready"));
        assert_eq!(mode.passed_steps(), 0);
        assert!(mode.teardown.as_ref().unwrap().reaped);
    }

    #[tokio::test]
    async fn test_multi_tenant_is_skipped_and_not_attempted() {
        let config = shell_config("exit 0", vec![TransportMode::MultiTenant]);
        let orchestrator = Orchestrator::new(&config, create_supervisor(&config));
        let report = orchestrator.run_all(&mut ()).await;

        let mode = report.get(TransportMode::MultiTenant).unwrap();
        assert_eq!(mode.status, ModeStatus::Skipped);
        assert!(mode.teardown.is_none());
        assert_eq!(report.exit_code(), 1);
    }

    fn is_running(pid: u32) -> bool {
        let pid = sysinfo::Pid::from_u32(pid);
        let mut system = sysinfo::System::new();
        system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
        system
            .process(pid)
            .is_some_and(|process| process.status() != sysinfo::ProcessStatus::Zombie)
    }

    #[tokio::test]
    async fn test_dropped_lease_kills_the_service_tree() {
        use tokio::io::{AsyncBufReadExt, BufReader};

        let config = shell_config("sleep 60 & echo $!; wait", vec![TransportMode::PipedStream]);
        let supervisor = create_supervisor(&config);
        let handle = supervisor
            .start(&config.spawn_spec(TransportMode::PipedStream))
            .await
            .unwrap();
        let mut lease = ServiceLease::new(&supervisor, handle, TransportMode::PipedStream);
        let pipes = lease.handle().take_protocol_pipes().unwrap();
        let mut lines = BufReader::new(pipes.stdout).lines();
        let grandchild: u32 = lines.next_line().await.unwrap().unwrap().parse().unwrap();
        assert!(is_running(grandchild));

        drop(lease);
        assert!(supervisor.tracked_pids().is_empty());
        let mut gone = false;
        for _ in 0..100 {
            if !is_running(grandchild) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(gone, "grandchild {grandchild} outlived its lease");
    }

    #[tokio::test]
    async fn test_missing_binary_fails_mode() {
        let mut config = shell_config("", vec![TransportMode::PipedStream]);
        config.command = "/nonexistent/mcp-service".to_string();
        let orchestrator = Orchestrator::new(&config, create_supervisor(&config));
        let report = orchestrator.run_all(&mut ()).await;

        let mode = report.get(TransportMode::PipedStream).unwrap();
        assert_eq!(mode.status, ModeStatus::Failed);
        assert!(mode.failure.as_deref().unwrap().contains("failed to start"));
        assert!(mode.pid.is_none());
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }
}
