#![cfg(unix)]

use mcp_smoke::factory::create_supervisor;
use mcp_smoke::{
    FinalReport, HarnessConfig, Leniency, ModeReport, ModeStatus, Orchestrator, ServiceSupervisor,
    StepStatus, TimeoutConfig, TransportMode,
};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::time::Instant;

const MOCK: &str = env!("CARGO_BIN_EXE_mock-mcp-service");

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn mock_config(extra_args: &[&str], modes: Vec<TransportMode>) -> HarnessConfig {
    let sse_port = free_port();
    let mut http_port = free_port();
    while http_port == sse_port {
        http_port = free_port();
    }
    HarnessConfig::builder()
        .command(MOCK)
        .args(extra_args.iter().copied())
        .sse_port(sse_port)
        .http_port(http_port)
        .modes(modes)
        .timeouts(TimeoutConfig::quick())
        .skip_precondition(true)
        .build()
        .unwrap()
}

async fn run(config: &HarnessConfig) -> FinalReport {
    let orchestrator = Orchestrator::new(config, create_supervisor(config));
    let report = orchestrator.run_all(&mut ()).await;
    assert!(
        orchestrator.supervisor().tracked_pids().is_empty(),
        "supervisor still tracks live services"
    );
    report
}

fn assert_torn_down(mode: &ModeReport) {
    let teardown = mode.teardown.as_ref().expect("mode was never torn down");
    assert!(teardown.reaped, "{teardown:?}");
    let pid = mode.pid.expect("service pid recorded") as i32;
    assert_eq!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH));
}

fn step_names(mode: &ModeReport) -> Vec<&str> {
    mode.steps
        .iter()
        .map(|step| step.step_name.as_str())
        .collect()
}

#[tokio::test]
async fn test_piped_stream_healthy_service() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_target(false)
        .try_init();

    let config = mock_config(&[], vec![TransportMode::PipedStream]);
    let report = run(&config).await;

    let mode = report.get(TransportMode::PipedStream).unwrap();
    assert_eq!(mode.status, ModeStatus::Passed, "{mode:?}");
    assert_eq!(step_names(mode), ["initialize", "tools/list", "list_pages"]);
    assert_eq!(mode.discovered_tool_count, 5);
    assert!(mode.diagnostics.is_empty());
    assert_torn_down(mode);
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test]
async fn test_tool_count_is_stable_across_runs() {
    let config = mock_config(&["--tools", "7"], vec![TransportMode::PipedStream]);
    let first = run(&config).await;
    let second = run(&config).await;

    let count = |report: &FinalReport| {
        report
            .get(TransportMode::PipedStream)
            .unwrap()
            .discovered_tool_count
    };
    assert_eq!(count(&first), 7);
    assert_eq!(count(&first), count(&second));
}

#[tokio::test]
async fn test_missing_capabilities_fails_handshake() {
    let config = mock_config(&["--omit-capabilities"], vec![TransportMode::PipedStream]);
    let report = run(&config).await;

    let mode = report.get(TransportMode::PipedStream).unwrap();
    assert_eq!(mode.status, ModeStatus::Failed);
    assert_eq!(
        mode.steps[0].status,
        StepStatus::Fail("result has no capabilities".to_string())
    );
    // Later steps still ran
    assert!(mode.steps[1].is_pass());
    assert_torn_down(mode);
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test]
async fn test_unanswered_request_times_out_and_skips_the_rest() {
    let config = mock_config(
        &["--hang-on", "tools/list"],
        vec![TransportMode::PipedStream],
    );
    let report = run(&config).await;

    let mode = report.get(TransportMode::PipedStream).unwrap();
    assert_eq!(mode.status, ModeStatus::Failed);
    assert!(mode.steps[0].is_pass());
    assert_eq!(mode.steps[1].status, StepStatus::Timeout);
    assert!(matches!(
        mode.steps[2].status,
        StepStatus::Fail(ref reason) if reason.starts_with("not run")
    ));
    assert!(mode.failure.as_deref().unwrap().contains("timed out"));
    assert!(
        mode.diagnostics
            .iter()
            .any(|line| line.contains("not answering tools/list"))
    );
    assert_torn_down(mode);
}

#[tokio::test]
async fn test_service_that_exits_immediately() {
    let config = mock_config(
        &["--exit-immediately", "2"],
        vec![TransportMode::PipedStream],
    );
    let report = run(&config).await;

    let mode = report.get(TransportMode::PipedStream).unwrap();
    assert_eq!(mode.status, ModeStatus::Failed);
    assert_eq!(mode.passed_steps(), 0);
    assert!(mode.failure.as_deref().unwrap().contains("exit code 2"));
    assert!(mode.teardown.as_ref().unwrap().already_exited);
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test]
async fn test_port_modes_notice_an_immediate_exit() {
    let config = mock_config(
        &["--exit-immediately", "2"],
        vec![TransportMode::HttpUnary, TransportMode::Sse],
    );
    let started = Instant::now();
    let report = run(&config).await;
    assert!(
        started.elapsed() < config.timeouts.ready_max_wait(),
        "waited out the ready timeout: {:?}",
        started.elapsed()
    );

    for mode in [TransportMode::HttpUnary, TransportMode::Sse] {
        let mode = report.get(mode).unwrap();
        assert_eq!(mode.status, ModeStatus::Failed);
        assert_eq!(mode.passed_steps(), 0);
        assert!(
            mode.failure.as_deref().unwrap().contains("exit code 2"),
            "{mode:?}"
        );
        assert!(mode.teardown.as_ref().unwrap().already_exited);
    }
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test]
async fn test_service_exiting_mid_run_fails_mode() {
    let config = mock_config(&["--exit-after", "2"], vec![TransportMode::PipedStream]);
    let report = run(&config).await;

    let mode = report.get(TransportMode::PipedStream).unwrap();
    assert_eq!(mode.status, ModeStatus::Failed);
    assert!(mode.steps[0].is_pass());
    assert!(mode.steps[1].is_pass());
    assert!(!mode.steps[2].is_pass());
    assert_torn_down(mode);
}

#[tokio::test]
async fn test_sse_mode_passes() {
    let config = mock_config(&[], vec![TransportMode::Sse]);
    let report = run(&config).await;

    let mode = report.get(TransportMode::Sse).unwrap();
    assert_eq!(mode.status, ModeStatus::Passed, "{mode:?}");
    assert_eq!(
        step_names(mode),
        ["health_check", "sse_connection", "initialize", "tools/list"]
    );
    assert_eq!(mode.steps[1].detail.as_deref(), Some("stream established"));
    assert_eq!(mode.discovered_tool_count, 5);
    assert_torn_down(mode);
}

#[tokio::test]
async fn test_sse_mode_passes_when_headers_arrive_late() {
    let mut config = mock_config(&["--sse-header-delay-ms", "400"], vec![TransportMode::Sse]);
    config.timeouts.sse_connect_timeout_ms = 100;
    let report = run(&config).await;

    let mode = report.get(TransportMode::Sse).unwrap();
    assert_eq!(mode.status, ModeStatus::Passed, "{mode:?}");
    assert_eq!(
        mode.steps[1].detail.as_deref(),
        Some("no headers before deadline, counted as open")
    );
    assert!(mode.steps[2].is_pass());
    assert_eq!(mode.discovered_tool_count, 5);
    assert_torn_down(mode);
}

#[tokio::test]
async fn test_late_sse_headers_fail_when_strict() {
    let mut config = mock_config(&["--sse-header-delay-ms", "400"], vec![TransportMode::Sse]);
    config.timeouts.sse_connect_timeout_ms = 100;
    config.leniency = Leniency::strict();
    let report = run(&config).await;

    let mode = report.get(TransportMode::Sse).unwrap();
    assert_eq!(mode.status, ModeStatus::Failed);
    assert_eq!(mode.steps[1].status, StepStatus::Timeout);
    assert_torn_down(mode);
}

#[tokio::test]
async fn test_http_unary_mode_passes() {
    let config = mock_config(&[], vec![TransportMode::HttpUnary]);
    let report = run(&config).await;

    let mode = report.get(TransportMode::HttpUnary).unwrap();
    assert_eq!(mode.status, ModeStatus::Passed, "{mode:?}");
    assert_eq!(
        step_names(mode),
        ["health_check", "mcp_endpoint", "initialize", "tools/list"]
    );
    // The bare probe carries no Accept header
    assert_eq!(mode.steps[1].detail.as_deref(), Some("HTTP 406"));
    assert_torn_down(mode);
}

#[tokio::test]
async fn test_strict_mode_rejects_bare_endpoint_406() {
    let mut config = mock_config(&[], vec![TransportMode::HttpUnary]);
    config.leniency = Leniency::strict();
    let report = run(&config).await;

    let mode = report.get(TransportMode::HttpUnary).unwrap();
    assert_eq!(mode.status, ModeStatus::Failed);
    assert!(!mode.steps[1].is_pass());
    // Negotiated requests still succeed
    assert!(mode.steps[2].is_pass());
}

#[tokio::test]
async fn test_all_modes_with_noisy_service() {
    let config = mock_config(&["--noisy-stderr"], TransportMode::ALL.to_vec());
    let report = run(&config).await;

    assert_eq!(report.len(), 4);
    let summary = report.summary();
    assert_eq!(summary.attempted_modes, 3);
    assert_eq!(summary.skipped_modes, 1);
    assert_eq!(summary.passed_modes, 3, "{}", report.to_json().unwrap());
    assert_eq!(summary.passed_steps, summary.total_steps);
    assert_eq!(
        report.get(TransportMode::MultiTenant).unwrap().status,
        ModeStatus::Skipped
    );
    for mode in report.iter().filter(|mode| mode.is_attempted()) {
        assert_torn_down(mode);
    }
    assert_eq!(report.exit_code(), 0);
}
