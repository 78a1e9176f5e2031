//! Human-readable progress and summary output

use crate::orchestrator::Reporter;
use crate::precondition::UpstreamInfo;
use crate::scenario::ProgressSink;
use mcp_smoke_core::{FinalReport, ModeReport, ModeStatus, StepOutcome, StepStatus, TransportMode};
use std::fmt;
use std::io::Write;
use tracing::warn;

const RULE_WIDTH: usize = 70;

fn step_icon(status: &StepStatus) -> &'static str {
    match status {
        StepStatus::Pass => "✅",
        StepStatus::Fail(_) => "❌",
        StepStatus::Timeout => "⏳",
    }
}

fn mode_icon(status: ModeStatus) -> &'static str {
    match status {
        ModeStatus::Passed => "✅",
        ModeStatus::Failed => "❌",
        ModeStatus::Skipped => "⏭️",
        ModeStatus::Pending => "…",
    }
}

fn mode_title(mode: TransportMode) -> &'static str {
    match mode {
        TransportMode::PipedStream => "Piped-stream (stdio)",
        TransportMode::Sse => "SSE",
        TransportMode::HttpUnary => "HTTP-unary (streamable)",
        TransportMode::MultiTenant => "Multi-tenant",
    }
}

/// Writes one section per mode and one line per step
pub struct ConsoleReporter<W> {
    out: W,
}

impl<W: Write + Send> ConsoleReporter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn line(&mut self, args: fmt::Arguments<'_>) {
        if let Err(e) = writeln!(self.out, "{args}") {
            warn!(error = %e, "Console write failed");
        }
    }

    fn section(&mut self, title: &str) {
        let rule = "=".repeat(RULE_WIDTH);
        self.line(format_args!("\n{rule}"));
        self.line(format_args!("{title}"));
        self.line(format_args!("{rule}"));
    }

    pub fn upstream_ok(&mut self, url: &str, info: &UpstreamInfo) {
        self.line(format_args!("✅ Upstream reachable at {url}: {}", info.describe()));
    }

    pub fn upstream_failed(&mut self, url: &str, reason: &str) {
        self.line(format_args!("❌ Upstream not available at {url}: {reason}"));
        self.line(format_args!("   Start the browser with --remote-debugging-port first."));
    }

    pub fn upstream_skipped(&mut self) {
        self.line(format_args!("⏭️ Upstream check skipped"));
    }

    pub fn summary(&mut self, report: &FinalReport) {
        self.section("Summary");
        for mode in report.iter() {
            let counts = if mode.status == ModeStatus::Skipped {
                String::new()
            } else {
                format!(" {}/{} steps", mode.passed_steps(), mode.steps.len())
            };
            self.line(format_args!(
                "{} {:<26}{}",
                mode_icon(mode.status),
                mode_title(mode.mode),
                counts
            ));
        }

        let summary = report.summary();
        self.line(format_args!(
            "\nSteps: {}/{} passed",
            summary.passed_steps, summary.total_steps
        ));
        self.line(format_args!(
            "Modes: {}/{} passed, {} skipped",
            summary.passed_modes, summary.attempted_modes, summary.skipped_modes
        ));
        if report.is_success() {
            self.line(format_args!("\n🎉 All attempted modes passed"));
        } else {
            self.line(format_args!("\n⚠️ Some modes failed"));
        }
    }

    pub fn json(&mut self, report: &FinalReport) {
        match report.to_json() {
            Ok(json) => self.line(format_args!("{json}")),
            Err(e) => warn!(error = %e, "Failed to serialize report"),
        }
    }
}

impl<W: Write + Send> ProgressSink for ConsoleReporter<W> {
    fn step_finished(&mut self, _mode: TransportMode, step: &StepOutcome) {
        let icon = step_icon(&step.status);
        match (&step.status, &step.detail) {
            (StepStatus::Fail(reason), _) => {
                self.line(format_args!("  {icon} {}: {reason}", step.step_name))
            }
            (StepStatus::Timeout, _) => self.line(format_args!(
                "  {icon} {}: timed out after {}ms",
                step.step_name, step.elapsed_ms
            )),
            (StepStatus::Pass, Some(detail)) => {
                self.line(format_args!("  {icon} {} ({detail})", step.step_name))
            }
            (StepStatus::Pass, None) => self.line(format_args!("  {icon} {}", step.step_name)),
        }
    }
}

impl<W: Write + Send> Reporter for ConsoleReporter<W> {
    fn mode_started(&mut self, mode: TransportMode) {
        self.section(&format!("Testing {} mode", mode_title(mode)));
    }

    fn mode_finished(&mut self, report: &ModeReport) {
        let icon = mode_icon(report.status);
        match report.status {
            ModeStatus::Skipped => self.line(format_args!(
                "{icon} Skipped: {}",
                report.failure.as_deref().unwrap_or("not selected")
            )),
            ModeStatus::Passed => self.line(format_args!(
                "{icon} Passed ({} tools discovered)",
                report.discovered_tool_count
            )),
            ModeStatus::Failed | ModeStatus::Pending => {
                self.line(format_args!(
                    "{icon} Failed: {}",
                    report.failure.as_deref().unwrap_or("unknown reason")
                ));
                if !report.diagnostics.is_empty() {
                    self.line(format_args!("  Last service output:"));
                    for line in &report.diagnostics {
                        self.line(format_args!("    {line}"));
                    }
                }
            }
        }
    }
}
