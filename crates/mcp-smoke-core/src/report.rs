use crate::config::TransportMode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum StepStatus {
    Pass,
    Fail(String),
    Timeout,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Pass => f.write_str("pass"),
            StepStatus::Fail(reason) => write!(f, "fail: {reason}"),
            StepStatus::Timeout => f.write_str("timeout"),
        }
    }
}

/// Result of one scripted step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutcome {
    pub step_name: String,
    #[serde(flatten)]
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default)]
    pub elapsed_ms: u64,
}

impl StepOutcome {
    pub fn new(step_name: impl Into<String>, status: StepStatus) -> Self {
        Self {
            step_name: step_name.into(),
            status,
            detail: None,
            elapsed_ms: 0,
        }
    }

    pub fn pass(step_name: impl Into<String>) -> Self {
        Self::new(step_name, StepStatus::Pass)
    }

    pub fn fail(step_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(step_name, StepStatus::Fail(reason.into()))
    }

    pub fn timeout(step_name: impl Into<String>) -> Self {
        Self::new(step_name, StepStatus::Timeout)
    }

    /// A step skipped because an earlier one broke the run
    pub fn not_run(step_name: impl Into<String>, why: &str) -> Self {
        Self::fail(step_name, format!("not run: {why}"))
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_elapsed_ms(mut self, elapsed_ms: u64) -> Self {
        self.elapsed_ms = elapsed_ms;
        self
    }

    pub fn is_pass(&self) -> bool {
        self.status == StepStatus::Pass
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModeStatus {
    Pending,
    Passed,
    Failed,
    Skipped,
}

impl fmt::Display for ModeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ModeStatus::Pending => "pending",
            ModeStatus::Passed => "passed",
            ModeStatus::Failed => "failed",
            ModeStatus::Skipped => "skipped",
        };
        f.write_str(label)
    }
}

/// How the service of a mode was torn down
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeardownRecord {
    /// The service had exited on its own before stop
    pub already_exited: bool,
    /// SIGKILL was needed
    pub escalated: bool,
    /// Final exit description, e.g. "exit code 0"
    pub exit: Option<String>,
    pub reaped: bool,
    pub stragglers_killed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeReport {
    pub mode: TransportMode,
    pub status: ModeStatus,
    pub discovered_tool_count: usize,
    pub steps: Vec<StepOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teardown: Option<TeardownRecord>,
}

impl ModeReport {
    pub fn pending(mode: TransportMode) -> Self {
        Self {
            mode,
            status: ModeStatus::Pending,
            discovered_tool_count: 0,
            steps: Vec::new(),
            failure: None,
            pid: None,
            diagnostics: Vec::new(),
            teardown: None,
        }
    }

    pub fn skipped(mode: TransportMode, reason: impl Into<String>) -> Self {
        Self {
            status: ModeStatus::Skipped,
            failure: Some(reason.into()),
            ..Self::pending(mode)
        }
    }

    pub fn record(&mut self, step: StepOutcome) {
        self.steps.push(step);
    }

    /// Mark the mode failed; the first reason recorded wins
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = ModeStatus::Failed;
        if self.failure.is_none() {
            self.failure = Some(reason.into());
        }
    }

    /// Resolve a still-pending mode from its steps
    pub fn finalize(&mut self) {
        if self.status != ModeStatus::Pending {
            return;
        }
        let failed = self.failed_steps();
        if self.steps.is_empty() {
            self.fail("no steps were run");
        } else if failed > 0 {
            self.fail(format!("{failed} of {} steps failed", self.steps.len()));
        } else {
            self.status = ModeStatus::Passed;
        }
    }

    pub fn passed_steps(&self) -> usize {
        self.steps.iter().filter(|step| step.is_pass()).count()
    }

    pub fn failed_steps(&self) -> usize {
        self.steps.len() - self.passed_steps()
    }

    pub fn is_attempted(&self) -> bool {
        self.status != ModeStatus::Skipped
    }
}

/// Counts derived from a [`FinalReport`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub passed_steps: usize,
    pub total_steps: usize,
    pub passed_modes: usize,
    pub attempted_modes: usize,
    pub skipped_modes: usize,
}

/// Ordered mapping of every mode to its report
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FinalReport {
    modes: BTreeMap<TransportMode, ModeReport>,
}

impl FinalReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, report: ModeReport) {
        self.modes.insert(report.mode, report);
    }

    pub fn get(&self, mode: TransportMode) -> Option<&ModeReport> {
        self.modes.get(&mode)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModeReport> {
        self.modes.values()
    }

    pub fn len(&self) -> usize {
        self.modes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }

    pub fn summary(&self) -> Summary {
        let attempted = self.iter().filter(|report| report.is_attempted());
        let mut summary = Summary {
            passed_steps: 0,
            total_steps: 0,
            passed_modes: 0,
            attempted_modes: 0,
            skipped_modes: self.len(),
        };
        for report in attempted {
            summary.attempted_modes += 1;
            summary.skipped_modes -= 1;
            summary.total_steps += report.steps.len();
            summary.passed_steps += report.passed_steps();
            if report.status == ModeStatus::Passed {
                summary.passed_modes += 1;
            }
        }
        summary
    }

    /// At least one mode attempted and every attempted mode passed
    pub fn is_success(&self) -> bool {
        let summary = self.summary();
        summary.attempted_modes > 0 && summary.passed_modes == summary.attempted_modes
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() { 0 } else { 1 }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RenderedReport<'a> {
    modes: &'a BTreeMap<TransportMode, ModeReport>,
    summary: Summary,
    success: bool,
}

impl FinalReport {
    /// Pretty JSON of every mode report plus the summary
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&RenderedReport {
            modes: &self.modes,
            summary: self.summary(),
            success: self.is_success(),
        })
    }
}
