//! Fixed per-mode step scripts and their pass rules

use crate::channel::{Exchange, Opened, TransportChannel};
use crate::http_probe;
use async_trait::async_trait;
use mcp_smoke_core::{
    CorrelationIds, HarnessConfig, Notification, OperationSpec, ProcessHandle, ProcessStatus,
    ServiceHandle, StepOutcome, StepStatus, TransportMode,
};
use reqwest::Client;
use serde_json::{Value, json};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// One entry of a mode's script
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    HealthCheck,
    OpenStream,
    EndpointProbe,
    Handshake,
    ListTools,
    CallTool(OperationSpec),
}

impl Step {
    pub fn name(&self) -> &str {
        match self {
            Step::HealthCheck => "health_check",
            Step::OpenStream => "sse_connection",
            Step::EndpointProbe => "mcp_endpoint",
            Step::Handshake => "initialize",
            Step::ListTools => "tools/list",
            Step::CallTool(operation) => &operation.name,
        }
    }
}

/// Ordered steps executed for `mode`
pub fn script(mode: TransportMode, config: &HarnessConfig) -> Vec<Step> {
    match mode {
        TransportMode::PipedStream => {
            let mut steps = vec![Step::Handshake, Step::ListTools];
            steps.extend(config.operations.iter().cloned().map(Step::CallTool));
            steps
        }
        TransportMode::Sse => vec![
            Step::HealthCheck,
            Step::OpenStream,
            Step::Handshake,
            Step::ListTools,
        ],
        TransportMode::HttpUnary => vec![
            Step::HealthCheck,
            Step::EndpointProbe,
            Step::Handshake,
            Step::ListTools,
        ],
        TransportMode::MultiTenant => Vec::new(),
    }
}

/// Why a scenario stopped before its last step
#[derive(Debug, Clone, PartialEq)]
pub enum Halt {
    TimedOut { step: String },
    Desynchronized { step: String },
    Crashed(ProcessStatus),
}

impl fmt::Display for Halt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Halt::TimedOut { step } => write!(f, "{step} timed out"),
            Halt::Desynchronized { step } => write!(f, "channel desynchronized after {step}"),
            Halt::Crashed(status) => write!(f, "service crashed ({status})"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScenarioRun {
    pub steps: Vec<StepOutcome>,
    pub tool_count: usize,
    pub halt: Option<Halt>,
}

impl ScenarioRun {
    pub fn all_passed(&self) -> bool {
        self.halt.is_none() && self.steps.iter().all(StepOutcome::is_pass)
    }
}

/// Answers whether the service behind a channel is still running
#[async_trait]
pub trait LivenessProbe: Send {
    async fn exited(&mut self) -> Option<ProcessStatus>;
}

#[async_trait]
impl<H: ProcessHandle> LivenessProbe for ServiceHandle<H> {
    async fn exited(&mut self) -> Option<ProcessStatus> {
        self.poll_exit().await
    }
}

/// Receives step outcomes as they complete
pub trait ProgressSink: Send {
    fn step_finished(&mut self, mode: TransportMode, step: &StepOutcome);
}

impl ProgressSink for () {
    fn step_finished(&mut self, _mode: TransportMode, _step: &StepOutcome) {}
}

pub struct ScenarioRunner<'a> {
    config: &'a HarnessConfig,
    ids: &'a CorrelationIds,
    client: &'a Client,
}

impl<'a> ScenarioRunner<'a> {
    pub fn new(config: &'a HarnessConfig, ids: &'a CorrelationIds, client: &'a Client) -> Self {
        Self {
            config,
            ids,
            client,
        }
    }

    pub async fn run(
        &self,
        steps: &[Step],
        channel: &mut dyn TransportChannel,
        liveness: &mut dyn LivenessProbe,
        sink: &mut dyn ProgressSink,
    ) -> ScenarioRun {
        let mode = channel.mode();
        let mut run = ScenarioRun::default();

        for (index, step) in steps.iter().enumerate() {
            let started = Instant::now();
            let (outcome, tool_count) = self.execute(mode, step, channel).await;
            let outcome = outcome.with_elapsed_ms(started.elapsed().as_millis() as u64);
            if let Some(count) = tool_count {
                run.tool_count = count;
            }
            debug!(mode = %mode, step = step.name(), status = %outcome.status, "Step finished");
            sink.step_finished(mode, &outcome);

            let timed_out = outcome.status == StepStatus::Timeout;
            run.steps.push(outcome);

            let halt = if timed_out {
                Some(Halt::TimedOut {
                    step: step.name().to_string(),
                })
            } else if channel.is_desynchronized() {
                Some(Halt::Desynchronized {
                    step: step.name().to_string(),
                })
            } else {
                liveness.exited().await.map(Halt::Crashed)
            };

            if let Some(halt) = halt {
                warn!(mode = %mode, %halt, "Scenario halted");
                let why = halt.to_string();
                for skipped in &steps[index + 1..] {
                    let outcome = StepOutcome::not_run(skipped.name(), &why);
                    sink.step_finished(mode, &outcome);
                    run.steps.push(outcome);
                }
                run.halt = Some(halt);
                break;
            }
        }
        run
    }

    async fn execute(
        &self,
        mode: TransportMode,
        step: &Step,
        channel: &mut dyn TransportChannel,
    ) -> (StepOutcome, Option<usize>) {
        let timeouts = &self.config.timeouts;
        match step {
            Step::HealthCheck => match self.config.base_url(mode) {
                Some(base) => (
                    http_probe::health_check(self.client, &base, timeouts.step()).await,
                    None,
                ),
                None => (StepOutcome::fail(step.name(), "mode has no HTTP endpoint"), None),
            },
            Step::EndpointProbe => match self.config.base_url(mode) {
                Some(base) => (
                    http_probe::endpoint_probe(
                        self.client,
                        &base,
                        self.ids,
                        self.config.leniency,
                        timeouts.step(),
                    )
                    .await,
                    None,
                ),
                None => (StepOutcome::fail(step.name(), "mode has no HTTP endpoint"), None),
            },
            Step::OpenStream => (self.open_stream(step.name(), channel).await, None),
            Step::Handshake => (self.handshake(channel).await, None),
            Step::ListTools => {
                let request = self.ids.request("tools/list", json!({}));
                let exchange = channel.send_and_await(&request, timeouts.step()).await;
                let mut count = None;
                let outcome = classify(step.name(), exchange, |result| {
                    let tools = tool_names(result)?;
                    count = Some(tools.len());
                    Ok(Some(format!("{} tools", tools.len())))
                });
                (outcome, count)
            }
            Step::CallTool(operation) => {
                let deadline = step_deadline(step, self.config);
                let request = self.ids.request(
                    "tools/call",
                    json!({"name": operation.name, "arguments": operation.arguments}),
                );
                let exchange = channel.send_and_await(&request, deadline).await;
                let outcome = classify(&operation.name, exchange, |result| {
                    if result.get("isError").and_then(Value::as_bool) == Some(true) {
                        return Err(format!("tool reported an error: {}", first_text(result)));
                    }
                    let items = result
                        .get("content")
                        .and_then(Value::as_array)
                        .map_or(0, Vec::len);
                    Ok(Some(format!("{items} content items")))
                });
                (outcome, None)
            }
        }
    }

    async fn open_stream(&self, name: &str, channel: &mut dyn TransportChannel) -> StepOutcome {
        match channel.open(step_deadline(&Step::OpenStream, self.config)).await {
            Ok(Opened::Streaming) => StepOutcome::pass(name).with_detail("stream established"),
            Ok(Opened::Assumed) => {
                StepOutcome::pass(name).with_detail("no headers before deadline, counted as open")
            }
            Ok(Opened::NotNeeded) => StepOutcome::pass(name),
            Err(e) if e.is_timeout() => StepOutcome::timeout(name),
            Err(e) => StepOutcome::fail(name, e.to_string()),
        }
    }

    async fn handshake(&self, channel: &mut dyn TransportChannel) -> StepOutcome {
        let config = self.config;
        let request = self.ids.request(
            "initialize",
            json!({
                "protocolVersion": config.protocol_version,
                "capabilities": {},
                "clientInfo": {
                    "name": config.client_name,
                    "version": config.client_version,
                },
            }),
        );
        let exchange = channel
            .send_and_await(&request, config.timeouts.step())
            .await;
        let outcome = classify("initialize", exchange, |result| {
            if !result.get("capabilities").is_some_and(Value::is_object) {
                return Err("result has no capabilities".to_string());
            }
            let version = result
                .get("protocolVersion")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            Ok(Some(format!("protocol {version}")))
        });

        if outcome.is_pass() {
            let initialized = Notification::new("notifications/initialized", Value::Null);
            match channel.notify(&initialized, config.timeouts.step()).await {
                Ok(()) => info!(mode = %channel.mode(), "Handshake complete"),
                Err(e) => warn!(mode = %channel.mode(), error = %e, "Sending initialized notification failed"),
            }
        }
        outcome
    }
}

/// Map an exchange onto a step outcome, applying `check` to a success result
fn classify<F>(name: &str, exchange: Exchange, check: F) -> StepOutcome
where
    F: FnOnce(&Value) -> Result<Option<String>, String>,
{
    match exchange {
        Exchange::Response(response) => match response.result() {
            Some(result) => match check(result) {
                Ok(Some(detail)) => StepOutcome::pass(name).with_detail(detail),
                Ok(None) => StepOutcome::pass(name),
                Err(reason) => StepOutcome::fail(name, reason),
            },
            None => StepOutcome::fail(
                name,
                response
                    .error_summary()
                    .unwrap_or_else(|| "response carried no result".to_string()),
            ),
        },
        Exchange::TimedOut => StepOutcome::timeout(name),
        Exchange::Malformed { raw, reason } => {
            StepOutcome::fail(name, format!("malformed response ({reason}): {raw}"))
        }
        Exchange::Acknowledged { status } => {
            StepOutcome::fail(name, format!("HTTP {status} without a response"))
        }
        Exchange::Failed(reason) => StepOutcome::fail(name, reason),
    }
}

fn tool_names(result: &Value) -> Result<Vec<&str>, String> {
    let tools = result
        .get("tools")
        .and_then(Value::as_array)
        .ok_or_else(|| "result.tools is not an array".to_string())?;
    tools
        .iter()
        .enumerate()
        .map(|(i, tool)| {
            tool.get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| format!("tool #{i} has no string name"))
        })
        .collect()
}

fn first_text(result: &Value) -> String {
    result
        .get("content")
        .and_then(Value::as_array)
        .and_then(|items| items.iter().find_map(|item| item.get("text")?.as_str()))
        .unwrap_or("no message")
        .to_string()
}

/// Deadline a step's exchange is bounded by
pub fn step_deadline(step: &Step, config: &HarnessConfig) -> Duration {
    match step {
        Step::CallTool(operation) if operation.slow => config.timeouts.slow_step(),
        Step::OpenStream => config.timeouts.sse_connect(),
        _ => config.timeouts.step(),
    }
}
