use crate::error::SmokeError;
use crate::process::{SpawnSpec, StdioRouting};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Bounds applied to every wait the harness performs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutConfig {
    /// Deadline for quick protocol exchanges (in milliseconds)
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,

    /// Deadline for operations flagged as slow (in milliseconds)
    #[serde(default = "default_slow_step_timeout_ms")]
    pub slow_step_timeout_ms: u64,

    /// Upper bound on waiting for a freshly spawned service to become ready
    #[serde(default = "default_ready_max_wait_ms")]
    pub ready_max_wait_ms: u64,

    /// Cadence of the readiness poll
    #[serde(default = "default_ready_poll_interval_ms")]
    pub ready_poll_interval_ms: u64,

    /// How long a stdio service has to stay alive before it counts as ready
    #[serde(default = "default_ready_settle_ms")]
    pub ready_settle_ms: u64,

    /// Grace period between SIGTERM and SIGKILL at teardown
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// Deadline for the upstream dependency check
    #[serde(default = "default_precondition_timeout_ms")]
    pub precondition_timeout_ms: u64,

    /// Deadline for the SSE stream to answer with headers
    #[serde(default = "default_sse_connect_timeout_ms")]
    pub sse_connect_timeout_ms: u64,

    /// Bound on joining background drain tasks at teardown
    #[serde(default = "default_drain_join_ms")]
    pub drain_join_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            step_timeout_ms: default_step_timeout_ms(),
            slow_step_timeout_ms: default_slow_step_timeout_ms(),
            ready_max_wait_ms: default_ready_max_wait_ms(),
            ready_poll_interval_ms: default_ready_poll_interval_ms(),
            ready_settle_ms: default_ready_settle_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            precondition_timeout_ms: default_precondition_timeout_ms(),
            sse_connect_timeout_ms: default_sse_connect_timeout_ms(),
            drain_join_ms: default_drain_join_ms(),
        }
    }
}

impl TimeoutConfig {
    /// Tight bounds for driving local fixtures in tests
    pub fn quick() -> Self {
        Self {
            step_timeout_ms: 1_000,
            slow_step_timeout_ms: 2_000,
            ready_max_wait_ms: 5_000,
            ready_poll_interval_ms: 50,
            ready_settle_ms: 100,
            stop_grace_ms: 500,
            precondition_timeout_ms: 500,
            sse_connect_timeout_ms: 500,
            drain_join_ms: 200,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.step_timeout_ms == 0 || self.slow_step_timeout_ms == 0 {
            return Err(anyhow::anyhow!("step timeouts must be greater than zero"));
        }

        if self.slow_step_timeout_ms < self.step_timeout_ms {
            return Err(anyhow::anyhow!(
                "slow_step_timeout_ms cannot be smaller than step_timeout_ms"
            ));
        }

        if self.ready_poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("ready_poll_interval_ms must be greater than zero"));
        }

        if self.ready_poll_interval_ms > self.ready_max_wait_ms {
            return Err(anyhow::anyhow!(
                "ready_poll_interval_ms cannot exceed ready_max_wait_ms"
            ));
        }

        if self.stop_grace_ms > 60_000 {
            return Err(anyhow::anyhow!("stop_grace_ms should not exceed 60 seconds"));
        }

        Ok(())
    }

    pub fn step(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn slow_step(&self) -> Duration {
        Duration::from_millis(self.slow_step_timeout_ms)
    }

    pub fn ready_max_wait(&self) -> Duration {
        Duration::from_millis(self.ready_max_wait_ms)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    pub fn ready_settle(&self) -> Duration {
        Duration::from_millis(self.ready_settle_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn precondition(&self) -> Duration {
        Duration::from_millis(self.precondition_timeout_ms)
    }

    pub fn sse_connect(&self) -> Duration {
        Duration::from_millis(self.sse_connect_timeout_ms)
    }

    pub fn drain_join(&self) -> Duration {
        Duration::from_millis(self.drain_join_ms)
    }
}

/// Softened pass criteria carried over from the original test suite
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Leniency {
    /// A timeout while waiting for SSE headers counts as an open stream
    #[serde(default = "default_true")]
    pub sse_timeout_counts_as_open: bool,

    /// HTTP 406 from the MCP endpoint counts as a correctly wired endpoint
    #[serde(default = "default_true")]
    pub accept_precondition_status: bool,
}

impl Default for Leniency {
    fn default() -> Self {
        Self {
            sse_timeout_counts_as_open: true,
            accept_precondition_status: true,
        }
    }
}

impl Leniency {
    pub fn strict() -> Self {
        Self {
            sse_timeout_counts_as_open: false,
            accept_precondition_status: false,
        }
    }
}

/// Transport binding a mode run exercises
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportMode {
    PipedStream,
    Sse,
    HttpUnary,
    MultiTenant,
}

impl TransportMode {
    pub const ALL: [TransportMode; 4] = [
        TransportMode::PipedStream,
        TransportMode::Sse,
        TransportMode::HttpUnary,
        TransportMode::MultiTenant,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::PipedStream => "piped-stream",
            TransportMode::Sse => "sse",
            TransportMode::HttpUnary => "http-unary",
            TransportMode::MultiTenant => "multi-tenant",
        }
    }

    /// Multi-tenant needs a separate deployment and is always skipped
    pub fn is_implemented(&self) -> bool {
        !matches!(self, TransportMode::MultiTenant)
    }

    pub fn uses_http(&self) -> bool {
        matches!(self, TransportMode::Sse | TransportMode::HttpUnary)
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportMode {
    type Err = SmokeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "piped-stream" | "stdio" => Ok(TransportMode::PipedStream),
            "sse" => Ok(TransportMode::Sse),
            "http-unary" | "http" | "streamable" => Ok(TransportMode::HttpUnary),
            "multi-tenant" | "multi_tenant" => Ok(TransportMode::MultiTenant),
            other => Err(SmokeError::ConfigurationError(format!(
                "unknown transport mode '{other}'"
            ))),
        }
    }
}

/// A named tool invocation appended to the piped-stream scenario
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationSpec {
    pub name: String,
    #[serde(default = "default_arguments")]
    pub arguments: Value,
    /// Uses the slow step deadline
    #[serde(default)]
    pub slow: bool,
}

impl OperationSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: default_arguments(),
            slow: false,
        }
    }

    pub fn slow(mut self) -> Self {
        self.slow = true;
        self
    }

    pub fn with_arguments(mut self, arguments: Value) -> Self {
        self.arguments = arguments;
        self
    }
}

/// Main harness configuration
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(setter(into, strip_option))]
#[serde(rename_all = "camelCase")]
pub struct HarnessConfig {
    /// Executable of the service under test
    #[builder(default = "default_command()")]
    #[serde(default = "default_command")]
    pub command: String,
    /// Arguments placed before the mode-specific launch flags
    #[builder(default = "default_args()")]
    #[builder(setter(custom))]
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    #[builder(default)]
    #[builder(setter(custom))]
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[builder(default)]
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    /// Upstream dependency handed to the service and checked before any mode
    #[builder(default = "default_upstream_url()")]
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,
    #[builder(default = "default_host()")]
    #[serde(default = "default_host")]
    pub host: String,
    #[builder(default = "default_sse_port()")]
    #[serde(default = "default_sse_port")]
    pub sse_port: u16,
    #[builder(default = "default_http_port()")]
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[builder(default = "default_modes()")]
    #[serde(default = "default_modes")]
    pub modes: Vec<TransportMode>,
    #[builder(default = "default_operations()")]
    #[serde(default = "default_operations")]
    pub operations: Vec<OperationSpec>,
    #[builder(default)]
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[builder(default)]
    #[serde(default)]
    pub leniency: Leniency,
    #[builder(default = "default_protocol_version()")]
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    #[builder(default = "default_client_name()")]
    #[serde(default = "default_client_name")]
    pub client_name: String,
    #[builder(default = "default_client_version()")]
    #[serde(default = "default_client_version")]
    pub client_version: String,
    #[builder(default)]
    #[serde(default)]
    pub skip_precondition: bool,
    /// Lines of diagnostic output retained per service instance
    #[builder(default = "default_diagnostic_lines()")]
    #[serde(default = "default_diagnostic_lines")]
    pub diagnostic_lines: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: default_args(),
            env: HashMap::new(),
            working_directory: None,
            upstream_url: default_upstream_url(),
            host: default_host(),
            sse_port: default_sse_port(),
            http_port: default_http_port(),
            modes: default_modes(),
            operations: default_operations(),
            timeouts: TimeoutConfig::default(),
            leniency: Leniency::default(),
            protocol_version: default_protocol_version(),
            client_name: default_client_name(),
            client_version: default_client_version(),
            skip_precondition: false,
            diagnostic_lines: default_diagnostic_lines(),
        }
    }
}

impl HarnessConfig {
    pub fn builder() -> HarnessConfigBuilder {
        HarnessConfigBuilder::default()
    }

    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: HarnessConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SmokeError> {
        if self.command.trim().is_empty() {
            return Err(SmokeError::ConfigurationError(
                "service command cannot be empty".to_string(),
            ));
        }

        if self.modes.is_empty() {
            return Err(SmokeError::ConfigurationError(
                "at least one transport mode must be selected".to_string(),
            ));
        }

        if self.sse_port == 0 || self.http_port == 0 {
            return Err(SmokeError::ConfigurationError(
                "ports must be greater than zero".to_string(),
            ));
        }

        if self.sse_port == self.http_port {
            return Err(SmokeError::ConfigurationError(format!(
                "sse and http-unary cannot share port {}",
                self.sse_port
            )));
        }

        self.timeouts
            .validate()
            .map_err(|e| SmokeError::ConfigurationError(e.to_string()))
    }

    /// Port the service listens on for the given mode
    pub fn port(&self, mode: TransportMode) -> Option<u16> {
        match mode {
            TransportMode::PipedStream => None,
            TransportMode::Sse | TransportMode::MultiTenant => Some(self.sse_port),
            TransportMode::HttpUnary => Some(self.http_port),
        }
    }

    pub fn base_url(&self, mode: TransportMode) -> Option<String> {
        self.port(mode)
            .map(|port| format!("http://{}:{port}", self.host))
    }

    /// Full argument vector for launching the service in `mode`
    pub fn launch_args(&self, mode: TransportMode) -> Vec<String> {
        let mut args = self.args.clone();
        match mode {
            TransportMode::PipedStream => {}
            TransportMode::Sse | TransportMode::MultiTenant => {
                args.extend(["--transport".to_string(), "sse".to_string()]);
                args.extend(["--port".to_string(), self.sse_port.to_string()]);
            }
            TransportMode::HttpUnary => {
                args.extend(["--transport".to_string(), "streamable".to_string()]);
                args.extend(["--port".to_string(), self.http_port.to_string()]);
            }
        }
        args.extend(["--browserUrl".to_string(), self.upstream_url.clone()]);
        args
    }

    pub fn spawn_spec(&self, mode: TransportMode) -> SpawnSpec {
        SpawnSpec {
            command: self.command.clone(),
            args: self.launch_args(mode),
            env: self.env.clone(),
            working_dir: self.working_directory.clone(),
            stdio: if mode.uses_http() {
                StdioRouting::Diagnostics
            } else {
                StdioRouting::Protocol
            },
            diagnostic_lines: self.diagnostic_lines,
        }
    }
}

impl HarnessConfigBuilder {
    pub fn args<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        let args: Vec<String> = iter.into_iter().map(|s| s.to_string()).collect();
        self.args = Some(args);
        self
    }

    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.env.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());
        self
    }

    pub fn env_multi<T: ToString, I: IntoIterator<Item = (T, T)>>(&mut self, iter: I) -> &mut Self {
        let env = self.env.get_or_insert_with(HashMap::new);
        for (key, value) in iter {
            env.insert(key.to_string(), value.to_string());
        }
        self
    }
}

// Default value functions for serde and the builder
fn default_step_timeout_ms() -> u64 {
    5_000
}
fn default_slow_step_timeout_ms() -> u64 {
    30_000
}
fn default_ready_max_wait_ms() -> u64 {
    10_000
}
fn default_ready_poll_interval_ms() -> u64 {
    100
}
fn default_ready_settle_ms() -> u64 {
    500
}
fn default_stop_grace_ms() -> u64 {
    3_000
}
fn default_precondition_timeout_ms() -> u64 {
    2_000
}
fn default_sse_connect_timeout_ms() -> u64 {
    2_000
}
fn default_drain_join_ms() -> u64 {
    1_000
}
fn default_true() -> bool {
    true
}
fn default_arguments() -> Value {
    Value::Object(Default::default())
}
fn default_command() -> String {
    "node".to_string()
}
fn default_args() -> Vec<String> {
    vec!["build/src/index.js".to_string()]
}
fn default_upstream_url() -> String {
    "http://127.0.0.1:9222".to_string()
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_sse_port() -> u16 {
    32122
}
fn default_http_port() -> u16 {
    32123
}
fn default_modes() -> Vec<TransportMode> {
    TransportMode::ALL.to_vec()
}
fn default_operations() -> Vec<OperationSpec> {
    vec![OperationSpec::new("list_pages")]
}
fn default_protocol_version() -> String {
    "2024-11-05".to_string()
}
fn default_client_name() -> String {
    "test-client".to_string()
}
fn default_client_version() -> String {
    "1.0.0".to_string()
}
fn default_diagnostic_lines() -> usize {
    200
}
