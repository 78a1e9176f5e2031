use anyhow::{Context, Result};
use clap::Parser;
use mcp_smoke::console::ConsoleReporter;
use mcp_smoke::factory::{PlatformSupervisorFactory, SupervisorFactory, create_supervisor};
use mcp_smoke::precondition::check_upstream;
use mcp_smoke::{HarnessConfig, Leniency, Orchestrator, TransportMode};
use reqwest::Client;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Smoke-test an MCP service over every transport it supports
#[derive(Parser, Debug)]
#[command(name = "mcp-smoke", version, about)]
struct Cli {
    /// JSON configuration file; flags override its values
    #[arg(long, env = "MCP_SMOKE_CONFIG")]
    config: Option<PathBuf>,

    /// Service executable
    #[arg(long, env = "MCP_SMOKE_COMMAND")]
    command: Option<String>,

    /// Service argument placed before the transport flags (repeatable)
    #[arg(
        long = "arg",
        env = "MCP_SMOKE_ARGS",
        value_delimiter = ' ',
        allow_hyphen_values = true
    )]
    args: Vec<String>,

    /// Upstream browser debugging endpoint
    #[arg(long, env = "MCP_SMOKE_UPSTREAM_URL")]
    upstream_url: Option<String>,

    #[arg(long, env = "MCP_SMOKE_SSE_PORT")]
    sse_port: Option<u16>,

    #[arg(long, env = "MCP_SMOKE_HTTP_PORT")]
    http_port: Option<u16>,

    /// Only run these modes (repeatable): piped-stream, sse, http-unary, multi-tenant
    #[arg(long = "mode", env = "MCP_SMOKE_MODES", value_delimiter = ',')]
    modes: Vec<TransportMode>,

    /// Treat SSE header timeouts and HTTP 406 as failures
    #[arg(long, env = "MCP_SMOKE_STRICT")]
    strict: bool,

    /// Do not check the upstream before starting
    #[arg(long, env = "MCP_SMOKE_SKIP_PRECONDITION")]
    skip_precondition: bool,

    /// Print the final report as JSON instead of the console summary
    #[arg(long, env = "MCP_SMOKE_JSON")]
    json: bool,
}

impl Cli {
    fn into_config(self) -> Result<HarnessConfig> {
        let mut config = match &self.config {
            Some(path) => HarnessConfig::from_json_file(path)?,
            None => HarnessConfig::default(),
        };
        if let Some(command) = self.command {
            config.command = command;
            config.args.clear();
        }
        if !self.args.is_empty() {
            config.args = self.args;
        }
        if let Some(url) = self.upstream_url {
            config.upstream_url = url;
        }
        if let Some(port) = self.sse_port {
            config.sse_port = port;
        }
        if let Some(port) = self.http_port {
            config.http_port = port;
        }
        if !self.modes.is_empty() {
            config.modes = self.modes;
        }
        if self.strict {
            config.leniency = Leniency::strict();
        }
        config.skip_precondition |= self.skip_precondition;
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

/// Logs go to stderr so stdout carries only the report
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let json = std::env::var("MCP_SMOKE_LOG_FORMAT").is_ok_and(|format| format == "json");

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(std::io::stderr().is_terminal()),
            )
            .init();
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let as_json = cli.json;
    let config = cli.into_config()?;
    info!(
        platform = PlatformSupervisorFactory::platform_name(),
        command = %config.command,
        modes = ?config.modes,
        "Starting smoke run"
    );

    let client = Client::new();
    let mut console = ConsoleReporter::new(std::io::stdout());

    if config.skip_precondition {
        if !as_json {
            console.upstream_skipped();
        }
    } else {
        match check_upstream(&client, &config.upstream_url, config.timeouts.precondition()).await {
            Ok(info) => {
                if !as_json {
                    console.upstream_ok(&config.upstream_url, &info);
                }
            }
            Err(e) => {
                error!(error = %e, "Precondition failed");
                console.upstream_failed(&config.upstream_url, &e.to_string());
                return Ok(1);
            }
        }
    }

    let orchestrator = Orchestrator::with_client(&config, create_supervisor(&config), client);
    let report = if as_json {
        let report = orchestrator.run_all(&mut ()).await;
        console.json(&report);
        report
    } else {
        let report = orchestrator.run_all(&mut console).await;
        console.summary(&report);
        report
    };

    Ok(report.exit_code() as u8)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
