//! ragchat-mcp: Model Context Protocol server and multi-server client
//!
//! `serve` exposes the retrieval backend as an MCP server over stdio or HTTP.
//! `connect` starts the server manager over the configured servers and
//! prints the aggregated capability catalog.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use ragchat_mcp::config::{self, Config, TransportKind};
use ragchat_mcp::mcp::backend::MemoryBackend;
use ragchat_mcp::mcp::manager::{ManagerOptions, ServerManager};
use ragchat_mcp::mcp::server::{McpServer, ServerOptions};
use ragchat_mcp::mcp::transport::{HttpServerConfig, HttpServerTransport, StdioTransport, Transport};
use ragchat_mcp::mcp::McpResult;

/// MCP server and multi-server client for a retrieval-augmented chat application.
#[derive(Parser, Debug)]
#[command(name = "ragchat-mcp")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "CONFIG_FILE", global = true)]
    config: Option<PathBuf>,

    /// Increase logging verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Decrease logging verbosity (only show errors)
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the MCP server (the default)
    Serve {
        /// Transport to serve on; defaults to the configured one
        #[arg(long, value_enum)]
        transport: Option<TransportArg>,

        /// HTTP port; defaults to the configured one
        #[arg(long)]
        port: Option<u16>,
    },

    /// Connect to every configured server and print the aggregated catalog
    Connect,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TransportArg {
    Stdio,
    Http,
}

impl From<TransportArg> for TransportKind {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Stdio => Self::Stdio,
            TransportArg::Http => Self::Http,
        }
    }
}

/// Determines the log level from CLI arguments.
#[allow(clippy::match_same_arms)] // Explicit "warn" arm for clarity
fn get_log_level(verbose: u8, quiet: bool, config_level: &str) -> Level {
    if quiet {
        return Level::ERROR;
    }

    match verbose {
        0 => match config_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        },
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Initialises the tracing subscriber. Logs go to stderr; stdout carries
/// the stdio transport.
fn init_tracing(level: Level) {
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn server_transport(cfg: &Config, kind: TransportKind, port: Option<u16>) -> Arc<dyn Transport> {
    match kind {
        TransportKind::Stdio => {
            Arc::new(StdioTransport::stdio().with_max_message_size(cfg.protocol.max_message_size))
        }
        TransportKind::Http => {
            let http = &cfg.server.http;
            let mut listener = HttpServerConfig::new(http.host.clone(), port.unwrap_or(http.port), http.path.clone());
            listener.cors = http.cors;
            listener.max_message_size = cfg.protocol.max_message_size;
            Arc::new(HttpServerTransport::new(listener))
        }
    }
}

async fn serve(cfg: Config, kind: TransportKind, port: Option<u16>) -> McpResult<()> {
    let server = McpServer::new(Arc::new(MemoryBackend::demo()), ServerOptions::from_config(&cfg));
    let transport = server_transport(&cfg, kind, port);
    info!(transport = %kind, "MCP server ready, waiting for client connection...");
    server.run(transport).await
}

async fn connect(cfg: Config) -> McpResult<()> {
    let mut options = ManagerOptions::from_config(&cfg);
    options.auto_connect = true;
    let manager = ServerManager::new(cfg.servers.clone(), options);

    let connected = manager.start().await;
    info!(connected, configured = cfg.servers.len(), "Connected to MCP servers");

    let report = json!({
        "servers": manager.status(),
        "capabilities": manager.get_aggregated_capabilities(),
    });
    manager.stop().await;

    let text = serde_json::to_string_pretty(&report)
        .map_err(|e| ragchat_mcp::mcp::McpError::internal(format!("failed to render report: {e}")))?;
    println!("{text}");
    Ok(())
}

/// Entry point for the ragchat-mcp binary.
fn main() -> ExitCode {
    let args = Args::parse();

    // Load configuration
    let config_path = args.config.as_deref();
    let cfg = match config::load_config(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            if config_path.is_none() {
                if let Some(default_path) = config::default_config_path() {
                    eprintln!("\nExpected config at: {}", default_path.display());
                }
            }
            return ExitCode::FAILURE;
        }
    };

    // Initialise logging
    let log_level = get_log_level(args.verbose, args.quiet, &cfg.logging.level);
    init_tracing(log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting ragchat-mcp");

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match args.command {
        Some(Command::Connect) => runtime.block_on(connect(cfg)),
        Some(Command::Serve { transport, port }) => {
            let kind = transport.map_or(cfg.server.transport, TransportKind::from);
            runtime.block_on(serve(cfg, kind, port))
        }
        None => {
            let kind = cfg.server.transport;
            runtime.block_on(serve(cfg, kind, None))
        }
    };

    match result {
        Ok(()) => {
            info!("Shut down gracefully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Fatal error");
            ExitCode::FAILURE
        }
    }
}
