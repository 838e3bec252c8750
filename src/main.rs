use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{error, info, warn};

use mcp_conduit::config::{ClientConfig, ServerConfig, StdioConfig};
use mcp_conduit::error::McpResult;
use mcp_conduit::io::StdioTransport;
use mcp_conduit::io::http::HttpServer;
use mcp_conduit::logging::{LogConfig, init_logging};
use mcp_conduit::server::{
    Dispatcher, EchoRouter, ErrorHandler, LifecycleManager, LifecyclePhase, Service, StdioServer,
    hook_fn,
};
use mcp_conduit::session::{ClientSession, InMemorySessionStore};

/// CLI arguments for the MCP conduit
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (overrides RUST_LOG env var)
    #[arg(long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Log file path (overrides MCP_CONDUIT_LOG_FILE env var)
    #[arg(long, value_name = "FILE", global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the built-in echo catalog over stdio or streamable HTTP
    Serve {
        /// Listen for HTTP on this address instead of serving stdio
        #[arg(long, value_name = "ADDR")]
        http: Option<SocketAddr>,

        /// Disable the legacy HTTP+SSE endpoints
        #[arg(long)]
        no_legacy_sse: bool,
    },
    /// Spawn a stdio server, initialize, send one request and print the result
    Call {
        /// JSON-RPC method to call after the handshake
        #[arg(long, short, default_value = "tools/list")]
        method: String,

        /// Request params as a JSON document
        #[arg(long, short, value_name = "JSON")]
        params: Option<String>,

        /// Server command followed by its arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        server: Vec<String>,
    },
}

/// Run a service under the lifecycle manager until it ends or ctrl-c
async fn run_service<S>(service: Arc<S>, wait: impl Future<Output = McpResult<()>>) -> McpResult<()>
where
    S: Service + 'static,
{
    let lifecycle = LifecycleManager::new(service.clone() as Arc<dyn Service>);
    let name = service.name().to_string();
    lifecycle.register_hook(
        LifecyclePhase::Running,
        0,
        hook_fn(move |phase| {
            info!(service = %name, %phase, "MCP conduit ready");
            Ok(())
        }),
    );

    lifecycle.initialize().await?;
    lifecycle.startup().await?;

    let outcome = tokio::select! {
        result = wait => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            Ok(())
        }
    };

    if let Err(e) = lifecycle.shutdown().await {
        warn!(error = %e, "Shutdown reported an error");
    }
    info!(stats = ?lifecycle.stats(), "Server stopped");
    outcome
}

async fn serve(http: Option<SocketAddr>, no_legacy_sse: bool) -> McpResult<()> {
    let mut config = ServerConfig::from_env();
    if let Some(address) = http {
        config = config.with_bind_address(address);
    }
    if no_legacy_sse {
        config = config.with_legacy_sse(false);
    }
    config.validate()?;

    let sessions = Arc::new(InMemorySessionStore::new(config.session_ttl));
    let dispatcher = Arc::new(Dispatcher::new(config, Arc::new(EchoRouter), sessions));

    match http {
        Some(_) => {
            let server = Arc::new(HttpServer::new(dispatcher));
            let waiter = Arc::clone(&server);
            run_service(server, async move { waiter.wait().await }).await
        }
        None => {
            let server = Arc::new(StdioServer::new(dispatcher));
            let waiter = Arc::clone(&server);
            run_service(server, async move { waiter.wait().await }).await
        }
    }
}

async fn call(method: String, params: Option<String>, server: Vec<String>) -> McpResult<Value> {
    let params = params
        .map(|raw| serde_json::from_str::<Value>(&raw))
        .transpose()?;

    let mut argv = server.into_iter();
    let command = argv.next().unwrap_or_default();
    let stdio = StdioConfig::new(command)
        .with_args(argv)
        .with_stderr_handler(|line| {
            info!(target: "mcp_conduit::child", "{line}");
        })
        .with_exit_handler(Arc::new(ErrorHandler::default()));

    let session = ClientSession::connect(StdioTransport::new(stdio), ClientConfig::default()).await?;
    let handshake = session.initialize().await?;
    info!(
        server = %handshake.server_info.name,
        version = %handshake.protocol_version,
        "Connected"
    );

    let result = session.request(&method, params).await;
    if let Err(e) = session.close().await {
        warn!(error = %e, "Close failed");
    }
    result
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_config = LogConfig::from_env().with_overrides(args.log_level, args.log_file);
    if let Err(e) = init_logging(log_config) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    match args.command {
        Command::Serve {
            http,
            no_legacy_sse,
        } => {
            if let Err(e) = serve(http, no_legacy_sse).await {
                error!(error = %e, "Server failed");
                eprintln!("Server failed: {e}");
                std::process::exit(1);
            }
        }
        Command::Call {
            method,
            params,
            server,
        } => match call(method, params, server).await {
            Ok(result) => println!("{}", serde_json::to_string_pretty(&result)?),
            Err(e) => {
                eprintln!("Request failed: {e}");
                std::process::exit(1);
            }
        },
    }

    Ok(())
}
