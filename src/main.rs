//! switchboard-mcp: aggregating MCP gateway.
//!
//! One MCP endpoint on standard I/O in front of a configured fleet of
//! downstream MCP servers. Tools are namespaced per server; built-in
//! admin tools enable, disable, list, and refresh servers at runtime.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use switchboard_mcp::admin::ADMIN_NAMESPACE;
use switchboard_mcp::config::ConfigStore;
use switchboard_mcp::mcp::GatewayServer;

/// Aggregating MCP gateway.
///
/// Presents the union of the configured downstream servers' tools to one
/// MCP client, namespaced per server. Downstream servers are managed at
/// runtime through the built-in admin tools; changes are persisted to the
/// server-list document.
#[derive(Parser, Debug)]
#[command(name = "switchboard-mcp")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the server-list document (default: ~/.switchboard-mcp/servers.json)
    #[arg(long, value_name = "FILE")]
    servers: Option<std::path::PathBuf>,

    /// Path to the launch-descriptor document (default: ~/.switchboard-mcp/mcp-config.json)
    #[arg(long, value_name = "FILE")]
    mcp_config: Option<std::path::PathBuf>,

    /// Increase logging verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease logging verbosity (only show errors)
    #[arg(short, long)]
    quiet: bool,
}

/// Determines the log level from CLI arguments.
fn get_log_level(verbose: u8, quiet: bool) -> Level {
    if quiet {
        return Level::ERROR;
    }

    match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Initialises the tracing subscriber.
///
/// Logs go to standard error: standard output carries the protocol.
fn init_tracing(level: Level) {
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Entry point for the switchboard-mcp gateway.
fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(get_log_level(args.verbose, args.quiet));

    let (servers_path, launch_path) =
        match ConfigStore::resolve_paths(args.servers.as_deref(), args.mcp_config.as_deref()) {
            Ok(paths) => paths,
            Err(e) => {
                // No configuration directory and no overrides: nothing to
                // run against and nowhere to persist admin changes.
                error!(error = %e, "fatal configuration error");
                return ExitCode::from(1);
            }
        };

    let config = ConfigStore::load(servers_path, &launch_path, ADMIN_NAMESPACE);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting switchboard-mcp gateway"
    );

    // Current-thread runtime: the gateway serves a single stdio connection
    // and fans work out as cooperative tasks.
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to create Tokio runtime");
            return ExitCode::from(2);
        }
    };

    let result = runtime.block_on(async {
        let mut server = GatewayServer::new(config);
        server.run().await
    });

    match result {
        Ok(()) => {
            info!("Gateway shut down gracefully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Gateway terminated on fatal error");
            ExitCode::from(e.exit_code())
        }
    }
}
