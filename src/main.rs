mod bootstrap;
mod config;
mod executor;
mod gateway;
mod host;
mod registry;
mod request;
mod security;
mod server;
mod session;
mod standalone;

use std::path::PathBuf;

use clap::Parser;
use rmcp::{transport::stdio, ServiceExt};
use tracing_subscriber::EnvFilter;

use config::Config;
use server::LuaConsoleServer;
use standalone::StandaloneHost;

#[derive(Parser)]
#[command(
    name = "lua-console-mcp-server",
    about = "Permission-gated Lua console for a game server, served over MCP stdio"
)]
struct Cli {
    /// Config file path.
    #[arg(long, default_value = "lua-console.toml")]
    config: PathBuf,

    /// Directory holding allowedPlayers.txt.
    #[arg(long, default_value = "lua-console")]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load_or_default(&cli.config)?;
    let host = StandaloneHost::from_config(&config);

    // The console stays inert rather than exiting when bootstrap refuses.
    let gateway = match bootstrap::bootstrap(&host, &config.console, &cli.data_dir) {
        Ok(gateway) => Some(gateway),
        Err(e) => {
            tracing::error!("Lua console disabled: {e}");
            None
        }
    };

    LuaConsoleServer::new(gateway).serve(stdio()).await?.waiting().await?;
    Ok(())
}
