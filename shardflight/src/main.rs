mod server;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use shardflight_core::{logging, Config};

use server::NodeServer;

#[derive(Parser, Debug)]
#[command(name = "shardflight")]
#[command(about = "Arrow Flight stream delivery node", long_about = None)]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, short, env = "SHARDFLIGHT_CONFIG")]
    config: Option<String>,

    /// Node ID (defaults to the hostname)
    #[arg(long, env = "SHARDFLIGHT_NODE_ID")]
    node_id: Option<String>,

    /// Flight listen port (0 picks a free port)
    #[arg(long, env = "SHARDFLIGHT_PORT")]
    port: Option<u16>,
}

impl Args {
    /// Flags override the file and `SHARDFLIGHT_*` sections.
    fn apply(&self, config: &mut Config) {
        if let Some(node_id) = &self.node_id {
            config.node.id.clone_from(node_id);
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    logging::init_logging(&config.logging)?;
    info!(node_id = %config.node.id, "shardflight starting...");
    info!("Flight address: {}", config.listen_address());

    let server = NodeServer::start(config).await?;
    server.run_until_shutdown().await;

    info!("shardflight stopped");
    Ok(())
}
