use anyhow::Result;
use clap::{Parser, Subcommand};
use roomdrop::{relay, Config};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "roomdrop")]
#[command(about = "Room relay for peer-to-peer file sharing")]
struct Cli {
    /// Config file, defaults to the user config dir
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server
    Serve {
        #[arg(long, help = "Address to bind")]
        host: Option<String>,

        #[arg(long, short, help = "Port to listen on (0 picks a free port)")]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG wins over the default
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("roomdrop=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.relay.host = host;
            }
            if let Some(port) = port {
                config.relay.port = port;
            }
            relay::start_relay_server(config).await
        }
    }
}
