use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use onion_relay::{Node, NodeConfig};

#[derive(Parser)]
#[command(name = "onion-relay", version, about = "Multi-hop relay node with a local HTTP/CONNECT proxy")]
struct Args {
    /// JSON configuration file; defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_level),
    )
    .init();

    let config = match args.config {
        Some(path) => match NodeConfig::load(&path) {
            Ok(config) => config,
            Err(e) => {
                log::error!("{}", e);
                return ExitCode::FAILURE;
            }
        },
        None => NodeConfig::default(),
    };

    let node = match Node::start(config).await {
        Ok(node) => node,
        Err(e) => {
            log::error!("startup failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = node.run().await {
        log::error!("{}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
