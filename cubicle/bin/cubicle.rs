use std::{net::SocketAddr, path::PathBuf};

use clap::{Parser, Subcommand};
use cubicle::{
    config::Config,
    runtime::spawn_reaper,
    server::{serve, AppState},
    CubicleResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Control plane for per-user cloud developer sandboxes.
#[derive(Debug, Parser)]
#[command(name = "cubicle", author, version, about)]
struct CubicleArgs {
    #[command(subcommand)]
    subcommand: CubicleSubcommand,
}

#[derive(Debug, Subcommand)]
enum CubicleSubcommand {
    /// Run the control-plane server.
    Serve {
        /// Address to listen on.
        #[arg(long, default_value = "0.0.0.0:8080")]
        addr: SocketAddr,

        /// Optional YAML configuration file; environment variables override it.
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Load configuration, print the effective values, and exit.
    CheckConfig {
        /// Optional YAML configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> CubicleResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = CubicleArgs::parse();
    match args.subcommand {
        CubicleSubcommand::Serve { addr, config } => {
            let config = Config::load(config.as_deref()).await?;
            let state = AppState::new(config).await?;

            let reaper = spawn_reaper(state.manager.clone());
            let result = serve(state, addr).await;
            reaper.abort();
            result
        }
        CubicleSubcommand::CheckConfig { config } => {
            let config = Config::load(config.as_deref()).await?;
            println!("{}", serde_yaml::to_string(&config).map_err(cubicle::CubicleError::from)?);
            Ok(())
        }
    }
}
