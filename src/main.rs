// Module declarations
mod bridges;
mod cli;
mod config;
mod correlation;
mod error;
mod ingress;
mod poller;
mod registry;
mod terminal;
mod types;

#[cfg(test)]
mod testing;

// Re-export module items at crate root so cross-module references stay short.
#[allow(unused_imports)]
pub(crate) use cli::*;
#[allow(unused_imports)]
pub(crate) use config::*;
#[allow(unused_imports)]
pub(crate) use correlation::*;
#[allow(unused_imports)]
pub(crate) use error::*;
#[allow(unused_imports)]
pub(crate) use ingress::*;
#[allow(unused_imports)]
pub(crate) use poller::*;
#[allow(unused_imports)]
pub(crate) use registry::*;
#[allow(unused_imports)]
pub(crate) use terminal::*;
#[allow(unused_imports)]
pub(crate) use types::*;

use clap::Parser;

use crate::bridges::run_relay;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve(args) => {
            let config = load_config(&args)?;
            run_relay(config)
        }

        Command::Config(args) => {
            let config = load_config(&args)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(args: &ServeArgs) -> Result<RelayConfig, ConfigError> {
    let file = match &args.config {
        Some(path) => load_file_config(path)?,
        None => FileConfig::default(),
    };
    resolve_config(args, env_optional, file)
}
