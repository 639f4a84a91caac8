//! Tether - small peer groups on the local network
//!
//! Host a group or join one nearby, then chat line by line.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tether_core::{Device, SessionConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod chat;
mod error;
mod network;

#[derive(Parser, Debug)]
#[command(name = "tether", version)]
#[command(about = "Chat with a small group of devices on the local network")]
struct Cli {
    /// Display name other devices see (defaults to $USER)
    #[arg(long, global = true)]
    name: Option<String>,

    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Advertise a group and accept members
    Host {
        /// Group name shown to others
        group: String,

        /// Port to listen on (overrides the config file)
        #[arg(short, long)]
        port: Option<u16>,

        /// Run an in-process network with an echo peer instead of mDNS
        #[arg(long)]
        local: bool,
    },

    /// Find a nearby group and join it
    Join {
        /// Group to join (defaults to the first one found)
        #[arg(short, long)]
        group: Option<String>,

        /// Seconds to look for groups
        #[arg(short, long, default_value = "5")]
        window: u64,
    },
}

fn load_config(path: Option<PathBuf>) -> tether_core::Result<SessionConfig> {
    match path {
        Some(path) => SessionConfig::load(&path),
        None => SessionConfig::load_or_default(&SessionConfig::default_path()?),
    }
}

async fn run(cli: Cli) -> error::Result<()> {
    let mut config = load_config(cli.config)?;
    let name = cli
        .name
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "anonymous".to_string());
    let local = Device::local(name);
    tracing::info!("Starting Tether as {}", local);

    match cli.command {
        Command::Host { group, port, local: demo } => {
            if let Some(port) = port {
                config.owner_port = port;
            }
            network::host(local, config, &group, demo).await
        }
        Command::Join { group, window } => {
            network::join(local, config, group.as_deref(), Duration::from_secs(window)).await
        }
    }
}

fn main() {
    // Logs go to stderr so they do not interleave with chat on stdout
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(cli)) {
        tracing::error!("{}", e);
        eprintln!("tether: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_host() {
        let cli = Cli::parse_from(["tether", "host", "Study", "--port", "4000", "--local"]);
        match cli.command {
            Command::Host { group, port, local } => {
                assert_eq!(group, "Study");
                assert_eq!(port, Some(4000));
                assert!(local);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_join_defaults() {
        let cli = Cli::parse_from(["tether", "join", "--name", "bob"]);
        assert_eq!(cli.name.as_deref(), Some("bob"));
        match cli.command {
            Command::Join { group, window } => {
                assert!(group.is_none());
                assert_eq!(window, 5);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_explicit_config_must_exist() {
        let missing = std::env::temp_dir().join("tether-no-such-config.toml");
        assert!(load_config(Some(missing)).is_err());
    }
}
