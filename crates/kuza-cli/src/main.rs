//! Kuza: VPN client control plane
//!
//! Command-line front end. Loads the settings file, wires the registry,
//! compiler and session controller to a tunnel engine and runs one
//! command.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use kuza_vpn::SelectionMode;
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Kuza VPN client
#[derive(Parser, Debug)]
#[command(name = "kuza")]
#[command(about = "Route all traffic or selected apps through a WireGuard tunnel", long_about = None)]
#[command(version)]
struct Cli {
    /// Settings file (TOML, or JSON by extension)
    #[arg(short, long, env = "KUZA_CONFIG", default_value = "kuza.toml")]
    config: PathBuf,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Tunnel engine to drive
    #[arg(long, value_enum, default_value_t = EngineKind::Simulated)]
    engine: EngineKind,

    /// Interface name for the wg-quick engine
    #[arg(long, default_value = "kuza0")]
    interface: String,

    /// Directory the wg-quick engine writes interface configs to
    #[arg(long, default_value = "/etc/wireguard")]
    wg_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a settings file with a fresh client key
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print a new X25519 keypair
    Keygen,
    /// List the app catalog and the default selection
    Apps,
    /// Compile and print the routing rule without connecting
    Plan {
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
        /// App id to select (repeatable); replaces the default selection
        #[arg(long = "app")]
        apps: Vec<String>,
    },
    /// Connect, report bandwidth, then disconnect
    Connect {
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
        /// App id to select (repeatable); replaces the default selection
        #[arg(long = "app")]
        apps: Vec<String>,
        /// Stay connected this long; until Ctrl-C when omitted
        #[arg(long)]
        seconds: Option<u64>,
    },
    /// Show the tunnel engine's status and counters
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EngineKind {
    /// In-process engine with synthetic counters
    Simulated,
    /// wg-quick and wg on this host
    WgQuick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    /// Encrypt all traffic
    All,
    /// Only the selected apps
    Custom,
}

impl From<ModeArg> for SelectionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::All => SelectionMode::EncryptAll,
            ModeArg::Custom => SelectionMode::Custom,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .compact()
        .init();

    let engine = commands::Engine {
        kind: cli.engine,
        interface: cli.interface,
        wg_dir: cli.wg_dir,
    };

    match cli.command {
        Command::Init { force } => commands::init(&cli.config, force),
        Command::Keygen => {
            commands::keygen();
            Ok(())
        }
        Command::Apps => commands::apps(&cli.config, &engine).await,
        Command::Plan { mode, apps } => {
            commands::plan(&cli.config, &engine, mode.map(Into::into), &apps).await
        }
        Command::Connect { mode, apps, seconds } => {
            commands::connect(&cli.config, &engine, mode.map(Into::into), &apps, seconds).await
        }
        Command::Status => commands::status(&engine).await,
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
    fn test_parse_connect() {
        let cli = Cli::try_parse_from([
            "kuza", "-c", "alt.toml", "connect", "--mode", "custom", "--app", "com.whatsapp",
            "--app", "com.instagram.android", "--seconds", "5",
        ])
        .unwrap();

        assert_eq!(cli.config, PathBuf::from("alt.toml"));
        assert_eq!(cli.engine, EngineKind::Simulated);
        match cli.command {
            Command::Connect { mode, apps, seconds } => {
                assert_eq!(mode.map(SelectionMode::from), Some(SelectionMode::Custom));
                assert_eq!(apps, vec!["com.whatsapp", "com.instagram.android"]);
                assert_eq!(seconds, Some(5));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_engine() {
        let cli = Cli::try_parse_from(["kuza", "--engine", "wg-quick", "status"]).unwrap();
        assert_eq!(cli.engine, EngineKind::WgQuick);
        assert!(Cli::try_parse_from(["kuza", "--engine", "tun", "status"]).is_err());
    }
}
