//! castlink relay server binary.
//!
//! ```text
//! castlink [CONFIG] [--bind-addr ADDR] [--recordings-folder DIR] [--activity-log FILE]
//! ```

use castlink_relay::{ConfigError, ConfigOverrides, RelayServer, ServerConfig};
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal;

/// castlink signaling relay
///
/// Pairs media emitters with receivers and relays their WebRTC negotiation.
/// A config file with random emitter and admin paths is written on first run.
#[derive(Parser, Debug)]
#[command(name = "castlink", author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(default_value = "castlink.toml", env = "CASTLINK_CONFIG")]
    config: PathBuf,

    /// Listen address, overriding `bind_addr`
    #[arg(long, env = "CASTLINK_BIND_ADDR")]
    bind_addr: Option<String>,

    /// Folder for uploads and recordings, overriding `recordings_folder`
    #[arg(long, env = "CASTLINK_RECORDINGS_FOLDER")]
    recordings_folder: Option<PathBuf>,

    /// JSONL activity log, overriding `activity_log`
    #[arg(long, env = "CASTLINK_ACTIVITY_LOG")]
    activity_log: Option<PathBuf>,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            bind_addr: self.bind_addr.clone(),
            recordings_folder: self.recordings_folder.clone(),
            activity_log: self.activity_log.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let server = match RelayServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    match server.run(shutdown_signal()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(args: &Args) -> Result<ServerConfig, ConfigError> {
    let (mut config, created) = ServerConfig::load_or_create(&args.config)?;
    if created {
        info!("Edit {} to change paths and options", args.config.display());
    }
    config.apply(args.overrides())?;
    Ok(config)
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_flags_become_overrides() {
        let args = Args::try_parse_from([
            "castlink",
            "relay.toml",
            "--bind-addr",
            "0.0.0.0:9000",
            "--recordings-folder",
            "/srv/castlink",
        ])
        .unwrap();
        assert_eq!(args.config, PathBuf::from("relay.toml"));
        let overrides = args.overrides();
        assert_eq!(overrides.bind_addr.as_deref(), Some("0.0.0.0:9000"));
        assert_eq!(overrides.recordings_folder, Some(PathBuf::from("/srv/castlink")));
    }

    #[test]
    fn test_load_config_applies_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("castlink.toml");
        let args = Args::try_parse_from([
            "castlink",
            path.to_str().unwrap(),
            "--bind-addr",
            "127.0.0.1:0",
        ])
        .unwrap();
        let config = load_config(&args).unwrap();
        assert!(path.exists());
        assert_eq!(config.bind_addr, "127.0.0.1:0");
    }
}
