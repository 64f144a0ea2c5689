//! flotillad: the Flotilla controller daemon.
//!
//! Assembles the controller in one process:
//! - State store (redb, on disk or in memory)
//! - Formation change feed
//! - Job dispatcher over the configured host agents
//! - HTTP API
//!
//! # Usage
//!
//! ```text
//! flotillad --config /etc/flotilla/flotilla.toml --port 1200 --data-dir /var/lib/flotilla
//! ```

mod controller;

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use flotilla_core::ControllerConfig;

use crate::controller::Controller;

#[derive(Debug, Parser)]
#[command(name = "flotillad", about = "Flotilla controller daemon")]
struct Cli {
    /// TOML config file. Flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port to listen on.
    #[arg(long)]
    port: Option<u16>,

    /// Data directory for persistent state.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,

    /// Keep state in memory only; nothing survives a restart.
    #[arg(long)]
    in_memory: bool,
}

impl Cli {
    /// Load the config file (or defaults) and apply flag overrides.
    fn resolve_config(&self) -> anyhow::Result<ControllerConfig> {
        let mut config = match &self.config {
            Some(path) => ControllerConfig::from_file(path)
                .map_err(|e| anyhow::anyhow!("load config {}: {e}", path.display()))?,
            None => ControllerConfig::default(),
        };
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(data_dir) = &self.data_dir {
            config.server.data_dir = data_dir.clone();
        }
        Ok(config)
    }
}

fn init_tracing(log_filter: &str, json: bool) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log_filter)
            .map_err(|e| anyhow::anyhow!("invalid log filter {log_filter:?}: {e}"))?,
    };
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.resolve_config()?;
    init_tracing(&config.server.log_filter, cli.log_json)?;

    info!(
        port = config.server.port,
        hosts = config.hosts.len(),
        in_memory = cli.in_memory,
        "Flotilla controller starting"
    );

    let controller = Controller::open(&config, cli.in_memory)?;
    controller.run(config.server.port).await?;

    info!("Flotilla controller stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("flotillad").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_without_config_file() {
        let config = parse(&[]).resolve_config().unwrap();
        assert_eq!(config.server.port, 1200);
        assert_eq!(config.server.data_dir, PathBuf::from("/var/lib/flotilla"));
        assert!(config.hosts.is_empty());
    }

    #[test]
    fn flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flotilla.toml");
        std::fs::write(
            &path,
            r#"
[server]
port = 8080
data_dir = "/srv/flotilla"
log_filter = "warn"

[[hosts]]
id = "host0"
address = "10.0.0.5:1113"
"#,
        )
        .unwrap();

        let cli = parse(&["--config", path.to_str().unwrap(), "--port", "9000"]);
        let config = cli.resolve_config().unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.data_dir, PathBuf::from("/srv/flotilla"));
        assert_eq!(config.server.log_filter, "warn");
        assert_eq!(config.hosts[0].address, "10.0.0.5:1113");
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let cli = parse(&["--config", "/nonexistent/flotilla.toml"]);
        assert!(cli.resolve_config().is_err());
    }

    #[test]
    fn boolean_flags() {
        let cli = parse(&["--in-memory", "--log-json", "--data-dir", "/tmp/f"]);
        assert!(cli.in_memory);
        assert!(cli.log_json);
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/f")));
    }
}
