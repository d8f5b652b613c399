//! netlabd - workspace orchestration daemon

use std::path::{Path, PathBuf};

use clap::Parser;
use tracing::info;

use netlab_utils::{paths, LogConfig, Result};

mod broker;
mod config;
mod daemon;
mod driver;
mod handlers;
mod multiplexer;
mod prompt;
mod telnet;
#[cfg(test)]
mod testing;
mod watcher;
mod workspace;

use config::{config_handle, AppConfig, ConfigLoader, Environment};
use daemon::Daemon;

#[derive(Parser, Debug)]
#[command(name = "netlabd", version, about = "Workspace orchestration daemon for netlab")]
struct Cli {
    /// Environment scoping queue names and logging
    #[arg(short, long, value_enum, env = "NETLAB_ENV")]
    environment: Option<Environment>,

    /// Directory holding the workspace directories
    #[arg(short, long)]
    path: Option<PathBuf>,

    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address the broker bridge listens on
    #[arg(long)]
    broker_listen: Option<String>,
}

impl Cli {
    /// Override file settings with command line values
    fn apply(&self, config: &mut AppConfig, cwd: &Path) -> Result<()> {
        if let Some(environment) = self.environment {
            config.general.environment = environment;
        }
        if let Some(path) = &self.path {
            config.general.workspace_root = paths::normalize(&cwd.join(path));
        }
        if let Some(listen) = &self.broker_listen {
            config.broker.listen = listen.clone();
        }
        ConfigLoader::validate(config)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ConfigLoader::load_and_validate(cli.config.as_deref())?;
    cli.apply(&mut config, &std::env::current_dir()?)?;

    let log_config = match config.general.environment {
        Environment::Development => LogConfig::development(),
        Environment::Test | Environment::Production => LogConfig::daemon(),
    };
    netlab_utils::init_logging_with_config(log_config)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.general.environment,
        "Starting netlabd"
    );

    Daemon::new(config_handle(config)).await.run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_config() {
        let cli = Cli::try_parse_from([
            "netlabd",
            "-e",
            "production",
            "-p",
            "labs/../workspaces/",
            "--broker-listen",
            "0.0.0.0:6000",
        ])
        .unwrap();

        let mut config = AppConfig::default();
        cli.apply(&mut config, Path::new("/srv/netlab")).unwrap();

        assert_eq!(config.general.environment, Environment::Production);
        assert_eq!(
            config.general.workspace_root,
            PathBuf::from("/srv/netlab/workspaces")
        );
        assert_eq!(config.broker.listen, "0.0.0.0:6000");
    }

    #[test]
    fn test_absolute_path_kept() {
        let cli = Cli::try_parse_from(["netlabd", "--path", "/var/lib/netlab"]).unwrap();
        let mut config = AppConfig::default();
        cli.apply(&mut config, Path::new("/home/lab")).unwrap();
        assert_eq!(config.general.workspace_root, PathBuf::from("/var/lib/netlab"));
    }

    #[test]
    fn test_invalid_override_rejected() {
        let cli = Cli::try_parse_from(["netlabd", "--broker-listen", "not an address"]).unwrap();
        let mut config = AppConfig::default();
        assert!(cli.apply(&mut config, Path::new("/")).is_err());
    }

    #[test]
    fn test_unknown_environment_rejected() {
        assert!(Cli::try_parse_from(["netlabd", "-e", "staging"]).is_err());
    }
}
