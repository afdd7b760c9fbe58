//! Configuration for distexp.
//!
//! Holds clap structs for the agent binary and for controller programs,
//! and the logging setup both of them share.

use std::fs::OpenOptions;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use clap::Parser;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::checkpoint::DEFAULT_CHECKPOINT_FILE;
use crate::error::DistexpError;

#[derive(Parser, Debug)]
#[command(version, author, about = "Runs and supervises commands for a distexp controller")]
pub struct AgentConfig {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    pub ip: IpAddr,

    /// Port to listen on
    #[arg(long, short, default_value_t = 20000)]
    pub port: u16,

    /// Keep running even when no controller has connected for a while
    #[arg(long)]
    pub run_forever: bool,

    /// Seconds without any controller connection before the agent exits
    #[arg(long, default_value_t = 3600)]
    pub max_idle: u64,

    /// Write logs to this file instead of stderr
    #[arg(long = "log", short = 'o')]
    pub log_file: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl AgentConfig {
    /// `None` when the agent should never exit on its own.
    pub fn idle_limit(&self) -> Option<Duration> {
        if self.run_forever {
            None
        } else {
            Some(Duration::from_secs(self.max_idle))
        }
    }
}

#[derive(Parser, Debug)]
#[command(version, author)]
pub struct ControllerConfig {
    /// Skip experiments recorded in the checkpoint file by an earlier run
    #[arg(long)]
    pub resume: bool,

    /// Checkpoint file to use
    #[arg(long, default_value = DEFAULT_CHECKPOINT_FILE)]
    pub checkpoint_file: PathBuf,

    /// Slack incoming webhook to notify when the batch finishes
    #[arg(long)]
    pub slack_webhook: Option<String>,

    /// Servers file to use. Defaults to `servers.yaml`
    #[arg(long, default_value = "servers.yaml")]
    pub servers_file: PathBuf,

    /// Write logs to this file instead of stderr
    #[arg(long = "log")]
    pub log_file: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// The level for a `-v` count: none shows errors only, `-vvv` shows debug.
pub fn verbosity_level(verbose: u8) -> Level {
    match verbose {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        _ => Level::DEBUG,
    }
}

/// Installs the global subscriber. `RUST_LOG` takes precedence over `verbose`.
pub fn init_logging(verbose: u8, log_file: Option<&Path>) -> Result<(), DistexpError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity_level(verbose).as_str()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    result.map_err(|e| DistexpError::Config(format!("Failed to set up logging: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_defaults() {
        let config = AgentConfig::parse_from(["distexp-agent"]);
        assert_eq!(config.port, 20000);
        assert_eq!(config.ip.to_string(), "0.0.0.0");
        assert_eq!(config.idle_limit(), Some(Duration::from_secs(3600)));
        assert_eq!(config.verbose, 0);
    }

    #[test]
    fn test_agent_flags() {
        let config = AgentConfig::parse_from([
            "distexp-agent",
            "-p",
            "20001",
            "--run-forever",
            "-o",
            "agent.log",
            "-vv",
        ]);
        assert_eq!(config.port, 20001);
        assert_eq!(config.idle_limit(), None);
        assert_eq!(config.log_file, Some(PathBuf::from("agent.log")));
        assert_eq!(verbosity_level(config.verbose), Level::INFO);
    }

    #[test]
    fn test_controller_defaults() {
        let config = ControllerConfig::parse_from(["sweep", "--resume"]);
        assert!(config.resume);
        assert_eq!(config.checkpoint_file, PathBuf::from(DEFAULT_CHECKPOINT_FILE));
        assert_eq!(config.servers_file, PathBuf::from("servers.yaml"));
        assert!(config.slack_webhook.is_none());
    }
}
