use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::{
    subsystem::{SetupError, Subsystem as _, SubsystemContext},
    subsystems::{ReceiveCommand, ToolsCommand},
};

/// Process core for the Tessera metrics storage service.
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    pub config_file: Option<PathBuf>,

    /// Subsystem to run.
    #[command(subcommand)]
    pub action: Action,
}

/// Subsystem selected at launch.
#[derive(Debug, Subcommand)]
pub enum Action {
    /// Runs a minimal remote-write receiver.
    Receive(ReceiveCommand),

    /// Offline tools.
    #[command(subcommand)]
    Tools(ToolsCommand),
}

impl Action {
    /// Returns the name of the selected subsystem.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Receive(command) => command.name(),
            Self::Tools(command) => command.name(),
        }
    }

    /// Sets up the selected subsystem.
    pub async fn setup(self, context: &mut SubsystemContext) -> Result<(), SetupError> {
        match self {
            Self::Receive(command) => command.setup(context).await,
            Self::Tools(command) => command.setup(context).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory as _;

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_subcommands() {
        let cli = Cli::try_parse_from(["tessera", "receive", "--listen-address", "0.0.0.0:9000"]).unwrap();
        assert_eq!(cli.action.name(), "receive");
        assert!(cli.config_file.is_none());

        let cli = Cli::try_parse_from([
            "tessera",
            "tools",
            "inspect-write-request",
            "--file",
            "/tmp/request.bin",
            "--config",
            "/etc/tessera.yaml",
        ])
        .unwrap();
        assert_eq!(cli.action.name(), "inspect-write-request");
        assert_eq!(cli.config_file, Some(PathBuf::from("/etc/tessera.yaml")));

        assert!(Cli::try_parse_from(["tessera"]).is_err());
    }
}
