//! Command-line arguments.

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

/// toolgate — authenticated gateway for JSON-RPC tool servers.
#[derive(Debug, Parser)]
#[command(name = "toolgate", version, about = "Gateway and load balancer for JSON-RPC tool servers")]
pub struct Cli {
    /// Subcommand; defaults to `serve`.
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the gateway (the default).
    Serve {
        /// Config directory holding gateway.json and templates/.
        #[arg(long, env = "TOOLGATE_CONFIG", default_value = "config")]
        config: PathBuf,
        /// Override the bind host.
        #[arg(long)]
        host: Option<String>,
        /// Override the bind port.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Validate a config directory and print a summary.
    CheckConfig {
        /// Config directory to validate.
        #[arg(default_value = "config")]
        config: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let cli = Cli::parse_from(["toolgate"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn serve_flags_parse() {
        let cli = Cli::parse_from([
            "toolgate", "serve", "--config", "/tmp/cfg", "--host", "0.0.0.0", "--port", "9000",
            "-vv",
        ]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Some(Command::Serve { config, host, port }) => {
                assert_eq!(config, PathBuf::from("/tmp/cfg"));
                assert_eq!(host.as_deref(), Some("0.0.0.0"));
                assert_eq!(port, Some(9000));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn check_config_parses() {
        let cli = Cli::parse_from(["toolgate", "check-config", "/etc/toolgate"]);
        assert!(matches!(cli.command, Some(Command::CheckConfig { .. })));
    }
}
