//! # Command-Line Interface
//!
//! Argument parsing for the operator binary. The two roles mirror the
//! two long-running processes of the fabric: `server` runs the relay
//! broker, `lander` runs a storage agent. Emitting clients are a library
//! concern and have no front-end here.

use crate::defaults;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// logrelay - a three-tier log-routing broker
///
/// Start a relay server or a storage lander, then drive it with the
/// interactive commands `stat`, `stop` and `quit` on stdin.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Increase diagnostic verbosity (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress console diagnostics
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Append full diagnostics to a daily-rolling file at this path
    #[arg(long, global = true)]
    pub log_file: Option<String>,

    #[command(subcommand)]
    pub role: Role,
}

#[derive(Subcommand, Debug)]
pub enum Role {
    /// Run the relay server brokering clients and landers
    Server {
        /// Address to bind the listening socket on
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to listen on
        #[arg(short, long, default_value_t = defaults::SERVER_PORT)]
        port: u16,
    },

    /// Run a storage lander persisting logs to dated files
    Lander {
        /// Relay server address to connect to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Relay server port
        #[arg(short, long, default_value_t = defaults::SERVER_PORT)]
        port: u16,

        /// Directory receiving the dated log files
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults() {
        let args = Args::parse_from(["logrelay", "server"]);
        match args.role {
            Role::Server { host, port } => {
                assert_eq!(host, "127.0.0.1");
                assert_eq!(port, defaults::SERVER_PORT);
            }
            other => panic!("unexpected role {other:?}"),
        }
    }

    #[test]
    fn lander_takes_a_directory() {
        let args = Args::parse_from(["logrelay", "-v", "lander", "--dir", "/var/log/landing"]);
        assert_eq!(args.verbose, 1);
        match args.role {
            Role::Lander { dir, .. } => {
                assert_eq!(dir, PathBuf::from("/var/log/landing"));
            }
            other => panic!("unexpected role {other:?}"),
        }
    }
}
