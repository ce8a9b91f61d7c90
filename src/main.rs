//! # Operator Entry Point
//!
//! Starts a relay server or a storage lander and then reads interactive
//! commands from stdin: `stat` prints who is connected, `stop` shuts
//! down gracefully, `quit` leaves without waiting for peers.

use anyhow::Result;
use clap::Parser;
use logrelay::broker::{BrokerConfig, LogServer};
use logrelay::cli::{Args, Role};
use logrelay::lander::Lander;
use logrelay::logging;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = logging::init(args.verbose, args.quiet, args.log_file.as_deref());

    match args.role {
        Role::Server { host, port } => run_server(host, port).await,
        Role::Lander { host, port, dir } => run_lander(host, port, dir).await,
    }
}

async fn run_server(host: String, port: u16) -> Result<()> {
    let mut server = LogServer::new(BrokerConfig { host, port });
    server.start().await?;
    println!("commands: stat, stop (graceful), stop! (forced), quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = lines.next_line().await?;
        let Some(line) = line else {
            // stdin closed; take everything down.
            server.stop(false).await;
            break;
        };
        match line.trim() {
            "" => {}
            "stat" => {
                let report = server.status();
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            "stop" => {
                if server.stop(true).await {
                    break;
                }
                println!("peers are still connected; 'stat' lists them, 'stop!' forces");
            }
            "stop!" | "quit" => {
                server.stop(false).await;
                break;
            }
            other => println!("unknown command {other:?}; try stat, stop, stop! or quit"),
        }
    }
    info!("server front-end exiting");
    Ok(())
}

async fn run_lander(host: String, port: u16, dir: PathBuf) -> Result<()> {
    let mut lander = Lander::new(dir);
    lander.connect(&host, port).await?;
    println!("commands: stat, stop, quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = lines.next_line().await?;
        let Some(line) = line else {
            lander.disconnect().await;
            break;
        };
        match line.trim() {
            "" => {}
            "stat" => {
                println!(
                    "lander is {}",
                    if lander.is_connected() {
                        "connected"
                    } else {
                        "disconnected"
                    }
                );
            }
            "stop" | "quit" => {
                lander.disconnect().await;
                break;
            }
            other => println!("unknown command {other:?}; try stat, stop or quit"),
        }
    }
    info!("lander front-end exiting");
    Ok(())
}
