//! Node entry point.
//!
//! # Usage
//! ```text
//! tinychain <datadir> [OPTIONS]
//! ```
//!
//! Starts a single ledger node: state is loaded (or bootstrapped) from the
//! data directory, the mining and sync loops start, and the HTTP API binds
//! on the configured address. Ctrl-C shuts everything down gracefully.

use std::env;
use std::path::PathBuf;
use std::process;
use tinychain::error;
use tinychain::network::node::{self, DEFAULT_MINING_DIFFICULTY, NodeConfig, PeerNode};
use tinychain::types::address::Address;
use tokio::sync::watch;

const USAGE: &str = "\
tinychain - a proof-of-work account-ledger node

USAGE:
    {program} <datadir> [OPTIONS]

ARGS:
    <datadir>    Directory holding genesis.json and block.db

OPTIONS:
    --ip <addr>               Address to bind (default 127.0.0.1)
    --port <port>             Port to bind (default 8080)
    --miner <0x...>           Account credited as block miner (default zero)
    --difficulty <n>          Initial mining difficulty (default 2)
    --bootstrap-ip <addr>     Bootstrap peer address
    --bootstrap-port <port>   Bootstrap peer port (default 8080)
    --bootstrap-account <0x...>  Bootstrap peer's miner account
    -h, --help                Print this help message

EXAMPLES:
    # Start a standalone node
    {program} ~/.tinychain

    # Start a second node that follows the first
    {program} /tmp/node-b --port 8081 --bootstrap-ip 127.0.0.1 --bootstrap-port 8080
";

fn print_usage(program: &str) {
    eprintln!("{}", USAGE.replace("{program}", program));
}

fn parse_config(args: &[String]) -> Result<NodeConfig, String> {
    let datadir = PathBuf::from(&args[1]);

    let mut ip = "127.0.0.1".to_string();
    let mut port: u16 = 8080;
    let mut miner = Address::zero();
    let mut difficulty = DEFAULT_MINING_DIFFICULTY;
    let mut bootstrap_ip: Option<String> = None;
    let mut bootstrap_port: u16 = 8080;
    let mut bootstrap_account = Address::zero();

    let mut i = 2;
    while i < args.len() {
        let flag = args[i].as_str();
        i += 1;
        let value = args
            .get(i)
            .ok_or_else(|| format!("{flag} requires an argument"))?;
        i += 1;

        match flag {
            "--ip" => ip = value.clone(),
            "--port" => {
                port = value.parse().map_err(|_| format!("invalid port: {value}"))?;
            }
            "--miner" => {
                miner = value
                    .parse()
                    .map_err(|e| format!("invalid miner address: {e}"))?;
            }
            "--difficulty" => {
                difficulty = value
                    .parse()
                    .map_err(|_| format!("invalid difficulty: {value}"))?;
            }
            "--bootstrap-ip" => bootstrap_ip = Some(value.clone()),
            "--bootstrap-port" => {
                bootstrap_port = value
                    .parse()
                    .map_err(|_| format!("invalid bootstrap port: {value}"))?;
            }
            "--bootstrap-account" => {
                bootstrap_account = value
                    .parse()
                    .map_err(|e| format!("invalid bootstrap account: {e}"))?;
            }
            other => return Err(format!("unexpected argument: {other}")),
        }
    }

    let bootstrap =
        bootstrap_ip.map(|ip| PeerNode::new(&ip, bootstrap_port, true, bootstrap_account));

    Ok(NodeConfig {
        datadir,
        ip,
        port,
        miner,
        bootstrap,
        mining_difficulty: difficulty,
    })
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    let config = match parse_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}\n");
            print_usage(&args[0]);
            process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    if let Err(e) = node::run(config, shutdown_rx).await {
        error!("{e}");
        process::exit(1);
    }
}
