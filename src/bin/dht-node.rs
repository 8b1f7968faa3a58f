//! Standalone DHT node for manual testing and small local networks.
//!
//! Usage:
//!   dht-node --port 4000 [--host 127.0.0.1] [--bootstrap 127.0.0.1:4001,...]
//!            [--k 20] [--alpha 3] [--node-id <40-hex-chars>]
//!
//! Once listening, reads commands from stdin:
//!   get <key>
//!   set <key> <value...>
//!   id
//!   quit

use kademlia_dht::{DhtConfig, DhtServer, NodeId};
use std::net::{IpAddr, SocketAddr};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

struct Args {
    host: IpAddr,
    port: u16,
    bootstrap: Vec<SocketAddr>,
    k: usize,
    alpha: usize,
    node_id: Option<NodeId>,
}

fn parse_args() -> Args {
    let mut host: IpAddr = [127, 0, 0, 1].into();
    let mut port: u16 = 0;
    let mut bootstrap = Vec::new();
    let mut k = DhtConfig::default().k;
    let mut alpha = DhtConfig::default().alpha;
    let mut node_id = None;

    let mut raw = std::env::args().skip(1);
    while let Some(flag) = raw.next() {
        let Some(value) = raw.next() else {
            eprintln!("missing value for {flag}");
            std::process::exit(2);
        };
        match flag.as_str() {
            "--host" => host = value.parse().unwrap_or_else(|_| {
                eprintln!("invalid --host {value:?}");
                std::process::exit(2);
            }),
            "--port" => port = value.parse().unwrap_or_else(|_| {
                eprintln!("invalid --port {value:?}");
                std::process::exit(2);
            }),
            "--bootstrap" => {
                for entry in value.split(',').filter(|s| !s.is_empty()) {
                    match entry.parse() {
                        Ok(addr) => bootstrap.push(addr),
                        Err(_) => {
                            eprintln!("invalid --bootstrap entry {entry:?}");
                            std::process::exit(2);
                        }
                    }
                }
            }
            "--k" => k = value.parse().unwrap_or(k),
            "--alpha" => alpha = value.parse().unwrap_or(alpha),
            "--node-id" => {
                node_id = Some(NodeId::from_hex(&value).unwrap_or_else(|| {
                    eprintln!("invalid --node-id {value:?}, expected 40 hex characters");
                    std::process::exit(2);
                }));
            }
            other => {
                eprintln!("unknown flag {other}");
                std::process::exit(2);
            }
        }
    }

    Args { host, port, bootstrap, k, alpha, node_id }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = parse_args();
    let config = DhtConfig { k: args.k, alpha: args.alpha, ..DhtConfig::default() };
    let server = DhtServer::new(config, args.node_id, None);

    let bound_addr = match server.listen(SocketAddr::new(args.host, args.port)).await {
        Ok(addr) => addr,
        Err(e) => {
            error!("failed to listen: {e}");
            std::process::exit(1);
        }
    };
    info!("dht-node {} listening on {bound_addr}", server.local_id());

    if !args.bootstrap.is_empty() {
        match server.bootstrap(args.bootstrap.clone()).await {
            Ok(live) => info!("bootstrap reached {} of {} peers", live.len(), args.bootstrap.len()),
            Err(e) => error!("bootstrap failed: {e}"),
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("stdin read error: {e}");
                break;
            }
        };
        let mut parts = line.trim().splitn(3, ' ');
        match parts.next() {
            Some("get") => {
                let Some(key) = parts.next() else {
                    println!("usage: get <key>");
                    continue;
                };
                match server.get(key).await {
                    Ok(Some(value)) => println!("{}", String::from_utf8_lossy(&value)),
                    Ok(None) => println!("(absent)"),
                    Err(e) => println!("error: {e}"),
                }
            }
            Some("set") => {
                let Some(key) = parts.next() else {
                    println!("usage: set <key> <value>");
                    continue;
                };
                let value = parts.next().unwrap_or("").as_bytes().to_vec();
                match server.set(key, value).await {
                    Ok(true) => println!("ok"),
                    Ok(false) => println!("failed (no neighbors stored it)"),
                    Err(e) => println!("error: {e}"),
                }
            }
            Some("id") => println!("{}", server.local_id()),
            Some("quit") | Some("exit") => break,
            Some("") | None => {}
            Some(other) => println!("unknown command {other:?}; expected get/set/id/quit"),
        }
    }

    server.stop().await;
}
