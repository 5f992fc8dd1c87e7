//! Demo: an echo server and a client that pings it.
//!
//! Usage:
//!   pingpong --mode server --config server.json
//!   pingpong --mode client --config client.json [--count 5]

use clap::Parser;
use std::process::exit;
use std::time::Duration;
use sudp::config::{ClientConfig, ServerConfig};
use sudp::ClientOpts;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "pingpong", version, about = "SUDP echo demo")]
struct Args {
    /// Run as "server" or "client"
    #[arg(long, default_value = "client")]
    mode: String,

    /// Configuration file
    #[arg(long)]
    config: String,

    /// Pings to send in client mode
    #[arg(long, default_value_t = 5)]
    count: u32,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sudp=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    match args.mode.as_str() {
        "server" => run_server(&args).await,
        "client" => run_client(&args).await,
        other => {
            error!("invalid mode {other}, use server or client");
            exit(1);
        }
    }
}

async fn run_server(args: &Args) {
    let config = match ServerConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            error!("loading {}: {e}", args.config);
            exit(1);
        }
    };
    let (local, peers) = match (config.local_address(), config.peer_addresses()) {
        (Ok(l), Ok(p)) => (l, p),
        (Err(e), _) | (_, Err(e)) => {
            error!("parsing configuration: {e}");
            exit(1);
        }
    };

    let server = match sudp::listen(&local, &peers).await {
        Ok(s) => s,
        Err(e) => {
            error!("listen: {e}");
            exit(1);
        }
    };
    info!("echo server up as {local}");

    loop {
        match server.recv_from().await {
            Ok((payload, src)) => {
                info!("{} bytes from {}", payload.len(), src);
                if let Err(e) = server.send_to(&payload, src).await {
                    error!("echo to {src}: {e}");
                }
            }
            Err(e) => {
                error!("receive: {e}");
                break;
            }
        }
    }
    let _ = server.close().await;
}

async fn run_client(args: &Args) {
    let config = match ClientConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            error!("loading {}: {e}", args.config);
            exit(1);
        }
    };
    let (local, remote) = match (config.local_address(), config.server_address()) {
        (Ok(l), Ok(r)) => (l, r),
        (Err(e), _) | (_, Err(e)) => {
            error!("parsing configuration: {e}");
            exit(1);
        }
    };

    let client = match sudp::connect(&local, &remote, ClientOpts::default()).await {
        Ok(c) => c,
        Err(e) => {
            error!("connect: {e}");
            exit(1);
        }
    };
    info!("connected to {}", client.remote_address());

    for i in 0..args.count {
        let ping = format!("ping {i}");
        if let Err(e) = client.send(ping.as_bytes()).await {
            error!("send: {e}");
            break;
        }
        match client.recv().await {
            Ok(pong) => info!("echo: {}", String::from_utf8_lossy(&pong)),
            Err(e) => {
                error!("receive: {e}");
                break;
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    if let Err(e) = client.close().await {
        error!("close: {e}");
        exit(1);
    }
}
