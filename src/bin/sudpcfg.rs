//! Configuration minting tool.
//!
//! `--new` creates a server keypair and configuration file; `--add` mints a
//! client: a fresh keypair, a random shared HMAC key, a peer entry in the
//! server configuration, and the matching client configuration file.
//!
//! Usage:
//!   sudpcfg --new --public 203.0.113.7 [--port 7000] [--server server.json]
//!   sudpcfg --add --client client.json [--server server.json]

use clap::Parser;
use rand::RngCore;
use std::path::Path;
use std::process::exit;
use sudp::config::{
    ClientConfig, ClientSection, PeerSection, RemoteSection, ServerConfig, ServerSection,
};

#[derive(Parser)]
#[command(name = "sudpcfg", version, about = "SUDP configuration generator")]
struct Args {
    /// Create a new server configuration
    #[arg(long)]
    new: bool,

    /// Add a new client to the server configuration
    #[arg(long)]
    add: bool,

    /// Server configuration file
    #[arg(long, default_value = "server.json")]
    server: String,

    /// Client configuration file to write (with --add)
    #[arg(long)]
    client: Option<String>,

    /// Public IP address of the server (with --new)
    #[arg(long)]
    public: Option<String>,

    /// Server UDP port
    #[arg(long, default_value_t = 7000)]
    port: u16,
}

fn stem(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "server".into())
}

fn main() {
    let args = Args::parse();

    if !args.new && !args.add {
        eprintln!("error: nothing to do, pass --new and/or --add");
        exit(1);
    }
    if !args.server.ends_with(".json") {
        eprintln!("error: server file name must end with .json");
        exit(1);
    }
    if let Some(ref client) = args.client {
        if !client.ends_with(".json") {
            eprintln!("error: client file name must end with .json");
            exit(1);
        }
    }

    let mut config = if args.new {
        let Some(public) = args.public.clone() else {
            eprintln!("error: --public is mandatory with --new");
            exit(1);
        };
        let base = stem(&args.server);
        let private_pem = format!("{base}_private.pem");
        let public_pem = format!("{base}_public.pem");
        if let Err(e) = sudp::write_pem_keypair(&private_pem, &public_pem) {
            eprintln!("error: generating server keypair: {e}");
            exit(1);
        }
        println!("server keypair written: {private_pem}, {public_pem}");

        ServerConfig {
            server: ServerSection {
                virtual_address: 0,
                listen: "0.0.0.0".into(),
                port: args.port,
                private_key: private_pem,
                public_address: Some(public),
            },
            peers: Vec::new(),
        }
    } else {
        match ServerConfig::load(&args.server) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("error: loading {}: {e}", args.server);
                exit(1);
            }
        }
    };

    if args.add {
        let Some(client_file) = args.client else {
            eprintln!("error: --client <file.json> is mandatory with --add");
            exit(1);
        };
        let Some(public_address) = config.server.public_address.clone() else {
            eprintln!("error: server configuration has no public_address");
            exit(1);
        };

        let vaddr = config.next_virtual_address();
        let private_pem = format!("client_{vaddr}_private.pem");
        let public_pem = format!("client_{vaddr}_public.pem");
        if let Err(e) = sudp::write_pem_keypair(&private_pem, &public_pem) {
            eprintln!("error: generating client keypair: {e}");
            exit(1);
        }

        let mut hmac = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut hmac);
        let hmac_key = hex::encode(hmac);

        config.peers.push(PeerSection {
            virtual_address: vaddr,
            shared_hmac_key: hmac_key.clone(),
            public_key: public_pem,
            address: None,
        });

        let server_public_pem = format!("{}_public.pem", stem(&args.server));
        let client_config = ClientConfig {
            client: ClientSection {
                virtual_address: vaddr,
                private_key: private_pem,
            },
            server: RemoteSection {
                virtual_address: config.server.virtual_address,
                address: format!("{public_address}:{}", config.server.port),
                public_key: server_public_pem,
                shared_hmac_key: hmac_key,
            },
        };
        if let Err(e) = client_config.save(&client_file) {
            eprintln!("error: writing {client_file}: {e}");
            exit(1);
        }
        println!("client config created: {client_file} (virtual address {vaddr})");
    }

    if let Err(e) = config.save(&args.server) {
        eprintln!("error: writing {}: {e}", args.server);
        exit(1);
    }
    if args.new {
        println!("server config created: {}", args.server);
    } else {
        println!("server config updated: {}", args.server);
    }
}
