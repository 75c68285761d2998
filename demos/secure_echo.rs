//! Secure Echo Example - TLS with trust-on-first-use
//!
//! A server and a client each generate a throwaway self-signed certificate.
//! They connect, record each other's fingerprint on first use, and the server
//! echoes back what the client sends.
//!
//! ## Architecture
//!
//! - The server runs on its own thread
//! - The client uses the main thread and waits for the echo
//!
//! # Usage
//!
//! ```bash
//! cargo run --example secure_echo -- -vv
//! cargo run --example secure_echo -- --config kvmlink.toml
//! ```

use clap::Parser;
use config::Config;
use kvmlink::prelude::*;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::str::from_utf8;
use std::thread;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Tracing Initialization
// ============================================================================

/// Initialize tracing for the kvmlink crate based on verbosity level
fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => return, // No tracing
        1 => "info",
        2 => "debug",
        _ => "trace", // 3 or more
    };

    let filter = format!("kvmlink={}", level);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

// ============================================================================
// CLI Argument Parsing
// ============================================================================

#[derive(Parser)]
#[command(author, version, about = "Secure echo over kvmlink", long_about = None)]
struct Args {
    /// Increase logging verbosity (-v: info, -vv: debug, -vvv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file path (TOML format), layered over the demo defaults
    #[arg(long)]
    config: Option<String>,
}

/// Server echoes back every byte sequence it receives
fn run_server(config: &Config) -> SocketAddr {
    let mut transport = Transport::new_named(config, "server").expect("Failed to create transport");
    let (listener_id, listener_addr) = transport
        .listen(&"127.0.0.1:0".parse().expect("Invalid address"))
        .expect("Failed to listen");
    println!(
        "Server fingerprint: {}",
        transport.local_fingerprint().expect("TLS not enabled")
    );

    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            for event in transport.fetch_events(None) {
                match event {
                    TransportEvent::Incoming { id } if id == listener_id => {
                        transport.accept(listener_id).expect("Failed to accept");
                    }
                    TransportEvent::SecureConnected { id, fingerprint } => {
                        println!("[Server] Client {} trusted as {}", id, fingerprint);
                    }
                    TransportEvent::InputReady { id } => {
                        let Some(socket) = transport.socket(id).cloned() else {
                            continue;
                        };
                        // Echo back the data
                        while let Ok(n) = socket.read(&mut buf) {
                            if n == 0 {
                                break;
                            }
                            socket.write(&buf[..n]).expect("Failed to echo");
                        }
                    }
                    TransportEvent::Disconnected { id } | TransportEvent::Failed { id, .. } => {
                        transport.close(id);
                    }
                    _ => {}
                }
            }
        }
    });

    listener_addr
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    // Both sides generate an ephemeral certificate and keep trust in memory
    // unless the configuration file says otherwise
    let mut builder = Config::builder()
        .set_default("tls_enabled", true)
        .expect("Invalid config");
    if let Some(config_path) = &args.config {
        builder = builder.add_source(config::File::with_name(config_path));
    }
    let config = match builder.build() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let server_addr = run_server(&config);
    println!("Server started on {}\n", server_addr);

    let mut transport = Transport::new_named(&config, "client").expect("Failed to create transport");
    let socket = transport
        .connect(&NetworkAddress::from(server_addr))
        .expect("Failed to connect to server");

    let data = b"Hello, secure kvmlink!";
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        for event in transport.fetch_events(None) {
            match event {
                TransportEvent::SecureConnected { fingerprint, .. } => {
                    println!("[Client] Server trusted as {}", fingerprint);
                    println!("Sending: {:?}", from_utf8(data).expect("Invalid UTF-8"));
                    socket.write(data).expect("Failed to send");
                }
                TransportEvent::InputReady { .. } => {
                    let n = socket.read(&mut buf).expect("Failed to read");
                    received.extend_from_slice(&buf[..n]);
                    if received.len() >= data.len() {
                        println!("Received: {:?}", from_utf8(&received).expect("Invalid UTF-8"));
                        return ExitCode::SUCCESS;
                    }
                }
                TransportEvent::Failed { reason, .. } => {
                    eprintln!("Connection failed: {}", reason);
                    return ExitCode::FAILURE;
                }
                _ => {}
            }
        }
    }
}
