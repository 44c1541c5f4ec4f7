// src/main.rs
use std::env;
use std::process;

use etude::Server;
use tracing::error;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = env::args();
    let prog = args.next().unwrap_or_else(|| "etude".to_string());
    let Some(port) = args.next().and_then(|p| p.parse::<u16>().ok()) else {
        eprintln!("usage: {} <port> [document-root]", prog);
        process::exit(1);
    };
    let root = args.next().unwrap_or_else(|| "./resource".to_string());

    let server = Server::bind(port).document_root(root);
    if let Err(e) = server.serve() {
        error!(error = %e, "server failed");
        process::exit(1);
    }
}
