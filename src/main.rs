//! Entry point: loads configuration, wires up a [`Context`], and serves
//! connections until shutdown (spec.md §9). Grounded on the teacher's
//! `main.rs`: parse a handful of flags, init logging, load config, run.

use std::env;

use acng_core::config::AcngConfig;
use acng_core::context::Context;
use anyhow::Result;
use tracing::error;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    if args.iter().any(|a| a == "--version") {
        println!("acng-core version {VERSION}");
        return Ok(());
    }

    let log_level = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(log_level).compact().init();

    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("/etc/acng-core/acng.toml");

    let config = match AcngConfig::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load configuration from {config_path}: {e}");
            std::process::exit(1);
        }
    };

    let bind_addr = args
        .iter()
        .position(|a| a == "--bind")
        .and_then(|i| args.get(i + 1))
        .cloned()
        .unwrap_or_else(|| "0.0.0.0:3142".to_string());

    let own_host_port = bind_addr.clone();
    let ctx = Context::new(config, own_host_port);

    if let Err(e) = acng_core::server::serve(ctx, &bind_addr).await {
        error!(error = %e, "server exited with an error");
        return Err(e.into());
    }

    Ok(())
}
