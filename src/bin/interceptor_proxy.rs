//! Standalone interceptor proxy binary.
//!
//! Registers a passthrough interceptor with a fresh host runtime and serves it
//! over HTTP until interrupted.
//!
//! Usage:
//! ```
//! cargo run --bin interceptor_proxy -- --port 9191 --timeout-ms 30000
//! ```

use std::path::PathBuf;

use interceptor_core::api::proxy_api::{init_core, start_proxy};
use interceptor_core::InterceptorConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = parse_args()?;
    init_core(config.log_dir.as_deref())?;

    tracing::info!(
        "Starting interceptor proxy (version={}, skip_waiting={}, claim_clients={})",
        config.version,
        config.skip_waiting,
        config.claim_clients
    );

    let handle = start_proxy(config).await?;
    tracing::info!("Listening on {}", handle.local_addr());

    tokio::signal::ctrl_c().await?;
    handle.stop().await?;

    Ok(())
}

fn parse_args() -> anyhow::Result<InterceptorConfig> {
    let mut args = std::env::args().skip(1);
    let mut config = InterceptorConfig::default();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                if let Some(path) = args.next() {
                    let raw = std::fs::read_to_string(&path)?;
                    config = InterceptorConfig::from_json_str(&raw)?;
                }
            }
            "--bind" => {
                if let Some(addr) = args.next() {
                    config.bind_address = addr;
                }
            }
            "--port" => {
                if let Some(port) = args.next() {
                    config.port = port.parse()?;
                }
            }
            "--version-label" => {
                if let Some(version) = args.next() {
                    config.version = version;
                }
            }
            "--timeout-ms" => {
                if let Some(ms) = args.next() {
                    config.fetch_timeout_ms = Some(ms.parse()?);
                }
            }
            "--log-dir" => {
                if let Some(path) = args.next() {
                    config.log_dir = Some(PathBuf::from(path));
                }
            }
            "--no-skip-waiting" => {
                config.skip_waiting = false;
            }
            "--no-claim" => {
                config.claim_clients = false;
            }
            "--help" | "-h" => {
                eprintln!("Interceptor Proxy");
                eprintln!();
                eprintln!("Usage: interceptor_proxy [OPTIONS]");
                eprintln!();
                eprintln!("Options:");
                eprintln!("  --config <PATH>          JSON configuration file");
                eprintln!("  --bind <ADDR>            Bind address (default: 127.0.0.1)");
                eprintln!("  --port <PORT>            Listen port (default: 9191)");
                eprintln!("  --version-label <LABEL>  Interceptor version label (default: v1)");
                eprintln!("  --timeout-ms <MS>        Per-request network timeout (default: none)");
                eprintln!("  --log-dir <PATH>         Write rolling logs to this directory");
                eprintln!("  --no-skip-waiting        Wait for active clients to close");
                eprintln!("  --no-claim               Leave already-open clients uncontrolled");
                eprintln!("  --help, -h               Show this help");
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {arg}");
            }
        }
    }

    config.validate()?;
    Ok(config)
}
