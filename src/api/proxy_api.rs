//! Proxy API
//!
//! Entry points for embedding the interceptor: logging setup and starting or
//! stopping a proxy front-end bound to a host runtime.

use crate::config::InterceptorConfig;
use crate::host::{HostRuntime, HostStatus, RegisterOutcome};
use crate::interceptor::Interceptor;
use crate::network::{HttpNetwork, Network};
use crate::proxy::server;
use anyhow::{anyhow, Context};
use once_cell::sync::OnceCell;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::level_filters::LevelFilter;

const PORT_FALLBACK_TRIES: u16 = 20;

static LOG_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// Get the version of the interceptor core library
pub fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Initialize logging (call once at startup). With a `log_dir`, logs go to a
/// daily rolling file there; otherwise to stderr. Calling this again is a
/// no-op.
pub fn init_core(log_dir: Option<&Path>) -> anyhow::Result<()> {
    let level = resolve_log_level();

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).with_context(|| {
                format!("Failed to create log directory {}", dir.display())
            })?;
            let file_appender = tracing_appender::rolling::daily(dir, "interceptor_core");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            // If logging is already set elsewhere, don't treat it as fatal.
            if tracing_subscriber::fmt()
                .with_max_level(level)
                .with_ansi(false)
                .with_writer(non_blocking)
                .try_init()
                .is_ok()
            {
                // The guard flushes on drop; keep it for the life of the process.
                let _ = LOG_GUARD.set(guard);
            }
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_max_level(level)
                .with_writer(std::io::stderr)
                .try_init();
        }
    }

    tracing::info!("Interceptor core initialized v{}", get_version());
    Ok(())
}

fn resolve_log_level() -> LevelFilter {
    match std::env::var("RUST_LOG") {
        Ok(val) => parse_log_level(&val),
        Err(_) => LevelFilter::INFO,
    }
}

fn parse_log_level(val: &str) -> LevelFilter {
    match val.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}

/// A running proxy front-end
pub struct ProxyHandle {
    addr: SocketAddr,
    host: Arc<HostRuntime>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl ProxyHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn host(&self) -> &Arc<HostRuntime> {
        &self.host
    }

    pub fn status(&self) -> HostStatus {
        self.host.status()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop accepting connections and tear down the registered interceptor.
    pub async fn stop(mut self) -> anyhow::Result<()> {
        tracing::info!("Stopping proxy on {}", self.addr);
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let result = self
            .task
            .await
            .map_err(|e| anyhow!("proxy task failed: {e}"))?;
        self.host.unregister().await;
        result
    }
}

/// Start a proxy with the passthrough interceptor described by `config`,
/// forwarding over `reqwest`.
pub async fn start_proxy(config: InterceptorConfig) -> anyhow::Result<ProxyHandle> {
    config.validate()?;
    let network: Arc<dyn Network> = Arc::new(HttpNetwork::new(config.fetch_timeout())?);
    let interceptor = Interceptor::from_config(&config, network.clone());
    start_proxy_with(config, network, interceptor).await
}

/// Start a proxy and register `interceptor` with its host runtime.
pub async fn start_proxy_with(
    config: InterceptorConfig,
    network: Arc<dyn Network>,
    interceptor: Arc<Interceptor>,
) -> anyhow::Result<ProxyHandle> {
    let host = Arc::new(HostRuntime::new(network));
    let outcome = host
        .register(interceptor)
        .await
        .context("interceptor registration failed")?;
    if outcome == RegisterOutcome::Waiting {
        tracing::warn!("Interceptor registered but waiting; requests use host default");
    }

    let listener = bind_with_fallback(&config.bind_address, config.port).await?;
    let addr = listener.local_addr()?;
    if config.port != 0 && addr.port() != config.port {
        tracing::warn!("Port {} in use, falling back to {}", config.port, addr.port());
    }
    tracing::info!("Starting proxy on {}", addr);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let server_host = host.clone();
    let task = tokio::spawn(async move {
        let result = server::serve(listener, server_host, shutdown_rx).await;
        if let Err(e) = &result {
            tracing::error!("Proxy server error: {}", e);
        }
        result
    });

    Ok(ProxyHandle {
        addr,
        host,
        shutdown: Some(shutdown_tx),
        task,
    })
}

async fn bind_with_fallback(bind_address: &str, start_port: u16) -> anyhow::Result<TcpListener> {
    use std::io::ErrorKind;

    for offset in 0..PORT_FALLBACK_TRIES {
        let candidate = start_port.saturating_add(offset);
        match TcpListener::bind((bind_address, candidate)).await {
            Ok(listener) => return Ok(listener),
            Err(err) if err.kind() == ErrorKind::AddrInUse => continue,
            Err(err) => {
                return Err(anyhow!(
                    "Failed to bind to {}:{}: {}",
                    bind_address,
                    candidate,
                    err
                ))
            }
        }
    }

    Err(anyhow!(
        "No available port found in range {}-{}",
        start_port,
        start_port.saturating_add(PORT_FALLBACK_TRIES.saturating_sub(1))
    ))
}
