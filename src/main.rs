use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

use pylon::bootstrap::Bootstrap;
use pylon::cache::Cache;
use pylon::config::Config;
use pylon::inbound::doh::{DohInbound, DohTlsInbound};
use pylon::inbound::stcp::StcpInbound;
use pylon::inbound::tcp::{TcpInbound, TlsInbound};
use pylon::inbound::udp::UdpInbound;
use pylon::outbound::OutboundRegistry;
use pylon::pipeline::Pipeline;
use pylon::rewrite::Rewriter;
use pylon::router::Router;
use pylon::shutdown::GracefulShutdown;

#[derive(Parser, Debug)]
#[command(author, version, about = "Recursive DNS proxy", long_about = None)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load config from {}: {e}", args.config.display());
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> pylon::error::Result<()> {
    let bootstrap = Bootstrap::new();
    bootstrap.set_seeds(&config.bootstrap_dns)?;

    let registry = OutboundRegistry::new(bootstrap);
    for (tag, url) in &config.outbound {
        registry.add(tag, url).await?;
    }

    let router = Arc::new(Router::new(
        &config.route.rules,
        config.route.default.as_deref(),
        config.route.block_aaaa,
        registry.clone(),
    )?);

    let rewriter = Arc::new(Rewriter::new(
        &config.rewrite.rules,
        config.rewrite.min_ttl,
        config.rewrite.max_ttl,
    ));

    let cache = Cache::new(&config.cache);
    let pipeline = Pipeline::new(router, rewriter, cache.clone());
    cache.set_query(pipeline.clone());
    cache.start();

    let shutdown = GracefulShutdown::new();
    let mut handles = Vec::new();

    if config.inbound.udp.enabled {
        let addr: SocketAddr = config.inbound.udp.address.parse().map_err(|e| {
            pylon::error::AppError::config(format!("invalid inbound.udp.address: {e}"))
        })?;
        handles.push(
            UdpInbound::new(addr)
                .start(pipeline.clone(), &shutdown)
                .await?,
        );
    }
    if config.inbound.tcp.enabled {
        let addr: SocketAddr = config.inbound.tcp.address.parse().map_err(|e| {
            pylon::error::AppError::config(format!("invalid inbound.tcp.address: {e}"))
        })?;
        handles.push(
            TcpInbound::new(addr)
                .start(pipeline.clone(), &shutdown)
                .await?,
        );
    }
    if config.inbound.tls.enabled {
        let addr: SocketAddr = config.inbound.tls.address.parse().map_err(|e| {
            pylon::error::AppError::config(format!("invalid inbound.tls.address: {e}"))
        })?;
        handles.push(
            TlsInbound::new(addr, config.inbound.tls.cert.clone(), config.inbound.tls.key.clone())
                .start(pipeline.clone(), &shutdown)
                .await?,
        );
    }
    if config.inbound.stcp.enabled {
        let addr: SocketAddr = config.inbound.stcp.address.parse().map_err(|e| {
            pylon::error::AppError::config(format!("invalid inbound.stcp.address: {e}"))
        })?;
        handles.push(
            StcpInbound::new(addr, &config.inbound.stcp.key)?
                .start(pipeline.clone(), &shutdown)
                .await?,
        );
    }
    if config.inbound.http.enabled {
        let addr: SocketAddr = config.inbound.http.address.parse().map_err(|e| {
            pylon::error::AppError::config(format!("invalid inbound.http.address: {e}"))
        })?;
        handles.push(
            DohInbound::new(addr)
                .start(pipeline.clone(), &shutdown)
                .await?,
        );
    }
    if config.inbound.https.enabled {
        let addr: SocketAddr = config.inbound.https.address.parse().map_err(|e| {
            pylon::error::AppError::config(format!("invalid inbound.https.address: {e}"))
        })?;
        handles.push(
            DohTlsInbound::new(
                addr,
                config.inbound.https.cert.clone(),
                config.inbound.https.key.clone(),
            )
            .start(pipeline.clone(), &shutdown)
            .await?,
        );
    }

    // Registration order is shutdown order: inbounds drain their accept
    // loops first, then the cache drains its refresh workers, then
    // outbounds close their long-lived connections.
    let inbound_handles = Arc::new(parking_lot::Mutex::new(Some(handles)));
    shutdown
        .register_component("inbounds", move || {
            let inbound_handles = inbound_handles.clone();
            async move {
                let handles = inbound_handles.lock().take().unwrap_or_default();
                for handle in handles {
                    if let Err(e) = handle.await {
                        tracing::warn!(error = %e, "inbound task panicked during shutdown");
                    }
                }
                Ok(())
            }
        })
        .await;

    let cache_for_shutdown = cache.clone();
    shutdown
        .register_component("cache", move || {
            let cache = cache_for_shutdown.clone();
            async move {
                cache.close().await;
                Ok(())
            }
        })
        .await;

    let registry_for_shutdown = registry.clone();
    shutdown
        .register_component("outbounds", move || {
            let registry = registry_for_shutdown.clone();
            async move {
                registry.close_all().await;
                Ok(())
            }
        })
        .await;

    wait_for_termination().await;
    shutdown.shutdown().await;

    Ok(())
}

/// Waits for SIGINT, SIGTERM, or SIGQUIT, whichever comes first.
async fn wait_for_termination() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to install sigterm handler");
            return;
        }
    };
    let mut sigquit = match signal(SignalKind::quit()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to install sigquit handler");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("received sigint"),
        _ = sigterm.recv() => tracing::info!("received sigterm"),
        _ = sigquit.recv() => tracing::info!("received sigquit"),
    }
}
