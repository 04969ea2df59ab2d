//! # Relay Gateway - Main Entry Point
//!
//! Loads configuration, wires the admission gate together and serves the
//! admin/admission HTTP API until SIGINT or SIGTERM.
//!
//! Startup order:
//! 1. configuration (`GATEWAY_CONFIG_PATH`, default `config/gateway.yaml`)
//! 2. logging, then the optional Prometheus exporter
//! 3. optional Redis connection
//! 4. rate limiter, health monitor, credential router
//! 5. background tasks and the HTTP server, all sharing one cancellation token

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use relay_gateway::cache::{RedisCache, SharedCache};
use relay_gateway::core::config::{GatewayConfig, HealthSettings};
use relay_gateway::credential::{
    CredentialCache, CredentialRouter, GroupCatalog, MemoryCredentialStore,
};
use relay_gateway::gateway::{build_router, serve, AppState};
use relay_gateway::health::{
    FileConfigSource, HealthConfigSource, HealthConfigStore, HealthMonitor, StaticConfigSource,
};
use relay_gateway::observability::{init_logging, install_prometheus_exporter};
use relay_gateway::ratelimit::{ChannelRateLimiter, LocalBackend, RateLimitBackend, SharedBackend};
use relay_gateway::{AdmissionGate, GatewayError, GatewayResult};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> GatewayResult<()> {
    let config_path = std::env::var("GATEWAY_CONFIG_PATH")
        .unwrap_or_else(|_| "config/gateway.yaml".to_string());
    let config = GatewayConfig::load_from_file(&config_path).await?;

    init_logging(&config.logging);
    info!("🚀 Starting relay gateway");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(path = %config_path, "📋 Configuration loaded");

    if let Some(port) = config.observability.metrics_port {
        let addr = socket_addr(&config.server.bind_address, port)?;
        install_prometheus_exporter(addr)?;
        info!(%addr, "📊 Prometheus exporter listening");
    }

    let cancel = CancellationToken::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let shared_cache: Option<Arc<dyn SharedCache>> = match &config.redis {
        Some(redis) => {
            let cache = RedisCache::connect(redis.clone()).await.map_err(|e| {
                error!("Failed to connect to redis at {}: {}", redis.url, e);
                e
            })?;
            info!("🔗 Connected to redis");
            Some(Arc::new(cache))
        }
        None => {
            info!("No redis configured, admission state is local to this instance");
            None
        }
    };

    let limiter = build_rate_limiter(&config, shared_cache.clone(), &cancel, &mut tasks)?;
    info!(
        backend = limiter.backend_name(),
        window = %humantime::format_duration(limiter.window()),
        "Channel rate limiter ready"
    );

    let health = build_health_monitor(&config.health, &cancel, &mut tasks).await;

    let mut router = CredentialRouter::new(Arc::new(MemoryCredentialStore::new()));
    if let Some(cache) = shared_cache {
        let credential_cache = CredentialCache::new(
            cache,
            &config.credential.hmac_secret,
            config.credential.cache_ttl,
        )?;
        router = router.with_cache(Arc::new(credential_cache));
    }

    let catalog = Arc::new(GroupCatalog::default());
    if let Some(raw) = &config.credential.usable_groups {
        catalog.reload_from_str(raw)?;
    }

    let gate = AdmissionGate::new(limiter, health, router);
    let app = build_router(AppState::new(gate).with_catalog(catalog));
    let admin_addr = socket_addr(&config.server.bind_address, config.server.admin_port)?;

    let server_cancel = cancel.clone();
    let mut server = tokio::spawn(async move { serve(admin_addr, app, server_cancel).await });
    info!(%admin_addr, "🌐 Relay gateway ready");

    let server_running = tokio::select! {
        _ = shutdown_signal() => {
            info!("🛑 Shutdown signal received, beginning graceful shutdown...");
            true
        }
        result = &mut server => {
            match result {
                Ok(Ok(())) => warn!("Admin server stopped unexpectedly"),
                Ok(Err(e)) => error!("🚨 Admin server failed: {}", e),
                Err(e) => error!("🚨 Admin server task panicked: {}", e),
            }
            false
        }
    };

    cancel.cancel();
    if server_running {
        tasks.push(tokio::spawn(async move {
            if let Ok(Err(e)) = server.await {
                error!("Admin server error during shutdown: {}", e);
            }
        }));
    }

    if tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(tasks))
        .await
        .is_err()
    {
        warn!("⚠️  Background tasks did not stop within {:?}", SHUTDOWN_GRACE);
    }

    info!("✅ Relay gateway shutdown complete");
    Ok(())
}

fn socket_addr(host: &str, port: u16) -> GatewayResult<SocketAddr> {
    format!("{}:{}", host, port)
        .parse()
        .map_err(|e| GatewayError::config(format!("Invalid bind address {}:{}: {}", host, port, e)))
}

fn build_rate_limiter(
    config: &GatewayConfig,
    shared_cache: Option<Arc<dyn SharedCache>>,
    cancel: &CancellationToken,
    tasks: &mut Vec<JoinHandle<()>>,
) -> GatewayResult<ChannelRateLimiter> {
    let backend: Arc<dyn RateLimitBackend> = match shared_cache {
        Some(cache) if config.use_shared_rate_limit() => Arc::new(SharedBackend::new(cache)),
        None if config.use_shared_rate_limit() => {
            return Err(GatewayError::config(
                "shared rate limiting requested without a redis connection",
            ))
        }
        _ => {
            let local = Arc::new(LocalBackend::new());
            tasks.push(local.spawn_cleanup(config.rate_limit.cleanup_interval, cancel.clone()));
            local
        }
    };
    Ok(ChannelRateLimiter::new(backend, config.rate_limit.window))
}

async fn build_health_monitor(
    settings: &HealthSettings,
    cancel: &CancellationToken,
    tasks: &mut Vec<JoinHandle<()>>,
) -> Arc<HealthMonitor> {
    let source: Arc<dyn HealthConfigSource> = match (&settings.config_path, &settings.inline) {
        (Some(path), _) => Arc::new(FileConfigSource::new(path.clone())),
        (None, Some(raw)) => Arc::new(StaticConfigSource::new(raw.clone())),
        (None, None) => Arc::new(StaticConfigSource::new(String::new())),
    };

    let monitor = Arc::new(
        HealthMonitor::new(Arc::new(HealthConfigStore::new()))
            .with_inactive_after(settings.inactive_after),
    );
    if !monitor.reload_config(source.as_ref()).await {
        warn!(source = %source.describe(), "Starting with no channel health thresholds");
    }

    tasks.extend(monitor.spawn_background_tasks(source, settings, cancel.clone()));
    info!("🏥 Channel health monitor started");
    monitor
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("📡 Received SIGINT (Ctrl+C)"),
        _ = terminate => info!("📡 Received SIGTERM"),
    }
}
