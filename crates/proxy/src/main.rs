mod adapter;
mod context;
mod service;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use pingora_core::server::Server;
use pingora_proxy::http_proxy_service;
use ratewarden_common::{AppConfig, Clock, StoreBackend, SystemClock};
use ratewarden_engine::RateLimitService;
use ratewarden_store::{AtomicCounter, MemoryCounter, TimeoutCounter};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use crate::service::RatewardenProxy;

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).json().init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/ratewarden.yaml".to_string());

    info!(config_path = %config_path, "starting ratewarden");

    let config = AppConfig::load(&config_path)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Keeps the redis connection driver alive for the life of the process.
    let (store, _store_runtime) = build_store(&config, clock.clone())?;
    let store: Arc<dyn AtomicCounter> = Arc::new(TimeoutCounter::new(
        store,
        Duration::from_millis(config.store.timeout_ms),
    ));

    let engine = Arc::new(RateLimitService::from_config(&config, store, clock)?);

    let mut server = Server::new(None)?;
    server.bootstrap();

    let proxy = RatewardenProxy::new(engine.clone(), &config.server)?;
    let mut proxy_service = http_proxy_service(&server.configuration, proxy);

    for listen_addr in &config.server.listen {
        info!(addr = %listen_addr, "adding listener");
        proxy_service.add_tcp(listen_addr);
    }

    server.add_service(proxy_service);

    server.add_service(pingora_core::services::background::background_service(
        "admin API",
        AdminBackgroundService {
            listen_addr: config.server.admin.listen.clone(),
            engine,
        },
    ));

    info!(upstream = %config.server.upstream, "ratewarden started");
    server.run_forever();
}

fn build_store(
    config: &AppConfig,
    clock: Arc<dyn Clock>,
) -> Result<(Arc<dyn AtomicCounter>, Option<tokio::runtime::Runtime>)> {
    match config.store.backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryCounter::new());
            store.start_cleanup_task(clock)?;
            info!("using in-process counter store");
            Ok((store, None))
        }
        StoreBackend::Redis => connect_redis(config),
    }
}

#[cfg(feature = "redis")]
fn connect_redis(
    config: &AppConfig,
) -> Result<(Arc<dyn AtomicCounter>, Option<tokio::runtime::Runtime>)> {
    let url = config
        .store
        .redis_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("store.redis_url is not set"))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("redis-driver")
        .enable_all()
        .build()?;
    let store = runtime.block_on(ratewarden_store::RedisCounter::connect(
        url,
        config.store.key_prefix.clone(),
    ))?;

    Ok((Arc::new(store), Some(runtime)))
}

#[cfg(not(feature = "redis"))]
fn connect_redis(
    _config: &AppConfig,
) -> Result<(Arc<dyn AtomicCounter>, Option<tokio::runtime::Runtime>)> {
    anyhow::bail!("store.backend is redis but ratewarden was built without the `redis` feature")
}

/// Runs the management API alongside pingora, sharing the engine.
struct AdminBackgroundService {
    listen_addr: String,
    engine: Arc<RateLimitService>,
}

#[async_trait::async_trait]
impl pingora_core::services::background::BackgroundService for AdminBackgroundService {
    async fn start(&self, mut shutdown: pingora_core::server::ShutdownWatch) {
        info!(addr = %self.listen_addr, "starting admin API");

        let state = ratewarden_admin::new_shared_state(self.engine.clone());

        tokio::select! {
            result = ratewarden_admin::run_admin_server(state, &self.listen_addr) => {
                if let Err(e) = result {
                    error!(error = %e, "admin API server error");
                }
            }
            _ = shutdown.changed() => {
                info!("admin API shutting down");
            }
        }
    }
}
