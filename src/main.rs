use std::error::Error;
use std::sync::Arc;

use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::lib::backend::lxd::LxdClient;
use crate::lib::backend::types::ContainerBackend;
use crate::lib::config::Config;
use crate::lib::executor::executor::Executor;
use crate::lib::server::api::{ApiServer, AppState};
use crate::lib::server::cache::ImageCache;
use crate::lib::tasks::registry::TaskRegistry;

mod lib {
    pub mod backend;
    pub mod config;
    pub mod executor;
    pub mod server;
    pub mod tasks;
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    info!(addr = %config.bind_addr, workers = config.max_workers, "starting lxdash backend");

    let backend: Arc<dyn ContainerBackend> = Arc::new(LxdClient::new(&config));
    let registry = Arc::new(TaskRegistry::new(config.max_live_tasks));
    let executor = Arc::new(Executor::new(Arc::clone(&registry), config.max_workers));

    // reaper: terminal tasks expire after the retention window
    {
        let registry = Arc::clone(&registry);
        let retention = config.task_retention;
        let sweep_interval = config.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            loop {
                interval.tick().await;
                let removed = registry.sweep(retention);
                if removed > 0 {
                    debug!(removed, "swept expired tasks");
                }
            }
        });
    }

    let state = Arc::new(AppState {
        images: ImageCache::new(config.image_cache_ttl),
        backend,
        registry,
        executor,
        config,
    });

    ApiServer::new(state).start_server().await?;
    Ok(())
}
