//! Application state shared by the daemon services.

use std::sync::Arc;

use anyhow::Result;
use futures::future::join_all;
use log::{error, info, warn};
use tokio::{sync::RwLockReadGuard, task};

use crate::{
    config::{Config, ConfigManager},
    device::RgbDevice,
    drivers,
    event::EventBus,
    id_registry::IdRegistry,
    provider::DeviceProvider,
};

/// Shared application state: configuration, name registry and providers.
///
/// Providers are built from the configuration but stay uninitialized until
/// [`AppState::initialize_providers`] runs.
pub struct AppState {
    pub config_manager: Arc<ConfigManager>,
    pub registry: Arc<IdRegistry>,
    pub providers: Vec<Arc<DeviceProvider>>,
}

impl AppState {
    pub async fn new(config_manager: ConfigManager, event_bus: EventBus) -> Result<Self> {
        let config = config_manager.clone_config().await;
        let registry = Arc::new(IdRegistry::new());

        let providers = config
            .providers
            .iter()
            .map(|cfg| {
                info!("Configured provider '{}' ({})", cfg.name, cfg.kind.label());
                Arc::new(drivers::build_provider(
                    cfg,
                    config.update_rate_hard_limit_ms,
                    Arc::clone(&registry),
                    event_bus.clone(),
                ))
            })
            .collect();

        Ok(Self {
            config_manager: Arc::new(config_manager),
            registry,
            providers,
        })
    }

    pub async fn config(&self) -> RwLockReadGuard<'_, Config> {
        self.config_manager.get().await
    }

    pub fn config_manager(&self) -> &Arc<ConfigManager> {
        &self.config_manager
    }

    pub fn providers(&self) -> &[Arc<DeviceProvider>] {
        &self.providers
    }

    /// Looks a device up by name, optionally within one provider only.
    pub fn find_device(&self, name: &str, provider: Option<&str>) -> Option<Arc<RgbDevice>> {
        self.providers
            .iter()
            .filter(|p| provider.is_none_or(|wanted| p.name() == wanted))
            .find_map(|p| p.device(name))
    }

    /// Initializes every provider on the blocking pool.
    ///
    /// A provider that fails has already published its critical exception;
    /// it is left reset and the others keep going. Returns how many came up.
    pub async fn initialize_providers(&self) -> usize {
        let jobs = self.providers.iter().map(|provider| {
            let provider = Arc::clone(provider);
            task::spawn_blocking(move || {
                let result = provider.initialize();
                (provider.name().to_string(), result)
            })
        });

        let mut ready = 0;
        for joined in join_all(jobs).await {
            match joined {
                Ok((_, Ok(()))) => ready += 1,
                Ok((name, Err(e))) => warn!("Provider '{name}' is unavailable: {e:#}"),
                Err(e) => error!("Provider initialization task failed: {e}"),
            }
        }
        info!("{ready} of {} provider(s) initialized", self.providers.len());
        ready
    }

    /// Resets every provider, stopping all triggers and hardware links.
    pub async fn reset_providers(&self) {
        let jobs = self.providers.iter().map(|provider| {
            let provider = Arc::clone(provider);
            task::spawn_blocking(move || provider.reset())
        });

        for joined in join_all(jobs).await {
            if let Err(e) = joined {
                error!("Provider reset task failed: {e}");
            }
        }
    }
}
