//! Application entry point and builder.

use anyhow::{Result, anyhow};

use crate::{config::ConfigManager, coordinator::SystemCoordinator, event::EventBus};

/// The daemon: initialize, start services, run until shutdown.
///
/// # Example
///
/// ```no_run
/// use rgbd::{application::Application, config::ConfigManager};
///
/// # async fn example() -> anyhow::Result<()> {
/// let config_manager = ConfigManager::load(None).await?;
/// Application::builder()
///     .with_config_manager(config_manager)
///     .build()?
///     .run()
///     .await
/// # }
/// ```
pub struct Application {
    pub coordinator: SystemCoordinator,
    config_manager: ConfigManager,
}

impl Application {
    pub fn builder() -> ApplicationBuilder {
        ApplicationBuilder::default()
    }

    pub async fn run(mut self) -> Result<()> {
        self.coordinator.initialize(self.config_manager).await?;
        self.coordinator.start_all_services().await?;
        self.coordinator.run_main_loop().await
    }
}

#[derive(Default)]
pub struct ApplicationBuilder {
    config_manager: Option<ConfigManager>,
    event_bus: Option<EventBus>,
}

impl ApplicationBuilder {
    pub fn with_config_manager(mut self, config_manager: ConfigManager) -> Self {
        self.config_manager = Some(config_manager);
        self
    }

    /// Shares an existing bus, e.g. to observe the daemon from outside.
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn build(self) -> Result<Application> {
        let config_manager = self
            .config_manager
            .ok_or_else(|| anyhow!("Configuration manager is required"))?;

        Ok(Application {
            coordinator: SystemCoordinator::new(self.event_bus.unwrap_or_default()),
            config_manager,
        })
    }
}
