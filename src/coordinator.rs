//! System coordinator: builds the application state, starts services and
//! runs the main event loop until shutdown.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use log::{error, info, warn};
use tokio::sync::broadcast::error::RecvError;

use crate::{
    app_context::AppState,
    config::ConfigManager,
    event::{ConfigChangeType, Event, EventBus},
    services::{
        ConfigWatcherService, ExceptionMonitorService, LightingService, Service,
        traits::sort_by_priority,
    },
    task_manager::TaskManager,
};

/// Whether the main loop keeps running after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Owns the task manager, the bus, the shared state and the services.
///
/// Critical services must start; the others may fail with a warning.
pub struct SystemCoordinator {
    task_manager: TaskManager,
    event_bus: EventBus,
    shared_state: Option<Arc<AppState>>,
    services: Vec<Box<dyn Service>>,
}

impl Default for SystemCoordinator {
    fn default() -> Self {
        Self::new(EventBus::new())
    }
}

impl SystemCoordinator {
    pub fn new(event_bus: EventBus) -> Self {
        Self {
            task_manager: TaskManager::new(),
            event_bus,
            shared_state: None,
            services: Vec::new(),
        }
    }

    /// Builds the state, brings providers up and registers services.
    ///
    /// Providers that fail to initialize are left out; the daemon keeps
    /// running with the rest.
    pub async fn initialize(&mut self, config_manager: ConfigManager) -> Result<()> {
        info!("Initializing SystemCoordinator...");

        let state = Arc::new(
            AppState::new(config_manager, self.event_bus.clone())
                .await
                .context("Failed to initialize application state")?,
        );

        // The monitor must see exceptions raised while providers load.
        let monitor = ExceptionMonitorService::new(self.event_bus.clone());
        monitor
            .start(&mut self.task_manager)
            .await
            .context("Critical service 'ExceptionMonitorService' failed to start")?;

        let ready = state.initialize_providers().await;
        if ready == 0 && !state.providers().is_empty() {
            warn!("No provider could be initialized");
        }

        let mut services: Vec<Box<dyn Service>> = vec![
            Box::new(LightingService::new(
                Arc::clone(&state),
                self.event_bus.clone(),
            )),
            Box::new(ConfigWatcherService::new(
                Arc::clone(&state),
                self.event_bus.clone(),
            )),
        ];
        sort_by_priority(&mut services);
        self.services = services;
        self.shared_state = Some(state);

        info!(
            "Registered {} services in priority order",
            self.services.len()
        );
        Ok(())
    }

    /// Starts registered services in priority order.
    pub async fn start_all_services(&mut self) -> Result<()> {
        for service in &self.services {
            match service.start(&mut self.task_manager).await {
                Ok(()) => info!(
                    "Service '{}' started (priority: {}, critical: {})",
                    service.name(),
                    service.priority(),
                    service.is_critical()
                ),
                Err(e) if service.is_critical() => {
                    return Err(e).with_context(|| {
                        format!("Critical service '{}' failed to start", service.name())
                    });
                }
                Err(e) => warn!(
                    "Non-critical service '{}' failed to start: {e:#}",
                    service.name()
                ),
            }
        }
        Ok(())
    }

    /// Runs until Ctrl-C or [`Event::SystemShutdown`], then shuts down.
    pub async fn run_main_loop(&mut self) -> Result<()> {
        let mut event_rx = self.event_bus.subscribe();
        info!("Starting main event loop");

        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result.context("Failed to listen for shutdown signal")?;
                    info!("Received Ctrl+C, initiating graceful shutdown...");
                    break;
                }
                event = event_rx.recv() => {
                    if self.handle_event(event).await? == Flow::Stop {
                        break;
                    }
                }
            }
        }

        self.shutdown().await
    }

    async fn handle_event(&mut self, event: Result<Event, RecvError>) -> Result<Flow> {
        match event {
            Ok(Event::ConfigChangeDetected(change)) => {
                if let Err(e) = self.handle_config_change(change).await {
                    error!("Failed to apply configuration change: {e:#}");
                }
            }
            Ok(Event::SystemShutdown) => {
                info!("Processing SystemShutdown event");
                return Ok(Flow::Stop);
            }
            Ok(_) => {}
            Err(RecvError::Closed) => bail!("Event bus channel closed unexpectedly"),
            Err(RecvError::Lagged(n)) => warn!("Event bus lagged by {n} messages"),
        }
        Ok(Flow::Continue)
    }

    async fn handle_config_change(&self, change: ConfigChangeType) -> Result<()> {
        let state = self
            .shared_state
            .as_ref()
            .ok_or_else(|| anyhow!("System not initialized"))?;

        match change {
            ConfigChangeType::HotReload => {
                state
                    .config_manager()
                    .reload()
                    .await
                    .context("Failed to reload configuration")?;
                // Nobody listening only means lighting is not running yet.
                let _ = self.event_bus.publish(Event::ColorChanged);
                info!("Hot configuration reload completed");
            }
            ConfigChangeType::ColdRestart { changed_sections } => {
                warn!("Changes in {changed_sections:?} take effect after a restart");
                info!("To restart the daemon, run: sudo systemctl restart rgbd");
            }
        }
        Ok(())
    }

    /// Stops every task, then resets every provider.
    async fn shutdown(&mut self) -> Result<()> {
        info!("Initiating graceful shutdown...");

        if let Err(e) = self.task_manager.shutdown_all().await {
            error!("Error during task shutdown: {e:#}");
        }
        if let Some(state) = &self.shared_state {
            state.reset_providers().await;
        }

        info!("Shutdown complete");
        Ok(())
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn state(&self) -> Option<&Arc<AppState>> {
        self.shared_state.as_ref()
    }

    pub fn registered_services(&self) -> Vec<&'static str> {
        self.services.iter().map(|s| s.name()).collect()
    }
}
