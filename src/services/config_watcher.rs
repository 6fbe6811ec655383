use std::{path::Path, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use notify::{Event, EventHandler, RecursiveMode, Watcher, recommended_watcher};
use tokio::{sync::mpsc, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    app_context::AppState,
    config::ConfigManager,
    event::{ConfigChangeType, Event as AppEvent, EventBus},
    services::traits::Service,
    task_manager::TaskManager,
};

/// Quiet period after the last file event before the file is re-read.
pub const DEBOUNCE: Duration = Duration::from_millis(2000);

/// Watches the configuration file and classifies every change.
///
/// The watcher never applies a change itself; it publishes
/// [`AppEvent::ConfigChangeDetected`] and the coordinator decides.
pub struct ConfigWatcherService {
    state: Arc<AppState>,
    event_bus: EventBus,
}

impl ConfigWatcherService {
    pub fn new(state: Arc<AppState>, event_bus: EventBus) -> Self {
        Self { state, event_bus }
    }
}

#[async_trait]
impl Service for ConfigWatcherService {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
        let config_manager = Arc::clone(self.state.config_manager());
        let event_bus = self.event_bus.clone();

        task_manager
            .spawn_task(self.name().to_string(), |cancel_token| async move {
                run_config_watcher(config_manager, event_bus, cancel_token).await
            })
            .await
    }

    fn name(&self) -> &'static str {
        "ConfigWatcherService"
    }

    fn priority(&self) -> i32 {
        3
    }
}

struct ChannelHandler(mpsc::UnboundedSender<notify::Result<Event>>);

impl EventHandler for ChannelHandler {
    fn handle_event(&mut self, event: notify::Result<Event>) {
        if let Err(e) = self.0.send(event) {
            error!("Failed to forward filesystem event: {e}");
        }
    }
}

fn affects(event: &Event, config_path: &Path) -> bool {
    (event.kind.is_modify() || event.kind.is_create())
        && event
            .paths
            .iter()
            .any(|path| path == config_path || path.file_name() == config_path.file_name())
}

/// Re-reads the file and compares it with the live configuration.
///
/// Returns `None` when nothing changed. An unreadable or invalid file is
/// an error and leaves the live configuration alone.
pub async fn analyze_change(config_manager: &ConfigManager) -> Result<Option<ConfigChangeType>> {
    let new_config = ConfigManager::read_from_path(config_manager.path())?;
    Ok(config_manager.get().await.classify_change(&new_config))
}

async fn publish_change(config_manager: &ConfigManager, event_bus: &EventBus) {
    match analyze_change(config_manager).await {
        Ok(None) => debug!("Configuration file touched without changes"),
        Ok(Some(change)) => {
            match &change {
                ConfigChangeType::HotReload => info!("Hot-reloadable changes detected"),
                ConfigChangeType::ColdRestart { changed_sections } => {
                    warn!("Changes in {changed_sections:?} require a restart")
                }
            }
            if let Err(e) = event_bus.publish(AppEvent::ConfigChangeDetected(change)) {
                error!("Failed to publish config change event: {e}");
            }
        }
        Err(e) => error!("Ignoring configuration change: {e:#}"),
    }
}

async fn run_config_watcher(
    config_manager: Arc<ConfigManager>,
    event_bus: EventBus,
    cancel_token: CancellationToken,
) -> Result<()> {
    let config_path = config_manager.path().to_path_buf();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let mut watcher = recommended_watcher(ChannelHandler(event_tx))?;

    // Editors replace the file, so the directory is watched instead.
    let watch_path = config_path
        .parent()
        .map_or_else(|| config_path.clone(), Path::to_path_buf);
    watcher.watch(&watch_path, RecursiveMode::NonRecursive)?;
    info!("Watching {} for changes", config_path.display());

    let mut debounce = tokio::time::interval(DEBOUNCE);
    debounce.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pending = false;

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,

            event = event_rx.recv() => match event {
                Some(Ok(event)) if affects(&event, &config_path) => {
                    debug!("Config file event: {:?}", event.kind);
                    pending = true;
                    debounce.reset();
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => warn!("Filesystem watcher error: {e}"),
                None => {
                    warn!("Filesystem event channel closed");
                    break;
                }
            },

            _ = debounce.tick(), if pending => {
                pending = false;
                if config_path.exists() {
                    publish_change(&config_manager, &event_bus).await;
                } else {
                    warn!("Configuration file {} no longer exists", config_path.display());
                }
            }
        }
    }

    if let Err(e) = watcher.unwatch(&watch_path) {
        warn!("Failed to unwatch {}: {e}", watch_path.display());
    }
    info!("Config watcher stopped");
    Ok(())
}
