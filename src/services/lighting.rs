use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::{
    sync::broadcast::error::RecvError,
    time::{Interval, MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;

use crate::{
    app_context::AppState,
    event::{Event, EventBus},
    services::traits::Service,
    task_manager::TaskManager,
};

/// Applies the configured color assignments to devices.
///
/// Runs every `tick_millis` and whenever [`Event::ColorChanged`] arrives.
/// Each pass requests the colors on the LEDs and pushes them into the
/// device queues; the triggers decide when hardware is written.
pub struct LightingService {
    state: Arc<AppState>,
    event_bus: EventBus,
}

impl LightingService {
    pub fn new(state: Arc<AppState>, event_bus: EventBus) -> Self {
        Self { state, event_bus }
    }
}

#[async_trait]
impl Service for LightingService {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
        let state = Arc::clone(&self.state);
        let event_bus = self.event_bus.clone();

        task_manager
            .spawn_task(self.name().to_string(), |cancel_token| async move {
                run_lighting_service(state, event_bus, cancel_token).await
            })
            .await
    }

    fn name(&self) -> &'static str {
        "LightingService"
    }

    fn priority(&self) -> i32 {
        5
    }
}

fn ticker(millis: u64) -> Interval {
    let mut ticker = interval(Duration::from_millis(millis.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

async fn run_lighting_service(
    state: Arc<AppState>,
    event_bus: EventBus,
    cancel_token: CancellationToken,
) -> Result<()> {
    let mut receiver = event_bus.subscribe();
    let mut tick_millis = state.config().await.tick_millis;
    let mut ticker = ticker(tick_millis);

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!("Lighting service cancelled");
                break;
            }
            _ = ticker.tick() => {
                apply_assignments(&state).await;
            }
            event = receiver.recv() => match event {
                Ok(Event::ColorChanged) => {
                    let current = state.config().await.tick_millis;
                    if current != tick_millis {
                        info!("Lighting tick changed to {current} ms");
                        tick_millis = current;
                        ticker = self::ticker(tick_millis);
                    }
                    apply_assignments(&state).await;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!("Lighting service lagged by {n} events"),
                Err(RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}

/// Requests every assigned color and pushes it into the device queues.
///
/// Returns the number of devices updated.
pub async fn apply_assignments(state: &AppState) -> usize {
    let config = state.config().await;
    let mut touched = HashMap::new();

    for assignment in &config.assignments {
        let Some(color) = config.find_color(&assignment.color) else {
            warn!("Color '{}' not found in config", assignment.color);
            continue;
        };
        let Some(device) = state.find_device(&assignment.device, assignment.provider.as_deref())
        else {
            debug!("Device '{}' is not loaded", assignment.device);
            continue;
        };

        device.set_all(color);
        touched.insert(device.name().to_string(), device);
    }

    for device in touched.values() {
        device.update(false);
    }
    touched.len()
}
