use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::broadcast::{Receiver, error::RecvError};
use tokio_util::sync::CancellationToken;

use crate::{
    event::{DeviceChange, Event, EventBus},
    services::traits::Service,
    task_manager::TaskManager,
};

/// Counters kept by the [`ExceptionMonitorService`].
#[derive(Debug, Default)]
pub struct ExceptionStats {
    exceptions: AtomicU64,
    critical: AtomicU64,
    devices_added: AtomicU64,
    devices_removed: AtomicU64,
}

impl ExceptionStats {
    pub fn exceptions(&self) -> u64 {
        self.exceptions.load(Ordering::Relaxed)
    }

    pub fn critical(&self) -> u64 {
        self.critical.load(Ordering::Relaxed)
    }

    pub fn devices_added(&self) -> u64 {
        self.devices_added.load(Ordering::Relaxed)
    }

    pub fn devices_removed(&self) -> u64 {
        self.devices_removed.load(Ordering::Relaxed)
    }

    fn record(&self, event: &Event) {
        match event {
            Event::Exception(exception) => {
                let total = self.exceptions.fetch_add(1, Ordering::Relaxed) + 1;
                if exception.is_critical {
                    self.critical.fetch_add(1, Ordering::Relaxed);
                }
                debug!("Exception #{total} from provider '{}'", exception.provider);
            }
            Event::DevicesChanged {
                provider,
                device,
                change,
            } => {
                let counter = match change {
                    DeviceChange::Added => &self.devices_added,
                    DeviceChange::Removed => &self.devices_removed,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                info!("Device '{device}' {change:?} in provider '{provider}'");
            }
            _ => {}
        }
    }
}

/// Watches the bus for provider exceptions and device changes.
pub struct ExceptionMonitorService {
    event_bus: EventBus,
    stats: Arc<ExceptionStats>,
}

impl ExceptionMonitorService {
    pub fn new(event_bus: EventBus) -> Self {
        Self {
            event_bus,
            stats: Arc::default(),
        }
    }

    pub fn stats(&self) -> Arc<ExceptionStats> {
        Arc::clone(&self.stats)
    }
}

#[async_trait]
impl Service for ExceptionMonitorService {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
        // Events published right after start must already be seen.
        let receiver = self.event_bus.subscribe();
        let stats = Arc::clone(&self.stats);

        task_manager
            .spawn_task(self.name().to_string(), |cancel_token| async move {
                run_exception_monitor(receiver, stats, cancel_token).await
            })
            .await
    }

    fn name(&self) -> &'static str {
        "ExceptionMonitorService"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn is_critical(&self) -> bool {
        true
    }
}

async fn run_exception_monitor(
    mut receiver: Receiver<Event>,
    stats: Arc<ExceptionStats>,
    cancel_token: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,
            event = receiver.recv() => match event {
                Ok(event) => stats.record(&event),
                Err(RecvError::Lagged(n)) => warn!("Exception monitor lagged by {n} events"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    info!(
        "Exception monitor stopped: {} exception(s), {} critical",
        stats.exceptions(),
        stats.critical()
    );
    Ok(())
}
