//! Event-driven communication between providers, queues and daemon services.
//!
//! Flush failures and enumeration errors never propagate to the thread that
//! wrote the colors; they travel here as [`Event::Exception`].

use std::{fmt, sync::Arc};

use anyhow::Result;
use log::{error, warn};
use tokio::sync::broadcast;

/// Type of configuration change detected
#[derive(Debug, Clone)]
pub enum ConfigChangeType {
    /// Colors, assignments or timing: applied without restart
    HotReload,
    /// Provider definitions changed: requires restart
    ColdRestart {
        /// Names of the changed sections
        changed_sections: Vec<String>,
    },
}

/// Whether a device joined or left a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceChange {
    Added,
    Removed,
}

/// Error raised by a provider, one of its queues, or a device loader.
#[derive(Clone)]
pub struct ProviderException {
    pub provider: String,
    pub device: Option<String>,
    pub error: Arc<anyhow::Error>,
    pub is_critical: bool,
}

impl fmt::Debug for ProviderException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderException")
            .field("provider", &self.provider)
            .field("device", &self.device)
            .field("error", &format_args!("{:#}", self.error))
            .field("is_critical", &self.is_critical)
            .finish()
    }
}

impl fmt::Display for ProviderException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.device {
            Some(device) => write!(f, "[{}/{}] {:#}", self.provider, device, self.error),
            None => write!(f, "[{}] {:#}", self.provider, self.error),
        }
    }
}

/// Application events.
#[derive(Debug, Clone)]
pub enum Event {
    Exception(ProviderException),
    DevicesChanged {
        provider: String,
        device: String,
        change: DeviceChange,
    },
    /// Configuration change detection with type classification
    ConfigChangeDetected(ConfigChangeType),
    ColorChanged,
    SystemShutdown,
}

/// Event bus for publish-subscribe messaging.
///
/// Sending on a broadcast channel never blocks and works outside a tokio
/// runtime, so trigger threads publish here directly.
///
/// # Example
///
/// ```no_run
/// use rgbd::event::{Event, EventBus};
///
/// let event_bus = EventBus::new();
/// let mut subscriber = event_bus.subscribe();
///
/// event_bus.publish(Event::ColorChanged)?;
/// // In async context: let event = subscriber.recv().await;
/// # Ok::<(), anyhow::Error>(())
/// ```
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Creates a new EventBus with default capacity.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    /// Creates a new EventBus with custom capacity.
    #[cfg(test)]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns an error if there are no active subscribers.
    pub fn publish(&self, event: Event) -> Result<()> {
        self.sender.send(event)?;
        Ok(())
    }

    /// Each subscriber receives all events published after subscription.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Routes errors of one provider (and optionally one device) to the bus.
///
/// Cheap to clone; every update queue carries one.
#[derive(Clone)]
pub struct ExceptionReporter {
    provider: Arc<str>,
    device: Option<Arc<str>>,
    bus: EventBus,
}

impl ExceptionReporter {
    pub fn new(provider: &str, bus: EventBus) -> Self {
        Self {
            provider: Arc::from(provider),
            device: None,
            bus,
        }
    }

    /// Returns a reporter that tags errors with the given device name.
    pub fn for_device(&self, device: &str) -> Self {
        Self {
            provider: self.provider.clone(),
            device: Some(Arc::from(device)),
            bus: self.bus.clone(),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Logs the error and publishes it as [`Event::Exception`].
    pub fn report(&self, error: anyhow::Error, is_critical: bool) -> ProviderException {
        let exception = ProviderException {
            provider: self.provider.to_string(),
            device: self.device.as_deref().map(str::to_string),
            error: Arc::new(error),
            is_critical,
        };

        if is_critical {
            error!("{exception}");
        } else {
            warn!("{exception}");
        }

        // Nobody listening is fine: the log line above already recorded it.
        let _ = self.bus.publish(Event::Exception(exception.clone()));
        exception
    }
}

impl fmt::Debug for ExceptionReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionReporter")
            .field("provider", &self.provider)
            .field("device", &self.device)
            .finish()
    }
}
