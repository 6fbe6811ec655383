//! Long-running daemon services started through the [`TaskManager`].
//!
//! [`TaskManager`]: crate::task_manager::TaskManager

pub mod config_watcher;
pub mod exception_monitor;
pub mod lighting;
pub mod traits;

pub use config_watcher::ConfigWatcherService;
pub use exception_monitor::{ExceptionMonitorService, ExceptionStats};
pub use lighting::LightingService;
pub use traits::Service;
