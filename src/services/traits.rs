use anyhow::Result;
use async_trait::async_trait;

use crate::task_manager::TaskManager;

/// A service the coordinator starts through the [`TaskManager`].
///
/// # Example
///
/// ```no_run
/// use rgbd::services::Service;
/// use rgbd::task_manager::TaskManager;
/// use anyhow::Result;
///
/// struct Heartbeat;
///
/// #[async_trait::async_trait]
/// impl Service for Heartbeat {
///     async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
///         task_manager.spawn_task("heartbeat".to_string(), |token| async move {
///             token.cancelled().await;
///             Ok(())
///         }).await
///     }
///
///     fn name(&self) -> &'static str { "Heartbeat" }
/// }
/// ```
#[async_trait]
pub trait Service: Send + Sync {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()>;

    fn name(&self) -> &'static str;

    /// Higher numbers start first.
    fn priority(&self) -> i32 {
        0
    }

    /// A critical service failing to start aborts the daemon.
    fn is_critical(&self) -> bool {
        false
    }
}

/// Orders services for startup, highest priority first.
pub fn sort_by_priority(services: &mut [Box<dyn Service>]) {
    services.sort_by_key(|service| std::cmp::Reverse(service.priority()));
}
