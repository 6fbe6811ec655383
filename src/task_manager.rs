//! Named tokio tasks with cancellation and bounded shutdown.

use std::{collections::HashMap, future::Future, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use log::{debug, error, info, warn};
use tokio::{task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;

/// How long one task may take to finish after cancellation.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

struct TaskInfo {
    handle: JoinHandle<Result<()>>,
    cancel_token: CancellationToken,
}

/// Owns the daemon's background tasks.
///
/// Every task receives a child of the global token, so [`shutdown_all`]
/// reaches all of them while [`cancel`] stops a single one.
///
/// [`shutdown_all`]: TaskManager::shutdown_all
/// [`cancel`]: TaskManager::cancel
pub struct TaskManager {
    tasks: HashMap<String, TaskInfo>,
    pub global_token: CancellationToken,
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            global_token: CancellationToken::new(),
        }
    }

    /// Spawns `task_fn` under `name`. Names must be unique among live tasks.
    pub async fn spawn_task<F, Fut>(&mut self, name: String, task_fn: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.tasks.retain(|_, info| !info.handle.is_finished());
        if self.tasks.contains_key(&name) {
            bail!("Task '{name}' is already running");
        }

        let cancel_token = self.global_token.child_token();
        let task_token = cancel_token.clone();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            debug!("Starting task: {task_name}");
            let result = task_fn(task_token).await;
            match &result {
                Ok(()) => info!("Task '{task_name}' completed"),
                Err(e) => error!("Task '{task_name}' failed: {e:#}"),
            }
            result
        });

        self.tasks.insert(
            name.clone(),
            TaskInfo {
                handle,
                cancel_token,
            },
        );
        info!("Task '{name}' spawned");
        Ok(())
    }

    /// Cancels one task and waits for it. Returns `false` for unknown names.
    pub async fn cancel(&mut self, name: &str) -> Result<bool> {
        let Some(info) = self.tasks.remove(name) else {
            return Ok(false);
        };
        info.cancel_token.cancel();
        Self::join(name, info.handle).await?;
        Ok(true)
    }

    async fn join(name: &str, handle: JoinHandle<Result<()>>) -> Result<()> {
        match timeout(SHUTDOWN_TIMEOUT, handle).await {
            Ok(Ok(result)) => result.with_context(|| format!("Task '{name}' failed")),
            Ok(Err(e)) => Err(anyhow!("Task '{name}' panicked: {e}")),
            Err(_) => Err(anyhow!("Task '{name}' exceeded the shutdown timeout")),
        }
    }

    /// Cancels every task and waits for all of them.
    ///
    /// Returns the first failure after every task has been joined.
    pub async fn shutdown_all(&mut self) -> Result<()> {
        info!("Stopping all {} tasks", self.tasks.len());
        self.global_token.cancel();

        let mut first_error = None;
        for (name, info) in self.tasks.drain() {
            if let Err(e) = Self::join(&name, info.handle).await {
                warn!("{e:#}");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(error) => Err(error).context("One or more tasks failed during shutdown"),
            None => {
                info!("All tasks stopped");
                Ok(())
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.tasks
            .get(name)
            .is_some_and(|info| !info.handle.is_finished())
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}
