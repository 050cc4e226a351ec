use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Stops a background service in two steps.
#[async_trait::async_trait]
pub trait StopHandler {
    /// Asks the service to stop. Returns before its cleanup has run.
    async fn stop(&mut self) -> anyhow::Result<()>;
    /// Waits until the service has finished cleaning up.
    async fn wait(&mut self) -> anyhow::Result<()>;
}

/// A spawned task driven by a cancellation token.
pub struct TaskHandle {
    token: CancellationToken,
    task: Option<JoinHandle<anyhow::Result<()>>>,
}

impl TaskHandle {
    pub fn new(token: CancellationToken, task: JoinHandle<anyhow::Result<()>>) -> Self {
        TaskHandle {
            token,
            task: Some(task),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

#[async_trait::async_trait]
impl StopHandler for TaskHandle {
    async fn stop(&mut self) -> anyhow::Result<()> {
        self.token.cancel();
        Ok(())
    }

    async fn wait(&mut self) -> anyhow::Result<()> {
        match self.task.take() {
            Some(task) => task.await?,
            None => Ok(()),
        }
    }
}
