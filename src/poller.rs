//! Long-poll update loop
//!
//! One poller owns the update offset for the bot. Updates are handed to an
//! [`UpdateHandler`] one at a time in arrival order, and the offset moves
//! past each update once its handler returns, whatever the outcome.

use crate::error::Result;
use crate::transport::{ChatTransport, Update};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Receives every update the poller fetches
#[async_trait]
pub trait UpdateHandler: Send + Sync {
    async fn handle_update(&self, update: Update) -> Result<()>;
}

/// Poller timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    /// Server-side long-poll wait
    pub wait: Duration,
    /// Pause after a non-timeout failure
    pub backoff: Duration,
    /// How long `stop()` lingers after clearing the running flag
    pub grace: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(30),
            backoff: Duration::from_secs(1),
            grace: Duration::from_secs(2),
        }
    }
}

pub struct UpdatePoller {
    transport: Arc<dyn ChatTransport>,
    handler: Arc<dyn UpdateHandler>,
    config: PollerConfig,
    running: AtomicBool,
    last_update_id: AtomicI64,
}

impl UpdatePoller {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        handler: Arc<dyn UpdateHandler>,
        config: PollerConfig,
    ) -> Self {
        Self {
            transport,
            handler,
            config,
            running: AtomicBool::new(false),
            last_update_id: AtomicI64::new(0),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Highest update id acknowledged so far
    pub fn last_update_id(&self) -> i64 {
        self.last_update_id.load(Ordering::SeqCst)
    }

    /// Drop any webhook and poll until [`stop`](Self::stop) is called
    ///
    /// A second call while already running returns immediately.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("Update poller already running");
            return;
        }

        tracing::info!(
            wait_secs = self.config.wait.as_secs(),
            backoff_ms = self.config.backoff.as_millis() as u64,
            "Starting update poller"
        );
        match self.transport.delete_webhook(true).await {
            Ok(()) => tracing::info!("Webhook deleted"),
            Err(e) => tracing::warn!("Webhook deletion failed: {}", e),
        }

        self.run().await;
        tracing::info!("Update poller exited");
    }

    /// Run [`start`](Self::start) on its own task
    ///
    /// A panic inside the loop surfaces as the handle's `JoinError`.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let poller = Arc::clone(self);
        tokio::spawn(async move { poller.start().await })
    }

    async fn run(&self) {
        while self.is_running() {
            let offset = self.last_update_id() + 1;
            match self.transport.get_updates(offset, self.config.wait).await {
                Ok(updates) => {
                    if !updates.is_empty() {
                        tracing::debug!(count = updates.len(), offset, "Received updates");
                    }
                    for update in updates {
                        // Whatever is left stays unacknowledged for the next run
                        if !self.is_running() {
                            break;
                        }
                        let update_id = update.update_id;
                        if let Err(e) = self.handler.handle_update(update).await {
                            tracing::error!(update_id, "Failed to handle update: {}", e);
                        }
                        self.last_update_id.fetch_max(update_id, Ordering::SeqCst);
                    }
                }
                Err(e) if e.is_timeout() => {
                    tracing::debug!("Long poll timed out; polling again");
                }
                Err(e) => {
                    if e.is_transient() {
                        tracing::warn!("Polling interrupted: {}", e);
                    } else {
                        tracing::error!("Polling error: {}", e);
                    }
                    if self.is_running() {
                        tokio::time::sleep(self.config.backoff).await;
                    }
                }
            }
        }
    }

    /// Stop polling and give in-flight work the grace period to settle
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            tracing::warn!("Update poller not running");
            return;
        }
        tracing::info!(grace_ms = self.config.grace.as_millis() as u64, "Stopping update poller");
        tokio::time::sleep(self.config.grace).await;
        tracing::info!("Update poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use crate::transport::MemoryTransport;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<i64>>,
        fail_on: Option<i64>,
    }

    impl Recorder {
        fn failing_on(update_id: i64) -> Self {
            Self {
                fail_on: Some(update_id),
                ..Default::default()
            }
        }

        fn seen(&self) -> Vec<i64> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl UpdateHandler for Recorder {
        async fn handle_update(&self, update: Update) -> Result<()> {
            self.seen.lock().unwrap().push(update.update_id);
            if self.fail_on == Some(update.update_id) {
                return Err(RelayError::remote("Prompt", "HTTP 500: boom"));
            }
            Ok(())
        }
    }

    fn fast() -> PollerConfig {
        PollerConfig {
            wait: Duration::from_millis(10),
            backoff: Duration::from_millis(10),
            grace: Duration::from_millis(10),
        }
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_offset_advances_past_failing_update() {
        let transport = Arc::new(MemoryTransport::new());
        transport.push_updates(vec![
            Update::text(1, 10, 100, "a"),
            Update::text(2, 10, 100, "b"),
            Update::text(3, 10, 100, "c"),
        ]);
        let handler = Arc::new(Recorder::failing_on(2));
        let poller = Arc::new(UpdatePoller::new(transport.clone(), handler.clone(), fast()));

        let handle = poller.spawn();
        wait_until(|| poller.last_update_id() == 3).await;
        poller.stop().await;
        handle.await.unwrap();

        assert_eq!(handler.seen(), vec![1, 2, 3]);
        let offsets = transport.offsets();
        assert_eq!(offsets[0], 1);
        assert!(offsets[1..].iter().all(|o| *o == 4));
        assert_eq!(transport.webhook_deletes(), 1);
    }

    #[tokio::test]
    async fn test_keeps_polling_after_transport_errors() {
        let transport = Arc::new(MemoryTransport::new());
        transport.push_error(RelayError::Transport("connection reset".into()));
        transport.push_error(RelayError::Timeout("getUpdates".into()));
        transport.push_updates(vec![Update::text(7, 10, 100, "after")]);
        let handler = Arc::new(Recorder::default());
        let poller = Arc::new(UpdatePoller::new(transport.clone(), handler.clone(), fast()));

        let handle = poller.spawn();
        wait_until(|| poller.last_update_id() == 7).await;
        poller.stop().await;
        handle.await.unwrap();

        assert_eq!(handler.seen(), vec![7]);
        assert_eq!(&transport.offsets()[..3], &[1, 1, 1]);
    }

    #[tokio::test]
    async fn test_keeps_polling_after_api_rejection() {
        let transport = Arc::new(MemoryTransport::new());
        let rejected = RelayError::Telegram {
            status: 409,
            description: "Conflict: terminated by other getUpdates request".into(),
        };
        assert!(!rejected.is_transient());
        transport.push_error(rejected);
        transport.push_updates(vec![Update::text(3, 10, 100, "later")]);
        let handler = Arc::new(Recorder::default());
        let poller = Arc::new(UpdatePoller::new(transport.clone(), handler.clone(), fast()));

        let handle = poller.spawn();
        wait_until(|| poller.last_update_id() == 3).await;
        poller.stop().await;
        handle.await.unwrap();

        assert_eq!(handler.seen(), vec![3]);
        assert_eq!(&transport.offsets()[..2], &[1, 1]);
    }

    #[tokio::test]
    async fn test_stop_and_double_start() {
        let transport = Arc::new(MemoryTransport::new());
        let poller = Arc::new(UpdatePoller::new(
            transport.clone(),
            Arc::new(Recorder::default()),
            fast(),
        ));

        // Not running yet
        poller.stop().await;
        assert!(!poller.is_running());

        let handle = poller.spawn();
        wait_until(|| poller.is_running()).await;
        // Returns at once without a second webhook delete
        poller.start().await;
        assert_eq!(transport.webhook_deletes(), 1);

        poller.stop().await;
        assert!(!poller.is_running());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_webhook_failure_does_not_prevent_polling() {
        let transport = Arc::new(MemoryTransport::new());
        transport.fail_side_actions(true);
        transport.push_updates(vec![Update::text(1, 10, 100, "hi")]);
        let handler = Arc::new(Recorder::default());
        let poller = Arc::new(UpdatePoller::new(transport.clone(), handler.clone(), fast()));

        let handle = poller.spawn();
        wait_until(|| poller.last_update_id() == 1).await;
        poller.stop().await;
        handle.await.unwrap();
        assert_eq!(handler.seen(), vec![1]);
    }
}
