mod channel;
mod driver;
mod resync;
mod router;
mod session;

pub use channel::ReconnectPolicy;
pub use resync::{HttpHistorySource, ProgressHistorySource, ResyncError, RetryPolicy};
pub use session::TaskSnapshot;
pub use taskpulse_core::{
    ActorMessage, ChannelMsg, ConnectionStatus, CostSnapshot, ProgressEvent,
};

use crate::session::TaskSession;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;
use url::Url;

const EVENT_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub channel_url: Url,
    pub api_url: Url,
    pub reconnect: ReconnectPolicy,
    pub resync: RetryPolicy,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl SyncConfig {
    pub fn new(channel_url: Url, api_url: Url) -> Self {
        Self {
            channel_url,
            api_url,
            reconnect: ReconnectPolicy::default(),
            resync: RetryPolicy::default(),
            connect_timeout: Duration::from_secs(20),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("channel url must use ws or wss, got {0}")]
    ChannelScheme(String),
    #[error("api url must use http or https, got {0}")]
    ApiScheme(String),
    #[error("failed to build http client: {0}")]
    HttpClient(reqwest::Error),
}

pub struct TaskTracker {
    config: SyncConfig,
    source: Arc<dyn ProgressHistorySource>,
    active: Option<Subscription>,
}

impl TaskTracker {
    pub fn new(config: SyncConfig) -> Result<Self, SyncError> {
        match config.channel_url.scheme() {
            "ws" | "wss" => {}
            other => return Err(SyncError::ChannelScheme(other.to_string())),
        }
        match config.api_url.scheme() {
            "http" | "https" => {}
            other => return Err(SyncError::ApiScheme(other.to_string())),
        }
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(SyncError::HttpClient)?;
        let source = Arc::new(HttpHistorySource::new(
            client,
            config.api_url.clone(),
            config.resync.clone(),
        ));
        Ok(Self::with_history_source(config, source))
    }

    pub fn with_history_source(
        config: SyncConfig,
        source: Arc<dyn ProgressHistorySource>,
    ) -> Self {
        Self {
            config,
            source,
            active: None,
        }
    }

    pub async fn track(&mut self, task_id: &str) -> watch::Receiver<TaskSnapshot> {
        self.stop().await;
        let subscription = Subscription::spawn(&self.config, Arc::clone(&self.source), task_id);
        let snapshots = subscription.snapshots.clone();
        info!(event = "task_tracking_started", task_id = %task_id);
        self.active = Some(subscription);
        snapshots
    }

    pub async fn stop(&mut self) {
        if let Some(subscription) = self.active.take() {
            info!(event = "task_tracking_stopped", task_id = %subscription.task_id);
            subscription.shutdown().await;
        }
    }

    pub fn active_task(&self) -> Option<&str> {
        self.active.as_ref().map(|s| s.task_id.as_str())
    }

    pub fn snapshot(&self) -> Option<TaskSnapshot> {
        self.active.as_ref().map(|s| s.snapshots.borrow().clone())
    }
}

struct Subscription {
    task_id: String,
    snapshots: watch::Receiver<TaskSnapshot>,
    shutdown: watch::Sender<bool>,
    channel_task: JoinHandle<()>,
    driver_task: JoinHandle<()>,
}

impl Subscription {
    fn spawn(config: &SyncConfig, source: Arc<dyn ProgressHistorySource>, task_id: &str) -> Self {
        let session = TaskSession::new(task_id);
        let (snapshot_tx, snapshot_rx) = watch::channel(session.snapshot());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

        let channel_task = tokio::spawn(channel::channel_task(
            config.channel_url.clone(),
            task_id.to_string(),
            config.reconnect.clone(),
            config.connect_timeout,
            events_tx.clone(),
            shutdown_rx.clone(),
        ));
        let driver_task = tokio::spawn(driver::drive(
            session,
            events_rx,
            events_tx,
            source,
            snapshot_tx,
            shutdown_rx,
        ));

        Self {
            task_id: task_id.to_string(),
            snapshots: snapshot_rx,
            shutdown: shutdown_tx,
            channel_task,
            driver_task,
        }
    }

    async fn shutdown(self) {
        // An in-flight resync is not awaited; its result lands in a closed
        // queue and is discarded.
        let _ = self.shutdown.send(true);
        let _ = self.channel_task.await;
        let _ = self.driver_task.await;
    }
}
