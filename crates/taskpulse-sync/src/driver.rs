use crate::resync::{ProgressHistorySource, ResyncError};
use crate::router;
use crate::session::{TaskSession, TaskSnapshot};
use chrono::Utc;
use std::sync::Arc;
use taskpulse_core::{ChannelMsg, ProgressEvent};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub(crate) enum SyncEvent {
    Connecting { conn_id: u64, attempt: u32 },
    Opened { conn_id: u64, attempt: u32 },
    Message { conn_id: u64, msg: ChannelMsg },
    Closed { conn_id: u64, reason: String },
    Exhausted { attempts: u32 },
    ResyncDone {
        conn_id: u64,
        outcome: Result<Vec<ProgressEvent>, ResyncError>,
    },
}

pub(crate) async fn drive(
    mut session: TaskSession,
    mut events: mpsc::Receiver<SyncEvent>,
    resync_tx: mpsc::Sender<SyncEvent>,
    source: Arc<dyn ProgressHistorySource>,
    snapshots: watch::Sender<TaskSnapshot>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        // changed() also resolves when the tracker drops its sender, so an
        // abandoned subscription winds down instead of idling forever.
        let event = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        handle_event(&mut session, event, &resync_tx, &source);
        let _ = snapshots.send(session.snapshot());
    }
    debug!(event = "driver_stopped", task_id = %session.task_id());
}

fn handle_event(
    session: &mut TaskSession,
    event: SyncEvent,
    resync_tx: &mpsc::Sender<SyncEvent>,
    source: &Arc<dyn ProgressHistorySource>,
) {
    match event {
        SyncEvent::Connecting { conn_id, attempt } => {
            debug!(
                event = "channel_connecting",
                conn_id,
                attempt,
                task_id = %session.task_id(),
            );
            session.connect_started();
        }
        SyncEvent::Opened { conn_id, attempt } => {
            if attempt > 0 {
                info!(
                    event = "channel_reconnected",
                    conn_id,
                    attempt,
                    task_id = %session.task_id(),
                );
            }
            session.channel_opened();
            // Resync runs on every open, not just the first: it is the only
            // way to close gaps from events missed while disconnected.
            spawn_resync(
                session.task_id().to_string(),
                conn_id,
                resync_tx.clone(),
                Arc::clone(source),
            );
        }
        SyncEvent::Message { conn_id, msg } => {
            router::route_message(session, conn_id, msg, Utc::now());
        }
        SyncEvent::Closed { conn_id, reason } => {
            debug!(
                event = "channel_closed",
                conn_id,
                reason = %reason,
                task_id = %session.task_id(),
            );
            session.channel_closed();
        }
        SyncEvent::Exhausted { attempts } => {
            session.reconnect_gave_up(attempts);
        }
        SyncEvent::ResyncDone { conn_id, outcome } => match outcome {
            Ok(records) => {
                let (admitted, skipped) = session.merge_resync(records, Utc::now());
                info!(
                    event = "history_merged",
                    conn_id,
                    admitted,
                    skipped,
                    task_id = %session.task_id(),
                );
            }
            Err(err) => {
                warn!(
                    event = "history_fetch_failed",
                    conn_id,
                    error = %err,
                    task_id = %session.task_id(),
                );
                session.note_error(format!("progress resync failed: {err}"));
            }
        },
    }
}

fn spawn_resync(
    task_id: String,
    conn_id: u64,
    resync_tx: mpsc::Sender<SyncEvent>,
    source: Arc<dyn ProgressHistorySource>,
) {
    tokio::spawn(async move {
        debug!(event = "history_fetch_started", conn_id, task_id = %task_id);
        let outcome = source.fetch_history(&task_id).await;
        // After teardown the queue is closed and the result is discarded
        // without touching state.
        let _ = resync_tx.send(SyncEvent::ResyncDone { conn_id, outcome }).await;
    });
}
