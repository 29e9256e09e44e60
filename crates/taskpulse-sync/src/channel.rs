use crate::driver::SyncEvent;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use taskpulse_core::{decode_msg, encode_msg, ChannelMsg, JoinTaskPayload};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

fn next_delay(current: Duration, max: Duration) -> Duration {
    let doubled = current.saturating_mul(2);
    if doubled > max {
        max
    } else {
        doubled
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum ConnExit {
    Halt,
    Lost(String),
}

pub(crate) async fn channel_task(
    channel_url: Url,
    task_id: String,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    events: mpsc::Sender<SyncEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut conn_id: u64 = 0;
    let mut failures: u32 = 0;
    let mut delay = policy.initial_delay;

    loop {
        if *shutdown.borrow() {
            return;
        }
        conn_id += 1;
        let attempt = failures;
        if events
            .send(SyncEvent::Connecting { conn_id, attempt })
            .await
            .is_err()
        {
            return;
        }

        let connected = tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            result = timeout(connect_timeout, connect_async(channel_url.as_str())) => result,
        };

        let close_reason = match connected {
            Ok(Ok((ws, _response))) => {
                info!(event = "channel_connected", conn_id, attempt, url = %channel_url);
                failures = 0;
                delay = policy.initial_delay;
                match serve_connection(ws, &task_id, conn_id, attempt, &events, &mut shutdown).await
                {
                    ConnExit::Halt => return,
                    ConnExit::Lost(reason) => reason,
                }
            }
            Ok(Err(err)) => {
                warn!(event = "channel_connect_failed", conn_id, attempt, error = %err);
                format!("connect failed: {err}")
            }
            Err(_) => {
                warn!(event = "channel_connect_timeout", conn_id, attempt);
                "connect timed out".to_string()
            }
        };

        if events
            .send(SyncEvent::Closed {
                conn_id,
                reason: close_reason,
            })
            .await
            .is_err()
        {
            return;
        }

        failures += 1;
        if failures > policy.max_attempts {
            warn!(event = "channel_reconnect_exhausted", attempts = policy.max_attempts);
            let _ = events
                .send(SyncEvent::Exhausted {
                    attempts: policy.max_attempts,
                })
                .await;
            return;
        }
        debug!(
            event = "channel_retry_scheduled",
            attempt = failures,
            delay_ms = delay.as_millis() as u64,
        );
        tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = next_delay(delay, policy.max_delay);
    }
}

async fn serve_connection(
    mut ws: WsStream,
    task_id: &str,
    conn_id: u64,
    attempt: u32,
    events: &mpsc::Sender<SyncEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> ConnExit {
    let frame = match join_frame(task_id) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(event = "join_encode_failed", conn_id, error = %err);
            let _ = ws.close(None).await;
            return ConnExit::Lost(format!("join encode failed: {err}"));
        }
    };
    if let Err(err) = ws.send(Message::Text(frame)).await {
        warn!(event = "join_send_failed", conn_id, error = %err);
        return ConnExit::Lost(format!("join send failed: {err}"));
    }
    debug!(event = "join_task_sent", conn_id, task_id = %task_id);

    if events
        .send(SyncEvent::Opened { conn_id, attempt })
        .await
        .is_err()
    {
        let _ = ws.close(None).await;
        return ConnExit::Halt;
    }

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                let _ = ws.close(None).await;
                return ConnExit::Halt;
            }
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => match decode_msg(&text) {
                    Ok(msg) => {
                        if events
                            .send(SyncEvent::Message { conn_id, msg })
                            .await
                            .is_err()
                        {
                            let _ = ws.close(None).await;
                            return ConnExit::Halt;
                        }
                    }
                    Err(err) => {
                        warn!(event = "frame_invalid", conn_id, error = %err);
                    }
                },
                Some(Ok(Message::Close(close))) => {
                    return ConnExit::Lost(match close {
                        Some(close) => format!("closed by server: {}", close.reason),
                        None => "closed by server".to_string(),
                    });
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return ConnExit::Lost(format!("transport error: {err}")),
                None => return ConnExit::Lost("stream ended".to_string()),
            }
        }
    }
}

fn join_frame(task_id: &str) -> Result<String, taskpulse_core::WireError> {
    encode_msg(&ChannelMsg::JoinTask(JoinTaskPayload {
        task_id: task_id.to_string(),
    }))
}
