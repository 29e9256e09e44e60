use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use taskpulse_sync::{ConnectionStatus, SyncConfig, TaskSnapshot, TaskTracker};
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

const DEFAULT_CHANNEL_URL: &str = "ws://127.0.0.1:8000/ws";
const DEFAULT_API_URL: &str = "http://127.0.0.1:8000/api";

#[derive(Parser, Debug)]
#[command(name = "taskpulse-watch")]
#[command(about = "Follow a task's progress feed from the terminal", long_about = None)]
struct Args {
    /// Task id to follow.
    task_id: String,
    #[arg(long, default_value = "")]
    channel_url: String,
    #[arg(long, default_value = "")]
    api_url: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    /// Give up after this many seconds if the task has not completed (0 waits forever).
    #[arg(long, default_value_t = 0)]
    timeout: u64,
}

enum WatchOutcome {
    Completed(Value),
    Interrupted,
    ChannelDead(String),
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let debug = args.debug || env_true("TASKPULSE_DEBUG");
    init_logging(debug);

    let channel_url = resolve_channel_url(&args.channel_url)?;
    let api_url = resolve_api_url(&args.api_url)?;
    info!(
        event = "watch_start",
        task_id = %args.task_id,
        channel_url = %channel_url,
        api_url = %api_url
    );

    let config = SyncConfig::new(channel_url, api_url);
    let mut tracker = TaskTracker::new(config).context("invalid sync configuration")?;
    let mut snapshots = tracker.track(&args.task_id).await;

    let mut view = FeedView::default();
    let outcome = if args.timeout == 0 {
        follow(&mut snapshots, &mut view).await
    } else {
        let limit = Duration::from_secs(args.timeout);
        match tokio::time::timeout(limit, follow(&mut snapshots, &mut view)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracker.stop().await;
                bail!("task did not complete within {}s", args.timeout);
            }
        }
    };
    tracker.stop().await;

    match outcome {
        WatchOutcome::Completed(output) => {
            // The output document is printed last so it can be piped.
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        WatchOutcome::Interrupted => Ok(()),
        WatchOutcome::ChannelDead(reason) => bail!("{reason}"),
    }
}

async fn follow(
    snapshots: &mut tokio::sync::watch::Receiver<TaskSnapshot>,
    view: &mut FeedView,
) -> WatchOutcome {
    // Render whatever state exists before the first change notification.
    render_to_stdout(view, &snapshots.borrow().clone());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(event = "watch_interrupted");
                return WatchOutcome::Interrupted;
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    return WatchOutcome::ChannelDead("progress feed ended".to_string());
                }
                let snapshot = snapshots.borrow_and_update().clone();
                render_to_stdout(view, &snapshot);
                if snapshot.completed {
                    return WatchOutcome::Completed(
                        snapshot.output.unwrap_or(Value::Null),
                    );
                }
                if snapshot.reconnect_exhausted {
                    let reason = snapshot
                        .last_error
                        .unwrap_or_else(|| "channel reconnect gave up".to_string());
                    return WatchOutcome::ChannelDead(reason);
                }
            }
        }
    }
}

fn render_to_stdout(view: &mut FeedView, snapshot: &TaskSnapshot) {
    for line in view.render(snapshot) {
        println!("{line}");
    }
}

#[derive(Default)]
struct FeedView {
    status: Option<ConnectionStatus>,
    // History can grow in the middle when a resync backfills; a printed
    // prefix counter is not enough.
    printed: HashSet<u64>,
    messages_seen: usize,
    last_cost: Option<f64>,
    last_error: Option<String>,
}

impl FeedView {
    fn render(&mut self, snapshot: &TaskSnapshot) -> Vec<String> {
        let mut lines = Vec::new();

        if self.status != Some(snapshot.connection) {
            self.status = Some(snapshot.connection);
            lines.push(format!("-- channel {}", snapshot.connection));
        }

        for event in &snapshot.history {
            let Some(seq) = event.sequence_id else {
                continue;
            };
            if self.printed.insert(seq) {
                lines.push(format!(
                    "[{:>5.1}%] {:<12} {}",
                    event.progress, event.phase, event.message
                ));
            }
        }

        for message in snapshot.messages.iter().skip(self.messages_seen) {
            lines.push(format!("({}) {}", message.actor, message.content));
        }
        self.messages_seen = snapshot.messages.len();

        if let Some(cost) = &snapshot.cost {
            if self.last_cost != Some(cost.current_cost) {
                self.last_cost = Some(cost.current_cost);
                lines.push(format!(
                    "-- spend ${:.4} (phase {} ${:.4})",
                    cost.current_cost, cost.phase, cost.phase_cost
                ));
            }
        }

        if snapshot.last_error != self.last_error {
            self.last_error = snapshot.last_error.clone();
            if let Some(error) = &self.last_error {
                lines.push(format!("!! {error}"));
            }
        }

        if snapshot.completed {
            lines.push("-- task complete".to_string());
        }

        lines
    }
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("TASKPULSE_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // Diagnostics go to stderr; stdout carries the feed and the final output.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn resolve_channel_url(flag: &str) -> Result<Url> {
    let raw = if !flag.trim().is_empty() {
        flag.to_string()
    } else {
        match std::env::var("TASKPULSE_CHANNEL_URL") {
            Ok(value) if !value.trim().is_empty() => value,
            _ => DEFAULT_CHANNEL_URL.to_string(),
        }
    };
    Url::parse(&raw).with_context(|| format!("invalid channel url: {raw}"))
}

fn resolve_api_url(flag: &str) -> Result<Url> {
    let raw = if !flag.trim().is_empty() {
        flag.to_string()
    } else {
        match std::env::var("TASKPULSE_API_URL") {
            Ok(value) if !value.trim().is_empty() => value,
            _ => DEFAULT_API_URL.to_string(),
        }
    };
    Url::parse(&raw).with_context(|| format!("invalid api url: {raw}"))
}
