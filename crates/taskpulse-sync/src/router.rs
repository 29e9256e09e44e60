use crate::session::{Admission, TaskSession};
use chrono::{DateTime, Utc};
use taskpulse_core::{sanitize_cost_update, ChannelMsg};
use tracing::{debug, info, warn};

pub(crate) fn route_message(
    session: &mut TaskSession,
    conn_id: u64,
    msg: ChannelMsg,
    now: DateTime<Utc>,
) {
    match msg {
        ChannelMsg::Progress(event) => {
            let sequence_id = event.sequence_id;
            let phase = event.phase.clone();
            match session.admit_progress(event, now) {
                Admission::Admitted => debug!(
                    event = "progress_admitted",
                    conn_id,
                    task_id = %session.task_id(),
                    sequence_id = sequence_id.unwrap_or_default(),
                    phase = %phase,
                ),
                Admission::MissingSequence => warn!(
                    event = "progress_missing_sequence",
                    conn_id,
                    task_id = %session.task_id(),
                    phase = %phase,
                ),
                Admission::Duplicate => debug!(
                    event = "progress_duplicate",
                    conn_id,
                    task_id = %session.task_id(),
                    sequence_id = sequence_id.unwrap_or_default(),
                ),
                Admission::ForeignTask => warn!(
                    event = "progress_foreign_task",
                    conn_id,
                    task_id = %session.task_id(),
                    sequence_id = ?sequence_id,
                ),
                Admission::AfterCompletion => debug!(
                    event = "progress_after_completion",
                    conn_id,
                    task_id = %session.task_id(),
                    sequence_id = ?sequence_id,
                ),
            }
        }
        ChannelMsg::AiMessage(message) => {
            debug!(
                event = "actor_message",
                conn_id,
                task_id = %session.task_id(),
                actor = %message.actor,
            );
            session.push_message(message, now);
        }
        ChannelMsg::CostUpdate(payload) => match sanitize_cost_update(payload) {
            Some(snapshot) => {
                if session.apply_cost(snapshot, now) {
                    debug!(event = "cost_updated", conn_id, task_id = %session.task_id());
                } else {
                    debug!(
                        event = "cost_after_completion",
                        conn_id,
                        task_id = %session.task_id(),
                    );
                }
            }
            None => warn!(
                event = "cost_update_rejected",
                conn_id,
                task_id = %session.task_id(),
            ),
        },
        ChannelMsg::Complete(done) => {
            if session.complete(done.output, now) {
                info!(event = "task_complete", conn_id, task_id = %session.task_id());
            } else {
                debug!(
                    event = "duplicate_completion_ignored",
                    conn_id,
                    task_id = %session.task_id(),
                );
            }
        }
        ChannelMsg::Error(payload) => {
            warn!(
                event = "channel_error",
                conn_id,
                task_id = %session.task_id(),
                error = %payload.error,
            );
            session.note_error(payload.error);
        }
        ChannelMsg::Joined(ack) => {
            info!(event = "task_joined", conn_id, task_id = %ack.task_id);
        }
        // join_task is client -> server; a server echoing it back is noise.
        ChannelMsg::JoinTask(_) => {
            debug!(event = "unexpected_join_task", conn_id, task_id = %session.task_id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use taskpulse_core::{
        ActorMessage, CompletionPayload, CostUpdatePayload, ErrorPayload, JoinedPayload,
        ProgressEvent,
    };

    const CONN: u64 = 1;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn cost_update(current: f64, breakdown: Option<&[(&str, f64)]>) -> ChannelMsg {
        ChannelMsg::CostUpdate(CostUpdatePayload {
            current_cost: Some(current),
            phase_cost: Some(0.1),
            phase: Some("analysis".to_string()),
            breakdown: breakdown.map(|entries| {
                entries
                    .iter()
                    .map(|(source, amount)| (source.to_string(), *amount))
                    .collect::<BTreeMap<_, _>>()
            }),
        })
    }

    fn progress_msg(sequence_id: Option<u64>) -> ChannelMsg {
        ChannelMsg::Progress(ProgressEvent {
            phase: "analysis".to_string(),
            progress: 10.0,
            message: "working".to_string(),
            ts: None,
            sequence_id,
            task_id: None,
        })
    }

    #[test]
    fn negative_breakdown_figures_are_clamped() {
        let mut session = TaskSession::new("task-a");
        route_message(&mut session, CONN, cost_update(1.0, Some(&[("kimi", -5.0)])), now());
        let cost = session.snapshot().cost.expect("cost accepted");
        assert_eq!(cost.breakdown["kimi"], 0.0);
        assert_eq!(cost.current_cost, 1.0);
    }

    #[test]
    fn cost_update_without_breakdown_keeps_previous_snapshot() {
        let mut session = TaskSession::new("task-a");
        route_message(&mut session, CONN, cost_update(1.0, Some(&[("qwen", 0.4)])), now());
        route_message(&mut session, CONN, cost_update(9.0, None), now());
        let cost = session.snapshot().cost.expect("previous snapshot kept");
        assert_eq!(cost.current_cost, 1.0);
        assert_eq!(cost.breakdown["qwen"], 0.4);
    }

    #[test]
    fn progress_without_sequence_never_reaches_history() {
        let mut session = TaskSession::new("task-a");
        route_message(&mut session, CONN, progress_msg(None), now());
        assert!(session.snapshot().history.is_empty());
        route_message(&mut session, CONN, progress_msg(Some(1)), now());
        assert_eq!(session.snapshot().history.len(), 1);
    }

    #[test]
    fn error_event_is_surfaced_not_applied() {
        let mut session = TaskSession::new("task-a");
        route_message(
            &mut session,
            CONN,
            ChannelMsg::Error(ErrorPayload {
                error: "backend hiccup".to_string(),
            }),
            now(),
        );
        let snapshot = session.snapshot();
        assert_eq!(snapshot.last_error.as_deref(), Some("backend hiccup"));
        assert!(!snapshot.completed);
        assert!(snapshot.history.is_empty());
    }

    #[test]
    fn joined_ack_is_informational() {
        let mut session = TaskSession::new("task-a");
        let before = session.snapshot();
        route_message(
            &mut session,
            CONN,
            ChannelMsg::Joined(JoinedPayload {
                task_id: "task-a".to_string(),
            }),
            now(),
        );
        assert_eq!(session.snapshot(), before);
    }

    #[test]
    fn second_completion_keeps_first_output() {
        let mut session = TaskSession::new("task-a");
        route_message(
            &mut session,
            CONN,
            ChannelMsg::Complete(CompletionPayload {
                output: serde_json::json!({"verdict": "ok"}),
            }),
            now(),
        );
        route_message(
            &mut session,
            CONN,
            ChannelMsg::Complete(CompletionPayload {
                output: serde_json::json!({"verdict": "later"}),
            }),
            now(),
        );
        let snapshot = session.snapshot();
        assert!(snapshot.completed);
        assert_eq!(snapshot.output, Some(serde_json::json!({"verdict": "ok"})));
    }

    #[test]
    fn actor_messages_are_appended_unvalidated() {
        let mut session = TaskSession::new("task-a");
        route_message(
            &mut session,
            CONN,
            ChannelMsg::AiMessage(ActorMessage {
                actor: "deepseek".to_string(),
                content: "cross-checking".to_string(),
                ts: None,
            }),
            now(),
        );
        assert_eq!(session.snapshot().messages.len(), 1);
    }
}
