use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use taskpulse_core::{ActorMessage, ConnectionStatus, CostSnapshot, ProgressEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Admitted,
    MissingSequence,
    Duplicate,
    ForeignTask,
    AfterCompletion,
}

pub(crate) struct TaskSession {
    task_id: String,
    connection: ConnectionStatus,
    joined: bool,
    initial_resync_done: bool,
    reconnect_exhausted: bool,
    admitted: HashSet<String>,
    history: Vec<ProgressEvent>,
    messages: Vec<ActorMessage>,
    cost: Option<CostSnapshot>,
    completed: bool,
    output: Option<Value>,
    last_error: Option<String>,
    last_event_at: Option<DateTime<Utc>>,
}

impl TaskSession {
    pub(crate) fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            connection: ConnectionStatus::Connecting,
            joined: false,
            initial_resync_done: false,
            reconnect_exhausted: false,
            admitted: HashSet::new(),
            history: Vec::new(),
            messages: Vec::new(),
            cost: None,
            completed: false,
            output: None,
            last_error: None,
            last_event_at: None,
        }
    }

    pub(crate) fn task_id(&self) -> &str {
        &self.task_id
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.completed
    }

    fn dedup_key(&self, sequence_id: u64) -> String {
        format!("{}#{}", self.task_id, sequence_id)
    }

    fn history_contains(&self, sequence_id: u64) -> bool {
        self.history
            .binary_search_by_key(&Some(sequence_id), |event| event.sequence_id)
            .is_ok()
    }

    pub(crate) fn admit_progress(&mut self, event: ProgressEvent, now: DateTime<Utc>) -> Admission {
        if self.completed {
            return Admission::AfterCompletion;
        }
        if let Some(task_id) = event.task_id.as_deref() {
            if task_id != self.task_id {
                return Admission::ForeignTask;
            }
        }
        let Some(sequence_id) = event.sequence_id else {
            return Admission::MissingSequence;
        };
        let key = self.dedup_key(sequence_id);
        if self.admitted.contains(&key) {
            return Admission::Duplicate;
        }
        // The index is cleared on disconnect, the history is not; a resync
        // overlapping retained history must not duplicate it.
        if self.history_contains(sequence_id) {
            self.admitted.insert(key);
            return Admission::Duplicate;
        }
        self.admitted.insert(key);
        let at = self
            .history
            .partition_point(|existing| existing.sequence_id <= Some(sequence_id));
        self.history.insert(at, event);
        self.last_event_at = Some(now);
        Admission::Admitted
    }

    pub(crate) fn merge_resync(
        &mut self,
        records: Vec<ProgressEvent>,
        now: DateTime<Utc>,
    ) -> (usize, usize) {
        let total = records.len();
        let mut admitted = 0usize;
        for record in records {
            if self.admit_progress(record, now) == Admission::Admitted {
                admitted += 1;
            }
        }
        self.initial_resync_done = true;
        (admitted, total - admitted)
    }

    pub(crate) fn push_message(&mut self, message: ActorMessage, now: DateTime<Utc>) {
        self.messages.push(message);
        self.last_event_at = Some(now);
    }

    pub(crate) fn apply_cost(&mut self, snapshot: CostSnapshot, now: DateTime<Utc>) -> bool {
        if self.completed {
            return false;
        }
        self.cost = Some(snapshot);
        self.last_event_at = Some(now);
        true
    }

    pub(crate) fn complete(&mut self, output: Value, now: DateTime<Utc>) -> bool {
        if self.completed {
            return false;
        }
        self.completed = true;
        self.output = Some(output);
        self.admitted.clear();
        self.last_event_at = Some(now);
        true
    }

    pub(crate) fn connect_started(&mut self) {
        self.connection = ConnectionStatus::Connecting;
    }

    pub(crate) fn channel_opened(&mut self) {
        self.connection = ConnectionStatus::Connected;
        self.joined = true;
        self.reconnect_exhausted = false;
    }

    pub(crate) fn channel_closed(&mut self) {
        self.connection = ConnectionStatus::Disconnected;
        self.joined = false;
        self.admitted.clear();
    }

    pub(crate) fn reconnect_gave_up(&mut self, attempts: u32) {
        self.connection = ConnectionStatus::Disconnected;
        self.reconnect_exhausted = true;
        self.last_error = Some(format!("channel reconnect gave up after {attempts} attempts"));
    }

    pub(crate) fn note_error(&mut self, error: String) {
        self.last_error = Some(error);
    }

    pub(crate) fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.task_id.clone(),
            connection: self.connection,
            joined: self.joined,
            initial_resync_done: self.initial_resync_done,
            reconnect_exhausted: self.reconnect_exhausted,
            history: self.history.clone(),
            messages: self.messages.clone(),
            cost: self.cost.clone(),
            completed: self.completed,
            output: self.output.clone(),
            last_error: self.last_error.clone(),
            last_event_at: self.last_event_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub connection: ConnectionStatus,
    pub joined: bool,
    pub initial_resync_done: bool,
    pub reconnect_exhausted: bool,
    pub history: Vec<ProgressEvent>,
    pub messages: Vec<ActorMessage>,
    pub cost: Option<CostSnapshot>,
    pub completed: bool,
    pub output: Option<Value>,
    pub last_error: Option<String>,
    pub last_event_at: Option<DateTime<Utc>>,
}

impl TaskSnapshot {
    pub fn latest(&self) -> Option<&ProgressEvent> {
        self.history.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).single().expect("timestamp")
    }

    fn progress(seq: u64) -> ProgressEvent {
        ProgressEvent {
            phase: "analysis".to_string(),
            progress: seq as f64 * 10.0,
            message: format!("step {seq}"),
            ts: None,
            sequence_id: Some(seq),
            task_id: Some("task-a".to_string()),
        }
    }

    fn seqs(session: &TaskSession) -> Vec<u64> {
        session
            .history
            .iter()
            .filter_map(|event| event.sequence_id)
            .collect()
    }

    #[test]
    fn orders_by_sequence_regardless_of_arrival() {
        let mut session = TaskSession::new("task-a");
        for seq in [2, 1, 3] {
            assert_eq!(session.admit_progress(progress(seq), ts(0)), Admission::Admitted);
        }
        assert_eq!(seqs(&session), vec![1, 2, 3]);
        let snapshot = session.snapshot();
        assert_eq!(snapshot.latest().and_then(|e| e.sequence_id), Some(3));
    }

    #[test]
    fn latest_is_tail_of_sorted_history_not_newest_arrival() {
        let mut session = TaskSession::new("task-a");
        session.admit_progress(progress(5), ts(0));
        session.admit_progress(progress(2), ts(1));
        assert_eq!(seqs(&session), vec![2, 5]);
        let snapshot = session.snapshot();
        assert_eq!(snapshot.latest().and_then(|e| e.sequence_id), Some(5));
    }

    #[test]
    fn same_sequence_is_admitted_once() {
        let mut session = TaskSession::new("task-a");
        assert_eq!(session.admit_progress(progress(1), ts(0)), Admission::Admitted);
        assert_eq!(session.admit_progress(progress(1), ts(1)), Admission::Duplicate);
        assert_eq!(session.history.len(), 1);

        let (admitted, skipped) = session.merge_resync(vec![progress(1), progress(2)], ts(2));
        assert_eq!((admitted, skipped), (1, 1));
        assert_eq!(seqs(&session), vec![1, 2]);
    }

    #[test]
    fn missing_sequence_is_rejected() {
        let mut session = TaskSession::new("task-a");
        let mut event = progress(1);
        event.sequence_id = None;
        assert_eq!(session.admit_progress(event, ts(0)), Admission::MissingSequence);
        assert!(session.history.is_empty());
        assert!(session.last_event_at.is_none());
    }

    #[test]
    fn foreign_task_id_is_rejected() {
        let mut session = TaskSession::new("task-a");
        let mut event = progress(1);
        event.task_id = Some("task-b".to_string());
        assert_eq!(session.admit_progress(event, ts(0)), Admission::ForeignTask);
        assert!(session.history.is_empty());
    }

    #[test]
    fn event_without_task_id_counts_for_the_subscription() {
        let mut session = TaskSession::new("task-a");
        let mut event = progress(1);
        event.task_id = None;
        assert_eq!(session.admit_progress(event, ts(0)), Admission::Admitted);
        assert_eq!(seqs(&session), vec![1]);
    }

    #[test]
    fn resync_after_disconnect_closes_gap_without_duplicates() {
        let mut session = TaskSession::new("task-a");
        for seq in [1, 2, 3] {
            session.admit_progress(progress(seq), ts(0));
        }
        session.channel_closed();
        session.channel_opened();
        let (admitted, skipped) =
            session.merge_resync(vec![progress(3), progress(4), progress(5)], ts(1));
        assert_eq!((admitted, skipped), (2, 1));
        assert_eq!(seqs(&session), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn cleared_index_still_rejects_replayed_events() {
        let mut session = TaskSession::new("task-a");
        session.admit_progress(progress(7), ts(0));
        session.channel_closed();
        assert!(session.admitted.is_empty());
        assert_eq!(session.admit_progress(progress(7), ts(1)), Admission::Duplicate);
        assert_eq!(session.history.len(), 1);
        assert!(session.admitted.contains("task-a#7"));
    }

    #[test]
    fn disconnect_resets_connection_and_join_flags() {
        let mut session = TaskSession::new("task-a");
        session.channel_opened();
        assert_eq!(session.connection, ConnectionStatus::Connected);
        assert!(session.joined);
        session.channel_closed();
        assert_eq!(session.connection, ConnectionStatus::Disconnected);
        assert!(!session.joined);
    }

    #[test]
    fn completion_is_exactly_once() {
        let mut session = TaskSession::new("task-a");
        session.admit_progress(progress(1), ts(0));
        let first = serde_json::json!({"verdict": "ok"});
        let second = serde_json::json!({"verdict": "overwritten"});
        assert!(session.complete(first.clone(), ts(1)));
        assert!(!session.complete(second, ts(2)));
        assert!(session.is_complete());
        assert_eq!(session.snapshot().output, Some(first));
    }

    #[test]
    fn terminal_session_ignores_late_events() {
        let mut session = TaskSession::new("task-a");
        session.complete(Value::Null, ts(0));
        assert_eq!(session.admit_progress(progress(1), ts(1)), Admission::AfterCompletion);
        assert!(session.history.is_empty());
        assert!(!session.apply_cost(CostSnapshot::default(), ts(2)));
        assert!(session.cost.is_none());
    }

    #[test]
    fn merge_resync_marks_initial_resync_done_even_when_empty() {
        let mut session = TaskSession::new("task-a");
        assert!(!session.initial_resync_done);
        session.merge_resync(Vec::new(), ts(0));
        assert!(session.initial_resync_done);
    }

    #[test]
    fn reconnect_exhaustion_surfaces_degraded_state() {
        let mut session = TaskSession::new("task-a");
        session.channel_opened();
        session.channel_closed();
        session.reconnect_gave_up(20);
        let snapshot = session.snapshot();
        assert_eq!(snapshot.connection, ConnectionStatus::Disconnected);
        assert!(snapshot.reconnect_exhausted);
        assert!(snapshot.last_error.is_some());
        session.channel_opened();
        assert!(!session.snapshot().reconnect_exhausted);
    }

    #[test]
    fn cost_snapshot_is_replaced_not_merged() {
        let mut session = TaskSession::new("task-a");
        let first = CostSnapshot {
            current_cost: 1.0,
            ..CostSnapshot::default()
        };
        let second = CostSnapshot {
            current_cost: 2.5,
            ..CostSnapshot::default()
        };
        assert!(session.apply_cost(first, ts(0)));
        assert!(session.apply_cost(second.clone(), ts(1)));
        assert_eq!(session.cost, Some(second));
    }

    #[test]
    fn actor_messages_append_without_dedup() {
        let mut session = TaskSession::new("task-a");
        let note = ActorMessage {
            actor: "kimi".to_string(),
            content: "reviewing output".to_string(),
            ts: None,
        };
        session.push_message(note.clone(), ts(0));
        session.push_message(note, ts(1));
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.last_event_at, Some(ts(1)));
    }
}
