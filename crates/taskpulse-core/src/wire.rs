use crate::cost::CostUpdatePayload;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MAX_FRAME_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ChannelMsg {
    JoinTask(JoinTaskPayload),
    Joined(JoinedPayload),
    Progress(ProgressEvent),
    AiMessage(ActorMessage),
    CostUpdate(CostUpdatePayload),
    Complete(CompletionPayload),
    Error(ErrorPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinTaskPayload {
    pub task_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinedPayload {
    #[serde(default)]
    pub task_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEvent {
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub ts: Option<f64>,
    #[serde(default)]
    pub sequence_id: Option<u64>,
    #[serde(default)]
    pub task_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActorMessage {
    #[serde(default)]
    pub actor: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub ts: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionPayload {
    #[serde(default)]
    pub output: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("frame exceeds maximum size of {MAX_FRAME_BYTES} bytes")]
    OversizedFrame,
    #[error("failed to encode message: {0}")]
    Encode(serde_json::Error),
    #[error("failed to decode message: {0}")]
    Decode(serde_json::Error),
}

pub fn encode_msg(msg: &ChannelMsg) -> Result<String, WireError> {
    let text = serde_json::to_string(msg).map_err(WireError::Encode)?;
    if text.len() > MAX_FRAME_BYTES {
        return Err(WireError::OversizedFrame);
    }
    Ok(text)
}

pub fn decode_msg(raw: &str) -> Result<ChannelMsg, WireError> {
    if raw.len() > MAX_FRAME_BYTES {
        return Err(WireError::OversizedFrame);
    }
    serde_json::from_str(raw).map_err(WireError::Decode)
}
