pub mod cost;
pub mod wire;

use serde::{Deserialize, Serialize};

pub use cost::{sanitize_cost_update, CostSnapshot, CostUpdatePayload};
pub use wire::{
    decode_msg, encode_msg, ActorMessage, ChannelMsg, CompletionPayload, ErrorPayload,
    JoinTaskPayload, JoinedPayload, ProgressEvent, WireError, MAX_FRAME_BYTES,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
