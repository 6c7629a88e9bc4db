//! Session control messages.
//!
//! ```text
//! leader                               follower
//!   | -- Initiate (every 15s) ----------> |   subscribe Start/Fail/TSS first
//!   | <---------------------------- Ready |   unicast to the Initiate sender
//!   |   ready(ready_set)?                 |
//!   | -- Start { params } --------------> |
//!   | <======== TSS rounds ============> |
//!   | <-------------- Fail { reason } --- |   any peer may abort
//! ```

use serde::{Deserialize, Serialize};
use threshold_types::MessageType;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionMessage {
    Initiate,
    Ready,
    Start { params: Vec<u8> },
    Fail { reason: String },
}

impl SessionMessage {
    pub fn msg_type(&self) -> MessageType {
        match self {
            SessionMessage::Initiate => MessageType::TssInitiateMsg,
            SessionMessage::Ready => MessageType::TssReadyMsg,
            SessionMessage::Start { .. } => MessageType::TssStartMsg,
            SessionMessage::Fail { .. } => MessageType::TssFailMsg,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

/// Envelope for MPC round traffic. `broadcast` tells the receiving party
/// how the sender routed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TssWire {
    pub broadcast: bool,
    pub data: Vec<u8>,
}

impl TssWire {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}
