use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use std::fmt;

use crate::blockchain::crypto::{PeerId, SignatureRecord};
use crate::consensus::messages::{
    FinalizationMessage, ProposalMessage, SignedMessage, SyncRequestMessage, SyncResponseMessage,
    VoteMessage,
};

/// First frame on every connection
///
/// The initiator picks the session id and the responder echoes it back.
/// Both sides sign the session id, so a peer id cannot be claimed without
/// its key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub peer_id: PeerId,
    pub session_id: String,
    pub timestamp: u64,
    pub signature: SignatureRecord,
}

impl SignedMessage for Handshake {
    const KIND: &'static str = "handshake";

    fn signing_bytes(&self) -> Vec<u8> {
        json!({
            "peerId": self.peer_id,
            "sessionId": self.session_id,
            "timestamp": self.timestamp,
        })
        .to_string()
        .into_bytes()
    }

    fn signature(&self) -> &SignatureRecord {
        &self.signature
    }

    fn claimed_signer(&self) -> Option<&PeerId> {
        Some(&self.peer_id)
    }
}

/// Body of `ping` and `pong`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub timestamp: u64,
}

/// Periodic self-announcement of a peer's listening port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Discovery {
    pub peer_id: PeerId,
    pub port: u16,
    pub timestamp: u64,
}

/// Every frame exchanged between peers, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Handshake(Handshake),
    Ping(Heartbeat),
    Pong(Heartbeat),
    Discovery(Discovery),
    ProposeBlock(ProposalMessage),
    CastVote(VoteMessage),
    FinalizeBlock(FinalizationMessage),
    SyncRequest(SyncRequestMessage),
    SyncResponse(SyncResponseMessage),
}

/// The `type` of a known message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Handshake,
    Ping,
    Pong,
    Discovery,
    ProposeBlock,
    CastVote,
    FinalizeBlock,
    SyncRequest,
    SyncResponse,
}

impl MessageKind {
    pub const ALL: [MessageKind; 9] = [
        MessageKind::Handshake,
        MessageKind::Ping,
        MessageKind::Pong,
        MessageKind::Discovery,
        MessageKind::ProposeBlock,
        MessageKind::CastVote,
        MessageKind::FinalizeBlock,
        MessageKind::SyncRequest,
        MessageKind::SyncResponse,
    ];

    /// Consensus kinds, routed to the node instead of the transport
    pub const CONSENSUS: [MessageKind; 5] = [
        MessageKind::ProposeBlock,
        MessageKind::CastVote,
        MessageKind::FinalizeBlock,
        MessageKind::SyncRequest,
        MessageKind::SyncResponse,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Handshake => "handshake",
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::Discovery => "discovery",
            MessageKind::ProposeBlock => "propose_block",
            MessageKind::CastVote => "cast_vote",
            MessageKind::FinalizeBlock => "finalize_block",
            MessageKind::SyncRequest => "sync_request",
            MessageKind::SyncResponse => "sync_response",
        }
    }

    /// Looks up a wire `type`, `None` for types this node does not know
    pub fn parse(kind: &str) -> Option<MessageKind> {
        MessageKind::ALL
            .iter()
            .copied()
            .find(|candidate| candidate.as_str() == kind)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Handshake(_) => MessageKind::Handshake,
            Message::Ping(_) => MessageKind::Ping,
            Message::Pong(_) => MessageKind::Pong,
            Message::Discovery(_) => MessageKind::Discovery,
            Message::ProposeBlock(_) => MessageKind::ProposeBlock,
            Message::CastVote(_) => MessageKind::CastVote,
            Message::FinalizeBlock(_) => MessageKind::FinalizeBlock,
            Message::SyncRequest(_) => MessageKind::SyncRequest,
            Message::SyncResponse(_) => MessageKind::SyncResponse,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A routed message and the peer it came from
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub peer_id: PeerId,
    pub message: Message,
}

/// A well-formed frame no handler claimed
#[derive(Debug, Clone, PartialEq)]
pub struct Unhandled {
    pub peer_id: PeerId,
    pub kind: String,
    pub body: Value,
}
