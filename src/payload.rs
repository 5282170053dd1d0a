//! Wire format of the messages exchanged through signaling transports.

use crate::engine::{IceCandidate, SdpType, SessionDescription};
use crate::error::Error;
use serde::{Deserialize, Serialize};

/// A single negotiation message. Serialized as a JSON object tagged by its `type` field, which
/// keeps description payloads (`offer`/`answer`) apart from everything else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum NegotiationPayload {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    Candidate {
        candidate: IceCandidate,
    },
    #[serde(rename_all = "camelCase")]
    RoomReady {
        room_id: String,
        leader_id: String,
    },
    TrickleReady {
        code: String,
    },
    /// Outcome of a negotiation round, reported back to the peer which started it.
    Result(NegotiationResult),
}

impl NegotiationPayload {
    pub fn description(desc: SessionDescription) -> Self {
        match desc.sdp_type {
            SdpType::Offer => NegotiationPayload::Offer { sdp: desc.sdp },
            SdpType::Answer => NegotiationPayload::Answer { sdp: desc.sdp },
        }
    }

    pub fn into_description(self) -> Option<SessionDescription> {
        match self {
            NegotiationPayload::Offer { sdp } => Some(SessionDescription::offer(sdp)),
            NegotiationPayload::Answer { sdp } => Some(SessionDescription::answer(sdp)),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            NegotiationPayload::Offer { .. } => "offer",
            NegotiationPayload::Answer { .. } => "answer",
            NegotiationPayload::Candidate { .. } => "candidate",
            NegotiationPayload::RoomReady { .. } => "room-ready",
            NegotiationPayload::TrickleReady { .. } => "trickle-ready",
            NegotiationPayload::Result(_) => "result",
        }
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, Error> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_value(&self) -> Result<serde_json::Value, Error> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Bundled description as carried by host-bus actions: `{"description": {"type", "sdp"}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptionEnvelope {
    pub description: SessionDescription,
}

/// `{status, message?}` result of processing an offer or an answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationResult {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl NegotiationResult {
    pub const OK: u16 = 200;
    pub const FAILED: u16 = 500;

    pub fn ok() -> Self {
        NegotiationResult {
            status: Self::OK,
            message: None,
        }
    }

    pub fn failed(error: &Error) -> Self {
        NegotiationResult {
            status: Self::FAILED,
            message: Some(error.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Self::OK
    }
}

impl From<Result<(), Error>> for NegotiationResult {
    fn from(value: Result<(), Error>) -> Self {
        match value {
            Ok(()) => NegotiationResult::ok(),
            Err(e) => NegotiationResult::failed(&e),
        }
    }
}
