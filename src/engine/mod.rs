//! Boundary of the negotiation engine: the component producing session descriptions, gathering
//! ICE candidates and carrying the actual data channels. [rtc::WebrtcEngineFactory] is the
//! production implementation.

pub mod rtc;

#[cfg(test)]
pub(crate) mod testing;

use crate::config::RtcConfig;
use crate::description::DescriptionResolver;
use crate::error::Error;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[async_trait]
pub trait EngineFactory: Send + Sync {
    /// Creates a new engine connection reporting its events to `observer`.
    async fn create(
        &self,
        config: &RtcConfig,
        observer: Arc<dyn EngineObserver>,
    ) -> Result<Arc<dyn NegotiationEngine>, Error>;
}

/// A single peer connection as seen by the signaling core.
///
/// Description operations complete through a [DescriptionResolver] handed over with the
/// request. Implementations must resolve every resolver they receive (or drop it, which the
/// waiting side observes as a failure).
#[async_trait]
pub trait NegotiationEngine: Send + Sync {
    fn create_offer(&self, resolver: DescriptionResolver<SessionDescription>);

    fn create_answer(&self, resolver: DescriptionResolver<SessionDescription>);

    fn set_local_description(&self, desc: SessionDescription, resolver: DescriptionResolver<()>);

    fn set_remote_description(&self, desc: SessionDescription, resolver: DescriptionResolver<()>);

    async fn local_description(&self) -> Option<SessionDescription>;

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), Error>;

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn EngineChannel>, Error>;

    async fn close(&self) -> Result<(), Error>;
}

/// Engine-side events. Callbacks must return quickly, they run on engine tasks.
pub trait EngineObserver: Send + Sync {
    fn on_connection_state_change(&self, state: PeerState);

    fn on_ice_candidate(&self, candidate: IceCandidate);

    fn on_ice_gathering_state_change(&self, state: GatheringState);

    fn on_data_channel(&self, channel: Arc<dyn EngineChannel>);
}

#[async_trait]
pub trait EngineChannel: Send + Sync {
    fn label(&self) -> &str;

    fn state(&self) -> EngineChannelState;

    /// Replaces any previously registered observer.
    fn register_observer(&self, observer: Arc<dyn EngineChannelObserver>);

    fn unregister_observer(&self);

    async fn send(&self, data: Bytes) -> Result<(), Error>;

    async fn close(&self) -> Result<(), Error>;
}

pub trait EngineChannelObserver: Send + Sync {
    fn on_state_change(&self, state: EngineChannelState);

    fn on_message(&self, data: Bytes);
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        SessionDescription {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        SessionDescription {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GatheringState {
    New,
    Gathering,
    Complete,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EngineChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}
