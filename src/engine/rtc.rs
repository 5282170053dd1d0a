use crate::config::RtcConfig;
use crate::description::DescriptionResolver;
use crate::engine::{
    EngineChannel, EngineChannelObserver, EngineChannelState, EngineFactory, EngineObserver,
    GatheringState, IceCandidate, NegotiationEngine, PeerState, SdpType, SessionDescription,
};
use crate::error::Error;
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Weak};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Creates [RTCPeerConnection]s backed engines, one shared webrtc-rs [API] per factory.
pub struct WebrtcEngineFactory {
    api: API,
}

impl WebrtcEngineFactory {
    pub fn new() -> Result<Self, Error> {
        // Create a MediaEngine object to configure the supported codec
        let mut media_engine = MediaEngine::default();

        // Register default codecs
        media_engine.register_default_codecs()?;

        // Create a InterceptorRegistry. This is the user configurable RTP/RTCP Pipeline.
        let mut registry = Registry::new();

        // Use the default set of Interceptors
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(WebrtcEngineFactory { api })
    }
}

impl std::fmt::Debug for WebrtcEngineFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebrtcEngineFactory").finish()
    }
}

#[async_trait]
impl EngineFactory for WebrtcEngineFactory {
    async fn create(
        &self,
        config: &RtcConfig,
        observer: Arc<dyn EngineObserver>,
    ) -> Result<Arc<dyn NegotiationEngine>, Error> {
        let pc = Arc::new(self.api.new_peer_connection(rtc_configuration(config)).await?);

        {
            let observer = Arc::downgrade(&observer);
            pc.on_peer_connection_state_change(Box::new(move |s| {
                if let Some(observer) = observer.upgrade() {
                    let state = match s {
                        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
                            PeerState::New
                        }
                        RTCPeerConnectionState::Connecting => PeerState::Connecting,
                        RTCPeerConnectionState::Connected => PeerState::Connected,
                        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
                        RTCPeerConnectionState::Failed => PeerState::Failed,
                        RTCPeerConnectionState::Closed => PeerState::Closed,
                    };
                    observer.on_connection_state_change(state);
                }
                Box::pin(async move {})
            }));
        }
        {
            let observer = Arc::downgrade(&observer);
            pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                if let (Some(observer), Some(candidate)) = (observer.upgrade(), candidate) {
                    match candidate.to_json() {
                        Ok(init) => observer.on_ice_candidate(from_candidate_init(init)),
                        Err(e) => log::warn!("unable to serialize local candidate: {e}"),
                    }
                }
                Box::pin(async move {})
            }));
        }
        {
            let observer = Arc::downgrade(&observer);
            pc.on_ice_gathering_state_change(Box::new(move |s| {
                if let Some(observer) = observer.upgrade() {
                    match s {
                        RTCIceGathererState::New => {
                            observer.on_ice_gathering_state_change(GatheringState::New)
                        }
                        RTCIceGathererState::Gathering => {
                            observer.on_ice_gathering_state_change(GatheringState::Gathering)
                        }
                        RTCIceGathererState::Complete => {
                            observer.on_ice_gathering_state_change(GatheringState::Complete)
                        }
                        RTCIceGathererState::Unspecified | RTCIceGathererState::Closed => {}
                    }
                }
                Box::pin(async move {})
            }));
        }
        {
            let observer = Arc::downgrade(&observer);
            pc.on_data_channel(Box::new(move |dc| {
                if let Some(observer) = observer.upgrade() {
                    observer.on_data_channel(WebrtcChannel::new(dc));
                }
                Box::pin(async move {})
            }));
        }

        // the engine owns the observer, callbacks above only hold weak references to it
        Ok(Arc::new(WebrtcEngine {
            pc,
            _observer: observer,
        }))
    }
}

fn rtc_configuration(config: &RtcConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

fn from_candidate_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        server_url: None,
    }
}

fn to_candidate_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: None,
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, Error> {
    let desc = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
    };
    Ok(desc)
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription, Error> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(Error::protocol(format!("unsupported description type {other:?}"))),
    }
}

struct WebrtcEngine {
    pc: Arc<RTCPeerConnection>,
    _observer: Arc<dyn EngineObserver>,
}

impl WebrtcEngine {
    fn resolve_description<F, Fut>(&self, resolver: DescriptionResolver<SessionDescription>, f: F)
    where
        F: FnOnce(Arc<RTCPeerConnection>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<RTCSessionDescription, webrtc::Error>> + Send,
    {
        let pc = self.pc.clone();
        tokio::spawn(async move {
            match f(pc).await.map_err(Error::from).and_then(from_rtc_description) {
                Ok(desc) => resolver.success(desc),
                Err(e) => resolver.failure(e.to_string()),
            };
        });
    }
}

#[async_trait]
impl NegotiationEngine for WebrtcEngine {
    fn create_offer(&self, resolver: DescriptionResolver<SessionDescription>) {
        self.resolve_description(resolver, |pc| async move { pc.create_offer(None).await });
    }

    fn create_answer(&self, resolver: DescriptionResolver<SessionDescription>) {
        self.resolve_description(resolver, |pc| async move { pc.create_answer(None).await });
    }

    fn set_local_description(&self, desc: SessionDescription, resolver: DescriptionResolver<()>) {
        let pc = self.pc.clone();
        tokio::spawn(async move {
            let res = match to_rtc_description(desc) {
                Ok(desc) => pc.set_local_description(desc).await.map_err(Error::from),
                Err(e) => Err(e),
            };
            match res {
                Ok(()) => resolver.success(()),
                Err(e) => resolver.failure(e.to_string()),
            };
        });
    }

    fn set_remote_description(&self, desc: SessionDescription, resolver: DescriptionResolver<()>) {
        let pc = self.pc.clone();
        tokio::spawn(async move {
            let res = match to_rtc_description(desc) {
                Ok(desc) => pc.set_remote_description(desc).await.map_err(Error::from),
                Err(e) => Err(e),
            };
            match res {
                Ok(()) => resolver.success(()),
                Err(e) => resolver.failure(e.to_string()),
            };
        });
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let desc = self.pc.local_description().await?;
        from_rtc_description(desc).ok()
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), Error> {
        self.pc
            .add_ice_candidate(to_candidate_init(candidate))
            .await?;
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn EngineChannel>, Error> {
        let dc = self
            .pc
            .create_data_channel(label, Some(RTCDataChannelInit::default()))
            .await?;
        Ok(WebrtcChannel::new(dc))
    }

    async fn close(&self) -> Result<(), Error> {
        self.pc.close().await?;
        Ok(())
    }
}

struct ObserverSlot(Arc<dyn EngineChannelObserver>);

struct WebrtcChannel {
    dc: Arc<RTCDataChannel>,
    observer: Arc<ArcSwapOption<ObserverSlot>>,
}

impl WebrtcChannel {
    fn new(dc: Arc<RTCDataChannel>) -> Arc<dyn EngineChannel> {
        let observer: Arc<ArcSwapOption<ObserverSlot>> = Arc::new(ArcSwapOption::empty());
        {
            let slot = Arc::downgrade(&observer);
            dc.on_open(Box::new(move || {
                notify_state(&slot, EngineChannelState::Open);
                Box::pin(async move {})
            }));
        }
        {
            let slot = Arc::downgrade(&observer);
            dc.on_close(Box::new(move || {
                notify_state(&slot, EngineChannelState::Closed);
                Box::pin(async move {})
            }));
        }
        {
            let label = dc.label().to_owned();
            dc.on_error(Box::new(move |e| {
                log::warn!("data channel '{label}' failure: {e}");
                Box::pin(async move {})
            }));
        }
        {
            let slot = Arc::downgrade(&observer);
            dc.on_message(Box::new(move |msg| {
                if let Some(slot) = slot.upgrade() {
                    if let Some(o) = &*slot.load() {
                        o.0.on_message(msg.data);
                    }
                }
                Box::pin(async move {})
            }));
        }
        Arc::new(WebrtcChannel { dc, observer })
    }
}

fn notify_state(slot: &Weak<ArcSwapOption<ObserverSlot>>, state: EngineChannelState) {
    if let Some(slot) = slot.upgrade() {
        if let Some(o) = &*slot.load() {
            o.0.on_state_change(state);
        }
    }
}

#[async_trait]
impl EngineChannel for WebrtcChannel {
    fn label(&self) -> &str {
        self.dc.label()
    }

    fn state(&self) -> EngineChannelState {
        match self.dc.ready_state() {
            RTCDataChannelState::Open => EngineChannelState::Open,
            RTCDataChannelState::Closing => EngineChannelState::Closing,
            RTCDataChannelState::Closed => EngineChannelState::Closed,
            RTCDataChannelState::Unspecified | RTCDataChannelState::Connecting => {
                EngineChannelState::Connecting
            }
        }
    }

    fn register_observer(&self, observer: Arc<dyn EngineChannelObserver>) {
        self.observer.store(Some(Arc::new(ObserverSlot(observer))));
    }

    fn unregister_observer(&self) {
        self.observer.store(None);
    }

    async fn send(&self, data: Bytes) -> Result<(), Error> {
        self.dc.send(&data).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.dc.close().await?;
        Ok(())
    }
}
