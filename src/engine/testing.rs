//! Scripted engine used by unit tests: descriptions resolve immediately, every local
//! description yields one candidate followed by gathering completion.

use crate::config::RtcConfig;
use crate::description::DescriptionResolver;
use crate::engine::{
    EngineChannel, EngineChannelObserver, EngineChannelState, EngineFactory, EngineObserver,
    GatheringState, IceCandidate, NegotiationEngine, PeerState, SdpType, SessionDescription,
};
use crate::error::Error;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub(crate) struct MockEngineFactory {
    fail_offer: AtomicBool,
    stall_offer: AtomicBool,
    engines: Mutex<Vec<Arc<MockEngine>>>,
}

impl MockEngineFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every engine created from now on rejects offer creation.
    pub fn failing_offers(self: Arc<Self>) -> Arc<Self> {
        self.fail_offer.store(true, Ordering::SeqCst);
        self
    }

    /// Every engine created from now on keeps offer requests pending until it is closed.
    pub fn stalled_offers(self: Arc<Self>) -> Arc<Self> {
        self.stall_offer.store(true, Ordering::SeqCst);
        self
    }

    pub fn engine(&self, i: usize) -> Option<Arc<MockEngine>> {
        self.engines.lock().unwrap().get(i).cloned()
    }
}

#[async_trait]
impl EngineFactory for MockEngineFactory {
    async fn create(
        &self,
        _config: &RtcConfig,
        observer: Arc<dyn EngineObserver>,
    ) -> Result<Arc<dyn NegotiationEngine>, Error> {
        let engine = Arc::new(MockEngine {
            observer,
            fail_offer: self.fail_offer.load(Ordering::SeqCst),
            stall_offer: self.stall_offer.load(Ordering::SeqCst),
            stalled: Mutex::new(Vec::new()),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.engines.lock().unwrap().push(engine.clone());
        Ok(engine)
    }
}

pub(crate) struct MockEngine {
    observer: Arc<dyn EngineObserver>,
    fail_offer: bool,
    stall_offer: bool,
    stalled: Mutex<Vec<DescriptionResolver<SessionDescription>>>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    channels: Mutex<Vec<Arc<MockChannel>>>,
    closed: AtomicBool,
}

impl MockEngine {
    pub fn remote(&self) -> Option<SessionDescription> {
        self.remote.lock().unwrap().clone()
    }

    /// Remote candidates applied so far.
    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().unwrap().clone()
    }

    pub fn channels(&self) -> Vec<Arc<MockChannel>> {
        self.channels.lock().unwrap().clone()
    }

    pub fn has_stalled_offer(&self) -> bool {
        !self.stalled.lock().unwrap().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn emit_state(&self, state: PeerState) {
        self.observer.on_connection_state_change(state);
    }

    /// Simulates a channel opened by the remote peer.
    pub fn open_remote_channel(&self, label: &str) -> Arc<MockChannel> {
        let channel = MockChannel::new(label);
        self.observer.on_data_channel(channel.clone());
        channel
    }
}

pub(crate) fn mock_candidate(sdp_type: SdpType) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{sdp_type:?} 1 udp 2130706431 127.0.0.1 50000 typ host"),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        server_url: None,
    }
}

#[async_trait]
impl NegotiationEngine for MockEngine {
    fn create_offer(&self, resolver: DescriptionResolver<SessionDescription>) {
        if self.stall_offer {
            self.stalled.lock().unwrap().push(resolver);
        } else if self.fail_offer {
            resolver.failure("offer rejected by engine");
        } else {
            resolver.success(SessionDescription::offer("v=0 mock-offer"));
        }
    }

    fn create_answer(&self, resolver: DescriptionResolver<SessionDescription>) {
        match &*self.remote.lock().unwrap() {
            Some(remote) if remote.sdp_type == SdpType::Offer => {
                resolver.success(SessionDescription::answer("v=0 mock-answer"));
            }
            _ => {
                resolver.failure("no remote offer to answer");
            }
        }
    }

    fn set_local_description(&self, desc: SessionDescription, resolver: DescriptionResolver<()>) {
        let sdp_type = desc.sdp_type;
        *self.local.lock().unwrap() = Some(desc);
        resolver.success(());
        self.observer.on_ice_candidate(mock_candidate(sdp_type));
        self.observer
            .on_ice_gathering_state_change(GatheringState::Complete);
    }

    fn set_remote_description(&self, desc: SessionDescription, resolver: DescriptionResolver<()>) {
        if desc.sdp.is_empty() {
            resolver.failure("empty session description");
            return;
        }
        *self.remote.lock().unwrap() = Some(desc);
        resolver.success(());
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().unwrap().clone()
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), Error> {
        self.candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn EngineChannel>, Error> {
        let channel = MockChannel::new(label);
        self.channels.lock().unwrap().push(channel.clone());
        Ok(channel)
    }

    async fn close(&self) -> Result<(), Error> {
        // pending requests are dropped unresolved
        self.stalled.lock().unwrap().clear();
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.observer.on_connection_state_change(PeerState::Closed);
        }
        Ok(())
    }
}

pub(crate) struct MockChannel {
    label: String,
    state: Mutex<EngineChannelState>,
    observer: Mutex<Option<Arc<dyn EngineChannelObserver>>>,
    sent: Mutex<Vec<Bytes>>,
    closes: AtomicUsize,
    open_on_register: AtomicBool,
}

impl MockChannel {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(MockChannel {
            label: label.to_owned(),
            state: Mutex::new(EngineChannelState::Connecting),
            observer: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            open_on_register: AtomicBool::new(false),
        })
    }

    /// The next observer registration races with the channel opening: the state flips to
    /// `Open` before the observer is stored, so no notification reaches it.
    pub fn open_on_register(&self) {
        self.open_on_register.store(true, Ordering::SeqCst);
    }

    pub fn set_state(&self, state: EngineChannelState) {
        *self.state.lock().unwrap() = state;
        let observer = self.observer.lock().unwrap().clone();
        if let Some(observer) = observer {
            observer.on_state_change(state);
        }
    }

    pub fn receive(&self, data: Bytes) {
        let observer = self.observer.lock().unwrap().clone();
        if let Some(observer) = observer {
            observer.on_message(data);
        }
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap().clone()
    }

    pub fn close_calls(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn has_observer(&self) -> bool {
        self.observer.lock().unwrap().is_some()
    }
}

#[async_trait]
impl EngineChannel for MockChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn state(&self) -> EngineChannelState {
        *self.state.lock().unwrap()
    }

    fn register_observer(&self, observer: Arc<dyn EngineChannelObserver>) {
        if self.open_on_register.swap(false, Ordering::SeqCst) {
            self.set_state(EngineChannelState::Open);
        }
        *self.observer.lock().unwrap() = Some(observer);
    }

    fn unregister_observer(&self) {
        self.observer.lock().unwrap().take();
    }

    async fn send(&self, data: Bytes) -> Result<(), Error> {
        if self.state() != EngineChannelState::Open {
            return Err(Error::channel_closed());
        }
        self.sent.lock().unwrap().push(data);
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.set_state(EngineChannelState::Closed);
        Ok(())
    }
}
