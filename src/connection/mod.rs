mod bus;
mod relay;

pub(crate) use bus::BusNegotiator;
pub(crate) use relay::RelayNegotiator;

pub use bus::{bus_channel_name, ANSWER_ACTION, OFFER_ACTION};

use crate::channel::Channel;
use crate::config::{Configuration, RtcConfig, Strategy};
use crate::description::description_future;
use crate::engine::{
    EngineChannel, EngineFactory, EngineObserver, GatheringState, IceCandidate,
    NegotiationEngine, PeerState, SdpType, SessionDescription,
};
use crate::error::Error;
use crate::listener::{ConnectionListener, Dispatcher, Listeners};
use arc_swap::{ArcSwap, ArcSwapOption};
use std::collections::HashMap;
use std::fmt::Formatter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Mutex, Notify};
use tokio_util::sync::CancellationToken;

/// Lifecycle of a [Connection]. Listeners are only notified about `Open`, `Disconnected`,
/// `Closed` and `Failed`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Negotiating,
    Open,
    /// Not terminal: the engine may recover and report `Open` again.
    Disconnected,
    Closed,
    /// Initial negotiation failed.
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

#[derive(Debug, Clone)]
enum Status {
    Created,
    Negotiating,
    Open,
    Disconnected,
    Closed,
    Failed(Error),
}

impl Status {
    fn state(&self) -> ConnectionState {
        match self {
            Status::Created => ConnectionState::Created,
            Status::Negotiating => ConnectionState::Negotiating,
            Status::Open => ConnectionState::Open,
            Status::Disconnected => ConnectionState::Disconnected,
            Status::Closed => ConnectionState::Closed,
            Status::Failed(_) => ConnectionState::Failed,
        }
    }
}

/// Strategy specific part of a connection: how negotiation payloads reach the peer and how
/// local candidates are handled.
pub(crate) enum Negotiator {
    Relay(RelayNegotiator),
    HostBus(BusNegotiator),
}

struct EngineHandle(Arc<dyn NegotiationEngine>);

/// A negotiated peer-to-peer session carrying any number of named [Channel]s.
///
/// Created by [crate::ConnectionFactory]. Register listeners before calling
/// [Connection::initialize], negotiation progress is reported through them.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

pub(crate) struct ConnectionInner {
    config: Configuration,
    default_channel_name: String,
    engines: Arc<dyn EngineFactory>,
    engine: ArcSwapOption<EngineHandle>,
    status: ArcSwap<Status>,
    status_changed: Notify,
    channels: ArcSwap<HashMap<String, Channel>>,
    default_channel: ArcSwapOption<Channel>,
    /// Remote candidates received before the remote description was applied.
    pending_candidates: Mutex<Vec<IceCandidate>>,
    remote_applied: AtomicBool,
    gathered: watch::Sender<bool>,
    listeners: Listeners<dyn ConnectionListener>,
    dispatcher: Dispatcher,
    negotiator: Negotiator,
    initialized: AtomicBool,
    closing: AtomicBool,
    shutdown: CancellationToken,
}

impl Connection {
    /// Must be called within a tokio runtime.
    pub(crate) fn new(
        config: Configuration,
        engines: Arc<dyn EngineFactory>,
        negotiator: Negotiator,
    ) -> Self {
        log::debug!(
            "created connection with default channel {}",
            config.default_channel_name()
        );
        let (gathered, _) = watch::channel(false);
        Connection {
            inner: Arc::new(ConnectionInner {
                default_channel_name: config.default_channel_name(),
                config,
                engines,
                engine: ArcSwapOption::empty(),
                status: ArcSwap::from_pointee(Status::Created),
                status_changed: Notify::new(),
                channels: ArcSwap::from_pointee(HashMap::new()),
                default_channel: ArcSwapOption::empty(),
                pending_candidates: Mutex::new(Vec::new()),
                remote_applied: AtomicBool::new(false),
                gathered,
                listeners: Listeners::new(),
                dispatcher: Dispatcher::spawn(),
                negotiator,
                initialized: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Starts strategy specific setup. Returns once the local side is set up (relay preflight
    /// and socket, or engine and host-bus channel); the handshake itself completes in the
    /// background and is observed through [ConnectionListener]s.
    pub async fn initialize(&self) -> Result<(), Error> {
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            return Err(Error::protocol("connection has already been initialized"));
        }
        log::debug!("initializing connection {}", self.pairing_code());
        let res = match &self.inner.negotiator {
            Negotiator::Relay(relay) => relay.initialize(&self.inner).await,
            Negotiator::HostBus(bus) => bus.initialize(&self.inner).await,
        };
        if let Err(e) = &res {
            self.inner.fail(e.clone());
        }
        res
    }

    pub fn pairing_code(&self) -> &str {
        self.inner.config.pairing_code()
    }

    pub fn strategy(&self) -> Strategy {
        match &self.inner.negotiator {
            Negotiator::Relay(_) => Strategy::Relay,
            Negotiator::HostBus(_) => Strategy::HostBus,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Whether this side originates the offer. For the relay strategy this is only known once
    /// the room is ready.
    pub fn is_leader(&self) -> bool {
        match &self.inner.negotiator {
            Negotiator::Relay(relay) => relay.is_leader(),
            Negotiator::HostBus(bus) => bus.is_initiator(),
        }
    }

    /// Waits until the connection is open. Fails if it is closed or fails first.
    pub async fn connected(&self) -> Result<(), Error> {
        loop {
            let changed = self.inner.status_changed.notified();
            match &**self.inner.status.load() {
                Status::Open => return Ok(()),
                Status::Closed => return Err(Error::Closed),
                Status::Failed(e) => return Err(e.clone()),
                Status::Created | Status::Negotiating | Status::Disconnected => {}
            }
            changed.await;
        }
    }

    /// Opens a new outbound data channel. The returned channel is not open yet, wait for its
    /// `Open` state notification before sending.
    pub async fn create_channel(&self, name: &str) -> Result<Channel, Error> {
        if name == self.inner.default_channel_name {
            return Err(Error::protocol(format!("channel name '{name}' is reserved")));
        }
        if self.inner.channels.load().contains_key(name) {
            return Err(Error::protocol(format!("channel '{name}' already exists")));
        }
        let engine = self.inner.engine()?;
        let dc = engine.create_data_channel(name).await?;
        let channel = Channel::new(dc, self.inner.dispatcher.clone());
        if !self.inner.register_channel(&channel) {
            let _ = channel.close().await;
            return Err(Error::protocol(format!("channel '{name}' already exists")));
        }
        Ok(channel)
    }

    pub fn channel(&self, name: &str) -> Option<Channel> {
        self.inner.channels.load().get(name).cloned()
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.inner.channels.load().values().cloned().collect()
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.inner.listeners.add(listener);
    }

    pub fn remove_connection_listener(&self, listener: &Arc<dyn ConnectionListener>) -> bool {
        self.inner.listeners.remove(listener)
    }

    /// Closes the default channel and the engine connection. Safe to call in any state, calls
    /// after the first one have no effect. Application channels are not closed one by one, a
    /// closed connection implies all of its channels are closed.
    pub async fn close(&self) -> Result<(), Error> {
        self.inner.close().await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("pairing_code", &self.pairing_code())
            .field("status", &**self.inner.status.load())
            .field("channels", &self.inner.channels.load().len())
            .field("listeners", &self.inner.listeners.len())
            .finish()
    }
}

impl ConnectionInner {
    pub(crate) fn config(&self) -> &Configuration {
        &self.config
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.status.load().state()
    }

    pub(crate) fn relay(&self) -> Option<&RelayNegotiator> {
        match &self.negotiator {
            Negotiator::Relay(relay) => Some(relay),
            Negotiator::HostBus(_) => None,
        }
    }

    pub(crate) fn bus(&self) -> Option<&BusNegotiator> {
        match &self.negotiator {
            Negotiator::HostBus(bus) => Some(bus),
            Negotiator::Relay(_) => None,
        }
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    fn engine(&self) -> Result<Arc<dyn NegotiationEngine>, Error> {
        match &*self.engine.load() {
            Some(handle) => Ok(handle.0.clone()),
            None if self.closing.load(Ordering::SeqCst) => Err(Error::Closed),
            None => Err(Error::protocol("negotiation engine has not been created yet")),
        }
    }

    pub(crate) fn has_engine(&self) -> bool {
        self.engine.load().is_some()
    }

    /// Creates the engine connection and enters `Negotiating`.
    pub(crate) async fn create_engine(self: &Arc<Self>, config: &RtcConfig) -> Result<(), Error> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        if self.has_engine() {
            return Err(Error::protocol("negotiation engine already exists"));
        }
        let observer: Arc<dyn EngineObserver> = Arc::new(EngineEvents(Arc::downgrade(self)));
        let engine = self.engines.create(config, observer).await?;
        if self.closing.load(Ordering::SeqCst) {
            let _ = engine.close().await;
            return Err(Error::Closed);
        }
        self.engine.store(Some(Arc::new(EngineHandle(engine))));
        self.status.rcu(|old| match &**old {
            Status::Created => Arc::new(Status::Negotiating),
            _ => old.clone(),
        });
        self.status_changed.notify_waiters();
        log::debug!("negotiation engine created for {}", self.config.pairing_code());
        Ok(())
    }

    /// Offering side only: creates the bootstrap channel forcing candidate gathering, then the
    /// offer, which becomes the local description.
    pub(crate) async fn initialize_offer(&self) -> Result<SessionDescription, Error> {
        log::debug!("initialize offer {}", self.config.pairing_code());
        self.create_default_channel().await?;
        self.create_offer().await
    }

    async fn create_default_channel(&self) -> Result<(), Error> {
        let engine = self.engine()?;
        let dc = engine.create_data_channel(&self.default_channel_name).await?;
        let channel = Channel::new(dc, self.dispatcher.clone());
        if let Some(previous) = self.default_channel.swap(Some(Arc::new(channel))) {
            previous.close().await?;
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, Error> {
        let engine = self.engine()?;
        let (resolver, offer) = description_future();
        engine.create_offer(resolver);
        let offer = offer.wait_for(self.config.description_timeout()).await?;
        self.set_local_description(&engine, offer.clone()).await?;
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, Error> {
        let engine = self.engine()?;
        let (resolver, answer) = description_future();
        engine.create_answer(resolver);
        let answer = answer.wait_for(self.config.description_timeout()).await?;
        self.set_local_description(&engine, answer.clone()).await?;
        Ok(answer)
    }

    async fn set_local_description(
        &self,
        engine: &Arc<dyn NegotiationEngine>,
        desc: SessionDescription,
    ) -> Result<(), Error> {
        let (resolver, done) = description_future();
        engine.set_local_description(desc, resolver);
        done.wait_for(self.config.description_timeout()).await
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), Error> {
        let engine = self.engine()?;
        let (resolver, done) = description_future();
        engine.set_remote_description(desc, resolver);
        done.wait_for(self.config.description_timeout()).await?;
        self.apply_pending_candidates(&engine).await;
        Ok(())
    }

    /// Current local description, expected to be of the given type.
    pub(crate) async fn local_description(
        &self,
        expected: SdpType,
    ) -> Result<SessionDescription, Error> {
        match self.engine()?.local_description().await {
            Some(desc) if desc.sdp_type == expected => Ok(desc),
            _ => Err(Error::protocol(format!(
                "no local {expected:?} description available"
            ))),
        }
    }

    /// Answering side: applies the remote offer and produces the local answer.
    pub(crate) async fn answer_offer(&self, sdp: String) -> Result<SessionDescription, Error> {
        log::debug!("got offer for {}", self.config.pairing_code());
        self.set_remote_description(SessionDescription::offer(sdp)).await?;
        self.create_answer().await
    }

    /// Offering side: applies the remote answer to the previously made offer.
    pub(crate) async fn apply_answer(&self, sdp: String) -> Result<(), Error> {
        log::debug!("got answer for {}", self.config.pairing_code());
        let engine = self.engine()?;
        match engine.local_description().await {
            Some(local) if local.sdp_type == SdpType::Offer => {}
            _ => return Err(Error::protocol("answer received with no prior offer")),
        }
        self.set_remote_description(SessionDescription::answer(sdp)).await
    }

    /// Applies a remote candidate, or keeps it until the remote description is known.
    /// Candidates are best-effort: an engine rejecting one is only logged.
    pub(crate) async fn add_remote_candidate(&self, candidate: IceCandidate) {
        {
            let mut pending = self.pending_candidates.lock().await;
            if !self.remote_applied.load(Ordering::SeqCst) {
                pending.push(candidate);
                return;
            }
        }
        match self.engine() {
            Ok(engine) => {
                if let Err(e) = engine.add_candidate(candidate).await {
                    log::warn!("remote candidate rejected: {e}");
                }
            }
            Err(e) => log::warn!("dropping remote candidate: {e}"),
        }
    }

    async fn apply_pending_candidates(&self, engine: &Arc<dyn NegotiationEngine>) {
        let pending = {
            let mut pending = self.pending_candidates.lock().await;
            self.remote_applied.store(true, Ordering::SeqCst);
            std::mem::take(&mut *pending)
        };
        for candidate in pending {
            if let Err(e) = engine.add_candidate(candidate).await {
                log::warn!("buffered remote candidate rejected: {e}");
            }
        }
    }

    /// Waits until the engine reports candidate gathering as complete.
    pub(crate) async fn gathering_complete(&self) -> Result<(), Error> {
        let mut gathered = self.gathered.subscribe();
        let wait = async move { gathered.wait_for(|done| *done).await.is_ok() };
        let done = match self.config.description_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, wait)
                .await
                .map_err(|_| Error::Timeout(timeout))?,
            None => wait.await,
        };
        if done {
            Ok(())
        } else {
            Err(Error::Closed)
        }
    }

    /// Registers `channel` unless its name is already taken.
    fn register_channel(&self, channel: &Channel) -> bool {
        let mut inserted = false;
        self.channels.rcu(|old| {
            if old.contains_key(channel.name()) {
                inserted = false;
                old.clone()
            } else {
                inserted = true;
                let mut channels = HashMap::clone(old);
                channels.insert(channel.name().to_owned(), channel.clone());
                Arc::new(channels)
            }
        });
        inserted
    }

    /// Moves to `next` unless already there or in a terminal state. Listener-visible states are
    /// fanned out exactly once per transition.
    fn transition(&self, next: Status) -> bool {
        let next = Arc::new(next);
        let old = self.status.rcu(|old| {
            if old.state().is_terminal() || old.state() == next.state() {
                old.clone()
            } else {
                next.clone()
            }
        });
        if old.state().is_terminal() || old.state() == next.state() {
            return false;
        }
        let state = next.state();
        log::debug!(
            "connection {} {:?} -> {:?}",
            self.config.pairing_code(),
            old.state(),
            state
        );
        self.status_changed.notify_waiters();
        if matches!(
            state,
            ConnectionState::Open
                | ConnectionState::Disconnected
                | ConnectionState::Closed
                | ConnectionState::Failed
        ) {
            let listeners = self.listeners.snapshot();
            self.dispatcher.dispatch(move || {
                for l in listeners.iter() {
                    l.on_state_change(state);
                }
            });
        }
        true
    }

    /// Terminal failure of the initial negotiation. Errors caused by a requested close are
    /// only logged, the connection ends up `Closed`.
    pub(crate) fn fail(&self, error: Error) {
        if self.closing.load(Ordering::SeqCst) {
            log::debug!(
                "negotiation of {} interrupted by close: {error}",
                self.config.pairing_code()
            );
            return;
        }
        log::error!(
            "negotiation of {} failed: {error}",
            self.config.pairing_code()
        );
        self.transition(Status::Failed(error));
    }

    pub(crate) fn on_transport_disconnect(&self, reason: &str) {
        log::warn!(
            "signaling transport of {} disconnected: {reason}",
            self.config.pairing_code()
        );
        if self.state() == ConnectionState::Open {
            self.transition(Status::Disconnected);
        }
    }

    fn on_peer_state(&self, state: PeerState) {
        log::debug!("engine state of {}: {state:?}", self.config.pairing_code());
        let next = match state {
            PeerState::Connected => Status::Open,
            PeerState::Disconnected => Status::Disconnected,
            PeerState::Closed => Status::Closed,
            PeerState::New | PeerState::Connecting | PeerState::Failed => return,
        };
        self.transition(next);
    }

    fn on_local_candidate(&self, candidate: IceCandidate) {
        match &self.negotiator {
            Negotiator::Relay(relay) => relay.on_local_candidate(candidate),
            Negotiator::HostBus(_) => {
                log::trace!("candidate bundled into local description: {}", candidate.candidate)
            }
        }
    }

    fn on_remote_channel(&self, dc: Arc<dyn EngineChannel>) {
        let label = dc.label().to_owned();
        log::debug!("remote data channel {label}");
        if label == self.default_channel_name {
            return;
        }
        let channel = Channel::new(dc, self.dispatcher.clone());
        if !self.register_channel(&channel) {
            log::warn!("channel '{label}' is already registered, keeping the existing entry");
        }
        let listeners = self.listeners.snapshot();
        self.dispatcher.dispatch(move || {
            for l in listeners.iter() {
                l.on_channel(channel.clone());
            }
        });
    }

    async fn close(&self) -> Result<(), Error> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::debug!("closing {}", self.config.pairing_code());
        self.shutdown.cancel();
        match &self.negotiator {
            Negotiator::Relay(relay) => relay.close().await,
            Negotiator::HostBus(bus) => bus.close(),
        }
        if let Some(dc) = self.default_channel.swap(None) {
            if let Err(e) = dc.close().await {
                log::warn!("failed to close default channel: {e}");
            }
        }
        let mut result = Ok(());
        if let Some(engine) = self.engine.swap(None) {
            result = engine.0.close().await;
        }
        self.transition(Status::Closed);
        result
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        match &self.negotiator {
            Negotiator::Relay(relay) => relay.shutdown(),
            Negotiator::HostBus(bus) => bus.close(),
        }
        if let Some(engine) = self.engine.swap(None) {
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                rt.spawn(async move {
                    let _ = engine.0.close().await;
                });
            }
        }
    }
}

struct EngineEvents(Weak<ConnectionInner>);

impl EngineObserver for EngineEvents {
    fn on_connection_state_change(&self, state: PeerState) {
        if let Some(conn) = self.0.upgrade() {
            conn.on_peer_state(state);
        }
    }

    fn on_ice_candidate(&self, candidate: IceCandidate) {
        if let Some(conn) = self.0.upgrade() {
            conn.on_local_candidate(candidate);
        }
    }

    fn on_ice_gathering_state_change(&self, state: GatheringState) {
        if let Some(conn) = self.0.upgrade() {
            log::debug!("ice gathering of {}: {state:?}", conn.config.pairing_code());
            if state == GatheringState::Complete {
                conn.gathered.send_replace(true);
            }
        }
    }

    fn on_data_channel(&self, channel: Arc<dyn EngineChannel>) {
        if let Some(conn) = self.0.upgrade() {
            conn.on_remote_channel(channel);
        }
    }
}
