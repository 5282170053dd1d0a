use crate::config::RtcConfig;
use crate::connection::ConnectionInner;
use crate::engine::IceCandidate;
use crate::error::Error;
use crate::payload::{NegotiationPayload, NegotiationResult};
use crate::signaling::{RelayService, Signaling, SignalingListener};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Relay strategy: trickle ICE over a room-based signaling relay. The room leader offers.
pub(crate) struct RelayNegotiator {
    signaling: Arc<Signaling>,
    gate: TrickleGate,
    offer_started: AtomicBool,
}

impl RelayNegotiator {
    pub fn new(pairing_code: &str, service: Arc<dyn RelayService>) -> Self {
        RelayNegotiator {
            signaling: Arc::new(Signaling::new(pairing_code, service)),
            gate: TrickleGate::default(),
            offer_started: AtomicBool::new(false),
        }
    }

    pub async fn initialize(&self, conn: &Arc<ConnectionInner>) -> Result<(), Error> {
        let events = Arc::new(RelayEvents(Arc::downgrade(conn)));
        self.signaling.initialize(events).await
    }

    pub fn is_leader(&self) -> bool {
        self.signaling.is_leader()
    }

    pub fn on_local_candidate(&self, candidate: IceCandidate) {
        self.gate.offer(candidate, &self.signaling);
    }

    /// Makes the offer once this side leads, has an engine and both trickle-ready messages
    /// went through. Runs at most once.
    async fn lead_offer(&self, conn: &ConnectionInner) {
        if !self.signaling.is_leader() || !conn.has_engine() || !self.gate.is_open() {
            return;
        }
        if self.offer_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let res = async {
            let offer = conn.initialize_offer().await?;
            self.signaling
                .send(&NegotiationPayload::description(offer))
                .await
        }
        .await;
        if let Err(e) = res {
            conn.fail(e);
        }
    }

    pub async fn close(&self) {
        self.signaling.close().await;
    }

    pub fn shutdown(&self) {
        self.signaling.shutdown();
    }
}

/// Holds local candidates back until this side sent its trickle-ready message and received the
/// peer's one.
#[derive(Default)]
struct TrickleGate(Mutex<GateState>);

#[derive(Default)]
struct GateState {
    local_sent: bool,
    peer_ready: bool,
    pending: Vec<IceCandidate>,
}

impl GateState {
    fn is_open(&self) -> bool {
        self.local_sent && self.peer_ready
    }

    fn flush(&mut self, signaling: &Signaling) {
        if self.is_open() {
            for candidate in self.pending.drain(..) {
                signaling.trickle(candidate);
            }
        }
    }
}

impl TrickleGate {
    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_open(&self) -> bool {
        self.lock().is_open()
    }

    fn offer(&self, candidate: IceCandidate, signaling: &Signaling) {
        let mut state = self.lock();
        if state.is_open() {
            signaling.trickle(candidate);
        } else {
            log::trace!("holding local candidate until trickle is ready");
            state.pending.push(candidate);
        }
    }

    fn mark_local_sent(&self, signaling: &Signaling) {
        let mut state = self.lock();
        state.local_sent = true;
        state.flush(signaling);
    }

    fn mark_peer_ready(&self, signaling: &Signaling) {
        let mut state = self.lock();
        state.peer_ready = true;
        state.flush(signaling);
    }
}

struct RelayEvents(Weak<ConnectionInner>);

impl RelayEvents {
    fn connection(&self) -> Result<Arc<ConnectionInner>, Error> {
        self.0.upgrade().ok_or(Error::Closed)
    }
}

#[async_trait]
impl SignalingListener for RelayEvents {
    async fn on_rtc_config(&self, config: RtcConfig) {
        let Ok(conn) = self.connection() else { return };
        let Some(relay) = conn.relay() else { return };
        if let Err(e) = conn.create_engine(&config).await {
            conn.fail(e);
            return;
        }
        let ready = NegotiationPayload::TrickleReady {
            code: conn.config().pairing_code().to_owned(),
        };
        if let Err(e) = relay.signaling.send(&ready).await {
            conn.fail(e);
            return;
        }
        relay.gate.mark_local_sent(&relay.signaling);
        relay.lead_offer(&conn).await;
    }

    async fn on_offer(&self, sdp: String) -> NegotiationResult {
        let res = async {
            let conn = self.connection()?;
            let relay = conn
                .relay()
                .ok_or_else(|| Error::protocol("not a relay connection"))?;
            if relay.is_leader() {
                return Err(Error::protocol("offer received by the offering peer"));
            }
            let answer = conn.answer_offer(sdp).await?;
            relay
                .signaling
                .send(&NegotiationPayload::description(answer))
                .await
        }
        .await;
        if let Err(e) = &res {
            log::error!("unable to answer offer: {e}");
        }
        res.into()
    }

    async fn on_answer(&self, sdp: String) -> NegotiationResult {
        let res = match self.connection() {
            Ok(conn) => conn.apply_answer(sdp).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &res {
            log::error!("unable to apply answer: {e}");
        }
        res.into()
    }

    async fn on_candidate(&self, candidate: IceCandidate) {
        if let Ok(conn) = self.connection() {
            conn.add_remote_candidate(candidate).await;
        }
    }

    async fn on_trickle_ready(&self, code: String) {
        let Ok(conn) = self.connection() else { return };
        let Some(relay) = conn.relay() else { return };
        log::debug!("peer is ready for trickle on {code}");
        relay.gate.mark_peer_ready(&relay.signaling);
        if conn.has_engine() {
            relay.lead_offer(&conn).await;
        } else {
            log::info!("peer ready for trickle before the local engine exists");
        }
    }

    async fn on_disconnect(&self, reason: String) {
        if let Ok(conn) = self.connection() {
            conn.on_transport_disconnect(&reason);
        }
    }

    async fn on_failure(&self, error: Error) {
        if let Ok(conn) = self.connection() {
            conn.fail(error);
        }
    }
}
