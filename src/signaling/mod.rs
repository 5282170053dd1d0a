//! Relay-mediated signaling: joins a room on a relay service and exchanges
//! [NegotiationPayload]s with the other peer of that room.

mod http;
mod memory;

pub use http::HttpRelay;
pub use memory::MemoryRelay;

use crate::config::RtcConfig;
use crate::engine::IceCandidate;
use crate::error::Error;
use crate::payload::{NegotiationPayload, NegotiationResult};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

pub const EVENT_JOIN: &str = "join";
pub const EVENT_MESSAGE: &str = "message";

/// Session cookies returned by the relay's authorization preflight, forwarded when opening the
/// event socket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionCookies(Vec<(String, String)>);

impl SessionCookies {
    pub fn new(cookies: Vec<(String, String)>) -> Self {
        SessionCookies(cookies)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `Cookie` request header value.
    pub fn header(&self) -> String {
        self.0
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Events delivered by the relay's event socket.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Connected { id: String },
    ConnectError(String),
    Disconnected(String),
    Ready { room: String, leader: String },
    Joined { room: String, client: String },
    Message(Value),
}

impl SocketEvent {
    /// Decodes a named socket event. Unknown events yield `None`.
    pub fn from_frame(event: &str, args: &[Value]) -> Option<Self> {
        let arg = |i: usize| {
            args.get(i)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned()
        };
        match event {
            "connect" => Some(SocketEvent::Connected { id: arg(0) }),
            "connect_error" => Some(SocketEvent::ConnectError(arg(0))),
            "disconnect" => Some(SocketEvent::Disconnected(arg(0))),
            "ready" => Some(SocketEvent::Ready {
                room: arg(0),
                leader: arg(1),
            }),
            "joined" => Some(SocketEvent::Joined {
                room: arg(0),
                client: arg(1),
            }),
            "message" => Some(SocketEvent::Message(args.first().cloned().unwrap_or(Value::Null))),
            _ => None,
        }
    }
}

/// Outbound half of a relay event socket.
#[async_trait]
pub trait EventSocket: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn emit(&self, event: &str, args: Vec<Value>) -> Result<(), Error>;

    async fn close(&self);
}

pub struct SocketSession {
    pub socket: Arc<dyn EventSocket>,
    pub events: UnboundedReceiver<SocketEvent>,
}

/// Endpoints of a signaling relay.
#[async_trait]
pub trait RelayService: Send + Sync {
    /// HTTP preflight. Anything but a 200 response is an [Error::Transport].
    async fn authorize(&self) -> Result<SessionCookies, Error>;

    async fn rtc_config(&self) -> Result<RtcConfig, Error>;

    async fn connect(&self, cookies: &SessionCookies) -> Result<SocketSession, Error>;
}

/// Receiver of the negotiation events routed by [Signaling].
#[async_trait]
pub trait SignalingListener: Send + Sync {
    async fn on_rtc_config(&self, config: RtcConfig);

    async fn on_offer(&self, sdp: String) -> NegotiationResult;

    async fn on_answer(&self, sdp: String) -> NegotiationResult;

    async fn on_candidate(&self, candidate: IceCandidate);

    async fn on_trickle_ready(&self, code: String);

    async fn on_disconnect(&self, reason: String);

    async fn on_failure(&self, error: Error);
}

struct SocketHandle(Arc<dyn EventSocket>);

/// Relay signaling session of a single connection.
pub struct Signaling {
    pairing_code: String,
    service: Arc<dyn RelayService>,
    socket: ArcSwapOption<SocketHandle>,
    socket_id: ArcSwapOption<String>,
    leader: AtomicBool,
    trickle: UnboundedSender<IceCandidate>,
    trickle_queue: std::sync::Mutex<Option<UnboundedReceiver<IceCandidate>>>,
    shutdown: CancellationToken,
}

impl Signaling {
    pub fn new(pairing_code: impl Into<String>, service: Arc<dyn RelayService>) -> Self {
        let (trickle, trickle_queue) = unbounded_channel();
        Signaling {
            pairing_code: pairing_code.into(),
            service,
            socket: ArcSwapOption::empty(),
            socket_id: ArcSwapOption::empty(),
            leader: AtomicBool::new(false),
            trickle,
            trickle_queue: std::sync::Mutex::new(Some(trickle_queue)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Runs the authorization preflight and opens the event socket. Everything past this point
    /// (room join, leader election, payload routing) is reported to `listener` asynchronously.
    pub async fn initialize(
        self: &Arc<Self>,
        listener: Arc<dyn SignalingListener>,
    ) -> Result<(), Error> {
        let cookies = self.service.authorize().await?;
        let SocketSession { socket, mut events } = self.service.connect(&cookies).await?;
        self.socket.store(Some(Arc::new(SocketHandle(socket))));

        let trickle = self
            .trickle_queue
            .lock()
            .map_err(|_| Error::transport("signaling state poisoned"))?
            .take();
        if let Some(mut trickle) = trickle {
            let this = self.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = this.shutdown.cancelled() => break,
                        candidate = trickle.recv() => match candidate {
                            Some(candidate) => {
                                if let Err(e) = this.send(&NegotiationPayload::Candidate { candidate }).await {
                                    log::warn!("dropping local candidate: {e}");
                                }
                            }
                            None => break,
                        }
                    }
                }
            });
        }

        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => this.handle_event(event, &*listener).await,
                        None => {
                            listener.on_disconnect("event socket closed".into()).await;
                            break;
                        }
                    }
                }
            }
            log::debug!("signaling event loop for {} stopped", this.pairing_code);
        });
        Ok(())
    }

    async fn handle_event(&self, event: SocketEvent, listener: &dyn SignalingListener) {
        match event {
            SocketEvent::Connected { id } => {
                log::info!("connected to signaling relay as {id}");
                self.socket_id.store(Some(Arc::new(id)));
                let join = self
                    .emit(EVENT_JOIN, vec![Value::String(self.pairing_code.clone())])
                    .await;
                if let Err(e) = join {
                    listener.on_failure(e).await;
                }
            }
            SocketEvent::ConnectError(reason) => {
                log::warn!("signaling relay connect error: {reason}");
            }
            SocketEvent::Disconnected(reason) => {
                log::info!("disconnected from signaling relay: {reason}");
                listener.on_disconnect(reason).await;
            }
            SocketEvent::Joined { room, client } => {
                log::info!("this peer has joined room {room} with client ID {client}");
            }
            SocketEvent::Ready { room, leader } => {
                let payload = NegotiationPayload::RoomReady {
                    room_id: room,
                    leader_id: leader,
                };
                self.handle_payload(payload, listener).await;
            }
            SocketEvent::Message(value) => match NegotiationPayload::from_value(value) {
                Ok(payload) => self.handle_payload(payload, listener).await,
                Err(e) => log::warn!("ignoring malformed signaling message: {e}"),
            },
        }
    }

    async fn handle_payload(&self, payload: NegotiationPayload, listener: &dyn SignalingListener) {
        log::debug!("signaling {} received {}", self.pairing_code, payload.kind());
        match payload {
            NegotiationPayload::RoomReady { room_id, leader_id } => {
                let leader = self
                    .socket_id
                    .load()
                    .as_deref()
                    .is_some_and(|id| *id == leader_id);
                log::info!("room {room_id} is ready, leader {leader_id} (local leader: {leader})");
                self.leader.store(leader, Ordering::SeqCst);
                match self.service.rtc_config().await {
                    Ok(config) => listener.on_rtc_config(config).await,
                    Err(e) => listener.on_failure(e).await,
                }
            }
            NegotiationPayload::Offer { sdp } => {
                let result = listener.on_offer(sdp).await;
                self.report(result).await;
            }
            NegotiationPayload::Answer { sdp } => {
                let result = listener.on_answer(sdp).await;
                self.report(result).await;
            }
            NegotiationPayload::Candidate { candidate } => listener.on_candidate(candidate).await,
            NegotiationPayload::TrickleReady { code } => listener.on_trickle_ready(code).await,
            NegotiationPayload::Result(result) => {
                if !result.is_ok() {
                    log::warn!(
                        "peer failed to process negotiation: {} {}",
                        result.status,
                        result.message.unwrap_or_default()
                    );
                }
            }
        }
    }

    /// Failed rounds are sent back so the peer can retry.
    async fn report(&self, result: NegotiationResult) {
        if !result.is_ok() {
            if let Err(e) = self.send(&NegotiationPayload::Result(result)).await {
                log::warn!("unable to report negotiation failure: {e}");
            }
        }
    }

    pub async fn emit(&self, event: &str, args: Vec<Value>) -> Result<(), Error> {
        let socket = self.socket.load_full();
        match socket.as_deref() {
            Some(SocketHandle(socket)) if socket.is_connected() => socket.emit(event, args).await,
            _ => Err(Error::transport("Socket is not connected")),
        }
    }

    pub async fn send(&self, payload: &NegotiationPayload) -> Result<(), Error> {
        log::debug!("signaling {} sending {}", self.pairing_code, payload.kind());
        self.emit(EVENT_MESSAGE, vec![payload.to_value()?]).await
    }

    /// Queues a local candidate. Candidates leave in the order they were queued.
    pub fn trickle(&self, candidate: IceCandidate) {
        if self.trickle.send(candidate).is_err() {
            log::warn!("dropping local candidate: signaling closed");
        }
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    pub fn socket_id(&self) -> Option<String> {
        self.socket_id.load_full().map(|id| (*id).clone())
    }

    /// Stops the background tasks without waiting for the socket to close.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn close(&self) {
        self.shutdown.cancel();
        if let Some(socket) = self.socket.swap(None) {
            socket.0.close().await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::SocketEvent;
    use serde_json::json;

    #[test]
    fn decodes_socket_frames() {
        assert_eq!(
            SocketEvent::from_frame("ready", &[json!("test-session"), json!("socket-1")]),
            Some(SocketEvent::Ready {
                room: "test-session".into(),
                leader: "socket-1".into()
            })
        );
        assert_eq!(
            SocketEvent::from_frame("message", &[json!({"type": "offer", "sdp": "v=0"})]),
            Some(SocketEvent::Message(json!({"type": "offer", "sdp": "v=0"})))
        );
        assert_eq!(
            SocketEvent::from_frame("connect", &[json!("abc")]),
            Some(SocketEvent::Connected { id: "abc".into() })
        );
        assert_eq!(SocketEvent::from_frame("pong", &[]), None);
    }
}
