use crate::config::RtcConfig;
use crate::error::Error;
use crate::signaling::{
    EventSocket, RelayService, SessionCookies, SocketEvent, SocketSession, EVENT_JOIN,
    EVENT_MESSAGE,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

/// In-process signaling relay with the same room semantics as a hosted one: the first peer to
/// join a room is its leader and both peers receive `ready` once the second one joins.
/// Messages are relayed to the other members of the sender's room.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    inner: Arc<RelayState>,
}

#[derive(Default)]
struct RelayState {
    auth_status: Mutex<Option<u16>>,
    rtc_config: Mutex<RtcConfig>,
    next_id: AtomicU64,
    rooms: Mutex<HashMap<String, Vec<Member>>>,
    history: Mutex<Vec<(String, String, Value)>>,
}

#[derive(Clone)]
struct Member {
    id: String,
    events: UnboundedSender<SocketEvent>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the authorization preflight answer with `status`.
    pub fn with_auth_status(self, status: u16) -> Self {
        if let Ok(mut s) = self.inner.auth_status.lock() {
            *s = Some(status);
        }
        self
    }

    pub fn with_rtc_config(self, config: RtcConfig) -> Self {
        if let Ok(mut c) = self.inner.rtc_config.lock() {
            *c = config;
        }
        self
    }

    /// Every `(socket id, event, argument)` emitted through this relay, in order.
    pub fn history(&self) -> Vec<(String, String, Value)> {
        self.inner
            .history
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    /// Drops `socket_id` from its room on the relay side, as a relay restart or network loss
    /// would. The socket is told it got disconnected.
    pub fn kick(&self, socket_id: &str) {
        let Ok(mut rooms) = self.lock_rooms() else { return };
        let mut kicked = None;
        for members in rooms.values_mut() {
            if let Some(i) = members.iter().position(|m| m.id == socket_id) {
                kicked = Some(members.remove(i));
            }
        }
        rooms.retain(|_, members| !members.is_empty());
        if let Some(member) = kicked {
            let _ = member
                .events
                .send(SocketEvent::Disconnected("kicked by relay".into()));
        }
    }

    fn lock_rooms(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<Member>>>, Error> {
        self.inner
            .rooms
            .lock()
            .map_err(|_| Error::transport("relay state poisoned"))
    }

    fn join(&self, member: &Member, room: &str) -> Result<(), Error> {
        let mut rooms = self.lock_rooms()?;
        let members = rooms.entry(room.to_owned()).or_default();
        if members.iter().any(|m| m.id == member.id) {
            return Ok(());
        }
        if members.len() >= 2 {
            return Err(Error::transport(format!("room {room} is full")));
        }
        members.push(member.clone());
        let _ = member.events.send(SocketEvent::Joined {
            room: room.to_owned(),
            client: member.id.clone(),
        });
        if members.len() == 2 {
            let leader = members[0].id.clone();
            for m in members.iter() {
                let _ = m.events.send(SocketEvent::Ready {
                    room: room.to_owned(),
                    leader: leader.clone(),
                });
            }
        }
        Ok(())
    }

    fn relay(&self, from: &str, message: Value) -> Result<(), Error> {
        let rooms = self.lock_rooms()?;
        let room = rooms
            .values()
            .find(|members| members.iter().any(|m| m.id == from))
            .ok_or_else(|| Error::transport(format!("socket {from} has not joined any room")))?;
        for m in room.iter().filter(|m| m.id != from) {
            let _ = m.events.send(SocketEvent::Message(message.clone()));
        }
        Ok(())
    }

    fn leave(&self, id: &str) {
        if let Ok(mut rooms) = self.inner.rooms.lock() {
            for members in rooms.values_mut() {
                members.retain(|m| m.id != id);
            }
            rooms.retain(|_, members| !members.is_empty());
        }
    }
}

#[async_trait]
impl RelayService for MemoryRelay {
    async fn authorize(&self) -> Result<SessionCookies, Error> {
        let status = self.inner.auth_status.lock().ok().and_then(|s| *s);
        match status {
            None | Some(200) => Ok(SessionCookies::new(vec![(
                "session".to_owned(),
                format!("memory-{}", self.inner.next_id.load(Ordering::SeqCst)),
            )])),
            Some(status) => Err(Error::transport(format!(
                "Signaling auth check failed {status}"
            ))),
        }
    }

    async fn rtc_config(&self) -> Result<RtcConfig, Error> {
        self.inner
            .rtc_config
            .lock()
            .map(|c| c.clone())
            .map_err(|_| Error::transport("relay state poisoned"))
    }

    async fn connect(&self, _cookies: &SessionCookies) -> Result<SocketSession, Error> {
        let id = format!("socket-{}", self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let (events_tx, events) = unbounded_channel();
        let _ = events_tx.send(SocketEvent::Connected { id: id.clone() });
        Ok(SocketSession {
            socket: Arc::new(MemorySocket {
                relay: self.clone(),
                member: Member {
                    id,
                    events: events_tx,
                },
                connected: AtomicBool::new(true),
            }),
            events,
        })
    }
}

struct MemorySocket {
    relay: MemoryRelay,
    member: Member,
    connected: AtomicBool,
}

#[async_trait]
impl EventSocket for MemorySocket {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn emit(&self, event: &str, args: Vec<Value>) -> Result<(), Error> {
        if !self.is_connected() {
            return Err(Error::transport("Socket is not connected"));
        }
        let arg = args.into_iter().next().unwrap_or(Value::Null);
        if let Ok(mut history) = self.relay.inner.history.lock() {
            history.push((self.member.id.clone(), event.to_owned(), arg.clone()));
        }
        match event {
            EVENT_JOIN => {
                let room = arg
                    .as_str()
                    .ok_or_else(|| Error::protocol("join requires a room name"))?;
                self.relay.join(&self.member, room)
            }
            EVENT_MESSAGE => self.relay.relay(&self.member.id, arg),
            other => Err(Error::protocol(format!("unsupported socket event '{other}'"))),
        }
    }

    async fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.relay.leave(&self.member.id);
            let _ = self
                .member
                .events
                .send(SocketEvent::Disconnected("client closed".into()));
        }
    }
}
