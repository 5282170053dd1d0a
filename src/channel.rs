use crate::engine::{EngineChannel, EngineChannelObserver, EngineChannelState};
use crate::error::Error;
use crate::listener::{ChannelListener, Dispatcher, Listeners};
use arc_swap::{ArcSwap, ArcSwapOption};
use bytes::Bytes;
use std::sync::{Arc, Weak};

/// States of a [Channel] visible to [ChannelListener]s.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

/// Bidirectional data channel multiplexed over a connection. Cloning is cheap, all clones refer
/// to the same underlying channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct EngineHandle(Arc<dyn EngineChannel>);

struct ChannelInner {
    name: String,
    dc: ArcSwapOption<EngineHandle>,
    state: ArcSwap<ChannelState>,
    listeners: Listeners<dyn ChannelListener>,
    dispatcher: Dispatcher,
}

impl Channel {
    pub(crate) fn new(dc: Arc<dyn EngineChannel>, dispatcher: Dispatcher) -> Self {
        let inner = Arc::new(ChannelInner {
            name: dc.label().to_owned(),
            dc: ArcSwapOption::from_pointee(EngineHandle(dc.clone())),
            state: ArcSwap::from_pointee(ChannelState::Connecting),
            listeners: Listeners::new(),
            dispatcher,
        });
        dc.register_observer(Arc::new(ChannelObserver(Arc::downgrade(&inner))));
        // catch up with transitions made before the observer was in place
        match dc.state() {
            EngineChannelState::Open => inner.transition(ChannelState::Open),
            EngineChannelState::Closing | EngineChannelState::Closed => {
                inner.transition(ChannelState::Closed)
            }
            EngineChannelState::Connecting => {}
        }
        Channel { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> ChannelState {
        **self.inner.state.load()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    pub fn add_listener(&self, listener: Arc<dyn ChannelListener>) {
        self.inner.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ChannelListener>) -> bool {
        self.inner.listeners.remove(listener)
    }

    /// Sends a payload to the remote side. Fails with [Error::ChannelClosed] unless the channel
    /// is open, payloads are never queued.
    pub async fn send(&self, data: impl Into<Bytes>) -> Result<(), Error> {
        let dc = match &*self.inner.dc.load() {
            Some(handle) => handle.0.clone(),
            None => return Err(Error::channel_closed()),
        };
        if dc.state() != EngineChannelState::Open {
            return Err(Error::channel_closed());
        }
        dc.send(data.into()).await
    }

    pub async fn send_text(&self, text: &str) -> Result<(), Error> {
        self.send(Bytes::copy_from_slice(text.as_bytes())).await
    }

    /// Detaches from the engine channel and closes it. Subsequent calls have no effect.
    pub async fn close(&self) -> Result<(), Error> {
        let Some(handle) = self.inner.dc.swap(None) else {
            return Ok(());
        };
        log::debug!("closing channel '{}'", self.inner.name);
        handle.0.unregister_observer();
        self.inner.transition(ChannelState::Closed);
        handle.0.close().await
    }
}

impl ChannelInner {
    /// Moves to `state` and notifies listeners if this is a transition into Open or Closed.
    fn transition(&self, state: ChannelState) {
        let old = self.state.swap(Arc::new(state));
        if *old == state || state == ChannelState::Connecting {
            return;
        }
        log::debug!("channel '{}' {:?} -> {:?}", self.name, old, state);
        let listeners = self.listeners.snapshot();
        self.dispatcher.dispatch(move || {
            for l in listeners.iter() {
                l.on_state_change(state);
            }
        });
    }

    fn deliver(&self, data: Bytes) {
        let listeners = self.listeners.snapshot();
        self.dispatcher.dispatch(move || match std::str::from_utf8(&data) {
            Ok(text) => {
                for l in listeners.iter() {
                    l.on_message(text);
                }
            }
            Err(_) => {
                for l in listeners.iter() {
                    l.on_binary(&data);
                }
            }
        });
    }
}

struct ChannelObserver(Weak<ChannelInner>);

impl EngineChannelObserver for ChannelObserver {
    fn on_state_change(&self, state: EngineChannelState) {
        if let Some(inner) = self.0.upgrade() {
            match state {
                EngineChannelState::Open => inner.transition(ChannelState::Open),
                EngineChannelState::Closed => inner.transition(ChannelState::Closed),
                EngineChannelState::Connecting | EngineChannelState::Closing => {}
            }
        }
    }

    fn on_message(&self, data: Bytes) {
        if let Some(inner) = self.0.upgrade() {
            inner.deliver(data);
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::{Channel, ChannelState};
    use crate::engine::testing::MockChannel;
    use crate::engine::EngineChannelState;
    use crate::error::Error;
    use crate::listener::{ChannelListener, Dispatcher};
    use bytes::Bytes;
    use std::sync::Arc;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

    #[derive(Debug, PartialEq)]
    enum Event {
        State(ChannelState),
        Text(String),
        Binary(Vec<u8>),
    }

    struct Forward(UnboundedSender<Event>);

    impl ChannelListener for Forward {
        fn on_state_change(&self, state: ChannelState) {
            let _ = self.0.send(Event::State(state));
        }

        fn on_message(&self, message: &str) {
            let _ = self.0.send(Event::Text(message.to_owned()));
        }

        fn on_binary(&self, data: &Bytes) {
            let _ = self.0.send(Event::Binary(data.to_vec()));
        }
    }

    fn listen(channel: &Channel) -> UnboundedReceiver<Event> {
        let (tx, rx) = unbounded_channel();
        channel.add_listener(Arc::new(Forward(tx)));
        rx
    }

    #[tokio::test]
    async fn send_before_open_fails() {
        let dc = MockChannel::new("chat");
        let channel = Channel::new(dc.clone(), Dispatcher::spawn());
        assert_eq!(channel.state(), ChannelState::Connecting);
        let res = channel.send_text("ping").await;
        assert!(matches!(res, Err(Error::ChannelClosed)));
        assert!(dc.sent().is_empty());

        dc.set_state(EngineChannelState::Open);
        channel.send_text("ping").await.unwrap();
        assert_eq!(dc.sent(), vec![Bytes::from_static(b"ping")]);
    }

    #[tokio::test]
    async fn surfaces_only_open_and_closed_transitions() {
        let dc = MockChannel::new("chat");
        let channel = Channel::new(dc.clone(), Dispatcher::spawn());
        let mut events = listen(&channel);

        dc.set_state(EngineChannelState::Connecting);
        dc.set_state(EngineChannelState::Open);
        dc.set_state(EngineChannelState::Open);
        dc.receive(Bytes::from_static(b"hello"));
        dc.receive(Bytes::from_static(&[0xff, 0xfe]));
        dc.set_state(EngineChannelState::Closing);
        dc.set_state(EngineChannelState::Closed);

        assert_eq!(events.recv().await, Some(Event::State(ChannelState::Open)));
        assert_eq!(events.recv().await, Some(Event::Text("hello".into())));
        assert_eq!(events.recv().await, Some(Event::Binary(vec![0xff, 0xfe])));
        assert_eq!(events.recv().await, Some(Event::State(ChannelState::Closed)));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn opening_during_registration_is_not_lost() {
        let dc = MockChannel::new("chat");
        dc.open_on_register();
        let channel = Channel::new(dc.clone(), Dispatcher::spawn());
        assert_eq!(channel.state(), ChannelState::Open);
        channel.send_text("ping").await.unwrap();

        let mut events = listen(&channel);
        dc.set_state(EngineChannelState::Closed);
        assert_eq!(events.recv().await, Some(Event::State(ChannelState::Closed)));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let dc = MockChannel::new("chat");
        let channel = Channel::new(dc.clone(), Dispatcher::spawn());
        dc.set_state(EngineChannelState::Open);
        let mut events = listen(&channel);

        channel.close().await.unwrap();
        channel.close().await.unwrap();
        assert_eq!(dc.close_calls(), 1);
        assert!(!dc.has_observer());
        assert!(matches!(
            channel.send_text("late").await,
            Err(Error::ChannelClosed)
        ));
        assert_eq!(events.recv().await, Some(Event::State(ChannelState::Closed)));
        tokio::task::yield_now().await;
        assert!(events.try_recv().is_err());
    }
}
