//! Host-application message bus: named channels with request/response actions.

use crate::error::Error;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;

/// Handler of a named action, returning the response sent back to the dispatcher.
pub type ActionHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Value> + Send + Sync>;

#[async_trait]
pub trait HostBus: Send + Sync {
    /// Creates the named channel with the provider's action handlers already in place and
    /// returns the provider end of it.
    async fn provide(
        &self,
        channel: &str,
        actions: Vec<(String, ActionHandler)>,
    ) -> Result<Arc<dyn BusEndpoint>, Error>;

    /// Connects to a channel created by another party with [HostBus::provide].
    async fn connect(&self, channel: &str) -> Result<Arc<dyn BusEndpoint>, Error>;
}

/// One end of a bus channel. Actions dispatched from one end are handled by the other.
#[async_trait]
pub trait BusEndpoint: Send + Sync {
    fn name(&self) -> &str;

    fn register(&self, action: &str, handler: ActionHandler);

    async fn dispatch(&self, action: &str, payload: Value) -> Result<Value, Error>;

    /// Releases this end. Handlers registered through it are dropped, and a provider end
    /// removes the channel so the name can be provided again.
    fn close(&self);
}

/// Simple in-process bus for tests and applications hosting both peers.
///
/// [HostBus::connect] waits until the channel has been provided.
#[derive(Default)]
pub struct LocalHostBus {
    channels: Arc<Registry>,
    provided: Notify,
}

type Registry = Mutex<HashMap<String, Arc<LocalChannel>>>;

impl LocalHostBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, channel: &str) -> Result<Option<Arc<LocalChannel>>, Error> {
        let channels = self
            .channels
            .lock()
            .map_err(|_| Error::transport("host bus poisoned"))?;
        Ok(channels.get(channel).cloned())
    }
}

#[derive(Default)]
struct LocalChannel {
    provider: Mutex<HashMap<String, ActionHandler>>,
    client: Mutex<HashMap<String, ActionHandler>>,
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum Side {
    Provider,
    Client,
}

struct LocalEndpoint {
    name: String,
    side: Side,
    channel: Arc<LocalChannel>,
    /// Set on the provider end only.
    registry: Option<Weak<Registry>>,
}

impl LocalEndpoint {
    fn handlers(&self, side: Side) -> &Mutex<HashMap<String, ActionHandler>> {
        match side {
            Side::Provider => &self.channel.provider,
            Side::Client => &self.channel.client,
        }
    }
}

#[async_trait]
impl HostBus for LocalHostBus {
    async fn provide(
        &self,
        channel: &str,
        actions: Vec<(String, ActionHandler)>,
    ) -> Result<Arc<dyn BusEndpoint>, Error> {
        let local = {
            let mut channels = self
                .channels
                .lock()
                .map_err(|_| Error::transport("host bus poisoned"))?;
            if channels.contains_key(channel) {
                return Err(Error::transport(format!(
                    "bus channel '{channel}' is already provided"
                )));
            }
            let local = Arc::new(LocalChannel {
                provider: Mutex::new(actions.into_iter().collect()),
                client: Mutex::default(),
            });
            channels.insert(channel.to_owned(), local.clone());
            local
        };
        self.provided.notify_waiters();
        log::debug!("providing bus channel {channel}");
        Ok(Arc::new(LocalEndpoint {
            name: channel.to_owned(),
            side: Side::Provider,
            channel: local,
            registry: Some(Arc::downgrade(&self.channels)),
        }))
    }

    async fn connect(&self, channel: &str) -> Result<Arc<dyn BusEndpoint>, Error> {
        loop {
            let provided = self.provided.notified();
            if let Some(local) = self.lookup(channel)? {
                log::debug!("connected to bus channel {channel}");
                return Ok(Arc::new(LocalEndpoint {
                    name: channel.to_owned(),
                    side: Side::Client,
                    channel: local,
                    registry: None,
                }));
            }
            provided.await;
        }
    }
}

#[async_trait]
impl BusEndpoint for LocalEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn register(&self, action: &str, handler: ActionHandler) {
        if let Ok(mut handlers) = self.handlers(self.side).lock() {
            handlers.insert(action.to_owned(), handler);
        }
    }

    async fn dispatch(&self, action: &str, payload: Value) -> Result<Value, Error> {
        let remote = match self.side {
            Side::Provider => Side::Client,
            Side::Client => Side::Provider,
        };
        let handler = {
            let handlers = self
                .handlers(remote)
                .lock()
                .map_err(|_| Error::transport("host bus poisoned"))?;
            handlers.get(action).cloned()
        };
        match handler {
            Some(handler) => Ok(handler(payload).await),
            None => Err(Error::transport(format!(
                "no handler for action '{action}' on bus channel '{}'",
                self.name
            ))),
        }
    }

    fn close(&self) {
        if let Ok(mut handlers) = self.handlers(self.side).lock() {
            handlers.clear();
        }
        let Some(registry) = self.registry.as_ref().and_then(Weak::upgrade) else {
            return;
        };
        if let Ok(mut channels) = registry.lock() {
            // the name may already be provided again by someone else
            if channels
                .get(&self.name)
                .map_or(false, |c| Arc::ptr_eq(c, &self.channel))
            {
                channels.remove(&self.name);
                log::debug!("released bus channel {}", self.name);
            }
        };
    }
}

#[cfg(test)]
mod test {
    use super::{ActionHandler, HostBus, LocalHostBus};
    use crate::error::Error;
    use futures_util::future::BoxFuture;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;

    fn echo() -> ActionHandler {
        Arc::new(|payload: Value| -> BoxFuture<'static, Value> {
            Box::pin(async move { json!({ "echo": payload }) })
        })
    }

    #[tokio::test]
    async fn actions_cross_to_the_other_end() {
        let bus = Arc::new(LocalHostBus::new());
        let provider = bus
            .provide(
                "webrtc:test-session:offer:answer",
                vec![("offer-description".into(), echo())],
            )
            .await
            .unwrap();

        let client = bus.connect("webrtc:test-session:offer:answer").await.unwrap();
        client.register("answer-description", echo());

        let res = client.dispatch("offer-description", json!(1)).await.unwrap();
        assert_eq!(res, json!({"echo": 1}));
        let res = provider.dispatch("answer-description", json!(2)).await.unwrap();
        assert_eq!(res, json!({"echo": 2}));

        // a side never handles its own dispatches
        let res = client.dispatch("answer-description", json!(3)).await;
        assert!(matches!(res, Err(Error::Transport(_))));
    }

    #[tokio::test]
    async fn connect_waits_for_provider() {
        let bus = Arc::new(LocalHostBus::new());
        let pending = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.connect("late").await.map(|e| e.name().to_owned()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!pending.is_finished());
        let _provider = bus.provide("late", Vec::new()).await.unwrap();
        assert_eq!(pending.await.unwrap().unwrap(), "late");
        assert!(bus.provide("late", Vec::new()).await.is_err());
    }

    #[tokio::test]
    async fn closed_ends_release_their_side() {
        let bus = Arc::new(LocalHostBus::new());
        let provider = bus
            .provide("session", vec![("offer-description".into(), echo())])
            .await
            .unwrap();
        let client = bus.connect("session").await.unwrap();
        client.register("answer-description", echo());

        client.close();
        let res = provider.dispatch("answer-description", json!(1)).await;
        assert!(matches!(res, Err(Error::Transport(_))));

        provider.close();
        let res = client.dispatch("offer-description", json!(2)).await;
        assert!(matches!(res, Err(Error::Transport(_))));

        // the name is free again and new clients reach the new provider only
        let next = bus
            .provide("session", vec![("offer-description".into(), echo())])
            .await
            .unwrap();
        let client = bus.connect("session").await.unwrap();
        let res = client.dispatch("offer-description", json!(3)).await.unwrap();
        assert_eq!(res, json!({"echo": 3}));

        // a stale provider end never removes its successor
        provider.close();
        assert!(bus.provide("session", Vec::new()).await.is_err());
        next.close();
        assert!(bus.provide("session", Vec::new()).await.is_ok());
    }
}
