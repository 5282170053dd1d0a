use crate::config::{Configuration, Strategy};
use crate::connection::{BusNegotiator, Connection, Negotiator, RelayNegotiator};
use crate::engine::rtc::WebrtcEngineFactory;
use crate::engine::EngineFactory;
use crate::error::Error;
use crate::signaling::{HttpRelay, RelayService};
use std::sync::Arc;

/// Entry point creating [Connection]s. Picks the signaling strategy from the [Configuration]:
/// a host bus if one is set, the signaling relay otherwise.
#[derive(Clone)]
pub struct ConnectionFactory {
    engines: Arc<dyn EngineFactory>,
    relay: Option<Arc<dyn RelayService>>,
}

impl ConnectionFactory {
    /// Factory backed by webrtc-rs.
    pub fn new() -> Result<Self, Error> {
        Ok(Self::with_engine_factory(Arc::new(WebrtcEngineFactory::new()?)))
    }

    pub fn with_engine_factory(engines: Arc<dyn EngineFactory>) -> Self {
        ConnectionFactory {
            engines,
            relay: None,
        }
    }

    /// Uses `relay` instead of an [HttpRelay] built from the configured signaling url. The url
    /// must still be set, it selects the relay strategy.
    pub fn with_relay(mut self, relay: Arc<dyn RelayService>) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Creates an uninitialized connection, so listeners can be registered before
    /// [Connection::initialize] starts negotiation. Must be called within a tokio runtime.
    pub fn connection(&self, config: Configuration) -> Result<Connection, Error> {
        let negotiator = match config.strategy()? {
            Strategy::HostBus => {
                let bus = config
                    .host_bus()
                    .cloned()
                    .ok_or_else(|| Error::Config("host bus is not set".into()))?;
                Negotiator::HostBus(BusNegotiator::new(
                    bus,
                    config.pairing_code(),
                    config.is_initiator(),
                ))
            }
            Strategy::Relay => {
                let relay = match &self.relay {
                    Some(relay) => relay.clone(),
                    None => {
                        let url = config
                            .signaling_url()
                            .cloned()
                            .ok_or_else(|| Error::Config("signaling url is not set".into()))?;
                        Arc::new(HttpRelay::new(url)?)
                    }
                };
                Negotiator::Relay(RelayNegotiator::new(config.pairing_code(), relay))
            }
        };
        Ok(Connection::new(config, self.engines.clone(), negotiator))
    }

    /// Creates a connection and starts negotiating right away.
    pub async fn create_connection(&self, config: Configuration) -> Result<Connection, Error> {
        let conn = self.connection(config)?;
        conn.initialize().await?;
        Ok(conn)
    }
}

impl std::fmt::Debug for ConnectionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("custom_relay", &self.relay.is_some())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::ConnectionFactory;
    use crate::config::{Configuration, Strategy};
    use crate::connection::ConnectionState;
    use crate::engine::testing::MockEngineFactory;
    use crate::error::Error;
    use crate::host_bus::LocalHostBus;
    use crate::signaling::MemoryRelay;
    use std::sync::Arc;

    #[tokio::test]
    async fn picks_strategy_from_configuration() {
        let factory = ConnectionFactory::with_engine_factory(MockEngineFactory::new());

        let conn = factory
            .connection(Configuration::new("test-session").with_host_bus(Arc::new(LocalHostBus::new())))
            .unwrap();
        assert_eq!(conn.strategy(), Strategy::HostBus);
        assert_eq!(conn.state(), ConnectionState::Created);

        let config = Configuration::new("test-session")
            .with_signaling_url("https://relay.example.com")
            .unwrap();
        let conn = factory.connection(config).unwrap();
        assert_eq!(conn.strategy(), Strategy::Relay);
        assert_eq!(conn.pairing_code(), "test-session");
    }

    #[tokio::test]
    async fn rejects_incomplete_configuration() {
        let factory = ConnectionFactory::with_engine_factory(MockEngineFactory::new());
        let res = factory.connection(Configuration::new("test-session"));
        assert!(matches!(res, Err(Error::Config(_))));
        let res = factory.connection(
            Configuration::new("").with_host_bus(Arc::new(LocalHostBus::new())),
        );
        assert!(matches!(res, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn rejected_preflight_fails_creation() {
        let relay = MemoryRelay::new().with_auth_status(401);
        let factory = ConnectionFactory::with_engine_factory(MockEngineFactory::new())
            .with_relay(Arc::new(relay));
        let config = Configuration::new("test-session")
            .with_signaling_url("http://relay.invalid")
            .unwrap();
        let res = factory.create_connection(config).await;
        assert!(matches!(res, Err(Error::Transport(_))));
    }
}
