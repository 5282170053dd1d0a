use crate::error::Error;
use crate::host_bus::HostBus;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Default bound applied to every create/set description wait.
pub const DEFAULT_DESCRIPTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings of a single pairing session.
#[derive(Clone)]
pub struct Configuration {
    pairing_code: Arc<str>,
    signaling_url: Option<Url>,
    host_bus: Option<Arc<dyn HostBus>>,
    initiator: bool,
    rtc_config: RtcConfig,
    description_timeout: Option<Duration>,
}

impl Configuration {
    pub fn new(pairing_code: impl Into<Arc<str>>) -> Self {
        Configuration {
            pairing_code: pairing_code.into(),
            signaling_url: None,
            host_bus: None,
            initiator: true,
            rtc_config: RtcConfig::default(),
            description_timeout: Some(DEFAULT_DESCRIPTION_TIMEOUT),
        }
    }

    /// Base address of the signaling relay, eg. `https://signaling.example.com`.
    pub fn with_signaling_url(mut self, url: &str) -> Result<Self, Error> {
        let url = Url::parse(url)?;
        match url.scheme() {
            "http" | "https" => {
                self.signaling_url = Some(url);
                Ok(self)
            }
            other => Err(Error::Config(format!(
                "unsupported signaling url scheme '{other}'"
            ))),
        }
    }

    pub fn with_host_bus(mut self, bus: Arc<dyn HostBus>) -> Self {
        self.host_bus = Some(bus);
        self
    }

    /// Host-bus role: the initiator offers, the other side answers. Ignored by the relay
    /// strategy, where the relay elects the offering side.
    pub fn with_initiator(mut self, initiator: bool) -> Self {
        self.initiator = initiator;
        self
    }

    /// ICE servers used by the host-bus strategy. The relay strategy fetches its own.
    pub fn with_rtc_config(mut self, rtc_config: RtcConfig) -> Self {
        self.rtc_config = rtc_config;
        self
    }

    pub fn with_description_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.description_timeout = timeout;
        self
    }

    pub fn pairing_code(&self) -> &str {
        &self.pairing_code
    }

    pub fn signaling_url(&self) -> Option<&Url> {
        self.signaling_url.as_ref()
    }

    pub fn host_bus(&self) -> Option<&Arc<dyn HostBus>> {
        self.host_bus.as_ref()
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn rtc_config(&self) -> &RtcConfig {
        &self.rtc_config
    }

    pub fn description_timeout(&self) -> Option<Duration> {
        self.description_timeout
    }

    /// Name of the data channel used only to kick off candidate gathering.
    pub fn default_channel_name(&self) -> String {
        format!("{}:default", self.pairing_code)
    }

    /// Resolves the signaling strategy. A host bus always takes precedence over a relay.
    pub fn strategy(&self) -> Result<Strategy, Error> {
        if self.pairing_code.trim().is_empty() {
            return Err(Error::Config("pairing code must not be empty".into()));
        }
        if self.host_bus.is_some() {
            Ok(Strategy::HostBus)
        } else if self.signaling_url.is_some() {
            Ok(Strategy::Relay)
        } else {
            Err(Error::Config(
                "either a host bus or a signaling url is required".into(),
            ))
        }
    }
}

impl std::fmt::Debug for Configuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Configuration")
            .field("pairing_code", &self.pairing_code)
            .field("signaling_url", &self.signaling_url.as_ref().map(Url::as_str))
            .field("host_bus", &self.host_bus.is_some())
            .field("initiator", &self.initiator)
            .field("description_timeout", &self.description_timeout)
            .finish()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// Public signaling relay with room semantics and trickle ICE.
    Relay,
    /// Application-hosted message bus, candidates bundled into the description.
    HostBus,
}

/// Subset of the browser `RTCConfiguration` relevant for data channels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcConfig {
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        IceServer {
            urls: vec![url.into()],
            ..Default::default()
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Urls {
        One(String),
        Many(Vec<String>),
    }
    Ok(match Urls::deserialize(deserializer)? {
        Urls::One(url) => vec![url],
        Urls::Many(urls) => urls,
    })
}
