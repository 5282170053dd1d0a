use crate::connection::ConnectionInner;
use crate::engine::SdpType;
use crate::error::Error;
use crate::host_bus::{ActionHandler, BusEndpoint, HostBus};
use crate::payload::{DescriptionEnvelope, NegotiationResult};
use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Action carrying the offering side's bundled description.
pub const OFFER_ACTION: &str = "offer-description";
/// Action carrying the answering side's bundled description.
pub const ANSWER_ACTION: &str = "answer-description";

/// Name of the bus channel used by a pairing session.
pub fn bus_channel_name(pairing_code: &str) -> String {
    format!("webrtc:{pairing_code}:offer:answer")
}

/// Host-bus strategy: a single offer/answer round trip on a bus channel, each description sent
/// only once candidate gathering completed.
pub(crate) struct BusNegotiator {
    bus: Arc<dyn HostBus>,
    channel_name: String,
    initiator: bool,
    endpoint: watch::Sender<Option<Arc<dyn BusEndpoint>>>,
}

impl BusNegotiator {
    pub fn new(bus: Arc<dyn HostBus>, pairing_code: &str, initiator: bool) -> Self {
        BusNegotiator {
            bus,
            channel_name: bus_channel_name(pairing_code),
            initiator,
            endpoint: watch::channel(None).0,
        }
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// Waits until this side's end of the bus channel is known. The provider may be asked to
    /// answer before `provide` returned.
    async fn endpoint(&self, shutdown: &CancellationToken) -> Result<Arc<dyn BusEndpoint>, Error> {
        let mut rx = self.endpoint.subscribe();
        let endpoint = tokio::select! {
            _ = shutdown.cancelled() => return Err(Error::Closed),
            ep = rx.wait_for(Option::is_some) => ep.map(|ep| ep.clone()),
        };
        endpoint
            .ok()
            .flatten()
            .ok_or_else(|| Error::transport(format!("bus channel {} is gone", self.channel_name)))
    }

    /// Stores this side's end, releasing it right away if the connection is already closing.
    fn publish(
        &self,
        conn: &ConnectionInner,
        endpoint: Arc<dyn BusEndpoint>,
    ) -> Result<(), Error> {
        self.endpoint.send_replace(Some(endpoint));
        if conn.shutdown_token().is_cancelled() {
            self.close();
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Releases this side's end of the bus channel, if there is one.
    pub fn close(&self) {
        if let Some(endpoint) = self.endpoint.send_replace(None) {
            log::debug!("releasing bus channel {}", endpoint.name());
            endpoint.close();
        }
    }

    pub async fn initialize(&self, conn: &Arc<ConnectionInner>) -> Result<(), Error> {
        let rtc_config = conn.config().rtc_config().clone();
        conn.create_engine(&rtc_config).await?;
        if self.initiator {
            conn.initialize_offer().await?;
            let weak = Arc::downgrade(conn);
            tokio::spawn(async move {
                let Some(conn) = weak.upgrade() else { return };
                let Some(bus) = conn.bus() else { return };
                let res = tokio::select! {
                    _ = conn.shutdown_token().cancelled() => return,
                    res = bus.send_offer(&conn) => res,
                };
                if let Err(e) = res {
                    conn.fail(e);
                }
            });
        } else {
            let actions = vec![(
                OFFER_ACTION.to_owned(),
                handler(Arc::downgrade(conn), on_offer),
            )];
            let endpoint = self.bus.provide(&self.channel_name, actions).await?;
            self.publish(conn, endpoint)?;
        }
        Ok(())
    }

    /// Waits for candidate gathering, then ships the offer and registers for the answer.
    async fn send_offer(&self, conn: &Arc<ConnectionInner>) -> Result<(), Error> {
        conn.gathering_complete().await?;
        let offer = conn.local_description(SdpType::Offer).await?;
        log::debug!("connecting to bus channel {}", self.channel_name);
        let endpoint = self.bus.connect(&self.channel_name).await?;
        endpoint.register(ANSWER_ACTION, handler(Arc::downgrade(conn), on_answer));
        self.publish(conn, endpoint.clone())?;

        let response = endpoint
            .dispatch(OFFER_ACTION, serde_json::to_value(DescriptionEnvelope { description: offer })?)
            .await?;
        let result: NegotiationResult = serde_json::from_value(response)?;
        if !result.is_ok() {
            log::warn!(
                "peer could not process offer: {} {}",
                result.status,
                result.message.unwrap_or_default()
            );
        }
        Ok(())
    }
}

type Action = fn(Arc<ConnectionInner>, Value) -> BoxFuture<'static, Result<(), Error>>;

/// Wraps a negotiation step into a bus action handler replying with a [NegotiationResult].
fn handler(conn: Weak<ConnectionInner>, action: Action) -> ActionHandler {
    Arc::new(move |payload: Value| -> BoxFuture<'static, Value> {
        let conn = conn.clone();
        Box::pin(async move {
            let res = match conn.upgrade() {
                Some(conn) => action(conn, payload).await,
                None => Err(Error::Closed),
            };
            if let Err(e) = &res {
                log::error!("bus negotiation step failed: {e}");
            }
            serde_json::to_value(NegotiationResult::from(res))
                .unwrap_or_else(|_| json!({ "status": NegotiationResult::FAILED }))
        })
    })
}

fn description(payload: Value, expected: SdpType) -> Result<String, Error> {
    let envelope: DescriptionEnvelope = serde_json::from_value(payload)?;
    if envelope.description.sdp_type != expected {
        return Err(Error::protocol(format!(
            "expected {expected:?} description, got {:?}",
            envelope.description.sdp_type
        )));
    }
    Ok(envelope.description.sdp)
}

fn on_answer(conn: Arc<ConnectionInner>, payload: Value) -> BoxFuture<'static, Result<(), Error>> {
    Box::pin(async move {
        let sdp = description(payload, SdpType::Answer)?;
        conn.apply_answer(sdp).await
    })
}

/// Answering side: applies the offer and dispatches the answer once gathering completed.
fn on_offer(conn: Arc<ConnectionInner>, payload: Value) -> BoxFuture<'static, Result<(), Error>> {
    Box::pin(async move {
        let sdp = description(payload, SdpType::Offer)?;
        conn.answer_offer(sdp).await?;
        conn.gathering_complete().await?;
        let answer = conn.local_description(SdpType::Answer).await?;
        let endpoint = conn
            .bus()
            .ok_or_else(|| Error::protocol("not a host-bus connection"))?
            .endpoint(conn.shutdown_token())
            .await?;
        let response = endpoint
            .dispatch(
                ANSWER_ACTION,
                serde_json::to_value(DescriptionEnvelope { description: answer })?,
            )
            .await?;
        let result: NegotiationResult = serde_json::from_value(response)?;
        if result.is_ok() {
            Ok(())
        } else {
            Err(Error::Negotiation(result.message.unwrap_or_else(|| {
                format!("peer rejected answer with status {}", result.status)
            })))
        }
    })
}
