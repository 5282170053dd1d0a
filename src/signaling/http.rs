use crate::config::RtcConfig;
use crate::error::Error;
use crate::signaling::{EventSocket, RelayService, SessionCookies, SocketEvent, SocketSession};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

const AUTH_CHECK_PATH: &str = "api/auth/check";
const RTC_CONFIG_PATH: &str = "api/webrtc/rtcConfig";
const DEFAULT_SOCKET_PATH: &str = "socket";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Signaling relay reached over HTTP (authorization, ICE configuration) and a websocket
/// carrying JSON event frames `{"event": "...", "args": [...]}`.
#[derive(Debug, Clone)]
pub struct HttpRelay {
    base: Url,
    socket_path: String,
    client: reqwest::Client,
}

impl HttpRelay {
    pub fn new(base: Url) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(HttpRelay {
            base,
            socket_path: DEFAULT_SOCKET_PATH.to_owned(),
            client,
        })
    }

    pub fn with_socket_path(mut self, path: &str) -> Self {
        self.socket_path = path.trim_start_matches('/').to_owned();
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base.as_str().trim_end_matches('/'), path)
    }

    fn socket_url(&self) -> Result<Url, Error> {
        let mut url = Url::parse(&self.endpoint(&self.socket_path))?;
        let scheme = match url.scheme() {
            "https" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| Error::Config(format!("cannot derive socket url from {}", self.base)))?;
        Ok(url)
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, Error> {
        let uri = self.endpoint(path);
        log::debug!("requesting {uri}");
        let response = self.client.get(&uri).send().await?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(Error::transport(format!(
                "signaling request {uri} failed with {}",
                response.status().as_u16()
            )));
        }
        Ok(response)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RtcConfigResponse {
    rtc_config: RtcConfig,
}

#[async_trait]
impl RelayService for HttpRelay {
    async fn authorize(&self) -> Result<SessionCookies, Error> {
        let response = self.get(AUTH_CHECK_PATH).await?;
        let cookies = response
            .cookies()
            .map(|c| (c.name().to_owned(), c.value().to_owned()))
            .collect();
        Ok(SessionCookies::new(cookies))
    }

    async fn rtc_config(&self) -> Result<RtcConfig, Error> {
        let response = self.get(RTC_CONFIG_PATH).await?;
        let body: RtcConfigResponse = response.json().await?;
        Ok(body.rtc_config)
    }

    async fn connect(&self, cookies: &SessionCookies) -> Result<SocketSession, Error> {
        let url = self.socket_url()?;
        log::debug!("connecting {url}");
        let mut request = url.as_str().into_client_request()?;
        if !cookies.is_empty() {
            let header = HeaderValue::from_str(&cookies.header())
                .map_err(|e| Error::transport(format!("invalid session cookie: {e}")))?;
            request.headers_mut().insert(COOKIE, header);
        }
        let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| Error::Timeout(CONNECT_TIMEOUT))??;
        let (mut sink, mut stream) = ws.split();

        let connected = Arc::new(AtomicBool::new(true));
        let (events_tx, events) = unbounded_channel();
        let (outbound, mut outbound_rx) = unbounded_channel::<Message>();

        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    log::warn!("signaling socket write failed: {e}");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        {
            let connected = connected.clone();
            tokio::spawn(async move {
                let reason = loop {
                    match stream.next().await {
                        Some(Ok(Message::Text(text))) => match serde_json::from_str::<Frame>(&text) {
                            Ok(frame) => match SocketEvent::from_frame(&frame.event, &frame.args) {
                                Some(event) => {
                                    if events_tx.send(event).is_err() {
                                        break "event receiver dropped".to_owned();
                                    }
                                }
                                None => log::trace!("ignoring socket event '{}'", frame.event),
                            },
                            Err(e) => log::warn!("malformed socket frame: {e}"),
                        },
                        Some(Ok(Message::Close(frame))) => {
                            break frame
                                .map(|f| f.reason.to_string())
                                .unwrap_or_else(|| "closed by relay".to_owned())
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break e.to_string(),
                        None => break "socket stream ended".to_owned(),
                    }
                };
                connected.store(false, Ordering::SeqCst);
                let _ = events_tx.send(SocketEvent::Disconnected(reason));
            });
        }

        Ok(SocketSession {
            socket: Arc::new(WsSocket {
                outbound,
                connected,
            }),
            events,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    event: String,
    #[serde(default)]
    args: Vec<Value>,
}

struct WsSocket {
    outbound: UnboundedSender<Message>,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl EventSocket for WsSocket {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }

    async fn emit(&self, event: &str, args: Vec<Value>) -> Result<(), Error> {
        let frame = serde_json::to_string(&Frame {
            event: event.to_owned(),
            args,
        })?;
        self.outbound
            .send(Message::Text(frame))
            .map_err(|_| Error::transport("Socket is not connected"))
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.outbound.send(Message::Close(None));
    }
}
