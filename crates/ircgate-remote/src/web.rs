use std::time::Duration;

use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use reqwest::StatusCode;
use reqwest::header::{COOKIE, RETRY_AFTER};
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace, warn};

use ircgate_types::LoginInfo;

use crate::error::TransportError;
use crate::transport::RemoteTransport;

const API_BASE: &str = "https://slack.com/api";

type EventStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Credentials for the web API. Browser-session tokens (`xoxc-`) only work
/// together with the matching `d` cookie.
#[derive(Clone)]
pub struct Credentials {
    pub token: String,
    pub cookie: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix: String = self.token.chars().take(5).collect();
        f.debug_struct("Credentials")
            .field("token", &format_args!("{}...", prefix))
            .field("cookie", &self.cookie.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// `RemoteTransport` over the HTTPS API and the real-time websocket.
pub struct WebTransport {
    http: reqwest::Client,
    credentials: Credentials,
    api_base: String,
    stream: Mutex<Option<EventStream>>,
}

impl WebTransport {
    pub fn new(credentials: Credentials) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("ircgate/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            credentials,
            api_base: API_BASE.to_string(),
            stream: Mutex::new(None),
        })
    }

    /// Points the API at another base URL.
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    fn post(&self, method: &str) -> reqwest::RequestBuilder {
        let request = self
            .http
            .post(format!("{}/{}", self.api_base, method))
            .bearer_auth(&self.credentials.token);
        match &self.credentials.cookie {
            Some(cookie) => request.header(COOKIE, format!("d={}", cookie)),
            None => request,
        }
    }

    /// Sends a request, sleeping through rate limits as long as the remote
    /// asks to.
    async fn send(&self, method: &str, form: &[(String, String)]) -> Result<Value, TransportError> {
        loop {
            let response = self.post(method).form(form).send().await?;
            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                let wait = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .unwrap_or(1);
                warn!("Rate limited on {}, retrying in {}s", method, wait);
                tokio::time::sleep(Duration::from_secs(wait)).await;
                continue;
            }
            return Ok(response.error_for_status()?.json().await?);
        }
    }

    async fn rtm_start(&self) -> Result<(LoginInfo, String), TransportError> {
        let response = self.api_call("rtm.connect", Value::Object(Default::default())).await?;
        if response.get("ok").and_then(Value::as_bool) != Some(true) {
            let error = response
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown_error");
            return Err(TransportError::Other(format!("rtm.connect failed: {}", error)));
        }
        let url = response
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| TransportError::Other("rtm.connect returned no url".to_string()))?
            .to_string();
        let info: LoginInfo = serde_json::from_value(response)?;
        Ok((info, url))
    }
}

/// Flattens a JSON object into form fields. Strings are sent as-is, every
/// other value in its JSON text form.
fn form_fields(params: &Value) -> Vec<(String, String)> {
    let Some(obj) = params.as_object() else {
        return Vec::new();
    };
    obj.iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), v)
        })
        .collect()
}

fn parse_frame(text: &str) -> Option<Value> {
    trace!("<< {}", text);
    match serde_json::from_str(text) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("Discarding unreadable event frame: {}", e);
            None
        }
    }
}

#[async_trait]
impl RemoteTransport for WebTransport {
    async fn login(&self) -> Result<LoginInfo, TransportError> {
        let (info, _) = self.rtm_start().await?;
        Ok(info)
    }

    async fn api_call(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        debug!("API call {}", method);
        self.send(method, &form_fields(&params)).await
    }

    async fn rtm_connect(&self) -> Result<LoginInfo, TransportError> {
        let (info, url) = self.rtm_start().await?;
        let (ws, _) = connect_async(url.as_str()).await?;
        info!("Event stream open for {}", info.team.domain);
        *self.stream.lock().await = Some(ws);
        Ok(info)
    }

    async fn rtm_read(&self) -> Result<Vec<Value>, TransportError> {
        let mut guard = self.stream.lock().await;
        let ws = guard.as_mut().ok_or(TransportError::NotConnected)?;

        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let mut batch: Vec<Value> = parse_frame(text.as_str()).into_iter().collect();
                    // Take whatever else is already buffered.
                    while let Some(Some(Ok(Message::Text(more)))) = ws.next().now_or_never() {
                        batch.extend(parse_frame(more.as_str()));
                    }
                    if !batch.is_empty() {
                        return Ok(batch);
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("Event stream closed: {:?}", frame);
                    *guard = None;
                    return Err(TransportError::Disconnected);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    *guard = None;
                    return Err(e.into());
                }
                None => {
                    *guard = None;
                    return Err(TransportError::Disconnected);
                }
            }
        }
    }

    async fn upload_file(
        &self,
        channel_id: &str,
        filename: &str,
        content: Vec<u8>,
    ) -> Result<Value, TransportError> {
        let form = Form::new()
            .text("channels", channel_id.to_string())
            .text("filename", filename.to_string())
            .part("file", Part::bytes(content).file_name(filename.to_string()));
        let response = self
            .post("files.upload")
            .multipart(form)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}
