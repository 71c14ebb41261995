//! Scripted transport for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Notify;

use ircgate_types::{LoginInfo, SelfInfo, Team};

use crate::error::TransportError;
use crate::transport::RemoteTransport;

enum StreamItem {
    Batch(Vec<Value>),
    Disconnect,
}

struct Inner {
    responses: HashMap<String, VecDeque<Value>>,
    calls: Vec<(String, Value)>,
    stream: VecDeque<StreamItem>,
    failing_connects: usize,
    connects: usize,
    login: LoginInfo,
    uploads: Vec<(String, String, Vec<u8>)>,
}

/// A `RemoteTransport` answering from canned responses.
///
/// Responses queued for a method are handed out in order; the last one keeps
/// being repeated. Methods with no response answer `not_mocked`. Clones share
/// the same script, so a test keeps one handle while the state owns another.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<Inner>>,
    stream_ready: Arc<Notify>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        let login = LoginInfo {
            self_: SelfInfo {
                id: "U0".to_string(),
                name: "me".to_string(),
            },
            team: Team {
                name: "Team".to_string(),
                domain: "team".to_string(),
            },
        };
        Self {
            inner: Arc::new(Mutex::new(Inner {
                responses: HashMap::new(),
                calls: Vec::new(),
                stream: VecDeque::new(),
                failing_connects: 0,
                connects: 0,
                login,
                uploads: Vec::new(),
            })),
            stream_ready: Arc::new(Notify::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking test poisons the lock; the script itself is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn respond(&self, method: &str, response: Value) {
        self.lock()
            .responses
            .entry(method.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn set_login(&self, login: LoginInfo) {
        self.lock().login = login;
    }

    /// Makes the next `n` stream connections fail.
    pub fn fail_connects(&self, n: usize) {
        self.lock().failing_connects = n;
    }

    /// Successful stream connections so far.
    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    pub fn push_events(&self, batch: Vec<Value>) {
        self.lock().stream.push_back(StreamItem::Batch(batch));
        self.stream_ready.notify_one();
    }

    /// Makes the stream fail once every earlier batch was read.
    pub fn push_disconnect(&self) {
        self.lock().stream.push_back(StreamItem::Disconnect);
        self.stream_ready.notify_one();
    }

    /// Every API call made, in order.
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.lock().calls.clone()
    }

    /// Parameters of every call to `method`, in order.
    pub fn calls_to(&self, method: &str) -> Vec<Value> {
        self.lock()
            .calls
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// `(channel, filename, content)` of every upload.
    pub fn uploads(&self) -> Vec<(String, String, Vec<u8>)> {
        self.lock().uploads.clone()
    }

    fn answer(&self, method: &str, params: Value) -> Value {
        let mut inner = self.lock();
        inner.calls.push((method.to_string(), params));
        match inner.responses.get_mut(method) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
            Some(queue) => queue.front().cloned().unwrap_or_default(),
            None => json!({"ok": false, "error": "not_mocked"}),
        }
    }
}

#[async_trait]
impl RemoteTransport for MockTransport {
    async fn login(&self) -> Result<LoginInfo, TransportError> {
        Ok(self.lock().login.clone())
    }

    async fn api_call(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        Ok(self.answer(method, params))
    }

    async fn rtm_connect(&self) -> Result<LoginInfo, TransportError> {
        let mut inner = self.lock();
        if inner.failing_connects > 0 {
            inner.failing_connects -= 1;
            return Err(TransportError::Other("connection refused".to_string()));
        }
        inner.connects += 1;
        Ok(inner.login.clone())
    }

    async fn rtm_read(&self) -> Result<Vec<Value>, TransportError> {
        loop {
            let item = self.lock().stream.pop_front();
            match item {
                Some(StreamItem::Batch(batch)) => return Ok(batch),
                Some(StreamItem::Disconnect) => return Err(TransportError::Disconnected),
                None => self.stream_ready.notified().await,
            }
        }
    }

    async fn upload_file(
        &self,
        channel_id: &str,
        filename: &str,
        content: Vec<u8>,
    ) -> Result<Value, TransportError> {
        self.lock()
            .uploads
            .push((channel_id.to_string(), filename.to_string(), content));
        Ok(self.answer(
            "files.upload",
            json!({ "channels": channel_id, "filename": filename }),
        ))
    }
}
