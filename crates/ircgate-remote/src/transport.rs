use async_trait::async_trait;
use serde_json::Value;

use ircgate_types::LoginInfo;

use crate::error::TransportError;

/// Raw access to the remote service.
///
/// `api_call` returns the decoded JSON body whatever its `ok` flag; callers
/// decide what a non-ok answer means. `rtm_read` must be cancel-safe: the
/// connection driver races it against client input and drops it whenever a
/// client line arrives first.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Validates the credentials and returns the account identity.
    async fn login(&self) -> Result<LoginInfo, TransportError>;

    async fn api_call(&self, method: &str, params: Value) -> Result<Value, TransportError>;

    /// Opens (or reopens) the push event stream.
    async fn rtm_connect(&self) -> Result<LoginInfo, TransportError>;

    /// Waits for the next batch of raw events. Fails once the stream is gone.
    async fn rtm_read(&self) -> Result<Vec<Value>, TransportError>;

    /// Uploads `content` as `filename` into the given conversation.
    async fn upload_file(
        &self,
        channel_id: &str,
        filename: &str,
        content: Vec<u8>,
    ) -> Result<Value, TransportError>;
}
