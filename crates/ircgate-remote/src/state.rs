use std::collections::{HashMap, VecDeque};
use std::path::Path;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use ircgate_types::{
    Channel, File, Im, LoginInfo, RemoteEvent, SavedStatus, Timestamp, User,
};

use crate::echo::EchoFilter;
use crate::error::RemoteError;
use crate::members::MemberCache;
use crate::transport::RemoteTransport;

/// Most users a single invite call accepts.
pub const MAX_INVITE: usize = 30;

const CHANNEL_TYPES: &str = "public_channel,private_channel,mpim";
const PAGE_LIMIT: u32 = 1000;

/// Everything the gateway knows about the remote side.
///
/// Owns the transport and every cache. Each cache is invalidated through an
/// explicit method; nothing is cleared implicitly.
pub struct RemoteState {
    pub(crate) transport: Box<dyn RemoteTransport>,
    pub(crate) login_info: Option<LoginInfo>,

    /// Empty, or a complete snapshot of the channel listing.
    pub(crate) channels: Vec<Channel>,

    pub(crate) users_by_id: HashMap<String, User>,
    pub(crate) users_by_name: HashMap<String, User>,
    /// Bumped whenever the set of known user names grows.
    pub(crate) name_generation: u64,

    pub(crate) members: HashMap<String, MemberCache>,

    /// user id -> direct conversation id
    pub(crate) ims: HashMap<String, String>,

    /// Synthesized and normalized events not yet handed out, in production order.
    pub(crate) pending: VecDeque<RemoteEvent>,
    pub(crate) sent_by_self: EchoFilter,
    pub(crate) status: SavedStatus,
}

impl RemoteState {
    /// `previous_status` is the record written by `status_bytes` on a
    /// previous run. An unreadable record is discarded.
    pub fn new(transport: Box<dyn RemoteTransport>, previous_status: Option<&[u8]>) -> Self {
        let status = match previous_status {
            Some(bytes) => serde_json::from_slice(bytes).unwrap_or_else(|e| {
                warn!("Ignoring unreadable status record: {}", e);
                SavedStatus::default()
            }),
            None => SavedStatus::default(),
        };

        Self {
            transport,
            login_info: None,
            channels: Vec::new(),
            users_by_id: HashMap::new(),
            users_by_name: HashMap::new(),
            name_generation: 0,
            members: HashMap::new(),
            ims: HashMap::new(),
            pending: VecDeque::new(),
            sent_by_self: EchoFilter::default(),
            status,
        }
    }

    pub fn transport(&self) -> &dyn RemoteTransport {
        self.transport.as_ref()
    }

    pub async fn login(&mut self) -> Result<LoginInfo, RemoteError> {
        let info = self.transport.login().await?;
        info!("Logged in as {} on {}", info.self_.name, info.team.domain);
        self.login_info = Some(info.clone());
        Ok(info)
    }

    pub fn login_info(&self) -> Option<&LoginInfo> {
        self.login_info.as_ref()
    }

    /// Opens the event stream and replays whatever was missed since the
    /// last recorded timestamp.
    pub async fn connect_stream(&mut self) -> Result<(), RemoteError> {
        let info = self.transport.rtm_connect().await?;
        self.login_info = Some(info);
        self.backfill_history().await?;
        Ok(())
    }

    // -- Status --

    pub fn status(&self) -> &SavedStatus {
        &self.status
    }

    /// Serialized status, to be passed back to `new` on the next start.
    pub fn status_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.status).unwrap_or_default()
    }

    pub(crate) fn observe_timestamp(&mut self, ts: Timestamp) {
        if ts > self.status.last_timestamp {
            self.status.last_timestamp = ts;
        }
    }

    // -- Event queue --

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Hands out every queued event, oldest first.
    pub fn drain_events(&mut self) -> Vec<RemoteEvent> {
        self.pending.drain(..).collect()
    }

    pub(crate) fn push_event(&mut self, event: RemoteEvent) {
        debug!("Queued {} event", event.kind());
        self.pending.push_back(event);
    }

    // -- Raw calls --

    /// Performs an API call and turns an `ok: false` answer into an error.
    pub(crate) async fn call(&self, method: &str, params: Value) -> Result<Value, RemoteError> {
        let response = self.transport.api_call(method, params).await?;
        if response.get("ok").and_then(Value::as_bool) == Some(true) {
            Ok(response)
        } else {
            let error = response
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown_error")
                .to_string();
            Err(RemoteError::Api {
                method: method.to_string(),
                error,
            })
        }
    }

    // -- Channels --

    /// The channel listing, fetched only when the cache is empty or
    /// `refresh` is set.
    pub async fn channels(&mut self, refresh: bool) -> Result<Vec<Channel>, RemoteError> {
        if refresh {
            self.channels.clear();
        }
        if self.channels.is_empty() {
            let params = json!({
                "exclude_archived": true,
                "types": CHANNEL_TYPES,
                "limit": PAGE_LIMIT,
            });
            // Installed only once every page arrived.
            self.channels = self.list_paged("conversations.list", params, "channels").await?;
            debug!("Channel cache holds {} channels", self.channels.len());
        }
        Ok(self.channels.clone())
    }

    pub fn invalidate_channels(&mut self) {
        self.channels.clear();
    }

    pub async fn get_channel(&mut self, id: &str) -> Result<Channel, RemoteError> {
        self.find_channel(|c| c.id == id)
            .await?
            .ok_or_else(|| RemoteError::not_found("channel", id))
    }

    pub async fn get_channel_by_name(&mut self, name: &str) -> Result<Channel, RemoteError> {
        self.find_channel(|c| c.name == name)
            .await?
            .ok_or_else(|| RemoteError::not_found("channel", name))
    }

    /// Looks in the cache first, then once more in a fresh listing.
    async fn find_channel<F>(&mut self, pred: F) -> Result<Option<Channel>, RemoteError>
    where
        F: Fn(&Channel) -> bool,
    {
        for refresh in [false, true] {
            if let Some(c) = self.channels(refresh).await?.into_iter().find(|c| pred(c)) {
                return Ok(Some(c));
            }
        }
        Ok(None)
    }

    // -- Users --

    pub async fn get_user(&mut self, id: &str) -> Result<User, RemoteError> {
        if let Some(user) = self.users_by_id.get(id) {
            return Ok(user.clone());
        }

        let response = match self.call("users.info", json!({ "user": id })).await {
            Ok(r) => r,
            Err(RemoteError::Api { .. }) => return Err(RemoteError::not_found("user", id)),
            Err(e) => return Err(e),
        };
        let user: User = field("users.info", &response, "user")?;
        self.cache_user(user.clone());
        Ok(user)
    }

    /// Name lookups only consult the cache; names are learnt from id lookups
    /// and from `prefetch_users`.
    pub fn get_user_by_name(&self, name: &str) -> Option<&User> {
        self.users_by_name.get(name)
    }

    /// Loads the whole user directory in one go.
    pub async fn prefetch_users(&mut self) -> Result<usize, RemoteError> {
        let users: Vec<User> = self
            .list_paged("users.list", json!({ "limit": PAGE_LIMIT }), "members")
            .await?;
        let count = users.len();
        for user in users {
            self.users_by_name.insert(user.name.clone(), user.clone());
            self.users_by_id.insert(user.id.clone(), user);
        }
        self.name_generation += 1;
        info!("Prefetched {} users", count);
        Ok(count)
    }

    pub(crate) fn cache_user(&mut self, user: User) {
        if !self.users_by_name.contains_key(&user.name) {
            self.name_generation += 1;
        }
        self.users_by_name.insert(user.name.clone(), user.clone());
        self.users_by_id.insert(user.id.clone(), user);
    }

    /// Drops the id-keyed entry only. The name-keyed entry stays so that old
    /// references to the name still resolve.
    pub fn evict_user(&mut self, id: &str) -> bool {
        self.users_by_id.remove(id).is_some()
    }

    /// Generation of the known-names list. Changes whenever a name is added.
    pub fn name_generation(&self) -> u64 {
        self.name_generation
    }

    pub fn user_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.users_by_name.keys().cloned().collect();
        names.sort();
        names
    }

    // -- Direct conversations --

    pub fn is_known_im(&self, channel_id: &str) -> bool {
        self.ims.values().any(|id| id == channel_id)
    }

    /// Resolves a direct conversation id. `None` for anything that is not one.
    pub async fn get_im(&mut self, channel_id: &str) -> Result<Option<Im>, RemoteError> {
        if !channel_id.starts_with('D') {
            return Ok(None);
        }
        if let Some((user, id)) = self.ims.iter().find(|(_, id)| *id == channel_id) {
            return Ok(Some(Im {
                id: id.clone(),
                user: user.clone(),
            }));
        }

        let mut found = None;
        for im in self.get_ims().await? {
            self.ims.insert(im.user.clone(), im.id.clone());
            if im.id == channel_id {
                found = Some(im);
            }
        }
        Ok(found)
    }

    pub async fn get_ims(&self) -> Result<Vec<Im>, RemoteError> {
        let params = json!({
            "exclude_archived": true,
            "types": "im",
            "limit": PAGE_LIMIT,
        });
        self.list_paged("conversations.list", params, "channels").await
    }

    async fn im_for_user(&mut self, user_id: &str) -> Result<String, RemoteError> {
        if let Some(id) = self.ims.get(user_id) {
            return Ok(id.clone());
        }

        let existing = self.get_ims().await?.into_iter().find(|im| im.user == user_id);
        let channel_id = match existing {
            Some(im) => im.id,
            None => {
                let response = self
                    .call(
                        "conversations.open",
                        json!({ "users": user_id, "return_im": true }),
                    )
                    .await?;
                let opened: OpenedConversation =
                    field("conversations.open", &response, "channel")?;
                opened.id
            }
        };
        self.ims.insert(user_id.to_string(), channel_id.clone());
        Ok(channel_id)
    }

    // -- Actions --

    /// Posts a message and remembers its timestamp so the echo coming back on
    /// the event stream is not delivered again.
    pub async fn send_message(
        &mut self,
        channel_id: &str,
        text: &str,
        action: bool,
    ) -> Result<Timestamp, RemoteError> {
        let method = if action {
            "chat.meMessage"
        } else {
            "chat.postMessage"
        };
        let response = self
            .call(
                method,
                json!({ "channel": channel_id, "text": text, "as_user": true }),
            )
            .await?;
        let ts: Timestamp = field(method, &response, "ts")?;
        self.sent_by_self.record(ts);
        Ok(ts)
    }

    pub async fn send_message_to_user(
        &mut self,
        user_id: &str,
        text: &str,
        action: bool,
    ) -> Result<Timestamp, RemoteError> {
        let channel_id = self.im_for_user(user_id).await?;
        self.send_message(&channel_id, text, action).await
    }

    /// Forces away, or lets the remote decide presence again.
    pub async fn away(&self, is_away: bool) -> Result<(), RemoteError> {
        let presence = if is_away { "away" } else { "auto" };
        self.call("users.setPresence", json!({ "presence": presence }))
            .await?;
        Ok(())
    }

    pub async fn set_topic(&self, channel: &Channel, topic: &str) -> Result<(), RemoteError> {
        self.call(
            "conversations.setTopic",
            json!({ "channel": channel.id, "topic": topic }),
        )
        .await?;
        Ok(())
    }

    pub async fn kick(&self, channel: &Channel, user: &User) -> Result<(), RemoteError> {
        self.call(
            "conversations.kick",
            json!({ "channel": channel.id, "user": user.id }),
        )
        .await?;
        Ok(())
    }

    /// Joins the account to `channel`. The cached listing is dropped so the
    /// new membership flag is picked up on the next lookup.
    pub async fn join(&mut self, channel: &Channel) -> Result<(), RemoteError> {
        self.call("conversations.join", json!({ "channel": channel.id }))
            .await?;
        self.invalidate_channels();
        Ok(())
    }

    pub async fn invite(&self, channel: &Channel, users: &[User]) -> Result<(), RemoteError> {
        if users.len() > MAX_INVITE {
            return Err(RemoteError::TooManyUsers { max: MAX_INVITE });
        }
        let ids: Vec<&str> = users.iter().map(|u| u.id.as_str()).collect();
        self.call(
            "conversations.invite",
            json!({ "channel": channel.id, "users": ids.join(",") }),
        )
        .await?;
        Ok(())
    }

    pub async fn get_file(&self, file_id: &str) -> Result<File, RemoteError> {
        let response = match self.call("files.info", json!({ "file": file_id })).await {
            Ok(r) => r,
            Err(RemoteError::Api { .. }) => return Err(RemoteError::not_found("file", file_id)),
            Err(e) => return Err(e),
        };
        field("files.info", &response, "file")
    }

    /// Uploads a local file into a conversation.
    pub async fn send_file(&self, channel_id: &str, path: &Path) -> Result<(), RemoteError> {
        let content = tokio::fs::read(path).await?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());

        let response = self
            .transport
            .upload_file(channel_id, &filename, content)
            .await?;
        if response.get("ok").and_then(Value::as_bool) != Some(true) {
            return Err(RemoteError::Api {
                method: "files.upload".to_string(),
                error: response
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown_error")
                    .to_string(),
            });
        }
        info!("Uploaded {} to {}", filename, channel_id);
        Ok(())
    }

    /// Follows `response_metadata.next_cursor` until the listing ends and
    /// returns the concatenation of every page's `key` array.
    pub(crate) async fn list_paged<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        key: &str,
    ) -> Result<Vec<T>, RemoteError> {
        let mut all = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut page_params = params.clone();
            if let (Some(c), Some(obj)) = (&cursor, page_params.as_object_mut()) {
                obj.insert("cursor".to_string(), Value::String(c.clone()));
            }
            let response = self.call(method, page_params).await?;
            let mut page: Vec<T> = field(method, &response, key)?;
            all.append(&mut page);

            match next_cursor(&response) {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(all)
    }
}

#[derive(Deserialize)]
struct OpenedConversation {
    id: String,
}

/// Decodes `response[key]`.
pub(crate) fn field<T: DeserializeOwned>(
    method: &str,
    response: &Value,
    key: &str,
) -> Result<T, RemoteError> {
    let value = response.get(key).cloned().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|source| RemoteError::Decode {
        method: method.to_string(),
        source,
    })
}

/// The continuation cursor of a paged response. Missing and empty both
/// mean there is nothing more to fetch.
pub(crate) fn next_cursor(response: &Value) -> Option<String> {
    response
        .get("response_metadata")
        .and_then(|m| m.get("next_cursor"))
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
}
