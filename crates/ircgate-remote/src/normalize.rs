use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use ircgate_types::{
    BotMessage, Channel, FileShared, Membership, Message, MessageDelete, MessageEdit,
    RemoteEvent, Timestamp, TopicChange,
};

use crate::state::RemoteState;

/// Event types that never reach the client.
const NOISE: &[&str] = &[
    "channel_marked",
    "group_marked",
    "mpim_marked",
    "hello",
    "dnd_updated_user",
    "reaction_added",
    "user_typing",
    "file_deleted",
    "file_public",
    "file_created",
    "desktop_notification",
];

impl RemoteState {
    /// Normalizes a whole batch read from the event stream and queues every
    /// resulting event in order.
    pub async fn ingest(&mut self, raws: Vec<Value>) {
        for raw in raws {
            if let Some(event) = self.normalize(raw).await {
                self.push_event(event);
            }
        }
    }

    /// Turns one raw stream event into a typed event, or `None` when it is
    /// noise, an echo of our own message, or of no interest to the client.
    ///
    /// Cache side effects (membership, user eviction, channel invalidation)
    /// are applied here, before the event is handed out.
    pub async fn normalize(&mut self, raw: Value) -> Option<RemoteEvent> {
        let event = self.classify(raw).await;
        self.sent_by_self.purge(Timestamp::now());
        event
    }

    async fn classify(&mut self, raw: Value) -> Option<RemoteEvent> {
        let ts = raw
            .get("ts")
            .and_then(|v| serde_json::from_value::<Timestamp>(v.clone()).ok());
        if let Some(ts) = ts {
            self.observe_timestamp(ts);
        }

        let kind = raw.get("type").and_then(Value::as_str).unwrap_or_default();
        if NOISE.contains(&kind) {
            return None;
        }
        if ts.is_some_and(|ts| self.sent_by_self.consume(ts)) {
            debug!("Dropping echo of own message {:?}", ts);
            return None;
        }

        let subtype = raw.get("subtype").and_then(Value::as_str);
        match (kind, subtype) {
            ("message", Some("group_topic" | "channel_topic")) => {
                decode::<TopicChange>(raw).map(RemoteEvent::TopicChange)
            }
            ("file_shared", _) => decode::<FileShared>(raw).map(RemoteEvent::FileShared),
            ("message", Some("bot_message")) => decode::<BotMessage>(raw).map(RemoteEvent::Bot),
            ("message", Some("message_changed")) => {
                decode::<MessageEdit>(raw).map(RemoteEvent::Edit)
            }
            ("message", Some("message_deleted")) => {
                decode::<MessageDelete>(raw).map(RemoteEvent::Delete)
            }
            ("group_joined", _) => {
                let channel = raw.get("channel").cloned().and_then(decode::<Channel>)?;
                self.invalidate_channels();
                Some(RemoteEvent::GroupJoined(channel))
            }
            ("member_joined_channel", _) => {
                let m = decode::<Membership>(raw)?;
                self.member_joined(&m.channel, &m.user);
                Some(RemoteEvent::Join(m))
            }
            ("member_left_channel", _) => {
                let m = decode::<Membership>(raw)?;
                self.member_left(&m.channel, &m.user);
                Some(RemoteEvent::Leave(m))
            }
            ("message", None | Some("me_message")) => {
                let is_action = subtype.is_some();
                let msg = decode::<Message>(raw)?;
                let msg = self.from_other_client(msg).await;
                Some(if is_action {
                    RemoteEvent::Action(msg)
                } else {
                    RemoteEvent::Message(msg)
                })
            }
            ("message", Some("slackbot_response")) => {
                decode::<Message>(raw).map(RemoteEvent::Message)
            }
            ("user_change", _) => {
                if let Some(id) = raw.pointer("/user/id").and_then(Value::as_str) {
                    self.evict_user(id);
                }
                None
            }
            _ => {
                debug!("Ignoring event {} {:?}", kind, subtype);
                None
            }
        }
    }

    /// A message in a direct conversation that was written by the account
    /// itself from another client is shown as coming from the peer.
    async fn from_other_client(&mut self, mut msg: Message) -> Message {
        let im = match self.get_im(&msg.channel).await {
            Ok(Some(im)) => im,
            Ok(None) => return msg,
            Err(e) => {
                warn!("Unable to resolve conversation {}: {}", msg.channel, e);
                return msg;
            }
        };
        if im.user != msg.user {
            msg.user = im.user;
            msg.text = format!("I say: {}", msg.text);
        }
        msg
    }
}

fn decode<T: DeserializeOwned>(raw: Value) -> Option<T> {
    match serde_json::from_value(raw) {
        Ok(v) => Some(v),
        Err(e) => {
            debug!("Unreadable event: {}", e);
            None
        }
    }
}
