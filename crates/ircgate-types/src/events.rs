use serde::Deserialize;

use crate::diff::seddiff;
use crate::models::Channel;
use crate::timestamp::Timestamp;

/// A plain message in a channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Message {
    pub channel: String,
    pub user: String,
    pub text: String,
}

/// Message posted by an integration; carries a display name, not a user id.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BotMessage {
    pub channel: String,
    #[serde(default)]
    pub text: String,
    #[serde(default = "default_bot_name")]
    pub username: String,
    #[serde(default)]
    pub bot_id: Option<String>,
}

fn default_bot_name() -> String {
    "bot".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MessageBody {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MessageEdit {
    pub channel: String,
    #[serde(rename = "previous_message")]
    pub previous: MessageBody,
    #[serde(rename = "message")]
    pub current: MessageBody,
}

impl MessageEdit {
    pub fn is_changed(&self) -> bool {
        self.previous.text != self.current.text
    }

    /// The edit rendered as a substitution message from the current author.
    pub fn diff_message(&self) -> Message {
        Message {
            channel: self.channel.clone(),
            user: self.current.user.clone(),
            text: seddiff(&self.previous.text, &self.current.text),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MessageDelete {
    pub channel: String,
    pub previous_message: MessageBody,
}

impl MessageDelete {
    pub fn user(&self) -> &str {
        &self.previous_message.user
    }

    pub fn text(&self) -> &str {
        &self.previous_message.text
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileShared {
    pub file_id: String,
    pub user_id: String,
    #[serde(default)]
    pub ts: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TopicChange {
    pub channel: String,
    pub user: String,
    pub topic: String,
}

/// Somebody joined or left a channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Membership {
    pub channel: String,
    pub user: String,
}

/// Typed events produced from the remote event stream, from history
/// backfill, and from membership pagination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEvent {
    Message(Message),
    Action(Message),
    Bot(BotMessage),
    Edit(MessageEdit),
    Delete(MessageDelete),
    FileShared(FileShared),
    TopicChange(TopicChange),
    Join(Membership),
    Leave(Membership),
    /// The account was added to a channel it could not see before.
    GroupJoined(Channel),
}

impl RemoteEvent {
    pub fn channel_id(&self) -> Option<&str> {
        match self {
            Self::Message(m) | Self::Action(m) => Some(&m.channel),
            Self::Bot(b) => Some(&b.channel),
            Self::Edit(e) => Some(&e.channel),
            Self::Delete(d) => Some(&d.channel),
            Self::TopicChange(t) => Some(&t.channel),
            Self::Join(m) | Self::Leave(m) => Some(&m.channel),
            Self::GroupJoined(c) => Some(&c.id),
            Self::FileShared(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::Action(_) => "action",
            Self::Bot(_) => "bot_message",
            Self::Edit(_) => "message_changed",
            Self::Delete(_) => "message_deleted",
            Self::FileShared(_) => "file_shared",
            Self::TopicChange(_) => "topic",
            Self::Join(_) => "member_joined_channel",
            Self::Leave(_) => "member_left_channel",
            Self::GroupJoined(_) => "group_joined",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn edit_detects_real_changes() {
        let edit: MessageEdit = serde_json::from_value(json!({
            "type": "message",
            "subtype": "message_changed",
            "channel": "C1",
            "previous_message": {"user": "U1", "text": "helo world"},
            "message": {"user": "U1", "text": "hello world"},
        }))
        .unwrap();
        assert!(edit.is_changed());
        let msg = edit.diff_message();
        assert_eq!(msg.user, "U1");
        assert_eq!(msg.text, "s/helo/hello/");
    }

    #[test]
    fn unfurl_is_not_a_change() {
        let edit: MessageEdit = serde_json::from_value(json!({
            "channel": "C1",
            "previous_message": {"user": "U1", "text": "see https://x"},
            "message": {"user": "U1", "text": "see https://x"},
        }))
        .unwrap();
        assert!(!edit.is_changed());
    }

    #[test]
    fn bot_name_defaults() {
        let bot: BotMessage = serde_json::from_value(json!({"channel": "C1", "text": "hi"})).unwrap();
        assert_eq!(bot.username, "bot");
        assert_eq!(RemoteEvent::Bot(bot).channel_id(), Some("C1"));
    }
}
