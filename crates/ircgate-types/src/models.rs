use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::Message;
use crate::timestamp::Timestamp;

/// Topics and purposes are objects on the remote side, only the text matters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Topic {
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Public,
    PrivateGroup,
    /// Group direct conversation, never listed as a regular channel.
    MultiPartyDirect,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LatestMessage {
    pub ts: Timestamp,
}

/// A remote channel as returned by the channel listing.
///
/// Instances are replaced wholesale when the listing is refreshed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "ChannelRecord")]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub topic: String,
    pub purpose: String,
    pub num_members: u32,
    pub is_member: bool,
    pub kind: ChannelKind,
    pub latest: Option<Timestamp>,
}

impl Channel {
    /// The topic, or the purpose when no topic is set, on a single line.
    pub fn real_topic(&self) -> String {
        let text = if self.topic.is_empty() {
            &self.purpose
        } else {
            &self.topic
        };
        text.replace('\n', " | ")
    }

    pub fn is_mpim(&self) -> bool {
        self.kind == ChannelKind::MultiPartyDirect
    }

    /// True when the last recorded activity is older than `cutoff`.
    /// Channels with no recorded activity are never considered stale.
    pub fn inactive_since(&self, cutoff: DateTime<Utc>) -> bool {
        self.latest
            .and_then(Timestamp::to_datetime)
            .is_some_and(|latest| latest < cutoff)
    }
}

#[derive(Deserialize)]
struct ChannelRecord {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    name_normalized: Option<String>,
    #[serde(default)]
    topic: Option<Topic>,
    #[serde(default)]
    purpose: Option<Topic>,
    #[serde(default)]
    num_members: u32,
    // Present on channels; groups omit it but their listing implies membership.
    #[serde(default = "default_true")]
    is_member: bool,
    #[serde(default)]
    is_group: bool,
    #[serde(default)]
    is_private: bool,
    #[serde(default)]
    is_mpim: bool,
    #[serde(default)]
    latest: Option<LatestMessage>,
}

fn default_true() -> bool {
    true
}

impl From<ChannelRecord> for Channel {
    fn from(r: ChannelRecord) -> Self {
        let kind = if r.is_mpim {
            ChannelKind::MultiPartyDirect
        } else if r.is_group || r.is_private {
            ChannelKind::PrivateGroup
        } else {
            ChannelKind::Public
        };
        Channel {
            name: r.name_normalized.or(r.name).unwrap_or_else(|| r.id.clone()),
            id: r.id,
            topic: r.topic.unwrap_or_default().value,
            purpose: r.purpose.unwrap_or_default().value,
            num_members: r.num_members,
            is_member: r.is_member,
            kind,
            latest: r.latest.map(|l| l.ts),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Profile {
    #[serde(default = "default_real_name")]
    pub real_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub is_restricted: bool,
    #[serde(default)]
    pub is_ultra_restricted: bool,
}

fn default_real_name() -> String {
    "noname".to_string()
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            real_name: default_real_name(),
            email: None,
            status_text: String::new(),
            is_restricted: false,
            is_ultra_restricted: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub profile: Profile,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub deleted: bool,
}

impl User {
    pub fn real_name(&self) -> &str {
        &self.profile.real_name
    }
}

/// A one-to-one conversation: the channel id used to talk to `user`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Im {
    pub id: String,
    pub user: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct File {
    pub id: String,
    pub url_private: String,
    #[serde(default)]
    pub size: u64,
    pub user: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub mimetype: Option<String>,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub ims: Vec<String>,
}

impl File {
    /// Builds the message announcing this file in the last conversation it
    /// was shared to. `None` when the file is not shared anywhere.
    pub fn announce(&self) -> Option<Message> {
        let channel = self
            .channels
            .iter()
            .chain(&self.groups)
            .chain(&self.ims)
            .last()?;
        Some(Message {
            channel: channel.clone(),
            user: self.user.clone(),
            text: format!(
                "[file upload] {}\n{} {} bytes\n{}",
                self.name.as_deref().unwrap_or("(unnamed)"),
                self.mimetype.as_deref().unwrap_or("application/octet-stream"),
                self.size,
                self.url_private,
            ),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SelfInfo {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Team {
    pub name: String,
    pub domain: String,
}

/// Account identity returned by login and by opening the event stream.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoginInfo {
    #[serde(rename = "self")]
    pub self_: SelfInfo,
    pub team: Team,
}

/// State persisted between runs. Only the newest processed timestamp is kept;
/// it bounds the history fetched after the next connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedStatus {
    #[serde(default)]
    pub last_timestamp: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn real_topic_falls_back_to_purpose() {
        let c: Channel = serde_json::from_value(json!({
            "id": "C1",
            "name_normalized": "general",
            "topic": {"value": ""},
            "purpose": {"value": "talk\nabout things"},
        }))
        .unwrap();
        assert_eq!(c.real_topic(), "talk | about things");
        assert_eq!(c.kind, ChannelKind::Public);
        assert!(c.is_member);
    }

    #[test]
    fn channel_kind_from_flags() {
        let mpim: Channel = serde_json::from_value(json!({
            "id": "G1", "name": "mpdm-a--b-1", "is_mpim": true, "is_group": true,
        }))
        .unwrap();
        assert!(mpim.is_mpim());
        let group: Channel =
            serde_json::from_value(json!({"id": "G2", "name": "secret", "is_group": true})).unwrap();
        assert_eq!(group.kind, ChannelKind::PrivateGroup);
        assert_eq!(group.name, "secret");
    }

    #[test]
    fn inactive_only_with_recorded_activity() {
        let mut c: Channel = serde_json::from_value(json!({"id": "G1", "is_mpim": true})).unwrap();
        let cutoff = Utc::now();
        assert!(!c.inactive_since(cutoff));
        c.latest = Some(Timestamp::from_secs(1_000));
        assert!(c.inactive_since(cutoff));
    }

    #[test]
    fn file_announce_uses_last_share() {
        let f: File = serde_json::from_value(json!({
            "id": "F1",
            "url_private": "https://files/x.png",
            "size": 42,
            "user": "U1",
            "name": "x.png",
            "mimetype": "image/png",
            "channels": ["C1"],
            "ims": ["D1"],
        }))
        .unwrap();
        let msg = f.announce().unwrap();
        assert_eq!(msg.channel, "D1");
        assert_eq!(msg.text, "[file upload] x.png\nimage/png 42 bytes\nhttps://files/x.png");
    }

    #[test]
    fn profile_defaults() {
        let u: User = serde_json::from_value(json!({"id": "U1", "name": "bob"})).unwrap();
        assert_eq!(u.real_name(), "noname");
        assert!(!u.is_admin);
    }
}
