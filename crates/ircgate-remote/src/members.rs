use std::collections::BTreeSet;

use serde_json::json;
use tracing::debug;

use ircgate_types::{Membership, RemoteEvent};

use crate::error::RemoteError;
use crate::state::{RemoteState, field, next_cursor};

const MEMBERS_PAGE: u32 = 5000;

/// Where the next membership page starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Cursor {
    #[default]
    Start,
    Next(String),
    /// Every page was fetched; the set only changes through live join/leave.
    Exhausted,
}

#[derive(Debug, Clone, Default)]
pub struct MemberCache {
    pub ids: BTreeSet<String>,
    pub cursor: Cursor,
}

impl RemoteState {
    /// Members of a channel, one page further each call.
    ///
    /// Every call fetches the next page and merges it into the cached set
    /// until the listing is exhausted; from then on the cached set is
    /// returned without any request. Ids first seen on a later page are
    /// queued as joins. The first page only establishes the baseline.
    pub async fn get_members(&mut self, channel_id: &str) -> Result<BTreeSet<String>, RemoteError> {
        let cursor = self
            .members
            .get(channel_id)
            .map(|c| c.cursor.clone())
            .unwrap_or_default();

        let mut params = json!({ "channel": channel_id, "limit": MEMBERS_PAGE });
        match cursor {
            Cursor::Exhausted => return Ok(self.members[channel_id].ids.clone()),
            Cursor::Next(ref c) => params["cursor"] = json!(c),
            Cursor::Start => {}
        }

        let response = self.call("conversations.members", params).await?;
        let page: Vec<String> = field("conversations.members", &response, "members")?;
        let next = next_cursor(&response);

        let first_page = !self.members.contains_key(channel_id);
        let cache = self.members.entry(channel_id.to_string()).or_default();
        let mut joined = Vec::new();
        for id in page {
            if cache.ids.insert(id.clone()) && !first_page {
                joined.push(id);
            }
        }
        cache.cursor = next.map_or(Cursor::Exhausted, Cursor::Next);
        let ids = cache.ids.clone();

        debug!(
            "{} members cached for {} ({} new)",
            ids.len(),
            channel_id,
            joined.len()
        );
        for user in joined {
            self.push_event(RemoteEvent::Join(Membership {
                channel: channel_id.to_string(),
                user,
            }));
        }
        Ok(ids)
    }

    /// Forgets a channel's members so the next call starts from page one.
    pub fn invalidate_members(&mut self, channel_id: &str) {
        self.members.remove(channel_id);
    }

    pub(crate) fn member_joined(&mut self, channel_id: &str, user_id: &str) {
        if let Some(cache) = self.members.get_mut(channel_id) {
            cache.ids.insert(user_id.to_string());
        }
    }

    pub(crate) fn member_left(&mut self, channel_id: &str, user_id: &str) {
        if let Some(cache) = self.members.get_mut(channel_id) {
            cache.ids.remove(user_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;
    use crate::mock::MockTransport;

    fn page(ids: &[&str], next: &str) -> Value {
        json!({
            "ok": true,
            "members": ids,
            "response_metadata": {"next_cursor": next},
        })
    }

    #[tokio::test]
    async fn pages_accumulate_until_exhausted() {
        let mock = MockTransport::new();
        mock.respond("conversations.members", page(&["U1", "U2"], "c2"));
        mock.respond("conversations.members", page(&["U2", "U3"], "c3"));
        mock.respond("conversations.members", page(&["U4"], ""));
        let mut remote = RemoteState::new(Box::new(mock.clone()), None);

        remote.get_members("C1").await.unwrap();
        remote.get_members("C1").await.unwrap();
        let all = remote.get_members("C1").await.unwrap();
        assert_eq!(all.len(), 4);

        let again = remote.get_members("C1").await.unwrap();
        assert_eq!(again, all);
        let calls = mock.calls_to("conversations.members");
        assert_eq!(calls.len(), 3);
        assert!(calls[0].get("cursor").is_none());
        assert_eq!(calls[1]["cursor"], "c2");
        assert_eq!(calls[2]["cursor"], "c3");
    }

    #[tokio::test]
    async fn later_pages_synthesize_joins() {
        let mock = MockTransport::new();
        mock.respond("conversations.members", page(&["U1", "U2"], "c2"));
        mock.respond("conversations.members", page(&["U2", "U3"], ""));
        let mut remote = RemoteState::new(Box::new(mock), None);

        remote.get_members("C1").await.unwrap();
        assert!(remote.drain_events().is_empty());

        remote.get_members("C1").await.unwrap();
        assert_eq!(
            remote.drain_events(),
            vec![RemoteEvent::Join(Membership {
                channel: "C1".into(),
                user: "U3".into(),
            })]
        );
    }

    #[tokio::test]
    async fn live_membership_changes_exhausted_cache() {
        let mock = MockTransport::new();
        mock.respond("conversations.members", page(&["U1"], ""));
        let mut remote = RemoteState::new(Box::new(mock.clone()), None);

        remote.get_members("C1").await.unwrap();
        remote.member_joined("C1", "U7");
        remote.member_left("C1", "U1");

        let ids: Vec<String> = remote.get_members("C1").await.unwrap().into_iter().collect();
        assert_eq!(ids, ["U7"]);
        assert_eq!(mock.calls_to("conversations.members").len(), 1);
    }

    #[tokio::test]
    async fn failed_page_keeps_cursor() {
        let mock = MockTransport::new();
        mock.respond("conversations.members", page(&["U1"], "c2"));
        mock.respond("conversations.members", json!({"ok": false, "error": "fatal_error"}));
        let mut remote = RemoteState::new(Box::new(mock.clone()), None);

        remote.get_members("C1").await.unwrap();
        assert!(remote.get_members("C1").await.is_err());
        assert_eq!(remote.members["C1"].cursor, Cursor::Next("c2".into()));
    }
}
