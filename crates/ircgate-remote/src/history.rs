use std::collections::VecDeque;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use ircgate_types::{BotMessage, File, Message, RemoteEvent, Timestamp};

use crate::error::RemoteError;
use crate::state::{RemoteState, next_cursor};

const HISTORY_PAGE: u32 = 1000;

/// One entry of a channel or thread history listing.
#[derive(Debug, Clone, Deserialize)]
struct HistoryEntry {
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    text: String,
    ts: Timestamp,
    #[serde(default)]
    files: Vec<File>,
    #[serde(default)]
    thread_ts: Option<Timestamp>,
}

impl HistoryEntry {
    fn opens_thread(&self) -> bool {
        self.thread_ts == Some(self.ts)
    }

    /// The same typed event live traffic would have produced.
    fn into_event(self, channel_id: &str) -> RemoteEvent {
        let channel = channel_id.to_string();
        match (self.subtype.as_deref(), self.user) {
            (Some("bot_message"), _) | (_, None) => RemoteEvent::Bot(BotMessage {
                channel,
                text: self.text,
                username: self.username.unwrap_or_else(|| "bot".to_string()),
                bot_id: self.bot_id,
            }),
            (Some("me_message"), Some(user)) => RemoteEvent::Action(Message {
                channel,
                user,
                text: self.text,
            }),
            (_, Some(user)) => RemoteEvent::Message(Message {
                channel,
                user,
                text: self.text,
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct HistoryPage {
    #[serde(default)]
    messages: Vec<Value>,
    #[serde(default)]
    has_more: bool,
}

impl RemoteState {
    /// Replays everything posted in joined channels since the last recorded
    /// timestamp, as if it arrived now.
    ///
    /// Entries are queued oldest first. A message opening a thread is
    /// followed directly by all of its replies instead of having them
    /// scattered at their chronological position. Returns how many events
    /// were queued.
    pub async fn backfill_history(&mut self) -> Result<usize, RemoteError> {
        let since = self.status.last_timestamp;
        if since.is_zero() {
            info!("No last known timestamp, skipping history");
            return Ok(0);
        }
        info!(
            "Fetching history since {}",
            since
                .to_datetime()
                .map(|d| d.to_rfc3339())
                .unwrap_or_else(|| since.to_string())
        );

        let queued_before = self.pending.len();
        let channels = self.channels(false).await?;
        for channel in channels.iter().filter(|c| c.is_member) {
            debug!("Downloading history of #{}", channel.name);
            let mut queue: VecDeque<HistoryEntry> =
                match self.channel_history(&channel.id, since).await {
                    Ok(entries) => entries.into(),
                    Err(e) => {
                        warn!("Skipping history of #{}: {}", channel.name, e);
                        continue;
                    }
                };

            while let Some(entry) = queue.pop_front() {
                // The newest message already seen is included again.
                if entry.ts == since {
                    continue;
                }
                self.observe_timestamp(entry.ts);

                for file in &entry.files {
                    let mut file = file.clone();
                    file.channels.push(channel.id.clone());
                    if let Some(announce) = file.announce() {
                        self.push_event(RemoteEvent::Message(announce));
                    }
                }

                let root = entry.opens_thread().then_some(entry.ts);
                self.push_event(entry.into_event(&channel.id));

                if let Some(root) = root {
                    match self.thread_history(&channel.id, root).await {
                        Ok(replies) => {
                            for reply in replies.into_iter().rev() {
                                queue.push_front(reply);
                            }
                        }
                        Err(e) => warn!("Skipping replies of {} in #{}: {}", root, channel.name, e),
                    }
                }
            }
        }

        let queued = self.pending.len() - queued_before;
        info!("History backfill queued {} events", queued);
        Ok(queued)
    }

    /// Every message of a channel newer than `oldest`, sorted by timestamp.
    async fn channel_history(
        &self,
        channel_id: &str,
        oldest: Timestamp,
    ) -> Result<Vec<HistoryEntry>, RemoteError> {
        let params = json!({
            "channel": channel_id,
            "oldest": oldest.to_string(),
            "limit": HISTORY_PAGE,
        });
        let mut entries = self.history_pages("conversations.history", params).await?;
        entries.sort_by_key(|e| e.ts);
        Ok(entries)
    }

    /// The replies of a thread, oldest first, without the root message.
    async fn thread_history(
        &self,
        channel_id: &str,
        root: Timestamp,
    ) -> Result<Vec<HistoryEntry>, RemoteError> {
        debug!("Fetching thread {} in {}", root, channel_id);
        let params = json!({
            "channel": channel_id,
            "ts": root.to_string(),
            "limit": HISTORY_PAGE,
        });
        let mut replies: Vec<HistoryEntry> = self
            .history_pages("conversations.replies", params)
            .await?
            .into_iter()
            .filter(|e| e.ts != root)
            .collect();
        replies.sort_by_key(|e| e.ts);
        Ok(replies)
    }

    async fn history_pages(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Vec<HistoryEntry>, RemoteError> {
        let mut entries = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut page_params = params.clone();
            if let Some(c) = &cursor {
                page_params["cursor"] = json!(c);
            }
            let response = self.call(method, page_params).await?;
            let page: HistoryPage =
                serde_json::from_value(response.clone()).map_err(|source| {
                    RemoteError::Decode {
                        method: method.to_string(),
                        source,
                    }
                })?;

            // Entries of unknown shape are skipped, not fatal.
            for raw in page.messages {
                match serde_json::from_value::<HistoryEntry>(raw) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => warn!("Skipping unreadable {} entry: {}", method, e),
                }
            }

            match next_cursor(&response) {
                Some(next) if page.has_more => cursor = Some(next),
                _ => break,
            }
        }
        Ok(entries)
    }
}
