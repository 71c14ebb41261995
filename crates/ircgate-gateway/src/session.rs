use std::collections::HashSet;
use std::mem;
use std::path::Path;

use chrono::{TimeDelta, Utc};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use ircgate_remote::RemoteState;
use ircgate_types::{Channel, Membership, RemoteEvent, User};

use crate::command::{Command, ParseError};
use crate::error::SessionError;
use crate::reply::{Reply, format_reply};
use crate::text::{self, MentionMatcher};

/// Group conversations quiet for longer than this are not joined
/// automatically.
const MPIM_HIDE_DAYS: i64 = 50;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Server name used as the prefix of numeric replies.
    pub hostname: String,
    pub autojoin: bool,
    pub nouserlist: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            autojoin: false,
            nouserlist: false,
        }
    }
}

/// What the driver should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Events arriving before USER are held, then flushed exactly once.
enum Registration {
    Pending(Vec<RemoteEvent>),
    Done,
}

enum Speaker<'a> {
    User(&'a str),
    Bot,
}

/// One connected client.
///
/// Interprets client commands against the remote state and writes remote
/// events back as protocol lines. Every command and event error is handled
/// here; only a failing client socket is returned to the caller.
pub struct Session<W> {
    writer: W,
    remote: RemoteState,
    config: SessionConfig,
    nick: String,
    username: String,
    realname: String,
    /// Channels the client left. Messages addressed to them are dropped.
    parted: HashSet<String>,
    registration: Registration,
    mentions: MentionMatcher,
}

impl<W: AsyncWrite + Unpin + Send> Session<W> {
    pub fn new(writer: W, remote: RemoteState, config: SessionConfig) -> Self {
        Self {
            writer,
            remote,
            config,
            nick: String::new(),
            username: String::new(),
            realname: String::new(),
            parted: HashSet::new(),
            registration: Registration::Pending(Vec::new()),
            mentions: MentionMatcher::default(),
        }
    }

    pub fn remote(&self) -> &RemoteState {
        &self.remote
    }

    pub fn remote_mut(&mut self) -> &mut RemoteState {
        &mut self.remote
    }

    pub fn into_remote(self) -> RemoteState {
        self.remote
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    pub fn realname(&self) -> &str {
        &self.realname
    }

    pub fn is_registered(&self) -> bool {
        matches!(self.registration, Registration::Done)
    }

    pub fn is_parted(&self, channel: &str) -> bool {
        self.parted.contains(channel)
    }

    // -- Output --

    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await
    }

    async fn reply(&mut self, reply: Reply, params: &[&str], trailing: &str) -> std::io::Result<()> {
        let line = format_reply(&self.config.hostname, reply, &self.nick, params, trailing);
        self.write_line(&line).await
    }

    /// The user part of our own `nick!user@host` prefix.
    fn user_field(&self) -> &str {
        if self.username.is_empty() {
            &self.nick
        } else {
            &self.username
        }
    }

    // -- Commands --

    /// Handles one client line.
    pub async fn command(&mut self, line: &str) -> std::io::Result<Flow> {
        let cmd = match Command::parse(line) {
            Ok(Some(cmd)) => cmd,
            Ok(None) => return Ok(Flow::Continue),
            Err(ParseError::NeedMoreParams(name)) => {
                self.reply(Reply::NeedMoreParams, &[name], "Not enough parameters")
                    .await?;
                return Ok(Flow::Continue);
            }
            Err(e @ ParseError::SendFileSyntax) => {
                self.reply(Reply::UnknownCommand, &["SENDFILE"], &e.to_string())
                    .await?;
                return Ok(Flow::Continue);
            }
        };

        let token = line.split_whitespace().next().unwrap_or_default().to_string();
        match self.dispatch(cmd).await {
            Ok(flow) => Ok(flow),
            Err(SessionError::Io(e)) => Err(e),
            Err(SessionError::Remote(e)) => {
                warn!("{} failed: {}", token, e);
                self.reply(Reply::UnknownCommand, &[&token], &format!("Error: {}", e))
                    .await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn dispatch(&mut self, cmd: Command) -> Result<Flow, SessionError> {
        match cmd {
            Command::Nick(nick) => self.on_nick(nick).await?,
            Command::User { username, realname } => self.on_user(username, realname).await?,
            Command::Ping(label) => {
                let line = format!(
                    ":{0} PONG {0} {1}\n",
                    self.config.hostname, label
                );
                self.write_line(&line).await?;
            }
            Command::Join(names) => {
                for name in names {
                    self.on_join(&name).await?;
                }
            }
            Command::Part(names) => {
                for name in names {
                    debug!("Parted {}", name);
                    self.parted.insert(name);
                }
            }
            Command::Privmsg { target, text } => self.on_privmsg(&target, &text).await?,
            Command::List => self.on_list().await?,
            Command::Who(name) => self.on_who(&name).await?,
            Command::Whois(targets) => self.on_whois(&targets).await?,
            Command::Mode(target) => self.reply(Reply::ChannelModeIs, &[&target, "+"], "").await?,
            Command::Topic { channel, topic } => self.on_topic(&channel, topic.as_deref()).await?,
            Command::Kick { channel, nick } => self.on_kick(&channel, &nick).await?,
            Command::Invite { nick, channel } => self.on_invite(&nick, &channel).await?,
            Command::Away(message) => {
                let away = message.is_some();
                self.remote.away(away).await?;
                let reply = if away { Reply::NowAway } else { Reply::UnAway };
                self.reply(reply, &[], "Away status changed").await?;
            }
            Command::Userhost(nicks) => {
                let tokens: Vec<String> = nicks.iter().map(|n| format!("{}=+unknown", n)).collect();
                let tokens: Vec<&str> = tokens.iter().map(String::as_str).collect();
                self.reply(Reply::UserHost, &tokens, "").await?;
            }
            Command::Quit => {
                info!("{} quit", self.nick);
                return Ok(Flow::Quit);
            }
            Command::SendFile { target, path } => self.on_sendfile(&target, &path).await?,
            Command::Unknown(token) => {
                warn!("Unknown command: {}", token);
                self.reply(Reply::UnknownCommand, &[&token], "Unknown command").await?;
            }
        }
        Ok(Flow::Continue)
    }

    /// Renaming is not supported: the nick must match the remote account.
    async fn on_nick(&mut self, nick: String) -> Result<(), SessionError> {
        self.nick = nick;
        let expected = self.remote.login_info().map(|i| i.self_.name.clone());
        if let Some(expected) = expected.filter(|e| *e != self.nick) {
            self.reply(
                Reply::ErroneousNickname,
                &[],
                &format!("Incorrect nickname, use {}", expected),
            )
            .await?;
        }
        Ok(())
    }

    async fn on_user(&mut self, username: String, realname: String) -> Result<(), SessionError> {
        self.username = username;
        self.realname = realname;

        let (team, domain, me) = self
            .remote
            .login_info()
            .map(|i| (i.team.name.clone(), i.team.domain.clone(), i.self_.name.clone()))
            .unwrap_or_default();
        self.reply(Reply::Welcome, &[], "Welcome to ircgate").await?;
        self.reply(Reply::YourHost, &[], &format!("Your team name is: {}", team))
            .await?;
        self.reply(Reply::YourHost, &[], &format!("Your team domain is: {}", domain))
            .await?;
        self.reply(Reply::YourHost, &[], &format!("Your nickname must be: {}", me))
            .await?;
        self.reply(
            Reply::LuserClient,
            &[],
            "There are 1 users and 0 services on 1 server",
        )
        .await?;

        match self.join_remote_channels().await {
            Ok(()) => {}
            Err(SessionError::Remote(e)) => warn!("Unable to set up remote channels: {}", e),
            Err(e) => return Err(e),
        }

        if let Registration::Pending(held) = mem::replace(&mut self.registration, Registration::Done) {
            info!("{} registered, {} held events", self.nick, held.len());
            for event in held {
                self.deliver(event).await?;
            }
        }
        Ok(())
    }

    async fn join_remote_channels(&mut self) -> Result<(), SessionError> {
        if !self.config.autojoin {
            for channel in self.remote.channels(false).await? {
                self.parted.insert(format!("#{}", channel.name));
            }
            return Ok(());
        }

        if !self.config.nouserlist {
            // One directory listing instead of a lookup per member.
            if let Err(e) = self.remote.prefetch_users().await {
                warn!("Unable to prefetch users: {}", e);
            }
        }

        let cutoff = Utc::now() - TimeDelta::days(MPIM_HIDE_DAYS);
        for channel in self.remote.channels(false).await? {
            if !channel.is_member {
                continue;
            }
            if channel.is_mpim() && channel.inactive_since(cutoff) {
                debug!("Not joining inactive group conversation {}", channel.name);
                continue;
            }
            match self.send_chan_info(&channel).await {
                Ok(()) => {}
                Err(SessionError::Remote(e)) => warn!("Unable to join #{}: {}", channel.name, e),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn on_join(&mut self, name: &str) -> Result<(), SessionError> {
        let bare = name.strip_prefix('#').unwrap_or(name);
        let channel = match self.remote.get_channel_by_name(bare).await {
            Ok(c) => c,
            Err(e) => {
                debug!("JOIN {}: {}", name, e);
                self.reply(
                    Reply::NoSuchChannel,
                    &[name],
                    &format!("Unable to find channel: {}", bare),
                )
                .await?;
                return Ok(());
            }
        };

        if !channel.is_member {
            if let Err(e) = self.remote.join(&channel).await {
                warn!("Unable to join {} remotely: {}", name, e);
                self.reply(
                    Reply::NoSuchChannel,
                    &[name],
                    &format!("Unable to join server channel: {}", bare),
                )
                .await?;
                return Ok(());
            }
        }

        let names = match self.channel_names(&channel).await {
            Ok(names) => names,
            Err(SessionError::Remote(e)) => {
                warn!("Unable to list members of {}: {}", name, e);
                self.reply(
                    Reply::NoSuchChannel,
                    &[name],
                    &format!("Unable to join channel: {}", bare),
                )
                .await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.parted.remove(name);
        self.parted.remove(&format!("#{}", channel.name));
        self.write_chan_info(&channel, &names).await?;
        Ok(())
    }

    async fn send_chan_info(&mut self, channel: &Channel) -> Result<(), SessionError> {
        let names = self.channel_names(channel).await?;
        self.write_chan_info(channel, &names).await?;
        Ok(())
    }

    /// Space separated member names for NAMES, admins marked with `@`.
    async fn channel_names(&mut self, channel: &Channel) -> Result<String, SessionError> {
        if self.config.nouserlist {
            return Ok(String::new());
        }
        let ids = self.remote.get_members(&channel.id).await?;
        let mut names = Vec::with_capacity(ids.len());
        for id in ids {
            match self.remote.get_user(&id).await {
                Ok(user) if user.deleted => {}
                Ok(user) if user.is_admin => names.push(format!("@{}", user.name)),
                Ok(user) => names.push(user.name),
                Err(e) => debug!("Skipping member {}: {}", id, e),
            }
        }
        Ok(names.join(" "))
    }

    async fn write_chan_info(&mut self, channel: &Channel, names: &str) -> std::io::Result<()> {
        let chan = format!("#{}", channel.name);
        let line = format!(":{}!{}@127.0.0.1 JOIN {}\n", self.nick, self.user_field(), chan);
        self.write_line(&line).await?;
        self.reply(Reply::Topic, &[&chan], &channel.real_topic()).await?;
        self.reply(Reply::NamReply, &["=", &chan], names).await?;
        self.reply(Reply::EndOfNames, &[&chan], "End of NAMES list").await
    }

    /// Looks a `#channel` up, answering 403 itself when it does not exist.
    async fn channel_or_reply(&mut self, target: &str) -> Result<Option<Channel>, SessionError> {
        let bare = target.strip_prefix('#').unwrap_or(target);
        match self.remote.get_channel_by_name(bare).await {
            Ok(c) => Ok(Some(c)),
            Err(e) if e.is_not_found() => {
                self.reply(
                    Reply::NoSuchChannel,
                    &[target],
                    &format!("Unable to find channel: {}", bare),
                )
                .await?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn on_privmsg(&mut self, target: &str, text: &str) -> Result<(), SessionError> {
        let (body, action) = match text
            .strip_prefix("\x01ACTION ")
            .and_then(|t| t.strip_suffix('\x01'))
        {
            Some(body) => (body, true),
            None => (text, false),
        };
        let message = self.encode_outgoing(body);

        if target.starts_with('#') {
            let Some(channel) = self.channel_or_reply(target).await? else {
                return Ok(());
            };
            self.remote.send_message(&channel.id, &message, action).await?;
        } else {
            let Some(user_id) = self.remote.get_user_by_name(target).map(|u| u.id.clone()) else {
                warn!("Impossible to find user {}", target);
                return Ok(());
            };
            self.remote
                .send_message_to_user(&user_id, &message, action)
                .await?;
        }
        Ok(())
    }

    fn encode_outgoing(&mut self, text: &str) -> String {
        let escaped = text::escape_for_remote(text);
        let remote = &self.remote;
        match self
            .mentions
            .regex(remote.name_generation(), || remote.user_names())
        {
            Some(re) => text::encode_mentions(&escaped, re, |name| {
                remote.get_user_by_name(name).map(|u| u.id.clone())
            }),
            None => escaped,
        }
    }

    async fn on_list(&mut self) -> Result<(), SessionError> {
        for channel in self.remote.channels(true).await? {
            let name = format!("#{}", channel.name);
            let members = channel.num_members.to_string();
            self.reply(Reply::List, &[&name, &members], &channel.real_topic())
                .await?;
        }
        self.reply(Reply::ListEnd, &[], "End of LIST").await?;
        Ok(())
    }

    async fn on_who(&mut self, name: &str) -> Result<(), SessionError> {
        let Some(bare) = name.strip_prefix('#') else {
            if let Some(user) = self.remote.get_user_by_name(name).cloned() {
                self.who_reply(name, &user).await?;
            }
            return Ok(());
        };

        let channel = match self.remote.get_channel_by_name(bare).await {
            Ok(c) => c,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for id in self.remote.get_members(&channel.id).await? {
            match self.remote.get_user(&id).await {
                Ok(user) => self.who_reply(name, &user).await?,
                Err(e) => debug!("WHO {}: skipping {}: {}", name, id, e),
            }
        }
        self.reply(Reply::EndOfWho, &[name], "End of WHO list").await?;
        Ok(())
    }

    async fn who_reply(&mut self, mask: &str, user: &User) -> std::io::Result<()> {
        let host = self.config.hostname.clone();
        self.reply(
            Reply::WhoReply,
            &[mask, &user.name, "127.0.0.1", &host, &user.name, "H"],
            &format!("0 {}", user.real_name()),
        )
        .await
    }

    async fn on_whois(&mut self, targets: &[String]) -> Result<(), SessionError> {
        if targets.len() > 1 {
            self.reply(Reply::UnknownCommand, &[], "Server parameter is not supported")
                .await?;
            return Ok(());
        }
        let Some(nick) = targets.first() else {
            return Ok(());
        };
        if nick.contains('*') {
            self.reply(Reply::UnknownCommand, &[], "Wildcards are not supported")
                .await?;
            return Ok(());
        }

        match self.remote.get_user_by_name(nick).cloned() {
            None => {
                self.reply(Reply::NoSuchNick, &[nick], &format!("Unknown user {}", nick))
                    .await?;
            }
            Some(user) => {
                self.reply(Reply::WhoisUser, &[nick, "", "localhost"], user.real_name())
                    .await?;
                if let Some(email) = user.profile.email.as_deref().filter(|e| !e.is_empty()) {
                    self.reply(
                        Reply::WhoisUser,
                        &[nick, "", "localhost"],
                        &format!("email: {}", email),
                    )
                    .await?;
                }
                if user.is_admin {
                    self.reply(
                        Reply::WhoisOperator,
                        &[nick],
                        &format!("{} is an IRC operator", nick),
                    )
                    .await?;
                }
            }
        }
        // Sent even for unknown nicks.
        self.reply(Reply::EndOfWhois, &[nick], "").await?;
        Ok(())
    }

    async fn on_topic(&mut self, target: &str, topic: Option<&str>) -> Result<(), SessionError> {
        let Some(channel) = self.channel_or_reply(target).await? else {
            return Ok(());
        };
        match topic {
            None => {
                let name = format!("#{}", channel.name);
                self.reply(Reply::Topic, &[&name], &channel.real_topic())
                    .await?;
            }
            // The new topic comes back as an event; nothing to answer now.
            Some(topic) => {
                if let Err(e) = self.remote.set_topic(&channel, topic).await {
                    warn!("Unable to set topic of {}: {}", target, e);
                    self.reply(
                        Reply::UnknownCommand,
                        &[],
                        &format!("Unable to set topic to {}", topic),
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    async fn known_user_or_reply(&mut self, nick: &str) -> std::io::Result<Option<User>> {
        match self.remote.get_user_by_name(nick).cloned() {
            Some(user) => Ok(Some(user)),
            None => {
                self.reply(Reply::NoSuchNick, &[nick], &format!("Unknown user {}", nick))
                    .await?;
                Ok(None)
            }
        }
    }

    async fn on_kick(&mut self, target: &str, nick: &str) -> Result<(), SessionError> {
        let Some(channel) = self.channel_or_reply(target).await? else {
            return Ok(());
        };
        let Some(user) = self.known_user_or_reply(nick).await? else {
            return Ok(());
        };
        if let Err(e) = self.remote.kick(&channel, &user).await {
            self.reply(Reply::UnknownCommand, &[], &format!("Error: {}", e))
                .await?;
        }
        Ok(())
    }

    async fn on_invite(&mut self, nick: &str, target: &str) -> Result<(), SessionError> {
        let Some(channel) = self.channel_or_reply(target).await? else {
            return Ok(());
        };
        let Some(user) = self.known_user_or_reply(nick).await? else {
            return Ok(());
        };
        if let Err(e) = self
            .remote
            .invite(&channel, std::slice::from_ref(&user))
            .await
        {
            self.reply(Reply::UnknownCommand, &[], &format!("Error: {}", e))
                .await?;
        }
        Ok(())
    }

    async fn on_sendfile(&mut self, target: &str, path: &str) -> Result<(), SessionError> {
        let destination = if target.starts_with('#') {
            self.channel_or_reply(target).await?.map(|c| c.id)
        } else {
            let id = self.remote.get_user_by_name(target).map(|u| u.id.clone());
            if id.is_none() {
                self.reply(
                    Reply::NoSuchChannel,
                    &[target],
                    &format!("Unable to find destination: {}", target),
                )
                .await?;
            }
            id
        };
        let Some(destination) = destination else {
            return Ok(());
        };

        match self.remote.send_file(&destination, Path::new(path)).await {
            Ok(()) => {
                let line = format!(
                    ":{} NOTICE {} :Upload of {} completed\n",
                    self.config.hostname, self.nick, path
                );
                self.write_line(&line).await?;
            }
            Err(e) => {
                warn!("Upload of {} failed: {}", path, e);
                self.reply(Reply::FileError, &[], &format!("Unable to send file {}", e))
                    .await?;
            }
        }
        Ok(())
    }

    // -- Remote events --

    /// Writes one remote event to the client, or holds it until the client
    /// has registered. Failing lookups drop the event.
    pub async fn deliver(&mut self, event: RemoteEvent) -> std::io::Result<()> {
        if let Registration::Pending(held) = &mut self.registration {
            debug!("Holding {} event until registration", event.kind());
            held.push(event);
            return Ok(());
        }

        let kind = event.kind();
        match self.render(event).await {
            Ok(()) => Ok(()),
            Err(SessionError::Io(e)) => Err(e),
            Err(SessionError::Remote(e)) => {
                warn!("Dropping {} event: {}", kind, e);
                Ok(())
            }
        }
    }

    async fn render(&mut self, event: RemoteEvent) -> Result<(), SessionError> {
        match event {
            RemoteEvent::Message(m) => {
                self.relay(&m.channel, Speaker::User(&m.user), "", &m.text, false)
                    .await
            }
            RemoteEvent::Action(m) => {
                self.relay(&m.channel, Speaker::User(&m.user), "", &m.text, true)
                    .await
            }
            RemoteEvent::Bot(b) => {
                let prefix = format!("[{}] ", b.username);
                self.relay(&b.channel, Speaker::Bot, &prefix, &b.text, false)
                    .await
            }
            RemoteEvent::Edit(edit) => {
                if !edit.is_changed() {
                    return Ok(());
                }
                let m = edit.diff_message();
                self.relay(&m.channel, Speaker::User(&m.user), "", &m.text, false)
                    .await
            }
            RemoteEvent::Delete(d) => {
                self.relay(&d.channel, Speaker::User(d.user()), "[deleted] ", d.text(), false)
                    .await
            }
            RemoteEvent::FileShared(shared) => {
                let file = self.remote.get_file(&shared.file_id).await?;
                match file.announce() {
                    Some(m) => {
                        self.relay(&m.channel, Speaker::User(&m.user), "", &m.text, false)
                            .await
                    }
                    None => Ok(()),
                }
            }
            RemoteEvent::Join(m) => self.joined_parted(&m, true).await,
            RemoteEvent::Leave(m) => self.joined_parted(&m, false).await,
            RemoteEvent::TopicChange(t) => {
                let channel = self.remote.get_channel(&t.channel).await?;
                let name = format!("#{}", channel.name);
                self.reply(Reply::Topic, &[&name], &t.topic).await?;
                Ok(())
            }
            RemoteEvent::GroupJoined(channel) => self.send_chan_info(&channel).await,
        }
    }

    /// Where a channel's messages go: `#name`, or our own nick for direct
    /// conversations and channels missing from the listing.
    async fn destination(&mut self, channel_id: &str) -> Result<String, SessionError> {
        if self.remote.is_known_im(channel_id) {
            return Ok(self.nick.clone());
        }
        match self.remote.get_channel(channel_id).await {
            Ok(channel) => Ok(format!("#{}", channel.name)),
            Err(e) if e.is_not_found() => Ok(self.nick.clone()),
            Err(e) => Err(e.into()),
        }
    }

    async fn relay(
        &mut self,
        channel_id: &str,
        speaker: Speaker<'_>,
        prefix: &str,
        text: &str,
        action: bool,
    ) -> Result<(), SessionError> {
        let source = match speaker {
            Speaker::Bot => "bot".to_string(),
            Speaker::User(id) => self.remote.get_user(id).await?.name,
        };
        let dest = self.destination(channel_id).await?;
        if self.parted.contains(&dest) {
            debug!("Dropping message for parted {}", dest);
            return Ok(());
        }

        let full = format!("{}{}", prefix, text);
        for line in full.split('\n').filter(|l| !l.is_empty()) {
            let mut body = text::decode_remote(line, &source, &mut self.remote).await;
            if action {
                body = format!("\x01ACTION {}\x01", body);
            }
            let out = format!(":{0}!{0}@127.0.0.1 PRIVMSG {1} :{2}\n", source, dest, body);
            self.write_line(&out).await?;
        }
        Ok(())
    }

    async fn joined_parted(&mut self, m: &Membership, joined: bool) -> Result<(), SessionError> {
        let user = self.remote.get_user(&m.user).await?;
        if user.deleted {
            return Ok(());
        }
        let channel = self.remote.get_channel(&m.channel).await?;
        let dest = format!("#{}", channel.name);
        if self.parted.contains(&dest) {
            return Ok(());
        }
        let realname = user.real_name().replace(' ', "_");
        let line = if joined {
            format!(":{}!{}@127.0.0.1 JOIN :{}\n", user.name, realname, dest)
        } else {
            format!(":{}!{}@127.0.0.1 PART {}\n", user.name, realname, dest)
        };
        self.write_line(&line).await?;
        Ok(())
    }
}
