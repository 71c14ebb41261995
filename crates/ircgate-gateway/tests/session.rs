use ircgate_gateway::{Flow, Session, SessionConfig};
use ircgate_remote::{MockTransport, RemoteState};
use ircgate_types::{BotMessage, Message, MessageBody, MessageEdit, RemoteEvent};
use serde_json::{Value, json};

fn listing(channels: Value) -> Value {
    json!({"ok": true, "channels": channels, "response_metadata": {"next_cursor": ""}})
}

fn general() -> Value {
    json!({"id": "C1", "name": "general", "is_member": true, "num_members": 3,
           "topic": {"value": "chat"}, "purpose": {"value": ""}})
}

async fn session(mock: &MockTransport, config: SessionConfig) -> Session<Vec<u8>> {
    let mut remote = RemoteState::new(Box::new(mock.clone()), None);
    remote.login().await.unwrap();
    Session::new(Vec::new(), remote, config)
}

async fn registered(mock: &MockTransport, config: SessionConfig) -> Session<Vec<u8>> {
    let mut s = session(mock, config).await;
    s.command("NICK me").await.unwrap();
    s.command("USER me 0 * :Me").await.unwrap();
    s
}

fn autojoin() -> SessionConfig {
    SessionConfig {
        autojoin: true,
        nouserlist: true,
        ..SessionConfig::default()
    }
}

fn output(s: &Session<Vec<u8>>) -> String {
    String::from_utf8_lossy(s.writer()).into_owned()
}

fn message(channel: &str, user: &str, text: &str) -> RemoteEvent {
    RemoteEvent::Message(Message {
        channel: channel.to_string(),
        user: user.to_string(),
        text: text.to_string(),
    })
}

fn bob() -> Value {
    json!({"ok": true, "user": {"id": "U1", "name": "bob", "profile": {"real_name": "Bob B"}}})
}

#[tokio::test]
async fn registration_greets_with_team_details() {
    let mock = MockTransport::new();
    mock.respond("conversations.list", listing(json!([])));
    let s = registered(&mock, SessionConfig::default()).await;

    assert!(s.is_registered());
    assert_eq!(
        output(&s),
        ":localhost 001 me :Welcome to ircgate\n\
         :localhost 002 me :Your team name is: Team\n\
         :localhost 002 me :Your team domain is: team\n\
         :localhost 002 me :Your nickname must be: me\n\
         :localhost 251 me :There are 1 users and 0 services on 1 server\n"
    );
}

#[tokio::test]
async fn wrong_nick_is_refused() {
    let mock = MockTransport::new();
    let mut s = session(&mock, SessionConfig::default()).await;
    s.command("NICK someone").await.unwrap();
    assert_eq!(
        output(&s),
        ":localhost 432 someone :Incorrect nickname, use me\n"
    );
}

#[tokio::test]
async fn privmsg_encodes_mentions_and_suppresses_the_echo() {
    let mock = MockTransport::new();
    mock.respond("conversations.list", listing(json!([general()])));
    mock.respond("users.info", bob());
    mock.respond("chat.postMessage", json!({"ok": true, "ts": "1700000000.000100"}));

    let mut s = registered(&mock, SessionConfig::default()).await;
    s.remote_mut().get_user("U1").await.unwrap();
    s.command("PRIVMSG #general :hello @bob & co").await.unwrap();

    let posted = mock.calls_to("chat.postMessage");
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0]["channel"], "C1");
    assert_eq!(posted[0]["text"], "hello <@U1> &amp; co");

    let echo = s
        .remote_mut()
        .normalize(json!({
            "type": "message", "channel": "C1", "user": "U0",
            "text": "hello <@U1> &amp; co", "ts": "1700000000.000100"
        }))
        .await;
    assert_eq!(echo, None);
}

#[tokio::test]
async fn action_goes_through_me_message() {
    let mock = MockTransport::new();
    mock.respond("conversations.list", listing(json!([general()])));
    mock.respond("chat.meMessage", json!({"ok": true, "ts": "1700000000.000200"}));

    let mut s = registered(&mock, SessionConfig::default()).await;
    s.command("PRIVMSG #general :\x01ACTION waves\x01").await.unwrap();

    let posted = mock.calls_to("chat.meMessage");
    assert_eq!(posted[0]["text"], "waves");
    assert!(mock.calls_to("chat.postMessage").is_empty());
}

#[tokio::test]
async fn joining_an_unknown_channel_fails_once() {
    let mock = MockTransport::new();
    mock.respond("conversations.list", listing(json!([general()])));
    let mut s = session(&mock, SessionConfig::default()).await;
    s.command("NICK me").await.unwrap();

    s.command("JOIN #secret").await.unwrap();

    let out = output(&s);
    assert_eq!(out, ":localhost 403 me #secret :Unable to find channel: secret\n");
    assert!(!out.contains(" JOIN "));
    assert!(mock.calls_to("conversations.join").is_empty());
}

#[tokio::test]
async fn joining_a_channel_sends_names_and_topic() {
    let mock = MockTransport::new();
    mock.respond(
        "conversations.list",
        listing(json!([{"id": "C2", "name": "random", "is_member": false,
                        "topic": {"value": ""}, "purpose": {"value": "misc\nstuff"}}])),
    );
    mock.respond("conversations.join", json!({"ok": true}));
    mock.respond(
        "conversations.members",
        json!({"ok": true, "members": ["U1", "U2"], "response_metadata": {"next_cursor": ""}}),
    );
    mock.respond(
        "users.info",
        json!({"ok": true, "user": {"id": "U1", "name": "alice", "is_admin": true}}),
    );
    mock.respond(
        "users.info",
        json!({"ok": true, "user": {"id": "U2", "name": "bob"}}),
    );

    let mut s = registered(&mock, SessionConfig::default()).await;
    assert!(s.is_parted("#random"));
    let before = output(&s).len();
    s.command("JOIN #random").await.unwrap();

    assert_eq!(mock.calls_to("conversations.join")[0]["channel"], "C2");
    assert_eq!(
        &output(&s)[before..],
        ":me!me@127.0.0.1 JOIN #random\n\
         :localhost 332 me #random :misc | stuff\n\
         :localhost 353 me = #random :@alice bob\n\
         :localhost 366 me #random :End of NAMES list\n"
    );
    assert!(!s.is_parted("#random"));
}

#[tokio::test]
async fn without_autojoin_channels_start_parted() {
    let mock = MockTransport::new();
    mock.respond("conversations.list", listing(json!([general()])));
    mock.respond("users.info", bob());

    let mut s = registered(&mock, SessionConfig::default()).await;
    assert!(s.is_parted("#general"));
    assert!(!output(&s).contains("JOIN"));

    s.deliver(message("C1", "U1", "nobody listens")).await.unwrap();
    assert!(!output(&s).contains("PRIVMSG"));
}

#[tokio::test]
async fn autojoin_skips_stale_group_conversations() {
    let mock = MockTransport::new();
    mock.respond(
        "conversations.list",
        listing(json!([
            general(),
            {"id": "G1", "name": "mpdm-old--me-1", "is_mpim": true,
             "latest": {"ts": "1000000000.000000"}},
            {"id": "G2", "name": "mpdm-quiet--me-1", "is_mpim": true},
            {"id": "C3", "name": "elsewhere", "is_member": false},
        ])),
    );
    mock.respond(
        "users.list",
        json!({"ok": true, "members": [
            {"id": "U1", "name": "alice", "is_admin": true},
            {"id": "U2", "name": "bob"},
            {"id": "U3", "name": "carol", "deleted": true},
        ], "response_metadata": {"next_cursor": ""}}),
    );
    mock.respond(
        "conversations.members",
        json!({"ok": true, "members": ["U1", "U2", "U3"]}),
    );

    let config = SessionConfig {
        autojoin: true,
        ..SessionConfig::default()
    };
    let s = registered(&mock, config).await;
    let out = output(&s);

    assert!(out.contains(":me!me@127.0.0.1 JOIN #general\n"));
    assert!(out.contains(":localhost 353 me = #general :@alice bob\n"));
    assert!(out.contains("JOIN #mpdm-quiet--me-1\n"));
    assert!(!out.contains("mpdm-old"));
    assert!(!out.contains("#elsewhere"));
    assert!(mock.calls_to("users.info").is_empty());
}

#[tokio::test]
async fn events_before_registration_are_held_in_order() {
    let mock = MockTransport::new();
    mock.respond("conversations.list", listing(json!([general()])));
    mock.respond("users.info", bob());

    let mut s = session(&mock, autojoin()).await;
    s.command("NICK me").await.unwrap();
    s.deliver(message("C1", "U1", "one")).await.unwrap();
    s.deliver(message("C1", "U1", "two")).await.unwrap();
    assert_eq!(output(&s), "");

    s.command("USER me 0 * :Me").await.unwrap();
    let out = output(&s);
    let join = out.find("JOIN #general").unwrap();
    let one = out.find(":bob!bob@127.0.0.1 PRIVMSG #general :one\n").unwrap();
    let two = out.find(":bob!bob@127.0.0.1 PRIVMSG #general :two\n").unwrap();
    assert!(join < one && one < two);

    // A second registration flushes nothing again.
    s.command("USER me 0 * :Me").await.unwrap();
    assert_eq!(output(&s).matches("PRIVMSG").count(), 2);
}

#[tokio::test]
async fn remote_messages_are_rendered() {
    let mock = MockTransport::new();
    mock.respond("conversations.list", listing(json!([general()])));
    mock.respond("users.info", bob());

    let mut s = registered(&mock, autojoin()).await;
    let before = output(&s).len();

    s.deliver(message("C1", "U1", "line one\n\nline <#C9|two>")).await.unwrap();
    s.deliver(RemoteEvent::Action(Message {
        channel: "C1".into(),
        user: "U1".into(),
        text: "waves".into(),
    }))
    .await
    .unwrap();
    s.deliver(RemoteEvent::Bot(BotMessage {
        channel: "C1".into(),
        text: "deployed".into(),
        username: "ci".into(),
        bot_id: Some("B1".into()),
    }))
    .await
    .unwrap();
    s.deliver(RemoteEvent::Edit(MessageEdit {
        channel: "C1".into(),
        previous: MessageBody {
            user: "U1".into(),
            text: "same".into(),
        },
        current: MessageBody {
            user: "U1".into(),
            text: "same".into(),
        },
    }))
    .await
    .unwrap();

    assert_eq!(
        &output(&s)[before..],
        ":bob!bob@127.0.0.1 PRIVMSG #general :line one\n\
         :bob!bob@127.0.0.1 PRIVMSG #general :line #two\n\
         :bob!bob@127.0.0.1 PRIVMSG #general :\x01ACTION waves\x01\n\
         :bot!bot@127.0.0.1 PRIVMSG #general :[ci] deployed\n"
    );
}

#[tokio::test]
async fn membership_and_topic_events() {
    let mock = MockTransport::new();
    mock.respond("conversations.list", listing(json!([general()])));
    mock.respond("users.info", bob());

    let mut s = registered(&mock, autojoin()).await;
    let before = output(&s).len();

    let joined = s
        .remote_mut()
        .normalize(json!({"type": "member_joined_channel", "channel": "C1", "user": "U1"}))
        .await
        .unwrap();
    s.deliver(joined).await.unwrap();
    let topic = s
        .remote_mut()
        .normalize(json!({"type": "message", "subtype": "channel_topic", "channel": "C1",
                          "user": "U1", "topic": "release day", "ts": "1700000000.000300"}))
        .await
        .unwrap();
    s.deliver(topic).await.unwrap();

    assert_eq!(
        &output(&s)[before..],
        ":bob!Bob_B@127.0.0.1 JOIN :#general\n\
         :localhost 332 me #general :release day\n"
    );
}

#[tokio::test]
async fn whois_of_unknown_user() {
    let mock = MockTransport::new();
    let mut s = session(&mock, SessionConfig::default()).await;
    s.command("NICK me").await.unwrap();
    s.command("WHOIS ghost").await.unwrap();
    assert_eq!(
        output(&s),
        ":localhost 401 me ghost :Unknown user ghost\n:localhost 318 me ghost :\n"
    );
}

#[tokio::test]
async fn whois_of_known_user() {
    let mock = MockTransport::new();
    mock.respond(
        "users.info",
        json!({"ok": true, "user": {"id": "U1", "name": "bob", "is_admin": true,
               "profile": {"real_name": "Bob B", "email": "bob@example.org"}}}),
    );
    let mut s = session(&mock, SessionConfig::default()).await;
    s.remote_mut().get_user("U1").await.unwrap();
    s.command("NICK me").await.unwrap();
    s.command("WHOIS bob").await.unwrap();
    s.command("WHOIS b*").await.unwrap();
    assert_eq!(
        output(&s),
        ":localhost 311 me bob  localhost :Bob B\n\
         :localhost 311 me bob  localhost :email: bob@example.org\n\
         :localhost 313 me bob :bob is an IRC operator\n\
         :localhost 318 me bob :\n\
         :localhost 421 me :Wildcards are not supported\n"
    );
}

#[tokio::test]
async fn unknown_and_incomplete_commands() {
    let mock = MockTransport::new();
    let mut s = session(&mock, SessionConfig::default()).await;
    s.command("NICK me").await.unwrap();
    s.command("FOO bar").await.unwrap();
    s.command("KICK #general").await.unwrap();
    s.command("SENDFILE #general").await.unwrap();
    assert_eq!(
        output(&s),
        ":localhost 421 me FOO :Unknown command\n\
         :localhost 461 me KICK :Not enough parameters\n\
         :localhost 421 me SENDFILE :Syntax: /sendfile #channel filename\n"
    );
}

#[tokio::test]
async fn list_and_topic_query() {
    let mock = MockTransport::new();
    mock.respond("conversations.list", listing(json!([general()])));
    let mut s = session(&mock, SessionConfig::default()).await;
    s.command("NICK me").await.unwrap();

    s.command("LIST").await.unwrap();
    s.command("TOPIC #general").await.unwrap();
    s.command("TOPIC #general :new").await.unwrap();
    assert_eq!(
        output(&s),
        ":localhost 322 me #general 3 :chat\n\
         :localhost 323 me :End of LIST\n\
         :localhost 332 me #general :chat\n\
         :localhost 421 me :Unable to set topic to new\n"
    );
}

#[tokio::test]
async fn ping_mode_userhost_and_away() {
    let mock = MockTransport::new();
    mock.respond("users.setPresence", json!({"ok": true}));
    let mut s = session(&mock, SessionConfig::default()).await;
    s.command("NICK me").await.unwrap();

    s.command("PING abc").await.unwrap();
    s.command("MODE #general").await.unwrap();
    s.command("USERHOST bob").await.unwrap();
    s.command("AWAY :lunch").await.unwrap();
    s.command("AWAY").await.unwrap();
    assert_eq!(
        output(&s),
        ":localhost PONG localhost abc\n\
         :localhost 324 me #general + :\n\
         :localhost 302 me bob=+unknown :\n\
         :localhost 306 me :Away status changed\n\
         :localhost 305 me :Away status changed\n"
    );
    let presence: Vec<Value> = mock
        .calls_to("users.setPresence")
        .into_iter()
        .map(|p| p["presence"].clone())
        .collect();
    assert_eq!(presence, [json!("away"), json!("auto")]);
}

#[tokio::test]
async fn kick_unknown_user() {
    let mock = MockTransport::new();
    mock.respond("conversations.list", listing(json!([general()])));
    let mut s = session(&mock, SessionConfig::default()).await;
    s.command("NICK me").await.unwrap();
    s.command("KICK #general ghost").await.unwrap();
    assert_eq!(output(&s), ":localhost 401 me ghost :Unknown user ghost\n");
    assert!(mock.calls_to("conversations.kick").is_empty());
}

#[tokio::test]
async fn sendfile_uploads_to_the_channel() {
    let mock = MockTransport::new();
    mock.respond("conversations.list", listing(json!([general()])));
    mock.respond("files.upload", json!({"ok": true}));

    let path = std::env::temp_dir().join(format!("ircgate-upload-{}.txt", std::process::id()));
    std::fs::write(&path, b"report").unwrap();
    let path_str = path.to_string_lossy().into_owned();

    let mut s = session(&mock, SessionConfig::default()).await;
    s.command("NICK me").await.unwrap();
    s.command(&format!("SENDFILE #general {}", path_str)).await.unwrap();
    std::fs::remove_file(&path).unwrap();

    let uploads = mock.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].0, "C1");
    assert_eq!(uploads[0].2, b"report");
    assert_eq!(
        output(&s),
        format!(":localhost NOTICE me :Upload of {} completed\n", path_str)
    );
}

#[tokio::test]
async fn quit_stops_the_session() {
    let mock = MockTransport::new();
    let mut s = session(&mock, SessionConfig::default()).await;
    assert_eq!(s.command("QUIT :bye").await.unwrap(), Flow::Quit);
    assert_eq!(s.command("PING x").await.unwrap(), Flow::Continue);
}
