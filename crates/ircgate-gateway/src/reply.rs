/// Numeric replies sent to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Reply {
    Welcome = 1,
    YourHost = 2,
    LuserClient = 251,
    UserHost = 302,
    UnAway = 305,
    NowAway = 306,
    WhoisUser = 311,
    WhoisOperator = 313,
    EndOfWho = 315,
    EndOfWhois = 318,
    List = 322,
    ListEnd = 323,
    ChannelModeIs = 324,
    Topic = 332,
    WhoReply = 352,
    NamReply = 353,
    EndOfNames = 366,
    NoSuchNick = 401,
    NoSuchChannel = 403,
    UnknownCommand = 421,
    FileError = 424,
    ErroneousNickname = 432,
    NeedMoreParams = 461,
}

impl Reply {
    pub fn code(self) -> u16 {
        self as u16
    }
}

/// `:<host> <code> <nick> <params...> :<trailing>`
pub fn format_reply(host: &str, reply: Reply, nick: &str, params: &[&str], trailing: &str) -> String {
    let nick = if nick.is_empty() { "*" } else { nick };
    let mut line = format!(":{} {:03} {}", host, reply.code(), nick);
    for p in params {
        line.push(' ');
        line.push_str(p);
    }
    line.push_str(" :");
    line.push_str(trailing);
    line.push('\n');
    line
}
