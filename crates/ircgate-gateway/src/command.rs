use thiserror::Error;

/// One client command, already split into its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Nick(String),
    User { username: String, realname: String },
    Ping(String),
    Join(Vec<String>),
    Part(Vec<String>),
    Privmsg { target: String, text: String },
    List,
    Who(String),
    Whois(Vec<String>),
    Mode(String),
    Topic { channel: String, topic: Option<String> },
    Kick { channel: String, nick: String },
    Invite { nick: String, channel: String },
    Away(Option<String>),
    Userhost(Vec<String>),
    Quit,
    SendFile { target: String, path: String },
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("not enough parameters for {0}")]
    NeedMoreParams(&'static str),
    #[error("Syntax: /sendfile #channel filename")]
    SendFileSyntax,
}

impl Command {
    /// Parses one line. Command names are case-insensitive. `None` for a
    /// blank line.
    pub fn parse(line: &str) -> Result<Option<Command>, ParseError> {
        let line = line.trim_end_matches(['\r', '\n']).trim_start();
        if line.is_empty() {
            return Ok(None);
        }
        let (token, rest) = match line.split_once(' ') {
            Some((token, rest)) => (token, rest.trim_start()),
            None => (line, ""),
        };
        let name = token.to_ascii_uppercase();
        let words: Vec<&str> = rest.split_whitespace().collect();

        let cmd = match name.as_str() {
            "NICK" => Command::Nick(first(&words, "NICK")?.trim_start_matches(':').to_string()),
            "USER" => Command::User {
                username: first(&words, "USER")?.to_string(),
                realname: rest
                    .split_once(" :")
                    .map(|(_, r)| r.to_string())
                    .unwrap_or_default(),
            },
            "PING" => {
                if rest.is_empty() {
                    return Err(ParseError::NeedMoreParams("PING"));
                }
                Command::Ping(rest.to_string())
            }
            "JOIN" => Command::Join(list(first(&words, "JOIN")?)),
            "PART" => Command::Part(list(first(&words, "PART")?)),
            "PRIVMSG" => {
                let (target, text) = two(rest, "PRIVMSG")?;
                Command::Privmsg {
                    target: target.to_string(),
                    text: trailing(text).to_string(),
                }
            }
            "LIST" => Command::List,
            "WHO" => Command::Who(first(&words, "WHO")?.to_string()),
            "WHOIS" => {
                if words.is_empty() {
                    return Err(ParseError::NeedMoreParams("WHOIS"));
                }
                Command::Whois(words.iter().map(|w| w.to_string()).collect())
            }
            "MODE" => Command::Mode(first(&words, "MODE")?.to_string()),
            "TOPIC" => {
                let channel = first(&words, "TOPIC")?.to_string();
                let topic = rest
                    .split_once(' ')
                    .map(|(_, t)| trailing(t.trim_start()).to_string());
                Command::Topic { channel, topic }
            }
            "KICK" => {
                let [channel, nick, ..] = words[..] else {
                    return Err(ParseError::NeedMoreParams("KICK"));
                };
                Command::Kick {
                    channel: channel.to_string(),
                    nick: nick.to_string(),
                }
            }
            "INVITE" => {
                let [nick, channel, ..] = words[..] else {
                    return Err(ParseError::NeedMoreParams("INVITE"));
                };
                Command::Invite {
                    nick: nick.to_string(),
                    channel: channel.to_string(),
                }
            }
            "AWAY" => {
                let message = trailing(rest).trim();
                Command::Away((!message.is_empty()).then(|| message.to_string()))
            }
            "USERHOST" => Command::Userhost(words.iter().map(|w| w.to_string()).collect()),
            "QUIT" => Command::Quit,
            "SENDFILE" => {
                let (target, path) = two(rest, "SENDFILE").map_err(|_| ParseError::SendFileSyntax)?;
                Command::SendFile {
                    target: target.to_string(),
                    path: path.to_string(),
                }
            }
            _ => Command::Unknown(token.to_string()),
        };
        Ok(Some(cmd))
    }
}

fn first<'a>(words: &[&'a str], command: &'static str) -> Result<&'a str, ParseError> {
    words.first().copied().ok_or(ParseError::NeedMoreParams(command))
}

/// First word and the unsplit remainder.
fn two<'a>(rest: &'a str, command: &'static str) -> Result<(&'a str, &'a str), ParseError> {
    match rest.split_once(' ') {
        Some((a, b)) if !a.is_empty() && !b.trim().is_empty() => Ok((a, b.trim_start())),
        _ => Err(ParseError::NeedMoreParams(command)),
    }
}

fn trailing(s: &str) -> &str {
    s.strip_prefix(':').unwrap_or(s)
}

fn list(s: &str) -> Vec<String> {
    s.split(',')
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Command {
        Command::parse(line).unwrap().unwrap()
    }

    #[test]
    fn privmsg_keeps_spaces_and_strips_colon() {
        assert_eq!(
            parse("PRIVMSG #general :hello  there"),
            Command::Privmsg {
                target: "#general".into(),
                text: "hello  there".into(),
            }
        );
        assert_eq!(
            parse("privmsg bob hi"),
            Command::Privmsg {
                target: "bob".into(),
                text: "hi".into(),
            }
        );
    }

    #[test]
    fn user_takes_realname_after_colon() {
        assert_eq!(
            parse("USER me 8 * :Real Name\r\n"),
            Command::User {
                username: "me".into(),
                realname: "Real Name".into(),
            }
        );
    }

    #[test]
    fn join_splits_lists() {
        assert_eq!(parse("JOIN #a,#b"), Command::Join(vec!["#a".into(), "#b".into()]));
    }

    #[test]
    fn topic_query_and_set() {
        assert_eq!(
            parse("TOPIC #a"),
            Command::Topic {
                channel: "#a".into(),
                topic: None,
            }
        );
        assert_eq!(
            parse("TOPIC #a :new topic"),
            Command::Topic {
                channel: "#a".into(),
                topic: Some("new topic".into()),
            }
        );
    }

    #[test]
    fn away_with_and_without_message() {
        assert_eq!(parse("AWAY :lunch"), Command::Away(Some("lunch".into())));
        assert_eq!(parse("AWAY"), Command::Away(None));
    }

    #[test]
    fn missing_parameters() {
        assert_eq!(Command::parse("JOIN"), Err(ParseError::NeedMoreParams("JOIN")));
        assert_eq!(Command::parse("KICK #a"), Err(ParseError::NeedMoreParams("KICK")));
        assert_eq!(Command::parse("PRIVMSG #a"), Err(ParseError::NeedMoreParams("PRIVMSG")));
        assert_eq!(Command::parse("sendfile #a"), Err(ParseError::SendFileSyntax));
    }

    #[test]
    fn unknown_keeps_token() {
        assert_eq!(parse("CAP LS 302"), Command::Unknown("CAP".into()));
        assert_eq!(Command::parse("   "), Ok(None));
    }
}
