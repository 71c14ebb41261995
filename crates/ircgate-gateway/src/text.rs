//! Conversion of message text between the remote markup and plain client
//! text.

use std::ops::Range;
use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};
use tracing::{debug, warn};

use ircgate_remote::RemoteState;

static USER_MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<@([0-9A-Za-z]+)>").expect("static regex"));
static CHANNEL_MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<#[A-Z0-9]+\|([A-Z0-9\-a-z]+)>").expect("static regex"));
static LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<([a-z0-9\-\.]+)://([^\s\|]+)[\|]{0,1}([^<>]*)>").expect("static regex")
});
/// Markup produced by [`escape_for_remote`], which names must never be matched inside.
static ESCAPED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&(?:amp|lt|gt);|<![a-z]+>").expect("static regex"));

const ENTITIES: [(&str, &str); 3] = [("&amp;", "&"), ("&gt;", ">"), ("&lt;", "<")];

/// Remote broadcast marker, client-side word, and how it reads once received.
const BROADCASTS: [(&str, &str, &str); 3] = [
    ("<!here>", "@here", "yelling"),
    ("<!channel>", "@channel", "YELLING LOUDER"),
    ("<!everyone>", "@everyone", "DEAFENING YELL"),
];

/// Rewrites one line of remote text for the client.
///
/// User mentions become `@name` (the id itself when the user cannot be
/// resolved), channel mentions `#name`, links `scheme://target (label)`.
/// Each kind is replaced leftmost first and the text re-scanned after every
/// replacement.
pub async fn decode_remote(text: &str, speaker: &str, remote: &mut RemoteState) -> String {
    let mut text = text.to_string();

    while let Some((range, id)) = first_capture(&USER_MENTION, &text) {
        let name = match remote.get_user(&id).await {
            Ok(user) => user.name,
            Err(e) => {
                debug!("Unable to resolve mention of {}: {}", id, e);
                id
            }
        };
        text.replace_range(range, &format!("@{}", name));
    }

    while let Some((range, name)) = first_capture(&CHANNEL_MENTION, &text) {
        text.replace_range(range, &format!("#{}", name));
    }

    text = decode_links(text);
    decode_broadcasts(&unescape_entities(&text), speaker)
}

fn first_capture(re: &Regex, text: &str) -> Option<(Range<usize>, String)> {
    let caps = re.captures(text)?;
    Some((caps.get(0)?.range(), caps.get(1)?.as_str().to_string()))
}

fn decode_links(mut text: String) -> String {
    while let Some((range, plain)) = next_link(&text) {
        text.replace_range(range, &plain);
    }
    text
}

fn next_link(text: &str) -> Option<(Range<usize>, String)> {
    let caps = LINK.captures(text)?;
    let mut plain = format!("{}://{}", caps.get(1)?.as_str(), caps.get(2)?.as_str());
    let label = caps.get(3).map(|m| m.as_str()).unwrap_or_default();
    if !label.is_empty() {
        plain.push_str(&format!(" ({})", label));
    }
    Some((caps.get(0)?.range(), plain))
}

pub fn unescape_entities(text: &str) -> String {
    ENTITIES
        .iter()
        .fold(text.to_string(), |acc, (entity, plain)| acc.replace(entity, plain))
}

fn decode_broadcasts(text: &str, speaker: &str) -> String {
    BROADCASTS
        .iter()
        .fold(text.to_string(), |acc, (marker, _, shout)| {
            acc.replace(marker, &format!("{} [{}]", shout, speaker))
        })
}

/// Escapes client text for the remote side and turns `@here` and friends
/// into broadcast markers. `&` goes first so nothing is escaped twice.
pub fn escape_for_remote(text: &str) -> String {
    let escaped = text
        .replace('&', "&amp;")
        .replace('>', "&gt;")
        .replace('<', "&lt;");
    BROADCASTS
        .iter()
        .fold(escaped, |acc, (marker, word, _)| acc.replace(word, marker))
}

/// Finds known user names in outgoing text.
///
/// The expression is rebuilt only when the generation of the name list it
/// was built from changes, so a rename shows up once the remote side drops
/// its cached user.
#[derive(Debug, Default)]
pub struct MentionMatcher {
    generation: Option<u64>,
    regex: Option<Regex>,
}

impl MentionMatcher {
    pub fn regex(&mut self, generation: u64, names: impl FnOnce() -> Vec<String>) -> Option<&Regex> {
        if self.generation != Some(generation) {
            self.regex = build_mention_regex(names());
            self.generation = Some(generation);
        }
        self.regex.as_ref()
    }
}

fn build_mention_regex(mut names: Vec<String>) -> Option<Regex> {
    if names.is_empty() {
        return None;
    }
    // Longest first, so `bob.smith` wins over `bob`.
    names.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    let alternation = names
        .iter()
        .map(|n| regex::escape(n))
        .collect::<Vec<_>>()
        .join("|");
    let pattern = format!(r"(://\S*)?@?\b({})\b", alternation);
    match RegexBuilder::new(&pattern).size_limit(1 << 26).build() {
        Ok(re) => Some(re),
        Err(e) => {
            warn!("Unable to build mention matcher for {} names: {}", names.len(), e);
            None
        }
    }
}

/// Replaces whole-word user names (with or without a leading `@`) by
/// remote mention markup. Names inside a URL, an escaped entity or a
/// broadcast marker are left alone. Replacement runs from the end of the
/// text so earlier offsets stay valid.
pub fn encode_mentions(text: &str, re: &Regex, lookup: impl Fn(&str) -> Option<String>) -> String {
    let escapes: Vec<Range<usize>> = ESCAPED.find_iter(text).map(|m| m.range()).collect();
    let found: Vec<(Range<usize>, bool, String)> = re
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let name = caps.get(2)?;
            Some((whole.range(), caps.get(1).is_some(), name.as_str().to_string()))
        })
        .collect();

    let mut out = text.to_string();
    for (range, in_url, name) in found.into_iter().rev() {
        if in_url || escapes.iter().any(|e| e.start < range.end && range.start < e.end) {
            continue;
        }
        if let Some(id) = lookup(&name) {
            out.replace_range(range, &format!("<@{}>", id));
        }
    }
    out
}
