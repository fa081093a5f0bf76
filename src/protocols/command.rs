//! Shared parsing for `VERB[ ARG]` command lines and `NNN text` replies.

use crate::runtime::Framing;
use bytes::Bytes;
use tracing::warn;

/// A parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command<'a> {
    /// Upper-cased verb.
    pub verb: String,
    /// Text after the first space, trimmed. `None` when absent or blank.
    pub arg: Option<&'a str>,
}

impl<'a> Command<'a> {
    /// Parse a frame as a command line.
    ///
    /// Returns `None` when the frame is not UTF-8 or is blank.
    pub fn parse(frame: &'a [u8]) -> Option<Self> {
        let line = std::str::from_utf8(frame).ok()?.trim();
        if line.is_empty() {
            return None;
        }
        let (verb, arg) = match line.split_once(' ') {
            Some((verb, rest)) => (verb, Some(rest.trim()).filter(|a| !a.is_empty())),
            None => (line, None),
        };
        Some(Command {
            verb: verb.to_ascii_uppercase(),
            arg,
        })
    }
}

/// Format a status reply in `framing`.
///
/// A reply the framing cannot carry comes back empty and is never sent.
pub fn reply(framing: &Framing, code: u16, text: &str) -> Bytes {
    framing
        .encode(format!("{code} {text}").as_bytes())
        .unwrap_or_else(|error| {
            warn!(code, %error, "dropping reply");
            Bytes::new()
        })
}

/// Strip a `KEYWORD:` prefix (case-insensitive) and surrounding angle
/// brackets: `FROM:<a@b>` -> `a@b`.
pub fn keyword_value<'a>(arg: &'a str, keyword: &str) -> Option<&'a str> {
    let head = arg.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let value = arg[keyword.len()..].trim();
    let value = value
        .strip_prefix('<')
        .and_then(|v| v.strip_suffix('>'))
        .unwrap_or(value);
    Some(value)
}
