//! Line scanning and classification for the integration dialogue.
//!
//! The gateway terminates ordinary lines with CRLF, but its three prompts
//! (`GNET> `, `login: `, `password: `) arrive with no terminator at all,
//! so a plain line splitter would wait forever at a prompt. The scanner
//! treats a prompt found in the stream as a complete token. CR, LF, and
//! NUL all count as separator bytes; the gateway occasionally pads with
//! NULs.

use crate::level::parse_level;

/// The command prompt, trailing space included.
pub const PROMPT: &str = "GNET> ";
/// Login prompt, expected first after TCP connect.
pub const LOGIN_PROMPT: &str = "login: ";
/// Password prompt, expected after the username is sent.
pub const PASSWORD_PROMPT: &str = "password: ";
/// Line terminator for outbound commands.
pub const CRLF: &str = "\r\n";

const SEPARATORS: &[char] = &['\r', '\n', '\0'];

/// Incremental tokenizer over the raw byte stream from the gateway.
#[derive(Debug, Default)]
pub struct LineScanner {
    buf: String,
}

impl LineScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes from the socket. The protocol is ASCII; stray
    /// non-UTF-8 bytes are replaced rather than poisoning the stream.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.push_str(&String::from_utf8_lossy(bytes));
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Extract the next complete token: a separator-terminated line, the
    /// command prompt, or (when `expected` names a login-style prompt)
    /// that prompt. Returns `None` when more bytes are needed.
    pub fn next_token(&mut self, expected: Option<&str>) -> Option<String> {
        let skip = self
            .buf
            .find(|c| !SEPARATORS.contains(&c))
            .unwrap_or(self.buf.len());
        let rest = &self.buf[skip..];
        let sep = rest.find(SEPARATORS);
        let gnet = rest.find(PROMPT);

        // End of the token: the first separator, or the end of an embedded
        // command prompt, whichever comes first.
        let mut end = match (gnet, sep) {
            (Some(g), Some(s)) => (g + PROMPT.len()).min(s),
            (Some(g), None) => g + PROMPT.len(),
            (None, Some(s)) => s,
            (None, None) => usize::MAX,
        };
        if let Some(user) = expected {
            if let Some(pos) = rest.find(user) {
                if pos + user.len() < end {
                    end = pos + user.len();
                }
            }
        }
        if end == usize::MAX || end > rest.len() {
            return None;
        }

        let token = rest[..end].to_string();
        let after = skip + end;
        let resume = self.buf[after..]
            .find(|c| !SEPARATORS.contains(&c))
            .map(|p| after + p)
            .unwrap_or(self.buf.len());
        self.buf.drain(..resume);
        Some(token)
    }

    /// Drain whatever is buffered as a final token. Used when the stream
    /// closes with a partial line still pending.
    pub fn take_remainder(&mut self) -> Option<String> {
        let skip = self
            .buf
            .find(|c| !SEPARATORS.contains(&c))
            .unwrap_or(self.buf.len());
        let token = self.buf[skip..].to_string();
        self.buf.clear();
        if token.is_empty() {
            None
        } else {
            Some(token)
        }
    }
}

/// The head of a query command: the text between `?` and the last comma.
///
/// A `?OUTPUT,5,1` query is answered by a line starting `~OUTPUT,5`; the
/// final field of the query (the action code) is not echoed in front of
/// the reply value.
pub fn query_head(cmd: &str) -> &str {
    let body = cmd.strip_prefix('?').unwrap_or(cmd);
    match body.rfind(',') {
        Some(idx) => &body[..idx],
        None => body,
    }
}

/// Whether `line` is the reply to a pending query with the given head.
pub fn matches_reply(head: &str, line: &str) -> bool {
    !head.is_empty()
        && line.len() > head.len()
        && line.starts_with('~')
        && line[1..].starts_with(head)
}

/// Whether a line is one of the gateway's two error shapes.
pub fn is_error_line(line: &str) -> bool {
    line.starts_with("~ERROR") || line == "is an unknown command"
}

/// A recognized status line. Anything else (including error lines) is
/// handled by the link before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update<'a> {
    /// `~OUTPUT,<id>,1,<LL.DD>` - fixture level report.
    Output { id: i32, level: i32 },
    /// `~DEVICE,<dev>,<comp>,<action>[,<value>]` - keypad event. The
    /// value is kept raw: LED state reports carry `0`, `1`, or an
    /// unknown-state marker such as `255` that must be preserved.
    Device {
        device: i32,
        component: i32,
        action: u32,
        value: Option<&'a str>,
    },
    /// `~SYSTEM,1,HH:MM:SS` - time-of-day report.
    Time { h: u32, m: u32, s: u32 },
}

/// Classify a status line. Returns `None` for anything that is not one of
/// the shapes the daemon acts on.
pub fn parse_update(line: &str) -> Option<Update<'_>> {
    if let Some(rest) = line.strip_prefix("~OUTPUT,") {
        let mut fields = rest.splitn(3, ',');
        let id: i32 = fields.next()?.parse().ok()?;
        if fields.next()? != "1" {
            return None;
        }
        let level = parse_level(fields.next()?);
        return Some(Update::Output { id, level });
    }
    if let Some(rest) = line.strip_prefix("~DEVICE,") {
        let mut fields = rest.splitn(4, ',');
        let device: i32 = fields.next()?.parse().ok()?;
        let component: i32 = fields.next()?.parse().ok()?;
        let action: u32 = fields.next()?.parse().ok()?;
        let value = fields.next();
        return Some(Update::Device {
            device,
            component,
            action,
            value,
        });
    }
    if let Some(rest) = line.strip_prefix("~SYSTEM,1,") {
        let mut fields = rest.splitn(3, ':');
        let h: u32 = fields.next()?.trim().parse().ok()?;
        let m: u32 = fields.next()?.trim().parse().ok()?;
        let s: u32 = fields
            .next()?
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect::<String>()
            .parse()
            .ok()?;
        if h < 24 && m < 60 && s < 60 {
            return Some(Update::Time { h, m, s });
        }
        return None;
    }
    None
}
