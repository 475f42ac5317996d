//! IRC wire messages (RFC 2812 plus IRCv3 tags).

use std::collections::HashMap;
use std::fmt;

/// A parsed protocol line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub tags: HashMap<String, String>,
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("missing command")]
    MissingCommand,
    #[error("line exceeds {0} bytes")]
    TooLong(usize),
}

/// Upper bound on an incoming line, tags included.
pub const MAX_LINE: usize = 8191 + 512;

impl Message {
    pub fn new(command: &str, params: Vec<String>) -> Self {
        Self {
            command: command.to_string(),
            params,
            ..Self::default()
        }
    }

    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.len() > MAX_LINE {
            return Err(ParseError::TooLong(MAX_LINE));
        }
        let mut rest = line.trim_start_matches(' ');
        if rest.is_empty() {
            return Err(ParseError::Empty);
        }

        let mut tags = HashMap::new();
        if let Some(stripped) = rest.strip_prefix('@') {
            let (raw_tags, after) = stripped.split_once(' ').unwrap_or((stripped, ""));
            for tag in raw_tags.split(';').filter(|t| !t.is_empty()) {
                let (key, value) = tag.split_once('=').unwrap_or((tag, ""));
                tags.insert(key.to_string(), unescape_tag(value));
            }
            rest = after.trim_start_matches(' ');
        }

        let mut prefix = None;
        if let Some(stripped) = rest.strip_prefix(':') {
            let (p, after) = stripped.split_once(' ').unwrap_or((stripped, ""));
            prefix = Some(p.to_string());
            rest = after.trim_start_matches(' ');
        }

        let (command, mut rest) = rest.split_once(' ').unwrap_or((rest, ""));
        if command.is_empty() {
            return Err(ParseError::MissingCommand);
        }

        let mut params = Vec::new();
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            match rest.split_once(' ') {
                Some((param, after)) => {
                    params.push(param.to_string());
                    rest = after;
                }
                None => {
                    params.push(rest.to_string());
                    break;
                }
            }
        }

        Ok(Self {
            tags,
            prefix,
            command: command.to_ascii_uppercase(),
            params,
        })
    }

    /// Nickname part of the prefix.
    pub fn source_nick(&self) -> Option<&str> {
        self.prefix.as_deref().and_then(|p| p.split(['!', '@']).next())
    }

    /// Numeric reply code, if the command is three digits.
    pub fn numeric(&self) -> Option<u16> {
        if self.command.len() == 3 {
            self.command.parse().ok()
        } else {
            None
        }
    }

    pub fn param(&self, index: usize) -> &str {
        self.params.get(index).map(String::as_str).unwrap_or_default()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.tags.is_empty() {
            let mut tags: Vec<_> = self.tags.iter().collect();
            tags.sort();
            f.write_str("@")?;
            for (i, (key, value)) in tags.into_iter().enumerate() {
                if i > 0 {
                    f.write_str(";")?;
                }
                if value.is_empty() {
                    write!(f, "{key}")?;
                } else {
                    write!(f, "{key}={}", escape_tag(value))?;
                }
            }
            f.write_str(" ")?;
        }
        if let Some(prefix) = &self.prefix {
            write!(f, ":{prefix} ")?;
        }
        f.write_str(&self.command)?;
        let last = self.params.len().saturating_sub(1);
        for (i, param) in self.params.iter().enumerate() {
            if i == last && (param.is_empty() || param.contains(' ') || param.starts_with(':')) {
                write!(f, " :{param}")?;
            } else {
                write!(f, " {param}")?;
            }
        }
        Ok(())
    }
}

/// Split a `\x01KIND args\x01` CTCP payload.
pub fn parse_ctcp(text: &str) -> Option<(String, String)> {
    let inner = text.strip_prefix('\u{1}')?;
    let inner = inner.strip_suffix('\u{1}').unwrap_or(inner);
    let (kind, args) = inner.split_once(' ').unwrap_or((inner, ""));
    if kind.is_empty() {
        return None;
    }
    Some((kind.to_ascii_uppercase(), args.to_string()))
}

fn unescape_tag(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

fn escape_tag(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ';' => out.push_str("\\:"),
            ' ' => out.push_str("\\s"),
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_prefix_command_and_trailing() {
        let msg = Message::parse(":nick!user@host PRIVMSG #chan :hello there\r\n").unwrap();
        assert_eq!(msg.prefix.as_deref(), Some("nick!user@host"));
        assert_eq!(msg.source_nick(), Some("nick"));
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#chan", "hello there"]);
    }

    #[test]
    fn parses_numeric_without_prefix() {
        let msg = Message::parse("005 me NETWORK=Example CHANTYPES=# :are supported").unwrap();
        assert_eq!(msg.numeric(), Some(5));
        assert_eq!(msg.params.len(), 4);
        assert_eq!(msg.param(1), "NETWORK=Example");
        assert_eq!(msg.param(9), "");
    }

    #[test]
    fn parses_tags() {
        let msg = Message::parse("@time=2024-01-01T00:00:00Z;note=a\\sb :s NOTICE me :x").unwrap();
        assert_eq!(msg.tags["time"], "2024-01-01T00:00:00Z");
        assert_eq!(msg.tags["note"], "a b");
        assert_eq!(msg.command, "NOTICE");
    }

    #[test]
    fn rejects_empty_lines() {
        assert_eq!(Message::parse("\r\n"), Err(ParseError::Empty));
        assert_eq!(Message::parse(":prefix"), Err(ParseError::MissingCommand));
    }

    #[test]
    fn serializes_trailing_param() {
        let msg = Message::new("PRIVMSG", vec!["#c".into(), "two words".into()]);
        assert_eq!(msg.to_string(), "PRIVMSG #c :two words");
        let msg = Message::new("JOIN", vec!["#c".into()]);
        assert_eq!(msg.to_string(), "JOIN #c");
    }

    #[test]
    fn ctcp_payloads() {
        assert_eq!(
            parse_ctcp("\u{1}ACTION waves\u{1}"),
            Some(("ACTION".to_string(), "waves".to_string()))
        );
        assert_eq!(
            parse_ctcp("\u{1}version\u{1}"),
            Some(("VERSION".to_string(), String::new()))
        );
        assert_eq!(parse_ctcp("plain"), None);
    }
}
