//! Rule string tokenizer and parser
//!
//! Handles the subset of the daemon's rule language used for device rules:
//!
//! ```text
//! allow id 1d6b:0002 serial "0000:00:14.0" name "xHCI Host Controller"
//!     hash "jEP/6WzviqdJ5VSeTUY8PatCNBKeaREvo2OqdplND/o=" parent-hash "..."
//!     via-port "usb1" with-interface 09:00:00 with-connect-type ""
//! ```

use std::fmt::Write as _;

use thiserror::Error;

use super::device::{Attribute, DeviceId, InterfaceType, SetOperator};
use super::{Rule, Target};

/// Rule string parse failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleParseError {
    /// Input was blank
    #[error("empty rule")]
    Empty,

    /// First token is not a rule target
    #[error("unknown rule target `{0}`")]
    UnknownTarget(String),

    /// Token not valid at this position
    #[error("unexpected `{token}` at offset {offset}")]
    Unexpected { token: String, offset: usize },

    /// Quoted string without closing quote
    #[error("unterminated string starting at offset {0}")]
    UnterminatedString(usize),

    /// Unsupported or truncated escape sequence
    #[error("invalid escape at offset {0}")]
    InvalidEscape(usize),

    /// Decoded string is not UTF-8
    #[error("string starting at offset {0} is not valid UTF-8")]
    InvalidUtf8(usize),

    /// Attribute keyword at end of input
    #[error("missing value for `{0}`")]
    MissingValue(String),

    /// `{` list without closing `}`
    #[error("unterminated list for `{0}`")]
    UnterminatedList(String),

    /// Attribute given more than once
    #[error("duplicate attribute `{0}`")]
    Duplicate(String),

    /// Malformed vendor:product pair
    #[error("invalid device id `{0}`")]
    InvalidDeviceId(String),

    /// Malformed interface triple
    #[error("invalid interface type `{0}`")]
    InvalidInterface(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TokenKind {
    Word(String),
    Str(String),
    Open,
    Close,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

impl Token {
    fn describe(&self) -> String {
        match &self.kind {
            TokenKind::Word(w) => w.clone(),
            TokenKind::Str(s) => format!("\"{s}\""),
            TokenKind::Open => "{".to_string(),
            TokenKind::Close => "}".to_string(),
        }
    }

    fn unexpected(&self) -> RuleParseError {
        RuleParseError::Unexpected {
            token: self.describe(),
            offset: self.offset,
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, RuleParseError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let c = bytes[pos];
        match c {
            b' ' | b'\t' | b'\n' | b'\r' => pos += 1,
            b'{' => {
                tokens.push(Token { kind: TokenKind::Open, offset: pos });
                pos += 1;
            }
            b'}' => {
                tokens.push(Token { kind: TokenKind::Close, offset: pos });
                pos += 1;
            }
            b'"' => {
                let (value, next) = read_quoted(bytes, pos)?;
                tokens.push(Token { kind: TokenKind::Str(value), offset: pos });
                pos = next;
            }
            _ => {
                let start = pos;
                while pos < bytes.len() && !matches!(bytes[pos], b' ' | b'\t' | b'\n' | b'\r' | b'{' | b'}' | b'"') {
                    pos += 1;
                }
                tokens.push(Token {
                    kind: TokenKind::Word(input[start..pos].to_string()),
                    offset: start,
                });
            }
        }
    }

    Ok(tokens)
}

/// Read a quoted string starting at `start` (the opening quote)
fn read_quoted(bytes: &[u8], start: usize) -> Result<(String, usize), RuleParseError> {
    let mut out = Vec::new();
    let mut pos = start + 1;

    loop {
        let Some(&c) = bytes.get(pos) else {
            return Err(RuleParseError::UnterminatedString(start));
        };
        match c {
            b'"' => {
                let value = String::from_utf8(out).map_err(|_| RuleParseError::InvalidUtf8(start))?;
                return Ok((value, pos + 1));
            }
            b'\\' => {
                match bytes.get(pos + 1) {
                    Some(b'"') => out.push(b'"'),
                    Some(b'\\') => out.push(b'\\'),
                    Some(b'x') => {
                        let hex = bytes
                            .get(pos + 2..pos + 4)
                            .and_then(|h| std::str::from_utf8(h).ok())
                            .and_then(|h| u8::from_str_radix(h, 16).ok())
                            .ok_or(RuleParseError::InvalidEscape(pos))?;
                        out.push(hex);
                        pos += 2;
                    }
                    _ => return Err(RuleParseError::InvalidEscape(pos)),
                }
                pos += 2;
            }
            _ => {
                out.push(c);
                pos += 1;
            }
        }
    }
}

/// Quote a string value for a rule, escaping anything outside printable ASCII
pub(crate) fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for b in value.bytes() {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            0x20..=0x7e => out.push(char::from(b)),
            _ => {
                let _ = write!(out, "\\x{b:02x}");
            }
        }
    }
    out.push('"');
    out
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn string_value(&mut self, attribute: &str) -> Result<String, RuleParseError> {
        let token = self
            .next()
            .ok_or_else(|| RuleParseError::MissingValue(attribute.to_string()))?;
        match token.kind {
            TokenKind::Str(s) => Ok(s),
            _ => Err(token.unexpected()),
        }
    }

    fn interface_values(&mut self, attribute: &str) -> Result<Attribute<InterfaceType>, RuleParseError> {
        let missing = || RuleParseError::MissingValue(attribute.to_string());
        let first = self.next().ok_or_else(missing)?;

        let (operator, opening) = match &first.kind {
            TokenKind::Word(w) => match SetOperator::from_keyword(w) {
                Some(op) => (Some(op), self.next().ok_or_else(missing)?),
                None => {
                    return Ok(Attribute {
                        operator: None,
                        values: vec![w.parse()?],
                    });
                }
            },
            TokenKind::Open => (None, first.clone()),
            _ => return Err(first.unexpected()),
        };

        if opening.kind != TokenKind::Open {
            return Err(opening.unexpected());
        }

        let mut values = Vec::new();
        loop {
            let token = self
                .next()
                .ok_or_else(|| RuleParseError::UnterminatedList(attribute.to_string()))?;
            match token.kind {
                TokenKind::Close => break,
                TokenKind::Word(w) => values.push(w.parse()?),
                _ => return Err(token.unexpected()),
            }
        }

        Ok(Attribute { operator, values })
    }
}

fn set_once(slot: &mut Option<String>, keyword: &str, value: String) -> Result<(), RuleParseError> {
    if slot.is_some() {
        return Err(RuleParseError::Duplicate(keyword.to_string()));
    }
    *slot = Some(value);
    Ok(())
}

/// Parse a rule string
pub(crate) fn parse_rule(input: &str) -> Result<Rule, RuleParseError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };

    let first = parser.next().ok_or(RuleParseError::Empty)?;
    let target = match &first.kind {
        TokenKind::Word(w) => match w.as_str() {
            "allow" => Target::Allow,
            "block" => Target::Block,
            "reject" => Target::Reject,
            "match" => Target::Match,
            "device" => Target::Device,
            other => return Err(RuleParseError::UnknownTarget(other.to_string())),
        },
        _ => return Err(first.unexpected()),
    };

    let mut device_id = None;
    if let Some(Token { kind: TokenKind::Word(w), .. }) = parser.peek() {
        if w != "id" && w.contains(':') {
            device_id = Some(w.parse()?);
            parser.pos += 1;
        }
    }

    let mut name = None;
    let mut serial = None;
    let mut hash = None;
    let mut parent_hash = None;
    let mut via_port = None;
    let mut connect_type = None;
    let mut label = None;
    let mut interfaces: Option<Attribute<InterfaceType>> = None;

    while let Some(token) = parser.next() {
        let TokenKind::Word(keyword) = &token.kind else {
            return Err(token.unexpected());
        };

        match keyword.as_str() {
            "id" => {
                if device_id.is_some() {
                    return Err(RuleParseError::Duplicate("id".to_string()));
                }
                let value = parser
                    .next()
                    .ok_or_else(|| RuleParseError::MissingValue("id".to_string()))?;
                match value.kind {
                    TokenKind::Word(w) => device_id = Some(w.parse()?),
                    _ => return Err(value.unexpected()),
                }
            }
            "name" => set_once(&mut name, keyword, parser.string_value(keyword)?)?,
            "serial" => set_once(&mut serial, keyword, parser.string_value(keyword)?)?,
            "hash" => set_once(&mut hash, keyword, parser.string_value(keyword)?)?,
            "parent-hash" => set_once(&mut parent_hash, keyword, parser.string_value(keyword)?)?,
            "via-port" => set_once(&mut via_port, keyword, parser.string_value(keyword)?)?,
            "with-connect-type" => {
                set_once(&mut connect_type, keyword, parser.string_value(keyword)?)?;
            }
            "label" => set_once(&mut label, keyword, parser.string_value(keyword)?)?,
            "with-interface" => {
                if interfaces.is_some() {
                    return Err(RuleParseError::Duplicate(keyword.clone()));
                }
                interfaces = Some(parser.interface_values(keyword)?);
            }
            _ => return Err(token.unexpected()),
        }
    }

    Ok(Rule {
        rule_id: 0,
        target,
        device_id,
        name: name.unwrap_or_default(),
        serial: serial.unwrap_or_default(),
        via_port: via_port.unwrap_or_default(),
        hash: hash.unwrap_or_default(),
        parent_hash: parent_hash.unwrap_or_default(),
        connect_type: connect_type.unwrap_or_default(),
        label: label.unwrap_or_default(),
        interface_types: interfaces.unwrap_or_default(),
    })
}
