//! Text-frame pub/sub codec.
//!
//! Frames follow the STOMP 1.2 layout:
//!
//! ```text
//! COMMAND\n
//! header:value\n
//! ...\n
//! \n
//! body\0
//! ```
//!
//! Header names and values are escaped (`\\`, `\n`, `\r`, `:`) so arbitrary
//! text survives a round trip. A frame consisting only of line breaks is a
//! heart-beat and carries no frame at all (see [`is_heartbeat`]).

use std::fmt;

/// Errors produced while decoding a text frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The input contained nothing but whitespace.
    #[error("empty frame")]
    Empty,

    /// The command line did not name a known command.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// A header line had no `:` separator.
    #[error("malformed header line: {0}")]
    MalformedHeader(String),

    /// A header contained an escape sequence outside the allowed set.
    #[error("invalid escape sequence in header: {0}")]
    InvalidEscape(String),

    /// The header block was not terminated by an empty line.
    #[error("missing blank line after headers")]
    MissingBlankLine,

    /// The frame was not terminated by a NUL octet.
    #[error("missing NUL terminator")]
    MissingTerminator,

    /// Non-EOL data followed the NUL terminator.
    #[error("unexpected data after frame terminator")]
    TrailingData,
}

/// Frame commands understood by both ends of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Client handshake carrying the connection ticket.
    Connect,
    /// Server handshake acknowledgment.
    Connected,
    /// Open a subscription on a destination.
    Subscribe,
    /// Close a subscription by id.
    Unsubscribe,
    /// Client message to an application destination.
    Send,
    /// Server message delivered on a subscription.
    Message,
    /// Server acknowledgment of a client receipt request.
    Receipt,
    /// Server-reported error.
    Error,
    /// Graceful client disconnect.
    Disconnect,
}

impl Command {
    /// Wire spelling of the command.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Connected => "CONNECTED",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Send => "SEND",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
            Self::Disconnect => "DISCONNECT",
        }
    }

    /// Parse a command line. `STOMP` is accepted as a synonym for `CONNECT`.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        Some(match line {
            "CONNECT" | "STOMP" => Self::Connect,
            "CONNECTED" => Self::Connected,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "SEND" => Self::Send,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            "DISCONNECT" => Self::Disconnect,
            _ => return None,
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Well-known header names.
pub mod headers {
    /// Accepted protocol versions (client handshake).
    pub const ACCEPT_VERSION: &str = "accept-version";
    /// Negotiated protocol version (server handshake).
    pub const VERSION: &str = "version";
    /// Virtual host the client connects to.
    pub const HOST: &str = "host";
    /// Single-use connection ticket.
    pub const TICKET: &str = "ticket";
    /// Authenticated user id echoed by the server.
    pub const USER_ID: &str = "user-id";
    /// Authenticated role echoed by the server.
    pub const ROLE: &str = "role";
    /// Destination of a `SEND`, `SUBSCRIBE` or `MESSAGE`.
    pub const DESTINATION: &str = "destination";
    /// Subscription id.
    pub const ID: &str = "id";
    /// Subscription id a `MESSAGE` was delivered on.
    pub const SUBSCRIPTION: &str = "subscription";
    /// Server-assigned message id of a `MESSAGE`.
    pub const MESSAGE_ID: &str = "message-id";
    /// Body media type.
    pub const CONTENT_TYPE: &str = "content-type";
    /// Short error description on `ERROR` frames.
    pub const MESSAGE: &str = "message";
}

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: &str = "1.2";

/// A single decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The frame command.
    pub command: Command,
    headers: Vec<(String, String)>,
    /// The frame body (JSON for application frames).
    pub body: String,
}

impl Frame {
    /// Create an empty frame with the given command.
    #[must_use]
    pub const fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Append a header. Repeated names are kept; lookups return the first.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Replace the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of the named header.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// All headers in wire order.
    #[must_use]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Client handshake presenting a connection ticket.
    #[must_use]
    pub fn connect(host: &str, ticket: &str) -> Self {
        Self::new(Command::Connect)
            .with_header(headers::ACCEPT_VERSION, PROTOCOL_VERSION)
            .with_header(headers::HOST, host)
            .with_header(headers::TICKET, ticket)
    }

    /// Server handshake acknowledgment.
    #[must_use]
    pub fn connected(user_id: &str, role: &str) -> Self {
        Self::new(Command::Connected)
            .with_header(headers::VERSION, PROTOCOL_VERSION)
            .with_header(headers::USER_ID, user_id)
            .with_header(headers::ROLE, role)
    }

    /// Open a subscription.
    #[must_use]
    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new(Command::Subscribe)
            .with_header(headers::ID, id)
            .with_header(headers::DESTINATION, destination)
    }

    /// Close a subscription.
    #[must_use]
    pub fn unsubscribe(id: &str) -> Self {
        Self::new(Command::Unsubscribe).with_header(headers::ID, id)
    }

    /// Client message to an application destination.
    #[must_use]
    pub fn send(destination: &str, body: impl Into<String>) -> Self {
        Self::new(Command::Send)
            .with_header(headers::DESTINATION, destination)
            .with_header(headers::CONTENT_TYPE, "application/json")
            .with_body(body)
    }

    /// Server delivery on a subscription.
    #[must_use]
    pub fn message(
        subscription: &str,
        destination: &str,
        message_id: &str,
        body: impl Into<String>,
    ) -> Self {
        Self::new(Command::Message)
            .with_header(headers::SUBSCRIPTION, subscription)
            .with_header(headers::DESTINATION, destination)
            .with_header(headers::MESSAGE_ID, message_id)
            .with_header(headers::CONTENT_TYPE, "application/json")
            .with_body(body)
    }

    /// Server error frame.
    #[must_use]
    pub fn error(message: &str) -> Self {
        Self::new(Command::Error).with_header(headers::MESSAGE, message)
    }

    /// Graceful client disconnect.
    #[must_use]
    pub const fn disconnect() -> Self {
        Self::new(Command::Disconnect)
    }

    /// Destination header, if any.
    #[must_use]
    pub fn destination(&self) -> Option<&str> {
        self.header(headers::DESTINATION)
    }
}

/// Returns `true` if `text` is a heart-beat (only line breaks).
#[must_use]
pub fn is_heartbeat(text: &str) -> bool {
    !text.is_empty() && text.chars().all(|c| c == '\n' || c == '\r')
}

/// Encode a frame into its wire text.
#[must_use]
pub fn encode(frame: &Frame) -> String {
    let mut out = String::with_capacity(32 + frame.body.len());
    out.push_str(frame.command.as_str());
    out.push('\n');
    for (name, value) in &frame.headers {
        escape_into(&mut out, name);
        out.push(':');
        escape_into(&mut out, value);
        out.push('\n');
    }
    out.push('\n');
    out.push_str(&frame.body);
    out.push('\0');
    out
}

/// Decode a single frame from its wire text.
///
/// Leading line breaks (heart-beats) are skipped, as are line breaks after
/// the NUL terminator.
///
/// # Errors
///
/// Returns [`FrameError`] describing the first structural problem found.
pub fn decode(text: &str) -> Result<Frame, FrameError> {
    let text = text.trim_start_matches(['\r', '\n']);
    if text.is_empty() {
        return Err(FrameError::Empty);
    }

    let end = text.rfind('\0').ok_or(FrameError::MissingTerminator)?;
    if !text[end + 1..].chars().all(|c| c == '\n' || c == '\r') {
        return Err(FrameError::TrailingData);
    }
    let frame_text = &text[..end];

    let (command_line, mut rest) = split_line(frame_text).ok_or(FrameError::MissingBlankLine)?;
    let command = Command::parse(command_line)
        .ok_or_else(|| FrameError::UnknownCommand(command_line.to_string()))?;

    let mut frame = Frame::new(command);
    loop {
        let (line, after) = split_line(rest).ok_or(FrameError::MissingBlankLine)?;
        rest = after;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
        frame
            .headers
            .push((unescape(name)?, unescape(value)?));
    }
    frame.body = rest.to_string();
    Ok(frame)
}

/// Split off one line, accepting both `\n` and `\r\n` endings.
fn split_line(text: &str) -> Option<(&str, &str)> {
    let idx = text.find('\n')?;
    let line = &text[..idx];
    let line = line.strip_suffix('\r').unwrap_or(line);
    Some((line, &text[idx + 1..]))
}

fn escape_into(out: &mut String, raw: &str) {
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
}

fn unescape(raw: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::InvalidEscape(raw.to_string())),
        }
    }
    Ok(out)
}
