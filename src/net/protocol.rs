//! Call formatting and message parsing
//!
//! A call on the wire is `kind SEP method SEP timestamp [SEP arg]*` followed by
//! the frame terminator. The timestamp is the sender's wall clock in
//! microseconds, packed little-endian and rendered as standard base64.

use std::fmt;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::net::connection::Connection;
use crate::net::framing::{contains_reserved, SEPARATOR};

/// Which channel a message arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Reliable,
    Unreliable,
}

/// Sender wall-clock time in microseconds since the UNIX epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros();
        Self(micros as u64)
    }

    pub fn as_micros(&self) -> u64 {
        self.0
    }

    /// Wire form: base64 of the 8 little-endian bytes
    pub fn encode(&self) -> String {
        STANDARD.encode(self.0.to_le_bytes())
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let bytes = STANDARD
            .decode(text)
            .map_err(|_| ProtocolError::BadTimestamp(text.to_string()))?;
        let bytes: [u8; 8] = bytes
            .try_into()
            .map_err(|_| ProtocolError::BadTimestamp(text.to_string()))?;
        Ok(Self(u64::from_le_bytes(bytes)))
    }
}

/// Bound reference to a remote handler: declaring service kind plus method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerRef {
    pub kind: &'static str,
    pub method: &'static str,
}

impl HandlerRef {
    pub const fn new(kind: &'static str, method: &'static str) -> Self {
        Self { kind, method }
    }

    /// Key used by the dispatch table
    pub fn dispatch_key(&self) -> String {
        dispatch_key(self.kind, self.method)
    }
}

impl fmt::Display for HandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.method)
    }
}

#[inline]
pub fn dispatch_key(kind: &str, method: &str) -> String {
    let mut key = String::with_capacity(kind.len() + method.len() + 1);
    key.push_str(kind);
    key.push('.');
    key.push_str(method);
    key
}

/// Errors produced while formatting or parsing calls
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Field {0} contains a reserved control byte")]
    ReservedByte(usize),
    #[error("Message has {0} fields, need at least 3")]
    TooFewFields(usize),
    #[error("Empty {0} field")]
    EmptyField(&'static str),
    #[error("Bad timestamp field '{0}'")]
    BadTimestamp(String),
}

/// Format one call without the terminator
pub fn format_call<S: AsRef<str>>(
    handler: HandlerRef,
    sent_at: Timestamp,
    args: &[S],
) -> Result<String, ProtocolError> {
    let separator = SEPARATOR as char;
    let stamp = sent_at.encode();

    if contains_reserved(handler.kind) {
        return Err(ProtocolError::ReservedByte(0));
    }
    if contains_reserved(handler.method) {
        return Err(ProtocolError::ReservedByte(1));
    }

    let capacity = handler.kind.len()
        + handler.method.len()
        + stamp.len()
        + args.iter().map(|a| a.as_ref().len() + 1).sum::<usize>()
        + 2;
    let mut out = String::with_capacity(capacity);
    out.push_str(handler.kind);
    out.push(separator);
    out.push_str(handler.method);
    out.push(separator);
    out.push_str(&stamp);

    for (i, arg) in args.iter().enumerate() {
        let arg = arg.as_ref();
        if contains_reserved(arg) {
            return Err(ProtocolError::ReservedByte(i + 3));
        }
        out.push(separator);
        out.push_str(arg);
    }

    Ok(out)
}

/// Parsed incoming call
///
/// Immutable once parsed. Holds the originating connection so handlers can
/// reply on it.
#[derive(Clone)]
pub struct Message {
    raw: String,
    kind: String,
    method: String,
    sent_at: Timestamp,
    received_at: Instant,
    args: Vec<String>,
    connection: Arc<Connection>,
    transport: Transport,
}

impl Message {
    pub fn parse(
        frame: &str,
        connection: Arc<Connection>,
        transport: Transport,
        received_at: Instant,
    ) -> Result<Self, ProtocolError> {
        let mut fields = frame.split(SEPARATOR as char);
        let kind = fields.next().unwrap_or_default();
        let method = fields.next().ok_or(ProtocolError::TooFewFields(1))?;
        let stamp = fields.next().ok_or(ProtocolError::TooFewFields(2))?;

        if kind.is_empty() {
            return Err(ProtocolError::EmptyField("kind"));
        }
        if method.is_empty() {
            return Err(ProtocolError::EmptyField("method"));
        }

        Ok(Self {
            raw: frame.to_string(),
            kind: kind.to_string(),
            method: method.to_string(),
            sent_at: Timestamp::decode(stamp)?,
            received_at,
            args: fields.map(str::to_string).collect(),
            connection,
            transport,
        })
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn dispatch_key(&self) -> String {
        dispatch_key(&self.kind, &self.method)
    }

    pub fn sent_at(&self) -> Timestamp {
        self.sent_at
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Frame text as received, without terminator
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("method", &self.method)
            .field("sent_at", &self.sent_at)
            .field("args", &self.args)
            .field("connection", &self.connection.id())
            .field("transport", &self.transport)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::ConnectionRole;

    const MOVE: HandlerRef = HandlerRef::new("World", "Move");

    fn conn() -> Arc<Connection> {
        Arc::new(Connection::detached(ConnectionRole::Authority))
    }

    #[test]
    fn test_timestamp_wire_form() {
        let ts = Timestamp(1);
        // 01 00 00 00 00 00 00 00
        assert_eq!(ts.encode(), "AQAAAAAAAAA=");
        assert_eq!(Timestamp::decode("AQAAAAAAAAA=").unwrap(), ts);
    }

    #[test]
    fn test_timestamp_rejects_wrong_length() {
        assert!(Timestamp::decode("AQA=").is_err());
        assert!(Timestamp::decode("not base64!").is_err());
    }

    #[test]
    fn test_timestamp_now_is_monotonic_enough() {
        let a = Timestamp::now();
        let b = Timestamp::now();
        assert!(b >= a);
        assert!(a.as_micros() > 0);
    }

    #[test]
    fn test_format_and_parse() {
        let sent = Timestamp(42);
        let text = format_call(MOVE, sent, &["1.5", "héllo"]).unwrap();
        let msg = Message::parse(&text, conn(), Transport::Reliable, Instant::now()).unwrap();

        assert_eq!(msg.kind(), "World");
        assert_eq!(msg.method(), "Move");
        assert_eq!(msg.dispatch_key(), "World.Move");
        assert_eq!(msg.sent_at(), sent);
        assert_eq!(msg.arg_count(), 2);
        assert_eq!(msg.arg(1), Some("héllo"));
        assert_eq!(msg.arg(2), None);
        assert_eq!(msg.raw(), text);
        assert_eq!(msg.transport(), Transport::Reliable);
    }

    #[test]
    fn test_format_without_args() {
        let text = format_call::<&str>(MOVE, Timestamp(0), &[]).unwrap();
        let msg = Message::parse(&text, conn(), Transport::Unreliable, Instant::now()).unwrap();
        assert_eq!(msg.arg_count(), 0);
    }

    #[test]
    fn test_reserved_byte_rejected() {
        let err = format_call(MOVE, Timestamp(0), &["ok", "bad\x1efield"]).unwrap_err();
        assert_eq!(err, ProtocolError::ReservedByte(4));

        let bad = HandlerRef::new("Wor\x1fld", "Move");
        assert!(format_call::<&str>(bad, Timestamp(0), &[]).is_err());
    }

    #[test]
    fn test_parse_too_few_fields() {
        let result = Message::parse("World\x1fMove", conn(), Transport::Reliable, Instant::now());
        assert!(matches!(result, Err(ProtocolError::TooFewFields(2))));
    }

    #[test]
    fn test_parse_bad_timestamp() {
        let result = Message::parse(
            "World\x1fMove\x1fzz",
            conn(),
            Transport::Reliable,
            Instant::now(),
        );
        assert!(matches!(result, Err(ProtocolError::BadTimestamp(_))));
    }

    #[test]
    fn test_empty_argument_preserved() {
        let text = format_call(MOVE, Timestamp(9), &["", "x"]).unwrap();
        let msg = Message::parse(&text, conn(), Transport::Reliable, Instant::now()).unwrap();
        assert_eq!(msg.args(), &["".to_string(), "x".to_string()]);
    }
}
