//! MessagePack-RPC wire messages.
//!
//! Every message is a MessagePack array tagged by its first element:
//! `[0, id, method, params]` for requests, `[1, id, error, result]` for
//! responses and `[2, method, params]` for notifications.

use core::fmt;
use std::io::Cursor;

use bytes::{Buf as _, Bytes, BytesMut};
use rmpv::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;
use smol_str::SmolStr;

/// Identifier correlating a request with its response.
///
/// Chosen by the client; unique among the calls outstanding on a connection.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub struct MessageId(u32);

impl From<u32> for MessageId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl From<MessageId> for u32 {
    fn from(id: MessageId) -> Self {
        id.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a remote method, always encoded as a MessagePack string (UTF-8).
#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub struct MethodName(SmolStr);

impl MethodName {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(SmolStr::new(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MethodName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl fmt::Display for MethodName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Positional method parameters.
///
/// Always encoded as a MessagePack array, even for a single parameter; an
/// empty parameter list encodes as an empty array. Elements are kept as
/// opaque [`Value`]s so the receiver can project them into its own parameter
/// types later.
#[derive(Debug, Default, PartialEq, Clone)]
pub struct Params(Vec<Value>);

impl Params {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn into_values(self) -> Vec<Value> {
        self.0
    }
}

/// Conversion of Rust argument tuples into [`Params`].
///
/// Implemented for tuples of up to eight serializable elements; the tuple
/// shape is what guarantees the "params is always an array" wire invariant.
pub trait IntoParams {
    fn into_params(self) -> Result<Params, EncodeError>;
}

impl IntoParams for Params {
    fn into_params(self) -> Result<Params, EncodeError> {
        Ok(self)
    }
}

impl IntoParams for () {
    fn into_params(self) -> Result<Params, EncodeError> {
        Ok(Params::empty())
    }
}

macro_rules! impl_into_params {
    ($($name:ident : $idx:tt),+) => {
        impl<$($name: Serialize),+> IntoParams for ($($name,)+) {
            fn into_params(self) -> Result<Params, EncodeError> {
                Ok(Params(vec![$(
                    rmpv::ext::to_value(&self.$idx).map_err(|e| EncodeError::Params {
                        index: $idx,
                        reason: e.to_string(),
                    })?,
                )+]))
            }
        }
    };
}

impl_into_params!(A: 0);
impl_into_params!(A: 0, B: 1);
impl_into_params!(A: 0, B: 1, C: 2);
impl_into_params!(A: 0, B: 1, C: 2, D: 3);
impl_into_params!(A: 0, B: 1, C: 2, D: 3, E: 4);
impl_into_params!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);
impl_into_params!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6);
impl_into_params!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7);

/// Projection of received [`Params`] into a Rust argument tuple.
pub trait FromParams: Sized {
    fn from_params(params: &Params) -> Result<Self, ParamsError>;
}

impl FromParams for Params {
    fn from_params(params: &Params) -> Result<Self, ParamsError> {
        Ok(params.clone())
    }
}

impl FromParams for () {
    fn from_params(params: &Params) -> Result<Self, ParamsError> {
        if !params.is_empty() {
            return Err(ParamsError::WrongArity {
                expected: 0,
                actual: params.len(),
            });
        }
        Ok(())
    }
}

macro_rules! impl_from_params {
    ($count:expr; $($name:ident : $idx:tt),+) => {
        impl<$($name: DeserializeOwned),+> FromParams for ($($name,)+) {
            fn from_params(params: &Params) -> Result<Self, ParamsError> {
                if params.len() != $count {
                    return Err(ParamsError::WrongArity {
                        expected: $count,
                        actual: params.len(),
                    });
                }
                Ok(($(
                    rmpv::ext::from_value(params.0[$idx].clone()).map_err(|e| {
                        ParamsError::Type {
                            index: $idx,
                            reason: e.to_string(),
                        }
                    })?,
                )+))
            }
        }
    };
}

impl_from_params!(1; A: 0);
impl_from_params!(2; A: 0, B: 1);
impl_from_params!(3; A: 0, B: 1, C: 2);
impl_from_params!(4; A: 0, B: 1, C: 2, D: 3);
impl_from_params!(5; A: 0, B: 1, C: 2, D: 3, E: 4);
impl_from_params!(6; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);
impl_from_params!(7; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6);
impl_from_params!(8; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7);

/// A complete MessagePack-RPC message.
#[derive(Debug, PartialEq, Clone)]
pub enum Message {
    Request {
        id: MessageId,
        method: MethodName,
        params: Params,
    },
    /// Exactly one of `error` / `result` is non-nil in a well-behaved peer.
    Response {
        id: MessageId,
        error: Value,
        result: Value,
    },
    Notification {
        method: MethodName,
        params: Params,
    },
}

const REQUEST_TAG: u64 = 0;
const RESPONSE_TAG: u64 = 1;
const NOTIFICATION_TAG: u64 = 2;

impl Message {
    pub fn request(id: MessageId, method: impl Into<MethodName>, params: Params) -> Self {
        Self::Request {
            id,
            method: method.into(),
            params,
        }
    }

    pub fn response(id: MessageId, result: Value) -> Self {
        Self::Response {
            id,
            error: Value::Nil,
            result,
        }
    }

    pub fn error_response(id: MessageId, error: Value) -> Self {
        Self::Response {
            id,
            error,
            result: Value::Nil,
        }
    }

    pub fn notification(method: impl Into<MethodName>, params: Params) -> Self {
        Self::Notification {
            method: method.into(),
            params,
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Message::Request { id, method, params } => Value::Array(vec![
                Value::from(REQUEST_TAG),
                Value::from(id.0),
                Value::from(method.as_str()),
                Value::Array(params.0.clone()),
            ]),
            Message::Response { id, error, result } => Value::Array(vec![
                Value::from(RESPONSE_TAG),
                Value::from(id.0),
                error.clone(),
                result.clone(),
            ]),
            Message::Notification { method, params } => Value::Array(vec![
                Value::from(NOTIFICATION_TAG),
                Value::from(method.as_str()),
                Value::Array(params.0.clone()),
            ]),
        }
    }

    /// Encode into a self-contained byte buffer.
    pub fn serialize(&self) -> Result<SerializedMessage, EncodeError> {
        let mut bytes = Vec::with_capacity(64);
        rmpv::encode::write_value(&mut bytes, &self.to_value())?;
        Ok(SerializedMessage {
            bytes: Bytes::from(bytes),
        })
    }

    /// Decode one message from a buffer holding exactly one complete message.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = BytesMut::from(bytes);
        match Self::decode_from(&mut buf)? {
            Some(message) if buf.is_empty() => Ok(message),
            Some(_) => Err(DecodeError::Malformed {
                reason: "trailing bytes after message".to_owned(),
            }),
            None => Err(DecodeError::Malformed {
                reason: "incomplete message".to_owned(),
            }),
        }
    }

    /// Decode the next complete message out of `buf`, consuming exactly its
    /// bytes. Returns `Ok(None)` when the buffer holds only a partial
    /// message.
    pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Self>, DecodeError> {
        if buf.is_empty() {
            return Ok(None);
        }

        let mut cursor = Cursor::new(&buf[..]);
        let value = match rmpv::decode::read_value(&mut cursor) {
            Ok(value) => value,
            Err(e) if is_truncated(&e) => return Ok(None),
            Err(e) => {
                return Err(DecodeError::Malformed {
                    reason: e.to_string(),
                })
            }
        };

        // `read_value` only consumed the cursor; mirror that on the buffer.
        let consumed = usize::try_from(cursor.position()).map_err(|_| DecodeError::Malformed {
            reason: "message too large".to_owned(),
        })?;
        buf.advance(consumed);

        Self::from_value(value).map(Some)
    }

    fn from_value(value: Value) -> Result<Self, DecodeError> {
        let Value::Array(items) = value else {
            return Err(DecodeError::NotAnArray);
        };

        let arity = items.len();

        let tag = items
            .first()
            .ok_or(DecodeError::NotAnArray)?
            .as_u64()
            .ok_or(DecodeError::InvalidField {
                kind: "message",
                field: "type",
                reason: "not an integer",
            })?;

        let mut items = items.into_iter().skip(1);

        match tag {
            REQUEST_TAG => {
                ensure_arity("request", 4, arity)?;
                let id = decode_id("request", items.next())?;
                let method = decode_method("request", items.next())?;
                let params = decode_params("request", items.next())?;
                Ok(Message::Request { id, method, params })
            }
            RESPONSE_TAG => {
                ensure_arity("response", 4, arity)?;
                let id = decode_id("response", items.next())?;
                let error = items.next().unwrap_or(Value::Nil);
                let result = items.next().unwrap_or(Value::Nil);
                Ok(Message::Response { id, error, result })
            }
            NOTIFICATION_TAG => {
                ensure_arity("notification", 3, arity)?;
                let method = decode_method("notification", items.next())?;
                let params = decode_params("notification", items.next())?;
                Ok(Message::Notification { method, params })
            }
            tag => Err(DecodeError::UnknownTag { tag }),
        }
    }
}

fn ensure_arity(kind: &'static str, expected: usize, actual: usize) -> Result<(), DecodeError> {
    if expected != actual {
        return Err(DecodeError::WrongArity {
            kind,
            expected,
            actual,
        });
    }
    Ok(())
}

fn decode_id(kind: &'static str, value: Option<Value>) -> Result<MessageId, DecodeError> {
    let invalid = |reason| DecodeError::InvalidField {
        kind,
        field: "id",
        reason,
    };
    let id = value
        .and_then(|v| v.as_u64())
        .ok_or_else(|| invalid("not an integer"))?;
    let id = u32::try_from(id).map_err(|_| invalid("out of range for u32"))?;
    Ok(MessageId(id))
}

fn decode_method(kind: &'static str, value: Option<Value>) -> Result<MethodName, DecodeError> {
    let invalid = |reason| DecodeError::InvalidField {
        kind,
        field: "method",
        reason,
    };
    match value {
        Some(Value::String(s)) => {
            let name = s.into_str().ok_or_else(|| invalid("not valid UTF-8"))?;
            Ok(MethodName::new(name))
        }
        _ => Err(invalid("not a string")),
    }
}

fn decode_params(kind: &'static str, value: Option<Value>) -> Result<Params, DecodeError> {
    match value {
        Some(Value::Array(values)) => Ok(Params(values)),
        _ => Err(DecodeError::InvalidField {
            kind,
            field: "params",
            reason: "not an array",
        }),
    }
}

fn is_truncated(e: &rmpv::decode::Error) -> bool {
    match e {
        rmpv::decode::Error::InvalidMarkerRead(e) | rmpv::decode::Error::InvalidDataRead(e) => {
            e.kind() == std::io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

/// An owned buffer holding one complete, already-encoded message.
///
/// Opaque downstream of serialization; the transport writes it verbatim.
#[derive(Clone, PartialEq, Eq)]
pub struct SerializedMessage {
    bytes: Bytes,
}

impl SerializedMessage {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

// Payload contents are not worth printing in logs.
impl fmt::Debug for SerializedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializedMessage")
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Incremental parser over an arbitrary chunking of a message stream.
///
/// Feed bytes as they arrive, then drain complete messages with
/// [`MessageParser::try_next`]. The internal buffer is unbounded; the
/// transport governs how much is read per chunk.
#[derive(Debug, Default)]
pub struct MessageParser {
    buf: BytesMut,
}

impl MessageParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk of received bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decode the next complete message, or `Ok(None)` when more bytes are
    /// required.
    ///
    /// A decode error is not recoverable: the stream position is undefined
    /// afterwards and the connection must be torn down.
    pub fn try_next(&mut self) -> Result<Option<Message>, DecodeError> {
        Message::decode_from(&mut self.buf)
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EncodeError {
    #[error("failed to write message: {0}")]
    Write(#[from] rmpv::encode::Error),
    #[error("parameter {index} is not serializable: {reason}")]
    Params { index: usize, reason: String },
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DecodeError {
    #[error("message is not a MessagePack-RPC array")]
    NotAnArray,
    #[error("unknown message type tag {tag}")]
    UnknownTag { tag: u64 },
    #[error("wrong number of elements for {kind} message: expected {expected}, got {actual}")]
    WrongArity {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("invalid `{field}` in {kind} message: {reason}")]
    InvalidField {
        kind: &'static str,
        field: &'static str,
        reason: &'static str,
    },
    #[error("malformed MessagePack data: {reason}")]
    Malformed { reason: String },
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ParamsError {
    #[error("wrong number of parameters: expected {expected}, got {actual}")]
    WrongArity { expected: usize, actual: usize },
    #[error("parameter {index} has an unexpected type: {reason}")]
    Type { index: usize, reason: String },
}
