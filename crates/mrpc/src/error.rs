use core::fmt;

use rmpv::Value;
use serde::de::DeserializeOwned;

/// Broad classification of failures, shared by clients and servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An argument given by the caller is invalid.
    InvalidArgument,
    /// An operation was attempted in a state that does not allow it.
    PreconditionNotMet,
    /// A call did not complete within its deadline.
    Timeout,
    /// A connection could not be established or was lost.
    ConnectionFailure,
    /// A host name could not be resolved into endpoints.
    HostUnresolved,
    /// Received bytes do not form a valid MessagePack-RPC message.
    ParseError,
    /// A value could not be projected into the requested type.
    TypeError,
    /// The server answered with an error object.
    ServerError,
    /// The server has no method registered under the requested name.
    MethodNotFound,
    /// The operation was abandoned because its owner is shutting down.
    Aborted,
    /// Anything that does not fit the categories above.
    UnexpectedError,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::PreconditionNotMet => "precondition not met",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ConnectionFailure => "connection failure",
            ErrorKind::HostUnresolved => "host unresolved",
            ErrorKind::ParseError => "parse error",
            ErrorKind::TypeError => "type error",
            ErrorKind::ServerError => "server error",
            ErrorKind::MethodNotFound => "method not found",
            ErrorKind::Aborted => "aborted",
            ErrorKind::UnexpectedError => "unexpected error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type used across the crate: a kind plus a human-readable message,
/// and, for server-reported failures, the opaque error object from the wire.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    server_payload: Option<Value>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            server_payload: None,
        }
    }

    /// An error reported by the server, carrying the error object verbatim.
    pub fn server(payload: Value) -> Self {
        let message = match payload.as_str() {
            Some(text) => text.to_owned(),
            None => payload.to_string(),
        };
        Self {
            kind: ErrorKind::ServerError,
            message,
            server_payload: Some(payload),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The error object sent by the server, if this is a server error.
    pub fn server_payload(&self) -> Option<&Value> {
        self.server_payload.as_ref()
    }

    /// Project the server error object into a concrete type.
    pub fn project_payload<T: DeserializeOwned>(&self) -> Result<T> {
        let payload = self.server_payload.clone().ok_or_else(|| {
            Error::new(
                ErrorKind::PreconditionNotMet,
                "error does not carry a server error object",
            )
        })?;
        rmpv::ext::from_value(payload).map_err(|e| {
            Error::new(
                ErrorKind::TypeError,
                format!("server error object has an unexpected type: {e}"),
            )
        })
    }
}

macro_rules! error_constructors {
    ($($fn_name:ident => $kind:ident,)+) => {
        impl Error {
            $(
                pub(crate) fn $fn_name(message: impl Into<String>) -> Self {
                    Self::new(ErrorKind::$kind, message)
                }
            )+
        }
    };
}

error_constructors! {
    invalid_argument => InvalidArgument,
    precondition_not_met => PreconditionNotMet,
    timeout => Timeout,
    connection_failure => ConnectionFailure,
    host_unresolved => HostUnresolved,
    parse_error => ParseError,
    type_error => TypeError,
    unexpected => UnexpectedError,
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
