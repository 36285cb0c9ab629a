//! Server-side method registry and dispatch.

use core::fmt;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use mrpc_proto::{FromParams, Message, MessageId, MethodName, Params};
use rmpv::Value;
use serde::Serialize;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::executor::{ExecutorHandle, OperationType};

/// Failure signaled by a method handler.
///
/// The payload travels verbatim in the `error` slot of the response, so a
/// handler can ship a structured, serializable error object to the caller.
pub struct MethodError {
    payload: Value,
}

impl MethodError {
    /// A textual error description.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            payload: Value::from(message.into()),
        }
    }

    /// A structured error payload; falls back to a textual description when
    /// the payload itself cannot be serialized.
    pub fn with_payload<T: Serialize>(payload: &T) -> Self {
        match rmpv::ext::to_value(payload) {
            Ok(value) => Self { payload: value },
            Err(e) => Self::new(format!("unserializable error payload: {e}")),
        }
    }

    fn into_payload(self) -> Value {
        self.payload
    }
}

impl fmt::Debug for MethodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodError")
            .field("payload", &self.payload)
            .finish()
    }
}

impl From<&str> for MethodError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for MethodError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

enum MethodFailure {
    /// Parameters did not project into the handler's declared types.
    InvalidArgument(String),
    /// The handler itself failed; the payload goes on the wire.
    Handler(Value),
}

type ArcMethod = Arc<dyn Fn(&Params) -> core::result::Result<Value, MethodFailure> + Send + Sync>;

/// Mapping from method name to a type-erased handler.
///
/// Populated at builder time; immutable once the server runs.
#[derive(Default)]
pub(crate) struct MethodRegistry {
    methods: HashMap<MethodName, ArcMethod>,
}

impl MethodRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler under `name`.
    ///
    /// `P` is the positional parameter tuple, `R` the result type. The
    /// type-erased wrapper projects parameters, invokes the handler and
    /// serializes the result.
    pub(crate) fn insert<P, R, F>(&mut self, name: &str, handler: F) -> Result<()>
    where
        P: FromParams + Send + 'static,
        R: Serialize,
        F: Fn(P) -> core::result::Result<R, MethodError> + Send + Sync + 'static,
    {
        let name = MethodName::new(name);
        if self.methods.contains_key(&name) {
            return Err(Error::precondition_not_met(format!(
                "method `{name}` is already registered"
            )));
        }

        let wrapped: ArcMethod = Arc::new(move |params| {
            let args =
                P::from_params(params).map_err(|e| MethodFailure::InvalidArgument(e.to_string()))?;
            let result = handler(args).map_err(|e| MethodFailure::Handler(e.into_payload()))?;
            rmpv::ext::to_value(&result).map_err(|e| {
                MethodFailure::Handler(Value::from(format!("failed to serialize result: {e}")))
            })
        });
        self.methods.insert(name, wrapped);
        Ok(())
    }

    fn get(&self, name: &MethodName) -> Option<&ArcMethod> {
        self.methods.get(name)
    }
}

/// Dispatches incoming requests and notifications to registered methods.
///
/// Handler invocations run on the callback pool so slow handlers cannot
/// starve transport I/O.
pub(crate) struct MethodProcessor {
    registry: MethodRegistry,
    executor: ExecutorHandle,
}

impl MethodProcessor {
    pub(crate) fn new(registry: MethodRegistry, executor: ExecutorHandle) -> Self {
        Self { registry, executor }
    }

    pub(crate) fn dispatch(&self, message: Message, reply_to: &Arc<Connection>) {
        match message {
            Message::Request { id, method, params } => {
                let Some(handler) = self.registry.get(&method) else {
                    debug!(%method, "Method not found");
                    let reply =
                        Message::error_response(id, Value::from(format!("Method not found: {method}")));
                    send_reply(&Arc::downgrade(reply_to), reply);
                    return;
                };

                let handler = Arc::clone(handler);
                let reply_to = Arc::downgrade(reply_to);
                self.executor
                    .spawn(OperationType::Callback, async move {
                        let reply = run_handler(&handler, id, &method, &params);
                        send_reply(&reply_to, reply);
                        Ok(())
                    })
                    .detach();
            }
            Message::Notification { method, params } => {
                let Some(handler) = self.registry.get(&method) else {
                    debug!(%method, "Method not found for notification");
                    return;
                };

                let handler = Arc::clone(handler);
                self.executor
                    .spawn(OperationType::Callback, async move {
                        match invoke(&handler, &params) {
                            Ok(_) => {}
                            Err(MethodFailure::InvalidArgument(reason)) => {
                                debug!(%method, %reason, "Notification parameters rejected");
                            }
                            Err(MethodFailure::Handler(payload)) => {
                                debug!(%method, %payload, "Notification handler failed");
                            }
                        }
                        Ok(())
                    })
                    .detach();
            }
            Message::Response { id, .. } => {
                warn!(%id, "Server received a response message; dropped");
            }
        }
    }
}

fn run_handler(handler: &ArcMethod, id: MessageId, method: &MethodName, params: &Params) -> Message {
    match invoke(handler, params) {
        Ok(result) => Message::response(id, result),
        Err(MethodFailure::InvalidArgument(reason)) => {
            debug!(%method, %reason, "Request parameters rejected");
            Message::error_response(
                id,
                Value::from(format!("Invalid arguments to {method}: {reason}")),
            )
        }
        Err(MethodFailure::Handler(payload)) => Message::error_response(id, payload),
    }
}

/// Invoke the handler, containing panics so a broken handler cannot take the
/// callback pool down with it.
fn invoke(handler: &ArcMethod, params: &Params) -> core::result::Result<Value, MethodFailure> {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(params)))
        .unwrap_or_else(|_| Err(MethodFailure::Handler(Value::from("method handler panicked"))))
}

fn send_reply(reply_to: &Weak<Connection>, reply: Message) {
    let Some(connection) = reply_to.upgrade() else {
        trace!("Connection is gone; reply dropped");
        return;
    };
    match reply.serialize() {
        Ok(serialized) => {
            if let Err(error) = connection.send(serialized) {
                debug!(%error, "Failed to enqueue reply");
            }
        }
        Err(error) => warn!(%error, "Failed to serialize reply"),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;
    use mrpc_proto::IntoParams as _;

    fn invoke_registered(
        registry: &MethodRegistry,
        name: &str,
        params: Params,
    ) -> core::result::Result<Value, MethodFailure> {
        let handler = registry.get(&MethodName::new(name)).unwrap();
        invoke(handler, &params)
    }

    #[test]
    fn typed_handler_projects_and_serializes() {
        let mut registry = MethodRegistry::new();
        registry
            .insert("add", |(x, y): (i64, i64)| Ok(x + y))
            .unwrap();

        let result =
            invoke_registered(&registry, "add", (2, 3).into_params().unwrap()).unwrap();
        assert_eq!(result, Value::from(5));
    }

    #[test]
    fn projection_failure_is_invalid_argument() {
        let mut registry = MethodRegistry::new();
        registry
            .insert("add", |(x, y): (i64, i64)| Ok(x + y))
            .unwrap();

        let failure =
            invoke_registered(&registry, "add", ("two", "three").into_params().unwrap())
                .unwrap_err();
        assert!(matches!(failure, MethodFailure::InvalidArgument(_)));
    }

    #[test]
    fn handler_error_payload_is_preserved() {
        let mut registry = MethodRegistry::new();
        registry
            .insert("fail", |(): ()| -> core::result::Result<(), MethodError> {
                Err(MethodError::with_payload(&42))
            })
            .unwrap();

        let failure =
            invoke_registered(&registry, "fail", ().into_params().unwrap()).unwrap_err();
        match failure {
            MethodFailure::Handler(payload) => assert_eq!(payload, Value::from(42)),
            MethodFailure::InvalidArgument(reason) => panic!("unexpected: {reason}"),
        }
    }

    #[test]
    fn handler_panic_is_contained() {
        let mut registry = MethodRegistry::new();
        registry
            .insert("boom", |(): ()| -> core::result::Result<(), MethodError> {
                panic!("kaboom")
            })
            .unwrap();

        let failure =
            invoke_registered(&registry, "boom", ().into_params().unwrap()).unwrap_err();
        assert!(matches!(failure, MethodFailure::Handler(_)));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = MethodRegistry::new();
        registry
            .insert("add", |(x, y): (i64, i64)| Ok(x + y))
            .unwrap();

        let err = registry
            .insert("add", |(x, y): (i64, i64)| Ok(x * y))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::PreconditionNotMet);
    }
}
