//! Client endpoint: typed calls and notifications over a reconnecting
//! connection.

pub(crate) mod connector;
pub(crate) mod registry;

pub use self::registry::CallFuture;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mrpc_proto::{IntoParams, Message};
use serde::de::DeserializeOwned;
use tokio::sync::watch;

use self::connector::ClientConnector;
use self::registry::CallRegistry;
use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::{Error, ErrorKind, Result};
use crate::executor::{ChildTask, Executor, OperationType, ShutdownHandle};
use crate::transport::BackendSet;
use crate::uri::Uri;

/// Builder assembling a fully-configured [`Client`].
///
/// ```no_run
/// use mrpc::ClientBuilder;
///
/// let client = ClientBuilder::new()
///     .connect_to("tcp://localhost:7136")
///     .build()?;
/// let sum: i32 = client.call("add", (2, 3))?;
/// # mrpc::Result::Ok(())
/// ```
#[must_use]
pub struct ClientBuilder {
    config: ClientConfig,
    executor: Option<Executor>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            executor: None,
        }
    }

    pub fn from_config(config: ClientConfig) -> Self {
        Self {
            config,
            executor: None,
        }
    }

    /// Add a candidate server URI; candidates are tried in the given order.
    pub fn connect_to(mut self, uri: impl Into<String>) -> Self {
        self.config.uris.push(uri.into());
        self
    }

    pub fn connect_to_tcp(self, host: impl AsRef<str>, port: u16) -> Self {
        self.connect_to(Uri::tcp(host, port).to_string())
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout_sec = timeout.as_secs_f64();
        self
    }

    /// Use a pre-built executor instead of spawning dedicated pools, e.g.
    /// [`Executor::single_thread`] for tests or embedded clients.
    pub fn executor(mut self, executor: Executor) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Validate the configuration, start the executor and the reconnect
    /// loop, and hand out the client.
    pub fn build(self) -> Result<Client> {
        self.config.validate()?;

        let uris = self.config.parsed_uris()?;
        if uris.is_empty() {
            return Err(Error::invalid_argument(
                "at least one server URI is required",
            ));
        }

        let executor = match self.executor {
            Some(executor) => executor,
            None => Executor::multi_thread(&self.config.executor)?,
        };
        let handle = executor.handle();

        let registry = CallRegistry::new(handle.clone(), self.config.call_timeout());
        let backends = BackendSet::new(handle.clone(), self.config.message_parser.clone());

        let (current_tx, current_rx) = watch::channel(None);
        let (shutdown, shutdown_signal) = ShutdownHandle::new();

        let connector = ClientConnector::new(
            backends,
            uris,
            self.config.reconnection.clone(),
            Arc::clone(&registry),
            current_tx,
        );
        let connector_task =
            handle.spawn(OperationType::Transport, connector.run(shutdown_signal));

        Ok(Client {
            registry,
            current_rx,
            shutdown,
            executor,
            _connector_task: connector_task,
            stopped: AtomicBool::new(false),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A MessagePack-RPC client.
///
/// Stopped on drop; outstanding calls are then drained with `Aborted`.
pub struct Client {
    registry: Arc<CallRegistry>,
    current_rx: watch::Receiver<Option<Arc<Connection>>>,
    shutdown: ShutdownHandle,
    executor: Executor,
    _connector_task: ChildTask<()>,
    stopped: AtomicBool,
}

impl Client {
    /// Call a remote method and block until its result arrives, bounded by
    /// the configured call timeout.
    pub fn call<R: DeserializeOwned>(&self, method: &str, params: impl IntoParams) -> Result<R> {
        self.async_call(method, params).get_result()
    }

    /// Start a remote call without waiting; the returned future is the
    /// single-shot handle to its completion.
    ///
    /// Failures to even issue the call (no live connection, unserializable
    /// parameters) surface through the returned future.
    pub fn async_call<R: DeserializeOwned>(
        &self,
        method: &str,
        params: impl IntoParams,
    ) -> CallFuture<R> {
        let timeout = self.registry.call_timeout();

        let Some(connection) = self.current_connection() else {
            return CallFuture::failed(
                Error::connection_failure("not connected to a server"),
                timeout,
            );
        };

        let params = match params.into_params() {
            Ok(params) => params,
            Err(e) => {
                return CallFuture::failed(
                    Error::invalid_argument(format!("failed to serialize parameters: {e}")),
                    timeout,
                )
            }
        };

        let (id, slot) = match self.registry.register() {
            Ok(registered) => registered,
            Err(error) => return CallFuture::failed(error, timeout),
        };

        let serialized = match Message::request(id, method, params).serialize() {
            Ok(serialized) => serialized,
            Err(e) => {
                self.registry.cancel(id);
                return CallFuture::failed(
                    Error::invalid_argument(format!("failed to serialize request: {e}")),
                    timeout,
                );
            }
        };

        trace!(%id, method, "Sending request");

        if let Err(error) = connection.send(serialized) {
            self.registry.cancel(id);
            return CallFuture::failed(error, timeout);
        }

        CallFuture::new(id, slot, &self.registry, timeout)
    }

    /// Send a notification: no id, no response, best-effort delivery.
    ///
    /// Fails when disconnected or when the parameters cannot be serialized;
    /// transport failures after enqueueing are only trace-logged.
    pub fn notify(&self, method: &str, params: impl IntoParams) -> Result<()> {
        let Some(connection) = self.current_connection() else {
            return Err(Error::connection_failure("not connected to a server"));
        };

        let params = params
            .into_params()
            .map_err(|e| Error::invalid_argument(format!("failed to serialize parameters: {e}")))?;

        let serialized = Message::notification(method, params)
            .serialize()
            .map_err(|e| Error::invalid_argument(format!("failed to serialize notification: {e}")))?;

        trace!(method, "Sending notification");

        if let Err(error) = connection.send(serialized) {
            trace!(%error, method, "Notification dropped");
        }
        Ok(())
    }

    /// Whether a live connection is currently installed.
    pub fn is_connected(&self) -> bool {
        self.current_rx.borrow().is_some()
    }

    /// Block until the reconnect loop has a live connection installed.
    pub fn wait_until_connected(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while !self.is_connected() {
            if Instant::now() >= deadline {
                return Err(Error::timeout("no connection was established in time"));
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }

    /// Orderly shutdown: stop reconnecting, close the connection, drain the
    /// registry with `Aborted` and release the pools. Idempotent; also runs
    /// on drop.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        debug!("Stopping client");

        self.shutdown.signal();
        if let Some(connection) = self.current_connection() {
            connection.async_close();
        }
        self.registry
            .drain_all(ErrorKind::Aborted, "client is stopping");
        self.executor.stop();
    }

    fn current_connection(&self) -> Option<Arc<Connection>> {
        self.current_rx.borrow().clone()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.stop();
    }
}
