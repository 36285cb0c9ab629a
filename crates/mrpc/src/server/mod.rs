//! Server endpoint: acceptors, per-connection handlers, dispatch, shutdown.

pub(crate) mod methods;

pub use self::methods::MethodError;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use mrpc_proto::{FromParams, Message};
use parking_lot::Mutex;
use serde::Serialize;

use self::methods::{MethodProcessor, MethodRegistry};
use crate::acceptor::Acceptor;
use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionHandler};
use crate::error::{Error, Result};
use crate::executor::{Executor, ExecutorHandle, OperationType};
use crate::transport::BackendSet;
use crate::uri::Uri;

/// Builder assembling a fully-configured [`Server`].
///
/// ```no_run
/// use mrpc::ServerBuilder;
///
/// let server = ServerBuilder::new()
///     .method("add", |(x, y): (i32, i32)| Ok(x + y))
///     .listen_to("tcp://localhost:7136")
///     .build()?;
/// server.run_until_signal()?;
/// # mrpc::Result::Ok(())
/// ```
#[must_use]
pub struct ServerBuilder {
    config: ServerConfig,
    extra_uris: Vec<String>,
    methods: MethodRegistry,
    executor: Option<Executor>,
    deferred_error: Option<Error>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self::from_config(ServerConfig::default())
    }

    pub fn from_config(config: ServerConfig) -> Self {
        Self {
            config,
            extra_uris: Vec::new(),
            methods: MethodRegistry::new(),
            executor: None,
            deferred_error: None,
        }
    }

    /// Add a URI to listen on; may be called several times.
    pub fn listen_to(mut self, uri: impl Into<String>) -> Self {
        self.extra_uris.push(uri.into());
        self
    }

    pub fn listen_to_tcp(self, host: impl AsRef<str>, port: u16) -> Self {
        self.listen_to(Uri::tcp(host, port).to_string())
    }

    /// Register a method handler.
    ///
    /// `P` is the positional parameter tuple projected from the request,
    /// `R` the serializable result. Registration errors (duplicate names)
    /// surface from [`ServerBuilder::build`].
    pub fn method<P, R, F>(mut self, name: &str, handler: F) -> Self
    where
        P: FromParams + Send + 'static,
        R: Serialize,
        F: Fn(P) -> core::result::Result<R, MethodError> + Send + Sync + 'static,
    {
        if self.deferred_error.is_none() {
            if let Err(error) = self.methods.insert(name, handler) {
                self.deferred_error = Some(error);
            }
        }
        self
    }

    /// Use a pre-built executor instead of spawning dedicated pools.
    pub fn executor(mut self, executor: Executor) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Bind all endpoints and return the server, already processing.
    pub fn build(self) -> Result<Server> {
        if let Some(error) = self.deferred_error {
            return Err(error);
        }

        self.config.validate()?;

        let mut uris = self.config.parsed_uris()?;
        for uri in &self.extra_uris {
            uris.push(Uri::parse(uri)?);
        }
        if uris.is_empty() {
            return Err(Error::invalid_argument(
                "at least one URI to listen on is required",
            ));
        }

        let executor = match self.executor {
            Some(executor) => executor,
            None => Executor::multi_thread(&self.config.executor)?,
        };
        let handle = executor.handle();

        let backends = BackendSet::new(handle.clone(), self.config.message_parser.clone());

        let inner = Arc::new(ServerInner {
            connections: Mutex::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
            processor: MethodProcessor::new(self.methods, handle.clone()),
        });

        // Binding happens on the transport pool so the sockets belong to it.
        let transport = handle.runtime_handle(OperationType::Transport).clone();
        let acceptors = transport.block_on(async {
            let mut acceptors = Vec::new();
            for uri in &uris {
                let backend = backends.find(uri.scheme())?;
                acceptors.extend(backend.bind(uri).await?);
            }
            Ok::<_, Error>(acceptors)
        })?;

        let server = Server {
            state: AtomicU8::new(SERVER_CREATED),
            inner,
            acceptors,
            executor,
            handle,
        };
        server.start()?;

        Ok(server)
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

const SERVER_CREATED: u8 = 0;
const SERVER_RUNNING: u8 = 1;
const SERVER_STOPPED: u8 = 2;

struct ServerInner {
    connections: Mutex<HashMap<u64, Arc<Connection>>>,
    next_connection_id: AtomicU64,
    processor: MethodProcessor,
}

impl ServerInner {
    fn install_connection(self: &Arc<Self>, connection: Arc<Connection>) {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);

        let handler = Arc::new(ServerConnectionHandler {
            inner: Arc::downgrade(self),
            connection: Arc::downgrade(&connection),
            id,
        });

        self.connections
            .lock()
            .insert(id, Arc::clone(&connection));

        if let Err(error) = connection.start(handler) {
            warn!(%error, "Failed to start accepted connection");
            self.connections.lock().remove(&id);
        }
    }
}

/// Feeds one connection's messages into the processor and deregisters the
/// connection when it closes.
struct ServerConnectionHandler {
    inner: Weak<ServerInner>,
    connection: Weak<Connection>,
    id: u64,
}

impl ConnectionHandler for ServerConnectionHandler {
    fn on_received(&self, message: Message) {
        let (Some(inner), Some(connection)) = (self.inner.upgrade(), self.connection.upgrade())
        else {
            return;
        };
        inner.processor.dispatch(message, &connection);
    }

    fn on_closed(&self, _status: Result<()>) {
        if let Some(inner) = self.inner.upgrade() {
            inner.connections.lock().remove(&self.id);
        }
    }
}

/// A MessagePack-RPC server.
///
/// Owns its acceptors and executor; stopped on drop.
pub struct Server {
    state: AtomicU8,
    inner: Arc<ServerInner>,
    acceptors: Vec<Arc<Acceptor>>,
    executor: Executor,
    handle: ExecutorHandle,
}

impl Server {
    /// The bound endpoint URIs; OS-assigned ports are resolved.
    pub fn local_uris(&self) -> Vec<Uri> {
        self.acceptors
            .iter()
            .map(|a| a.local_uri().clone())
            .collect()
    }

    /// One-time transition into accepting connections.
    fn start(&self) -> Result<()> {
        if self
            .state
            .compare_exchange(
                SERVER_CREATED,
                SERVER_RUNNING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(Error::precondition_not_met("this server is already started"));
        }

        for acceptor in &self.acceptors {
            let inner = Arc::downgrade(&self.inner);
            acceptor.start(move |connection| {
                let Some(inner) = inner.upgrade() else { return };
                inner.install_connection(connection);
            })?;
        }

        info!(uris = ?self.local_uris().iter().map(ToString::to_string).collect::<Vec<_>>(), "Server started");

        Ok(())
    }

    /// Block the calling thread until SIGINT/SIGTERM or a fatal executor
    /// failure, then stop the server. The fatal failure, if any, is
    /// returned.
    pub fn run_until_signal(&self) -> Result<()> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .map_err(|e| Error::unexpected(format!("failed to build the signal runtime: {e}")))?;

        let handle = self.handle.clone();
        let fatal = rt.block_on(async {
            tokio::select! {
                fatal = handle.stop_triggered() => fatal,
                result = wait_for_signals() => {
                    if let Err(error) = result {
                        warn!(%error, "Failed to wait for signals");
                    }
                    None
                }
            }
        });

        self.stop();

        match fatal {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Stop accepting, tear down live connections, shut the executor down.
    /// Idempotent; also runs on drop.
    pub fn stop(&self) {
        if self.state.swap(SERVER_STOPPED, Ordering::AcqRel) == SERVER_STOPPED {
            return;
        }

        info!("Stopping server");

        // No new connections first, then the in-flight ones.
        for acceptor in &self.acceptors {
            acceptor.stop();
        }

        let connections: Vec<Arc<Connection>> = {
            let mut connections = self.inner.connections.lock();
            connections.drain().map(|(_, c)| c).collect()
        };
        for connection in connections {
            connection.async_close();
        }

        self.executor.stop();
    }

    /// The first fatal task failure observed by the executor, if any.
    pub fn last_error(&self) -> Option<Error> {
        self.executor.last_error()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(unix)]
async fn wait_for_signals() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = terminate.recv() => {}
        _ = interrupt.recv() => {}
    }

    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signals() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
