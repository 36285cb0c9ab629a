//! Listener owning a bound socket and emitting accepted connections.

use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::watch;

use crate::config::MessageParserConfig;
use crate::connection::{BoxedReader, BoxedWriter, Connection};
use crate::error::{Error, Result};
use crate::executor::{ChildTask, ExecutorHandle, OperationType};
use crate::uri::Uri;

const STATE_INIT: u8 = 0;
const STATE_STARTING: u8 = 1;
const STATE_PROCESSING: u8 = 2;
const STATE_STOPPED: u8 = 3;

pub(crate) enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix { listener: UnixListener, uri: Uri },
}

impl Listener {
    async fn accept(&self) -> io::Result<(BoxedReader, BoxedWriter, Uri)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer_addr) = listener.accept().await?;
                if let Err(error) = stream.set_nodelay(true) {
                    warn!(%error, "set_nodelay on TcpStream failed");
                }
                let (reader, writer) = stream.into_split();
                let peer_uri = Uri::tcp(peer_addr.ip().to_string(), peer_addr.port());
                Ok((Box::new(reader), Box::new(writer), peer_uri))
            }
            #[cfg(unix)]
            Listener::Unix { listener, uri } => {
                let (stream, _peer_addr) = listener.accept().await?;
                let (reader, writer) = stream.into_split();
                // Connecting unix peers are unnamed; report the bound path.
                Ok((Box::new(reader), Box::new(writer), uri.clone()))
            }
        }
    }
}

/// Accepts connections on one bound endpoint.
///
/// State machine: `Init → Starting → Processing → Stopped`; `Starting` is a
/// transient state guarded by compare-and-swap so exactly one caller
/// performs the first-time setup.
pub struct Acceptor {
    state: AtomicU8,
    local_uri: Uri,
    listener: Mutex<Option<Listener>>,
    stop_requested: watch::Sender<bool>,
    parser_config: MessageParserConfig,
    executor: ExecutorHandle,
    task: Mutex<Option<ChildTask<()>>>,
}

impl Acceptor {
    pub(crate) fn new(
        listener: Listener,
        local_uri: Uri,
        parser_config: MessageParserConfig,
        executor: ExecutorHandle,
    ) -> Arc<Self> {
        let (stop_requested, _) = watch::channel(false);
        Arc::new(Self {
            state: AtomicU8::new(STATE_INIT),
            local_uri,
            listener: Mutex::new(Some(listener)),
            stop_requested,
            parser_config,
            executor,
            task: Mutex::new(None),
        })
    }

    /// The bound endpoint; OS-assigned ports are already resolved here.
    pub fn local_uri(&self) -> &Uri {
        &self.local_uri
    }

    /// Begin accepting; may be called at most once.
    ///
    /// A fresh [`Connection`] is created per accepted socket and ownership is
    /// passed to `on_accept`.
    pub fn start(
        self: &Arc<Self>,
        on_accept: impl Fn(Arc<Connection>) + Send + Sync + 'static,
    ) -> Result<()> {
        if self
            .state
            .compare_exchange(
                STATE_INIT,
                STATE_STARTING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(Error::precondition_not_met(
                "this acceptor is already started",
            ));
        }

        let listener = self
            .listener
            .lock()
            .take()
            .ok_or_else(|| Error::unexpected("acceptor listener already taken"))?;

        let task = self.executor.spawn(
            OperationType::Transport,
            accept_task(
                Arc::downgrade(self),
                listener,
                Box::new(on_accept),
                self.stop_requested.subscribe(),
            ),
        );
        *self.task.lock() = Some(task);

        self.state.store(STATE_PROCESSING, Ordering::Release);

        debug!(uri = %self.local_uri, "Acceptor started");

        Ok(())
    }

    /// Cancel the pending accept and close the listener; idempotent and safe
    /// from any thread, including from within `on_accept`.
    pub fn stop(&self) {
        if self.state.swap(STATE_STOPPED, Ordering::AcqRel) == STATE_STOPPED {
            return;
        }
        let _ = self.stop_requested.send(true);
        debug!(uri = %self.local_uri, "Acceptor stopped");
    }

    fn is_processing(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_PROCESSING
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_task(
    acceptor: Weak<Acceptor>,
    listener: Listener,
    on_accept: Box<dyn Fn(Arc<Connection>) + Send + Sync>,
    mut stop_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = stop_rx.changed() => return Ok(()),
            accepted = listener.accept() => {
                match accepted {
                    Ok((reader, writer, peer_uri)) => {
                        let Some(acceptor) = acceptor.upgrade() else { return Ok(()) };

                        trace!(peer = %peer_uri, listener = %acceptor.local_uri, "Accepted a connection");

                        let connection = Connection::new(
                            reader,
                            writer,
                            acceptor.local_uri.clone(),
                            peer_uri,
                            acceptor.parser_config.clone(),
                            acceptor.executor.clone(),
                        );
                        on_accept(connection);

                        // `stop` may have been called from within `on_accept`.
                        if !acceptor.is_processing() {
                            return Ok(());
                        }
                    }
                    Err(error) => {
                        error!(%error, "Failed to accept connection");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;
    use crate::executor::Executor;
    use crate::transport::tcp::TcpBackend;
    use crate::transport::Backend as _;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    fn bind_local(executor: &Executor) -> Arc<Acceptor> {
        let handle = executor.handle();
        let backend = TcpBackend::new(handle.clone(), MessageParserConfig::default());
        let rt = handle.runtime_handle(OperationType::Transport).clone();
        let mut acceptors = rt
            .block_on(backend.bind(&Uri::tcp("127.0.0.1", 0)))
            .unwrap();
        acceptors.remove(0)
    }

    fn dial(acceptor: &Acceptor) -> std::net::TcpStream {
        let port = acceptor.local_uri().port().unwrap();
        std::net::TcpStream::connect(("127.0.0.1", port)).unwrap()
    }

    #[test]
    fn accepted_connections_are_handed_over() {
        let executor = Executor::single_thread().unwrap();
        let acceptor = bind_local(&executor);

        let (tx, rx) = std_mpsc::channel();
        acceptor
            .start(move |connection| {
                let _ = tx.send(connection);
            })
            .unwrap();

        let _first = dial(&acceptor);
        let _second = dial(&acceptor);

        for _ in 0..2 {
            let connection = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(connection.local_uri(), acceptor.local_uri());
        }
    }

    #[test]
    fn start_twice_fails_with_precondition() {
        let executor = Executor::single_thread().unwrap();
        let acceptor = bind_local(&executor);

        acceptor.start(|_connection| {}).unwrap();
        let err = acceptor.start(|_connection| {}).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::PreconditionNotMet);
    }

    #[test]
    fn stop_is_idempotent_and_cancels_accepting() {
        let executor = Executor::single_thread().unwrap();
        let acceptor = bind_local(&executor);

        let (tx, rx) = std_mpsc::channel();
        acceptor
            .start(move |connection| {
                let _ = tx.send(connection);
            })
            .unwrap();

        acceptor.stop();
        acceptor.stop();

        // The listener is closed once the accept task winds down, so new
        // connections are not handed over anymore.
        std::thread::sleep(Duration::from_millis(100));
        let _ = std::net::TcpStream::connect((
            "127.0.0.1",
            acceptor.local_uri().port().unwrap(),
        ));
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn stop_can_be_called_from_within_on_accept() {
        let executor = Executor::single_thread().unwrap();
        let acceptor = bind_local(&executor);

        let (tx, rx) = std_mpsc::channel();
        let self_stopping = Arc::clone(&acceptor);
        acceptor
            .start(move |connection| {
                self_stopping.stop();
                let _ = tx.send(connection);
            })
            .unwrap();

        let _first = dial(&acceptor);
        let _accepted = rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // A later connection attempt is no longer handed over.
        std::thread::sleep(Duration::from_millis(100));
        let _ = std::net::TcpStream::connect((
            "127.0.0.1",
            acceptor.local_uri().port().unwrap(),
        ));
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }
}
