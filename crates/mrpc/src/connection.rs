//! One bidirectional framed channel atop a single stream socket.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use futures_util::{SinkExt as _, StreamExt as _};
use mrpc_proto::{Message, SerializedMessage};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::codec::{self, RpcCodec};
use crate::config::MessageParserConfig;
use crate::error::{Error, Result};
use crate::executor::{ChildTask, ExecutorHandle, OperationType};
use crate::uri::Uri;

pub(crate) type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Callbacks observing one connection.
///
/// `on_received` and `on_sent` run on the transport pool and must not block;
/// hand heavy work off to the callback pool. `on_closed` is invoked exactly
/// once with the terminating status: `Ok` for a clean shutdown (local close
/// or peer EOF), an error for parser or I/O failures.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn on_received(&self, message: Message);

    fn on_sent(&self) {}

    fn on_closed(&self, status: Result<()>);
}

const STATE_INIT: u8 = 0;
const STATE_PROCESSING: u8 = 1;
const STATE_CLOSING: u8 = 2;
const STATE_CLOSED: u8 = 3;

struct Io {
    reader: BoxedReader,
    writer: BoxedWriter,
    msg_rx: mpsc::UnboundedReceiver<SerializedMessage>,
}

/// A connection over one stream socket.
///
/// State machine: `Init → Processing → Closing → Closed`, transitions are
/// one-way. The read loop and the write queue are tasks on the transport
/// pool holding weak back-references, so dropping the connection aborts
/// them.
pub struct Connection {
    state: AtomicU8,
    msg_tx: mpsc::UnboundedSender<SerializedMessage>,
    close_requested: watch::Sender<bool>,
    local_uri: Uri,
    peer_uri: Uri,
    parser_config: MessageParserConfig,
    executor: ExecutorHandle,
    io: Mutex<Option<Io>>,
    handler: Mutex<Option<Arc<dyn ConnectionHandler>>>,
    tasks: Mutex<Vec<ChildTask<()>>>,
}

impl Connection {
    pub(crate) fn new(
        reader: BoxedReader,
        writer: BoxedWriter,
        local_uri: Uri,
        peer_uri: Uri,
        parser_config: MessageParserConfig,
        executor: ExecutorHandle,
    ) -> Arc<Self> {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (close_requested, _) = watch::channel(false);

        Arc::new(Self {
            state: AtomicU8::new(STATE_INIT),
            msg_tx,
            close_requested,
            local_uri,
            peer_uri,
            parser_config,
            executor,
            io: Mutex::new(Some(Io {
                reader,
                writer,
                msg_rx,
            })),
            handler: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn local_uri(&self) -> &Uri {
        &self.local_uri
    }

    pub fn peer_uri(&self) -> &Uri {
        &self.peer_uri
    }

    /// Begin processing; may be called at most once.
    pub fn start(self: &Arc<Self>, handler: Arc<dyn ConnectionHandler>) -> Result<()> {
        if self
            .state
            .compare_exchange(
                STATE_INIT,
                STATE_PROCESSING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(Error::precondition_not_met(
                "this connection is already started",
            ));
        }

        let io = self
            .io
            .lock()
            .take()
            .ok_or_else(|| Error::unexpected("connection I/O already taken"))?;

        *self.handler.lock() = Some(handler);

        let read_buffer_size = self.parser_config.read_buffer_size;

        let receiver = self.executor.spawn(
            OperationType::Transport,
            receiver_task(
                Arc::downgrade(self),
                io.reader,
                read_buffer_size,
                self.close_requested.subscribe(),
            ),
        );
        let sender = self.executor.spawn(
            OperationType::Transport,
            sender_task(
                Arc::downgrade(self),
                io.writer,
                io.msg_rx,
                read_buffer_size,
                self.close_requested.subscribe(),
            ),
        );

        let mut tasks = self.tasks.lock();
        tasks.push(receiver);
        tasks.push(sender);

        Ok(())
    }

    /// Enqueue an already-serialized message.
    ///
    /// Returns immediately; bytes reach the wire in enqueue order per
    /// producer and each message is written atomically.
    pub fn send(&self, message: SerializedMessage) -> Result<()> {
        if self.state.load(Ordering::Acquire) != STATE_PROCESSING {
            return Err(Error::connection_failure("connection is not processing"));
        }
        self.msg_tx
            .send(message)
            .map_err(|_| Error::connection_failure("connection is closed"))
    }

    /// Request an orderly close; idempotent.
    ///
    /// No new sends are accepted, queued writes are drained best-effort, the
    /// read loop is canceled and `on_closed` fires exactly once.
    pub fn async_close(&self) {
        if self
            .state
            .compare_exchange(
                STATE_INIT,
                STATE_CLOSED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            // Never started: just release the socket.
            *self.io.lock() = None;
            return;
        }

        let _ = self.state.compare_exchange(
            STATE_PROCESSING,
            STATE_CLOSING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let _ = self.close_requested.send(true);
    }

    fn handler(&self) -> Option<Arc<dyn ConnectionHandler>> {
        self.handler.lock().clone()
    }

    /// Final transition into `Closed`; every path funnels through here so
    /// `on_closed` fires exactly once.
    fn complete_close(&self, status: Result<()>) {
        if self.state.swap(STATE_CLOSED, Ordering::AcqRel) == STATE_CLOSED {
            return;
        }
        let _ = self.close_requested.send(true);

        let handler = self.handler.lock().take();
        if let Some(handler) = handler {
            match &status {
                Ok(()) => debug!(peer = %self.peer_uri, "Connection closed"),
                Err(error) => debug!(peer = %self.peer_uri, %error, "Connection closed"),
            }
            handler.on_closed(status);
        }
    }
}

async fn receiver_task(
    conn: Weak<Connection>,
    reader: BoxedReader,
    read_buffer_size: usize,
    mut close_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut stream = FramedRead::with_capacity(
        reader,
        RpcCodec::new(read_buffer_size),
        read_buffer_size,
    );

    loop {
        tokio::select! {
            _ = close_rx.changed() => {
                // Local close; the sender task finishes the transition.
                return Ok(());
            }
            next = stream.next() => {
                match next {
                    Some(Ok(message)) => {
                        trace!(?message, "Received message");
                        let Some(conn) = conn.upgrade() else { return Ok(()) };
                        if let Some(handler) = conn.handler() {
                            handler.on_received(message);
                        }
                    }
                    Some(Err(error)) => {
                        let status = if codec::is_parse_error(&error) {
                            Err(Error::parse_error(format!("failed to parse received bytes: {error}")))
                        } else {
                            Err(Error::connection_failure(format!("failed to read from socket: {error}")))
                        };
                        if let Some(conn) = conn.upgrade() {
                            conn.complete_close(status);
                        }
                        return Ok(());
                    }
                    None => {
                        // Clean shutdown by the peer.
                        if let Some(conn) = conn.upgrade() {
                            conn.complete_close(Ok(()));
                        }
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn sender_task(
    conn: Weak<Connection>,
    writer: BoxedWriter,
    mut msg_rx: mpsc::UnboundedReceiver<SerializedMessage>,
    read_buffer_size: usize,
    mut close_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut sink = FramedWrite::new(writer, RpcCodec::new(read_buffer_size));

    loop {
        tokio::select! {
            _ = close_rx.changed() => {
                // Drain pending writes best-effort, then finish the close.
                msg_rx.close();
                while let Ok(message) = msg_rx.try_recv() {
                    if sink.feed(message).await.is_err() {
                        break;
                    }
                }
                let _ = sink.flush().await;
                if let Some(conn) = conn.upgrade() {
                    conn.complete_close(Ok(()));
                }
                return Ok(());
            }
            message = msg_rx.recv() => {
                match message {
                    Some(message) => {
                        trace!(len = message.len(), "Send message");
                        if let Err(error) = sink.send(message).await {
                            if let Some(conn) = conn.upgrade() {
                                conn.complete_close(Err(Error::connection_failure(
                                    format!("failed to write to socket: {error}"),
                                )));
                            }
                            return Ok(());
                        }
                        if let Some(conn) = conn.upgrade() {
                            if let Some(handler) = conn.handler() {
                                handler.on_sent();
                            }
                        }
                    }
                    // All senders dropped together with the connection.
                    None => return Ok(()),
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
    use mrpc_proto::{IntoParams as _, MessageId};
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    struct RecordingHandler {
        received: std_mpsc::Sender<Message>,
        closed: std_mpsc::Sender<Result<()>>,
    }

    impl ConnectionHandler for RecordingHandler {
        fn on_received(&self, message: Message) {
            let _ = self.received.send(message);
        }

        fn on_closed(&self, status: Result<()>) {
            let _ = self.closed.send(status);
        }
    }

    fn pipe_pair(
        executor: &Executor,
    ) -> (Arc<Connection>, Arc<Connection>) {
        let (a, b) = tokio::io::duplex(4096);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);

        let left = Connection::new(
            Box::new(a_read),
            Box::new(a_write),
            Uri::tcp("127.0.0.1", 1),
            Uri::tcp("127.0.0.1", 2),
            MessageParserConfig::default(),
            executor.handle(),
        );
        let right = Connection::new(
            Box::new(b_read),
            Box::new(b_write),
            Uri::tcp("127.0.0.1", 2),
            Uri::tcp("127.0.0.1", 1),
            MessageParserConfig::default(),
            executor.handle(),
        );
        (left, right)
    }

    fn recording_handler() -> (
        Arc<RecordingHandler>,
        std_mpsc::Receiver<Message>,
        std_mpsc::Receiver<Result<()>>,
    ) {
        let (received_tx, received_rx) = std_mpsc::channel();
        let (closed_tx, closed_rx) = std_mpsc::channel();
        (
            Arc::new(RecordingHandler {
                received: received_tx,
                closed: closed_tx,
            }),
            received_rx,
            closed_rx,
        )
    }

    #[test]
    fn messages_flow_in_fifo_order() {
        let executor = Executor::single_thread().unwrap();
        let (left, right) = pipe_pair(&executor);

        let (left_handler, _left_rx, _left_closed) = recording_handler();
        let (right_handler, right_rx, _right_closed) = recording_handler();

        left.start(left_handler).unwrap();
        right.start(right_handler).unwrap();

        for i in 0..10_u32 {
            let msg = Message::request(MessageId::from(i), "m", (i,).into_params().unwrap());
            left.send(msg.serialize().unwrap()).unwrap();
        }

        for i in 0..10_u32 {
            let received = right_rx.recv_timeout(Duration::from_secs(5)).unwrap();
            match received {
                Message::Request { id, .. } => assert_eq!(u32::from(id), i),
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    #[test]
    fn start_twice_fails_with_precondition() {
        let executor = Executor::single_thread().unwrap();
        let (left, _right) = pipe_pair(&executor);

        let (handler, _rx, _closed) = recording_handler();
        left.start(Arc::clone(&handler)).unwrap();

        let err = left.start(handler).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::PreconditionNotMet);
    }

    #[test]
    fn close_notifies_exactly_once_and_rejects_sends() {
        let executor = Executor::single_thread().unwrap();
        let (left, _right) = pipe_pair(&executor);

        let (handler, _rx, closed_rx) = recording_handler();
        left.start(handler).unwrap();

        left.async_close();
        left.async_close();

        let status = closed_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(status.is_ok());
        assert!(closed_rx.recv_timeout(Duration::from_millis(200)).is_err());

        let msg = Message::notification("m", ().into_params().unwrap());
        assert!(left.send(msg.serialize().unwrap()).is_err());
    }

    #[test]
    fn peer_eof_closes_with_success_status() {
        let executor = Executor::single_thread().unwrap();
        let (left, right) = pipe_pair(&executor);

        let (left_handler, _lrx, left_closed) = recording_handler();
        let (right_handler, _rrx, _right_closed) = recording_handler();

        left.start(left_handler).unwrap();
        right.start(right_handler).unwrap();

        // Closing the right side produces EOF on the left.
        right.async_close();
        drop(right);

        let status = left_closed.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(status.is_ok());
    }

    #[test]
    fn malformed_bytes_close_with_parse_error() {
        let executor = Executor::single_thread().unwrap();

        let (a, b) = tokio::io::duplex(4096);
        let (a_read, a_write) = tokio::io::split(a);

        let conn = Connection::new(
            Box::new(a_read),
            Box::new(a_write),
            Uri::tcp("127.0.0.1", 1),
            Uri::tcp("127.0.0.1", 2),
            MessageParserConfig::default(),
            executor.handle(),
        );

        let (handler, _rx, closed_rx) = recording_handler();
        conn.start(handler).unwrap();

        // Write garbage from the peer end: a bare integer is not an array.
        let (_b_read, mut b_write) = tokio::io::split(b);
        executor
            .spawn(OperationType::Transport, async move {
                use tokio::io::AsyncWriteExt as _;
                b_write.write_all(&[0x05]).await?;
                b_write.flush().await?;
                Ok(())
            })
            .detach();

        let status = closed_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let error = status.unwrap_err();
        assert_eq!(error.kind(), crate::error::ErrorKind::ParseError);
    }
}
