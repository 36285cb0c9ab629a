//! Reconnect loop maintaining one live connection to the server.

use std::sync::Arc;
use std::time::Duration;

use mrpc_proto::Message;
use parking_lot::Mutex;
use rand::Rng as _;
use tokio::sync::{oneshot, watch};

use crate::client::registry::CallRegistry;
use crate::config::ReconnectionConfig;
use crate::connect::connect_any;
use crate::connection::{Connection, ConnectionHandler};
use crate::error::{Error, ErrorKind, Result};
use crate::executor::ShutdownSignal;
use crate::transport::BackendSet;
use crate::uri::Uri;

/// Exponential backoff: doubles after each consecutive failure, saturates at
/// the maximum, and adds uniform jitter in `[0, max_jitter]` to every delay.
pub(crate) struct ReconnectBackoff {
    current: Duration,
    initial: Duration,
    max: Duration,
    max_jitter: Duration,
}

impl ReconnectBackoff {
    pub(crate) fn new(config: &ReconnectionConfig) -> Self {
        Self {
            current: config.initial_waiting_time(),
            initial: config.initial_waiting_time(),
            max: config.max_waiting_time(),
            max_jitter: config.max_jitter_waiting_time(),
        }
    }

    /// The delay to sleep before the next attempt.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current.saturating_add(self.jitter());
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    /// Reset to the initial delay; called on every successful connect.
    pub(crate) fn reset(&mut self) {
        self.current = self.initial;
    }

    fn jitter(&self) -> Duration {
        if self.max_jitter.is_zero() {
            return Duration::ZERO;
        }
        let max_nanos = u64::try_from(self.max_jitter.as_nanos()).unwrap_or(u64::MAX);
        Duration::from_nanos(rand::thread_rng().gen_range(0..=max_nanos))
    }

    #[cfg(test)]
    fn base_delay(&self) -> Duration {
        self.current
    }
}

/// Routes received responses into the call registry and reports closes back
/// to the reconnect loop.
struct ClientConnectionHandler {
    registry: Arc<CallRegistry>,
    closed_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl ConnectionHandler for ClientConnectionHandler {
    fn on_received(&self, message: Message) {
        match message {
            Message::Response { id, error, result } => {
                let outcome = if error.is_nil() {
                    Ok(result)
                } else {
                    Err(Error::server(error))
                };
                self.registry.complete(id, outcome);
            }
            Message::Request { method, .. } => {
                warn!(%method, "Client received a request; dropped");
            }
            Message::Notification { method, .. } => {
                warn!(%method, "Client received a notification; dropped");
            }
        }
    }

    fn on_sent(&self) {
        trace!("Message sent");
    }

    fn on_closed(&self, _status: Result<()>) {
        if let Some(tx) = self.closed_tx.lock().take() {
            let _ = tx.send(());
        }
    }
}

/// The reconnect loop itself; runs as one task on the transport pool.
pub(crate) struct ClientConnector {
    backends: BackendSet,
    uris: Vec<Uri>,
    reconnection: ReconnectionConfig,
    registry: Arc<CallRegistry>,
    current_tx: watch::Sender<Option<Arc<Connection>>>,
}

impl ClientConnector {
    pub(crate) fn new(
        backends: BackendSet,
        uris: Vec<Uri>,
        reconnection: ReconnectionConfig,
        registry: Arc<CallRegistry>,
        current_tx: watch::Sender<Option<Arc<Connection>>>,
    ) -> Self {
        Self {
            backends,
            uris,
            reconnection,
            registry,
            current_tx,
        }
    }

    pub(crate) async fn run(self, mut shutdown: ShutdownSignal) -> anyhow::Result<()> {
        let mut backoff = ReconnectBackoff::new(&self.reconnection);

        loop {
            let attempt = tokio::select! {
                result = connect_any(&self.backends, &self.uris) => result,
                _ = shutdown.wait() => break,
            };

            match attempt {
                Ok(connection) => {
                    backoff.reset();

                    let (closed_tx, closed_rx) = oneshot::channel();
                    let handler = Arc::new(ClientConnectionHandler {
                        registry: Arc::clone(&self.registry),
                        closed_tx: Mutex::new(Some(closed_tx)),
                    });

                    if let Err(error) = connection.start(handler) {
                        warn!(%error, "Failed to start connection");
                        continue;
                    }

                    self.current_tx.send_replace(Some(Arc::clone(&connection)));
                    info!(peer = %connection.peer_uri(), "Connected to server");

                    tokio::select! {
                        _ = closed_rx => {
                            self.current_tx.send_replace(None);
                            // Outstanding calls fail fast on disconnect; the
                            // loop reconnects in the background.
                            self.registry.drain_all(
                                ErrorKind::ConnectionFailure,
                                "connection to the server was lost",
                            );
                            debug!("Connection closed; reconnecting");
                        }
                        _ = shutdown.wait() => {
                            connection.async_close();
                            break;
                        }
                    }
                }
                Err(error) => {
                    let delay = backoff.next_delay();
                    warn!(%error, ?delay, "Failed to connect to all URIs; retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.wait() => break,
                    }
                }
            }
        }

        self.current_tx.send_replace(None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;

    fn config(initial: f64, max: f64, jitter: f64) -> ReconnectionConfig {
        ReconnectionConfig {
            initial_waiting_time_sec: initial,
            max_waiting_time_sec: max,
            max_jitter_waiting_time_sec: jitter,
        }
    }

    #[test]
    fn backoff_doubles_and_saturates() {
        let mut backoff = ReconnectBackoff::new(&config(0.1, 0.4, 0.0));

        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        // Saturated at the maximum.
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
    }

    #[test]
    fn backoff_resets_on_success() {
        let mut backoff = ReconnectBackoff::new(&config(0.1, 10.0, 0.0));

        let _ = backoff.next_delay();
        let _ = backoff.next_delay();
        assert!(backoff.base_delay() > Duration::from_millis(100));

        backoff.reset();
        assert_eq!(backoff.base_delay(), Duration::from_millis(100));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut backoff = ReconnectBackoff::new(&config(0.1, 10.0, 0.05));

        for _ in 0..100 {
            backoff.reset();
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }
}
