//! Per-scheme transport backends.

pub(crate) mod tcp;
#[cfg(unix)]
pub(crate) mod unix;

use std::sync::Arc;

use async_trait::async_trait;

use crate::acceptor::Acceptor;
use crate::config::MessageParserConfig;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::executor::ExecutorHandle;
use crate::uri::{Scheme, Uri};

/// Bundle of the connector and acceptor-factory capabilities for one
/// transport scheme.
#[async_trait]
pub trait Backend: Send + Sync {
    fn scheme(&self) -> Scheme;

    /// Establish an outgoing connection to `uri`.
    async fn connect(&self, uri: &Uri) -> Result<Arc<Connection>>;

    /// Bind `uri`, returning one acceptor per resolved endpoint.
    async fn bind(&self, uri: &Uri) -> Result<Vec<Arc<Acceptor>>>;
}

/// Immutable scheme → backend registry, built once per client or server.
pub(crate) struct BackendSet {
    backends: Vec<Arc<dyn Backend>>,
}

impl BackendSet {
    /// The default backends: TCP everywhere, unix sockets where available.
    pub(crate) fn new(executor: ExecutorHandle, parser_config: MessageParserConfig) -> Self {
        let mut backends: Vec<Arc<dyn Backend>> = Vec::new();
        backends.push(Arc::new(tcp::TcpBackend::new(
            executor.clone(),
            parser_config.clone(),
        )));
        #[cfg(unix)]
        backends.push(Arc::new(unix::UnixBackend::new(executor, parser_config)));
        Self { backends }
    }

    pub(crate) fn find(&self, scheme: Scheme) -> Result<&Arc<dyn Backend>> {
        self.backends
            .iter()
            .find(|b| b.scheme() == scheme)
            .ok_or_else(|| {
                Error::invalid_argument(format!("no transport backend for scheme `{scheme}`"))
            })
    }
}
