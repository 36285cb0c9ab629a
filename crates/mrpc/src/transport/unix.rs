use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{UnixListener, UnixStream};

use crate::acceptor::{Acceptor, Listener};
use crate::config::MessageParserConfig;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::executor::ExecutorHandle;
use crate::transport::Backend;
use crate::uri::{Scheme, Uri};

pub(crate) struct UnixBackend {
    executor: ExecutorHandle,
    parser_config: MessageParserConfig,
}

impl UnixBackend {
    pub(crate) fn new(executor: ExecutorHandle, parser_config: MessageParserConfig) -> Self {
        Self {
            executor,
            parser_config,
        }
    }
}

#[async_trait]
impl Backend for UnixBackend {
    fn scheme(&self) -> Scheme {
        Scheme::Unix
    }

    async fn connect(&self, uri: &Uri) -> Result<Arc<Connection>> {
        let stream = UnixStream::connect(uri.host()).await.map_err(|e| {
            Error::connection_failure(format!("failed to connect to {uri}: {e}"))
        })?;

        debug!(peer = %uri, "Connected");

        let (reader, writer) = stream.into_split();
        Ok(Connection::new(
            Box::new(reader),
            Box::new(writer),
            uri.clone(),
            uri.clone(),
            self.parser_config.clone(),
            self.executor.clone(),
        ))
    }

    async fn bind(&self, uri: &Uri) -> Result<Vec<Arc<Acceptor>>> {
        let path = Path::new(uri.host());

        // A previous process may have left its socket file behind.
        if path.exists() {
            if is_socket(path) {
                debug!(%uri, "Removing stale socket file");
                std::fs::remove_file(path).map_err(|e| {
                    Error::unexpected(format!("failed to remove stale socket file {uri}: {e}"))
                })?;
            } else {
                return Err(Error::invalid_argument(format!(
                    "{uri} exists and is not a socket"
                )));
            }
        }

        let listener = UnixListener::bind(path)
            .map_err(|e| Error::unexpected(format!("failed to bind {uri}: {e}")))?;

        Ok(vec![Acceptor::new(
            Listener::Unix {
                listener,
                uri: uri.clone(),
            },
            uri.clone(),
            self.parser_config.clone(),
            self.executor.clone(),
        )])
    }
}

fn is_socket(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt as _;

    std::fs::metadata(path)
        .map(|m| m.file_type().is_socket())
        .unwrap_or(false)
}
