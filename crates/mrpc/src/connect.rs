//! Multi-backend connect: walk candidate URIs until one accepts.

use std::sync::Arc;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::transport::BackendSet;
use crate::uri::Uri;

/// Attempt each URI strictly in order; the first live connection wins.
///
/// Resolution failures count as ordinary attempt failures. When every URI
/// fails, a single aggregate error is returned.
pub(crate) async fn connect_any(backends: &BackendSet, uris: &[Uri]) -> Result<Arc<Connection>> {
    let mut failures = Vec::with_capacity(uris.len());

    for uri in uris {
        let attempt = match backends.find(uri.scheme()) {
            Ok(backend) => backend.connect(uri).await,
            Err(error) => Err(error),
        };

        match attempt {
            Ok(connection) => return Ok(connection),
            Err(error) => {
                debug!(%uri, %error, "Connection attempt failed");
                failures.push(format!("{uri}: {error}"));
            }
        }
    }

    Err(Error::connection_failure(format!(
        "failed to connect to all URIs: {}",
        failures.join("; "),
    )))
}
