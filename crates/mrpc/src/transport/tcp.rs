use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpSocket, TcpStream};

use crate::acceptor::{Acceptor, Listener};
use crate::config::MessageParserConfig;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::executor::ExecutorHandle;
use crate::transport::Backend;
use crate::uri::{Scheme, Uri};

const LISTEN_BACKLOG: u32 = 64;

pub(crate) struct TcpBackend {
    executor: ExecutorHandle,
    parser_config: MessageParserConfig,
}

impl TcpBackend {
    pub(crate) fn new(executor: ExecutorHandle, parser_config: MessageParserConfig) -> Self {
        Self {
            executor,
            parser_config,
        }
    }
}

#[async_trait]
impl Backend for TcpBackend {
    fn scheme(&self) -> Scheme {
        Scheme::Tcp
    }

    async fn connect(&self, uri: &Uri) -> Result<Arc<Connection>> {
        let mut last_error = None;

        for addr in resolve(uri).await? {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    if let Err(error) = stream.set_nodelay(true) {
                        warn!(%error, "set_nodelay on TcpStream failed");
                    }

                    let local_uri = stream
                        .local_addr()
                        .map(uri_from_addr)
                        .unwrap_or_else(|_| uri.clone());
                    let peer_uri = uri_from_addr(addr);

                    debug!(peer = %peer_uri, "Connected");

                    let (reader, writer) = stream.into_split();
                    return Ok(Connection::new(
                        Box::new(reader),
                        Box::new(writer),
                        local_uri,
                        peer_uri,
                        self.parser_config.clone(),
                        self.executor.clone(),
                    ));
                }
                Err(error) => {
                    debug!(%addr, %error, "Connect attempt failed");
                    last_error = Some(error);
                }
            }
        }

        Err(Error::connection_failure(format!(
            "failed to connect to {uri}: {}",
            last_error.map_or_else(|| "no endpoint".to_owned(), |e| e.to_string()),
        )))
    }

    async fn bind(&self, uri: &Uri) -> Result<Vec<Arc<Acceptor>>> {
        let mut acceptors = Vec::new();

        for addr in resolve(uri).await? {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()
            } else {
                TcpSocket::new_v6()
            }
            .map_err(|e| Error::unexpected(format!("failed to create TCP socket: {e}")))?;

            // Allows rebinding the endpoint right after a restart.
            #[cfg(unix)]
            socket
                .set_reuseaddr(true)
                .map_err(|e| Error::unexpected(format!("failed to set SO_REUSEADDR: {e}")))?;

            socket
                .bind(addr)
                .map_err(|e| Error::unexpected(format!("failed to bind {addr}: {e}")))?;

            let listener = socket
                .listen(LISTEN_BACKLOG)
                .map_err(|e| Error::unexpected(format!("failed to listen on {addr}: {e}")))?;

            // Reports the OS-assigned port when binding port 0.
            let local_addr = listener
                .local_addr()
                .map_err(|e| Error::unexpected(format!("failed to query local address: {e}")))?;

            acceptors.push(Acceptor::new(
                Listener::Tcp(listener),
                uri_from_addr(local_addr),
                self.parser_config.clone(),
                self.executor.clone(),
            ));
        }

        Ok(acceptors)
    }
}

/// Resolve a TCP URI into every matching endpoint (IPv4 and IPv6).
async fn resolve(uri: &Uri) -> Result<Vec<SocketAddr>> {
    let host = uri.host();
    let port = uri
        .port()
        .ok_or_else(|| Error::invalid_argument(format!("no port in URI `{uri}`")))?;

    // Literal addresses skip the resolver.
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| Error::host_unresolved(format!("failed to resolve `{host}`: {e}")))?
        .collect();

    if addrs.is_empty() {
        return Err(Error::host_unresolved(format!(
            "`{host}` resolved to no endpoints"
        )));
    }

    Ok(addrs)
}

fn uri_from_addr(addr: SocketAddr) -> Uri {
    Uri::tcp(addr.ip().to_string(), addr.port())
}
