use core::fmt;
use std::str::FromStr;

use smol_str::SmolStr;

use crate::error::{Error, Result};

/// Transport scheme selecting a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Tcp,
    Unix,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Tcp => "tcp",
            Scheme::Unix => "unix",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Endpoint address in the form `tcp://host:port`, `tcp://[ipv6]:port` or
/// `unix:///path`.
///
/// Immutable once constructed; formatting reproduces the grammar verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Uri {
    scheme: Scheme,
    host: SmolStr,
    port: Option<u16>,
}

impl Uri {
    pub fn tcp(host: impl AsRef<str>, port: u16) -> Self {
        Self {
            scheme: Scheme::Tcp,
            host: SmolStr::new(host),
            port: Some(port),
        }
    }

    pub fn unix(path: impl AsRef<str>) -> Self {
        Self {
            scheme: Scheme::Unix,
            host: SmolStr::new(path),
            port: None,
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let invalid = |reason: &str| {
            Error::invalid_argument(format!("invalid URI `{s}`: {reason}"))
        };

        let scheme_end = s.find("://").ok_or_else(|| invalid("scheme is missing"))?;
        let scheme = &s[..scheme_end];
        let rest = &s[scheme_end + "://".len()..];

        match scheme {
            "tcp" => {
                let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
                    let host_end = bracketed
                        .find(']')
                        .ok_or_else(|| invalid("unterminated `[` in IPv6 host"))?;
                    let host = &bracketed[..host_end];
                    let port = bracketed[host_end + 1..]
                        .strip_prefix(':')
                        .ok_or_else(|| invalid("port is missing"))?;
                    (host, port)
                } else {
                    let host_end = rest.rfind(':').ok_or_else(|| invalid("port is missing"))?;
                    let host = &rest[..host_end];
                    if host.contains(':') {
                        return Err(invalid("IPv6 host must be bracketed"));
                    }
                    (host, &rest[host_end + 1..])
                };

                if host.is_empty() {
                    return Err(invalid("host is missing"));
                }
                let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;

                Ok(Self::tcp(host, port))
            }
            "unix" => {
                if !rest.starts_with('/') {
                    return Err(invalid("unix socket path must be absolute"));
                }
                Ok(Self::unix(rest))
            }
            other => Err(invalid(&format!("unsupported scheme `{other}`"))),
        }
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Host name or IP address for `tcp`, filesystem path for `unix`.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }
}

impl FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            Scheme::Tcp => {
                let port = self.port.unwrap_or(0);
                if self.host.contains(':') {
                    write!(f, "tcp://[{}]:{}", self.host, port)
                } else {
                    write!(f, "tcp://{}:{}", self.host, port)
                }
            }
            Scheme::Unix => write!(f, "unix://{}", self.host),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn parse_tcp() {
        let uri = Uri::parse("tcp://localhost:7136").unwrap();
        assert_eq!(uri.scheme(), Scheme::Tcp);
        assert_eq!(uri.host(), "localhost");
        assert_eq!(uri.port(), Some(7136));
        assert_eq!(uri.to_string(), "tcp://localhost:7136");
    }

    #[test]
    fn parse_tcp_ipv6() {
        let uri = Uri::parse("tcp://[::1]:0").unwrap();
        assert_eq!(uri.host(), "::1");
        assert_eq!(uri.port(), Some(0));
        assert_eq!(uri.to_string(), "tcp://[::1]:0");
    }

    #[test]
    fn parse_unix() {
        let uri = Uri::parse("unix:///tmp/mrpc.sock").unwrap();
        assert_eq!(uri.scheme(), Scheme::Unix);
        assert_eq!(uri.host(), "/tmp/mrpc.sock");
        assert_eq!(uri.port(), None);
        assert_eq!(uri.to_string(), "unix:///tmp/mrpc.sock");
    }

    #[test]
    fn unbracketed_ipv6_is_rejected() {
        let err = Uri::parse("tcp://::1:7136").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn missing_port_is_rejected() {
        assert!(Uri::parse("tcp://localhost").is_err());
        assert!(Uri::parse("tcp://[::1]").is_err());
    }

    #[test]
    fn out_of_range_port_is_rejected() {
        assert!(Uri::parse("tcp://localhost:65536").is_err());
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let err = Uri::parse("udp://localhost:7136").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn relative_unix_path_is_rejected() {
        assert!(Uri::parse("unix://relative/path").is_err());
    }
}
