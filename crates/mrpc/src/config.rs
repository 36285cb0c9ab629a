//! Configuration surface for clients, servers and logging.
//!
//! Configuration files are TOML with named sections, so one file can hold
//! several configurations selected by name:
//!
//! ```toml
//! [logging.example]
//! file_path = "mrpc.log"
//!
//! [client.example]
//! uris = ["tcp://localhost:7136"]
//!
//! [server.example]
//! uris = ["tcp://localhost:7136"]
//! ```

use std::collections::HashMap;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::uri::Uri;

/// Severity threshold for emitted logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    /// Mapped to `error`; kept for configuration compatibility.
    Critical,
}

impl LogLevel {
    /// Filtering directive understood by the tracing stack.
    pub fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

/// Log output configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log file path; an empty path selects stdout.
    pub file_path: Utf8PathBuf,
    /// Maximum size of one log file in bytes before rotation.
    pub max_file_size: u64,
    /// Maximum number of rotated files kept on disk.
    pub max_files: usize,
    pub output_log_level: LogLevel,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file_path: Utf8PathBuf::new(),
            max_file_size: 1024 * 1024,
            max_files: 5,
            output_log_level: LogLevel::default(),
        }
    }
}

impl LoggingConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_file_size == 0 {
            return Err(Error::invalid_argument("max_file_size must be positive"));
        }
        if self.max_files == 0 {
            return Err(Error::invalid_argument("max_files must be positive"));
        }
        Ok(())
    }
}

/// Configuration of the incremental message parser.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MessageParserConfig {
    /// How many bytes to request from the socket per read.
    pub read_buffer_size: usize,
}

impl Default for MessageParserConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 32 * 1024,
        }
    }
}

impl MessageParserConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.read_buffer_size == 0 {
            return Err(Error::invalid_argument("read_buffer_size must be positive"));
        }
        Ok(())
    }
}

/// Thread counts for the two executor pools.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorConfig {
    pub num_transport_threads: usize,
    pub num_callback_threads: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            num_transport_threads: 1,
            num_callback_threads: 1,
        }
    }
}

impl ExecutorConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.num_transport_threads == 0 {
            return Err(Error::invalid_argument(
                "num_transport_threads must be at least 1",
            ));
        }
        if self.num_callback_threads == 0 {
            return Err(Error::invalid_argument(
                "num_callback_threads must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Backoff schedule for client reconnection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectionConfig {
    pub initial_waiting_time_sec: f64,
    pub max_waiting_time_sec: f64,
    pub max_jitter_waiting_time_sec: f64,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            initial_waiting_time_sec: 0.125,
            max_waiting_time_sec: 32.0,
            max_jitter_waiting_time_sec: 0.125,
        }
    }
}

impl ReconnectionConfig {
    pub fn initial_waiting_time(&self) -> Duration {
        Duration::from_secs_f64(self.initial_waiting_time_sec)
    }

    pub fn max_waiting_time(&self) -> Duration {
        Duration::from_secs_f64(self.max_waiting_time_sec)
    }

    pub fn max_jitter_waiting_time(&self) -> Duration {
        Duration::from_secs_f64(self.max_jitter_waiting_time_sec)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !(self.initial_waiting_time_sec > 0.0) {
            return Err(Error::invalid_argument(
                "initial_waiting_time_sec must be positive",
            ));
        }
        if self.max_waiting_time_sec < self.initial_waiting_time_sec {
            return Err(Error::invalid_argument(
                "max_waiting_time_sec must be at least initial_waiting_time_sec",
            ));
        }
        if !(self.max_jitter_waiting_time_sec >= 0.0) {
            return Err(Error::invalid_argument(
                "max_jitter_waiting_time_sec must not be negative",
            ));
        }
        Ok(())
    }
}

/// Client-side configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Candidate server URIs, tried in order.
    pub uris: Vec<String>,
    /// Upper bound for one remote call, in seconds.
    pub call_timeout_sec: f64,
    pub message_parser: MessageParserConfig,
    pub executor: ExecutorConfig,
    pub reconnection: ReconnectionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            uris: Vec::new(),
            call_timeout_sec: 15.0,
            message_parser: MessageParserConfig::default(),
            executor: ExecutorConfig::default(),
            reconnection: ReconnectionConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.call_timeout_sec)
    }

    pub(crate) fn parsed_uris(&self) -> Result<Vec<Uri>> {
        self.uris.iter().map(|s| Uri::parse(s)).collect()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !(self.call_timeout_sec > 0.0) {
            return Err(Error::invalid_argument("call_timeout_sec must be positive"));
        }
        self.message_parser.validate()?;
        self.executor.validate()?;
        self.reconnection.validate()?;
        Ok(())
    }
}

/// Server-side configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// URIs to listen on.
    pub uris: Vec<String>,
    pub message_parser: MessageParserConfig,
    pub executor: ExecutorConfig,
}

impl ServerConfig {
    pub(crate) fn parsed_uris(&self) -> Result<Vec<Uri>> {
        self.uris.iter().map(|s| Uri::parse(s)).collect()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        self.message_parser.validate()?;
        self.executor.validate()?;
        Ok(())
    }
}

/// A parsed configuration file holding named sections.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    logging: HashMap<String, LoggingConfig>,
    client: HashMap<String, ClientConfig>,
    server: HashMap<String, ServerConfig>,
}

impl ConfigFile {
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::invalid_argument(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let file: Self = toml::from_str(text)
            .map_err(|e| Error::invalid_argument(format!("invalid configuration: {e}")))?;

        for (name, config) in &file.logging {
            config
                .validate()
                .map_err(|e| Error::invalid_argument(format!("logging.{name}: {e}")))?;
        }
        for (name, config) in &file.client {
            config
                .validate()
                .map_err(|e| Error::invalid_argument(format!("client.{name}: {e}")))?;
        }
        for (name, config) in &file.server {
            config
                .validate()
                .map_err(|e| Error::invalid_argument(format!("server.{name}: {e}")))?;
        }

        Ok(file)
    }

    pub fn logging_config(&self, name: &str) -> Result<&LoggingConfig> {
        self.logging
            .get(name)
            .ok_or_else(|| Error::invalid_argument(format!("no logging configuration named `{name}`")))
    }

    pub fn client_config(&self, name: &str) -> Result<&ClientConfig> {
        self.client
            .get(name)
            .ok_or_else(|| Error::invalid_argument(format!("no client configuration named `{name}`")))
    }

    pub fn server_config(&self, name: &str) -> Result<&ServerConfig> {
        self.server
            .get(name)
            .ok_or_else(|| Error::invalid_argument(format!("no server configuration named `{name}`")))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;

    #[test]
    fn parse_named_sections() {
        let file = ConfigFile::parse(
            r#"
            [logging.example]
            file_path = "mrpc_test.log"
            max_file_size = 1048576
            max_files = 3
            output_log_level = "debug"

            [client.example]
            uris = ["tcp://localhost:7136", "unix:///tmp/mrpc.sock"]
            call_timeout_sec = 3.5
            message_parser = { read_buffer_size = 8192 }
            executor = { num_transport_threads = 2, num_callback_threads = 3 }
            reconnection = { initial_waiting_time_sec = 0.25, max_waiting_time_sec = 8.0, max_jitter_waiting_time_sec = 0.5 }

            [server.example]
            uris = ["tcp://localhost:0"]
            "#,
        )
        .unwrap();

        let logging = file.logging_config("example").unwrap();
        assert_eq!(logging.file_path, "mrpc_test.log");
        assert_eq!(logging.max_files, 3);
        assert_eq!(logging.output_log_level, LogLevel::Debug);

        let client = file.client_config("example").unwrap();
        assert_eq!(client.uris.len(), 2);
        assert_eq!(client.call_timeout(), Duration::from_millis(3500));
        assert_eq!(client.message_parser.read_buffer_size, 8192);
        assert_eq!(client.executor.num_callback_threads, 3);
        assert_eq!(
            client.reconnection.max_waiting_time(),
            Duration::from_secs(8)
        );

        let server = file.server_config("example").unwrap();
        assert_eq!(server.uris, vec!["tcp://localhost:0"]);
    }

    #[test]
    fn missing_section_name_is_an_error() {
        let file = ConfigFile::parse("").unwrap();
        assert!(file.client_config("missing").is_err());
    }

    #[test]
    fn defaults_are_applied() {
        let file = ConfigFile::parse("[client.c]\nuris = [\"tcp://localhost:1\"]\n").unwrap();
        let client = file.client_config("c").unwrap();
        assert_eq!(client.call_timeout(), Duration::from_secs(15));
        assert_eq!(client.executor.num_transport_threads, 1);
    }

    #[test]
    fn non_positive_call_timeout_is_rejected() {
        let result = ConfigFile::parse("[client.c]\ncall_timeout_sec = 0.0\n");
        assert!(result.is_err());
    }

    #[test]
    fn zero_transport_threads_are_rejected() {
        let result =
            ConfigFile::parse("[server.s]\nexecutor = { num_transport_threads = 0 }\n");
        assert!(result.is_err());
    }
}
