use std::time::Duration;

use crate::handshake::ServerInfo;
use crate::{Error, Result};

pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Connection options. Build with [`ConnectionConfig::new`] and the
/// fluent setters; invalid values are rejected synchronously.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    /// Per-socket send/receive timeout. `None` disables it.
    pub(crate) io_timeout: Option<Duration>,
    /// Upper bound for `wait` calls and the graceful-close QUIT exchange.
    pub(crate) sync_timeout: Duration,
    /// When set, `AUTH` runs first in the handshake.
    pub(crate) password: Option<String>,
    /// When set and the server supports it, `CLIENT SETNAME` runs during
    /// the handshake. Printable ASCII (`!`..`~`) only.
    pub(crate) name: Option<String>,
    /// Enforced bound on the unsent backlog: an enqueue that would
    /// exceed it fails with a lifecycle error.
    pub(crate) max_unsent: Option<usize>,
    /// Whether timeout errors name the oldest in-flight command.
    pub(crate) include_detail_in_timeouts: bool,
    /// Whether a graceful close sends QUIT before tearing down.
    pub(crate) quit_on_close: bool,
    /// Server version and type already known to the caller; skips the
    /// INFO discovery step of the handshake.
    pub(crate) known_server: Option<ServerInfo>,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> ConnectionConfig {
        ConnectionConfig {
            host: host.into(),
            port,
            io_timeout: None,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            password: None,
            name: None,
            max_unsent: None,
            include_detail_in_timeouts: true,
            quit_on_close: true,
            known_server: None,
        }
    }

    pub fn io_timeout(mut self, timeout: Option<Duration>) -> ConnectionConfig {
        self.io_timeout = timeout;
        self
    }

    pub fn sync_timeout(mut self, timeout: Duration) -> Result<ConnectionConfig> {
        if timeout.is_zero() {
            return Err(Error::Configuration(
                "sync timeout must be greater than zero".to_string(),
            ));
        }
        self.sync_timeout = timeout;
        Ok(self)
    }

    pub fn password(mut self, password: impl Into<String>) -> ConnectionConfig {
        self.password = Some(password.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Result<ConnectionConfig> {
        let name = name.into();
        if name.is_empty() || !name.bytes().all(|b| (b'!'..=b'~').contains(&b)) {
            return Err(Error::Configuration(format!(
                "client name {:?} must be non-empty printable ASCII without spaces",
                name
            )));
        }
        self.name = Some(name);
        Ok(self)
    }

    pub fn max_unsent(mut self, limit: usize) -> ConnectionConfig {
        self.max_unsent = Some(limit);
        self
    }

    pub fn include_detail_in_timeouts(mut self, include: bool) -> ConnectionConfig {
        self.include_detail_in_timeouts = include;
        self
    }

    pub fn quit_on_close(mut self, quit: bool) -> ConnectionConfig {
        self.quit_on_close = quit;
        self
    }

    /// Declare the server version and type up front. The handshake then
    /// probes with `PING` (or `CLIENT SETNAME`) instead of `INFO`.
    pub fn assume_server(mut self, info: ServerInfo) -> ConnectionConfig {
        self.known_server = Some(info);
        self
    }
}
