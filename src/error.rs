use std::io;

use thiserror::Error as ThisError;

/// Errors surfaced by the connection engine.
///
/// Per-message failures travel through the message's completion handle;
/// connection-wide failures are additionally raised through the event
/// channel, tagged with whether they tore the connection down.
#[derive(Debug, ThisError)]
pub enum Error {
    /// Invalid argument at construction or property set. Raised
    /// synchronously, never through a completion.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Operation attempted on a connection in the wrong state.
    #[error("invalid operation for the current connection state: {0}")]
    Lifecycle(String),

    /// The reply stream or a must-succeed command violated the protocol
    /// contract. Fatal while reading; surfaced to the caller while writing.
    #[error("protocol error; {0}")]
    Protocol(String),

    /// A `-ERR ...` reply from the server. Non-fatal; the connection
    /// stays open.
    #[error("{0}")]
    Server(String),

    /// A `wait` call exceeded the configured sync timeout.
    #[error("timeout awaiting completion{0}")]
    Timeout(String),

    /// The message was cancelled before it was written.
    #[error("the message was cancelled")]
    Cancelled,

    /// The connection shut down while the message was outstanding, or the
    /// message was enqueued after an abort.
    #[error("{0}")]
    Shutdown(String),

    /// I/O failure on the underlying socket.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
