pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod message;
pub mod reply;
pub mod request;
pub mod sink;
pub mod stats;
pub mod transaction;

pub use config::ConnectionConfig;
pub use connection::{set_inline_completions, Connection, ConnectionEvent, ConnectionState};
pub use error::Error;
pub use handshake::{ServerInfo, ServerType};
pub use message::{Completion, Message, MessageState};
pub use reply::Reply;
pub use stats::Stats;
pub use transaction::{Condition, Transaction};

pub type Result<T> = std::result::Result<T, Error>;
