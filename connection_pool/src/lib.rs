//! The IRC connection pool, and interface thereto.
//!
//! This crate contains the pool service, which maintains all persistent
//! TCP/TLS connections to IRC servers, and the client library used by the
//! bridge process to drive those connections. Keeping the sockets in a
//! dedicated process allows the bridge to restart for upgrades or crash
//! recovery without every IRC session having to reconnect and rejoin its
//! channels. The two processes communicate only through a durable
//! [`pool_transport::Transport`].

pub mod error;
pub use error::*;

mod protocols;
pub use protocols::*;

mod config;
pub use config::*;

mod reader;
pub use reader::*;

mod state;
pub use state::*;

mod connection;
pub use connection::*;

mod client;
pub use client::*;

mod pool;
pub use pool::*;

mod metrics;
pub use metrics::*;

mod internal {
    pub mod connection;
    pub use connection::*;
    pub mod connection_task;
    pub use connection_task::*;
}
