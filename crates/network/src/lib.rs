//! Per-peer connections, the reverse-authentication handshake and the
//! retrying transmit loop that outbound calls go through.

pub mod auth;
pub mod codec;
pub mod comms;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod host;
pub mod metric;
pub mod registry;
pub mod token_store;
mod transmit;

pub use auth::Auth;
pub use codec::{AuthMetadata, MessageStream};
pub use comms::ProtoComms;
pub use config::{CommsConfig, ConnectionType, HostParams};
pub use connection::{Connection, ConnectivityState, RpcChannel};
pub use error::{Error, ErrorClass};
pub use host::Host;
pub use registry::HostRegistry;
