//! Network subsystem: sockets, the connection table and the Icecast clients

pub mod connection;
pub mod icy;
pub mod transport;

#[cfg(test)]
pub(crate) mod mock;

pub use connection::{Connection, ConnectionKind, ConnectionTable};
pub use icy::{spawn_listen, spawn_login, IcyClient, ListenTarget, PendingConnect, RelaySupervisor, RelayTarget};
pub use transport::{Acceptor, Connector, TcpAcceptor, TcpConnector, TcpTransport, Transport};
