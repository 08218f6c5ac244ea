//! surfsync-transport: TCP transport layer
//!
//! Client stubs for the block and metadata services, and the server loop
//! that exposes in-process stores over TCP.

pub mod server;
pub mod tcp;

pub use server::Server;
pub use tcp::{RemoteBlockStore, RemoteMetaStore, TcpConnector};
