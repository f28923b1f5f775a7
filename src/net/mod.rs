//! Outbound connections to other servers and execution hosts.
pub mod client;
pub mod registry;

pub use client::{Disposition, TransportError};
pub use registry::{ConnectError, Connection, ConnectionRegistry, Target};
