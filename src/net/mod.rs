//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → connection.rs (lifecycle tracking, drain on shutdown)
//!     → Hand off to HTTP layer
//!
//! Outgoing:
//!     upstream.rs (connect with timeout, to the upstream or the SOCKS server)
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked for graceful shutdown

pub mod connection;
pub mod listener;
pub mod upstream;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionInfo, ConnectionTracker};
pub use listener::{ConnectionPermit, Listener, ListenerError};
