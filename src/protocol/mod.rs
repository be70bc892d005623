//! Upstream wire formats.
//!
//! # Data Flow
//! ```text
//! upstream bytes
//!     → socks.rs   (tunnel handshake, feature "socks")
//!     → status.rs  (status line)
//!     → headers.rs (header block, body framing)
//!     → chunked.rs (chunked body, when framed that way)
//! ```
//!
//! # Design Decisions
//! - Every parser is incremental and sans-IO: it consumes what it is given
//!   and reports how much it used
//! - Parsers never allocate per byte; limits bound every buffered line

pub mod chunked;
pub mod headers;
#[cfg(feature = "socks")]
pub mod socks;
pub mod status;

pub use chunked::{ChunkedDecoder, ChunkedError, ChunkedState};
pub use headers::{HeaderParser, ResponseHeaders};
pub use status::{HttpVersion, Status, StatusParser};
