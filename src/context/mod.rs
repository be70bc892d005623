//! Per-request proxy context.
//!
//! # Data Flow
//! ```text
//! upstream bytes → ProxyContext::ingest
//!     → [SocksHandshake] socks negotiator → Tunnel (raw bytes → chain)
//!     → AwaitingStatus  → status parser
//!     → AwaitingHeaders → header parser (framing decision)
//!     → ReceivingBody   → plain counter | chunked decoder | until close
//!     → buffer chain (busy segments, output order)
//! driver ← take_header() once, then pending_output()/advance_output()
//! ```
//!
//! # Design Decisions
//! - One context per proxied request, owned by one task
//! - The phase enum decides which flag combinations are reachable
//! - A failed context keeps its validated output so it can still be flushed

pub mod phase;
pub mod proxy;

pub use phase::{BodyKind, Phase};
pub use proxy::{ContextLimits, ProxyContext, ResponseHead};
