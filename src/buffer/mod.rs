//! Output buffer management.
//!
//! # Data Flow
//! ```text
//! decoded body bytes
//!     → chain.rs push (tail segment, else allocate: free list → pool reservation)
//!     → busy list (FIFO, output order)
//!     → driver writes pending() and calls advance()
//!     → reclaim(): flushed head segments → free list (or back to pool)
//! ```
//!
//! # Design Decisions
//! - One `SegmentPool` per process, shared by `Arc`; it only counts
//! - One `BufferChain` per context; only its owner mutates it
//! - Hitting the ceiling is backpressure, not an error for the client

pub mod chain;
pub mod pool;

use thiserror::Error;

pub use chain::{BufferChain, SegmentId};
pub use pool::SegmentPool;

/// Errors from the buffer chain.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    /// The pool is at its ceiling; retry once capacity frees.
    #[error("segment pool exhausted")]
    Backpressure,

    #[error("requested {requested} bytes but segments hold {capacity}")]
    Oversized { requested: usize, capacity: usize },

    #[error("segment {0:?} is not held by the caller")]
    NotHeld(SegmentId),

    #[error("segment {0:?} does not exist")]
    UnknownSegment(SegmentId),
}
