//! HTTP data plane.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (accept loop, shared state, reload, drain)
//!     → forward.rs (one request: read, resolve, connect, relay)
//!         → request.rs (parse head and body, request ID)
//!         → response.rs (client head, re-framing, error responses)
//!     → Send to client, close
//! ```

pub mod forward;
pub mod request;
pub mod response;
pub mod server;

pub use request::{ClientRequest, RequestError, RequestId, X_REQUEST_ID};
pub use response::{ClientFraming, ResponseWriter};
pub use server::{AppState, HttpServer, SharedState};
