//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!     → shared via Arc to all subsystems
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → atomic swap of the server state
//!     → new requests observe new config
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Listener and buffer sizing are fixed at startup; a reload only
//!   affects targets, limits and timeouts

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, LoadError};
pub use schema::{
    AdminConfig, BufferConfig, ForwardedUri, LimitsConfig, ListenerConfig, LogFormat,
    ObservabilityConfig, ProxyConfig, SocksConfig, TimeoutConfig, UpstreamConfig,
};
