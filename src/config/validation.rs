//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (sizes > 0, addresses parse)
//! - Check that the SOCKS section is complete when enabled
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::ProxyConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self { field, message: message.into() }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Check a configuration, collecting every problem.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("{:?} is not a socket address", config.listener.bind_address),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be greater than 0"));
    }

    let pass = config.upstream.pass.trim();
    if pass.is_empty() {
        errors.push(ValidationError::new("upstream.pass", "must not be empty"));
    } else if !pass.starts_with("http://") {
        errors.push(ValidationError::new(
            "upstream.pass",
            "only plain http:// targets are supported",
        ));
    }

    if config.socks.enabled {
        if !cfg!(feature = "socks") {
            errors.push(ValidationError::new(
                "socks.enabled",
                "SOCKS support is not compiled into this build",
            ));
        }
        if config.socks.server.trim().is_empty() {
            errors.push(ValidationError::new("socks.server", "must not be empty"));
        }
        if config.socks.forwarded_uri.is_none() {
            errors.push(ValidationError::new(
                "socks.forwarded_uri",
                "must be set to \"http\" or \"tunnel\" when SOCKS is enabled",
            ));
        }
        if config.socks.destination_port == Some(0) {
            errors.push(ValidationError::new("socks.destination_port", "must not be 0"));
        }
    }

    let buffers = &config.buffers;
    if buffers.segment_size == 0 {
        errors.push(ValidationError::new("buffers.segment_size", "must be greater than 0"));
    } else if buffers.max_memory < buffers.segment_size {
        errors.push(ValidationError::new(
            "buffers.max_memory",
            "must hold at least one segment",
        ));
    }

    let limits = &config.limits;
    for (field, value) in [
        ("limits.max_status_line", limits.max_status_line),
        ("limits.max_header_size", limits.max_header_size),
        ("limits.max_request_head", limits.max_request_head),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than 0"));
        }
    }
    if limits.max_chunk_size == 0 {
        errors.push(ValidationError::new("limits.max_chunk_size", "must be greater than 0"));
    }

    if config.timeouts.connect_secs == 0 || config.timeouts.read_secs == 0 {
        errors.push(ValidationError::new(
            "timeouts",
            "connect_secs and read_secs must be greater than 0",
        ));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            "is not a socket address",
        ));
    }

    if config.admin.enabled && config.admin.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new("admin.bind_address", "is not a socket address"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(validate_config(&ProxyConfig::default()), Ok(()));
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = ProxyConfig::default();
        config.listener.bind_address = "nowhere".into();
        config.upstream.pass = "https://secure".into();
        config.buffers.segment_size = 0;
        config.limits.max_chunk_size = 0;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec![
                "listener.bind_address",
                "upstream.pass",
                "buffers.segment_size",
                "limits.max_chunk_size"
            ]
        );
    }

    #[test]
    fn test_socks_requires_forwarded_uri() {
        let mut config = ProxyConfig::default();
        config.socks.enabled = true;
        let errors = validate_config(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "socks.forwarded_uri"));
    }
}
