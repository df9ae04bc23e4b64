//! Custom error types for the instrument control core.
//!
//! This module defines the primary error type, `IcsError`, shared by the cache,
//! the device layer, the poller and the script daemon. Using the `thiserror` crate,
//! it provides one consistent taxonomy for everything that can go wrong between a
//! script and a piece of hardware.
//!
//! ## Error Hierarchy
//!
//! - **`Configuration`**: fatal at device construction (bad or missing parameters).
//! - **`Mode`**: the operation is not allowed in the current execution mode.
//! - **`Communication`** / **`Timeout`**: hardware or cache I/O failure. The poller
//!   retries these with backoff; they are never fatal to a long running process.
//! - **`LockTimeout`**: an advisory cache lock could not be acquired in time. The
//!   caller decides what to do; the holder is always named.
//! - **`Access`**: insufficient privilege for the running script. Always surfaced.
//! - **`Authentication`**: a daemon client presented unknown credentials.
//! - **`Position`**: device is in an ambiguous physical state.
//!
//! Every variant that knows its originating device renders it as `[device] ` after
//! the category prefix, so log lines and client messages can be traced back.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, IcsError>;

/// Formats the optional device tag used in error messages.
fn tag(device: &Option<String>) -> String {
    match device {
        Some(name) => format!("[{}] ", name),
        None => String::new(),
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IcsError {
    #[error("configuration error: {}{message}", tag(.device))]
    Configuration {
        device: Option<String>,
        message: String,
    },

    #[error("mode error: {}{message}", tag(.device))]
    Mode {
        device: Option<String>,
        message: String,
    },

    #[error("communication error: {}{message}", tag(.device))]
    Communication {
        device: Option<String>,
        message: String,
    },

    #[error("timeout error: {}{message}", tag(.device))]
    Timeout {
        device: Option<String>,
        message: String,
    },

    #[error("lock timeout: lock '{name}' is held by {holder}")]
    LockTimeout { name: String, holder: String },

    #[error("access error: {}{message} ({required} access is required)", tag(.device))]
    Access {
        device: Option<String>,
        required: String,
        message: String,
    },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("position error: {}{message}", tag(.device))]
    Position {
        device: Option<String>,
        message: String,
    },

    #[error("usage error: {}{message}", tag(.device))]
    Usage {
        device: Option<String>,
        message: String,
    },

    #[error("limit error: {}{message}", tag(.device))]
    Limit {
        device: Option<String>,
        message: String,
    },

    #[error("invalid value: {}{message}", tag(.device))]
    InvalidValue {
        device: Option<String>,
        message: String,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("script error: {0}")]
    Script(String),

    #[error("script aborted: {0}")]
    Aborted(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Json(String),

    #[error("configuration load error: {0}")]
    ConfigLoad(String),
}

impl IcsError {
    /// Fatal construction-time error for a device.
    pub fn config(device: impl Into<String>, message: impl Into<String>) -> Self {
        IcsError::Configuration {
            device: Some(device.into()),
            message: message.into(),
        }
    }

    /// Configuration error not tied to a device (settings validation).
    pub fn settings(message: impl Into<String>) -> Self {
        IcsError::Configuration {
            device: None,
            message: message.into(),
        }
    }

    pub fn mode(device: impl Into<String>, message: impl Into<String>) -> Self {
        IcsError::Mode {
            device: Some(device.into()),
            message: message.into(),
        }
    }

    pub fn comm(device: impl Into<String>, message: impl Into<String>) -> Self {
        IcsError::Communication {
            device: Some(device.into()),
            message: message.into(),
        }
    }

    /// Communication failure with the cache itself.
    pub fn cache_comm(message: impl Into<String>) -> Self {
        IcsError::Communication {
            device: None,
            message: message.into(),
        }
    }

    pub fn timeout(device: Option<&str>, message: impl Into<String>) -> Self {
        IcsError::Timeout {
            device: device.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn usage(device: impl Into<String>, message: impl Into<String>) -> Self {
        IcsError::Usage {
            device: Some(device.into()),
            message: message.into(),
        }
    }

    pub fn limit(device: impl Into<String>, message: impl Into<String>) -> Self {
        IcsError::Limit {
            device: Some(device.into()),
            message: message.into(),
        }
    }

    pub fn invalid(device: impl Into<String>, message: impl Into<String>) -> Self {
        IcsError::InvalidValue {
            device: Some(device.into()),
            message: message.into(),
        }
    }

    pub fn position(device: impl Into<String>, message: impl Into<String>) -> Self {
        IcsError::Position {
            device: Some(device.into()),
            message: message.into(),
        }
    }

    /// Returns the device that raised the error, if known.
    pub fn device(&self) -> Option<&str> {
        match self {
            IcsError::Configuration { device, .. }
            | IcsError::Mode { device, .. }
            | IcsError::Communication { device, .. }
            | IcsError::Timeout { device, .. }
            | IcsError::Access { device, .. }
            | IcsError::Position { device, .. }
            | IcsError::Usage { device, .. }
            | IcsError::Limit { device, .. }
            | IcsError::InvalidValue { device, .. } => device.as_deref(),
            _ => None,
        }
    }

    /// Attach a device name to an error that does not carry one yet.
    pub fn with_device(mut self, name: &str) -> Self {
        match &mut self {
            IcsError::Configuration { device, .. }
            | IcsError::Mode { device, .. }
            | IcsError::Communication { device, .. }
            | IcsError::Timeout { device, .. }
            | IcsError::Access { device, .. }
            | IcsError::Position { device, .. }
            | IcsError::Usage { device, .. }
            | IcsError::Limit { device, .. }
            | IcsError::InvalidValue { device, .. } => {
                if device.is_none() {
                    *device = Some(name.to_string());
                }
            }
            _ => {}
        }
        self
    }

    /// Errors the poller treats as transient hardware/cache trouble.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IcsError::Communication { .. } | IcsError::Timeout { .. } | IcsError::Io(_)
        )
    }
}

impl From<std::io::Error> for IcsError {
    fn from(err: std::io::Error) -> Self {
        IcsError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for IcsError {
    fn from(err: serde_json::Error) -> Self {
        IcsError::Json(err.to_string())
    }
}

impl From<figment::Error> for IcsError {
    fn from(err: figment::Error) -> Self {
        IcsError::ConfigLoad(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_names_device_and_category() {
        let err = IcsError::config("motor1", "missing configuration parameter 'unit'");
        assert_eq!(
            err.to_string(),
            "configuration error: [motor1] missing configuration parameter 'unit'"
        );
    }

    #[test]
    fn test_lock_timeout_names_holder() {
        let err = IcsError::LockTimeout {
            name: "motor1".into(),
            holder: "daemon@host".into(),
        };
        assert!(err.to_string().contains("daemon@host"));
    }

    #[test]
    fn test_access_error_names_level() {
        let err = IcsError::Access {
            device: Some("shutter".into()),
            required: "admin".into(),
            message: "cannot start device".into(),
        };
        let text = err.to_string();
        assert!(text.starts_with("access error: [shutter]"));
        assert!(text.contains("admin access is required"));
    }

    #[test]
    fn test_with_device_keeps_existing() {
        let err = IcsError::comm("a", "x").with_device("b");
        assert_eq!(err.device(), Some("a"));
        let err = IcsError::cache_comm("down").with_device("b");
        assert_eq!(err.device(), Some("b"));
        assert!(err.is_retryable());
    }
}
