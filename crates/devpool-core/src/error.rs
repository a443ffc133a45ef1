//! Application error types with rich context

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Error types organized by layer/domain
#[derive(Debug, Error)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Common/Infrastructure Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    // ─────────────────────────────────────────────────────────────
    // Device Directory Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Device directory error: {message}")]
    Directory { message: String },

    #[error("Device directory snapshot is locked by another process: {path}")]
    DirectoryLocked { path: PathBuf },

    // ─────────────────────────────────────────────────────────────
    // Device Backend Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Device backend error: {message}")]
    Backend { message: String },

    #[error("Required tool not available: {tool}")]
    ToolNotFound { tool: String },

    #[error("Failed to start device {name}: {reason}")]
    DeviceStart { name: String, reason: String },

    #[error("Device backend output could not be parsed: {message}")]
    Protocol { message: String },

    #[error("No free port found from {from} after {attempts} attempts")]
    NoFreePort { from: u16, attempts: u32 },

    // ─────────────────────────────────────────────────────────────
    // Boundary/Configuration Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid device filter: {message}")]
    InvalidFilter { message: String },

    // ─────────────────────────────────────────────────────────────
    // Channel/Communication Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Channel closed unexpectedly")]
    ChannelClosed,

    #[error("Pool operation aborted before completion: {operation}")]
    OperationAborted { operation: String },
}

// ─────────────────────────────────────────────────────────────────
// Convenience Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn directory(message: impl Into<String>) -> Self {
        Self::Directory {
            message: message.into(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    pub fn tool_not_found(tool: impl Into<String>) -> Self {
        Self::ToolNotFound { tool: tool.into() }
    }

    pub fn device_start(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DeviceStart {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn invalid_filter(message: impl Into<String>) -> Self {
        Self::InvalidFilter {
            message: message.into(),
        }
    }

    pub fn operation_aborted(operation: impl Into<String>) -> Self {
        Self::OperationAborted {
            operation: operation.into(),
        }
    }

    /// Check if this is a recoverable error
    ///
    /// Recoverable errors leave the pool consistent; the caller may simply
    /// retry the operation later.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Backend { .. }
                | Error::DeviceStart { .. }
                | Error::Protocol { .. }
                | Error::DirectoryLocked { .. }
                | Error::NoFreePort { .. }
                | Error::OperationAborted { .. }
        )
    }

    /// Check if this error should stop the process
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config { .. } | Error::ChannelClosed)
    }

    /// Errors caused by the caller's request rather than pool state
    pub fn is_rejected_request(&self) -> bool {
        matches!(self, Error::InvalidFilter { .. })
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Context Extensions
// ─────────────────────────────────────────────────────────────────

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", context.into(), err);
            err
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", f(), err);
            err
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = Error::backend("simctl exited with 1");
        assert_eq!(err.to_string(), "Device backend error: simctl exited with 1");

        let err = Error::tool_not_found("adb");
        assert!(err.to_string().contains("adb"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_error_is_fatal() {
        assert!(Error::config("bad max count").is_fatal());
        assert!(Error::ChannelClosed.is_fatal());
        assert!(!Error::backend("test").is_fatal());
    }

    #[test]
    fn test_error_is_recoverable() {
        assert!(Error::backend("test").is_recoverable());
        assert!(Error::device_start("Pixel_6_API_33", "timeout").is_recoverable());
        assert!(Error::operation_aborted("subscribe").is_recoverable());
        assert!(Error::NoFreePort {
            from: 8300,
            attempts: 10
        }
        .is_recoverable());
        assert!(!Error::invalid_filter("unknown key").is_recoverable());
    }

    #[test]
    fn test_invalid_filter_is_rejected_request() {
        let err = Error::invalid_filter("unknown key: colour");
        assert!(err.is_rejected_request());
        assert!(err.to_string().contains("colour"));
        assert!(!Error::backend("x").is_rejected_request());
    }

    #[test]
    fn test_device_start_message() {
        let err = Error::device_start("iPhone 15", "Unable to boot");
        assert_eq!(
            err.to_string(),
            "Failed to start device iPhone 15: Unable to boot"
        );
    }

    #[test]
    fn test_context_preserves_variant() {
        let res: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        let err = res.context("writing snapshot").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
