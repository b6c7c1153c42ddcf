//! Error kinds for the node resource manager core (spec §7).
//!
//! One variant per kind in the spec's error table; each carries the fields
//! its routing policy needs (e.g. `KernelIO` carries the controller name so
//! the pipeline can look up that controller's mode).

use thiserror::Error;

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Topology discovery failed or an invariant (§3) was violated. Fatal
    /// at startup.
    #[error("topology error: {message}")]
    Topology { message: String },

    /// Configuration was unparseable or out of range. The caller must keep
    /// the previous configuration (§7: "never partially applies").
    #[error("invalid config: {message}")]
    InvalidConfig { message: String, field: Option<String> },

    /// No pool had enough capacity to satisfy a [`crate::request::Request`].
    #[error("insufficient capacity for container {container}: {message}")]
    Insufficient { message: String, container: String },

    /// A sysfs/cgroup/proc read or write failed. Routed per the failing
    /// controller's operational mode (§4.5).
    #[error("kernel I/O error in controller {controller} at {path}: {message}")]
    KernelIo {
        message: String,
        controller: String,
        path: String,
    },

    /// A kernel knob the configuration asked for is absent on this system.
    /// The owning controller disables itself silently (§4.6, §4.8).
    #[error("kernel feature not supported: {message}")]
    NotSupported { message: String },

    /// A short-lived failure (PID vanished mid-scan, a map changed under
    /// us). The caller skips the entity and continues (§4.10).
    #[error("transient failure: {message}")]
    Transient { message: String },
}

impl Error {
    pub fn topology(message: impl Into<String>) -> Error {
        Error::Topology { message: message.into() }
    }

    pub fn invalid_config(message: impl Into<String>, field: Option<&str>) -> Error {
        Error::InvalidConfig {
            message: message.into(),
            field: field.map(str::to_string),
        }
    }

    pub fn insufficient(message: impl Into<String>, container: impl Into<String>) -> Error {
        Error::Insufficient {
            message: message.into(),
            container: container.into(),
        }
    }

    pub fn kernel_io(
        message: impl Into<String>,
        controller: impl Into<String>,
        path: impl Into<String>,
    ) -> Error {
        Error::KernelIo {
            message: message.into(),
            controller: controller.into(),
            path: path.into(),
        }
    }

    pub fn not_supported(message: impl Into<String>) -> Error {
        Error::NotSupported { message: message.into() }
    }

    pub fn transient(message: impl Into<String>) -> Error {
        Error::Transient { message: message.into() }
    }

    /// True for the kinds §7 says prefer local recovery over propagation.
    pub fn is_locally_recoverable(&self) -> bool {
        matches!(self, Error::Transient { .. } | Error::NotSupported { .. })
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Correlation context attached to an error as it crosses a hook or
/// controller boundary, so a failure can be traced back to the lifecycle
/// event that triggered it.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub correlation_id: uuid::Uuid,
    pub container: Option<String>,
    pub controller: Option<String>,
    pub operation: String,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            correlation_id: uuid::Uuid::new_v4(),
            container: None,
            controller: None,
            operation: operation.into(),
        }
    }

    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    pub fn with_controller(mut self, controller: impl Into<String>) -> Self {
        self.controller = Some(controller.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locally_recoverable_kinds() {
        assert!(Error::transient("pid gone").is_locally_recoverable());
        assert!(Error::not_supported("no knob").is_locally_recoverable());
        assert!(!Error::topology("bad topology").is_locally_recoverable());
    }
}
