//! Error handling for the wavepipe crates
use thiserror::Error;

/// A Result carrying a [DaemonError]
pub type DaemonResult<T> = Result<T, DaemonError>;

/// Classification of a failure inside the daemon
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    #[error("Configuration error")]
    Config,
    #[error("Socket setup error")]
    SocketSetup,
    #[error("Audio device error")]
    Device,
    #[error("Wire protocol error")]
    Protocol,
    #[error("Cross-loop invoke error")]
    Invoke,
}

/// Combination of a [Fault] with its anyhow source
#[derive(Error, Debug)]
#[error("{fault:?}: {source:?}")]
pub struct DaemonError {
    fault: Fault,
    source: anyhow::Error,
}

impl DaemonError {
    /// Creates a new DaemonError
    pub fn new(fault: Fault, source: anyhow::Error) -> Self {
        Self { fault, source }
    }
    /// Returns the Fault of this DaemonError
    pub fn fault(&self) -> Fault {
        self.fault
    }
    /// Returns the anyhow error of this DaemonError
    pub fn source(&self) -> &anyhow::Error {
        &self.source
    }
}

/// Converts a Result into one of our own Result types
pub trait ResultExt<T> {
    /// Converts a Result to a DaemonResult
    fn fault(self, fault: Fault) -> DaemonResult<T>;
}

impl<T, E: Into<anyhow::Error>> ResultExt<T> for Result<T, E> {
    fn fault(self, fault: Fault) -> DaemonResult<T> {
        self.map_err(|e| DaemonError {
            fault,
            source: e.into(),
        })
    }
}

/// The typed error that travels to a client as an error event.
///
/// `errno` is a positive unix error number; the core error event carries it
/// negated, following the wire convention.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("errno {errno}: {message}")]
pub struct WireError {
    pub errno: i32,
    pub message: String,
}

impl WireError {
    pub fn new(errno: i32, message: impl Into<String>) -> Self {
        Self {
            errno,
            message: message.into(),
        }
    }

    /// EINVAL: malformed message, unknown resource or method
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(libc::EINVAL, message)
    }

    /// EACCES: insufficient permissions on the resource
    pub fn denied(message: impl Into<String>) -> Self {
        Self::new(libc::EACCES, message)
    }

    /// ENOMEM: resource exhaustion while servicing a request
    pub fn no_memory(message: impl Into<String>) -> Self {
        Self::new(libc::ENOMEM, message)
    }
}
