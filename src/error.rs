//! Error types for node-netd
//!
//! Provides structured error types for the resource store, the controller
//! runtime, kernel adapters and the configuration inputs.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the network engine
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },

    // =========================================================================
    // Resource Store Errors
    // =========================================================================
    #[error("Resource not found: {resource}")]
    ResourceNotFound { resource: String },

    #[error("Resource already exists: {resource}")]
    ResourceExists { resource: String },

    #[error("Resource {resource} is owned by {owner:?}, not {actor:?}")]
    OwnerConflict {
        resource: String,
        owner: String,
        actor: String,
    },

    #[error("Resource {resource} is tearing down")]
    PhaseConflict { resource: String },

    #[error("Resource {resource} has pending finalizers: {finalizers}")]
    FinalizersPresent { resource: String, finalizers: String },

    #[error("Resource {resource} version conflict: expected {expected}, found {actual}")]
    VersionConflict {
        resource: String,
        expected: u64,
        actual: u64,
    },

    #[error("Controller {controller} has no declared output {kind}")]
    UndeclaredOutput { controller: String, kind: String },

    #[error("{0} conflict(s) detected")]
    Conflicts(usize),

    // =========================================================================
    // Kernel Errors
    // =========================================================================
    #[error("{op}: no such object")]
    KernelNotFound { op: String },

    #[error("{op}: object exists")]
    KernelExists { op: String },

    #[error("{op}: resource busy")]
    KernelBusy { op: String },

    #[error("{op}: operation not supported")]
    KernelUnsupported { op: String },

    #[error("{op}: {reason}")]
    Kernel { op: String, reason: String },

    #[error("nftables compile error: {0}")]
    NfTablesCompile(String),

    // =========================================================================
    // DNS Errors
    // =========================================================================
    #[error("DNS error: {0}")]
    Dns(String),

    // =========================================================================
    // Operator Errors
    // =========================================================================
    #[error("Operator {operator} on {link} panicked")]
    OperatorPanic { operator: String, link: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("cmdline {field} parse failure: {detail}")]
    CmdlineParse { field: String, detail: String },

    #[error("Device selector error: {0}")]
    Selector(String),

    #[error("Address parse error: {0}")]
    AddressParse(String),

    #[error("Key material error: {0}")]
    KeyMaterial(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Wrap the error with a short description of the failed operation
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Innermost error behind any context wrappers
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self.root() {
            // Kernel hiccups and store races - retry with backoff
            Error::KernelNotFound { .. }
            | Error::KernelBusy { .. }
            | Error::PhaseConflict { .. }
            | Error::VersionConflict { .. }
            | Error::Conflicts(_) => ErrorAction::RequeueWithBackoff,

            // Finalizer holders need time to release
            Error::FinalizersPresent { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(1))
            }

            // Configuration errors - wait for the input to change
            Error::Configuration(_)
            | Error::CmdlineParse { .. }
            | Error::Selector(_)
            | Error::UndeclaredOutput { .. } => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient (ENOENT, EAGAIN, device gone)
    pub fn is_transient(&self) -> bool {
        matches!(
            self.root(),
            Error::KernelNotFound { .. } | Error::KernelBusy { .. }
        )
    }

    /// Check if the kernel object (or resource) does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.root(),
            Error::KernelNotFound { .. } | Error::ResourceNotFound { .. }
        )
    }

    /// Check if the kernel reported the object already exists
    pub fn is_exists(&self) -> bool {
        matches!(self.root(), Error::KernelExists { .. })
    }

    /// Check if the kernel does not support the request
    pub fn is_unsupported(&self) -> bool {
        matches!(self.root(), Error::KernelUnsupported { .. })
    }

    /// Check if a write hit a resource in teardown
    pub fn is_phase_conflict(&self) -> bool {
        matches!(self.root(), Error::PhaseConflict { .. })
    }
}

#[cfg(target_os = "linux")]
impl Error {
    /// Classify a kernel errno (positive or negated) for the failed operation
    pub fn from_errno(op: impl Into<String>, errno: i32) -> Self {
        use nix::errno::Errno;

        let op = op.into();

        match Errno::from_raw(errno.abs()) {
            Errno::ENOENT | Errno::ENODEV | Errno::ESRCH | Errno::EADDRNOTAVAIL => {
                Error::KernelNotFound { op }
            }
            Errno::EEXIST => Error::KernelExists { op },
            Errno::EAGAIN | Errno::EBUSY => Error::KernelBusy { op },
            Errno::EOPNOTSUPP | Errno::EPROTONOSUPPORT => {
                Error::KernelUnsupported { op }
            }
            other => Error::Kernel {
                op,
                reason: other.desc().to_string(),
            },
        }
    }
}

/// Extension to attach operation context to fallible calls
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }
}

/// Result type alias for the engine
pub type Result<T> = std::result::Result<T, Error>;
