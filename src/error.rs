//! Error taxonomy.

use crate::driver::DeviceKind;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong at the platform boundary or in the
/// wrappers above it.
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum Error {
    #[error("discovery error: {0}")]
    Discovery(String),

    #[error("no device of kind {0:?} found on any platform")]
    NoMatchingDevice(DeviceKind),

    #[error("failed to create {kind}: {reason}")]
    ResourceCreation { kind: &'static str, reason: String },

    #[error("program build failed")]
    BuildFailed,

    #[error("kernel source error: {0}")]
    Source(String),

    #[error("{0} handle already released")]
    Released(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArg(String),

    #[error("transfer out of bounds: offset {offset} + len {len} exceeds buffer size {size}")]
    OutOfBounds { offset: usize, len: usize, size: usize },

    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("profiling error: {0}")]
    Profiling(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("driver error: {0}")]
    Driver(String),
}

impl Error {
    /// Shorthand for [`Error::Discovery`].
    pub fn discovery<S: Into<String>>(msg: S) -> Self {
        Error::Discovery(msg.into())
    }

    /// Shorthand for [`Error::ResourceCreation`].
    pub fn creation<S: Into<String>>(kind: &'static str, reason: S) -> Self {
        Error::ResourceCreation { kind, reason: reason.into() }
    }

    /// Shorthand for [`Error::Source`].
    pub fn source<S: Into<String>>(msg: S) -> Self {
        Error::Source(msg.into())
    }

    /// Shorthand for [`Error::InvalidArg`].
    pub fn invalid_arg<S: Into<String>>(msg: S) -> Self {
        Error::InvalidArg(msg.into())
    }

    /// Shorthand for [`Error::Dispatch`].
    pub fn dispatch<S: Into<String>>(msg: S) -> Self {
        Error::Dispatch(msg.into())
    }

    /// Shorthand for [`Error::Profiling`].
    pub fn profiling<S: Into<String>>(msg: S) -> Self {
        Error::Profiling(msg.into())
    }

    /// Shorthand for [`Error::Driver`].
    pub fn driver<S: Into<String>>(msg: S) -> Self {
        Error::Driver(msg.into())
    }

    /// Discovery failures are sentinel-style: the caller is expected to check
    /// for them, so they never trip the fatal failure policy.
    pub fn is_discovery(&self) -> bool {
        matches!(self, Error::Discovery(_) | Error::NoMatchingDevice(_))
    }
}
