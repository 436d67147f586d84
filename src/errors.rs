use std::io;
use thiserror::Error;

use crate::host::DevNum;
use crate::registry::Step;

/// errno values used for the endpoint's negative-status convention
pub const EFAULT: i32 = 14;
pub const EBUSY: i32 = 16;

/// Failures of a single BH1750 bus transaction
#[derive(Error, Debug)]
pub enum BusError {
    #[error("failed to send measurement command: {source}")]
    Write {
        #[source]
        source: io::Error,
    },

    #[error("measurement command short write: sent {sent} of {expected} byte(s)")]
    ShortWrite { sent: usize, expected: usize },

    #[error("timed out reading measurement data: {source}")]
    ReadTimeout {
        #[source]
        source: io::Error,
    },

    #[error("failed to read measurement data: {source}")]
    Read {
        #[source]
        source: io::Error,
    },

    #[error("measurement data short read: got {received} of {expected} byte(s)")]
    ShortRead { received: usize, expected: usize },

    #[error("no bus client attached")]
    Detached,
}

/// Errors surfaced by the reader endpoint
#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("device busy: another session is open")]
    Busy,

    #[error("measurement failed: {0}")]
    Io(#[from] BusError),
}

impl EndpointError {
    /// Negative errno-style status for this error.
    pub fn errno(&self) -> i32 {
        match self {
            EndpointError::Busy => -EBUSY,
            EndpointError::Io(_) => -EFAULT,
        }
    }
}

/// Errors from the host primitives the registrar drives
#[derive(Error, Debug)]
pub enum HostError {
    #[error("no free device numbers for '{name}'")]
    NoDeviceNumbers { name: String },

    #[error("I/O error at '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("device node for {devnum} has not been created")]
    NodeMissing { devnum: DevNum },

    #[error("I2C adapter {index} not found at '{path}'")]
    AdapterNotFound { index: u32, path: String },

    #[error("I2C client '{name}' at {address:#04x} could not be created: {source}")]
    Client {
        name: String,
        address: u16,
        #[source]
        source: io::Error,
    },
}

/// Startup errors of the lifecycle registrar
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("registration step '{step}' failed: {source}")]
    Step {
        step: Step,
        #[source]
        source: HostError,
    },

    #[error("invalid driver configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration from '{path}': {source}")]
    LoadError {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Invalid configuration format: {0}")]
    FormatError(#[from] toml::de::Error),

    #[error("Invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Result type aliases for convenience
pub type BusResult<T> = Result<T, BusError>;
pub type EndpointResult<T> = Result<T, EndpointError>;
pub type HostResult<T> = Result<T, HostError>;
pub type RegistryResult<T> = Result<T, RegistryError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
