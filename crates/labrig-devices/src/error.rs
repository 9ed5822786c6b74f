/*!
 * Error types for the labrig devices crate.
 */
use thiserror::Error;

/// Error type for device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The device cannot accept the request in its current state
    #[error("Invalid device state: {0}")]
    InvalidState(String),

    /// Device configuration failure (missing module, missing parameter)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A required module handle is unexpectedly absent
    #[error("Null module handle: {0}")]
    NullHandle(String),

    /// A requested resource (device task, sub-unit) does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The bus rejected a command synchronously
    #[error("Bus error: {0}")]
    Bus(#[from] labrig_modules::BusError),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] labrig_core::error::Error),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

impl DeviceError {
    /// Create a new invalid-state error
    pub fn invalid_state<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::InvalidState(msg.as_ref().to_string())
    }

    /// Create a new configuration error
    pub fn config<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Config(msg.as_ref().to_string())
    }

    /// Create a new null-handle error
    pub fn null_handle<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::NullHandle(msg.as_ref().to_string())
    }

    /// Create a new not-found error
    pub fn not_found<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::NotFound(msg.as_ref().to_string())
    }

    /// Create a new other error
    pub fn other<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Other(msg.as_ref().to_string())
    }
}

impl From<String> for DeviceError {
    fn from(s: String) -> Self {
        DeviceError::Other(s)
    }
}

impl From<&str> for DeviceError {
    fn from(s: &str) -> Self {
        DeviceError::Other(s.to_string())
    }
}
