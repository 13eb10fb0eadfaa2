//! # Coil Server Error Handling
//!
//! Error types shared by every layer of the coil server: listener and socket
//! failures, protocol framing problems, coil addressing mistakes made by
//! external callers, configuration validation and the terminal
//! "reconnect budget exhausted" condition.
//!
//! ## Error Categories
//!
//! ### Transport Errors
//! - **I/O Errors**: socket read/write failures on a client connection
//! - **Address In Use**: the listener could not bind because the port is taken
//! - **Connection Errors**: listener faults that drive the reconnect state machine
//! - **Timeout Errors**: bounded waits that elapsed
//!
//! ### Protocol Errors
//! - **Frame Errors**: frames too short to carry the fixed request fields
//! - **Invalid Function**: function codes this server does not implement
//!
//! ### Command Errors
//! - **Coil Out Of Range**: `set_coil` or a protocol write outside the bank
//! - **Not Running**: an external command issued while no server is running
//!
//! ### System Errors
//! - **Configuration Errors**: values outside the accepted ranges
//! - **Reconnect Exhausted**: the listener gave up after the attempt budget
//! - **Internal Errors**: poisoned locks and lost control tasks
//!
//! ## Usage
//!
//! ```rust
//! use voltage_coil_server::{ModbusError, ModbusResult};
//!
//! fn describe(result: ModbusResult<()>) {
//!     match result {
//!         Ok(()) => println!("ok"),
//!         Err(error) if error.is_recoverable() => println!("will retry: {}", error),
//!         Err(error) => println!("gave up: {}", error),
//!     }
//! }
//! ```

use thiserror::Error;

/// Result type alias for coil server operations
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Coil server error types
///
/// Every variant carries owned context so errors can be cloned into status
/// reports and log lines without borrowing the failing socket.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModbusError {
    /// I/O related errors on an accepted connection or the listener
    #[error("I/O error: {message}")]
    Io { message: String },

    /// The listener address is already bound by another socket
    ///
    /// Singled out because it is retried on a longer delay than other
    /// listener faults.
    #[error("Address already in use: {address}")]
    AddressInUse { address: String },

    /// Listener level connection errors
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Timeout errors
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Protocol-level errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Function code outside the supported subset
    #[error("Invalid function code: {code}")]
    InvalidFunction { code: u8 },

    /// Coil index outside the configured bank
    #[error("Coil index {index} out of range (bank size {size})")]
    CoilOutOfRange { index: usize, size: usize },

    /// Frame parsing errors
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// External command issued while the server is not running
    #[error("Server not running: {operation}")]
    NotRunning { operation: String },

    /// Automatic listener recovery gave up
    #[error("Reconnect attempts exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// Internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ModbusError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create an address-in-use error for the given bind address
    pub fn address_in_use<S: Into<String>>(address: S) -> Self {
        Self::AddressInUse { address: address.into() }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a new timeout error
    ///
    /// # Arguments
    ///
    /// * `operation` - Description of the operation that timed out
    /// * `timeout_ms` - Timeout duration in milliseconds
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol { message: message.into() }
    }

    /// Create an invalid function error
    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    /// Create a coil out-of-range error
    pub fn coil_out_of_range(index: usize, size: usize) -> Self {
        Self::CoilOutOfRange { index, size }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create a not-running error for the named operation
    pub fn not_running<S: Into<String>>(operation: S) -> Self {
        Self::NotRunning { operation: operation.into() }
    }

    /// Create a reconnect exhausted error
    pub fn reconnect_exhausted(attempts: u32) -> Self {
        Self::ReconnectExhausted { attempts }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if the error is recoverable (can retry)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use voltage_coil_server::ModbusError;
    ///
    /// assert!(ModbusError::address_in_use("0.0.0.0:502").is_recoverable());
    /// assert!(!ModbusError::reconnect_exhausted(100).is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::AddressInUse { .. } | Self::Connection { .. } | Self::Timeout { .. }
        )
    }

    /// Check if the error is a network/transport issue
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::AddressInUse { .. }
                | Self::Connection { .. }
                | Self::Timeout { .. }
        )
    }

    /// Check if the error is a protocol issue
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. } | Self::InvalidFunction { .. } | Self::Frame { .. }
        )
    }

    /// Check if the error is a bind failure caused by a port already in use
    pub fn is_address_in_use(&self) -> bool {
        matches!(self, Self::AddressInUse { .. })
    }
}

/// Convert from std::io::Error
///
/// `AddrInUse` keeps its identity so the lifecycle controller can pick the
/// longer retry delay; every other kind collapses into `ModbusError::Io`.
impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::AddrInUse => Self::address_in_use(err.to_string()),
            _ => Self::io(err.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for ModbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for ModbusError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("YAML error: {}", err))
    }
}
