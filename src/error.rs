//! Error types for the Modbus server library
//!
//! Only failures the caller has to deal with live here: I/O, configuration,
//! and contract violations on the register tables. Function-level protocol
//! errors are [`ModbusException`](crate::protocol::ModbusException) values
//! that the engine turns into exception responses, and transport integrity
//! failures are [`DropReason`](crate::codec::DropReason) values that never
//! leave the engine.

use std::io;

use thiserror::Error;

/// Result alias used across the crate
pub type ModbusResult<T> = Result<T, ModbusError>;

#[derive(Error, Debug)]
pub enum ModbusError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Invalid function code: 0x{code:02X}")]
    InvalidFunction { code: u8 },

    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Access to a register table outside `[start, end)`.
    #[error("Address range {address}+{count} outside table [{start}, {end})")]
    OutOfRange {
        address: u16,
        count: usize,
        start: u16,
        end: u32,
    },

    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl ModbusError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Errors after which the server can keep polling
    ///
    /// Transient I/O failures: a peer resetting or abandoning the line, or an
    /// interrupted call. A closed stream or a misconfiguration is not.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}
