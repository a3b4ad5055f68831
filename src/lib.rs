//! # Voltage Modbus Server - Modbus RTU/TCP Slave Engine
//!
//! **Author:** Evan Liu <liuyifanz.1996@gmail.com>
//! **License:** MIT
//!
//! A Modbus server (slave) in pure Rust: four in-memory register tables, a
//! protocol engine that validates and executes requests against them, and
//! RTU (serial) and TCP transports driven by a simple poll loop.
//!
//! ## Features
//!
//! - **One engine, two envelopes**: RTU (id + CRC16) and TCP (MBAP header)
//!   share the same dispatch code through the [`Framing`] trait
//! - **Modbus-conformant errors**: corrupt or foreign frames are dropped
//!   silently, function-level errors are answered with exception responses
//! - **Stack-allocated PDU**: responses are built without heap allocation
//! - **Async transports**: Tokio streams, optional serial support (`rtu` feature)
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Table |
//! |------|----------|-------|
//! | 0x01 | Read Coils | coils |
//! | 0x02 | Read Discrete Inputs | discrete inputs |
//! | 0x03 | Read Holding Registers | holding registers |
//! | 0x04 | Read Input Registers | input registers |
//! | 0x05 | Write Single Coil | coils |
//! | 0x06 | Write Single Register | holding registers |
//! | 0x0F | Write Multiple Coils | coils |
//! | 0x10 | Write Multiple Registers | holding registers |
//!
//! Any other function code is answered with exception 0x01.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use voltage_modbus_server::{
//!     DataBank, ModbusResult, ModbusServer, ProtocolEngine, RegisterTable, TcpTransport,
//! };
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let mut bank = DataBank::default();
//!     bank.holding_registers = RegisterTable::filled(200, 100, 42);
//!
//!     let transport = TcpTransport::bind("0.0.0.0:502".parse().unwrap()).await?;
//!     let mut server = ModbusServer::new(ProtocolEngine::new(1, bank), transport);
//!
//!     loop {
//!         server.poll().await?;
//!     }
//! }
//! ```

// ============================================================================
// Core modules
// ============================================================================

/// Core error types and result handling
pub mod error;

/// Modbus protocol constants based on official specification
pub mod constants;

/// Function codes, exception codes and register kinds
pub mod protocol;

/// Register tables backing the server
pub mod databank;

/// High-performance PDU with stack-allocated fixed array
pub mod pdu;

/// CRC, bit packing and RTU/TCP envelopes
pub mod codec;

/// Request validation and dispatch
pub mod engine;

/// Serial and TCP transports
pub mod transport;

/// Poll loop tying an engine to a transport
pub mod server;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Async runtime (users can use voltage_modbus_server::tokio) ===
pub use tokio;

// === Server API ===
pub use engine::{FrameOutcome, ProtocolEngine};
pub use server::{ModbusServer, PollOutcome, ServerStats};

// === Error handling ===
pub use error::{ModbusError, ModbusResult};

// === Core types ===
pub use databank::{DataBank, RegisterTable};
pub use protocol::{ModbusException, ModbusFunction, RegisterKind, SlaveId};

// === Framing ===
pub use codec::{crc16, DropReason, Framing, MbapHeader, RtuFraming, TcpFraming};

// === Transports ===
pub use transport::{RtuTransport, ServerTransport, TcpTransport, TransportStats};

#[cfg(feature = "rtu")]
pub use transport::RtuConfig;

// === Protocol limits (commonly needed constants) ===
pub use constants::{
    MAX_PDU_SIZE, MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_COILS, MAX_WRITE_REGISTERS,
};

// === PDU (advanced usage) ===
pub use pdu::{ModbusPdu, PduBuilder};

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!(
        "Voltage Modbus Server v{} - Modbus RTU/TCP slave engine by Evan Liu",
        VERSION
    )
}
