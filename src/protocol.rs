//! Modbus protocol definitions
//!
//! Function codes served by the engine, the exception codes it answers with,
//! and the register kind each function code addresses.

use std::fmt;

use crate::constants::*;
use crate::error::{ModbusError, ModbusResult};

/// Modbus slave/unit identifier
pub type SlaveId = u8;

/// The four flat address spaces of a Modbus device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterKind {
    /// Single-bit read/write outputs
    Coil,
    /// Single-bit read-only inputs
    DiscreteInput,
    /// 16-bit read/write registers
    HoldingRegister,
    /// 16-bit read-only registers
    InputRegister,
}

impl fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegisterKind::Coil => "coils",
            RegisterKind::DiscreteInput => "discrete inputs",
            RegisterKind::HoldingRegister => "holding registers",
            RegisterKind::InputRegister => "input registers",
        };
        f.write_str(name)
    }
}

/// Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Coils (0x01)
    ReadCoils = FC_READ_COILS,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = FC_READ_DISCRETE_INPUTS,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = FC_READ_HOLDING_REGISTERS,
    /// Read Input Registers (0x04)
    ReadInputRegisters = FC_READ_INPUT_REGISTERS,
    /// Write Single Coil (0x05)
    WriteSingleCoil = FC_WRITE_SINGLE_COIL,
    /// Write Single Register (0x06)
    WriteSingleRegister = FC_WRITE_SINGLE_REGISTER,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = FC_WRITE_MULTIPLE_COILS,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = FC_WRITE_MULTIPLE_REGISTERS,
}

impl ModbusFunction {
    /// Convert from u8 to ModbusFunction
    pub fn from_u8(value: u8) -> ModbusResult<Self> {
        match value {
            FC_READ_COILS => Ok(ModbusFunction::ReadCoils),
            FC_READ_DISCRETE_INPUTS => Ok(ModbusFunction::ReadDiscreteInputs),
            FC_READ_HOLDING_REGISTERS => Ok(ModbusFunction::ReadHoldingRegisters),
            FC_READ_INPUT_REGISTERS => Ok(ModbusFunction::ReadInputRegisters),
            FC_WRITE_SINGLE_COIL => Ok(ModbusFunction::WriteSingleCoil),
            FC_WRITE_SINGLE_REGISTER => Ok(ModbusFunction::WriteSingleRegister),
            FC_WRITE_MULTIPLE_COILS => Ok(ModbusFunction::WriteMultipleCoils),
            FC_WRITE_MULTIPLE_REGISTERS => Ok(ModbusFunction::WriteMultipleRegisters),
            _ => Err(ModbusError::invalid_function(value)),
        }
    }

    /// Convert to u8
    #[inline]
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// The table this function code operates on
    pub fn register_kind(self) -> RegisterKind {
        match self {
            ModbusFunction::ReadCoils
            | ModbusFunction::WriteSingleCoil
            | ModbusFunction::WriteMultipleCoils => RegisterKind::Coil,
            ModbusFunction::ReadDiscreteInputs => RegisterKind::DiscreteInput,
            ModbusFunction::ReadHoldingRegisters
            | ModbusFunction::WriteSingleRegister
            | ModbusFunction::WriteMultipleRegisters => RegisterKind::HoldingRegister,
            ModbusFunction::ReadInputRegisters => RegisterKind::InputRegister,
        }
    }

    /// Largest quantity a single request of this function may address
    pub fn max_quantity(self) -> usize {
        match self {
            ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs => MAX_READ_COILS,
            ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => {
                MAX_READ_REGISTERS
            }
            ModbusFunction::WriteMultipleCoils => MAX_WRITE_COILS,
            ModbusFunction::WriteMultipleRegisters => MAX_WRITE_REGISTERS,
            ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => 1,
        }
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModbusFunction::ReadCoils => "Read Coils",
            ModbusFunction::ReadDiscreteInputs => "Read Discrete Inputs",
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::ReadInputRegisters => "Read Input Registers",
            ModbusFunction::WriteSingleCoil => "Write Single Coil",
            ModbusFunction::WriteSingleRegister => "Write Single Register",
            ModbusFunction::WriteMultipleCoils => "Write Multiple Coils",
            ModbusFunction::WriteMultipleRegisters => "Write Multiple Registers",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Modbus exception codes the server answers with
///
/// The discriminant is the exception code sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModbusException {
    IllegalFunction = EXCEPTION_ILLEGAL_FUNCTION,
    IllegalDataAddress = EXCEPTION_ILLEGAL_DATA_ADDRESS,
    IllegalDataValue = EXCEPTION_ILLEGAL_DATA_VALUE,
    ServerDeviceFailure = EXCEPTION_SERVER_DEVICE_FAILURE,
}

impl ModbusException {
    /// Convert from u8 to ModbusException
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            EXCEPTION_ILLEGAL_FUNCTION => Some(ModbusException::IllegalFunction),
            EXCEPTION_ILLEGAL_DATA_ADDRESS => Some(ModbusException::IllegalDataAddress),
            EXCEPTION_ILLEGAL_DATA_VALUE => Some(ModbusException::IllegalDataValue),
            EXCEPTION_SERVER_DEVICE_FAILURE => Some(ModbusException::ServerDeviceFailure),
            _ => None,
        }
    }

    /// Convert to u8
    #[inline]
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Get human-readable description
    pub fn description(self) -> &'static str {
        match self {
            ModbusException::IllegalFunction => {
                "The function code received in the query is not an allowable action for the server"
            }
            ModbusException::IllegalDataAddress => {
                "The data address received in the query is not an allowable address for the server"
            }
            ModbusException::IllegalDataValue => {
                "A value contained in the query data field is not an allowable value for server"
            }
            ModbusException::ServerDeviceFailure => {
                "An unrecoverable error occurred while the server was attempting to perform the requested action"
            }
        }
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Modbus Exception 0x{:02X}: {}", self.to_u8(), self.description())
    }
}
