//! In-memory register storage for the server
//!
//! A [`RegisterTable`] is a fixed-length run of cells starting at a base
//! address. A [`DataBank`] owns one table per [`RegisterKind`]. Tables are
//! sized once at construction and never grow; writes overwrite in place.
//!
//! The tables carry no locking. They are owned by a single
//! [`ProtocolEngine`](crate::engine::ProtocolEngine) and touched from one task
//! only; serving several connections at once would need a mutex per table
//! around `validate`/`get`/`set`.

use std::fmt;

use crate::constants::DEFAULT_TABLE_SIZE;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::RegisterKind;

/// A contiguous, fixed-size block of register cells
///
/// `base_address + len()` is the exclusive upper bound of the addressable
/// space. Callers must check [`validate`](Self::validate) before
/// [`get`](Self::get) or [`set`](Self::set); an unvalidated access is a
/// contract violation and is reported as [`ModbusError::OutOfRange`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterTable<T> {
    base_address: u16,
    values: Vec<T>,
    default_value: T,
}

impl<T: Copy + Default> RegisterTable<T> {
    /// Create a table at `base_address` holding `values`
    ///
    /// The reset value is `T::default()` (`false` / `0`).
    pub fn new(base_address: u16, values: Vec<T>) -> Self {
        Self {
            base_address,
            values,
            default_value: T::default(),
        }
    }

    /// Create a table of `count` cells all set to `value`
    pub fn filled(base_address: u16, count: usize, value: T) -> Self {
        Self::new(base_address, vec![value; count])
    }

    /// Override the value used by [`reset`](Self::reset)
    pub fn with_default_value(mut self, value: T) -> Self {
        self.default_value = value;
        self
    }

    /// First address of the table
    #[inline]
    pub fn base_address(&self) -> u16 {
        self.base_address
    }

    /// Exclusive upper bound of the table
    #[inline]
    pub fn end_address(&self) -> u32 {
        self.base_address as u32 + self.values.len() as u32
    }

    /// Number of cells
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value restored by [`reset`](Self::reset)
    #[inline]
    pub fn default_value(&self) -> T {
        self.default_value
    }

    /// Check that `[address, address + count)` lies inside the table
    pub fn validate(&self, address: u16, count: usize) -> bool {
        let start = address as u64;
        self.base_address as u64 <= start && start + count as u64 <= self.end_address() as u64
    }

    /// Read `count` cells starting at `address`
    pub fn get(&self, address: u16, count: usize) -> ModbusResult<&[T]> {
        let start = self.offset(address, count)?;
        Ok(&self.values[start..start + count])
    }

    /// Overwrite cells starting at `address` with `values`
    pub fn set(&mut self, address: u16, values: &[T]) -> ModbusResult<()> {
        let start = self.offset(address, values.len())?;
        self.values[start..start + values.len()].copy_from_slice(values);
        Ok(())
    }

    /// Restore every cell to the default value
    pub fn reset(&mut self) {
        let value = self.default_value;
        self.values.fill(value);
    }

    /// Iterate `(address, value)` pairs in address order
    pub fn iter(&self) -> impl Iterator<Item = (u32, T)> + '_ {
        let base = self.base_address as u32;
        self.values
            .iter()
            .enumerate()
            .map(move |(i, &v)| (base + i as u32, v))
    }

    fn offset(&self, address: u16, count: usize) -> ModbusResult<usize> {
        if !self.validate(address, count) {
            return Err(ModbusError::OutOfRange {
                address,
                count,
                start: self.base_address,
                end: self.end_address(),
            });
        }
        Ok((address - self.base_address) as usize)
    }
}

impl<T: Copy + Default> Default for RegisterTable<T> {
    /// Base address 0 with 1024 default cells
    fn default() -> Self {
        Self::filled(0, DEFAULT_TABLE_SIZE, T::default())
    }
}

impl<T: fmt::Debug> fmt::Display for RegisterTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RegisterTable(base={}, len={}, default={:?})",
            self.base_address,
            self.values.len(),
            self.default_value
        )
    }
}

/// The four register tables of one server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataBank {
    pub coils: RegisterTable<bool>,
    pub discrete_inputs: RegisterTable<bool>,
    pub holding_registers: RegisterTable<u16>,
    pub input_registers: RegisterTable<u16>,
}

impl DataBank {
    pub fn new(
        coils: RegisterTable<bool>,
        discrete_inputs: RegisterTable<bool>,
        holding_registers: RegisterTable<u16>,
        input_registers: RegisterTable<u16>,
    ) -> Self {
        Self {
            coils,
            discrete_inputs,
            holding_registers,
            input_registers,
        }
    }

    /// Range check against the table of `kind`
    pub fn validate(&self, kind: RegisterKind, address: u16, count: usize) -> bool {
        match kind {
            RegisterKind::Coil => self.coils.validate(address, count),
            RegisterKind::DiscreteInput => self.discrete_inputs.validate(address, count),
            RegisterKind::HoldingRegister => self.holding_registers.validate(address, count),
            RegisterKind::InputRegister => self.input_registers.validate(address, count),
        }
    }

    /// Bit table for `kind`
    pub fn bits(&self, kind: RegisterKind) -> ModbusResult<&RegisterTable<bool>> {
        match kind {
            RegisterKind::Coil => Ok(&self.coils),
            RegisterKind::DiscreteInput => Ok(&self.discrete_inputs),
            _ => Err(ModbusError::invalid_data(format!("{kind} are not bit cells"))),
        }
    }

    /// Word table for `kind`
    pub fn words(&self, kind: RegisterKind) -> ModbusResult<&RegisterTable<u16>> {
        match kind {
            RegisterKind::HoldingRegister => Ok(&self.holding_registers),
            RegisterKind::InputRegister => Ok(&self.input_registers),
            _ => Err(ModbusError::invalid_data(format!("{kind} are not word cells"))),
        }
    }

    /// Restore all four tables to their default values
    pub fn reset(&mut self) {
        self.coils.reset();
        self.discrete_inputs.reset();
        self.holding_registers.reset();
        self.input_registers.reset();
    }
}
