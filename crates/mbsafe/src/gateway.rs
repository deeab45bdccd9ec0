//! TCP to serial gateway processor
//!
//! [`RtuGateway`] answers slave requests by forwarding them to a master
//! session, normally a shared [`ModbusRtu`](mbsafe_runtime::ModbusRtu) on a
//! serial line. The request's unit id becomes the serial slave id. Each
//! forwarded request runs under the session lock, so other threads using the
//! same session cannot slip a request in between `set_slave` and the
//! transfer.

use std::sync::Arc;
use std::time::SystemTime;

use mbsafe_core::codes::{ErrorCode, ExceptionCode, FunctionCode};
use mbsafe_core::error::ModbusError;
use mbsafe_core::exception::Exception;
use mbsafe_core::mapping::{load_bits, load_registers, store_bits, store_registers, Mapping};
use mbsafe_core::traits::ProtocolEngine;
use mbsafe_core::{exception, ktrace};
use mbsafe_runtime::ProtocolSession;

use crate::slave::{SlaveError, SlaveProcessor};

/// Forwards slave requests to a master session.
pub struct RtuGateway<E: ProtocolEngine> {
    session: Arc<ProtocolSession<E>>,
}

impl<E: ProtocolEngine> RtuGateway<E> {
    pub fn new(session: Arc<ProtocolSession<E>>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<ProtocolSession<E>> {
        &self.session
    }

    /// Run `f` for `unit_id` with the session lock held.
    fn forward<R>(
        &self,
        unit_id: u8,
        f: impl FnOnce(&ProtocolSession<E>) -> Result<R, ModbusError>,
    ) -> Result<R, SlaveError> {
        let result = self.session.with_lock(|session| {
            session.set_slave(unit_id)?;
            f(session)
        })?;
        result.map_err(slave_error)
    }
}

fn slave_error(err: ModbusError) -> SlaveError {
    match err {
        ModbusError::Engine(ErrorCode::Exception(ExceptionCode::IllegalFunction)) => {
            SlaveError::IllegalFunction
        }
        ModbusError::Engine(ErrorCode::Exception(ExceptionCode::IllegalDataAddress)) => {
            SlaveError::IllegalDataAddress
        }
        other => SlaveError::Backend(
            exception!("Serial request failed").with_cause(&Exception::from(other)),
        ),
    }
}

/// `[address, address + quantity)` must fit a table of `len` cells.
fn check_range(len: usize, address: u16, quantity: u16) -> Result<(usize, usize), SlaveError> {
    let start = address as usize;
    let count = quantity as usize;
    if start + count > len {
        return Err(SlaveError::IllegalDataAddress);
    }
    Ok((start, count))
}

impl<E: ProtocolEngine> SlaveProcessor for RtuGateway<E> {
    fn read(
        &mut self,
        unit_id: u8,
        function: FunctionCode,
        address: u16,
        quantity: u16,
        mapping: &Mapping,
    ) -> Result<(), SlaveError> {
        ktrace!("Forwarding {} to unit {}", function.name(), unit_id);
        match function {
            FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
                let table = if function == FunctionCode::ReadCoils {
                    mapping.bits()
                } else {
                    mapping.input_bits()
                };
                let (start, count) = check_range(table.len(), address, quantity)?;
                let mut bits = vec![false; count];
                self.forward(unit_id, |s| {
                    if function == FunctionCode::ReadCoils {
                        s.read_bits(address, &mut bits)
                    } else {
                        s.read_input_bits(address, &mut bits)
                    }
                })?;
                store_bits(table, start, &bits);
            }
            FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
                let table = if function == FunctionCode::ReadHoldingRegisters {
                    mapping.registers()
                } else {
                    mapping.input_registers()
                };
                let (start, count) = check_range(table.len(), address, quantity)?;
                let mut registers = vec![0u16; count];
                self.forward(unit_id, |s| {
                    if function == FunctionCode::ReadHoldingRegisters {
                        s.read_registers(address, &mut registers)
                    } else {
                        s.read_input_registers(address, &mut registers)
                    }
                })?;
                store_registers(table, start, &registers);
            }
            _ => return Err(SlaveError::IllegalFunction),
        }
        Ok(())
    }

    fn write(
        &mut self,
        unit_id: u8,
        function: FunctionCode,
        address: u16,
        quantity: u16,
        _timestamp: SystemTime,
        mapping: &Mapping,
    ) -> Result<(), SlaveError> {
        ktrace!("Forwarding {} to unit {}", function.name(), unit_id);
        match function {
            FunctionCode::WriteSingleCoil => {
                let (start, _) = check_range(mapping.nb_bits(), address, quantity)?;
                let value = mapping.get_bit(start).unwrap_or(false);
                self.forward(unit_id, |s| s.write_bit(address, value))
            }
            FunctionCode::WriteMultipleCoils => {
                let (start, count) = check_range(mapping.nb_bits(), address, quantity)?;
                let bits = load_bits(mapping.bits(), start, count);
                self.forward(unit_id, |s| s.write_bits(address, &bits).map(drop))
            }
            FunctionCode::WriteSingleRegister => {
                let (start, _) = check_range(mapping.nb_registers(), address, quantity)?;
                let value = mapping.get_register(start).unwrap_or(0);
                self.forward(unit_id, |s| s.write_register(address, value))
            }
            FunctionCode::WriteMultipleRegisters => {
                let (start, count) = check_range(mapping.nb_registers(), address, quantity)?;
                let registers = load_registers(mapping.registers(), start, count);
                self.forward(unit_id, |s| s.write_registers(address, &registers).map(drop))
            }
            _ => Err(SlaveError::IllegalFunction),
        }
    }
}
