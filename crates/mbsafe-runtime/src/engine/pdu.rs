//! Protocol data units: serving requests, building requests, checking responses
//!
//! Every slice here starts at the function code and excludes the transport
//! header and checksum.

use mbsafe_core::codes::{ErrorCode, ExceptionCode, FunctionCode};
use mbsafe_core::constants::*;
use mbsafe_core::error::EngineResult;
use mbsafe_core::mapping::{load_bits, load_registers, store_bits, store_registers, Mapping};
use mbsafe_core::values::{get_int16_from_int8, pack_bits, unpack_bits};

/// Which side of an exchange a frame belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    /// Request received by a server
    Indication,
    /// Response received by a client
    Confirmation,
}

/// Bytes following the function code that must arrive before the data
/// length is known.
pub fn meta_length(kind: MsgKind, function: u8) -> usize {
    match kind {
        MsgKind::Indication => match FunctionCode::from_u8(function) {
            Some(fc) if fc.is_read() => 4,
            Some(FunctionCode::WriteSingleCoil) | Some(FunctionCode::WriteSingleRegister) => 4,
            Some(FunctionCode::WriteMultipleCoils) | Some(FunctionCode::WriteMultipleRegisters) => 5,
            Some(FunctionCode::WriteAndReadRegisters) => 9,
            _ => 0,
        },
        MsgKind::Confirmation => {
            if function & 0x80 != 0 {
                return 1;
            }
            match FunctionCode::from_u8(function) {
                Some(fc) if fc.is_read() => 1,
                Some(FunctionCode::WriteAndReadRegisters) => 1,
                Some(_) => 4,
                None => 0,
            }
        }
    }
}

/// Remaining data bytes, given the function code and its meta bytes.
pub fn data_length(kind: MsgKind, pdu: &[u8]) -> usize {
    let function = pdu[0];
    match kind {
        MsgKind::Indication => match FunctionCode::from_u8(function) {
            Some(FunctionCode::WriteMultipleCoils) | Some(FunctionCode::WriteMultipleRegisters) => {
                pdu[5] as usize
            }
            Some(FunctionCode::WriteAndReadRegisters) => pdu[9] as usize,
            _ => 0,
        },
        MsgKind::Confirmation => {
            if function & 0x80 != 0 {
                return 0;
            }
            match FunctionCode::from_u8(function) {
                Some(fc) if fc.is_read() => pdu[1] as usize,
                Some(FunctionCode::WriteAndReadRegisters) => pdu[1] as usize,
                _ => 0,
            }
        }
    }
}

fn field(pdu: &[u8], index: usize) -> Result<u16, ExceptionCode> {
    if pdu.len() < index + 2 {
        return Err(ExceptionCode::IllegalDataValue);
    }
    Ok(get_int16_from_int8(pdu, index))
}

fn check_range(start: u16, nb: usize, table_len: usize) -> Result<usize, ExceptionCode> {
    let start = start as usize;
    if start + nb > table_len {
        return Err(ExceptionCode::IllegalDataAddress);
    }
    Ok(start)
}

fn check_quantity(nb: u16, max: usize) -> Result<usize, ExceptionCode> {
    let nb = nb as usize;
    if nb < 1 || nb > max {
        return Err(ExceptionCode::IllegalDataValue);
    }
    Ok(nb)
}

fn push_registers(rsp: &mut Vec<u8>, values: &[u16]) {
    rsp.push((values.len() * 2) as u8);
    for v in values {
        rsp.extend_from_slice(&v.to_be_bytes());
    }
}

fn parse_registers(data: &[u8], nb: usize) -> Result<Vec<u16>, ExceptionCode> {
    if data.len() < nb * 2 {
        return Err(ExceptionCode::IllegalDataValue);
    }
    Ok((0..nb).map(|i| get_int16_from_int8(data, i * 2)).collect())
}

/// Serve one request against `mapping`, returning the response PDU.
///
/// Writes are applied to the mapping in place before the response is built.
pub fn serve(pdu: &[u8], mapping: &Mapping) -> Result<Vec<u8>, ExceptionCode> {
    let function = *pdu.first().ok_or(ExceptionCode::IllegalFunction)?;
    let fc = FunctionCode::from_u8(function).ok_or(ExceptionCode::IllegalFunction)?;
    let addr = field(pdu, 1)?;
    let mut rsp = Vec::with_capacity(MODBUS_MAX_PDU_LENGTH);
    rsp.push(function);

    match fc {
        FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
            let table = if fc == FunctionCode::ReadCoils {
                mapping.bits()
            } else {
                mapping.input_bits()
            };
            let nb = check_quantity(field(pdu, 3)?, MODBUS_MAX_READ_BITS)?;
            let start = check_range(addr, nb, table.len())?;
            let packed = pack_bits(&load_bits(table, start, nb));
            rsp.push(packed.len() as u8);
            rsp.extend_from_slice(&packed);
        }
        FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
            let table = if fc == FunctionCode::ReadHoldingRegisters {
                mapping.registers()
            } else {
                mapping.input_registers()
            };
            let nb = check_quantity(field(pdu, 3)?, MODBUS_MAX_READ_REGISTERS)?;
            let start = check_range(addr, nb, table.len())?;
            push_registers(&mut rsp, &load_registers(table, start, nb));
        }
        FunctionCode::WriteSingleCoil => {
            let value = match field(pdu, 3)? {
                0xFF00 => true,
                0x0000 => false,
                _ => return Err(ExceptionCode::IllegalDataValue),
            };
            let start = check_range(addr, 1, mapping.nb_bits())?;
            store_bits(mapping.bits(), start, &[value]);
            rsp.extend_from_slice(&pdu[1..5]);
        }
        FunctionCode::WriteSingleRegister => {
            let value = field(pdu, 3)?;
            let start = check_range(addr, 1, mapping.nb_registers())?;
            store_registers(mapping.registers(), start, &[value]);
            rsp.extend_from_slice(&pdu[1..5]);
        }
        FunctionCode::WriteMultipleCoils => {
            let nb = check_quantity(field(pdu, 3)?, MODBUS_MAX_WRITE_BITS)?;
            let byte_count = *pdu.get(5).ok_or(ExceptionCode::IllegalDataValue)? as usize;
            if byte_count != nb.div_ceil(8) || pdu.len() < 6 + byte_count {
                return Err(ExceptionCode::IllegalDataValue);
            }
            let start = check_range(addr, nb, mapping.nb_bits())?;
            store_bits(mapping.bits(), start, &unpack_bits(&pdu[6..6 + byte_count], nb));
            rsp.extend_from_slice(&pdu[1..5]);
        }
        FunctionCode::WriteMultipleRegisters => {
            let nb = check_quantity(field(pdu, 3)?, MODBUS_MAX_WRITE_REGISTERS)?;
            let byte_count = *pdu.get(5).ok_or(ExceptionCode::IllegalDataValue)? as usize;
            if byte_count != nb * 2 {
                return Err(ExceptionCode::IllegalDataValue);
            }
            let values = parse_registers(&pdu[6..], nb)?;
            let start = check_range(addr, nb, mapping.nb_registers())?;
            store_registers(mapping.registers(), start, &values);
            rsp.extend_from_slice(&pdu[1..5]);
        }
        FunctionCode::WriteAndReadRegisters => {
            let nb_read = check_quantity(field(pdu, 3)?, MODBUS_MAX_WR_READ_REGISTERS)?;
            let write_addr = field(pdu, 5)?;
            let nb_write = check_quantity(field(pdu, 7)?, MODBUS_MAX_WR_WRITE_REGISTERS)?;
            let byte_count = *pdu.get(9).ok_or(ExceptionCode::IllegalDataValue)? as usize;
            if byte_count != nb_write * 2 {
                return Err(ExceptionCode::IllegalDataValue);
            }
            let values = parse_registers(&pdu[10..], nb_write)?;
            let read_start = check_range(addr, nb_read, mapping.nb_registers())?;
            let write_start = check_range(write_addr, nb_write, mapping.nb_registers())?;
            // write first, then read back
            store_registers(mapping.registers(), write_start, &values);
            push_registers(&mut rsp, &load_registers(mapping.registers(), read_start, nb_read));
        }
    }
    Ok(rsp)
}

/// Exception response PDU for a request with function code `function`.
pub fn exception_pdu(function: u8, exception: ExceptionCode) -> [u8; 2] {
    [function | 0x80, exception.as_u8()]
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// `function`, `addr`, `nb`: the common request prefix.
pub fn request_basis(function: FunctionCode, addr: u16, nb: u16) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(MODBUS_MAX_PDU_LENGTH);
    pdu.push(function.as_u8());
    pdu.extend_from_slice(&addr.to_be_bytes());
    pdu.extend_from_slice(&nb.to_be_bytes());
    pdu
}

pub fn write_bits_request(addr: u16, values: &[bool]) -> Vec<u8> {
    let mut pdu = request_basis(FunctionCode::WriteMultipleCoils, addr, values.len() as u16);
    let packed = pack_bits(values);
    pdu.push(packed.len() as u8);
    pdu.extend_from_slice(&packed);
    pdu
}

pub fn write_registers_request(addr: u16, values: &[u16]) -> Vec<u8> {
    let mut pdu = request_basis(FunctionCode::WriteMultipleRegisters, addr, values.len() as u16);
    pdu.push((values.len() * 2) as u8);
    for v in values {
        pdu.extend_from_slice(&v.to_be_bytes());
    }
    pdu
}

pub fn write_and_read_request(write_addr: u16, src: &[u16], read_addr: u16, nb_read: u16) -> Vec<u8> {
    let mut pdu = request_basis(FunctionCode::WriteAndReadRegisters, read_addr, nb_read);
    pdu.extend_from_slice(&write_addr.to_be_bytes());
    pdu.extend_from_slice(&(src.len() as u16).to_be_bytes());
    pdu.push((src.len() * 2) as u8);
    for v in src {
        pdu.extend_from_slice(&v.to_be_bytes());
    }
    pdu
}

/// Validate a response PDU against its request PDU.
///
/// Returns the quantity the response carries. Exception responses become
/// `ErrorCode::Exception`, anything inconsistent becomes `BadData`.
pub fn check_response(req: &[u8], rsp: &[u8]) -> EngineResult<usize> {
    let function = req[0];
    let rsp_function = *rsp.first().ok_or(ErrorCode::BadData)?;

    if rsp_function == function | 0x80 {
        let code = *rsp.get(1).ok_or(ErrorCode::BadData)?;
        return Err(match ExceptionCode::from_u8(code) {
            Some(exc) => ErrorCode::Exception(exc),
            None => ErrorCode::BadException,
        });
    }
    if rsp_function != function {
        return Err(ErrorCode::BadData);
    }

    let fc = FunctionCode::from_u8(function).ok_or(ErrorCode::BadData)?;
    let req_nb = get_int16_from_int8(req, 3) as usize;
    let (expected, got) = match fc {
        FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
            (req_nb.div_ceil(8), rsp[1] as usize)
        }
        FunctionCode::ReadHoldingRegisters
        | FunctionCode::ReadInputRegisters
        | FunctionCode::WriteAndReadRegisters => (req_nb, rsp[1] as usize / 2),
        FunctionCode::WriteMultipleCoils | FunctionCode::WriteMultipleRegisters => {
            (req_nb, get_int16_from_int8(rsp, 3) as usize)
        }
        FunctionCode::WriteSingleCoil | FunctionCode::WriteSingleRegister => {
            if rsp[1..5] != req[1..5] {
                return Err(ErrorCode::BadData);
            }
            (1, 1)
        }
    };
    if expected != got {
        return Err(ErrorCode::BadData);
    }
    Ok(match fc {
        FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => req_nb,
        _ => got,
    })
}

/// Register values of a read response (`fc`, byte count, values).
pub fn response_registers(rsp: &[u8], dest: &mut [u16]) {
    for (i, slot) in dest.iter_mut().enumerate() {
        *slot = get_int16_from_int8(rsp, 2 + i * 2);
    }
}

/// Bit values of a read response.
pub fn response_bits(rsp: &[u8], dest: &mut [bool]) {
    let bits = unpack_bits(&rsp[2..], dest.len());
    dest.copy_from_slice(&bits);
}
