//! Typed fields served from mapping tables
//!
//! A [`Field`] names a run of cells in one of the four Modbus tables and how
//! to interpret them. [`encode_field`] and [`decode_field`] convert between a
//! [`FieldValue`] and the raw cells:
//!
//! | data type | table     | cells per value                          |
//! |-----------|-----------|------------------------------------------|
//! | Boolean   | bits      | 1                                        |
//! | Byte      | registers | 1 per 2 bytes, high byte first           |
//! | Short     | registers | 1                                        |
//! | UShort    | registers | 1                                        |
//! | Float     | registers | 2, high word first                       |
//! | String    | registers | UTF-8 bytes, 2 per register, zero padded |
//!
//! [`FieldProcessor`] turns an ordered field list plus a [`FieldHandler`]
//! into a [`SlaveProcessor`].

use std::sync::atomic::{AtomicU16, AtomicU8};
use std::time::SystemTime;

use mbsafe_core::codes::FunctionCode;
use mbsafe_core::mapping::{load_bits, load_registers, store_bits, store_registers, Mapping};
use mbsafe_core::values::{get_float, set_float};
use mbsafe_core::{exception, kdebug};

use crate::slave::{SlaveError, SlaveProcessor};

/// One of the four Modbus data tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterType {
    Coils,
    DiscreteInputs,
    HoldingRegisters,
    InputRegisters,
}

impl RegisterType {
    /// Table addressed by a function code.
    pub fn for_function(function: FunctionCode) -> Option<Self> {
        use FunctionCode::*;
        match function {
            ReadCoils | WriteSingleCoil | WriteMultipleCoils => Some(RegisterType::Coils),
            ReadDiscreteInputs => Some(RegisterType::DiscreteInputs),
            ReadHoldingRegisters | WriteSingleRegister | WriteMultipleRegisters => {
                Some(RegisterType::HoldingRegisters)
            }
            ReadInputRegisters => Some(RegisterType::InputRegisters),
            WriteAndReadRegisters => None,
        }
    }

    #[inline]
    pub fn is_bit_table(self) -> bool {
        matches!(self, RegisterType::Coils | RegisterType::DiscreteInputs)
    }

    pub fn read_function(self) -> FunctionCode {
        match self {
            RegisterType::Coils => FunctionCode::ReadCoils,
            RegisterType::DiscreteInputs => FunctionCode::ReadDiscreteInputs,
            RegisterType::HoldingRegisters => FunctionCode::ReadHoldingRegisters,
            RegisterType::InputRegisters => FunctionCode::ReadInputRegisters,
        }
    }

    /// Only coils and holding registers are writable.
    pub fn accepts_write(self, function: FunctionCode) -> bool {
        matches!(
            (self, function),
            (RegisterType::Coils, FunctionCode::WriteSingleCoil | FunctionCode::WriteMultipleCoils)
                | (
                    RegisterType::HoldingRegisters,
                    FunctionCode::WriteSingleRegister | FunctionCode::WriteMultipleRegisters
                )
        )
    }

    fn description(self) -> &'static str {
        match self {
            RegisterType::Coils => "coil",
            RegisterType::DiscreteInputs => "discrete input",
            RegisterType::HoldingRegisters => "holding register",
            RegisterType::InputRegisters => "input register",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Boolean,
    Byte,
    Short,
    UShort,
    Float,
    String,
}

impl DataType {
    /// Whether values of this type can live in the given table.
    pub fn fits(self, table: RegisterType) -> bool {
        (self == DataType::Boolean) == table.is_bit_table()
    }
}

/// Decoded field contents
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Booleans(Vec<bool>),
    Bytes(Vec<u8>),
    Shorts(Vec<i16>),
    UShorts(Vec<u16>),
    Floats(Vec<f32>),
    String(String),
}

impl FieldValue {
    pub fn data_type(&self) -> DataType {
        match self {
            FieldValue::Booleans(_) => DataType::Boolean,
            FieldValue::Bytes(_) => DataType::Byte,
            FieldValue::Shorts(_) => DataType::Short,
            FieldValue::UShorts(_) => DataType::UShort,
            FieldValue::Floats(_) => DataType::Float,
            FieldValue::String(_) => DataType::String,
        }
    }
}

/// A run of `quantity` cells starting at `address`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub register_type: RegisterType,
    pub data_type: DataType,
    pub address: u16,
    pub quantity: u16,
}

impl Field {
    pub fn new(register_type: RegisterType, data_type: DataType, address: u16, quantity: u16) -> Self {
        Self {
            register_type,
            data_type,
            address,
            quantity,
        }
    }

    /// First address past the field.
    #[inline]
    pub fn end(&self) -> usize {
        self.address as usize + self.quantity as usize
    }

    /// Whether `[address, address + quantity)` shares a cell with the field.
    pub fn overlaps(&self, address: u16, quantity: u16) -> bool {
        (address as usize) < self.end() && (self.address as usize) < address as usize + quantity as usize
    }
}

enum Table<'a> {
    Bits(&'a [AtomicU8]),
    Registers(&'a [AtomicU16]),
}

impl<'a> Table<'a> {
    fn of(mapping: &'a Mapping, register_type: RegisterType) -> Self {
        match register_type {
            RegisterType::Coils => Table::Bits(mapping.bits()),
            RegisterType::DiscreteInputs => Table::Bits(mapping.input_bits()),
            RegisterType::HoldingRegisters => Table::Registers(mapping.registers()),
            RegisterType::InputRegisters => Table::Registers(mapping.input_registers()),
        }
    }

    fn len(&self) -> usize {
        match self {
            Table::Bits(t) => t.len(),
            Table::Registers(t) => t.len(),
        }
    }
}

fn check_range(table: &Table<'_>, field: &Field) -> Result<(), SlaveError> {
    if field.end() > table.len() {
        kdebug!(
            "{}: invalid address {} (table size {})",
            field.register_type.description(),
            field.end(),
            table.len()
        );
        return Err(SlaveError::IllegalDataAddress);
    }
    Ok(())
}

fn unsupported(field: &Field) -> SlaveError {
    let supported = if field.register_type.is_bit_table() {
        "BOOLEAN"
    } else {
        "BYTE, SHORT, USHORT, FLOAT, STRING"
    };
    SlaveError::Backend(exception!(
        "Unknown data type for {} at address {}: {:?} (supported: {})",
        field.register_type.description(),
        field.address,
        field.data_type,
        supported
    ))
}

fn mismatch(field: &Field, value: &FieldValue) -> SlaveError {
    SlaveError::Backend(exception!(
        "Value of type {:?} does not match field at address {} of type {:?}",
        value.data_type(),
        field.address,
        field.data_type
    ))
}

/// Padded or truncated to `n` with `T::default()`.
fn fit<T: Copy + Default>(values: &[T], n: usize) -> Vec<T> {
    let mut out: Vec<T> = values.iter().copied().take(n).collect();
    out.resize(n, T::default());
    out
}

fn bytes_to_registers(bytes: &[u8], quantity: usize) -> Vec<u16> {
    let bytes = fit(bytes, quantity * 2);
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
    registers.iter().flat_map(|r| r.to_be_bytes()).collect()
}

/// Write `value` into the field's cells of `mapping`. `None` writes zeros.
pub fn encode_field(mapping: &Mapping, field: &Field, value: Option<&FieldValue>) -> Result<(), SlaveError> {
    if !field.data_type.fits(field.register_type) {
        return Err(unsupported(field));
    }
    if let Some(value) = value {
        if value.data_type() != field.data_type {
            return Err(mismatch(field, value));
        }
    }

    let table = Table::of(mapping, field.register_type);
    check_range(&table, field)?;
    let start = field.address as usize;
    let n = field.quantity as usize;

    match table {
        Table::Bits(bits) => {
            let values = match value {
                Some(FieldValue::Booleans(v)) => fit(v, n),
                _ => vec![false; n],
            };
            store_bits(bits, start, &values);
        }
        Table::Registers(registers) => {
            let values = match value {
                None => vec![0u16; n],
                Some(FieldValue::Bytes(v)) => bytes_to_registers(v, n),
                Some(FieldValue::Shorts(v)) => {
                    fit(v, n).into_iter().map(|s| s as u16).collect()
                }
                Some(FieldValue::UShorts(v)) => fit(v, n),
                Some(FieldValue::Floats(v)) => {
                    let mut out = vec![0u16; n];
                    for (chunk, &f) in out.chunks_exact_mut(2).zip(v.iter()) {
                        set_float(f, chunk);
                    }
                    out
                }
                Some(FieldValue::String(s)) => bytes_to_registers(s.as_bytes(), n),
                Some(FieldValue::Booleans(_)) => return Err(unsupported(field)),
            };
            store_registers(registers, start, &values);
        }
    }
    Ok(())
}

/// Read the field's cells of `mapping` back into a value.
pub fn decode_field(mapping: &Mapping, field: &Field) -> Result<FieldValue, SlaveError> {
    if !field.data_type.fits(field.register_type) {
        return Err(unsupported(field));
    }
    let table = Table::of(mapping, field.register_type);
    check_range(&table, field)?;
    let start = field.address as usize;
    let n = field.quantity as usize;

    let registers = match table {
        Table::Bits(bits) => return Ok(FieldValue::Booleans(load_bits(bits, start, n))),
        Table::Registers(registers) => load_registers(registers, start, n),
    };

    Ok(match field.data_type {
        DataType::Byte => FieldValue::Bytes(registers_to_bytes(&registers)),
        DataType::Short => FieldValue::Shorts(registers.iter().map(|&r| r as i16).collect()),
        DataType::UShort => FieldValue::UShorts(registers),
        DataType::Float => FieldValue::Floats(registers.chunks_exact(2).map(get_float).collect()),
        DataType::String => {
            let mut bytes = registers_to_bytes(&registers);
            while bytes.last() == Some(&0) {
                bytes.pop();
            }
            FieldValue::String(String::from_utf8_lossy(&bytes).into_owned())
        }
        DataType::Boolean => return Err(unsupported(field)),
    })
}

/// Mapping with only `register_type`'s table, `len` cells long.
fn scratch_mapping(register_type: RegisterType, len: usize) -> Mapping {
    match register_type {
        RegisterType::Coils => Mapping::new(len, 0, 0, 0),
        RegisterType::DiscreteInputs => Mapping::new(0, len, 0, 0),
        RegisterType::HoldingRegisters => Mapping::new(0, 0, len, 0),
        RegisterType::InputRegisters => Mapping::new(0, 0, 0, len),
    }
}

/// Copy cells `[start, end)` of one table between mappings, clipped to both.
fn copy_cells(register_type: RegisterType, from: &Mapping, to: &Mapping, start: usize, end: usize) {
    match (Table::of(from, register_type), Table::of(to, register_type)) {
        (Table::Bits(src), Table::Bits(dst)) => {
            let end = end.min(src.len()).min(dst.len());
            if start < end {
                store_bits(dst, start, &load_bits(src, start, end - start));
            }
        }
        (Table::Registers(src), Table::Registers(dst)) => {
            let end = end.min(src.len()).min(dst.len());
            if start < end {
                store_registers(dst, start, &load_registers(src, start, end - start));
            }
        }
        _ => {}
    }
}

/// Application side of a [`FieldProcessor`]
pub trait FieldHandler: Send {
    fn connect(&mut self) -> Result<(), SlaveError> {
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), SlaveError> {
        Ok(())
    }

    /// Current value of `field`. `None` is served as zeros.
    fn read(&mut self, field: &Field) -> Result<Option<FieldValue>, SlaveError>;

    /// New value of `field` after a master wrote some of its cells.
    fn write(&mut self, field: &Field, value: FieldValue) -> Result<(), SlaveError>;
}

/// Serves an ordered list of fields through a [`FieldHandler`].
pub struct FieldProcessor<H: FieldHandler> {
    fields: Vec<Field>,
    handler: H,
}

impl<H: FieldHandler> FieldProcessor<H> {
    pub fn new(fields: Vec<Field>, handler: H) -> Self {
        Self { fields, handler }
    }

    pub fn set_fields(&mut self, fields: Vec<Field>) {
        self.fields = fields;
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// End address of the last field, 0 without fields.
    pub fn size(&self) -> usize {
        self.fields.last().map_or(0, Field::end)
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    fn table_end(&self, register_type: RegisterType) -> Option<usize> {
        self.fields
            .iter()
            .filter(|f| f.register_type == register_type)
            .map(Field::end)
            .max()
    }
}

impl<H: FieldHandler> SlaveProcessor for FieldProcessor<H> {
    fn connect(&mut self) -> Result<(), SlaveError> {
        self.handler.connect()
    }

    fn disconnect(&mut self) -> Result<(), SlaveError> {
        self.handler.disconnect()
    }

    fn read(
        &mut self,
        _unit_id: u8,
        function: FunctionCode,
        address: u16,
        quantity: u16,
        mapping: &Mapping,
    ) -> Result<(), SlaveError> {
        if self.fields.is_empty() {
            return Err(SlaveError::IllegalDataAddress);
        }
        let register_type = RegisterType::for_function(function).ok_or(SlaveError::IllegalFunction)?;
        let table_end = self.table_end(register_type).ok_or(SlaveError::IllegalFunction)?;
        let end = address as usize + quantity as usize;
        if end > table_end {
            return Err(SlaveError::IllegalDataAddress);
        }

        for field in self.fields.iter().filter(|f| f.register_type == register_type) {
            if !field.overlaps(address, quantity) {
                continue;
            }
            let value = self.handler.read(field)?;
            let scratch = scratch_mapping(register_type, field.end());
            encode_field(&scratch, field, value.as_ref())?;
            copy_cells(
                register_type,
                &scratch,
                mapping,
                address.max(field.address) as usize,
                end.min(field.end()),
            );
        }
        Ok(())
    }

    fn write(
        &mut self,
        _unit_id: u8,
        function: FunctionCode,
        address: u16,
        quantity: u16,
        _timestamp: SystemTime,
        mapping: &Mapping,
    ) -> Result<(), SlaveError> {
        let register_type = RegisterType::for_function(function)
            .filter(|t| t.accepts_write(function))
            .ok_or(SlaveError::IllegalFunction)?;
        let end = address as usize + quantity as usize;

        let mut touched = false;
        for field in self.fields.iter().filter(|f| f.register_type == register_type) {
            if !field.overlaps(address, quantity) {
                continue;
            }
            touched = true;
            // unwritten cells of the field keep their current value
            let current = self.handler.read(field)?;
            let scratch = scratch_mapping(register_type, field.end());
            encode_field(&scratch, field, current.as_ref())?;
            copy_cells(
                register_type,
                mapping,
                &scratch,
                address.max(field.address) as usize,
                end.min(field.end()),
            );
            let value = decode_field(&scratch, field)?;
            self.handler.write(field, value)?;
        }

        if touched {
            Ok(())
        } else {
            Err(SlaveError::IllegalDataAddress)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_register_type_for_function() {
        assert_eq!(RegisterType::for_function(FunctionCode::ReadCoils), Some(RegisterType::Coils));
        assert_eq!(RegisterType::for_function(FunctionCode::WriteMultipleCoils), Some(RegisterType::Coils));
        assert_eq!(
            RegisterType::for_function(FunctionCode::ReadDiscreteInputs),
            Some(RegisterType::DiscreteInputs)
        );
        assert_eq!(
            RegisterType::for_function(FunctionCode::WriteSingleRegister),
            Some(RegisterType::HoldingRegisters)
        );
        assert_eq!(RegisterType::for_function(FunctionCode::WriteAndReadRegisters), None);

        assert!(RegisterType::Coils.accepts_write(FunctionCode::WriteSingleCoil));
        assert!(!RegisterType::Coils.accepts_write(FunctionCode::WriteSingleRegister));
        assert!(!RegisterType::InputRegisters.accepts_write(FunctionCode::WriteMultipleRegisters));
        assert_eq!(RegisterType::InputRegisters.read_function(), FunctionCode::ReadInputRegisters);
    }

    #[test]
    fn test_field_overlap() {
        let f = Field::new(RegisterType::HoldingRegisters, DataType::UShort, 10, 4);
        assert_eq!(f.end(), 14);
        assert!(f.overlaps(13, 1));
        assert!(f.overlaps(8, 3));
        assert!(!f.overlaps(14, 2));
        assert!(!f.overlaps(6, 4));
    }

    #[test]
    fn test_encode_registers() {
        let m = Mapping::new(0, 0, 16, 0);

        let bytes = Field::new(RegisterType::HoldingRegisters, DataType::Byte, 0, 2);
        encode_field(&m, &bytes, Some(&FieldValue::Bytes(vec![0x12, 0x34, 0x56]))).unwrap();
        assert_eq!(m.get_register(0), Some(0x1234));
        assert_eq!(m.get_register(1), Some(0x5600));

        let shorts = Field::new(RegisterType::HoldingRegisters, DataType::Short, 2, 2);
        encode_field(&m, &shorts, Some(&FieldValue::Shorts(vec![-1]))).unwrap();
        assert_eq!(m.get_register(2), Some(0xFFFF));
        assert_eq!(m.get_register(3), Some(0));

        let float = Field::new(RegisterType::HoldingRegisters, DataType::Float, 4, 2);
        encode_field(&m, &float, Some(&FieldValue::Floats(vec![1.0]))).unwrap();
        assert_eq!(m.get_register(4), Some(0x3F80));
        assert_eq!(m.get_register(5), Some(0x0000));

        let text = Field::new(RegisterType::HoldingRegisters, DataType::String, 6, 3);
        encode_field(&m, &text, Some(&FieldValue::String("abc".into()))).unwrap();
        assert_eq!(m.get_register(6), Some(u16::from_be_bytes(*b"ab")));
        assert_eq!(m.get_register(7), Some(u16::from_be_bytes([b'c', 0])));
        assert_eq!(m.get_register(8), Some(0));
        assert_eq!(decode_field(&m, &text).unwrap(), FieldValue::String("abc".into()));
        assert_eq!(decode_field(&m, &float).unwrap(), FieldValue::Floats(vec![1.0]));
        assert_eq!(decode_field(&m, &shorts).unwrap(), FieldValue::Shorts(vec![-1, 0]));
    }

    #[test]
    fn test_encode_none_writes_zeros() {
        let m = Mapping::new(4, 0, 0, 0);
        for i in 0..4 {
            m.set_bit(i, true).unwrap();
        }
        let f = Field::new(RegisterType::Coils, DataType::Boolean, 1, 2);
        encode_field(&m, &f, None).unwrap();
        assert_eq!(
            (0..4).map(|i| m.get_bit(i).unwrap()).collect::<Vec<_>>(),
            vec![true, false, false, true]
        );
    }

    #[test]
    fn test_encode_errors() {
        let m = Mapping::new(4, 0, 4, 0);

        let too_long = Field::new(RegisterType::HoldingRegisters, DataType::UShort, 3, 2);
        assert_eq!(encode_field(&m, &too_long, None), Err(SlaveError::IllegalDataAddress));
        assert_eq!(decode_field(&m, &too_long), Err(SlaveError::IllegalDataAddress));

        let float_coil = Field::new(RegisterType::Coils, DataType::Float, 0, 2);
        assert!(matches!(encode_field(&m, &float_coil, None), Err(SlaveError::Backend(_))));

        let bool_register = Field::new(RegisterType::HoldingRegisters, DataType::Boolean, 0, 1);
        assert!(matches!(decode_field(&m, &bool_register), Err(SlaveError::Backend(_))));

        let shorts = Field::new(RegisterType::HoldingRegisters, DataType::Short, 0, 1);
        let wrong = FieldValue::UShorts(vec![1]);
        assert!(matches!(encode_field(&m, &shorts, Some(&wrong)), Err(SlaveError::Backend(_))));
    }

    #[derive(Default)]
    struct Store {
        values: HashMap<u16, FieldValue>,
        writes: Vec<(u16, FieldValue)>,
    }

    impl FieldHandler for Store {
        fn read(&mut self, field: &Field) -> Result<Option<FieldValue>, SlaveError> {
            Ok(self.values.get(&field.address).cloned())
        }

        fn write(&mut self, field: &Field, value: FieldValue) -> Result<(), SlaveError> {
            self.values.insert(field.address, value.clone());
            self.writes.push((field.address, value));
            Ok(())
        }
    }

    fn processor() -> FieldProcessor<Store> {
        let fields = vec![
            Field::new(RegisterType::Coils, DataType::Boolean, 0, 4),
            Field::new(RegisterType::HoldingRegisters, DataType::UShort, 0, 2),
            Field::new(RegisterType::HoldingRegisters, DataType::Float, 2, 2),
            Field::new(RegisterType::InputRegisters, DataType::String, 0, 4),
        ];
        let mut store = Store::default();
        store.values.insert(0, FieldValue::UShorts(vec![7, 8]));
        store.values.insert(2, FieldValue::Floats(vec![2.5]));
        FieldProcessor::new(fields, store)
    }

    #[test]
    fn test_read_copies_overlap_only() {
        let mut p = processor();
        assert_eq!(p.size(), 4);

        // request starts inside the first register field
        let m = Mapping::new(0, 0, 4, 0);
        p.read(1, FunctionCode::ReadHoldingRegisters, 1, 3, &m).unwrap();
        assert_eq!(m.get_register(0), Some(0));
        assert_eq!(m.get_register(1), Some(8));
        let mut pair = [0u16; 2];
        pair[0] = m.get_register(2).unwrap();
        pair[1] = m.get_register(3).unwrap();
        assert_eq!(get_float(&pair), 2.5);
    }

    #[test]
    fn test_read_errors() {
        let mut p = processor();
        let m = Mapping::new(0, 0, 0, 0);
        assert_eq!(
            p.read(1, FunctionCode::ReadHoldingRegisters, 3, 2, &m),
            Err(SlaveError::IllegalDataAddress)
        );
        assert_eq!(
            p.read(1, FunctionCode::ReadDiscreteInputs, 0, 1, &m),
            Err(SlaveError::IllegalFunction)
        );

        let mut empty = FieldProcessor::new(Vec::new(), Store::default());
        assert_eq!(empty.size(), 0);
        assert_eq!(
            empty.read(1, FunctionCode::ReadCoils, 0, 1, &m),
            Err(SlaveError::IllegalDataAddress)
        );
    }

    #[test]
    fn test_write_merges_with_current_value() {
        let mut p = processor();
        let m = Mapping::new(0, 0, 2, 0);
        m.set_register(1, 99).unwrap();
        p.write(1, FunctionCode::WriteSingleRegister, 1, 1, SystemTime::now(), &m)
            .unwrap();
        assert_eq!(p.handler().writes, vec![(0, FieldValue::UShorts(vec![7, 99]))]);
    }

    #[test]
    fn test_write_coils_and_rejects_read_only_tables() {
        let mut p = processor();
        let m = Mapping::new(4, 0, 0, 0);
        m.set_bit(2, true).unwrap();
        m.set_bit(3, true).unwrap();
        p.write(1, FunctionCode::WriteMultipleCoils, 2, 2, SystemTime::now(), &m)
            .unwrap();
        assert_eq!(
            p.handler().writes,
            vec![(0, FieldValue::Booleans(vec![false, false, true, true]))]
        );

        assert_eq!(
            p.write(1, FunctionCode::ReadInputRegisters, 0, 1, SystemTime::now(), &m),
            Err(SlaveError::IllegalFunction)
        );
        assert_eq!(
            p.write(1, FunctionCode::WriteSingleCoil, 9, 1, SystemTime::now(), &m),
            Err(SlaveError::IllegalDataAddress)
        );
    }
}
