//! Slave server loop over loopback TCP

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use mbsafe::{
    DataType, ErrorCode, ExceptionCode, Field, FieldHandler, FieldProcessor, FieldValue,
    FunctionCode, Mapping, ModbusError, ModbusSlave, ModbusTcpPi, RegisterType, RtuGateway,
    SessionConfig, SlaveError, SlaveProcessor,
};
use mbsafe::constants::MODBUS_TCP_MAX_ADU_LENGTH;

type Values = Arc<Mutex<HashMap<u16, FieldValue>>>;

struct SharedStore {
    values: Values,
}

impl FieldHandler for SharedStore {
    fn read(&mut self, field: &Field) -> Result<Option<FieldValue>, SlaveError> {
        Ok(self.values.lock().unwrap().get(&field.address).cloned())
    }

    fn write(&mut self, field: &Field, value: FieldValue) -> Result<(), SlaveError> {
        self.values.lock().unwrap().insert(field.address, value);
        Ok(())
    }
}

fn config() -> SessionConfig {
    SessionConfig::default()
        .max_connections(2)
        .response_timeout(Duration::from_secs(2))
}

/// Start `processor` on an ephemeral port; returns the port, the handle and
/// the loop thread.
fn start<P: SlaveProcessor + 'static>(
    processor: P,
) -> (u16, mbsafe::SlaveHandle, thread::JoinHandle<Result<(), SlaveError>>) {
    let mut slave = ModbusSlave::with_config(processor, config());
    let port = slave.open_on("127.0.0.1", 0).unwrap();
    let handle = slave.handle();
    let worker = thread::spawn(move || slave.run());
    (port, handle, worker)
}

fn master(port: u16) -> ModbusTcpPi {
    let client = ModbusTcpPi::with_config("127.0.0.1", &port.to_string(), &config()).unwrap();
    client.connect().unwrap();
    client
}

#[test]
fn test_field_slave_roundtrip() {
    let values: Values = Arc::default();
    values.lock().unwrap().insert(0, FieldValue::UShorts(vec![11, 22]));
    values.lock().unwrap().insert(10, FieldValue::Booleans(vec![true, false, true]));

    let fields = vec![
        Field::new(RegisterType::HoldingRegisters, DataType::UShort, 0, 2),
        Field::new(RegisterType::Coils, DataType::Boolean, 10, 3),
    ];
    let processor = FieldProcessor::new(fields, SharedStore { values: Arc::clone(&values) });
    let (port, handle, worker) = start(processor);

    let client = master(port);
    let mut regs = [0u16; 2];
    client.read_registers(0, &mut regs).unwrap();
    assert_eq!(regs, [11, 22]);

    let mut coils = [false; 3];
    client.read_bits(10, &mut coils).unwrap();
    assert_eq!(coils, [true, false, true]);

    client.write_register(1, 99).unwrap();
    // the processor sees the write after the response went out
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let current = values.lock().unwrap().get(&0).cloned();
        if current == Some(FieldValue::UShorts(vec![11, 99])) {
            break;
        }
        assert!(Instant::now() < deadline, "write never reached the handler: {:?}", current);
        thread::sleep(Duration::from_millis(5));
    }

    // past the last holding register field
    assert_eq!(
        client.read_registers(1, &mut regs),
        Err(ModbusError::Engine(ErrorCode::Exception(ExceptionCode::IllegalDataAddress)))
    );
    // no discrete input fields
    let mut inputs = [false; 1];
    assert_eq!(
        client.read_input_bits(0, &mut inputs),
        Err(ModbusError::Engine(ErrorCode::Exception(ExceptionCode::IllegalFunction)))
    );

    client.close().unwrap();
    handle.close(Duration::from_secs(3)).unwrap();
    assert!(worker.join().unwrap().is_ok());
    assert!(!handle.is_open());
}

#[derive(Default)]
struct Counting {
    connects: Arc<Mutex<(usize, usize)>>,
}

impl SlaveProcessor for Counting {
    fn connect(&mut self) -> Result<(), SlaveError> {
        self.connects.lock().unwrap().0 += 1;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), SlaveError> {
        self.connects.lock().unwrap().1 += 1;
        Ok(())
    }

    fn read(&mut self, _: u8, _: FunctionCode, _: u16, _: u16, mapping: &Mapping) -> Result<(), SlaveError> {
        for i in 0..mapping.nb_input_registers() {
            mapping.set_input_register(i, i as u16 * 2);
        }
        Ok(())
    }

    fn write(
        &mut self,
        _: u8,
        _: FunctionCode,
        _: u16,
        _: u16,
        _: SystemTime,
        _: &Mapping,
    ) -> Result<(), SlaveError> {
        Ok(())
    }
}

#[test]
fn test_processor_connects_once_and_close_handshake() {
    let processor = Counting::default();
    let connects = Arc::clone(&processor.connects);
    let (port, handle, worker) = start(processor);

    let first = master(port);
    let second = master(port);
    let mut regs = [0u16; 3];
    first.read_input_registers(2, &mut regs).unwrap();
    assert_eq!(regs, [4, 6, 8]);
    second.read_input_registers(0, &mut regs).unwrap();
    assert_eq!(regs, [0, 2, 4]);
    assert_eq!(*connects.lock().unwrap(), (1, 0));

    // the loop is idle in select; close must cancel it promptly
    let started = Instant::now();
    handle.close(Duration::from_secs(3)).unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(worker.join().unwrap().is_ok());
    assert_eq!(*connects.lock().unwrap(), (1, 1));

    // a second close is a no-op
    handle.close(Duration::from_millis(10)).unwrap();
}

#[test]
fn test_gateway_forwards_to_backend_session() {
    // backend device answering from its own mapping
    let backend = ModbusTcpPi::new_tcp_pi("127.0.0.1", "0").unwrap();
    let listener = backend.listen(1).unwrap();
    let backend_port = backend.local_addr(listener).unwrap().port();
    let device = backend.mapping_new(8, 0, 8, 0).unwrap();
    device.set_register(3, 0x1234);

    let backend = Arc::new(backend);
    let device_loop = {
        let backend = Arc::clone(&backend);
        let device = device.clone();
        thread::spawn(move || {
            let fd = backend.accept(listener).unwrap();
            backend.set_socket(Some(fd)).unwrap();
            let mut req = [0u8; MODBUS_TCP_MAX_ADU_LENGTH];
            loop {
                match backend.receive(&mut req) {
                    Ok(0) => continue,
                    Ok(n) => {
                        backend.reply(&req[..n], &device).unwrap();
                    }
                    Err(e) => return e,
                }
            }
        })
    };

    let upstream = Arc::new(master(backend_port));
    let (port, handle, worker) = start(RtuGateway::new(Arc::clone(&upstream)));

    let client = master(port);
    let mut regs = [0u16; 2];
    client.read_registers(3, &mut regs).unwrap();
    assert_eq!(regs, [0x1234, 0]);

    client.write_registers(5, &[7, 8]).unwrap();
    client.write_bit(2, true).unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while device.get_register(6) != Some(8) || device.get_bit(2) != Some(true) {
        assert!(Instant::now() < deadline, "writes never reached the device");
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(device.get_register(5), Some(7));

    // device-side exception comes back as the same exception
    assert_eq!(
        client.read_registers(7, &mut regs),
        Err(ModbusError::Engine(ErrorCode::Exception(ExceptionCode::IllegalDataAddress)))
    );

    client.close().unwrap();
    handle.close(Duration::from_secs(3)).unwrap();
    assert!(worker.join().unwrap().is_ok());

    upstream.close().unwrap();
    assert!(device_loop.join().unwrap().is_disconnect());
}

#[test]
fn test_close_right_after_start_never_hangs() {
    for _ in 0..20 {
        let (_port, handle, worker) = start(Counting::default());
        // races the loop's first wait; either side may win
        handle.close(Duration::from_secs(3)).unwrap();
        let _ = worker.join().unwrap();
        assert!(!handle.is_open());
    }
}
