//! Modbus TCP slave example
//!
//! Serves a small field list from memory: four coils, two holding
//! registers, a float and a device name string in the input registers.
//! Values written by masters are kept and logged.
//!
//! Usage: `slave [port] [seconds]`. Without `seconds` the slave runs until
//! killed.
//!
//! # Environment Variables
//!
//! - `MBS_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)
//! - `MBS_MAX_CONNECTIONS=<n>` - Concurrent masters
//! - `MBS_CLOSE_TIMEOUT_MS=<ms>` - Shutdown timeout

use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use mbsafe::{
    init_logging, kerror, kinfo, DataType, Field, FieldHandler, FieldProcessor, FieldValue,
    ModbusSlave, RegisterType, SessionConfig, SlaveError,
};

struct Memory {
    values: HashMap<(RegisterType, u16), FieldValue>,
}

impl FieldHandler for Memory {
    fn connect(&mut self) -> Result<(), SlaveError> {
        kinfo!("First master connected");
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), SlaveError> {
        kinfo!("No masters left");
        Ok(())
    }

    fn read(&mut self, field: &Field) -> Result<Option<FieldValue>, SlaveError> {
        Ok(self.values.get(&(field.register_type, field.address)).cloned())
    }

    fn write(&mut self, field: &Field, value: FieldValue) -> Result<(), SlaveError> {
        kinfo!("{:?} at {} = {:?}", field.register_type, field.address, value);
        self.values.insert((field.register_type, field.address), value);
        Ok(())
    }
}

fn fields() -> (Vec<Field>, Memory) {
    let fields = vec![
        Field::new(RegisterType::Coils, DataType::Boolean, 0, 4),
        Field::new(RegisterType::HoldingRegisters, DataType::UShort, 0, 2),
        Field::new(RegisterType::HoldingRegisters, DataType::Float, 2, 2),
        Field::new(RegisterType::InputRegisters, DataType::String, 0, 8),
    ];
    let mut values = HashMap::new();
    values.insert((RegisterType::Coils, 0), FieldValue::Booleans(vec![true, false, true, false]));
    values.insert((RegisterType::HoldingRegisters, 0), FieldValue::UShorts(vec![100, 200]));
    values.insert((RegisterType::HoldingRegisters, 2), FieldValue::Floats(vec![21.5]));
    values.insert((RegisterType::InputRegisters, 0), FieldValue::String("mbsafe-slave".into()));
    (fields, Memory { values })
}

// MBS_LOG_LEVEL=debug cargo run -p mbsafe-slave -- 1502 30
fn main() {
    init_logging();
    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(1502);
    let seconds: Option<u64> = args.get(2).and_then(|s| s.parse().ok());

    println!("=== mbsafe slave ===\n");
    let config = SessionConfig::from_env();
    config.print();
    let close_timeout = config.close_timeout;

    let (fields, memory) = fields();
    let mut slave = ModbusSlave::with_config(FieldProcessor::new(fields, memory), config);
    match slave.open(port) {
        Ok(bound) => kinfo!("Listening on port {}", bound),
        Err(e) => {
            kerror!("Cannot open slave: {}", e);
            std::process::exit(1);
        }
    }

    if let Some(seconds) = seconds {
        let handle = slave.handle();
        thread::spawn(move || {
            thread::sleep(Duration::from_secs(seconds));
            if let Err(e) = handle.close(close_timeout) {
                kerror!("Cannot close slave: {}", e);
            }
        });
    }

    if let Err(e) = slave.run() {
        kerror!("Slave failed: {}", e);
        std::process::exit(1);
    }
    println!("\n=== Slave Stopped ===");
}
