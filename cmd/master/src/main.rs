//! Modbus TCP master example
//!
//! Connects to a slave, reads a block of holding registers, writes one
//! register back and reads it again. Two threads share the session; each
//! read-modify-write runs under the session lock.
//!
//! Usage: `master [host] [port] [address] [count]`
//!
//! # Environment Variables
//!
//! - `MBS_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)
//! - `MBS_DEBUG=1` - Dump request/response frames
//! - `MBS_SLAVE_ID=<id>` - Unit id to address
//! - `MBS_RESPONSE_TIMEOUT_MS=<ms>` - Response timeout

use std::sync::Arc;
use std::thread;

use mbsafe::{init_logging, kerror, kinfo, ModbusError, ModbusTcpPi, SessionConfig};

fn arg<T: std::str::FromStr>(args: &[String], index: usize, default: T) -> T {
    args.get(index).and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn run(host: &str, port: u16, address: u16, count: u16) -> Result<(), ModbusError> {
    let config = SessionConfig::from_env();
    config.print();

    let session = Arc::new(ModbusTcpPi::with_config(host, &port.to_string(), &config)?);
    let fd = session.connect()?;
    kinfo!("Connected to {}:{} (fd {})", host, port, fd);

    let mut regs = vec![0u16; count as usize];
    session.read_registers(address, &mut regs)?;
    println!("registers {}..{}: {:?}", address, address as usize + regs.len(), regs);

    // two workers incrementing the same register; the lock keeps each
    // read-modify-write whole
    let workers: Vec<_> = (0..2)
        .map(|id| {
            let session = Arc::clone(&session);
            thread::spawn(move || -> Result<(), ModbusError> {
                for _ in 0..5 {
                    session.with_lock(|s| {
                        let mut value = [0u16; 1];
                        s.read_registers(address, &mut value)?;
                        s.write_register(address, value[0].wrapping_add(1))
                    })??;
                }
                kinfo!("Worker {} done", id);
                Ok(())
            })
        })
        .collect();
    for worker in workers {
        match worker.join() {
            Ok(result) => result?,
            Err(_) => kerror!("Worker panicked"),
        }
    }

    session.read_registers(address, &mut regs)?;
    println!("registers {}..{}: {:?}", address, address as usize + regs.len(), regs);

    session.close()?;
    Ok(())
}

// MBS_LOG_LEVEL=info cargo run -p mbsafe-master -- 127.0.0.1 1502 0 4
fn main() {
    init_logging();
    let args: Vec<String> = std::env::args().collect();
    let host = args.get(1).map(String::as_str).unwrap_or("127.0.0.1");
    let port = arg(&args, 2, 1502u16);
    let address = arg(&args, 3, 0u16);
    let count = arg(&args, 4, 4u16).max(1);

    println!("=== mbsafe master ===\n");
    if let Err(e) = run(host, port, address, count) {
        kerror!("Master failed: {}", e);
        std::process::exit(1);
    }
    println!("\n=== Master Complete ===");
}
