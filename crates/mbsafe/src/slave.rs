//! Modbus TCP slave server loop
//!
//! [`ModbusSlave`] listens on a TCP-PI session, accepts up to
//! `max_connections` masters and answers their requests. The data itself
//! comes from a [`SlaveProcessor`]: for every request a mapping just large
//! enough for the addressed range is created, the processor fills it (reads)
//! or consumes it after the response went out (writes), and the mapping is
//! freed again.
//!
//! Shutdown is a handshake. [`SlaveHandle::close`] marks the slave as
//! stopping and closes the session, which cancels the loop's wait. The loop
//! acknowledges, disconnects the processor and returns, and `close` waits
//! for that acknowledgement up to a timeout before releasing the session.
//!
//! ```ignore
//! let mut slave = ModbusSlave::new(processor, 2);
//! slave.open(1502)?;
//! let handle = slave.handle();
//! let worker = std::thread::spawn(move || slave.run());
//! // ...
//! handle.close(Duration::from_secs(3))?;
//! worker.join().unwrap()?;
//! ```

use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use mbsafe_core::codes::{ExceptionCode, FunctionCode};
use mbsafe_core::constants::MODBUS_TCP_MAX_ADU_LENGTH;
use mbsafe_core::error::ModbusError;
use mbsafe_core::exception::Exception;
use mbsafe_core::kprint::{level_enabled, LogLevel};
use mbsafe_core::mapping::Mapping;
use mbsafe_core::values::get_int16_from_int8;
use mbsafe_core::{exception, kdebug, kerror, kinfo};
use mbsafe_runtime::{ModbusTcpPi, SessionConfig};

/// Failure reported by a [`SlaveProcessor`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlaveError {
    /// Answered with exception 1
    IllegalFunction,
    /// Answered with exception 2
    IllegalDataAddress,
    /// Anything else, answered with exception 4
    Backend(Exception),
}

impl SlaveError {
    /// Exception code sent to the master for this failure.
    pub fn exception_code(&self) -> ExceptionCode {
        match self {
            SlaveError::IllegalFunction => ExceptionCode::IllegalFunction,
            SlaveError::IllegalDataAddress => ExceptionCode::IllegalDataAddress,
            SlaveError::Backend(_) => ExceptionCode::SlaveOrServerFailure,
        }
    }
}

impl fmt::Display for SlaveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlaveError::IllegalFunction => write!(f, "ILLEGAL FUNCTION"),
            SlaveError::IllegalDataAddress => write!(f, "ILLEGAL DATA ADDRESS"),
            SlaveError::Backend(ex) => write!(f, "{}", ex),
        }
    }
}

impl std::error::Error for SlaveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SlaveError::Backend(ex) => Some(ex),
            _ => None,
        }
    }
}

impl From<Exception> for SlaveError {
    fn from(ex: Exception) -> Self {
        SlaveError::Backend(ex)
    }
}

impl From<ModbusError> for SlaveError {
    fn from(err: ModbusError) -> Self {
        SlaveError::Backend(Exception::from(err))
    }
}

/// Data source behind a [`ModbusSlave`]
pub trait SlaveProcessor: Send {
    /// Called when the first master connects.
    fn connect(&mut self) -> Result<(), SlaveError> {
        Ok(())
    }

    /// Called when the last master is gone and when the slave stops.
    fn disconnect(&mut self) -> Result<(), SlaveError> {
        Ok(())
    }

    /// Fill `mapping` for a read request (function codes 1 to 4).
    fn read(
        &mut self,
        unit_id: u8,
        function: FunctionCode,
        address: u16,
        quantity: u16,
        mapping: &Mapping,
    ) -> Result<(), SlaveError>;

    /// Consume values a master wrote (function codes 5, 6, 15, 16).
    ///
    /// Called after the response was sent; failures are only logged.
    fn write(
        &mut self,
        unit_id: u8,
        function: FunctionCode,
        address: u16,
        quantity: u16,
        timestamp: SystemTime,
        mapping: &Mapping,
    ) -> Result<(), SlaveError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

struct Control {
    session: Mutex<Option<Arc<ModbusTcpPi>>>,
    state: Mutex<StopState>,
    stopped: Condvar,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Control {
    fn session(&self) -> Option<Arc<ModbusTcpPi>> {
        lock(&self.session).clone()
    }

    /// Acknowledge a pending stop request.
    fn is_closing(&self) -> bool {
        let mut state = lock(&self.state);
        if *state == StopState::Stopping {
            *state = StopState::Stopped;
            self.stopped.notify_all();
            return true;
        }
        false
    }
}

/// Stops a [`ModbusSlave`] from another thread.
#[derive(Clone)]
pub struct SlaveHandle {
    control: Arc<Control>,
}

impl SlaveHandle {
    /// Stop the server loop and release the session.
    ///
    /// Waits up to `timeout` for a running loop to acknowledge. Closing a
    /// slave that is not open is a no-op.
    pub fn close(&self, timeout: Duration) -> Result<(), SlaveError> {
        let session = match self.control.session() {
            Some(session) => session,
            None => return Ok(()),
        };

        {
            let mut state = lock(&self.control.state);
            if *state == StopState::Running {
                kinfo!("Closing server socket");
                *state = StopState::Stopping;
                // cancels the loop's pending select/receive
                session.close()?;

                let deadline = Instant::now() + timeout;
                while *state != StopState::Stopped {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(SlaveError::Backend(exception!(
                            "Cannot close back end within {}ms",
                            timeout.as_millis()
                        )));
                    }
                    state = self
                        .control
                        .stopped
                        .wait_timeout(state, left)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|poisoned| poisoned.into_inner().0);
                }
            }
            *state = StopState::Idle;
        }

        session.release()?;
        *lock(&self.control.session) = None;
        kinfo!("Modbus slave closed");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.control.session().is_some()
    }
}

impl fmt::Debug for SlaveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlaveHandle")
            .field("state", &*lock(&self.control.state))
            .finish()
    }
}

/// Loop bookkeeping that survives between requests
struct Connections {
    count: usize,
    processor_connected: bool,
}

/// Multi-master Modbus TCP slave
pub struct ModbusSlave<P: SlaveProcessor> {
    processor: P,
    config: SessionConfig,
    control: Arc<Control>,
}

impl<P: SlaveProcessor> ModbusSlave<P> {
    /// Slave accepting up to `max_connections` masters, other settings
    /// from the environment.
    pub fn new(processor: P, max_connections: usize) -> Self {
        Self::with_config(processor, SessionConfig::from_env().max_connections(max_connections))
    }

    pub fn with_config(processor: P, config: SessionConfig) -> Self {
        Self {
            processor,
            config,
            control: Arc::new(Control {
                session: Mutex::new(None),
                state: Mutex::new(StopState::Idle),
                stopped: Condvar::new(),
            }),
        }
    }

    pub fn handle(&self) -> SlaveHandle {
        SlaveHandle {
            control: Arc::clone(&self.control),
        }
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    pub fn processor_mut(&mut self) -> &mut P {
        &mut self.processor
    }

    /// Listen on every address (`::`, dual stack) at `port`.
    pub fn open(&self, port: u16) -> Result<u16, SlaveError> {
        self.open_on("::", port)
    }

    /// Listen on `node` at `port` and return the bound port (useful with
    /// port 0).
    pub fn open_on(&self, node: &str, port: u16) -> Result<u16, SlaveError> {
        if self.control.session().is_some() {
            return Err(SlaveError::Backend(exception!("Modbus slave is already open")));
        }
        kinfo!("Opening server socket on port {}", port);

        let session = ModbusTcpPi::with_config(node, &port.to_string(), &self.config).map_err(|e| {
            exception!("Unable to create a TCP context").with_cause(&Exception::from(e))
        })?;
        session.set_debug(self.config.debug || level_enabled(LogLevel::Trace))?;

        let listener = session.listen(self.config.max_connections).map_err(|e| {
            exception!("Unable to open slave").with_cause(&Exception::from(e))
        })?;
        let bound = session.local_addr(listener)?.port();

        *lock(&self.control.session) = Some(Arc::new(session));
        Ok(bound)
    }

    /// Serve requests until [`SlaveHandle::close`] is called.
    pub fn run(&mut self) -> Result<(), SlaveError> {
        let session = self
            .control
            .session()
            .ok_or_else(|| SlaveError::Backend(exception!("Modbus slave is not open")))?;
        {
            let mut state = lock(&self.control.state);
            if *state == StopState::Stopping {
                return Ok(());
            }
            *state = StopState::Running;
        }

        let result = self.serve(&session);

        let mut state = lock(&self.control.state);
        if *state == StopState::Running {
            *state = StopState::Idle;
        }
        result
    }

    fn serve(&mut self, session: &ModbusTcpPi) -> Result<(), SlaveError> {
        let listener = match session.listener()? {
            Some(fd) => fd,
            // closed between open and run
            None if self.control.is_closing() => return Ok(()),
            None => return Err(SlaveError::Backend(exception!("Modbus slave is not listening"))),
        };
        let mut conns = Connections {
            count: 0,
            processor_connected: false,
        };
        let mut request = vec![0u8; MODBUS_TCP_MAX_ADU_LENGTH];
        let mut ready: Vec<RawFd> = Vec::new();

        loop {
            if self.control.is_closing() {
                self.shutdown(&mut conns);
                return Ok(());
            }

            if ready.is_empty() {
                kdebug!("Waiting for data...");
                let result = session.select_read();
                if self.control.is_closing() {
                    self.shutdown(&mut conns);
                    return Ok(());
                }
                match result {
                    Ok(fds) if fds.first() == Some(&listener) => {
                        self.accept(session, listener, &mut conns);
                        continue;
                    }
                    Ok(fds) => ready = fds,
                    Err(ModbusError::Cancelled) => continue,
                    Err(ModbusError::NotListening) => {
                        kinfo!("Server socket closed, leaving the request loop");
                        self.shutdown(&mut conns);
                        return Ok(());
                    }
                    Err(e @ (ModbusError::UseAfterRelease | ModbusError::Lock(_))) => {
                        return Err(e.into());
                    }
                    Err(e) => {
                        kerror!("Waiting for data failed: {}", e);
                        continue;
                    }
                }
            }

            let fd = match ready.pop() {
                Some(fd) => fd,
                None => continue,
            };
            kdebug!("Processing request from connection {}", fd);
            self.handle_request(session, fd, &mut request, &mut conns)?;
        }
    }

    fn accept(&mut self, session: &ModbusTcpPi, listener: RawFd, conns: &mut Connections) {
        match session.accept(listener) {
            Ok(fd) => {
                kdebug!("Connection established: {}", fd);
                conns.count += 1;
                if !conns.processor_connected {
                    match self.processor.connect() {
                        Ok(()) => conns.processor_connected = true,
                        Err(e) => kerror!("Cannot initialize backend: {}", e),
                    }
                }
            }
            Err(e) => kerror!("Unable to accept a connection: {}", e),
        }
    }

    fn shutdown(&mut self, conns: &mut Connections) {
        if conns.processor_connected {
            if let Err(e) = self.processor.disconnect() {
                kerror!("Cannot clean up backend: {}", e);
            }
            conns.processor_connected = false;
        }
    }

    /// Close a master that went away; disconnect the processor after the
    /// last one.
    fn drop_client(&mut self, session: &ModbusTcpPi, fd: RawFd, conns: &mut Connections) {
        if let Err(e) = session.close_socket(fd) {
            kerror!("Cannot close connection {}: {}", fd, e);
        }
        conns.count = conns.count.saturating_sub(1);
        if conns.count == 0 {
            self.shutdown(conns);
        }
    }

    fn handle_request(
        &mut self,
        session: &ModbusTcpPi,
        fd: RawFd,
        request: &mut [u8],
        conns: &mut Connections,
    ) -> Result<(), SlaveError> {
        session.set_socket(Some(fd))?;

        // filtered requests read as 0 bytes
        let (length, timestamp) = loop {
            match session.receive(request) {
                Ok(0) => continue,
                Ok(n) => break (n, SystemTime::now()),
                Err(e) if e.is_disconnect() => {
                    kdebug!("Failed to receive message: {}", e);
                    self.drop_client(session, fd, conns);
                    return Ok(());
                }
                Err(e @ (ModbusError::UseAfterRelease | ModbusError::Lock(_))) => return Err(e.into()),
                Err(ModbusError::Cancelled) => return Ok(()),
                Err(e) => {
                    kerror!("Failed to receive message: {}", e);
                    return Ok(());
                }
            }
        };
        let request = &request[..length];

        if !conns.processor_connected {
            kerror!("Discarding request due to failed initialization of backend");
            if let Err(e) = session.reply_exception(request, ExceptionCode::SlaveOrServerFailure) {
                self.send_failed(session, fd, conns, e);
            }
            return Ok(());
        }

        let header = session.header_length()?;
        let unit_id = request[header - 1];
        let raw_function = request[header];
        let function = FunctionCode::from_u8(raw_function);
        let is_read = function.is_some_and(FunctionCode::is_read);
        let is_write = function.is_some_and(FunctionCode::is_write);

        let address = if request.len() >= header + 3 {
            get_int16_from_int8(request, header + 1)
        } else {
            0
        };
        let multiple = matches!(
            function,
            Some(FunctionCode::WriteMultipleCoils | FunctionCode::WriteMultipleRegisters)
        );
        let quantity = if (is_read || multiple) && request.len() >= header + 5 {
            get_int16_from_int8(request, header + 3)
        } else {
            1
        };

        let (nb_bits, nb_input_bits, nb_registers, nb_input_registers) =
            mapping_size(function, address, quantity);
        let mapping = session.mapping_new(nb_bits, nb_input_bits, nb_registers, nb_input_registers)?;

        let outcome = self.answer(
            session, fd, conns, request, &mapping, unit_id, function, address, quantity, timestamp,
        );
        session.mapping_free(&mapping)?;
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    fn answer(
        &mut self,
        session: &ModbusTcpPi,
        fd: RawFd,
        conns: &mut Connections,
        request: &[u8],
        mapping: &Mapping,
        unit_id: u8,
        function: Option<FunctionCode>,
        address: u16,
        quantity: u16,
        timestamp: SystemTime,
    ) -> Result<(), SlaveError> {
        if let Some(fc) = function.filter(|fc| fc.is_read()) {
            kdebug!(
                "Reading data for functionCode={}, address={}, addressQuantity={}",
                fc.as_u8(), address, quantity
            );
            if let Err(e) = self.processor.read(unit_id, fc, address, quantity, mapping) {
                kerror!(
                    "Cannot read data for functionCode={},address={},quantity={}: {}",
                    fc.as_u8(), address, quantity, e
                );
                if let Err(e) = session.reply_exception(request, e.exception_code()) {
                    self.send_failed(session, fd, conns, e);
                }
                return Ok(());
            }
        }

        if let Err(e) = session.reply(request, mapping) {
            self.send_failed(session, fd, conns, e);
            return Ok(());
        }
        if let Some(fc) = function {
            kdebug!("Sent {}", fc.name());
        }

        if let Some(fc) = function.filter(|fc| fc.is_write()) {
            kdebug!(
                "Writing data for functionCode={}, address={}, addressQuantity={}",
                fc.as_u8(), address, quantity
            );
            if let Err(e) = self.processor.write(unit_id, fc, address, quantity, timestamp, mapping) {
                kerror!(
                    "Cannot write data for functionCode={},address={},quantity={}: {}",
                    fc.as_u8(), address, quantity, e
                );
            }
        }
        Ok(())
    }

    fn send_failed(&mut self, session: &ModbusTcpPi, fd: RawFd, conns: &mut Connections, e: ModbusError) {
        if e.is_disconnect() {
            kdebug!("Failed to send response: {}", e);
            self.drop_client(session, fd, conns);
        } else {
            kerror!("Failed to send response: {}", e);
        }
    }
}

/// Table sizes for one request: only the addressed table is allocated, and
/// only up to `address + quantity`.
pub fn mapping_size(
    function: Option<FunctionCode>,
    address: u16,
    quantity: u16,
) -> (usize, usize, usize, usize) {
    let max = address as usize + quantity as usize;
    match function {
        Some(FunctionCode::ReadCoils | FunctionCode::WriteSingleCoil | FunctionCode::WriteMultipleCoils) => {
            (max, 0, 0, 0)
        }
        Some(FunctionCode::ReadDiscreteInputs) => (0, max, 0, 0),
        Some(
            FunctionCode::ReadHoldingRegisters
            | FunctionCode::WriteSingleRegister
            | FunctionCode::WriteMultipleRegisters,
        ) => (0, 0, max, 0),
        Some(FunctionCode::ReadInputRegisters) => (0, 0, 0, max),
        _ => (0, 0, 0, 0),
    }
}

impl<P: SlaveProcessor> Drop for ModbusSlave<P> {
    fn drop(&mut self) {
        if let Some(session) = lock(&self.control.session).take() {
            if let Err(e) = session.release() {
                kerror!("Cannot release modbus slave session: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_size_per_function() {
        assert_eq!(mapping_size(Some(FunctionCode::ReadCoils), 10, 5), (15, 0, 0, 0));
        assert_eq!(mapping_size(Some(FunctionCode::WriteSingleCoil), 3, 1), (4, 0, 0, 0));
        assert_eq!(mapping_size(Some(FunctionCode::ReadDiscreteInputs), 0, 8), (0, 8, 0, 0));
        assert_eq!(mapping_size(Some(FunctionCode::WriteMultipleRegisters), 100, 2), (0, 0, 102, 0));
        assert_eq!(mapping_size(Some(FunctionCode::ReadInputRegisters), 1, 1), (0, 0, 0, 2));
        assert_eq!(mapping_size(Some(FunctionCode::WriteAndReadRegisters), 1, 1), (0, 0, 0, 0));
        assert_eq!(mapping_size(None, 1, 1), (0, 0, 0, 0));
    }

    #[test]
    fn test_error_exception_codes() {
        assert_eq!(SlaveError::IllegalFunction.exception_code(), ExceptionCode::IllegalFunction);
        assert_eq!(
            SlaveError::IllegalDataAddress.exception_code(),
            ExceptionCode::IllegalDataAddress
        );
        let backend = SlaveError::from(exception!("sensor offline"));
        assert_eq!(backend.exception_code(), ExceptionCode::SlaveOrServerFailure);
        assert_eq!(backend.to_string(), "sensor offline");
    }

    #[test]
    fn test_modbus_error_keeps_code() {
        let err = SlaveError::from(ModbusError::Engine(mbsafe_core::ErrorCode::ConnectionReset));
        match err {
            SlaveError::Backend(ex) => assert_eq!(ex.error_code(), Some(104)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_close_when_not_open() {
        struct Nothing;
        impl SlaveProcessor for Nothing {
            fn read(&mut self, _: u8, _: FunctionCode, _: u16, _: u16, _: &Mapping) -> Result<(), SlaveError> {
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

        let mut slave = ModbusSlave::new(Nothing, 1);
        let handle = slave.handle();
        assert!(!handle.is_open());
        assert!(handle.close(Duration::from_millis(10)).is_ok());
        assert!(slave.run().is_err());
    }
}
