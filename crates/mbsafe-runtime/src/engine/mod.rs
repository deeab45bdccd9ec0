//! Default protocol engines
//!
//! [`ModbusEngine`] implements [`ProtocolEngine`] once for every transport:
//! framing of requests and responses, the read loop, serving against a
//! mapping and the client primitives. A [`Transport`] contributes only what
//! differs between Modbus TCP and Modbus RTU (header layout, checksum,
//! raw I/O, opening and closing the line).
//!
//! - `tcp` - TCP-PI (protocol independent, IPv4/IPv6) transport
//! - `rtu` - Serial RTU transport
//! - `pdu` - Function-code level request/response handling

pub mod pdu;
pub mod rtu;
pub mod tcp;

use std::os::unix::io::RawFd;
use std::time::Duration;

use mbsafe_core::codes::{ErrorCode, ExceptionCode, FunctionCode};
use mbsafe_core::constants::*;
use mbsafe_core::error::EngineResult;
use mbsafe_core::kprint::hex_frame;
use mbsafe_core::mapping::Mapping;
use mbsafe_core::traits::ProtocolEngine;
use mbsafe_core::{kdebug, kprintln};

use self::pdu::MsgKind;
pub use self::rtu::{Parity, RtuTransport};
pub use self::tcp::TcpTransport;

/// Modbus over TCP-PI
pub type TcpEngine = ModbusEngine<TcpTransport>;

/// Modbus RTU over a serial line
pub type RtuEngine = ModbusEngine<RtuTransport>;

/// Transport-specific part of an engine
pub trait Transport: Send {
    const NAME: &'static str;
    const HEADER_LENGTH: usize;
    const CHECKSUM_LENGTH: usize;
    const MAX_ADU_LENGTH: usize;

    /// Open the line and return its descriptor.
    fn connect(&mut self, response_timeout: Duration) -> EngineResult<RawFd>;

    /// Close a descriptor this transport opened or accepted.
    fn close(&mut self, fd: RawFd);

    fn send(&mut self, fd: RawFd, buf: &[u8]) -> EngineResult<usize>;

    /// Read at most `buf.len()` bytes. `Ok(0)` means the peer closed.
    fn recv(&mut self, fd: RawFd, buf: &mut [u8]) -> EngineResult<usize>;

    /// Discard pending input after a framing error.
    fn flush(&mut self, fd: RawFd);

    fn valid_slave(&self, slave: u8) -> bool;

    /// Header of an outgoing request addressed to `slave`.
    fn request_header(&mut self, slave: u8) -> Vec<u8>;

    /// Header of the response to `req`.
    fn response_header(&self, req: &[u8]) -> Vec<u8>;

    /// Fill length fields and append the checksum.
    fn finalize(&self, msg: &mut Vec<u8>);

    /// Verify the checksum of a received frame.
    fn check_integrity(&self, msg: &[u8]) -> EngineResult<()>;

    /// Verify a response belongs to the request that was sent.
    fn check_confirmation(&self, req: &[u8], rsp: &[u8]) -> EngineResult<()>;

    /// False when a received request is addressed to another slave.
    fn accepts(&self, _own_slave: u8, _req: &[u8]) -> bool {
        true
    }

    /// True when a request must not be answered (e.g. RTU broadcast).
    fn is_broadcast(&self, _msg: &[u8]) -> bool {
        false
    }
}

/// Blocking Modbus protocol context
pub struct ModbusEngine<T: Transport> {
    transport: T,
    fd: Option<RawFd>,
    slave: u8,
    debug: bool,
    response_timeout: Duration,
    byte_timeout: Duration,
}

impl<T: Transport> ModbusEngine<T> {
    pub(crate) fn from_transport(transport: T, slave: u8) -> Self {
        Self {
            transport,
            fd: None,
            slave,
            debug: false,
            response_timeout: Duration::from_millis(crate::config::defaults::RESPONSE_TIMEOUT_MS),
            byte_timeout: Duration::from_millis(crate::config::defaults::BYTE_TIMEOUT_MS),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub(crate) fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn slave(&self) -> u8 {
        self.slave
    }

    fn current_fd(&self) -> EngineResult<RawFd> {
        self.fd.ok_or(ErrorCode::Os(libc::EBADF))
    }

    fn send_msg(&mut self, mut msg: Vec<u8>) -> EngineResult<usize> {
        let fd = self.current_fd()?;
        self.transport.finalize(&mut msg);
        if self.debug {
            kprintln!("{}", hex_frame(&msg));
        }
        let mut sent = 0;
        while sent < msg.len() {
            sent += self.transport.send(fd, &msg[sent..])?;
        }
        Ok(sent)
    }

    /// Read one complete frame. The first byte of an indication may take
    /// forever, everything after it is bounded by the byte timeout.
    fn receive_msg(&mut self, kind: MsgKind) -> EngineResult<Vec<u8>> {
        enum Step {
            Function,
            Meta,
            Data,
        }

        let fd = self.current_fd()?;
        if self.debug {
            kprintln!("Waiting for a {:?}...", kind);
        }

        let mut msg = Vec::with_capacity(T::MAX_ADU_LENGTH);
        let mut buf = [0u8; MODBUS_TCP_MAX_ADU_LENGTH];
        let mut step = Step::Function;
        let mut want = T::HEADER_LENGTH + 1;
        let mut timeout = match kind {
            MsgKind::Indication => None,
            MsgKind::Confirmation => Some(self.response_timeout),
        };

        loop {
            while want > 0 {
                if let Err(e) = wait_fd(fd, timeout) {
                    if e == ErrorCode::TimedOut && !msg.is_empty() {
                        self.transport.flush(fd);
                    }
                    return Err(e);
                }
                let n = self.transport.recv(fd, &mut buf[..want])?;
                if n == 0 {
                    return Err(ErrorCode::ConnectionReset);
                }
                msg.extend_from_slice(&buf[..n]);
                want -= n;
                timeout = Some(self.byte_timeout);
            }

            match step {
                Step::Function => {
                    want = pdu::meta_length(kind, msg[T::HEADER_LENGTH]);
                    step = Step::Meta;
                }
                Step::Meta => {
                    want = pdu::data_length(kind, &msg[T::HEADER_LENGTH..]) + T::CHECKSUM_LENGTH;
                    if msg.len() + want > T::MAX_ADU_LENGTH {
                        self.transport.flush(fd);
                        return Err(ErrorCode::TooMuchData);
                    }
                    step = Step::Data;
                }
                Step::Data => break,
            }
        }

        if self.debug {
            kprintln!("{}", hex_frame(&msg));
        }
        if let Err(e) = self.transport.check_integrity(&msg) {
            self.transport.flush(fd);
            return Err(e);
        }
        Ok(msg)
    }

    /// Send a request PDU and wait for the matching response PDU.
    ///
    /// `None` when the request was a broadcast and no response is due.
    fn transact(&mut self, req_pdu: &[u8]) -> EngineResult<Option<(Vec<u8>, usize)>> {
        let mut req = self.transport.request_header(self.slave);
        req.extend_from_slice(req_pdu);
        if req.len() + T::CHECKSUM_LENGTH > T::MAX_ADU_LENGTH {
            return Err(ErrorCode::TooMuchData);
        }
        let broadcast = self.transport.is_broadcast(&req);
        self.send_msg(req.clone())?;
        if broadcast {
            return Ok(None);
        }

        let rsp = self.receive_msg(MsgKind::Confirmation)?;
        self.transport.check_confirmation(&req, &rsp)?;
        let rsp_pdu = &rsp[T::HEADER_LENGTH..rsp.len() - T::CHECKSUM_LENGTH];
        let nb = pdu::check_response(req_pdu, rsp_pdu)?;
        Ok(Some((rsp_pdu.to_vec(), nb)))
    }

    fn read_bits_fc(&mut self, fc: FunctionCode, addr: u16, dest: &mut [bool]) -> EngineResult<usize> {
        if dest.is_empty() || dest.len() > MODBUS_MAX_READ_BITS {
            return Err(ErrorCode::TooMuchData);
        }
        let req = pdu::request_basis(fc, addr, dest.len() as u16);
        match self.transact(&req)? {
            Some((rsp, nb)) => {
                pdu::response_bits(&rsp, dest);
                Ok(nb)
            }
            None => Err(ErrorCode::Os(libc::EINVAL)),
        }
    }

    fn read_registers_fc(&mut self, fc: FunctionCode, addr: u16, dest: &mut [u16]) -> EngineResult<usize> {
        if dest.is_empty() || dest.len() > MODBUS_MAX_READ_REGISTERS {
            return Err(ErrorCode::TooMuchData);
        }
        let req = pdu::request_basis(fc, addr, dest.len() as u16);
        match self.transact(&req)? {
            Some((rsp, nb)) => {
                pdu::response_registers(&rsp, &mut dest[..nb]);
                Ok(nb)
            }
            None => Err(ErrorCode::Os(libc::EINVAL)),
        }
    }

    fn write_pdu(&mut self, req: &[u8], expected: usize) -> EngineResult<usize> {
        Ok(match self.transact(req)? {
            Some((_, nb)) => nb,
            None => expected,
        })
    }

    fn send_response(&mut self, req: &[u8], rsp_pdu: &[u8]) -> EngineResult<usize> {
        if self.transport.is_broadcast(req) {
            return Ok(0);
        }
        let mut rsp = self.transport.response_header(req);
        rsp.extend_from_slice(rsp_pdu);
        self.send_msg(rsp)
    }

    fn request_pdu<'r>(&self, req: &'r [u8]) -> EngineResult<&'r [u8]> {
        if req.len() < T::HEADER_LENGTH + 1 + T::CHECKSUM_LENGTH {
            return Err(ErrorCode::BadData);
        }
        Ok(&req[T::HEADER_LENGTH..req.len() - T::CHECKSUM_LENGTH])
    }
}

impl<T: Transport> ProtocolEngine for ModbusEngine<T> {
    fn name(&self) -> &'static str {
        T::NAME
    }

    fn connect(&mut self) -> EngineResult<RawFd> {
        let fd = self.transport.connect(self.response_timeout)?;
        if self.debug {
            kprintln!("Connected {} on fd {}", T::NAME, fd);
        }
        self.fd = Some(fd);
        Ok(fd)
    }

    fn close(&mut self) {
        if let Some(fd) = self.fd.take() {
            kdebug!("{}: closing fd {}", T::NAME, fd);
            self.transport.close(fd);
        }
    }

    fn socket(&self) -> Option<RawFd> {
        self.fd
    }

    fn set_socket(&mut self, fd: Option<RawFd>) {
        self.fd = fd;
    }

    fn set_slave(&mut self, slave: u8) -> EngineResult<()> {
        if !self.transport.valid_slave(slave) {
            return Err(ErrorCode::Os(libc::EINVAL));
        }
        self.slave = slave;
        Ok(())
    }

    fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    fn set_response_timeout(&mut self, timeout: Duration) {
        self.response_timeout = timeout;
    }

    fn byte_timeout(&self) -> Duration {
        self.byte_timeout
    }

    fn set_byte_timeout(&mut self, timeout: Duration) {
        self.byte_timeout = timeout;
    }

    fn header_length(&self) -> usize {
        T::HEADER_LENGTH
    }

    fn max_adu_length(&self) -> usize {
        T::MAX_ADU_LENGTH
    }

    fn read_bits(&mut self, addr: u16, dest: &mut [bool]) -> EngineResult<usize> {
        self.read_bits_fc(FunctionCode::ReadCoils, addr, dest)
    }

    fn read_input_bits(&mut self, addr: u16, dest: &mut [bool]) -> EngineResult<usize> {
        self.read_bits_fc(FunctionCode::ReadDiscreteInputs, addr, dest)
    }

    fn read_registers(&mut self, addr: u16, dest: &mut [u16]) -> EngineResult<usize> {
        self.read_registers_fc(FunctionCode::ReadHoldingRegisters, addr, dest)
    }

    fn read_input_registers(&mut self, addr: u16, dest: &mut [u16]) -> EngineResult<usize> {
        self.read_registers_fc(FunctionCode::ReadInputRegisters, addr, dest)
    }

    fn write_bit(&mut self, addr: u16, value: bool) -> EngineResult<()> {
        let raw = if value { 0xFF00 } else { 0 };
        let req = pdu::request_basis(FunctionCode::WriteSingleCoil, addr, raw);
        self.write_pdu(&req, 1).map(|_| ())
    }

    fn write_bits(&mut self, addr: u16, values: &[bool]) -> EngineResult<usize> {
        if values.is_empty() || values.len() > MODBUS_MAX_WRITE_BITS {
            return Err(ErrorCode::TooMuchData);
        }
        let req = pdu::write_bits_request(addr, values);
        self.write_pdu(&req, values.len())
    }

    fn write_register(&mut self, addr: u16, value: u16) -> EngineResult<()> {
        let req = pdu::request_basis(FunctionCode::WriteSingleRegister, addr, value);
        self.write_pdu(&req, 1).map(|_| ())
    }

    fn write_registers(&mut self, addr: u16, values: &[u16]) -> EngineResult<usize> {
        if values.is_empty() || values.len() > MODBUS_MAX_WRITE_REGISTERS {
            return Err(ErrorCode::TooMuchData);
        }
        let req = pdu::write_registers_request(addr, values);
        self.write_pdu(&req, values.len())
    }

    fn write_and_read_registers(
        &mut self,
        write_addr: u16,
        src: &[u16],
        read_addr: u16,
        dest: &mut [u16],
    ) -> EngineResult<usize> {
        if src.is_empty() || src.len() > MODBUS_MAX_WR_WRITE_REGISTERS {
            return Err(ErrorCode::TooMuchData);
        }
        if dest.is_empty() || dest.len() > MODBUS_MAX_WR_READ_REGISTERS {
            return Err(ErrorCode::TooMuchData);
        }
        let req = pdu::write_and_read_request(write_addr, src, read_addr, dest.len() as u16);
        match self.transact(&req)? {
            Some((rsp, nb)) => {
                pdu::response_registers(&rsp, &mut dest[..nb]);
                Ok(nb)
            }
            None => Err(ErrorCode::Os(libc::EINVAL)),
        }
    }

    fn receive(&mut self, req: &mut [u8]) -> EngineResult<usize> {
        let msg = self.receive_msg(MsgKind::Indication)?;
        if !self.transport.accepts(self.slave, &msg) {
            kdebug!("{}: request for slave {} ignored", T::NAME, msg[0]);
            return Ok(0);
        }
        if msg.len() > req.len() {
            return Err(ErrorCode::TooMuchData);
        }
        req[..msg.len()].copy_from_slice(&msg);
        Ok(msg.len())
    }

    fn reply(&mut self, req: &[u8], mapping: &Mapping) -> EngineResult<usize> {
        let req_pdu = self.request_pdu(req)?;
        let rsp_pdu = match pdu::serve(req_pdu, mapping) {
            Ok(rsp) => rsp,
            Err(exc) => {
                if self.debug {
                    kprintln!("{} for function 0x{:02X}", exc.description(), req_pdu[0]);
                }
                pdu::exception_pdu(req_pdu[0], exc).to_vec()
            }
        };
        self.send_response(req, &rsp_pdu)
    }

    fn reply_exception(&mut self, req: &[u8], exception: ExceptionCode) -> EngineResult<usize> {
        let req_pdu = self.request_pdu(req)?;
        let rsp_pdu = pdu::exception_pdu(req_pdu[0], exception);
        self.send_response(req, &rsp_pdu)
    }
}

impl<T: Transport> Drop for ModbusEngine<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Wait until `fd` is readable. `None` waits forever.
pub(crate) fn wait_fd(fd: RawFd, timeout: Option<Duration>) -> EngineResult<()> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = match timeout {
        None => -1,
        Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
    };
    loop {
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret < 0 {
            let errno = unsafe { *libc::__errno_location() };
            if errno == libc::EINTR {
                continue;
            }
            return Err(ErrorCode::from_errno(errno));
        }
        if ret == 0 {
            return Err(ErrorCode::TimedOut);
        }
        if pfd.revents & libc::POLLNVAL != 0 {
            return Err(ErrorCode::Os(libc::EBADF));
        }
        return Ok(());
    }
}
