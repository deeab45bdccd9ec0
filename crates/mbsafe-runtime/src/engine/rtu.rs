//! Modbus RTU transport
//!
//! Frames are `slave | PDU | CRC-16 (little endian)`. The line is opened
//! raw (no echo, no canonical mode, no flow control) and the previous
//! termios settings are restored on close.
//!
//! RS485 half-duplex direction control is delegated to the kernel driver
//! (`TIOCSRS485`) and only exists on Linux.

use std::os::unix::io::{BorrowedFd, RawFd};
use std::time::Duration;

use crc::{Crc, CRC_16_MODBUS};
use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::sys::termios::{
    self, BaudRate, ControlFlags, FlushArg, InputFlags, LocalFlags, OutputFlags, SetArg,
    SpecialCharacterIndices, Termios,
};

use mbsafe_core::codes::ErrorCode;
use mbsafe_core::constants::*;
use mbsafe_core::error::EngineResult;
use mbsafe_core::traits::{SerialEngine, SerialMode};
use mbsafe_core::{kdebug, kwarn};

use super::{ModbusEngine, Transport};

const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Highest slave id a request may be addressed to
const MAX_SLAVE_ID: u8 = 247;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

impl Parity {
    /// 'N', 'E' or 'O' (case-insensitive)
    pub fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'N' => Some(Parity::None),
            'E' => Some(Parity::Even),
            'O' => Some(Parity::Odd),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Parity::None => 'N',
            Parity::Even => 'E',
            Parity::Odd => 'O',
        }
    }
}

pub struct RtuTransport {
    device: String,
    baud: u32,
    parity: Parity,
    data_bits: u8,
    stop_bits: u8,
    serial_mode: SerialMode,
    saved: Option<Termios>,
}

impl RtuTransport {
    pub fn new(device: &str, baud: u32, parity: Parity, data_bits: u8, stop_bits: u8) -> Self {
        Self {
            device: device.to_string(),
            baud,
            parity,
            data_bits,
            stop_bits,
            serial_mode: SerialMode::Rs232,
            saved: None,
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    pub fn parity(&self) -> Parity {
        self.parity
    }

    pub fn data_bits(&self) -> u8 {
        self.data_bits
    }

    pub fn stop_bits(&self) -> u8 {
        self.stop_bits
    }

    fn configure(&mut self, fd: BorrowedFd<'_>) -> EngineResult<()> {
        let saved = termios::tcgetattr(fd).map_err(nix_error)?;
        let mut tios = saved.clone();

        termios::cfsetspeed(&mut tios, baud_rate(self.baud)).map_err(nix_error)?;

        let mut cflags = tios.control_flags;
        cflags.insert(ControlFlags::CREAD | ControlFlags::CLOCAL);
        cflags.remove(ControlFlags::CSIZE);
        cflags.insert(match self.data_bits {
            5 => ControlFlags::CS5,
            6 => ControlFlags::CS6,
            7 => ControlFlags::CS7,
            _ => ControlFlags::CS8,
        });
        cflags.set(ControlFlags::CSTOPB, self.stop_bits == 2);
        match self.parity {
            Parity::None => cflags.remove(ControlFlags::PARENB),
            Parity::Even => {
                cflags.insert(ControlFlags::PARENB);
                cflags.remove(ControlFlags::PARODD);
            }
            Parity::Odd => cflags.insert(ControlFlags::PARENB | ControlFlags::PARODD),
        }
        tios.control_flags = cflags;

        // raw input: no canonical mode, no echo, no signals
        tios.local_flags.remove(
            LocalFlags::ICANON | LocalFlags::ECHO | LocalFlags::ECHOE | LocalFlags::ISIG,
        );

        let mut iflags = tios.input_flags;
        if self.parity == Parity::None {
            iflags.remove(InputFlags::INPCK);
        } else {
            iflags.insert(InputFlags::INPCK);
        }
        iflags.remove(InputFlags::IXON | InputFlags::IXOFF | InputFlags::IXANY);
        iflags.remove(InputFlags::ICRNL | InputFlags::INLCR | InputFlags::IGNCR);
        tios.input_flags = iflags;

        tios.output_flags.remove(OutputFlags::OPOST);

        tios.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
        tios.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

        termios::tcsetattr(fd, SetArg::TCSANOW, &tios).map_err(nix_error)?;
        self.saved = Some(saved);
        Ok(())
    }
}

fn nix_error(e: nix::errno::Errno) -> ErrorCode {
    ErrorCode::from_errno(e as i32)
}

fn last_errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

fn baud_rate(baud: u32) -> BaudRate {
    match baud {
        110 => BaudRate::B110,
        300 => BaudRate::B300,
        600 => BaudRate::B600,
        1200 => BaudRate::B1200,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        230400 => BaudRate::B230400,
        other => {
            kwarn!("rtu: unknown baud rate {}, using 9600", other);
            BaudRate::B9600
        }
    }
}

fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

impl Transport for RtuTransport {
    const NAME: &'static str = "rtu";
    const HEADER_LENGTH: usize = MODBUS_RTU_HEADER_LENGTH;
    const CHECKSUM_LENGTH: usize = MODBUS_RTU_CHECKSUM_LENGTH;
    const MAX_ADU_LENGTH: usize = MODBUS_RTU_MAX_ADU_LENGTH;

    fn connect(&mut self, _response_timeout: Duration) -> EngineResult<RawFd> {
        kdebug!(
            "rtu: opening {} at {} bauds ({}, {}, {})",
            self.device,
            self.baud,
            self.parity.as_char(),
            self.data_bits,
            self.stop_bits
        );
        let flags = OFlag::O_RDWR
            | OFlag::O_NOCTTY
            | OFlag::O_NDELAY
            | OFlag::O_EXCL
            | OFlag::O_CLOEXEC;
        let fd = fcntl::open(self.device.as_str(), flags, Mode::empty()).map_err(nix_error)?;

        if let Err(e) = self.configure(unsafe { BorrowedFd::borrow_raw(fd) }) {
            unsafe { libc::close(fd) };
            return Err(e);
        }
        Ok(fd)
    }

    fn close(&mut self, fd: RawFd) {
        if let Some(saved) = self.saved.take() {
            let _ = termios::tcsetattr(unsafe { BorrowedFd::borrow_raw(fd) }, SetArg::TCSANOW, &saved);
        }
        unsafe { libc::close(fd) };
    }

    fn send(&mut self, fd: RawFd, buf: &[u8]) -> EngineResult<usize> {
        loop {
            let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let errno = last_errno();
            if errno != libc::EINTR {
                return Err(ErrorCode::from_errno(errno));
            }
        }
    }

    fn recv(&mut self, fd: RawFd, buf: &mut [u8]) -> EngineResult<usize> {
        loop {
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let errno = last_errno();
            if errno != libc::EINTR {
                return Err(ErrorCode::from_errno(errno));
            }
        }
    }

    fn flush(&mut self, fd: RawFd) {
        // not a tty (tests drive the transport over a socket pair): nothing to flush
        let _ = termios::tcflush(unsafe { BorrowedFd::borrow_raw(fd) }, FlushArg::TCIOFLUSH);
    }

    fn valid_slave(&self, slave: u8) -> bool {
        slave <= MAX_SLAVE_ID
    }

    fn request_header(&mut self, slave: u8) -> Vec<u8> {
        let mut msg = Vec::with_capacity(MODBUS_RTU_MAX_ADU_LENGTH);
        msg.push(slave);
        msg
    }

    fn response_header(&self, req: &[u8]) -> Vec<u8> {
        let mut msg = Vec::with_capacity(MODBUS_RTU_MAX_ADU_LENGTH);
        msg.push(req[0]);
        msg
    }

    fn finalize(&self, msg: &mut Vec<u8>) {
        let crc = crc16(msg);
        msg.extend_from_slice(&crc.to_le_bytes());
    }

    fn check_integrity(&self, msg: &[u8]) -> EngineResult<()> {
        let split = msg.len() - MODBUS_RTU_CHECKSUM_LENGTH;
        let calculated = crc16(&msg[..split]);
        let received = u16::from_le_bytes([msg[split], msg[split + 1]]);
        if calculated != received {
            kdebug!(
                "rtu: CRC received 0x{:04X} != CRC calculated 0x{:04X}",
                received, calculated
            );
            return Err(ErrorCode::BadCrc);
        }
        Ok(())
    }

    fn check_confirmation(&self, req: &[u8], rsp: &[u8]) -> EngineResult<()> {
        if req[0] != rsp[0] {
            kdebug!("rtu: response from slave {} instead of {}", rsp[0], req[0]);
            return Err(ErrorCode::BadSlave);
        }
        Ok(())
    }

    fn accepts(&self, own_slave: u8, req: &[u8]) -> bool {
        req[0] == own_slave || req[0] == MODBUS_BROADCAST_ADDRESS
    }

    fn is_broadcast(&self, msg: &[u8]) -> bool {
        msg[0] == MODBUS_BROADCAST_ADDRESS
    }
}

impl ModbusEngine<RtuTransport> {
    /// RTU engine on `device`. The line is opened by `connect`.
    pub fn new_rtu(device: &str, baud: u32, parity: Parity, data_bits: u8, stop_bits: u8) -> Self {
        Self::from_transport(
            RtuTransport::new(device, baud, parity, data_bits, stop_bits),
            1,
        )
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        const TIOCSRS485: u32 = 0x542F;
        const SER_RS485_ENABLED: u32 = 1 << 0;

        /// `struct serial_rs485` from <linux/serial.h>
        #[repr(C)]
        #[derive(Debug, Default)]
        struct SerialRs485 {
            flags: u32,
            delay_rts_before_send: u32,
            delay_rts_after_send: u32,
            padding: [u32; 5],
        }

        nix::ioctl_write_ptr_bad!(tiocsrs485, TIOCSRS485, SerialRs485);

        fn apply_serial_mode(fd: RawFd, mode: SerialMode) -> EngineResult<()> {
            let conf = SerialRs485 {
                flags: if mode == SerialMode::Rs485 { SER_RS485_ENABLED } else { 0 },
                ..Default::default()
            };
            unsafe { tiocsrs485(fd, &conf) }.map_err(nix_error)?;
            Ok(())
        }
    } else {
        fn apply_serial_mode(_fd: RawFd, _mode: SerialMode) -> EngineResult<()> {
            Err(ErrorCode::Os(libc::ENOTSUP))
        }
    }
}

impl SerialEngine for ModbusEngine<RtuTransport> {
    fn serial_mode(&self) -> SerialMode {
        self.transport.serial_mode
    }

    fn set_serial_mode(&mut self, mode: SerialMode) -> EngineResult<()> {
        let fd = self.fd.ok_or(ErrorCode::Os(libc::EBADF))?;
        apply_serial_mode(fd, mode)?;
        self.transport.serial_mode = mode;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mbsafe_core::mapping::Mapping;
    use mbsafe_core::traits::ProtocolEngine;
    use std::io::{Read, Write};
    use std::os::unix::io::IntoRawFd;
    use std::os::unix::net::UnixStream;

    /// Engine bound to one end of a socket pair, test code holds the other.
    fn engine_on_pair() -> (ModbusEngine<RtuTransport>, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        let mut engine = ModbusEngine::new_rtu("/dev/null", 9600, Parity::None, 8, 1);
        engine.set_socket(Some(a.into_raw_fd()));
        (engine, b)
    }

    fn framed(body: &[u8]) -> Vec<u8> {
        let mut msg = body.to_vec();
        msg.extend_from_slice(&crc16(body).to_le_bytes());
        msg
    }

    #[test]
    fn test_crc_reference_frame() {
        let t = RtuTransport::new("/dev/null", 9600, Parity::None, 8, 1);
        let mut msg = vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x0A];
        t.finalize(&mut msg);
        assert_eq!(msg, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD]);
        assert_eq!(t.check_integrity(&msg), Ok(()));
        msg[7] ^= 0xFF;
        assert_eq!(t.check_integrity(&msg), Err(ErrorCode::BadCrc));
    }

    #[test]
    fn test_parity_from_char() {
        assert_eq!(Parity::from_char('n'), Some(Parity::None));
        assert_eq!(Parity::from_char('E'), Some(Parity::Even));
        assert_eq!(Parity::from_char('O'), Some(Parity::Odd));
        assert_eq!(Parity::from_char('X'), None);
    }

    #[test]
    fn test_slave_range() {
        let mut engine = ModbusEngine::new_rtu("/dev/null", 9600, Parity::None, 8, 1);
        assert_eq!(engine.slave(), 1);
        assert!(engine.set_slave(247).is_ok());
        assert_eq!(engine.set_slave(248), Err(ErrorCode::Os(libc::EINVAL)));
    }

    #[test]
    fn test_serial_mode_requires_open_line() {
        let mut engine = ModbusEngine::new_rtu("/dev/null", 9600, Parity::None, 8, 1);
        assert_eq!(engine.serial_mode(), SerialMode::Rs232);
        assert_eq!(
            engine.set_serial_mode(SerialMode::Rs485),
            Err(ErrorCode::Os(libc::EBADF))
        );
        assert_eq!(engine.serial_mode(), SerialMode::Rs232);
    }

    #[test]
    fn test_missing_device() {
        let mut engine = ModbusEngine::new_rtu("/dev/mbsafe-no-such-tty", 9600, Parity::None, 8, 1);
        assert_eq!(engine.connect(), Err(ErrorCode::Os(libc::ENOENT)));
        assert_eq!(engine.socket(), None);
    }

    #[test]
    fn test_serve_read_registers() {
        let (mut engine, mut peer) = engine_on_pair();
        let mapping = Mapping::new(0, 0, 4, 0);
        mapping.set_register(1, 0x1234).unwrap();

        peer.write_all(&framed(&[0x01, 0x03, 0x00, 0x01, 0x00, 0x01])).unwrap();
        let mut req = [0u8; MODBUS_RTU_MAX_ADU_LENGTH];
        let n = engine.receive(&mut req).unwrap();
        assert_eq!(n, 8);
        engine.reply(&req[..n], &mapping).unwrap();

        let mut rsp = [0u8; 7];
        peer.read_exact(&mut rsp).unwrap();
        assert_eq!(rsp.to_vec(), framed(&[0x01, 0x03, 0x02, 0x12, 0x34]));
    }

    #[test]
    fn test_other_slave_is_filtered() {
        let (mut engine, mut peer) = engine_on_pair();
        peer.write_all(&framed(&[0x07, 0x03, 0x00, 0x00, 0x00, 0x01])).unwrap();
        let mut req = [0u8; MODBUS_RTU_MAX_ADU_LENGTH];
        assert_eq!(engine.receive(&mut req), Ok(0));
    }

    #[test]
    fn test_broadcast_write_gets_no_reply() {
        let (mut engine, mut peer) = engine_on_pair();
        let mapping = Mapping::new(0, 0, 4, 0);

        peer.write_all(&framed(&[0x00, 0x06, 0x00, 0x02, 0xBE, 0xEF])).unwrap();
        let mut req = [0u8; MODBUS_RTU_MAX_ADU_LENGTH];
        let n = engine.receive(&mut req).unwrap();
        assert_eq!(engine.reply(&req[..n], &mapping), Ok(0));
        assert_eq!(mapping.get_register(2), Some(0xBEEF));
    }

    #[test]
    fn test_bad_crc_is_rejected() {
        let (mut engine, mut peer) = engine_on_pair();
        let mut frame = framed(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]);
        frame[6] ^= 0x55;
        peer.write_all(&frame).unwrap();
        let mut req = [0u8; MODBUS_RTU_MAX_ADU_LENGTH];
        assert_eq!(engine.receive(&mut req), Err(ErrorCode::BadCrc));
    }

    #[test]
    fn test_client_request_framing() {
        let (mut engine, mut peer) = engine_on_pair();
        engine.set_slave(0x11).unwrap();

        let responder = std::thread::spawn(move || {
            let mut req = [0u8; 8];
            peer.read_exact(&mut req).unwrap();
            assert_eq!(req.to_vec(), framed(&[0x11, 0x06, 0x00, 0x01, 0x00, 0x03]));
            peer.write_all(&req).unwrap();
        });

        assert_eq!(engine.write_register(1, 3), Ok(()));
        responder.join().unwrap();
    }
}
