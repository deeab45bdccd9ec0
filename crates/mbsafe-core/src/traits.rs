//! Protocol engine traits
//!
//! These traits define the interface between the session layer and the
//! engine that speaks the wire protocol. The session serializes every call,
//! so engines are plain single-threaded state machines: `&mut self`
//! everywhere, `Send` so a session can move between threads.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::codes::ExceptionCode;
use crate::error::EngineResult;
use crate::mapping::Mapping;

/// Blocking Modbus protocol context with one "current" descriptor
pub trait ProtocolEngine: Send {
    /// Short transport name for logs ("tcp-pi", "rtu", ...)
    fn name(&self) -> &'static str;

    /// Open the transport and make its descriptor current.
    fn connect(&mut self) -> EngineResult<RawFd>;

    /// Close the current descriptor (if any) and forget it.
    fn close(&mut self);

    /// Current descriptor
    fn socket(&self) -> Option<RawFd>;

    /// Make `fd` current. `None` detaches without closing.
    fn set_socket(&mut self, fd: Option<RawFd>);

    fn set_slave(&mut self, slave: u8) -> EngineResult<()>;

    fn set_debug(&mut self, debug: bool);

    fn response_timeout(&self) -> Duration;
    fn set_response_timeout(&mut self, timeout: Duration);

    fn byte_timeout(&self) -> Duration;
    fn set_byte_timeout(&mut self, timeout: Duration);

    /// Bytes preceding the function code in a frame
    fn header_length(&self) -> usize;

    /// Largest frame the transport accepts
    fn max_adu_length(&self) -> usize;

    // --- client primitives, quantity taken from the slice length ---

    fn read_bits(&mut self, addr: u16, dest: &mut [bool]) -> EngineResult<usize>;
    fn read_input_bits(&mut self, addr: u16, dest: &mut [bool]) -> EngineResult<usize>;
    fn read_registers(&mut self, addr: u16, dest: &mut [u16]) -> EngineResult<usize>;
    fn read_input_registers(&mut self, addr: u16, dest: &mut [u16]) -> EngineResult<usize>;
    fn write_bit(&mut self, addr: u16, value: bool) -> EngineResult<()>;
    fn write_bits(&mut self, addr: u16, values: &[bool]) -> EngineResult<usize>;
    fn write_register(&mut self, addr: u16, value: u16) -> EngineResult<()>;
    fn write_registers(&mut self, addr: u16, values: &[u16]) -> EngineResult<usize>;
    fn write_and_read_registers(
        &mut self,
        write_addr: u16,
        src: &[u16],
        read_addr: u16,
        dest: &mut [u16],
    ) -> EngineResult<usize>;

    // --- server primitives ---

    /// Read one request frame from the current descriptor into `req`.
    ///
    /// Returns the frame length. `Ok(0)` means the frame was not addressed
    /// to this slave and must be ignored.
    fn receive(&mut self, req: &mut [u8]) -> EngineResult<usize>;

    /// Serve `req` against `mapping` and send the response.
    ///
    /// Returns bytes sent (0 when no response is due, e.g. broadcast).
    fn reply(&mut self, req: &[u8], mapping: &Mapping) -> EngineResult<usize>;

    /// Send an exception response for `req`.
    fn reply_exception(&mut self, req: &[u8], exception: ExceptionCode) -> EngineResult<usize>;
}

/// Engine that can listen for and accept peers (TCP server mode)
pub trait ListeningEngine: ProtocolEngine {
    /// Bind and listen. The listening descriptor becomes current.
    fn listen(&mut self, backlog: usize) -> EngineResult<RawFd>;

    /// Accept one peer on `listen_fd`. The new descriptor becomes current.
    fn accept(&mut self, listen_fd: RawFd) -> EngineResult<RawFd>;

    /// Local address `fd` is bound to
    fn local_addr(&self, fd: RawFd) -> EngineResult<SocketAddr>;
}

/// Serial line electrical interface
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialMode {
    Rs232 = 0,
    Rs485 = 1,
}

/// Engine driving a serial line (RTU)
pub trait SerialEngine: ProtocolEngine {
    fn serial_mode(&self) -> SerialMode;
    fn set_serial_mode(&mut self, mode: SerialMode) -> EngineResult<()>;
}
