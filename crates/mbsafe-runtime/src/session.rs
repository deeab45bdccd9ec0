//! Thread-safe protocol session
//!
//! A [`ProtocolSession`] owns one protocol engine and makes it usable from
//! several threads. Every operation runs under the session's reentrant lock,
//! with one exception: readiness waits. Before blocking in `poll(2)` the
//! operation records what it waits for, drops the lock, waits on its
//! descriptors plus the cancellation pipe, then takes the lock back and
//! drains the pipe. That drop is what lets `close()` run from another thread
//! while a reader is parked, and the pipe is how `close()` wakes it.
//!
//! # Lifecycle
//!
//! ```text
//! client / RTU:  new ──► connect ──► Connected ◄──► Closed
//! server:        new ──► listen  ──► Listening ◄──► Accepting (0..=N clients)
//!                          release() ──► Released (terminal)
//! ```
//!
//! Do not start a wait while holding an outer [`SessionLock`]: the wait only
//! lowers the recursion depth, so `close()` on another thread cannot get in.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::time::Duration;

use mbsafe_core::codes::ExceptionCode;
use mbsafe_core::error::{ModbusError, Result};
use mbsafe_core::lock::{ReentrantLock, ScopedLockGuard};
use mbsafe_core::mapping::{Mapping, MappingId};
use mbsafe_core::registry::SocketRegistry;
use mbsafe_core::traits::{ListeningEngine, ProtocolEngine, SerialEngine, SerialMode};
use mbsafe_core::{kdebug, kwarn};

use crate::config::SessionConfig;
use crate::engine::{Parity, RtuEngine, TcpEngine};
use crate::poller::{CancellablePoller, WaitOutcome};

/// Session over Modbus TCP-PI
pub type ModbusTcpPi = ProtocolSession<TcpEngine>;

/// Session over Modbus RTU
pub type ModbusRtu = ProtocolSession<RtuEngine>;

/// What an outstanding readiness wait is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    Idle,
    ForRead,
    ForAccept,
    ForEither,
}

impl WaitState {
    #[inline]
    pub fn includes_read(self) -> bool {
        matches!(self, WaitState::ForRead | WaitState::ForEither)
    }

    #[inline]
    pub fn includes_accept(self) -> bool {
        matches!(self, WaitState::ForAccept | WaitState::ForEither)
    }

    #[inline]
    pub fn is_waiting(self) -> bool {
        self.includes_read() || self.includes_accept()
    }
}

struct SessionState<E> {
    engine: Option<E>,
    sockets: SocketRegistry,
    wait: WaitState,
    waiting_on: Vec<RawFd>,
    mappings: HashMap<MappingId, Mapping>,
    listener: Option<RawFd>,
}

impl<E: ProtocolEngine> SessionState<E> {
    fn engine(&self) -> Result<&E> {
        self.engine.as_ref().ok_or(ModbusError::UseAfterRelease)
    }

    fn engine_mut(&mut self) -> Result<&mut E> {
        self.engine.as_mut().ok_or(ModbusError::UseAfterRelease)
    }

    fn close_clients(&mut self) {
        let fds = self.sockets.remove_all();
        if let Some(engine) = self.engine.as_mut() {
            for fd in fds {
                close_fd(engine, fd);
            }
        }
    }

    fn close_listener(&mut self) {
        if let Some(fd) = self.listener.take() {
            if let Some(engine) = self.engine.as_mut() {
                close_fd(engine, fd);
            }
        }
    }
}

/// Close `fd` through the engine, which only closes its current descriptor:
/// select `fd`, close, select the previous one again.
fn close_fd<E: ProtocolEngine>(engine: &mut E, fd: RawFd) {
    let previous = engine.socket();
    engine.set_socket(Some(fd));
    engine.close();
    engine.set_socket(if previous == Some(fd) { None } else { previous });
    kdebug!("{}: closed fd {}", engine.name(), fd);
}

type StateGuard<'a, E> = ScopedLockGuard<'a, RefCell<SessionState<E>>>;

/// Proof that the calling thread holds a session's lock.
///
/// While it is alive other threads block on every session operation, and
/// this thread may keep calling them (the lock is reentrant). Dropping it
/// releases the lock.
pub struct SessionLock<'a, E: ProtocolEngine> {
    _guard: StateGuard<'a, E>,
}

pub struct ProtocolSession<E: ProtocolEngine> {
    state: ReentrantLock<RefCell<SessionState<E>>>,
    poller: CancellablePoller,
}

impl<E: ProtocolEngine> ProtocolSession<E> {
    /// Wrap an engine. The registry starts with capacity 1 (client mode).
    pub fn with_engine(engine: E) -> Result<Self> {
        let poller = CancellablePoller::new()?;
        let session = Self {
            state: ReentrantLock::new(RefCell::new(SessionState {
                engine: Some(engine),
                sockets: SocketRegistry::new(1),
                wait: WaitState::Idle,
                waiting_on: Vec::new(),
                mappings: HashMap::new(),
                listener: None,
            })),
            poller,
        };
        // construction fails if the lock cannot be taken at all
        drop(session.state.lock()?);
        Ok(session)
    }

    /// Apply timeouts, debug mode and slave id from `config`.
    pub fn configure(&self, config: &SessionConfig) -> Result<()> {
        config
            .validate()
            .map_err(|e| match e {
                crate::config::ConfigError::InvalidValue(msg) => ModbusError::InvalidArgument(msg),
            })?;
        self.with_engine_op(|engine| {
            engine.set_response_timeout(config.response_timeout);
            engine.set_byte_timeout(config.byte_timeout);
            engine.set_debug(config.debug);
            if let Some(id) = config.slave_id {
                engine.set_slave(id)?;
            }
            Ok(())
        })
    }

    /// Take the session lock and hold it until the returned value drops.
    pub fn lock(&self) -> Result<SessionLock<'_, E>> {
        Ok(SessionLock {
            _guard: self.state.lock()?,
        })
    }

    /// Run `f` with the session lock held, so a sequence of operations is
    /// not interleaved with other threads.
    pub fn with_lock<R>(&self, f: impl FnOnce(&Self) -> R) -> Result<R> {
        let _held = self.lock()?;
        Ok(f(self))
    }

    /// Lock, check for release, run `f` on the engine.
    fn with_engine_op<R>(
        &self,
        f: impl FnOnce(&mut E) -> mbsafe_core::EngineResult<R>,
    ) -> Result<R> {
        let guard = self.state.lock()?;
        let mut st = guard.borrow_mut();
        let engine = st.engine_mut()?;
        Ok(f(engine)?)
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SessionState<E>) -> Result<R>) -> Result<R> {
        let guard = self.state.lock()?;
        let mut st = guard.borrow_mut();
        st.engine()?;
        f(&mut *st)
    }

    /// The single lock-drop point.
    ///
    /// Records the wait, releases the lock, polls `fds` plus the pipe,
    /// reacquires, resets the wait and drains the pipe. A signal that lands
    /// before the drain turns the outcome into `Cancelled`.
    fn wait(
        &self,
        guard: &mut StateGuard<'_, E>,
        kind: WaitState,
        fds: &[RawFd],
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome> {
        {
            let mut st = guard.borrow_mut();
            st.wait = kind;
            st.waiting_on = fds.to_vec();
        }

        guard.release();
        if self.state.is_held_by_current_thread() {
            kwarn!("session: blocking wait entered while an outer session lock is held");
        }
        let outcome = self.poller.poll_readable(fds, timeout);
        guard.reacquire()?;

        {
            let mut st = guard.borrow_mut();
            st.wait = WaitState::Idle;
            st.waiting_on.clear();
        }

        if self.poller.drain() > 0 {
            return Ok(WaitOutcome::Cancelled);
        }
        outcome
    }

    // -- lifecycle ---------------------------------------------------------

    /// Connect the engine. On success the registry holds exactly the new
    /// descriptor. Descriptors left from an earlier connection are closed.
    pub fn connect(&self) -> Result<RawFd> {
        self.with_state(|st| {
            let fd = st.engine_mut()?.connect()?;
            st.close_clients();
            st.sockets.reset(1);
            st.sockets.add(fd)?;
            if let Some(engine) = st.engine.as_mut() {
                engine.set_socket(Some(fd));
            }
            kdebug!("session: connected fd {}", fd);
            Ok(fd)
        })
    }

    /// Close every registered descriptor and the listener, if any.
    ///
    /// A thread blocked in a readiness wait is woken with `Cancelled`.
    pub fn close(&self) -> Result<()> {
        self.with_state(|st| {
            if st.wait.is_waiting() {
                self.poller.signal_cancel()?;
            }
            st.close_clients();
            st.close_listener();
            Ok(())
        })
    }

    /// Close one descriptor.
    ///
    /// The listener cascades to a full `close()`. A registered client is
    /// removed and closed alone. Anything else is ignored.
    pub fn close_socket(&self, fd: RawFd) -> Result<()> {
        self.with_state(|st| {
            if st.listener == Some(fd) {
                if st.wait.is_waiting() {
                    self.poller.signal_cancel()?;
                }
                st.close_clients();
                st.close_listener();
                return Ok(());
            }
            if st.sockets.remove(fd) {
                if st.waiting_on.contains(&fd) {
                    self.poller.signal_cancel()?;
                }
                let engine = st.engine_mut()?;
                close_fd(engine, fd);
            }
            Ok(())
        })
    }

    /// Close every client, keep listening.
    pub fn close_clients(&self) -> Result<()> {
        self.with_state(|st| {
            let waited = st.sockets.iter().any(|fd| st.waiting_on.contains(&fd));
            if waited {
                self.poller.signal_cancel()?;
            }
            st.close_clients();
            Ok(())
        })
    }

    /// Close everything, drop the engine and forget all mappings.
    ///
    /// Idempotent. Every later operation fails with `UseAfterRelease`.
    pub fn release(&self) -> Result<()> {
        let guard = self.state.lock()?;
        let engine = {
            let mut st = guard.borrow_mut();
            if st.engine.is_none() {
                return Ok(());
            }
            if st.wait.is_waiting() {
                self.poller.signal_cancel()?;
            }
            st.close_clients();
            st.close_listener();
            st.mappings.clear();
            st.engine.take()
        };
        if let Some(engine) = engine {
            kdebug!("session: releasing {} engine", engine.name());
            drop(engine);
        }
        Ok(())
    }

    pub fn is_released(&self) -> bool {
        match self.state.lock() {
            Ok(guard) => guard.borrow().engine.is_none(),
            Err(_) => true,
        }
    }

    // -- server side -------------------------------------------------------

    /// Wait for a request on the engine's current descriptor and read it.
    ///
    /// `Ok(0)` means the engine read a frame addressed to another slave.
    pub fn receive(&self, buf: &mut [u8]) -> Result<usize> {
        let mut guard = self.state.lock()?;
        let fd = {
            let st = guard.borrow();
            let fd = st.engine()?.socket().ok_or(ModbusError::UnknownSocket(-1))?;
            if !st.sockets.contains(fd) {
                return Err(ModbusError::UnknownSocket(fd));
            }
            fd
        };

        match self.wait(&mut guard, WaitState::ForRead, &[fd], None)? {
            WaitOutcome::Ready(_) => {}
            WaitOutcome::Cancelled | WaitOutcome::TimedOut => return Err(ModbusError::Cancelled),
        }

        let mut st = guard.borrow_mut();
        if !st.sockets.contains(fd) {
            return Err(ModbusError::Cancelled);
        }
        let engine = st.engine_mut()?;
        engine.set_socket(Some(fd));
        Ok(engine.receive(buf)?)
    }

    /// Wait for readiness across the listener and every client.
    ///
    /// Ready descriptors come back listener first, then clients in
    /// registration order. A session that is not listening fails with
    /// `NotListening` without waiting.
    pub fn select_read(&self) -> Result<Vec<RawFd>> {
        self.select(None)
    }

    /// As [`select_read`](Self::select_read), an elapsed timeout yields an
    /// empty set.
    pub fn select_read_timeout(&self, timeout: Duration) -> Result<Vec<RawFd>> {
        self.select(Some(timeout))
    }

    fn select(&self, timeout: Option<Duration>) -> Result<Vec<RawFd>> {
        let mut guard = self.state.lock()?;
        let fds: Vec<RawFd> = {
            let st = guard.borrow();
            st.engine()?;
            // nothing could wake a wait on the pipe alone
            let listener = st.listener.ok_or(ModbusError::NotListening)?;
            std::iter::once(listener).chain(st.sockets.iter()).collect()
        };

        match self.wait(&mut guard, WaitState::ForEither, &fds, timeout)? {
            WaitOutcome::Ready(ready) => {
                let st = guard.borrow();
                Ok(ready
                    .into_iter()
                    .filter(|&fd| st.listener == Some(fd) || st.sockets.contains(fd))
                    .collect())
            }
            WaitOutcome::TimedOut => Ok(Vec::new()),
            WaitOutcome::Cancelled => Err(ModbusError::Cancelled),
        }
    }

    /// Answer `request` from `mapping`, which must belong to this session.
    pub fn reply(&self, request: &[u8], mapping: &Mapping) -> Result<usize> {
        self.with_state(|st| {
            let id = mapping.id();
            if !st.mappings.contains_key(&id) {
                return Err(ModbusError::UnknownMapping(id));
            }
            Ok(st.engine_mut()?.reply(request, mapping)?)
        })
    }

    pub fn reply_exception(&self, request: &[u8], exception: ExceptionCode) -> Result<usize> {
        self.with_engine_op(|engine| engine.reply_exception(request, exception))
    }

    /// Create a mapping owned by this session.
    pub fn mapping_new(
        &self,
        nb_bits: usize,
        nb_input_bits: usize,
        nb_registers: usize,
        nb_input_registers: usize,
    ) -> Result<Mapping> {
        self.with_state(|st| {
            let mapping = Mapping::new(nb_bits, nb_input_bits, nb_registers, nb_input_registers);
            st.mappings.insert(mapping.id(), mapping.clone());
            Ok(mapping)
        })
    }

    /// Forget `mapping`. Unknown mappings are ignored.
    pub fn mapping_free(&self, mapping: &Mapping) -> Result<()> {
        self.with_state(|st| {
            st.mappings.remove(&mapping.id());
            Ok(())
        })
    }

    // -- introspection -----------------------------------------------------

    /// Registered descriptors in registration order
    pub fn sockets(&self) -> Result<Vec<RawFd>> {
        self.with_state(|st| Ok(st.sockets.as_slice().to_vec()))
    }

    /// Capacity ceiling of the registry
    pub fn max_connections(&self) -> Result<usize> {
        self.with_state(|st| Ok(st.sockets.capacity()))
    }

    pub fn listener(&self) -> Result<Option<RawFd>> {
        self.with_state(|st| Ok(st.listener))
    }

    pub fn wait_state(&self) -> Result<WaitState> {
        self.with_state(|st| Ok(st.wait))
    }

    // -- passthroughs ------------------------------------------------------

    pub fn name(&self) -> Result<&'static str> {
        self.with_state(|st| Ok(st.engine()?.name()))
    }

    pub fn socket(&self) -> Result<Option<RawFd>> {
        self.with_state(|st| Ok(st.engine()?.socket()))
    }

    pub fn set_socket(&self, fd: Option<RawFd>) -> Result<()> {
        self.with_engine_op(|engine| {
            engine.set_socket(fd);
            Ok(())
        })
    }

    pub fn set_slave(&self, slave: u8) -> Result<()> {
        self.with_engine_op(|engine| engine.set_slave(slave))
    }

    pub fn set_debug(&self, debug: bool) -> Result<()> {
        self.with_engine_op(|engine| {
            engine.set_debug(debug);
            Ok(())
        })
    }

    pub fn response_timeout(&self) -> Result<Duration> {
        self.with_state(|st| Ok(st.engine()?.response_timeout()))
    }

    pub fn set_response_timeout(&self, timeout: Duration) -> Result<()> {
        self.with_engine_op(|engine| {
            engine.set_response_timeout(timeout);
            Ok(())
        })
    }

    pub fn byte_timeout(&self) -> Result<Duration> {
        self.with_state(|st| Ok(st.engine()?.byte_timeout()))
    }

    pub fn set_byte_timeout(&self, timeout: Duration) -> Result<()> {
        self.with_engine_op(|engine| {
            engine.set_byte_timeout(timeout);
            Ok(())
        })
    }

    pub fn header_length(&self) -> Result<usize> {
        self.with_state(|st| Ok(st.engine()?.header_length()))
    }

    pub fn max_adu_length(&self) -> Result<usize> {
        self.with_state(|st| Ok(st.engine()?.max_adu_length()))
    }

    // -- client side -------------------------------------------------------

    pub fn read_bits(&self, addr: u16, dest: &mut [bool]) -> Result<usize> {
        self.with_engine_op(|engine| engine.read_bits(addr, dest))
    }

    pub fn read_input_bits(&self, addr: u16, dest: &mut [bool]) -> Result<usize> {
        self.with_engine_op(|engine| engine.read_input_bits(addr, dest))
    }

    pub fn read_registers(&self, addr: u16, dest: &mut [u16]) -> Result<usize> {
        self.with_engine_op(|engine| engine.read_registers(addr, dest))
    }

    pub fn read_input_registers(&self, addr: u16, dest: &mut [u16]) -> Result<usize> {
        self.with_engine_op(|engine| engine.read_input_registers(addr, dest))
    }

    pub fn write_bit(&self, addr: u16, value: bool) -> Result<()> {
        self.with_engine_op(|engine| engine.write_bit(addr, value))
    }

    pub fn write_bits(&self, addr: u16, values: &[bool]) -> Result<usize> {
        self.with_engine_op(|engine| engine.write_bits(addr, values))
    }

    pub fn write_register(&self, addr: u16, value: u16) -> Result<()> {
        self.with_engine_op(|engine| engine.write_register(addr, value))
    }

    pub fn write_registers(&self, addr: u16, values: &[u16]) -> Result<usize> {
        self.with_engine_op(|engine| engine.write_registers(addr, values))
    }

    pub fn write_and_read_registers(
        &self,
        write_addr: u16,
        src: &[u16],
        read_addr: u16,
        dest: &mut [u16],
    ) -> Result<usize> {
        self.with_engine_op(|engine| engine.write_and_read_registers(write_addr, src, read_addr, dest))
    }
}

impl<E: ListeningEngine> ProtocolSession<E> {
    /// Start listening with room for `max_connections` clients.
    pub fn listen(&self, max_connections: usize) -> Result<RawFd> {
        if max_connections == 0 {
            return Err(ModbusError::InvalidArgument("max_connections must be > 0"));
        }
        self.with_state(|st| {
            if st.listener.is_some() {
                return Err(ModbusError::InvalidArgument("session is already listening"));
            }
            let fd = st.engine_mut()?.listen(max_connections)?;
            st.close_clients();
            st.sockets.reset(max_connections);
            st.listener = Some(fd);
            kdebug!("session: listening on fd {} for {} clients", fd, max_connections);
            Ok(fd)
        })
    }

    /// Wait for and accept one peer on `listen_fd`.
    ///
    /// When the registry is full the peer is closed right away and
    /// `Capacity` is returned.
    pub fn accept(&self, listen_fd: RawFd) -> Result<RawFd> {
        let mut guard = self.state.lock()?;
        {
            let st = guard.borrow();
            st.engine()?;
            match st.listener {
                None => return Err(ModbusError::NotListening),
                Some(fd) if fd != listen_fd => return Err(ModbusError::UnknownSocket(listen_fd)),
                Some(_) => {}
            }
        }

        match self.wait(&mut guard, WaitState::ForAccept, &[listen_fd], None)? {
            WaitOutcome::Ready(_) => {}
            WaitOutcome::Cancelled | WaitOutcome::TimedOut => return Err(ModbusError::Cancelled),
        }

        let mut st = guard.borrow_mut();
        if st.listener != Some(listen_fd) {
            return Err(ModbusError::Cancelled);
        }
        let full = st.sockets.is_full();
        let capacity = st.sockets.capacity();
        let engine = st.engine_mut()?;
        let previous = engine.socket();
        let fd = engine.accept(listen_fd)?;

        if full {
            close_fd(engine, fd);
            engine.set_socket(previous);
            kwarn!(
                "session: connection limit {} reached, closed new peer fd {}",
                capacity, fd
            );
            return Err(ModbusError::Capacity { capacity });
        }
        st.sockets.add(fd)?;
        kdebug!("session: accepted fd {}", fd);
        Ok(fd)
    }

    pub fn local_addr(&self, fd: RawFd) -> Result<SocketAddr> {
        self.with_state(|st| Ok(st.engine()?.local_addr(fd)?))
    }
}

impl<E: SerialEngine> ProtocolSession<E> {
    pub fn serial_mode(&self) -> Result<SerialMode> {
        self.with_state(|st| Ok(st.engine()?.serial_mode()))
    }

    pub fn set_serial_mode(&self, mode: SerialMode) -> Result<()> {
        self.with_engine_op(|engine| engine.set_serial_mode(mode))
    }
}

impl ProtocolSession<TcpEngine> {
    /// TCP-PI session. `node` may be a host name, an IPv4 or IPv6 address,
    /// or empty for "any".
    pub fn new_tcp_pi(node: &str, service: &str) -> Result<Self> {
        Self::with_engine(TcpEngine::new_tcp_pi(node, service))
    }

    /// TCP-PI session with `config` applied.
    pub fn with_config(node: &str, service: &str, config: &SessionConfig) -> Result<Self> {
        let session = Self::new_tcp_pi(node, service)?;
        session.configure(config)?;
        Ok(session)
    }
}

impl ProtocolSession<RtuEngine> {
    /// RTU session on a serial device, e.g. `/dev/ttyUSB0`, 19200, 'E', 8, 1.
    pub fn new_rtu(device: &str, baud: u32, parity: Parity, data_bits: u8, stop_bits: u8) -> Result<Self> {
        Self::with_engine(RtuEngine::new_rtu(device, baud, parity, data_bits, stop_bits))
    }
}

impl<E: ProtocolEngine> Drop for ProtocolSession<E> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            kwarn!("session: release on drop failed: {}", e);
        }
    }
}

impl<E: ProtocolEngine> std::fmt::Debug for ProtocolSession<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut d = f.debug_struct("ProtocolSession");
        match self.state.try_lock() {
            Some(guard) => match guard.try_borrow() {
                Ok(st) => {
                    d.field("engine", &st.engine.as_ref().map(|e| e.name()))
                        .field("sockets", &st.sockets.as_slice())
                        .field("listener", &st.listener)
                        .field("wait", &st.wait);
                }
                Err(_) => {
                    d.field("state", &"<borrowed>");
                }
            },
            None => {
                d.field("state", &"<locked>");
            }
        }
        d.field("poller", &self.poller).finish()
    }
}
