//! Modbus TCP-PI transport
//!
//! Protocol independent: the node is resolved by name and may be IPv4 or
//! IPv6. A listening socket bound to `::` accepts both families.
//!
//! Frames carry the MBAP header: transaction id, protocol id (always 0),
//! length of the remaining bytes, unit id. A response whose transaction or
//! protocol id does not match the request is rejected with `BadData`.

use std::mem::ManuallyDrop;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::{FromRawFd, IntoRawFd, RawFd};
use std::time::Duration;

use mbsafe_core::codes::ErrorCode;
use mbsafe_core::constants::*;
use mbsafe_core::error::EngineResult;
use mbsafe_core::kdebug;
use mbsafe_core::traits::ListeningEngine;

use super::{ModbusEngine, Transport};

pub struct TcpTransport {
    node: String,
    service: String,
    transaction_id: u16,
}

impl TcpTransport {
    pub fn new(node: &str, service: &str) -> Self {
        Self {
            node: node.to_string(),
            service: service.to_string(),
            transaction_id: 0,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Resolve node and service. An empty node means "any address".
    fn resolve(&self) -> EngineResult<Vec<SocketAddr>> {
        let port: u16 = self
            .service
            .trim()
            .parse()
            .map_err(|_| ErrorCode::Os(libc::EINVAL))?;
        let node = if self.node.is_empty() { "::" } else { self.node.as_str() };
        let addrs: Vec<SocketAddr> = (node, port).to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(ErrorCode::Os(libc::EADDRNOTAVAIL));
        }
        Ok(addrs)
    }
}

impl Transport for TcpTransport {
    const NAME: &'static str = "tcp-pi";
    const HEADER_LENGTH: usize = MODBUS_TCP_HEADER_LENGTH;
    const CHECKSUM_LENGTH: usize = 0;
    const MAX_ADU_LENGTH: usize = MODBUS_TCP_MAX_ADU_LENGTH;

    fn connect(&mut self, response_timeout: Duration) -> EngineResult<RawFd> {
        let mut last_err = ErrorCode::ConnectionRefused;
        for addr in self.resolve()? {
            match TcpStream::connect_timeout(&addr, response_timeout) {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    return Ok(stream.into_raw_fd());
                }
                Err(e) => {
                    kdebug!("tcp-pi: connect to {} failed: {}", addr, e);
                    last_err = e.into();
                }
            }
        }
        Err(last_err)
    }

    fn close(&mut self, fd: RawFd) {
        // shutdown first: wakes any thread still blocked on the descriptor
        unsafe {
            libc::shutdown(fd, libc::SHUT_RDWR);
            libc::close(fd);
        }
    }

    fn send(&mut self, fd: RawFd, buf: &[u8]) -> EngineResult<usize> {
        loop {
            let n = unsafe {
                libc::send(
                    fd,
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                    libc::MSG_NOSIGNAL,
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let errno = unsafe { *libc::__errno_location() };
            if errno != libc::EINTR {
                return Err(ErrorCode::from_errno(errno));
            }
        }
    }

    fn recv(&mut self, fd: RawFd, buf: &mut [u8]) -> EngineResult<usize> {
        loop {
            let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let errno = unsafe { *libc::__errno_location() };
            if errno != libc::EINTR {
                return Err(ErrorCode::from_errno(errno));
            }
        }
    }

    fn flush(&mut self, fd: RawFd) {
        let mut buf = [0u8; MODBUS_TCP_MAX_ADU_LENGTH];
        loop {
            let n = unsafe {
                libc::recv(
                    fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    libc::MSG_DONTWAIT,
                )
            };
            if n <= 0 {
                return;
            }
        }
    }

    fn valid_slave(&self, _slave: u8) -> bool {
        true
    }

    fn request_header(&mut self, slave: u8) -> Vec<u8> {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        let mut msg = Vec::with_capacity(MODBUS_TCP_MAX_ADU_LENGTH);
        msg.extend_from_slice(&self.transaction_id.to_be_bytes());
        msg.extend_from_slice(&[0, 0, 0, 0]);
        msg.push(slave);
        msg
    }

    fn response_header(&self, req: &[u8]) -> Vec<u8> {
        let mut msg = Vec::with_capacity(MODBUS_TCP_MAX_ADU_LENGTH);
        msg.extend_from_slice(&req[0..2]);
        msg.extend_from_slice(&[0, 0, 0, 0]);
        msg.push(req[6]);
        msg
    }

    fn finalize(&self, msg: &mut Vec<u8>) {
        let len = (msg.len() - 6) as u16;
        msg[4..6].copy_from_slice(&len.to_be_bytes());
    }

    fn check_integrity(&self, _msg: &[u8]) -> EngineResult<()> {
        Ok(())
    }

    fn check_confirmation(&self, req: &[u8], rsp: &[u8]) -> EngineResult<()> {
        if req[0..2] != rsp[0..2] {
            kdebug!(
                "tcp-pi: invalid transaction id (0x{:02X}{:02X} != 0x{:02X}{:02X})",
                req[0], req[1], rsp[0], rsp[1]
            );
            return Err(ErrorCode::BadData);
        }
        if rsp[2] != 0 || rsp[3] != 0 {
            return Err(ErrorCode::BadData);
        }
        Ok(())
    }
}

impl ModbusEngine<TcpTransport> {
    /// TCP-PI engine for `node` / `service` (a port number).
    ///
    /// Nothing is resolved or opened until `connect` or `listen`.
    pub fn new_tcp_pi(node: &str, service: &str) -> Self {
        Self::from_transport(TcpTransport::new(node, service), MODBUS_TCP_SLAVE)
    }
}

impl ListeningEngine for ModbusEngine<TcpTransport> {
    fn listen(&mut self, backlog: usize) -> EngineResult<RawFd> {
        let mut last_err = ErrorCode::Os(libc::EADDRNOTAVAIL);
        for addr in self.transport().resolve()? {
            match listen_on(&addr, backlog) {
                Ok(fd) => {
                    kdebug!("tcp-pi: listening on {} (fd {}, backlog {})", addr, fd, backlog);
                    self.fd = Some(fd);
                    return Ok(fd);
                }
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    fn accept(&mut self, listen_fd: RawFd) -> EngineResult<RawFd> {
        loop {
            let fd = unsafe {
                libc::accept4(
                    listen_fd,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    libc::SOCK_CLOEXEC,
                )
            };
            if fd >= 0 {
                set_nodelay(fd);
                self.fd = Some(fd);
                return Ok(fd);
            }
            let errno = unsafe { *libc::__errno_location() };
            if errno != libc::EINTR {
                return Err(ErrorCode::from_errno(errno));
            }
        }
    }

    fn local_addr(&self, fd: RawFd) -> EngineResult<SocketAddr> {
        // borrow the descriptor without taking ownership
        let listener = ManuallyDrop::new(unsafe { TcpListener::from_raw_fd(fd) });
        Ok(listener.local_addr()?)
    }
}

fn set_nodelay(fd: RawFd) {
    let one: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &one as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

fn last_errno() -> ErrorCode {
    ErrorCode::from_errno(unsafe { *libc::__errno_location() })
}

fn setsockopt_int(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> EngineResult<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(last_errno());
    }
    Ok(())
}

/// socket + SO_REUSEADDR + bind + listen. IPv6 sockets are dual-stack.
fn listen_on(addr: &SocketAddr, backlog: usize) -> EngineResult<RawFd> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe { libc::socket(family, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(last_errno());
    }

    let result = (|| {
        setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
        if family == libc::AF_INET6 {
            setsockopt_int(fd, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, 0)?;
        }

        let (storage, len) = sockaddr_of(addr);
        let ret = unsafe {
            libc::bind(
                fd,
                &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
                len,
            )
        };
        if ret < 0 {
            return Err(last_errno());
        }

        let backlog = backlog.min(libc::c_int::MAX as usize) as libc::c_int;
        if unsafe { libc::listen(fd, backlog) } < 0 {
            return Err(last_errno());
        }
        Ok(())
    })();

    match result {
        Ok(()) => Ok(fd),
        Err(e) => {
            unsafe { libc::close(fd) };
            Err(e)
        }
    }
}

fn sockaddr_of(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}
