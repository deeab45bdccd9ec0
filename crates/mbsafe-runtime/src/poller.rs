//! Cancellable readiness wait (self-pipe trick)
//!
//! A private non-blocking pipe is added to every wait. Writing one byte to
//! its write end wakes the waiter, which then reports [`WaitOutcome::Cancelled`]
//! instead of readiness. The pipe is drained after every wait so a signal
//! affects at most the wait it raced with.
//!
//! Coalescing: several `signal_cancel()` calls before the next drain produce a
//! single cancellation. A signal that arrives between a wait returning and
//! its drain is lost for that wait, and one that arrives after the drain
//! surfaces as one spurious cancellation on the following wait.

use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use mbsafe_core::codes::ErrorCode;
use mbsafe_core::error::{ModbusError, Result};
use nix::fcntl::OFlag;

/// Result of a readiness wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Readable descriptors, in the order they were passed in
    Ready(Vec<RawFd>),
    /// The self-pipe fired; readiness of the other descriptors is ignored
    Cancelled,
    /// The timeout elapsed with nothing readable
    TimedOut,
}

impl WaitOutcome {
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, WaitOutcome::Cancelled)
    }
}

pub struct CancellablePoller {
    read_end: OwnedFd,
    write_end: OwnedFd,
}

impl CancellablePoller {
    /// Create the pipe, both ends `O_NONBLOCK | O_CLOEXEC`.
    pub fn new() -> Result<Self> {
        let (read_end, write_end) = nix::unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)
            .map_err(|e| ModbusError::Engine(ErrorCode::from_errno(e as i32)))?;
        Ok(Self { read_end, write_end })
    }

    /// Wake a concurrent waiter. Never blocks.
    ///
    /// A full pipe (EAGAIN) means a wake-up is already pending and is not an
    /// error.
    pub fn signal_cancel(&self) -> Result<()> {
        let byte: u8 = 1;
        let ret = unsafe {
            libc::write(
                self.write_end.as_raw_fd(),
                &byte as *const u8 as *const libc::c_void,
                1,
            )
        };
        if ret < 0 {
            let errno = unsafe { *libc::__errno_location() };
            if errno == libc::EAGAIN {
                return Ok(());
            }
            return Err(ModbusError::Engine(ErrorCode::from_errno(errno)));
        }
        Ok(())
    }

    /// Block until one of `fds` is readable, the pipe fires, or `timeout`
    /// elapses (`None` waits forever). Does not drain the pipe.
    pub fn poll_readable(&self, fds: &[RawFd], timeout: Option<Duration>) -> Result<WaitOutcome> {
        let mut pollfds: Vec<libc::pollfd> = Vec::with_capacity(fds.len() + 1);
        pollfds.push(libc::pollfd {
            fd: self.read_end.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        pollfds.extend(fds.iter().map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        }));

        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let timeout_ms = match deadline {
                None => -1,
                Some(d) => millis_until(d),
            };

            let ret = unsafe {
                libc::poll(
                    pollfds.as_mut_ptr(),
                    pollfds.len() as libc::nfds_t,
                    timeout_ms,
                )
            };

            if ret < 0 {
                let errno = unsafe { *libc::__errno_location() };
                if errno == libc::EINTR {
                    continue;
                }
                return Err(ModbusError::Engine(ErrorCode::from_errno(errno)));
            }

            if ret == 0 {
                return Ok(WaitOutcome::TimedOut);
            }

            if pollfds[0].revents != 0 {
                return Ok(WaitOutcome::Cancelled);
            }

            // HUP/ERR count as readable: the following read reports the failure
            let ready: Vec<RawFd> = pollfds[1..]
                .iter()
                .filter(|p| p.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
                .map(|p| p.fd)
                .collect();

            if ready.is_empty() {
                // only POLLNVAL on a caller descriptor
                return Err(ModbusError::Engine(ErrorCode::from_errno(libc::EBADF)));
            }
            return Ok(WaitOutcome::Ready(ready));
        }
    }

    /// Read the pipe until empty. Returns the number of bytes consumed.
    pub fn drain(&self) -> usize {
        let mut buf = [0u8; 64];
        let mut total = 0;
        loop {
            let n = unsafe {
                libc::read(
                    self.read_end.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n > 0 {
                total += n as usize;
                continue;
            }
            if n < 0 && unsafe { *libc::__errno_location() } == libc::EINTR {
                continue;
            }
            // EAGAIN: empty
            return total;
        }
    }

    /// `poll_readable` followed by `drain`, for callers that hold no lock.
    pub fn wait_readable(&self, fds: &[RawFd], timeout: Option<Duration>) -> Result<WaitOutcome> {
        let outcome = self.poll_readable(fds, timeout);
        self.drain();
        outcome
    }

    /// Read end of the pipe
    pub fn fd(&self) -> RawFd {
        self.read_end.as_raw_fd()
    }
}

/// Milliseconds left until `deadline`, rounded up so a sub-millisecond
/// remainder does not turn into a busy poll.
fn millis_until(deadline: Instant) -> libc::c_int {
    let left = deadline.saturating_duration_since(Instant::now());
    let ms = left.as_nanos().div_ceil(1_000_000);
    ms.min(libc::c_int::MAX as u128) as libc::c_int
}

impl std::fmt::Debug for CancellablePoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellablePoller")
            .field("read_end", &self.read_end.as_raw_fd())
            .field("write_end", &self.write_end.as_raw_fd())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;

    #[test]
    fn test_timeout() {
        let poller = CancellablePoller::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        let start = Instant::now();
        let out = poller
            .poll_readable(&[a.as_raw_fd()], Some(Duration::from_millis(30)))
            .unwrap();
        assert_eq!(out, WaitOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_ready() {
        let poller = CancellablePoller::new().unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        let (c, _d) = UnixStream::pair().unwrap();
        b.write_all(b"x").unwrap();
        let out = poller
            .poll_readable(&[c.as_raw_fd(), a.as_raw_fd()], None)
            .unwrap();
        assert_eq!(out, WaitOutcome::Ready(vec![a.as_raw_fd()]));
    }

    #[test]
    fn test_cancel_wins_over_readiness() {
        let poller = CancellablePoller::new().unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        b.write_all(b"x").unwrap();
        poller.signal_cancel().unwrap();
        let out = poller.wait_readable(&[a.as_raw_fd()], None).unwrap();
        assert!(out.is_cancelled());
        // drained: the next wait sees the data
        let out = poller.wait_readable(&[a.as_raw_fd()], None).unwrap();
        assert_eq!(out, WaitOutcome::Ready(vec![a.as_raw_fd()]));
    }

    #[test]
    fn test_signals_coalesce() {
        let poller = CancellablePoller::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        for _ in 0..10 {
            poller.signal_cancel().unwrap();
        }
        let short = Some(Duration::from_millis(10));
        let first = poller.wait_readable(&[a.as_raw_fd()], short).unwrap();
        let second = poller.wait_readable(&[a.as_raw_fd()], short).unwrap();
        let third = poller.wait_readable(&[a.as_raw_fd()], short).unwrap();
        assert!(first.is_cancelled());
        assert_eq!(second, WaitOutcome::TimedOut);
        assert_eq!(third, WaitOutcome::TimedOut);
    }

    #[test]
    fn test_full_pipe_is_not_an_error() {
        let poller = CancellablePoller::new().unwrap();
        // default pipe buffer is 64 KiB; overfill it
        for _ in 0..70_000 {
            poller.signal_cancel().unwrap();
        }
        assert!(poller.drain() > 0);
        assert_eq!(poller.drain(), 0);
    }

    #[test]
    fn test_cancel_from_other_thread() {
        let poller = Arc::new(CancellablePoller::new().unwrap());
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();

        let waiter = {
            let poller = Arc::clone(&poller);
            std::thread::spawn(move || poller.wait_readable(&[fd], None).unwrap())
        };
        std::thread::sleep(Duration::from_millis(20));
        poller.signal_cancel().unwrap();

        assert_eq!(waiter.join().unwrap(), WaitOutcome::Cancelled);
    }
}
