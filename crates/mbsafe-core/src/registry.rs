//! Bounded, insertion-ordered set of active socket descriptors
//!
//! A client or RTU session tracks at most one descriptor; a listening server
//! tracks up to the connection ceiling chosen at listen time.

use std::os::unix::io::RawFd;

use crate::error::{ModbusError, Result};

#[derive(Debug, Clone, Default)]
pub struct SocketRegistry {
    sockets: Vec<RawFd>,
    capacity: usize,
}

impl SocketRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            sockets: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append `fd`. Fails with `Capacity` when the ceiling is reached.
    pub fn add(&mut self, fd: RawFd) -> Result<()> {
        if self.is_full() {
            return Err(ModbusError::Capacity {
                capacity: self.capacity,
            });
        }
        self.sockets.push(fd);
        Ok(())
    }

    /// Remove the first occurrence of `fd`. Returns false if it was not present.
    pub fn remove(&mut self, fd: RawFd) -> bool {
        match self.sockets.iter().position(|&s| s == fd) {
            Some(idx) => {
                self.sockets.remove(idx);
                true
            }
            None => false,
        }
    }

    #[inline]
    pub fn contains(&self, fd: RawFd) -> bool {
        self.sockets.contains(&fd)
    }

    /// Empty the registry, returning what it held in insertion order.
    pub fn remove_all(&mut self) -> Vec<RawFd> {
        std::mem::take(&mut self.sockets)
    }

    /// Empty the registry and install a new ceiling.
    pub fn reset(&mut self, capacity: usize) -> Vec<RawFd> {
        self.capacity = capacity;
        self.remove_all()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.sockets.len() >= self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.sockets.iter().copied()
    }

    pub fn as_slice(&self) -> &[RawFd] {
        &self.sockets
    }
}
