//! The buffer collaborator.
//!
//! The design treats the buffer type as an external abstraction: a typed
//! byte region that distinguishes its "used" (already written) prefix from
//! its "available" (writable) remainder and supports append. `ByteSource`
//! is that abstraction's minimal surface, enough for the message builder to
//! compute resume points and scatter/gather vectors without knowing how the
//! buffer is actually stored.
//!
//! Most callers will use [`Vec<u8>`]'s implementation, which treats the
//! whole vector as "used" and has no spare "available" capacity of its own
//! until [`ByteSource::reserve_available`] is called.

/// A byte region with a used prefix and an available (writable) remainder.
pub trait ByteSource: std::fmt::Debug {
    /// The bytes already written into this buffer.
    fn used(&self) -> &[u8];

    /// The writable remainder, ready to receive incoming bytes.
    fn available_mut(&mut self) -> &mut [u8];

    /// Marks `n` bytes of the available region as now used, typically after
    /// a receive places bytes directly into it.
    fn advance(&mut self, n: usize);

    /// Grows the available region by at least `additional` bytes.
    fn reserve_available(&mut self, additional: usize);

    /// True if this buffer holds no bytes and has no available capacity.
    fn is_empty(&self) -> bool {
        self.used().is_empty()
    }
}

/// A growable buffer backed by a `Vec<u8>`, splitting it into a used prefix
/// (`0..len`) and an available suffix (`len..capacity`).
#[derive(Debug, Default, Clone)]
pub struct OwnedBuffer {
    data: Vec<u8>,
    len: usize,
}

impl OwnedBuffer {
    pub fn new() -> Self {
        OwnedBuffer {
            data: Vec::new(),
            len: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        OwnedBuffer {
            data: vec![0u8; capacity],
            len: 0,
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        let len = data.len();
        OwnedBuffer { data, len }
    }

    pub fn into_vec(mut self) -> Vec<u8> {
        self.data.truncate(self.len);
        self.data
    }
}

impl ByteSource for OwnedBuffer {
    fn used(&self) -> &[u8] {
        &self.data[..self.len]
    }

    fn available_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.len..]
    }

    fn advance(&mut self, n: usize) {
        assert!(
            self.len + n <= self.data.len(),
            "advance past the end of the buffer"
        );
        self.len += n;
    }

    fn reserve_available(&mut self, additional: usize) {
        self.data.resize(self.data.len() + additional, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_moves_used_boundary() {
        let mut buf = OwnedBuffer::with_capacity(8);
        assert_eq!(buf.used().len(), 0);
        assert_eq!(buf.available_mut().len(), 8);
        buf.advance(3);
        assert_eq!(buf.used().len(), 3);
        assert_eq!(buf.available_mut().len(), 5);
    }

    #[test]
    #[should_panic]
    fn advance_past_capacity_panics() {
        let mut buf = OwnedBuffer::with_capacity(4);
        buf.advance(5);
    }
}
