//! Fixed-capacity byte ring for reassembling frames from a serial stream
//!
//! Consuming parsed frames is O(1): `advance` moves the read index instead
//! of shifting the remaining bytes the way `Vec::drain` would.

/// Byte ring with O(1) front consumption
///
/// Const parameter `N` sets the capacity.
pub struct ByteRing<const N: usize = 1024> {
    buf: [u8; N],
    head: usize, // next write slot
    tail: usize, // first unread byte
    len: usize,
}

impl<const N: usize> ByteRing<N> {
    /// Create an empty ring
    pub const fn new() -> Self {
        Self {
            buf: [0u8; N],
            head: 0,
            tail: 0,
            len: 0,
        }
    }

    /// Append bytes, returning how many were accepted
    ///
    /// Bytes past capacity are not stored; the caller decides whether
    /// dropped input is worth counting.
    pub fn push_slice(&mut self, bytes: &[u8]) -> usize {
        let room = N - self.len;
        let take = bytes.len().min(room);
        for &b in &bytes[..take] {
            self.buf[self.head] = b;
            self.head = (self.head + 1) % N;
        }
        self.len += take;
        take
    }

    /// Discard n bytes from the front
    #[inline]
    pub fn advance(&mut self, n: usize) {
        let n = n.min(self.len);
        self.tail = (self.tail + n) % N;
        self.len -= n;
    }

    /// Number of unread bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no bytes are buffered
    #[inline]
    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read the byte at logical offset `index` from the front
    #[inline]
    pub fn get(&self, index: usize) -> Option<u8> {
        if index < self.len {
            Some(self.buf[(self.tail + index) % N])
        } else {
            None
        }
    }

    /// Offset of the first occurrence of the 2-byte sync pattern
    pub fn find_sync(&self, first: u8, second: u8) -> Option<usize> {
        if self.len < 2 {
            return None;
        }
        (0..self.len - 1).find(|&i| {
            self.buf[(self.tail + i) % N] == first && self.buf[(self.tail + i + 1) % N] == second
        })
    }

    /// Copy `out.len()` bytes starting at logical offset `start` into `out`
    ///
    /// Returns false when the requested range is not fully buffered.
    pub fn copy_to(&self, start: usize, out: &mut [u8]) -> bool {
        if start + out.len() > self.len {
            return false;
        }
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.buf[(self.tail + start + i) % N];
        }
        true
    }
}

impl<const N: usize> Default for ByteRing<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_get() {
        let mut ring: ByteRing<16> = ByteRing::new();
        assert!(ring.is_empty());

        assert_eq!(ring.push_slice(&[10, 20, 30]), 3);
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.get(0), Some(10));
        assert_eq!(ring.get(2), Some(30));
        assert_eq!(ring.get(3), None);
    }

    #[test]
    fn test_push_past_capacity() {
        let mut ring: ByteRing<4> = ByteRing::new();
        assert_eq!(ring.push_slice(&[1, 2, 3, 4, 5, 6]), 4);
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.get(3), Some(4));

        ring.advance(2);
        assert_eq!(ring.push_slice(&[7, 8, 9]), 2);
        assert_eq!(ring.get(0), Some(3));
        assert_eq!(ring.get(3), Some(8));
    }

    #[test]
    fn test_advance() {
        let mut ring: ByteRing<16> = ByteRing::new();
        ring.push_slice(&[1, 2, 3, 4, 5]);

        ring.advance(2);
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.get(0), Some(3));

        // advancing past the end just empties the ring
        ring.advance(100);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_wraparound_reads() {
        let mut ring: ByteRing<8> = ByteRing::new();
        ring.push_slice(&[1, 2, 3, 4, 5, 6]);
        ring.advance(5);
        ring.push_slice(&[7, 8, 9]);

        assert_eq!(ring.len(), 4);
        assert_eq!(ring.get(0), Some(6));
        assert_eq!(ring.get(3), Some(9));
    }

    #[test]
    fn test_find_sync() {
        let mut ring: ByteRing<32> = ByteRing::new();
        ring.push_slice(&[0x00, 0x11, 0xA5, 0x5A, 0x05, 0x13]);

        assert_eq!(ring.find_sync(0xA5, 0x5A), Some(2));
        assert_eq!(ring.find_sync(0x00, 0x11), Some(0));
        assert_eq!(ring.find_sync(0xDE, 0xAD), None);
    }

    #[test]
    fn test_find_sync_across_wrap() {
        let mut ring: ByteRing<8> = ByteRing::new();
        ring.push_slice(&[0, 0, 0, 0, 0, 0, 0]);
        ring.advance(6);
        ring.push_slice(&[0xA5, 0x5A, 0x01]);

        assert_eq!(ring.find_sync(0xA5, 0x5A), Some(1));
    }

    #[test]
    fn test_copy_to() {
        let mut ring: ByteRing<8> = ByteRing::new();
        ring.push_slice(&[1, 2, 3, 4, 5, 6]);
        ring.advance(4);
        ring.push_slice(&[7, 8, 9]);

        let mut out = [0u8; 4];
        assert!(ring.copy_to(1, &mut out));
        assert_eq!(out, [6, 7, 8, 9]);

        let mut too_far = [0u8; 8];
        assert!(!ring.copy_to(2, &mut too_far));
    }
}
