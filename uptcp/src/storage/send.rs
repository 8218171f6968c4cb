use super::Chunk;
use crate::layer::{Error, Result};
use crate::wire::tcp::SeqNumber;

/// Outgoing bytes of one stream, from the oldest unacknowledged byte onwards.
///
/// The buffered bytes are always contiguous in the chunk, `[head_off, tail_off)`. When an append
/// would run past the end of the chunk the buffered bytes are first moved to its start, which is
/// the only time data is ever moved.
#[derive(Debug)]
pub struct SendBuffer {
    data: Chunk,
    head_off: usize,
    tail_off: usize,
    len: usize,
    /// Total bytes ever accepted.
    cum_len: u64,
    /// Sequence number of the byte at `head_off`.
    head_seq: SeqNumber,
    init_seq: SeqNumber,
}

impl SendBuffer {
    /// Wrap a chunk, the first byte put will carry `init_seq`.
    pub fn new(data: Chunk, init_seq: SeqNumber) -> Self {
        SendBuffer {
            data,
            head_off: 0,
            tail_off: 0,
            len: 0,
            cum_len: 0,
            head_seq: init_seq,
            init_seq,
        }
    }

    /// Append as much of `data` as fits.
    ///
    /// Returns the number of bytes taken, or `Exhausted` if the buffer is full.
    pub fn put(&mut self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        let to_put = data.len().min(self.size() - self.len);
        if to_put == 0 {
            return Err(Error::Exhausted);
        }

        if self.tail_off + to_put > self.size() {
            self.data.copy_within(self.head_off..self.tail_off, 0);
            self.head_off = 0;
            self.tail_off = self.len;
        }

        self.data[self.tail_off..self.tail_off + to_put].copy_from_slice(&data[..to_put]);
        self.tail_off += to_put;
        self.len += to_put;
        self.cum_len += to_put as u64;
        Ok(to_put)
    }

    /// Drop up to `len` acknowledged bytes from the front.
    pub fn remove(&mut self, len: usize) -> usize {
        let to_remove = len.min(self.len);
        if to_remove == 0 {
            return 0;
        }

        self.head_off += to_remove;
        self.head_seq = self.head_seq + to_remove as u32;
        self.len -= to_remove;

        if self.len == 0 {
            self.head_off = 0;
            self.tail_off = 0;
        }

        to_remove
    }

    /// Bytes starting `offset` past the head, at most `len` of them.
    pub fn get(&self, offset: usize, len: usize) -> &[u8] {
        let begin = self.head_off + offset.min(self.len);
        let end = begin + len.min(self.tail_off - begin);
        &self.data[begin..end]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn cum_len(&self) -> u64 {
        self.cum_len
    }

    pub fn head_seq(&self) -> SeqNumber {
        self.head_seq
    }

    pub fn init_seq(&self) -> SeqNumber {
        self.init_seq
    }

    /// The sequence number one past the last buffered byte.
    pub fn tail_seq(&self) -> SeqNumber {
        self.head_seq + self.len as u32
    }

    pub fn head_off(&self) -> usize {
        self.head_off
    }

    pub fn tail_off(&self) -> usize {
        self.tail_off
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ChunkPool;

    fn buffer(size: usize) -> SendBuffer {
        let pool = ChunkPool::new(size, size, false);
        SendBuffer::new(pool.alloc().unwrap(), SeqNumber(1000))
    }

    #[test]
    fn simple() {
        let mut buf = buffer(16);
        assert_eq!(buf.put(b"hello"), Ok(5));
        assert_eq!(buf.get(0, 16), b"hello");
        assert_eq!(buf.get(1, 3), b"ell");
        assert_eq!(buf.tail_seq(), SeqNumber(1005));

        assert_eq!(buf.remove(5), 5);
        assert_eq!(buf.len(), 0);
        assert_eq!((buf.head_off(), buf.tail_off()), (0, 0));
        assert_eq!(buf.head_seq(), SeqNumber(1005));
        assert_eq!(buf.cum_len(), 5);
        assert_eq!(buf.remove(1), 0);
    }

    #[test]
    fn full() {
        let mut buf = buffer(8);
        assert_eq!(buf.put(b"0123456789"), Ok(8));
        assert_eq!(buf.put(b"x"), Err(Error::Exhausted));
        assert_eq!(buf.len(), 8);
        assert_eq!(buf.get(0, 8), b"01234567");
    }

    #[test]
    fn compacts_at_the_tail() {
        let mut buf = buffer(8);
        assert_eq!(buf.put(b"abcdef"), Ok(6));
        assert_eq!(buf.remove(4), 4);
        assert_eq!(buf.head_off(), 4);
        // Fits exactly without moving.
        assert_eq!(buf.put(b"gh"), Ok(2));
        assert_eq!(buf.head_off(), 4);
        // Would overflow, so the four buffered bytes move to the front first.
        assert_eq!(buf.put(b"ijkl"), Ok(4));
        assert_eq!(buf.head_off(), 0);
        assert_eq!(buf.get(0, 8), b"efghijkl");
        assert_eq!(buf.head_seq(), SeqNumber(1004));
    }
}
