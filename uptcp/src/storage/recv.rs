use super::Chunk;
use crate::layer::{Error, Result};
use crate::wire::tcp::SeqNumber;

/// Which thread returns fragment descriptors.
///
/// Descriptors freed by the application and by the network thread are kept apart, each side only
/// ever pushes to its own list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Caller {
    App,
    Net,
}

/// Incoming bytes of one stream, including runs received out of order.
///
/// The chunk holds bytes from `head_seq` onwards at `head_off`. Every received run is described by
/// a fragment, and the fragments form a list sorted by sequence number in which no two could be
/// merged. The first `merged_len` bytes are the contiguous prefix the application can read.
#[derive(Debug)]
pub struct RecvBuffer {
    data: Chunk,
    head_off: usize,
    tail_off: usize,
    merged_len: usize,
    cum_len: u64,
    /// Bytes from the head to the furthest received byte.
    last_len: usize,
    head_seq: SeqNumber,
    init_seq: SeqNumber,
    frags: Vec<Fragment>,
    first: Option<usize>,
    free: [Vec<usize>; 2],
}

#[derive(Clone, Copy, Debug)]
struct Fragment {
    seq: SeqNumber,
    len: usize,
    next: Option<usize>,
}

impl RecvBuffer {
    /// Wrap a chunk, expecting the byte with `init_seq` first.
    pub fn new(data: Chunk, init_seq: SeqNumber) -> Self {
        RecvBuffer {
            data,
            head_off: 0,
            tail_off: 0,
            merged_len: 0,
            cum_len: 0,
            last_len: 0,
            head_seq: init_seq,
            init_seq,
            frags: Vec::new(),
            first: None,
            free: [Vec::new(), Vec::new()],
        }
    }

    /// Store a segment starting at `seq`.
    ///
    /// Bytes before the head were delivered already and are dropped. A segment reaching past the
    /// buffer capacity is rejected as a whole with `BadSize`. Returns the number of bytes stored.
    pub fn put(&mut self, seq: SeqNumber, data: &[u8]) -> Result<usize> {
        let (seq, data) = match seq.since(self.head_seq) {
            before if before < 0 => {
                let stale = before.unsigned_abs() as usize;
                if stale >= data.len() {
                    return Ok(0);
                }
                (self.head_seq, &data[stale..])
            },
            _ => (seq, data),
        };

        if data.is_empty() {
            return Ok(0);
        }

        let putx = seq.since(self.head_seq) as usize;
        let end_off = putx + data.len();
        if end_off > self.size() {
            return Err(Error::BadSize);
        }

        if self.head_off + end_off > self.size() {
            let head = self.head_off;
            self.data.copy_within(head..head + self.last_len, 0);
            self.tail_off -= head;
            self.head_off = 0;
        }

        let at = self.head_off + putx;
        self.data[at..at + data.len()].copy_from_slice(data);
        self.tail_off = self.tail_off.max(self.head_off + end_off);
        self.last_len = self.tail_off - self.head_off;

        self.insert_fragment(seq, data.len());

        if let Some(first) = self.first {
            let first = self.frags[first];
            if first.seq == self.head_seq {
                self.cum_len += (first.len - self.merged_len) as u64;
                self.merged_len = first.len;
            }
        }

        Ok(data.len())
    }

    /// Consume up to `len` bytes of the readable prefix.
    pub fn remove(&mut self, len: usize, caller: Caller) -> usize {
        let len = len.min(self.merged_len);
        if len == 0 {
            return 0;
        }

        self.head_off += len;
        self.head_seq = self.head_seq + len as u32;
        self.merged_len -= len;
        self.last_len -= len;

        let first = self.first.expect("Readable bytes without a fragment");
        let frag = &mut self.frags[first];
        if len == frag.len {
            self.first = frag.next;
            self.release(first, caller);
        } else {
            assert!(len < frag.len, "Removed past the head fragment");
            frag.seq = frag.seq + len as u32;
            frag.len -= len;
        }

        if self.last_len == 0 {
            self.head_off = 0;
            self.tail_off = 0;
        }

        len
    }

    /// Copy the readable prefix into `buf` and consume it.
    pub fn read(&mut self, buf: &mut [u8], caller: Caller) -> usize {
        let len = buf.len().min(self.merged_len);
        buf[..len].copy_from_slice(&self.data[self.head_off..self.head_off + len]);
        self.remove(len, caller)
    }

    /// The contiguous bytes ready for the application.
    pub fn readable(&self) -> &[u8] {
        &self.data[self.head_off..self.head_off + self.merged_len]
    }

    /// The received runs as `(seq, len)`, in sequence order.
    pub fn fragments(&self) -> impl Iterator<Item=(SeqNumber, usize)> + '_ {
        let mut cur = self.first;
        core::iter::from_fn(move || {
            let frag = self.frags[cur?];
            cur = frag.next;
            Some((frag.seq, frag.len))
        })
    }

    pub fn merged_len(&self) -> usize {
        self.merged_len
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

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Descriptors waiting for reuse, by the thread that released them.
    pub fn free_fragments(&self, caller: Caller) -> usize {
        self.free[caller as usize].len()
    }

    /// Link a new run into the sorted list, absorbing every run it overlaps or touches.
    fn insert_fragment(&mut self, seq: SeqNumber, len: usize) {
        let mut start = seq;
        let mut end = seq + len as u32;
        let mut prev: Option<usize> = None;
        let mut cur = self.first;

        // Skip runs ending strictly before the new one, leaving a gap.
        while let Some(idx) = cur {
            let frag = self.frags[idx];
            if (frag.seq + frag.len as u32) < start {
                prev = cur;
                cur = frag.next;
            } else {
                break;
            }
        }

        // Absorb all runs starting no later than our end.
        while let Some(idx) = cur {
            let frag = self.frags[idx];
            if frag.seq > end {
                break;
            }

            start = start.min(frag.seq);
            end = end.max(frag.seq + frag.len as u32);
            cur = frag.next;
            self.release(idx, Caller::Net);
        }

        let new = self.allocate(Fragment {
            seq: start,
            len: end.since(start) as usize,
            next: cur,
        });

        match prev {
            None => self.first = Some(new),
            Some(prev) => self.frags[prev].next = Some(new),
        }
    }

    fn allocate(&mut self, frag: Fragment) -> usize {
        let reuse = self.free[Caller::App as usize].pop()
            .or_else(|| self.free[Caller::Net as usize].pop());
        match reuse {
            Some(idx) => {
                self.frags[idx] = frag;
                idx
            },
            None => {
                self.frags.push(frag);
                self.frags.len() - 1
            },
        }
    }

    fn release(&mut self, idx: usize, caller: Caller) {
        self.free[caller as usize].push(idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ChunkPool;
    use proptest::prelude::*;

    fn buffer(size: usize, init: u32) -> RecvBuffer {
        let pool = ChunkPool::new(size, size, false);
        RecvBuffer::new(pool.alloc().unwrap(), SeqNumber(init))
    }

    fn bytes(seq: u32, len: usize) -> Vec<u8> {
        (0..len).map(|i| (seq as usize + i) as u8).collect()
    }

    #[test]
    fn simple() {
        let mut buf = buffer(64, 100);
        assert_eq!(buf.put(SeqNumber(100), &bytes(100, 10)), Ok(10));
        assert_eq!(buf.merged_len(), 10);
        assert_eq!(buf.readable(), &bytes(100, 10)[..]);

        let mut out = [0; 4];
        assert_eq!(buf.read(&mut out, Caller::App), 4);
        assert_eq!(out, [100, 101, 102, 103]);
        assert_eq!(buf.head_seq(), SeqNumber(104));
        assert_eq!(buf.merged_len(), 6);

        assert_eq!(buf.remove(10, Caller::App), 6);
        assert_eq!(buf.merged_len(), 0);
        assert_eq!(buf.fragments().count(), 0);
        assert_eq!(buf.free_fragments(Caller::App), 1);
        assert_eq!(buf.cum_len(), 10);
    }

    #[test]
    fn out_of_order() {
        let mut buf = buffer(256, 1950);
        assert_eq!(buf.put(SeqNumber(2000), &bytes(2000, 50)), Ok(50));
        assert_eq!(buf.merged_len(), 0);
        assert_eq!(buf.fragments().collect::<Vec<_>>(), vec![(SeqNumber(2000), 50)]);

        assert_eq!(buf.put(SeqNumber(1950), &bytes(1950, 50)), Ok(50));
        assert_eq!(buf.fragments().collect::<Vec<_>>(), vec![(SeqNumber(1950), 100)]);
        assert_eq!(buf.merged_len(), 100);
        assert_eq!(buf.readable(), &bytes(1950, 100)[..]);
    }

    #[test]
    fn gap_of_one_byte_stays_split() {
        let mut buf = buffer(64, 0);
        buf.put(SeqNumber(10), &[1; 5]).unwrap();
        buf.put(SeqNumber(16), &[1; 5]).unwrap();
        assert_eq!(buf.fragments().count(), 2);
        buf.put(SeqNumber(15), &[1; 1]).unwrap();
        assert_eq!(buf.fragments().collect::<Vec<_>>(), vec![(SeqNumber(10), 11)]);
    }

    #[test]
    fn stale_and_oversized() {
        let mut buf = buffer(16, 100);
        assert_eq!(buf.put(SeqNumber(90), &[0; 10]), Ok(0));
        assert_eq!(buf.put(SeqNumber(95), &bytes(95, 10)), Ok(5));
        assert_eq!(buf.merged_len(), 5);
        assert_eq!(buf.readable(), &bytes(100, 5)[..]);
        assert_eq!(buf.put(SeqNumber(110), &[0; 7]), Err(Error::BadSize));
        assert_eq!(buf.merged_len(), 5);
    }

    #[test]
    fn compacts_towards_front() {
        let mut buf = buffer(16, 0);
        buf.put(SeqNumber(0), &bytes(0, 12)).unwrap();
        assert_eq!(buf.remove(10, Caller::Net), 10);
        // Head at offset 10, a 6 byte put from seq 12 would end at 18.
        buf.put(SeqNumber(12), &bytes(12, 6)).unwrap();
        assert_eq!(buf.readable(), &bytes(10, 8)[..]);
        assert_eq!(buf.fragments().collect::<Vec<_>>(), vec![(SeqNumber(10), 8)]);
    }

    #[test]
    fn sequence_wraps() {
        let mut buf = buffer(64, u32::max_value() - 3);
        buf.put(SeqNumber(2), &[7; 4]).unwrap();
        buf.put(SeqNumber(u32::max_value() - 3), &[7; 6]).unwrap();
        assert_eq!(buf.merged_len(), 10);
        assert_eq!(buf.fragments().count(), 1);
    }

    proptest! {
        #[test]
        fn fragments_never_mergeable(
            puts in proptest::collection::vec((0u32..200, 1usize..40), 1..30),
            base in any::<u32>(),
        ) {
            let mut buf = buffer(256, base);
            let mut received = [false; 256];

            for (offset, len) in puts {
                let seq = SeqNumber(base) + offset;
                let stored = buf.put(seq, &bytes(base.wrapping_add(offset), len)).unwrap();
                prop_assert_eq!(stored, len);
                received[offset as usize..offset as usize + len].iter_mut().for_each(|r| *r = true);
            }

            let frags: Vec<_> = buf.fragments().collect();
            for pair in frags.windows(2) {
                let (seq, len) = pair[0];
                prop_assert!(seq + (len as u32) < pair[1].0);
            }

            let contiguous = received.iter().take_while(|&&r| r).count();
            prop_assert_eq!(buf.merged_len(), contiguous);
            prop_assert_eq!(buf.readable(), &bytes(base, contiguous)[..]);
        }
    }
}
