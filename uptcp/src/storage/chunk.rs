//! A slab of equally sized chunks carved out of one reserved region.
//!
//! Free chunks are threaded into a list through their own first four bytes, so the pool needs no
//! memory besides the region itself. Allocation and release are O(1) under a short lock.
use core::{cell, fmt, mem, ops, slice};
use std::sync::Arc;

use byteorder::{ByteOrder, NativeEndian};
use parking_lot::Mutex;

use crate::layer::{Error, Result};

/// A shared pool of fixed-size chunks.
#[derive(Clone)]
pub struct ChunkPool {
    inner: Arc<Inner>,
}

/// Exclusive access to one chunk of a pool.
///
/// The chunk is returned to its pool when dropped.
pub struct Chunk {
    pool: Arc<Inner>,
    /// Byte offset of the chunk within the region.
    offset: usize,
}

struct Inner {
    /// The entirety of memory.
    region: Region,
    chunk_size: usize,
    chunk_count: usize,
    free: Mutex<FreeList>,
}

struct FreeList {
    /// Index of the first free chunk, `END` when exhausted.
    top: u32,
    count: usize,
}

enum Region {
    /// Inside an `UnsafeCell` since we loan out parts of it via a shared reference.
    Heap(Box<cell::UnsafeCell<[u8]>>),
    #[cfg(feature = "std")]
    Mapped {
        ptr: *mut u8,
        len: usize,
    },
}

const END: u32 = u32::max_value();

impl ChunkPool {
    /// Partition a region of `total_size` bytes into chunks of `chunk_size`.
    ///
    /// The chunk size must hold at least the free list link and be a multiple of four. With
    /// `huge_pages` the region is mapped from huge pages if the platform grants them, otherwise
    /// it silently comes from the heap.
    pub fn new(chunk_size: usize, total_size: usize, huge_pages: bool) -> Self {
        assert!(chunk_size >= mem::size_of::<u32>(), "Chunk too small for a free link");
        assert!(chunk_size % mem::size_of::<u32>() == 0, "Chunk size must be a multiple of 4");
        let chunk_count = total_size / chunk_size;
        assert!(chunk_count < END as usize, "Too many chunks");

        let len = chunk_count * chunk_size;
        let region = if huge_pages {
            Region::huge(len).unwrap_or_else(|| Region::heap(len))
        } else {
            Region::heap(len)
        };

        let inner = Inner {
            region,
            chunk_size,
            chunk_count,
            free: Mutex::new(FreeList { top: END, count: 0 }),
        };

        {
            let mut free = inner.free.lock();
            for idx in (0..chunk_count).rev() {
                // SAFETY: no chunk is handed out yet, we own the whole region.
                unsafe { inner.push_free(&mut free, idx) };
            }
        }

        ChunkPool { inner: Arc::new(inner) }
    }

    /// Pop a free chunk.
    ///
    /// Fails with `Exhausted` when no chunk is left. Callers decide how to degrade.
    pub fn alloc(&self) -> Result<Chunk> {
        let mut free = self.inner.free.lock();
        if free.count == 0 {
            return Err(Error::Exhausted);
        }

        let idx = free.top as usize;
        let offset = idx * self.inner.chunk_size;
        // SAFETY: the chunk is on the free list so nobody else references it.
        free.top = NativeEndian::read_u32(unsafe { self.inner.bytes(offset) });
        free.count -= 1;

        Ok(Chunk {
            pool: Arc::clone(&self.inner),
            offset,
        })
    }

    /// Return a chunk to this pool.
    ///
    /// ## Panics
    /// If the chunk was allocated from another pool.
    pub fn free(&self, chunk: Chunk) {
        assert!(Arc::ptr_eq(&self.inner, &chunk.pool), "Chunk freed into a foreign pool");
        drop(chunk)
    }

    pub fn chunk_size(&self) -> usize {
        self.inner.chunk_size
    }

    /// The number of chunks that can be allocated right now.
    pub fn available(&self) -> usize {
        self.inner.free.lock().count
    }

    pub fn capacity(&self) -> usize {
        self.inner.chunk_count
    }
}

impl Inner {
    fn release(&self, offset: usize) {
        assert!(offset % self.chunk_size == 0, "Misaligned chunk at offset {}", offset);
        assert!(offset < self.chunk_count * self.chunk_size, "Chunk outside of the region");
        let mut free = self.free.lock();
        assert!(free.count < self.chunk_count, "Free list overflow, chunk released twice");
        // SAFETY: the chunk handle is being dropped, its memory is ours again.
        unsafe { self.push_free(&mut free, offset / self.chunk_size) };
    }

    /// Requires: the chunk at `idx` is not referenced by any `Chunk`.
    unsafe fn push_free(&self, free: &mut FreeList, idx: usize) {
        let link = self.bytes(idx * self.chunk_size);
        NativeEndian::write_u32(link, free.top);
        free.top = idx as u32;
        free.count += 1;
    }

    /// Requires: the caller has exclusive access to the chunk at `offset`.
    #[allow(clippy::mut_from_ref)]
    unsafe fn bytes(&self, offset: usize) -> &mut [u8] {
        slice::from_raw_parts_mut(self.region.base().add(offset), self.chunk_size)
    }
}

impl Region {
    fn heap(len: usize) -> Self {
        let slice = vec![0u8; len].into_boxed_slice();
        // SAFETY: `UnsafeCell<[u8]>` has the same layout as `[u8]`.
        Region::Heap(unsafe {
            Box::from_raw(Box::into_raw(slice) as *mut cell::UnsafeCell<[u8]>)
        })
    }

    #[cfg(all(feature = "std", target_os = "linux"))]
    fn huge(len: usize) -> Option<Self> {
        if len == 0 {
            return None;
        }

        // SAFETY: anonymous private mapping, no file descriptor and no fixed address.
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB,
                -1,
                0)
        };

        if ptr == libc::MAP_FAILED {
            net_debug!("huge page mapping of {} bytes refused", len);
            return None;
        }

        Some(Region::Mapped { ptr: ptr as *mut u8, len })
    }

    #[cfg(not(all(feature = "std", target_os = "linux")))]
    fn huge(_: usize) -> Option<Self> {
        None
    }

    fn base(&self) -> *mut u8 {
        match self {
            Region::Heap(memory) => cell::UnsafeCell::get(&**memory) as *mut u8,
            #[cfg(feature = "std")]
            Region::Mapped { ptr, .. } => *ptr,
        }
    }
}

#[cfg(feature = "std")]
impl Drop for Region {
    fn drop(&mut self) {
        if let Region::Mapped { ptr, len } = *self {
            // SAFETY: mapped by us in `huge` with exactly this length.
            unsafe { libc::munmap(ptr as *mut libc::c_void, len) };
        }
    }
}

// SAFETY: chunks are handed out exclusively, the free list is behind a lock.
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

impl Chunk {
    /// Address of the chunk, for diagnostics.
    pub fn as_ptr(&self) -> *const u8 {
        (**self).as_ptr()
    }
}

impl ops::Deref for Chunk {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: we hold the only handle to this chunk.
        unsafe { self.pool.bytes(self.offset) }
    }
}

impl ops::DerefMut for Chunk {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: we hold the only handle to this chunk.
        unsafe { self.pool.bytes(self.offset) }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        self.pool.release(self.offset)
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("offset", &self.offset)
            .field("len", &self.pool.chunk_size)
            .finish()
    }
}

impl fmt::Debug for ChunkPool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ChunkPool")
            .field("chunk_size", &self.inner.chunk_size)
            .field("chunk_count", &self.inner.chunk_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple() {
        let pool = ChunkPool::new(64, 256, false);
        assert_eq!(pool.capacity(), 4);

        let mut chunks: Vec<_> = (0..4).map(|_| pool.alloc().unwrap()).collect();
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.alloc().unwrap_err(), Error::Exhausted);

        chunks[0].copy_from_slice(&[0xab; 64]);
        assert_eq!(chunks[1].len(), 64);

        pool.free(chunks.pop().unwrap());
        assert_eq!(pool.available(), 1);
        drop(chunks);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn reuse_is_lifo() {
        let pool = ChunkPool::new(16, 64, false);
        let a = pool.alloc().unwrap();
        let ptr = a.as_ptr();
        drop(a);
        let b = pool.alloc().unwrap();
        assert_eq!(b.as_ptr(), ptr);
    }

    #[test]
    fn distinct_chunks() {
        let pool = ChunkPool::new(8, 64, false);
        let mut all: Vec<_> = (0..8).map(|_| pool.alloc().unwrap()).collect();
        for (i, chunk) in all.iter_mut().enumerate() {
            chunk.iter_mut().for_each(|b| *b = i as u8);
        }
        for (i, chunk) in all.iter().enumerate() {
            assert!(chunk.iter().all(|&b| b == i as u8));
        }
    }

    #[test]
    fn huge_pages_fall_back() {
        let pool = ChunkPool::new(4096, 4096 * 4, true);
        assert_eq!(pool.capacity(), 4);
        assert!(pool.alloc().is_ok());
    }

    #[test]
    #[should_panic(expected = "foreign pool")]
    fn foreign_free() {
        let one = ChunkPool::new(8, 16, false);
        let other = ChunkPool::new(8, 16, false);
        let chunk = one.alloc().unwrap();
        other.free(chunk);
    }
}
