//! Generation-tagged ring over a fixed memory-mapped region.
//!
//! Bulk pixel/sample payloads would saturate the stdio pipe, so they travel
//! through `/dev/shm` and only the `(offset, size, generation)` ticket rides
//! the completion line. The ring is a bump allocator: `next` is where the
//! next write begins, and `generation` counts cursor wraps so readers can
//! tell a stale offset from a live one.
//!
//! Read-window rule: a captured ticket is readable iff its bytes are inside
//! the committed window of the current generation, or in the not yet
//! overwritten tail of the previous one. Anything else is a definitive miss.
use std::cell::UnsafeCell;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Mutex;

use memmap2::MmapMut;
use thiserror::Error;
use tracing::{debug, error};

/// Default ring capacity in bytes.
pub const CAPACITY: usize = (1 << 31) - 1;
/// Write offsets are rounded up to this.
pub const ALIGN: usize = 8;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Failed to open ring file '{path}': {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("Failed to map ring file '{path}': {source}")]
    Map { path: PathBuf, source: io::Error },
}

/// Handoff tuple for one committed write. All zeros is the failure sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub offset: usize,
    pub size: usize,
    pub generation: u64,
}

impl Ticket {
    pub const MISS: Ticket = Ticket {
        offset: 0,
        size: 0,
        generation: 0,
    };

    pub fn is_miss(&self) -> bool {
        self.size == 0
    }
}

#[derive(Debug)]
struct Cursor {
    next: usize,
    generation: u64,
}

pub struct Memory {
    map: UnsafeCell<MmapMut>,
    cursor: Mutex<Cursor>,
    capacity: usize,
    align: usize,
    /// No-man's-land reserved at the start of each generation.
    pad: usize,
}

// The map is only mutated by `write` under the cursor lock, and `read` copies
// ranges it has validated against a cursor snapshot, re-checking the snapshot
// after the copy. A reader overtaken by a wrap discards its copy.
unsafe impl Send for Memory {}
unsafe impl Sync for Memory {}

fn align_up(pointer: usize, align: usize) -> usize {
    match pointer % align {
        0 => pointer,
        rem => pointer + align - rem,
    }
}

impl Memory {
    /// Opens (creating if needed) the shared ring `/dev/shm/bilirumine_<name>`
    /// at the default capacity.
    pub fn open(name: &str) -> Result<Self, MemoryError> {
        Self::with_options(
            Path::new("/dev/shm").join(format!("bilirumine_{name}")),
            CAPACITY,
            ALIGN,
            0,
        )
    }

    pub fn with_options(
        path: impl AsRef<Path>,
        capacity: usize,
        align: usize,
        pad: usize,
    ) -> Result<Self, MemoryError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|source| MemoryError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        file.set_len(capacity as u64).map_err(|source| MemoryError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(|source| MemoryError::Map {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("mapped ring '{}' at {} bytes", path.display(), capacity);
        Ok(Self {
            map: UnsafeCell::new(map),
            cursor: Mutex::new(Cursor {
                next: pad,
                generation: 1,
            }),
            capacity,
            align,
            pad,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reserves a contiguous region, copies `data` into it, and returns the
    /// ticket. Wraps (incrementing the generation) when the tail would not
    /// fit. The lock is held across reserve+copy so no intermediate cursor
    /// state is ever observable.
    pub fn write(&self, data: &[u8]) -> Ticket {
        let size = data.len();
        if size == 0 {
            return Ticket::MISS;
        }
        if size > self.capacity - self.pad {
            error!("ring write of {size} bytes exceeds capacity {}", self.capacity);
            return Ticket::MISS;
        }

        let mut cursor = self.cursor.lock().expect("ring cursor poisoned");
        if cursor.next + size > self.capacity {
            cursor.generation += 1;
            cursor.next = self.pad;
        }
        let offset = cursor.next;
        let generation = cursor.generation;
        cursor.next = align_up(offset + size, self.align).min(self.capacity);
        unsafe {
            ptr::copy_nonoverlapping(
                data.as_ptr(),
                (*self.map.get()).as_mut_ptr().add(offset),
                size,
            );
        }
        Ticket {
            offset,
            size,
            generation,
        }
    }

    /// Copies a previously written region out of the ring, or `None` if the
    /// ticket no longer falls in a safe window. The copy itself runs outside
    /// the lock; the snapshot is re-checked afterwards in case a writer
    /// wrapped over the region mid-copy.
    pub fn read(&self, offset: usize, size: usize, generation: u64) -> Option<Vec<u8>> {
        if size == 0 || generation == 0 {
            return None;
        }
        let end = offset.checked_add(size)?;
        if end > self.capacity {
            return None;
        }

        if !self.readable(offset, end, generation) {
            return None;
        }
        let mut data = vec![0u8; size];
        unsafe {
            ptr::copy_nonoverlapping(
                (*self.map.get()).as_ptr().add(offset),
                data.as_mut_ptr(),
                size,
            );
        }
        if !self.readable(offset, end, generation) {
            return None;
        }
        Some(data)
    }

    fn readable(&self, offset: usize, end: usize, generation: u64) -> bool {
        let (now, next) = {
            let cursor = self.cursor.lock().expect("ring cursor poisoned");
            (cursor.generation, cursor.next)
        };
        // Committed window of the live generation, or the untouched tail of
        // the one before it.
        (generation == now && end <= next) || (now == generation + 1 && next <= offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ring(capacity: usize, pad: usize) -> (tempfile::TempDir, Memory) {
        let dir = tempdir().unwrap();
        let memory =
            Memory::with_options(dir.path().join("ring"), capacity, ALIGN, pad).unwrap();
        (dir, memory)
    }

    #[test]
    fn test_offsets_monotone_within_generation() {
        let (_dir, memory) = ring(1024, 0);
        let a = memory.write(&[1u8; 100]);
        let b = memory.write(&[2u8; 100]);
        let c = memory.write(&[3u8; 100]);
        assert_eq!(a.generation, 1);
        assert!(a.offset < b.offset && b.offset < c.offset);
    }

    #[test]
    fn test_offsets_are_aligned() {
        let (_dir, memory) = ring(1024, 0);
        memory.write(&[0u8; 13]);
        let b = memory.write(&[0u8; 13]);
        assert_eq!(b.offset % ALIGN, 0);
        assert_eq!(b.offset, 16);
    }

    #[test]
    fn test_read_back_exact_bytes() {
        let (_dir, memory) = ring(1024, 0);
        let data: Vec<u8> = (0..=255).collect();
        let ticket = memory.write(&data);
        assert_eq!(
            memory.read(ticket.offset, ticket.size, ticket.generation),
            Some(data)
        );
    }

    #[test]
    fn test_wrap_increments_generation_and_resets() {
        // scaled-down version of the 10x300MB-into-2GB scenario
        let (_dir, memory) = ring(1000, 0);
        let mut tickets = Vec::new();
        for i in 0..4 {
            tickets.push(memory.write(&[i as u8; 300]));
        }
        assert_eq!(tickets[2].generation, 1);
        assert_eq!(tickets[2].offset, 608);
        assert_eq!(tickets[3].generation, 2);
        assert_eq!(tickets[3].offset, 0);
    }

    #[test]
    fn test_wrap_respects_head_pad() {
        let (_dir, memory) = ring(1000, 64);
        let first = memory.write(&[0u8; 300]);
        assert_eq!(first.offset, 64);
        for _ in 0..2 {
            memory.write(&[0u8; 300]);
        }
        let wrapped = memory.write(&[0u8; 300]);
        assert_eq!(wrapped.generation, 2);
        assert_eq!(wrapped.offset, 64);
    }

    #[test]
    fn test_previous_generation_tail_readable_until_overwritten() {
        let (_dir, memory) = ring(1000, 0);
        let mut fifth = Ticket::MISS;
        for i in 0..3 {
            let ticket = memory.write(&[i as u8; 300]);
            if i == 2 {
                fifth = ticket;
            }
        }
        // wrap: generation 2 starts at offset 0, fifth (offset 608) survives
        memory.write(&[9u8; 300]);
        assert!(memory.read(fifth.offset, fifth.size, fifth.generation).is_some());
        // second write of generation 2 ends at 600 <= 608, still safe
        memory.write(&[9u8; 296]);
        assert!(memory.read(fifth.offset, fifth.size, fifth.generation).is_some());
        // third write crosses offset 608
        memory.write(&[9u8; 300]);
        assert!(memory.read(fifth.offset, fifth.size, fifth.generation).is_none());
    }

    #[test]
    fn test_two_wraps_is_a_definitive_miss() {
        let (_dir, memory) = ring(1000, 0);
        let old = memory.write(&[1u8; 300]);
        for _ in 0..8 {
            memory.write(&[2u8; 300]);
        }
        let cursor = memory.cursor.lock().unwrap();
        assert!(cursor.generation >= old.generation + 2);
        drop(cursor);
        assert!(memory.read(old.offset, old.size, old.generation).is_none());
    }

    #[test]
    fn test_same_generation_beyond_committed_window_misses() {
        let (_dir, memory) = ring(1024, 0);
        let ticket = memory.write(&[1u8; 100]);
        // pretend the writer told us about more bytes than it committed
        assert!(memory.read(ticket.offset, 512, ticket.generation).is_none());
    }

    #[test]
    fn test_future_generation_misses() {
        let (_dir, memory) = ring(1024, 0);
        let ticket = memory.write(&[1u8; 100]);
        assert!(memory.read(ticket.offset, ticket.size, ticket.generation + 1).is_none());
    }

    #[test]
    fn test_empty_write_is_a_miss() {
        let (_dir, memory) = ring(1024, 0);
        assert!(memory.write(&[]).is_miss());
    }

    #[test]
    fn test_oversize_write_is_a_miss() {
        let (_dir, memory) = ring(1024, 0);
        assert!(memory.write(&[0u8; 2048]).is_miss());
    }

    #[test]
    fn test_zero_size_or_out_of_range_read_misses() {
        let (_dir, memory) = ring(1024, 0);
        memory.write(&[1u8; 100]);
        assert!(memory.read(0, 0, 1).is_none());
        assert!(memory.read(1000, 100, 1).is_none());
        assert!(memory.read(usize::MAX, 2, 1).is_none());
    }
}
