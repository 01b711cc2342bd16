//! One backing file, one variable-size allocator over its offset range.
//!
//! Mirrors `peerofs`'s habit of keeping on-disk bookkeeping in plain
//! `BTreeMap`/`BTreeSet` rather than reaching for a dedicated allocator
//! crate, and `perunner::iofile`'s use of `memmap2` over a regular file
//! for a host-backed memory region.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to map backing file")]
    Map,
    #[error("request out of range")]
    OutOfRange,
    #[error("device is unhealthy")]
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Healthy,
    Unhealthy,
}

/// A single host-backed memory file with a first-fit-by-size allocator.
///
/// Invariant: the union of free blocks plus the union of allocated-out
/// regions equals `[0, size)`; free blocks are pairwise disjoint and
/// non-adjacent (coalesced on free); `free_size` equals the sum of free
/// block sizes. Both `free_by_offset` and `free_by_size` always describe
/// the same block set.
pub struct MemDevice {
    path: PathBuf,
    #[allow(dead_code)]
    file: File,
    mmap: MmapMut,
    size: u64,
    free_size: u64,
    status: Status,
    free_by_offset: BTreeMap<u64, u64>,
    free_by_size: BTreeSet<(u64, u64)>,
}

impl MemDevice {
    /// Opens `path`, which must already exist and be at least `size`
    /// bytes long. The FM never creates, grows, or truncates backing
    /// files.
    pub fn new(path: impl AsRef<Path>, size: u64) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        if len < size {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "{} is {len} bytes, need at least {size}",
                    path.display()
                ),
            )));
        }

        let mmap = unsafe {
            MmapOptions::new()
                .len(size as usize)
                .map_mut(&file)
                .map_err(|_| Error::Map)?
        };

        let mut free_by_offset = BTreeMap::new();
        let mut free_by_size = BTreeSet::new();
        if size > 0 {
            free_by_offset.insert(0, size);
            free_by_size.insert((size, 0));
        }

        Ok(Self {
            path,
            file,
            mmap,
            size,
            free_size: size,
            status: Status::Healthy,
            free_by_offset,
            free_by_size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn free_size(&self) -> u64 {
        self.free_size
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn is_healthy(&self) -> bool {
        self.status == Status::Healthy
    }

    /// Failure-injection entry point. Permanent for the process lifetime;
    /// allocations already made on this device are not migrated.
    pub fn mark_unhealthy(&mut self) {
        self.status = Status::Unhealthy;
        log::warn!("device {} marked unhealthy", self.path.display());
    }

    /// First-fit-by-size: the smallest free block that is still `>= n`.
    /// Returns `None` if no block fits or the device is unhealthy.
    pub fn allocate(&mut self, n: u64) -> Option<u64> {
        if n == 0 || !self.is_healthy() {
            return None;
        }
        let &(block_size, offset) = self.free_by_size.range((n, 0)..).next()?;

        self.free_by_size.remove(&(block_size, offset));
        self.free_by_offset.remove(&offset);

        let remainder = block_size - n;
        if remainder > 0 {
            let rem_offset = offset + n;
            self.free_by_offset.insert(rem_offset, remainder);
            self.free_by_size.insert((remainder, rem_offset));
        }
        self.free_size -= n;
        Some(offset)
    }

    /// Releases a block previously returned by `allocate(n)` at `offset`.
    /// Zeroes the range, then coalesces with whichever of the immediate
    /// offset-neighbors abut it.
    pub fn free(&mut self, offset: u64, n: u64) {
        if n == 0 {
            return;
        }
        let start = offset as usize;
        let end = (offset + n) as usize;
        self.mmap[start..end].fill(0);

        let mut new_offset = offset;
        let mut new_size = n;

        if let Some((&prev_offset, &prev_size)) = self.free_by_offset.range(..offset).next_back() {
            if prev_offset + prev_size == offset {
                self.free_by_offset.remove(&prev_offset);
                self.free_by_size.remove(&(prev_size, prev_offset));
                new_offset = prev_offset;
                new_size += prev_size;
            }
        }

        let next_boundary = offset + n;
        if let Some(&next_size) = self.free_by_offset.get(&next_boundary) {
            self.free_by_offset.remove(&next_boundary);
            self.free_by_size.remove(&(next_size, next_boundary));
            new_size += next_size;
        }

        self.free_by_offset.insert(new_offset, new_size);
        self.free_by_size.insert((new_size, new_offset));
        self.free_size += n;
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        if !self.is_healthy() {
            return Err(Error::Unavailable);
        }
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(Error::OutOfRange)?;
        if end > self.size {
            return Err(Error::OutOfRange);
        }
        buf.copy_from_slice(&self.mmap[offset as usize..end as usize]);
        Ok(())
    }

    pub fn write(&mut self, offset: u64, buf: &[u8]) -> Result<(), Error> {
        if !self.is_healthy() {
            return Err(Error::Unavailable);
        }
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(Error::OutOfRange)?;
        if end > self.size {
            return Err(Error::OutOfRange);
        }
        self.mmap[offset as usize..end as usize].copy_from_slice(buf);
        Ok(())
    }

    /// Test/debug helper: asserts the dual free-index invariant holds.
    #[cfg(test)]
    fn check_invariant(&self) {
        let sum: u64 = self.free_by_offset.values().sum();
        assert_eq!(sum, self.free_size);
        assert_eq!(self.free_by_offset.len(), self.free_by_size.len());
        for (&o, &s) in &self.free_by_offset {
            assert!(self.free_by_size.contains(&(s, o)));
        }
        let mut prev_end: Option<u64> = None;
        for (&o, &s) in &self.free_by_offset {
            if let Some(pe) = prev_end {
                assert!(o > pe, "adjacent free blocks should have been coalesced");
            }
            prev_end = Some(o + s);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn backing_file(size: u64) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.as_file_mut().set_len(size).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn fresh_device_is_one_free_block() {
        let f = backing_file(4096);
        let dev = MemDevice::new(f.path(), 4096).unwrap();
        assert_eq!(dev.free_size(), 4096);
        dev.check_invariant();
    }

    #[test]
    fn allocate_and_free_roundtrip() {
        let f = backing_file(4096);
        let mut dev = MemDevice::new(f.path(), 4096).unwrap();
        let off = dev.allocate(1024).unwrap();
        assert_eq!(off, 0);
        assert_eq!(dev.free_size(), 4096 - 1024);
        dev.check_invariant();

        dev.free(off, 1024);
        assert_eq!(dev.free_size(), 4096);
        dev.check_invariant();
    }

    #[test]
    fn allocate_picks_smallest_fitting_block() {
        let f = backing_file(4096);
        let mut dev = MemDevice::new(f.path(), 4096).unwrap();
        let a = dev.allocate(1024).unwrap(); // [0,1024)
        let _b = dev.allocate(1024).unwrap(); // [1024,2048)
        dev.free(a, 1024); // free block of exactly 1024 at offset 0, remaining free is [2048,4096)=2048
        let c = dev.allocate(512).unwrap();
        assert_eq!(c, 0); // the smallest fitting block (1024) wins over the bigger (2048) one
        dev.check_invariant();
    }

    #[test]
    fn free_coalesces_both_neighbors() {
        let f = backing_file(3072);
        let mut dev = MemDevice::new(f.path(), 3072).unwrap();
        let a = dev.allocate(1024).unwrap();
        let b = dev.allocate(1024).unwrap();
        let c = dev.allocate(1024).unwrap();
        dev.free(a, 1024);
        dev.free(c, 1024);
        dev.check_invariant();
        // freeing the middle block should coalesce all three back into one
        dev.free(b, 1024);
        assert_eq!(dev.free_size(), 3072);
        dev.check_invariant();
        let whole = dev.allocate(3072).unwrap();
        assert_eq!(whole, 0);
    }

    #[test]
    fn allocate_returns_none_when_full() {
        let f = backing_file(1024);
        let mut dev = MemDevice::new(f.path(), 1024).unwrap();
        assert!(dev.allocate(1024).is_some());
        assert!(dev.allocate(1).is_none());
    }

    #[test]
    fn unhealthy_device_refuses_allocate_and_io() {
        let f = backing_file(1024);
        let mut dev = MemDevice::new(f.path(), 1024).unwrap();
        dev.mark_unhealthy();
        assert!(dev.allocate(8).is_none());
        let mut buf = [0u8; 8];
        assert!(matches!(dev.read(0, &mut buf), Err(Error::Unavailable)));
        assert!(matches!(dev.write(0, &buf), Err(Error::Unavailable)));
    }

    #[test]
    fn write_then_read_roundtrip() {
        let f = backing_file(4096);
        let mut dev = MemDevice::new(f.path(), 4096).unwrap();
        let off = dev.allocate(8).unwrap();
        let value = 0xDEADBEEFCAFEBABEu64.to_le_bytes();
        dev.write(off, &value).unwrap();
        let mut out = [0u8; 8];
        dev.read(off, &mut out).unwrap();
        assert_eq!(out, value);
    }

    #[test]
    fn out_of_range_rejected() {
        let f = backing_file(16);
        let mut dev = MemDevice::new(f.path(), 16).unwrap();
        let mut buf = [0u8; 8];
        assert!(matches!(dev.read(12, &mut buf), Err(Error::OutOfRange)));
        assert!(matches!(dev.write(12, &buf), Err(Error::OutOfRange)));
    }

    #[test]
    fn new_fails_if_file_too_small() {
        let f = backing_file(10);
        assert!(MemDevice::new(f.path(), 4096).is_err());
    }

    #[test]
    fn free_zeroes_memory() {
        let f = backing_file(16);
        let mut dev = MemDevice::new(f.path(), 16).unwrap();
        let off = dev.allocate(8).unwrap();
        dev.write(off, &[0xffu8; 8]).unwrap();
        dev.free(off, 8);
        let off2 = dev.allocate(8).unwrap();
        assert_eq!(off, off2);
        let mut buf = [0u8; 8];
        dev.read(off2, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 8]);
    }
}
