//! One-time memory mapping of capture buffers.
//!
//! Capture buffers are kernel-owned dmabuf regions; we map each one into
//! the process exactly once at startup and keep the mapping for the life of
//! the process. "Single plane" buffers appear as multi-plane, but all their
//! planes share one fd ; such groups are accumulated and mapped in a single
//! mmap call.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use std::slice;

use libcamera::framebuffer::AsFrameBuffer;
use log::error;
use nix::errno::Errno;
use nix::libc::c_void;
use nix::sys::mman;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MapError {
    #[error("buffer exposes no planes")]
    NoPlanes,
    #[error("plane group has zero length")]
    EmptyPlane,
    #[error("mmap error: {0}")]
    Mmap(#[from] Errno),
}

/// An owned, mapped view of one plane group of a capture buffer.
///
/// The region stays mapped until the value is dropped; the pool never drops
/// one before process shutdown.
pub struct MappedRegion {
    // Valid until we munmap in drop(), hence the static lifetime.
    data: &'static mut [u8],
}

impl MappedRegion {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl AsRef<[u8]> for MappedRegion {
    fn as_ref(&self) -> &[u8] {
        self.data
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // Safe because the pointer and length came out of mmap() and are
        // always valid.
        let ptr = self.data.as_mut_ptr() as *mut c_void;
        if let Some(ptr) = NonNull::new(ptr) {
            unsafe { mman::munmap(ptr, self.data.len()) }.unwrap_or_else(|e| {
                error!("error while unmapping buffer region: {}", e);
            });
        }
    }
}

/// Maps `length` bytes of `fd` from offset 0, read/write and shared with
/// the device.
fn map_region(fd: RawFd, length: usize) -> Result<MappedRegion, MapError> {
    let length = NonZeroUsize::new(length).ok_or(MapError::EmptyPlane)?;
    // Safe because the fd is a valid dmabuf fd owned by the capture buffer
    // and we only build the slice over the region we just mapped.
    let data = unsafe {
        mman::mmap(
            None,
            length,
            mman::ProtFlags::PROT_READ | mman::ProtFlags::PROT_WRITE,
            mman::MapFlags::MAP_SHARED,
            BorrowedFd::borrow_raw(fd),
            0,
        )
    }?;

    Ok(MappedRegion {
        data: unsafe { slice::from_raw_parts_mut(data.as_ptr() as *mut u8, length.get()) },
    })
}

/// Groups consecutive planes that share a dmabuf fd and sums their lengths,
/// so each fd is mapped exactly once.
fn coalesce_planes(planes: &[(RawFd, usize)]) -> Vec<(RawFd, usize)> {
    let mut groups: Vec<(RawFd, usize)> = Vec::new();
    for &(fd, len) in planes {
        match groups.last_mut() {
            Some((group_fd, group_len)) if *group_fd == fd => *group_len += len,
            _ => groups.push((fd, len)),
        }
    }
    groups
}

/// Owns the mappings of every allocated capture buffer, keyed by the
/// buffer's identity (its first plane's dmabuf fd).
///
/// Buffers are registered once at startup and never re-mapped; lookups for
/// an unknown identity return an empty span list, which callers must treat
/// as "not capturable", never as an all-zero buffer.
#[derive(Default)]
pub struct MappedBufferPool {
    buffers: HashMap<RawFd, Vec<MappedRegion>>,
}

impl MappedBufferPool {
    pub fn new() -> Self {
        Default::default()
    }

    /// Maps all plane groups of `buffer` and records them under the
    /// buffer's identity, which is returned.
    ///
    /// A mapping failure is returned as an error: continuing with a
    /// partially mapped buffer would corrupt every downstream read.
    pub fn map_buffer(&mut self, buffer: &impl AsFrameBuffer) -> Result<RawFd, MapError> {
        let planes = buffer
            .planes()
            .into_iter()
            .map(|p| (p.fd(), p.len()))
            .collect::<Vec<_>>();
        let key = planes.first().ok_or(MapError::NoPlanes)?.0;

        let mut regions = Vec::new();
        for (fd, length) in coalesce_planes(&planes) {
            regions.push(map_region(fd, length)?);
        }
        self.buffers.insert(key, regions);

        Ok(key)
    }

    /// Returns the mapped spans recorded for `buffer`, in plane-group
    /// order, or an empty slice if the identity is unknown.
    pub fn spans(&self, buffer: RawFd) -> &[MappedRegion] {
        self.buffers.get(&buffer).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Total mapped byte length of `buffer`, 0 if unknown.
    pub fn total_len(&self, buffer: RawFd) -> usize {
        self.spans(buffer).iter().map(MappedRegion::len).sum()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coalesce_shared_fd() {
        // Planar YUV420 on a contiguous allocation: three planes, one fd.
        let planes = [(7, 1000), (7, 250), (7, 250)];
        assert_eq!(coalesce_planes(&planes), vec![(7, 1500)]);
    }

    #[test]
    fn test_coalesce_distinct_fds() {
        let planes = [(3, 1000), (4, 250), (5, 250)];
        assert_eq!(
            coalesce_planes(&planes),
            vec![(3, 1000), (4, 250), (5, 250)]
        );
    }

    #[test]
    fn test_coalesce_mixed() {
        // First two planes share a buffer, the third is its own.
        let planes = [(3, 1000), (3, 250), (9, 250)];
        assert_eq!(coalesce_planes(&planes), vec![(3, 1250), (9, 250)]);
    }

    #[test]
    fn test_unknown_identity_is_empty() {
        let pool = MappedBufferPool::new();
        assert!(pool.spans(42).is_empty());
        assert_eq!(pool.total_len(42), 0);
    }
}
