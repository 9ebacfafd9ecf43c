// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::atomic::AtomicU32;

use log::*;
use nix::errno::Errno;
use nix::sys::mman::{mmap, mmap_anonymous, munmap, MapFlags, ProtFlags};

use crate::Error;

/// A power-of-two byte ring whose backing pages are mapped twice
/// back-to-back, so a read or write of up to half the ring starting at any
/// offset is contiguous in virtual memory and never needs to be split at the
/// wrap point.
///
/// `head` and `tail` are free-running counters; only `offset & (size - 1)`
/// selects a byte, so the counters may wrap the u32 range freely as long as
/// `tail - head <= size` holds (unsigned difference).
pub(crate) struct MirroredRing {
    base: NonNull<c_void>,
    size: u32,
    head: AtomicU32,
    tail: AtomicU32,
}

// SAFETY: the mapping itself is plain shared memory and the head/tail
// counters are atomics. Synchronization of the bytes between the counters is
// the caller's contract (see task_queue.rs).
unsafe impl Send for MirroredRing {}
unsafe impl Sync for MirroredRing {}

impl MirroredRing {
    /// Maps `1 << order` bytes twice. `order` must be at least 12 so the
    /// ring is page aligned, which the fixed second mapping requires.
    pub fn new(order: u32) -> Result<Self, Error> {
        assert!(
            (12..32).contains(&order),
            "ring order {order} out of range (must cover whole pages)"
        );
        let size: u32 = 1 << order;
        let total = NonZeroUsize::new((size as usize) << 1).expect("nonzero by construction");
        let half = NonZeroUsize::new(size as usize).expect("nonzero by construction");

        // Reserve the whole window first so both fixed mappings land at known
        // addresses that nothing else can grab in between.
        let base = unsafe {
            mmap_anonymous(None, total, ProtFlags::PROT_NONE, MapFlags::MAP_PRIVATE)
        }
        .map_err(Error::Allocation)?;

        let fd = match create_backing_memfd(size) {
            Ok(fd) => fd,
            Err(e) => {
                // SAFETY: unmapping the reservation we just created.
                unsafe {
                    let _ = munmap(base, total.get());
                }
                return Err(Error::Allocation(e));
            }
        };

        for half_index in 0..2u32 {
            let at = base.as_ptr() as usize + (half_index as usize) * size as usize;
            let at = NonZeroUsize::new(at).expect("mapping address is never null");
            // SAFETY: `at` lies inside our own PROT_NONE reservation and the
            // backing file is exactly `size` bytes long.
            let mapped = unsafe {
                mmap(
                    Some(at),
                    half,
                    ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                    MapFlags::MAP_SHARED | MapFlags::MAP_FIXED,
                    &fd,
                    0,
                )
            };
            if let Err(e) = mapped {
                error!("fixed mapping of ring half {half_index} failed: {e}");
                // SAFETY: releasing the reservation including any half
                // already mapped over it.
                unsafe {
                    let _ = munmap(base, total.get());
                }
                return Err(Error::Allocation(e));
            }
        }

        Ok(MirroredRing {
            base,
            size,
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
        })
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn head(&self) -> &AtomicU32 {
        &self.head
    }

    pub fn tail(&self) -> &AtomicU32 {
        &self.tail
    }

    /// Pointer to the byte selected by a free-running offset. Thanks to the
    /// mirror, the pointed-at region is contiguous for at least `size` bytes
    /// past the masked offset.
    pub fn slot_ptr(&self, offset: u32) -> *mut u8 {
        let masked = (offset & (self.size - 1)) as usize;
        // SAFETY: masked < size and the double mapping is 2 * size long.
        unsafe { self.base.as_ptr().cast::<u8>().add(masked) }
    }
}

impl Drop for MirroredRing {
    fn drop(&mut self) {
        // SAFETY: base/size describe exactly the mapping created in new().
        unsafe {
            if let Err(e) = munmap(self.base, (self.size as usize) << 1) {
                error!("munmap of mirrored ring failed: {e}");
            }
        }
    }
}

/// Creates the anonymous backing file for the ring: an unlinked, sized,
/// close-on-exec memfd.
fn create_backing_memfd(size: u32) -> nix::Result<OwnedFd> {
    let name = c"net-reactor-ring";
    let raw = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if raw < 0 {
        return Err(Errno::last());
    }
    // SAFETY: memfd_create just handed us this descriptor.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    if unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } < 0 {
        return Err(Errno::last());
    }
    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_image_aliases_first() {
        let ring = MirroredRing::new(12).unwrap();
        let first = ring.slot_ptr(0);
        // SAFETY: both pointers are inside the 2 * size mapping.
        unsafe {
            let second = first.add(ring.size() as usize);
            *first = 0xAB;
            assert_eq!(*second, 0xAB);
            *second = 0x5C;
            assert_eq!(*first, 0x5C);
        }
    }

    #[test]
    fn records_are_contiguous_across_the_wrap() {
        let ring = MirroredRing::new(12).unwrap();
        let size = ring.size();
        let record = [1u8, 2, 3, 4, 5, 6, 7, 8];

        // Write an 8-byte record starting 4 bytes before the wrap point.
        let start = ring.slot_ptr(size - 4);
        // SAFETY: the mirror guarantees 8 contiguous bytes at this offset.
        unsafe {
            std::ptr::copy_nonoverlapping(record.as_ptr(), start, record.len());
            // The tail of the record must be visible at the front of the
            // first image.
            for (i, expected) in record[4..].iter().enumerate() {
                assert_eq!(*ring.slot_ptr(i as u32), *expected);
            }
            // And reading through the masked offset sees the whole record.
            for (i, expected) in record.iter().enumerate() {
                assert_eq!(*ring.slot_ptr(size - 4 + i as u32), *expected);
            }
        }
    }

    #[test]
    fn free_running_offsets_mask_into_range() {
        let ring = MirroredRing::new(12).unwrap();
        assert_eq!(ring.slot_ptr(0), ring.slot_ptr(ring.size()));
        assert_eq!(ring.slot_ptr(64), ring.slot_ptr(ring.size().wrapping_mul(3) + 64));
    }
}
