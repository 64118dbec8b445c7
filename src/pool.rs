//! Shared Frame Pool
//!
//! One POSIX shared-memory object sliced into [`SLOT_COUNT`] equal slots of a
//! fixed geometry. The compositor maps the same object through `wl_shm`; this
//! side only ever writes into the slot that is not currently on screen.

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use nix::fcntl::OFlag;
use nix::sys::mman::{self, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use tracing::{debug, trace, warn};

use crate::error::BridgeError;

/// Number of buffer slots. Two is enough for strict double buffering and is a
/// deliberate scope limit, not a tuning knob.
pub const SLOT_COUNT: usize = 2;

/// Bytes per pixel of the XRGB8888 layout both sides agree on
pub const BYTES_PER_PIXEL: u32 = 4;

/// Per-instance counter so several pools in one process get distinct names
static POOL_SERIAL: AtomicU32 = AtomicU32::new(0);

/// Fixed slot geometry, known before the pool exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    /// Row stride in bytes
    pub stride: u32,
}

impl FrameGeometry {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            stride: width * BYTES_PER_PIXEL,
        }
    }

    /// Byte size of one slot
    pub fn slot_len(&self) -> usize {
        self.stride as usize * self.height as usize
    }

    /// Byte size of the whole pool
    pub fn pool_len(&self) -> usize {
        self.slot_len() * SLOT_COUNT
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Safe to refill
    Idle,
    /// Attached to the surface by the latest commit
    Presented,
}

/// The shared-memory pool and its slot rotation
pub struct FramePool {
    fd: OwnedFd,
    map: NonNull<c_void>,
    len: usize,
    geometry: FrameGeometry,
    slots: [SlotState; SLOT_COUNT],
    next: usize,
}

impl FramePool {
    /// Create, unlink, size and map the backing object.
    ///
    /// The name is removed from the namespace right after creation so the only
    /// remaining reference is our descriptor. Two instances starting in the
    /// same instant can still race on the name; `O_EXCL` turns that into a
    /// startup failure rather than a shared mapping.
    pub fn create(geometry: FrameGeometry) -> Result<Self, BridgeError> {
        let len = geometry.pool_len();
        let size = NonZeroUsize::new(len).ok_or_else(|| {
            BridgeError::resource(
                "shared frame pool",
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty frame geometry"),
            )
        })?;

        let name = format!(
            "/saverbridge-{}-{}",
            std::process::id(),
            POOL_SERIAL.fetch_add(1, Ordering::Relaxed)
        );

        let fd = mman::shm_open(
            name.as_str(),
            OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_EXCL,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| BridgeError::resource("shared memory object", e))?;

        if let Err(e) = mman::shm_unlink(name.as_str()) {
            // The mapping still works; the name just lingers until reboot.
            warn!("Failed to unlink shared memory object {}: {}", name, e);
        }

        nix::unistd::ftruncate(&fd, len as nix::libc::off_t)
            .map_err(|e| BridgeError::resource("shared memory size", e))?;

        // SAFETY: fresh shared mapping of an object we just sized; nothing else
        // in this process aliases it.
        let map = unsafe {
            mman::mmap(
                None,
                size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        }
        .map_err(|e| BridgeError::resource("shared memory mapping", e))?;

        debug!(
            "Created frame pool {} ({} bytes, {} slots of {}x{} stride {})",
            name, len, SLOT_COUNT, geometry.width, geometry.height, geometry.stride
        );

        Ok(Self {
            fd,
            map,
            len,
            geometry,
            slots: [SlotState::Idle; SLOT_COUNT],
            next: 0,
        })
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    /// Total size of the shared object in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Byte offset of a slot inside the pool
    pub fn slot_offset(&self, slot: usize) -> usize {
        slot * self.geometry.slot_len()
    }

    /// Index of the slot the next redraw refills
    pub fn next_slot(&self) -> usize {
        self.next
    }

    #[cfg(test)]
    pub fn slot_state(&self, slot: usize) -> SlotState {
        self.slots[slot]
    }

    fn slot_mut(&mut self, slot: usize) -> &mut [u8] {
        let slot_len = self.geometry.slot_len();
        let offset = self.slot_offset(slot);
        // SAFETY: offset + slot_len <= len for every slot < SLOT_COUNT, and the
        // &mut self borrow keeps the slice unique.
        unsafe {
            let base = self.map.as_ptr().cast::<u8>().add(offset);
            std::slice::from_raw_parts_mut(base, slot_len)
        }
    }

    /// Copy captured pixels into an idle slot, clamped to the slot capacity.
    ///
    /// Returns the number of bytes written. A longer reply is cut at the slot
    /// boundary without error; a shorter one leaves the tail untouched.
    pub fn fill(&mut self, slot: usize, pixels: &[u8]) -> usize {
        debug_assert_eq!(self.slots[slot], SlotState::Idle, "refilling a presented slot");
        let dest = self.slot_mut(slot);
        let n = pixels.len().min(dest.len());
        dest[..n].copy_from_slice(&pixels[..n]);
        if pixels.len() > n {
            trace!("Clamped {} byte capture to {} byte slot {}", pixels.len(), n, slot);
        }
        n
    }

    /// Record that `slot` is now on screen and rotate to the other one
    pub fn mark_presented(&mut self, slot: usize) {
        for (i, state) in self.slots.iter_mut().enumerate() {
            *state = if i == slot { SlotState::Presented } else { SlotState::Idle };
        }
        self.next = (slot + 1) % SLOT_COUNT;
    }

    #[cfg(test)]
    pub(crate) fn slot_bytes(&mut self, slot: usize) -> Vec<u8> {
        self.slot_mut(slot).to_vec()
    }
}

impl AsFd for FramePool {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Drop for FramePool {
    fn drop(&mut self) {
        // SAFETY: map/len are exactly what mmap returned; no slices outlive self.
        if let Err(e) = unsafe { mman::munmap(self.map, self.len) } {
            warn!("Failed to unmap frame pool: {}", e);
        }
        debug!("Released frame pool ({} bytes)", self.len);
    }
}
