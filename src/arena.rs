//! Length-prefixed frame exchange over a shared memory segment
//!
//! The arena holds exactly one frame at a time:
//!
//! ```text
//! +----------------+---------------------------+-----------------+
//! | len: u32 (LE)  | payload (len bytes)       | unspecified     |
//! +----------------+---------------------------+-----------------+
//! 0                4                           4 + len           capacity
//! ```
//!
//! The arena does no locking. Turn-taking is provided by the handshake: a
//! side only touches the arena between receiving and sending a signal.

use crate::error::{BridgeError, Result};
use crate::shm::{ShmKey, ShmSegment};

/// Size of the length prefix
pub const HEADER_BYTES: usize = 4;

/// Default arena capacity (10 MiB)
pub const DEFAULT_CAPACITY: usize = 10 * 1024 * 1024;

/// Write `payload` as one frame at the start of `region`
///
/// On overflow the region is left untouched.
pub fn write_frame(region: &mut [u8], payload: &[u8]) -> Result<()> {
    let capacity = region.len();
    let needed = HEADER_BYTES + payload.len();
    let len = u32::try_from(payload.len()).map_err(|_| BridgeError::CapacityExceeded {
        capacity,
        needed,
    })?;
    if needed > capacity {
        return Err(BridgeError::CapacityExceeded { capacity, needed });
    }

    region[HEADER_BYTES..needed].copy_from_slice(payload);
    region[..HEADER_BYTES].copy_from_slice(&len.to_le_bytes());
    Ok(())
}

/// Read the frame at the start of `region`
///
/// A declared length larger than the region can hold is reported as
/// corruption rather than read.
pub fn read_frame(region: &[u8]) -> Result<&[u8]> {
    let limit = region.len().saturating_sub(HEADER_BYTES);
    let header: [u8; HEADER_BYTES] = region
        .get(..HEADER_BYTES)
        .and_then(|h| h.try_into().ok())
        .ok_or(BridgeError::CorruptFrame { declared: 0, limit })?;

    let declared = u32::from_le_bytes(header) as usize;
    if declared > limit {
        return Err(BridgeError::CorruptFrame { declared, limit });
    }
    Ok(&region[HEADER_BYTES..HEADER_BYTES + declared])
}

/// Fixed-capacity frame buffer backed by a SysV segment
pub struct SharedMemoryArena {
    segment: ShmSegment,
}

impl SharedMemoryArena {
    /// Create (or reuse) the segment for `key` with room for `capacity` bytes
    pub fn create(key: ShmKey, capacity: usize) -> Result<Self> {
        if capacity < HEADER_BYTES {
            return Err(BridgeError::Config(format!(
                "arena capacity {} is smaller than the {}-byte header",
                capacity, HEADER_BYTES
            )));
        }
        let segment = ShmSegment::create(key, capacity)?;
        log::debug!(
            "Created arena: id={} key=0x{:08X} capacity={}",
            segment.id(),
            key.as_raw(),
            segment.size()
        );
        Ok(Self { segment })
    }

    /// Attach to the existing segment for `key`
    pub fn attach(key: ShmKey) -> Result<Self> {
        Self::from_segment(ShmSegment::attach(key)?)
    }

    /// Attach to an existing segment by id
    pub fn attach_id(id: i32) -> Result<Self> {
        Self::from_segment(ShmSegment::attach_id(id)?)
    }

    fn from_segment(segment: ShmSegment) -> Result<Self> {
        if segment.size() < HEADER_BYTES {
            return Err(BridgeError::Config(format!(
                "shared memory segment {} is only {} bytes",
                segment.id(),
                segment.size()
            )));
        }
        log::debug!("Attached arena: id={} capacity={}", segment.id(), segment.size());
        Ok(Self { segment })
    }

    /// Total bytes available, header included
    #[inline]
    pub fn capacity(&self) -> usize {
        self.segment.size()
    }

    /// Largest payload a single frame can carry
    #[inline]
    pub fn max_payload(&self) -> usize {
        self.capacity() - HEADER_BYTES
    }

    #[inline]
    pub fn id(&self) -> i32 {
        self.segment.id()
    }

    /// Replace the arena contents with one frame
    pub fn write(&mut self, payload: &[u8]) -> Result<()> {
        write_frame(self.region_mut(), payload)?;
        log::trace!("Wrote frame of {} bytes", payload.len());
        Ok(())
    }

    /// Copy out the current frame
    pub fn read(&self) -> Result<Vec<u8>> {
        let payload = read_frame(self.region())?.to_vec();
        log::trace!("Read frame of {} bytes", payload.len());
        Ok(payload)
    }

    /// Remove the segment when this arena is dropped
    pub fn set_destroy_on_close(&mut self, destroy: bool) {
        self.segment.set_remove_on_drop(destroy);
    }

    /// Detach, leaving the segment for other processes
    pub fn close(self) -> Result<()> {
        self.segment.detach()
    }

    /// Detach and remove the segment
    pub fn destroy(self) -> Result<()> {
        self.segment.destroy()
    }

    fn region(&self) -> &[u8] {
        // SAFETY: the segment is attached for the lifetime of self and spans size() bytes
        unsafe { std::slice::from_raw_parts(self.segment.as_ptr(), self.segment.size()) }
    }

    fn region_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in region(); &mut self excludes other views from this process
        unsafe { std::slice::from_raw_parts_mut(self.segment.as_ptr(), self.segment.size()) }
    }
}
