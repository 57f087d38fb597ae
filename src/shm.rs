//! Low-level System V shared memory operations

use crate::error::{BridgeError, Result};
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr::NonNull;

/// Permission bits for newly created segments
const SEGMENT_MODE: libc::c_int = 0o666;

/// SysV IPC key identifying a segment across processes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShmKey(libc::key_t);

impl ShmKey {
    /// Derive a key from an existing path and a project id, as `ftok(3)` does
    pub fn from_path(path: &Path, project_id: i32) -> Result<Self> {
        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|e| BridgeError::ShmKey {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidInput, e),
        })?;

        let key = unsafe { libc::ftok(c_path.as_ptr(), project_id) };
        if key == -1 {
            return Err(BridgeError::ShmKey {
                path: path.to_path_buf(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(Self(key))
    }

    /// Key that always creates a fresh, unnamed segment
    ///
    /// Peers can only reach such a segment through its id.
    pub const fn private() -> Self {
        Self(libc::IPC_PRIVATE)
    }

    pub const fn from_raw(key: libc::key_t) -> Self {
        Self(key)
    }

    #[inline(always)]
    pub fn as_raw(self) -> libc::key_t {
        self.0
    }
}

/// Attachment to a SysV shared memory segment
pub struct ShmSegment {
    id: i32,
    addr: NonNull<u8>,
    size: usize,
    attached: bool,
    remove_on_drop: bool,
}

// SAFETY: the mapping stays valid until detached and is only accessed
// through &self / &mut self; cross-process ordering is provided by the
// handshake, not by this type.
unsafe impl Send for ShmSegment {}

impl ShmSegment {
    /// Create the segment for `key`, or reuse it if it already exists
    ///
    /// The attached region is zeroed. Fails if an existing segment is smaller
    /// than `size`.
    pub fn create(key: ShmKey, size: usize) -> Result<Self> {
        let id = unsafe { libc::shmget(key.as_raw(), size, libc::IPC_CREAT | SEGMENT_MODE) };
        if id == -1 {
            return Err(BridgeError::ShmCreate {
                key: key.as_raw(),
                size,
                source: io::Error::last_os_error(),
            });
        }

        let segment = Self::attach_id(id)?;
        unsafe {
            std::ptr::write_bytes(segment.as_ptr(), 0, segment.size);
        }
        Ok(segment)
    }

    /// Attach to the existing segment for `key`
    pub fn attach(key: ShmKey) -> Result<Self> {
        let id = unsafe { libc::shmget(key.as_raw(), 0, 0) };
        if id == -1 {
            return Err(BridgeError::ShmAttach {
                target: format!("key 0x{:08X}", key.as_raw()),
                source: io::Error::last_os_error(),
            });
        }
        Self::attach_id(id)
    }

    /// Attach to an existing segment by id
    pub fn attach_id(id: i32) -> Result<Self> {
        let attach_error = || BridgeError::ShmAttach {
            target: format!("id {}", id),
            source: io::Error::last_os_error(),
        };

        let size = segment_size(id).ok_or_else(attach_error)?;

        let addr = unsafe { libc::shmat(id, std::ptr::null(), 0) };
        if addr as isize == -1 {
            return Err(attach_error());
        }
        let addr = NonNull::new(addr.cast::<u8>()).ok_or_else(attach_error)?;

        Ok(Self {
            id,
            addr,
            size,
            attached: true,
            remove_on_drop: false,
        })
    }

    /// Segment id, usable by peers with [`ShmSegment::attach_id`]
    #[inline(always)]
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Size of the segment in bytes
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get raw pointer to shared memory
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    /// Mark the segment for removal when this handle is dropped
    pub fn set_remove_on_drop(&mut self, remove: bool) {
        self.remove_on_drop = remove;
    }

    /// Detach, leaving the segment in place for other processes
    pub fn detach(mut self) -> Result<()> {
        self.remove_on_drop = false;
        self.release()
    }

    /// Detach and mark the segment for removal
    pub fn destroy(mut self) -> Result<()> {
        self.remove_on_drop = true;
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if self.attached {
            self.attached = false;
            if unsafe { libc::shmdt(self.addr.as_ptr().cast()) } == -1 {
                return Err(BridgeError::Cleanup {
                    resource: format!("shared memory segment {}", self.id),
                    source: io::Error::last_os_error(),
                });
            }
        }

        if self.remove_on_drop {
            self.remove_on_drop = false;
            let rc = unsafe { libc::shmctl(self.id, libc::IPC_RMID, std::ptr::null_mut()) };
            if rc == -1 {
                return Err(BridgeError::Cleanup {
                    resource: format!("shared memory segment {}", self.id),
                    source: io::Error::last_os_error(),
                });
            }
        }

        Ok(())
    }
}

fn segment_size(id: i32) -> Option<usize> {
    let mut stat: libc::shmid_ds = unsafe { std::mem::zeroed() };
    if unsafe { libc::shmctl(id, libc::IPC_STAT, &mut stat) } == -1 {
        return None;
    }
    Some(stat.shm_segsz as usize)
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_attach() {
        let size = 4096;

        let shm1 = ShmSegment::create(ShmKey::private(), size).unwrap();
        assert_eq!(shm1.size(), size);
        assert_eq!(unsafe { std::ptr::read(shm1.as_ptr().add(100)) }, 0);

        unsafe {
            std::ptr::write(shm1.as_ptr(), 42u8);
        }

        // Attach from another "process"
        let shm2 = ShmSegment::attach_id(shm1.id()).unwrap();
        assert_eq!(shm2.size(), size);
        let val = unsafe { std::ptr::read(shm2.as_ptr()) };
        assert_eq!(val, 42u8);

        shm2.detach().unwrap();
        shm1.destroy().unwrap();
    }

    #[test]
    fn test_destroyed_segment_cannot_be_attached() {
        let shm = ShmSegment::create(ShmKey::private(), 1024).unwrap();
        let id = shm.id();
        shm.destroy().unwrap();

        assert!(matches!(
            ShmSegment::attach_id(id),
            Err(BridgeError::ShmAttach { .. })
        ));
    }

    #[test]
    fn test_key_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let a = ShmKey::from_path(dir.path(), 1).unwrap();
        let b = ShmKey::from_path(dir.path(), 1).unwrap();
        let c = ShmKey::from_path(dir.path(), 2).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);

        let missing = dir.path().join("missing");
        assert!(matches!(
            ShmKey::from_path(&missing, 1),
            Err(BridgeError::ShmKey { .. })
        ));
    }
}
