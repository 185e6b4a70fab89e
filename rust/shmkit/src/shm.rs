//! Named POSIX shared memory objects and their mappings.
//!
//! A [`SharedObject`] is the open handle (`shm_open`), a [`SharedRegion`] is
//! one `mmap` of it. Unlinking is explicit: whichever side owns the object's
//! lifetime calls [`SharedObject::unlink`], so a process that merely attached
//! can never remove the name from under the others.

use std::ffi::{CStr, CString};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use crate::error::{Error, Result};
use crate::region::Region;

bitflags::bitflags! {
    /// Permission bits for one class of user.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Access: u32 {
        const READ = 0b100;
        const WRITE = 0b010;
        const EXECUTE = 0b001;
    }
}

/// Owner/group/others permissions for a newly created object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Permissions {
    pub owner: Access,
    pub group: Access,
    pub others: Access,
}

impl Permissions {
    /// The `mode_t` bits (`0o644` for the default).
    pub fn mode(&self) -> libc::mode_t {
        ((self.owner.bits() << 6) | (self.group.bits() << 3) | self.others.bits()) as libc::mode_t
    }
}

impl Default for Permissions {
    /// `rw-r--r--`
    fn default() -> Self {
        Self {
            owner: Access::READ | Access::WRITE,
            group: Access::READ,
            others: Access::READ,
        }
    }
}

/// How an object is opened and mapped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    ReadWrite,
}

impl AccessMode {
    fn open_flags(self) -> libc::c_int {
        match self {
            Self::Read => libc::O_RDONLY,
            Self::ReadWrite => libc::O_RDWR,
        }
    }

    fn protection(self) -> libc::c_int {
        match self {
            Self::Read => libc::PROT_READ,
            Self::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        }
    }
}

/// An open named shared memory object.
#[derive(Debug)]
pub struct SharedObject {
    fd: OwnedFd,
    name: CString,
    created: bool,
}

impl SharedObject {
    /// Open `name`, creating it with default permissions if it does not
    /// exist yet. A leading `/` is added when missing.
    pub fn open(name: &str, mode: AccessMode) -> Result<Self> {
        Self::open_with(name, mode, Permissions::default())
    }

    /// Like [`open`](Self::open), with explicit permissions for the create
    /// case. An object that already exists keeps its permissions.
    pub fn open_with(name: &str, mode: AccessMode, permissions: Permissions) -> Result<Self> {
        let name = object_name(name)?;
        let flags = mode.open_flags();
        let perm = permissions.mode();

        // SAFETY: name is a valid NUL-terminated string.
        let fd = unsafe {
            libc::shm_open(
                name.as_ptr(),
                flags | libc::O_CREAT | libc::O_EXCL,
                perm as libc::c_uint,
            )
        };
        if fd >= 0 {
            // SAFETY: shm_open returned a fresh descriptor we now own.
            let fd = unsafe { OwnedFd::from_raw_fd(fd) };
            // The umask has been applied to the create mode; force the
            // requested bits.
            // SAFETY: fd is open.
            if unsafe { libc::fchmod(fd.as_raw_fd(), perm) } != 0 {
                return Err(Error::last_os_error("fchmod"));
            }
            tracing::debug!(name = ?name, mode = perm, "created shared object");
            return Ok(Self {
                fd,
                name,
                created: true,
            });
        }

        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(Error::SystemCall {
                call: "shm_open",
                source: err,
            });
        }

        // SAFETY: as above.
        let fd = unsafe { libc::shm_open(name.as_ptr(), flags, perm as libc::c_uint) };
        if fd < 0 {
            return Err(Error::last_os_error("shm_open"));
        }
        tracing::debug!(name = ?name, "opened existing shared object");
        Ok(Self {
            // SAFETY: shm_open returned a fresh descriptor we now own.
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            name,
            created: false,
        })
    }

    /// The normalised name, with its leading slash.
    pub fn name(&self) -> &CStr {
        &self.name
    }

    /// Whether this handle created the object (as opposed to finding it).
    pub fn created(&self) -> bool {
        self.created
    }

    /// Current size of the object in bytes.
    pub fn len(&self) -> Result<usize> {
        let mut stat = std::mem::MaybeUninit::<libc::stat>::zeroed();
        // SAFETY: fd is open and stat points to writable storage.
        if unsafe { libc::fstat(self.fd.as_raw_fd(), stat.as_mut_ptr()) } != 0 {
            return Err(Error::last_os_error("fstat"));
        }
        // SAFETY: fstat succeeded and filled the struct.
        let stat = unsafe { stat.assume_init() };
        Ok(stat.st_size as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Make sure the object is at least `size` bytes. Never shrinks, so a
    /// late attacher asking for less cannot cut off an earlier mapping.
    pub fn allocate(&self, size: usize) -> Result<()> {
        if self.len()? >= size {
            return Ok(());
        }
        // SAFETY: fd is open.
        if unsafe { libc::ftruncate(self.fd.as_raw_fd(), size as libc::off_t) } != 0 {
            return Err(Error::last_os_error("ftruncate"));
        }
        tracing::debug!(name = ?self.name, size, "sized shared object");
        Ok(())
    }

    /// Map `len` bytes starting at `offset`. The offset need not be page
    /// aligned; the mapping starts at the page boundary below it and the
    /// returned region skips the difference.
    pub fn map(&self, offset: usize, len: usize, mode: AccessMode) -> Result<SharedRegion> {
        if len == 0 {
            return Err(Error::precondition("cannot map zero bytes"));
        }
        let page = page_size()?;
        let correction = offset % page;
        let map_len = correction + len;

        // SAFETY: fd is open; a null hint lets the kernel choose the address.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                mode.protection(),
                libc::MAP_SHARED,
                self.fd.as_raw_fd(),
                (offset - correction) as libc::off_t,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::last_os_error("mmap"));
        }
        tracing::debug!(name = ?self.name, offset, len, "mapped shared object");

        Ok(SharedRegion {
            base: base as *mut u8,
            map_len,
            correction,
            len,
        })
    }

    /// Remove the name. Existing handles and mappings stay valid.
    pub fn unlink(&self) -> Result<()> {
        unlink(&self.name)
    }
}

/// Remove a named object without opening it.
pub fn unlink_name(name: &str) -> Result<()> {
    unlink(&object_name(name)?)
}

fn unlink(name: &CStr) -> Result<()> {
    // SAFETY: name is a valid NUL-terminated string.
    if unsafe { libc::shm_unlink(name.as_ptr()) } != 0 {
        return Err(Error::last_os_error("shm_unlink"));
    }
    tracing::debug!(?name, "unlinked shared object");
    Ok(())
}

fn object_name(name: &str) -> Result<CString> {
    let slashed = if name.starts_with('/') {
        name.to_owned()
    } else {
        format!("/{}", name)
    };
    CString::new(slashed)
        .map_err(|_| Error::precondition(format!("shared object name {:?} contains NUL", name)))
}

/// System page size.
pub fn page_size() -> Result<usize> {
    // SAFETY: sysconf has no memory-safety preconditions.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page <= 0 {
        return Err(Error::last_os_error("sysconf(_SC_PAGESIZE)"));
    }
    Ok(page as usize)
}

/// One mapping of a [`SharedObject`]. Unmapped on drop.
pub struct SharedRegion {
    base: *mut u8,
    map_len: usize,
    correction: usize,
    len: usize,
}

// SAFETY: the mapping is plain memory; concurrent access to its contents is
// synchronised by whatever lives there.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// The requested bytes (page correction already skipped).
    pub fn region(&self) -> Region {
        // SAFETY: base + correction .. + len lies inside the live mapping,
        // which outlives any use the caller makes while holding &self.
        unsafe { Region::from_raw(self.base.add(self.correction), self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("base", &self.base)
            .field("correction", &self.correction)
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: base and map_len are exactly what mmap returned and took.
        if unsafe { libc::munmap(self.base as *mut libc::c_void, self.map_len) } != 0 {
            tracing::warn!(
                err = %std::io::Error::last_os_error(),
                "failed to unmap shared region"
            );
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn unique(tag: &str) -> String {
        format!("shmkit-shm-{}-{}", std::process::id(), tag)
    }

    #[test]
    fn default_permissions_are_rw_r_r() {
        assert_eq!(Permissions::default().mode(), 0o644);
        let all = Permissions {
            owner: Access::all(),
            group: Access::READ | Access::EXECUTE,
            others: Access::empty(),
        };
        assert_eq!(all.mode(), 0o750);
    }

    #[test]
    fn second_open_attaches_to_the_same_bytes() {
        let name = unique("attach");
        let first = SharedObject::open(&name, AccessMode::ReadWrite).unwrap();
        assert!(first.created());
        assert_eq!(first.name().to_str().unwrap(), format!("/{}", name));
        first.allocate(8192).unwrap();

        let second = SharedObject::open(&name, AccessMode::ReadWrite).unwrap();
        assert!(!second.created());
        assert_eq!(second.len().unwrap(), 8192);

        // Shrinking requests are ignored.
        second.allocate(100).unwrap();
        assert_eq!(first.len().unwrap(), 8192);

        let a = first.map(0, 8192, AccessMode::ReadWrite).unwrap();
        let b = second.map(0, 8192, AccessMode::ReadWrite).unwrap();
        unsafe {
            *a.region().get_mut::<u64>(4096) = 0x5eed;
            assert_eq!(*b.region().get::<u64>(4096), 0x5eed);
        }

        first.unlink().unwrap();
        assert!(second.unlink().is_err());
    }

    #[test]
    fn unaligned_offsets_are_corrected() {
        let name = unique("offset");
        let object = SharedObject::open(&name, AccessMode::ReadWrite).unwrap();
        object.allocate(3 * 4096).unwrap();

        let whole = object.map(0, 3 * 4096, AccessMode::ReadWrite).unwrap();
        let part = object.map(4096 + 24, 64, AccessMode::ReadWrite).unwrap();
        assert_eq!(part.len(), 64);
        unsafe {
            *whole.region().get_mut::<u64>(4096 + 24) = 77;
            assert_eq!(*part.region().get::<u64>(0), 77);
        }
        object.unlink().unwrap();
    }

    #[test]
    fn names_with_nul_are_rejected() {
        let err = SharedObject::open("bad\0name", AccessMode::ReadWrite).unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }
}
