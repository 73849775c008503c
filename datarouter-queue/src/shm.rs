// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use std::ffi::{CStr, CString};
use std::fs::File;
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::OwnedFd;
use std::os::unix::fs::MetadataExt;
use std::ptr::NonNull;

fn page_aligned_size(size: usize) -> usize {
    let page_size = page_size::get();
    // round up to nearest page
    ((size - 1) & !(page_size - 1)) + page_size
}

struct ShmPath {
    name: CString,
}

impl Drop for ShmPath {
    fn drop(&mut self) {
        _ = shm_unlink(self.name.as_c_str());
    }
}

/// A named POSIX shared-memory object mapped read-write into this process.
///
/// The creating side owns the filesystem name and unlinks it on drop, or
/// earlier via [`SharedMapping::unlink`] once the peer confirmed attachment.
/// The opening side never unlinks implicitly.
pub struct SharedMapping {
    ptr: NonNull<libc::c_void>,
    size: usize,
    path: Option<ShmPath>,
    name: CString,
    _fd: OwnedFd,
}

// The mapping is plain shared bytes; all concurrent access goes through the
// atomics of the control blocks placed inside it.
unsafe impl Send for SharedMapping {}
unsafe impl Sync for SharedMapping {}

impl SharedMapping {
    /// Creates the shared-memory object (producer side).
    pub fn create(path: &CStr, size: usize) -> io::Result<SharedMapping> {
        let size = page_aligned_size(size);
        let fd = shm_open(
            path,
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::S_IWUSR | Mode::S_IRUSR,
        )?;
        ftruncate(&fd, size as libc::off_t)?;
        Self::map(fd, path, size, true)
    }

    /// Opens an existing shared-memory object (daemon side); the size is
    /// taken from the object itself.
    pub fn open(path: &CStr) -> io::Result<SharedMapping> {
        let fd = shm_open(path, OFlag::O_RDWR, Mode::empty())?;
        let file: File = fd.into();
        let size = file.metadata()?.size() as usize;
        Self::map(file.into(), path, size, false)
    }

    fn map(fd: OwnedFd, path: &CStr, size: usize, owns_name: bool) -> io::Result<SharedMapping> {
        let len = NonZeroUsize::new(size)
            .ok_or_else(|| io::Error::other("cannot map shared memory of size zero"))?;
        let ptr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )?
        };
        let name = path.to_owned();
        Ok(SharedMapping {
            ptr,
            size,
            path: owns_name.then(|| ShmPath { name: name.clone() }),
            name,
            _fd: fd,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr().cast()
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn name(&self) -> &CStr {
        &self.name
    }

    /// Removes the object from the filesystem namespace now instead of at
    /// drop time. Existing mappings stay valid until unmapped.
    pub fn unlink(&mut self) {
        self.path.take();
    }
}

impl Drop for SharedMapping {
    fn drop(&mut self) {
        unsafe {
            _ = munmap(self.ptr, self.size);
        }
    }
}

#[cfg(test)]
pub(crate) fn unique_shm_name(tag: &str) -> CString {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let name = format!(
        "/datarouter-test-{}-{}-{}",
        tag,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    );
    CString::new(name).unwrap()
}
