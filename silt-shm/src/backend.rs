//! # Memory Backends
//!
//! A backend is a contiguous attachable region with three parts:
//!
//! ```text
//! [ private scratch | shared header | data ]
//!   ^ per process     ^ cross-process, written once at create
//! ```
//!
//! The first [`BACKEND_PRIVATE_SIZE`] bytes are mapped anonymously in every
//! process (process-local scratch, never shared). The rest is the shared
//! tail: a [`BackendHeader`] carrying identity, sizes and the owner flag,
//! then the page-aligned data region the allocators manage.
//!
//! Two backends are provided: [`PosixShmBackend`] over a POSIX shared-memory
//! object, and [`MallocBackend`] over an anonymous private mapping with the
//! identical layout, used by tests and single-process embedding.

use std::ffi::CString;
use std::sync::atomic::{AtomicU32, Ordering};

use nix::libc;

use crate::error::{ShmError, ShmResult};
use crate::ptr::MemRegion;

/// Size of the per-process private prefix.
pub const BACKEND_PRIVATE_SIZE: usize = 16 * 1024;

/// Minimum data-region size; smaller requests are rounded up.
pub const BACKEND_MIN_SIZE: usize = 1024 * 1024;

/// Header magic ("SILTSHM1").
const BACKEND_MAGIC: u64 = 0x53494c5453484d31;

/// Backend identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoryBackendId(pub u32);

impl MemoryBackendId {
    /// Get the raw id.
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

/// Cross-process shared header at the start of the shared tail.
///
/// Written once by the creating process; attachers only read the sizes and
/// transition the owner flag. Every attached process observes the same bytes.
#[repr(C)]
pub struct BackendHeader {
    magic: u64,
    id: u32,
    _pad0: u32,
    /// Size of the data region in bytes.
    data_size: u64,
    /// Size of the whole shared tail (header page + data).
    shared_size: u64,
    /// Owner flag: 1 while some process holds cleanup responsibility.
    owner: AtomicU32,
    _pad1: u32,
}

fn page_size() -> usize {
    // SAFETY: sysconf(_SC_PAGESIZE) is always safe and returns a positive value.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Common mapped-layout bookkeeping shared by both backend kinds.
struct Mapping {
    /// Start of the whole mapping (the private prefix).
    map_base: *mut u8,
    /// Total mapped length (private + shared).
    total_len: usize,
    /// The shared header.
    header: *mut BackendHeader,
    /// Start of the data region.
    data: *mut u8,
    /// Data region length.
    data_size: usize,
}

impl Mapping {
    fn header(&self) -> &BackendHeader {
        // SAFETY: the header was initialized before any Mapping is handed out.
        unsafe { &*self.header }
    }
}

/// Compute `(aligned_header_size, shared_size)` for a data size.
fn shared_layout(data_size: usize) -> (usize, usize) {
    let ps = page_size();
    let header = round_up(std::mem::size_of::<BackendHeader>(), ps);
    (header, header + data_size)
}

/// Reserve `private + shared` contiguous bytes anonymously.
///
/// Returns the base of the reservation. The shared window is remapped over
/// `[base + BACKEND_PRIVATE_SIZE, ..)` by the caller when file-backed.
fn reserve_mixed(total: usize) -> ShmResult<*mut u8> {
    // SAFETY: anonymous private mapping with no fixed address.
    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            total,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        return Err(ShmError::BackingStoreError(last_errno()));
    }
    Ok(base as *mut u8)
}

/// Map the shared object over the tail of a mixed reservation.
fn map_shared_fixed(base: *mut u8, shared_size: usize, fd: i32) -> ShmResult<()> {
    // SAFETY: `base + BACKEND_PRIVATE_SIZE` lies within the reservation made
    // by `reserve_mixed`, so MAP_FIXED replaces only pages we own.
    let shared = unsafe {
        libc::mmap(
            base.add(BACKEND_PRIVATE_SIZE) as *mut libc::c_void,
            shared_size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED,
            fd,
            0,
        )
    };
    if shared == libc::MAP_FAILED {
        return Err(ShmError::BackingStoreError(last_errno()));
    }
    Ok(())
}

fn build_mapping(map_base: *mut u8, data_size: usize) -> Mapping {
    let (header_size, shared_size) = shared_layout(data_size);
    // SAFETY: offsets computed from the layout above stay inside the mapping.
    unsafe {
        let shared = map_base.add(BACKEND_PRIVATE_SIZE);
        Mapping {
            map_base,
            total_len: BACKEND_PRIVATE_SIZE + shared_size,
            header: shared as *mut BackendHeader,
            data: shared.add(header_size),
            data_size,
        }
    }
}

/// POSIX shared-memory backend (`shm_open` + mixed private/shared `mmap`).
pub struct PosixShmBackend {
    id: MemoryBackendId,
    url: String,
    fd: i32,
    mapping: Mapping,
    /// Whether this process holds cleanup responsibility.
    owned: bool,
    initialized: bool,
}

impl PosixShmBackend {
    /// Create a new shared region of `size` data bytes at `url`.
    ///
    /// Fails with `AlreadyExists` when the object is present, with
    /// `BackingStoreError` on any OS failure. The creating process holds the
    /// owner flag.
    pub fn create(id: MemoryBackendId, size: usize, url: &str) -> ShmResult<Self> {
        let data_size = round_up(size.max(BACKEND_MIN_SIZE), page_size());
        let (_, shared_size) = shared_layout(data_size);

        let c_url = CString::new(url).map_err(|_| ShmError::BackingStoreError(libc::EINVAL))?;
        // SAFETY: c_url is a valid C string; O_EXCL makes creation exclusive.
        let fd = unsafe {
            libc::shm_open(
                c_url.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600,
            )
        };
        if fd < 0 {
            let errno = last_errno();
            return Err(if errno == libc::EEXIST {
                ShmError::AlreadyExists
            } else {
                ShmError::BackingStoreError(errno)
            });
        }

        // SAFETY: fd is the object just created.
        if unsafe { libc::ftruncate(fd, shared_size as libc::off_t) } != 0 {
            let errno = last_errno();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_url.as_ptr());
            }
            return Err(ShmError::BackingStoreError(errno));
        }

        let base = match reserve_mixed(BACKEND_PRIVATE_SIZE + shared_size) {
            Ok(base) => base,
            Err(e) => {
                // SAFETY: fd/url were created above and are otherwise leaked.
                unsafe {
                    libc::close(fd);
                    libc::shm_unlink(c_url.as_ptr());
                }
                return Err(e);
            }
        };
        if let Err(e) = map_shared_fixed(base, shared_size, fd) {
            // SAFETY: base covers the reservation; fd/url as above.
            unsafe {
                libc::munmap(base as *mut libc::c_void, BACKEND_PRIVATE_SIZE + shared_size);
                libc::close(fd);
                libc::shm_unlink(c_url.as_ptr());
            }
            return Err(e);
        }

        let mapping = build_mapping(base, data_size);
        // SAFETY: header points at freshly mapped zeroed shared pages.
        unsafe {
            let header = &mut *mapping.header;
            header.magic = BACKEND_MAGIC;
            header.id = id.0;
            header.data_size = data_size as u64;
            header.shared_size = shared_size as u64;
            header.owner = AtomicU32::new(1);
        }

        Ok(Self {
            id,
            url: url.to_string(),
            fd,
            mapping,
            owned: true,
            initialized: true,
        })
    }

    /// Attach to an existing region. The owner flag is left untouched; the
    /// attaching process does not hold cleanup responsibility.
    pub fn attach(url: &str) -> ShmResult<Self> {
        let c_url = CString::new(url).map_err(|_| ShmError::BackingStoreError(libc::EINVAL))?;
        // SAFETY: c_url is a valid C string.
        let fd = unsafe { libc::shm_open(c_url.as_ptr(), libc::O_RDWR, 0o600) };
        if fd < 0 {
            let errno = last_errno();
            return Err(if errno == libc::ENOENT {
                ShmError::NotFound
            } else {
                ShmError::BackingStoreError(errno)
            });
        }

        // Map one page to read the sizes out of the header, then remap fully.
        let ps = page_size();
        // SAFETY: the object is at least one header page long.
        let probe = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                ps,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if probe == libc::MAP_FAILED {
            let errno = last_errno();
            unsafe { libc::close(fd) };
            return Err(ShmError::BackingStoreError(errno));
        }
        // SAFETY: probe maps the header page.
        let (magic, id, data_size, shared_size) = unsafe {
            let header = &*(probe as *const BackendHeader);
            (
                header.magic,
                header.id,
                header.data_size as usize,
                header.shared_size as usize,
            )
        };
        // SAFETY: probe was mapped with length ps above.
        unsafe { libc::munmap(probe, ps) };
        if magic != BACKEND_MAGIC {
            unsafe { libc::close(fd) };
            return Err(ShmError::NotFound);
        }

        let base = match reserve_mixed(BACKEND_PRIVATE_SIZE + shared_size) {
            Ok(base) => base,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };
        if let Err(e) = map_shared_fixed(base, shared_size, fd) {
            unsafe {
                libc::munmap(base as *mut libc::c_void, BACKEND_PRIVATE_SIZE + shared_size);
                libc::close(fd);
            }
            return Err(e);
        }

        Ok(Self {
            id: MemoryBackendId(id),
            url: url.to_string(),
            fd,
            mapping: build_mapping(base, data_size),
            owned: false,
            initialized: true,
        })
    }

    /// Backend identity.
    pub fn id(&self) -> MemoryBackendId {
        self.id
    }

    /// The URL this backend was created at.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The data region (offset 0 = start of data).
    pub fn data_region(&self) -> MemRegion {
        MemRegion::new(self.mapping.data, 0, self.mapping.data_size as u64)
    }

    /// The per-process private scratch area.
    pub fn private_region(&self) -> (*mut u8, usize) {
        (self.mapping.map_base, BACKEND_PRIVATE_SIZE)
    }

    /// Whether this process holds the owner flag.
    pub fn is_owner(&self) -> bool {
        self.owned
    }

    /// Take cleanup responsibility. Fails with `NotOwner` when another
    /// process still holds the flag.
    pub fn set_owner(&mut self) -> ShmResult<()> {
        if self.owned {
            return Ok(());
        }
        let header = self.mapping.header();
        match header
            .owner
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.owned = true;
                Ok(())
            }
            Err(_) => Err(ShmError::NotOwner),
        }
    }

    /// Release cleanup responsibility so another process may take it.
    pub fn unset_owner(&mut self) -> ShmResult<()> {
        if !self.owned {
            return Err(ShmError::NotOwner);
        }
        self.mapping.header().owner.store(0, Ordering::Release);
        self.owned = false;
        Ok(())
    }

    /// Unmap in this process only; the object persists for other processes.
    pub fn detach(mut self) {
        self.detach_inner();
    }

    /// Unlink and unmap. Only permitted while holding the owner flag.
    pub fn destroy(mut self) -> ShmResult<()> {
        if !self.owned {
            return Err(ShmError::NotOwner);
        }
        self.destroy_inner();
        Ok(())
    }

    fn detach_inner(&mut self) {
        if !self.initialized {
            return;
        }
        // SAFETY: the mapping and fd were established at create/attach.
        unsafe {
            libc::munmap(
                self.mapping.map_base as *mut libc::c_void,
                self.mapping.total_len,
            );
            libc::close(self.fd);
        }
        self.initialized = false;
    }

    fn destroy_inner(&mut self) {
        if !self.initialized {
            return;
        }
        self.detach_inner();
        if let Ok(c_url) = CString::new(self.url.as_str()) {
            // SAFETY: c_url is a valid C string.
            unsafe { libc::shm_unlink(c_url.as_ptr()) };
        }
    }
}

impl Drop for PosixShmBackend {
    fn drop(&mut self) {
        if self.owned {
            self.destroy_inner();
        } else {
            self.detach_inner();
        }
    }
}

// The mapping is shared state coordinated through atomics and locks inside it.
unsafe impl Send for PosixShmBackend {}
unsafe impl Sync for PosixShmBackend {}

/// Anonymous private backend with the same layout as [`PosixShmBackend`].
///
/// Visible to the creating process only; there is nothing to attach to.
/// Used by unit tests and by single-process embeddings of the runtime.
pub struct MallocBackend {
    id: MemoryBackendId,
    mapping: Mapping,
    initialized: bool,
}

impl MallocBackend {
    /// Create an anonymous backend of `size` data bytes.
    pub fn create(id: MemoryBackendId, size: usize) -> ShmResult<Self> {
        let data_size = round_up(size.max(1), page_size());
        let (_, shared_size) = shared_layout(data_size);
        let base = reserve_mixed(BACKEND_PRIVATE_SIZE + shared_size)?;

        let mapping = build_mapping(base, data_size);
        // SAFETY: header points at freshly mapped zeroed pages.
        unsafe {
            let header = &mut *mapping.header;
            header.magic = BACKEND_MAGIC;
            header.id = id.0;
            header.data_size = data_size as u64;
            header.shared_size = shared_size as u64;
            header.owner = AtomicU32::new(1);
        }

        Ok(Self {
            id,
            mapping,
            initialized: true,
        })
    }

    /// Backend identity.
    pub fn id(&self) -> MemoryBackendId {
        self.id
    }

    /// The data region (offset 0 = start of data).
    pub fn data_region(&self) -> MemRegion {
        MemRegion::new(self.mapping.data, 0, self.mapping.data_size as u64)
    }

    /// The per-process private scratch area.
    pub fn private_region(&self) -> (*mut u8, usize) {
        (self.mapping.map_base, BACKEND_PRIVATE_SIZE)
    }
}

impl Drop for MallocBackend {
    fn drop(&mut self) {
        if self.initialized {
            // SAFETY: the mapping was established at create.
            unsafe {
                libc::munmap(
                    self.mapping.map_base as *mut libc::c_void,
                    self.mapping.total_len,
                );
            }
            self.initialized = false;
        }
    }
}

unsafe impl Send for MallocBackend {}
unsafe impl Sync for MallocBackend {}
