//! Guest memory region
//!
//! One anonymous host mapping that backs the whole guest physical address
//! space `[0, len)`. The guest and every vCPU runner may touch it
//! concurrently, so host-side accesses go through `vm-memory`'s volatile
//! copies rather than Rust references into guest-visible bytes.

use vm_memory::{Address, Bytes, GuestAddress, GuestMemory, GuestMemoryMmap};

use tracing::debug;

use crate::{Error, Result};

/// Guest-physical base address of the region. Always 0.
pub const GUEST_BASE: u64 = 0;

/// Bytes fetched per step while scanning for a string terminator
const STRING_CHUNK: usize = 64;

/// Host page size
pub fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

/// Host-owned buffer exposed to the guest as physical memory
pub struct GuestMemoryRegion {
    memory: GuestMemoryMmap,
    len: usize,
}

impl GuestMemoryRegion {
    /// Allocate `len` bytes of zeroed, page-aligned host memory
    pub fn allocate(len: usize) -> Result<Self> {
        let page = page_size();
        if len == 0 || len % page != 0 {
            return Err(Error::Allocation(format!(
                "guest memory size {:#x} is not a non-zero multiple of the {:#x} byte page size",
                len, page
            )));
        }

        let memory = GuestMemoryMmap::from_ranges(&[(GuestAddress(GUEST_BASE), len)])
            .map_err(|e| Error::Allocation(format!("Failed to create guest memory: {}", e)))?;

        debug!("Allocated {} KB guest memory", len / 1024);
        Ok(Self { memory, len })
    }

    /// Size in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Host address of guest-physical address 0, for mapping into a backend
    pub fn host_address(&self) -> Result<*mut u8> {
        self.memory
            .get_host_address(GuestAddress(GUEST_BASE))
            .map_err(|e| Error::Allocation(format!("get_host_address: {}", e)))
    }

    /// Whether `[gpa, gpa + size)` lies inside the region
    pub fn contains(&self, gpa: u64, size: usize) -> bool {
        match gpa.checked_add(size as u64) {
            Some(_) if size == 0 => gpa <= GUEST_BASE + self.len as u64,
            Some(end) => self.memory.address_in_range(GuestAddress(end - 1)),
            None => false,
        }
    }

    /// Copy `data` into guest memory at `gpa`
    pub fn write(&self, gpa: u64, data: &[u8]) -> Result<()> {
        let addr = GuestAddress(gpa);
        if !self.contains(gpa, data.len()) {
            return Err(Error::Load(format!(
                "range {:#x}-{:#x} outside guest memory (size {:#x})",
                addr.raw_value(),
                gpa.saturating_add(data.len() as u64),
                self.len
            )));
        }
        if data.is_empty() {
            return Ok(());
        }
        self.memory.write_slice(data, addr).map_err(|e| {
            Error::Load(format!(
                "Failed to write guest memory at {:#x}: {}",
                addr.raw_value(),
                e
            ))
        })
    }

    /// Copy `size` bytes out of guest memory at `gpa`
    pub fn read(&self, gpa: u64, size: usize) -> Option<Vec<u8>> {
        if !self.contains(gpa, size) {
            return None;
        }
        let mut buf = vec![0u8; size];
        if size > 0 {
            self.memory.read_slice(&mut buf, GuestAddress(gpa)).ok()?;
        }
        Some(buf)
    }

    /// Copy the NUL-terminated string starting at `gpa`.
    ///
    /// The terminator is not included. A string with no terminator before
    /// the end of the region is cut off there. Returns `None` when `gpa` is
    /// outside the region.
    pub fn read_c_string(&self, gpa: u64) -> Option<Vec<u8>> {
        if !self.contains(gpa, 1) {
            return None;
        }
        let end = GUEST_BASE + self.len as u64;
        let mut out = Vec::new();
        let mut chunk = [0u8; STRING_CHUNK];
        let mut addr = GuestAddress(gpa);
        while addr.raw_value() < end {
            let n = (end - addr.raw_value()).min(STRING_CHUNK as u64) as usize;
            self.memory.read_slice(&mut chunk[..n], addr).ok()?;
            if let Some(nul) = chunk[..n].iter().position(|&b| b == 0) {
                out.extend_from_slice(&chunk[..nul]);
                return Some(out);
            }
            out.extend_from_slice(&chunk[..n]);
            addr = addr.unchecked_add(n as u64);
        }
        Some(out)
    }
}

impl std::fmt::Debug for GuestMemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestMemoryRegion")
            .field("base", &GUEST_BASE)
            .field("len", &self.len)
            .finish()
    }
}
