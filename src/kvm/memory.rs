//! Host buffers that back guest memory slots.
//!
//! `GuestRam` wraps a single-region `vm_memory::GuestMemoryMmap` and uses it
//! as a plain page-aligned host buffer: offsets passed to `write`/`read` are
//! relative to the start of the buffer, not guest physical addresses. Where
//! the buffer appears in the guest is decided when it is handed to
//! [`Vm::add_mem_region`](super::Vm::add_mem_region).
//!
//! ```text
//! Host Virtual (GuestRam)          Guest Physical (slot)
//! ┌──────────────┐ offset 0        ┌──────────────┐ guest_phys_addr
//! │ anonymous    │ ──────────────► │              │
//! │ mmap         │                 │              │
//! └──────────────┘ offset len      └──────────────┘ guest_phys_addr + len
//! ```
//!
//! The mapping is:
//! - `MAP_PRIVATE | MAP_ANONYMOUS | MAP_NORESERVE`
//! - zero-filled on creation
//! - page aligned, as `KVM_SET_USER_MEMORY_REGION` requires

use super::{KvmError, Result};
use vm_memory::{Bytes, GuestAddress, GuestMemory as GuestMemoryTrait, GuestMemoryMmap};

/// A host buffer that can be registered as a guest memory slot.
pub struct GuestRam {
    /// The underlying vm-memory mapping, addressed from 0.
    inner: GuestMemoryMmap,
    /// Host virtual address of the first byte.
    host_addr: u64,
    /// Size of the buffer in bytes.
    len: usize,
}

impl GuestRam {
    /// Allocate a zero-filled buffer of `len` bytes.
    ///
    /// `len` should be a multiple of the host page size; KVM rejects slots
    /// that are not.
    pub fn new(len: usize) -> Result<Self> {
        let inner = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), len)]).map_err(|e| {
            KvmError::GuestMemory(std::io::Error::other(format!(
                "failed to allocate {len} bytes of guest memory: {e}"
            )))
        })?;

        let host_addr = inner
            .iter()
            .next()
            .map(|region| region.as_ptr() as u64)
            .ok_or_else(|| {
                KvmError::GuestMemory(std::io::Error::other("guest memory has no regions"))
            })?;

        Ok(Self {
            inner,
            host_addr,
            len,
        })
    }

    /// Allocate a buffer of `len` bytes and copy `contents` to its start.
    pub fn with_contents(len: usize, contents: &[u8]) -> Result<Self> {
        let ram = Self::new(len)?;
        ram.write(0, contents)?;
        Ok(ram)
    }

    /// Size of the buffer in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Host virtual address of the buffer, as handed to KVM.
    ///
    /// Stable for the lifetime of `self`; the mapping never moves.
    pub fn host_addr(&self) -> u64 {
        self.host_addr
    }

    /// Write bytes at `offset` from the start of the buffer.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.inner
            .write_slice(data, GuestAddress(offset))
            .map_err(|e| {
                KvmError::GuestMemory(std::io::Error::other(format!(
                    "failed to write {} bytes at offset {:#x}: {}",
                    data.len(),
                    offset,
                    e
                )))
            })
    }

    /// Read bytes from `offset` into `data`.
    pub fn read(&self, offset: u64, data: &mut [u8]) -> Result<()> {
        self.inner
            .read_slice(data, GuestAddress(offset))
            .map_err(|e| {
                KvmError::GuestMemory(std::io::Error::other(format!(
                    "failed to read {} bytes at offset {:#x}: {}",
                    data.len(),
                    offset,
                    e
                )))
            })
    }
}

impl std::fmt::Debug for GuestRam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestRam")
            .field("host_addr", &format_args!("{:#x}", self.host_addr))
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_vec(ram: &GuestRam, offset: u64, len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        ram.read(offset, &mut data).unwrap();
        data
    }

    #[test]
    fn test_allocate_zeroed() {
        let ram = GuestRam::new(4096).unwrap();
        assert_eq!(ram.len(), 4096);
        assert_eq!(read_vec(&ram, 0, 16), vec![0u8; 16]);
    }

    #[test]
    fn test_host_addr_page_aligned() {
        let ram = GuestRam::new(2 * 4096).unwrap();
        assert_ne!(ram.host_addr(), 0);
        assert_eq!(ram.host_addr() % 4096, 0);
    }

    #[test]
    fn test_write_read() {
        let ram = GuestRam::new(4096).unwrap();
        ram.write(0x100, &[0xf4, 0x90]).unwrap();
        assert_eq!(read_vec(&ram, 0x100, 2), vec![0xf4, 0x90]);
    }

    #[test]
    fn test_with_contents() {
        let ram = GuestRam::with_contents(4096, &[1, 2, 3]).unwrap();
        assert_eq!(read_vec(&ram, 0, 4), vec![1, 2, 3, 0]);
    }

    #[test]
    fn test_write_out_of_bounds() {
        let ram = GuestRam::new(4096).unwrap();
        assert!(matches!(
            ram.write(4095, &[1, 2]),
            Err(KvmError::GuestMemory(_))
        ));
    }

    #[test]
    fn test_contents_larger_than_buffer() {
        assert!(GuestRam::with_contents(16, &[0u8; 32]).is_err());
    }
}
