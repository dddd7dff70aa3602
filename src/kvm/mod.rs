//! KVM (Kernel-based Virtual Machine) binding.
//!
//! This module speaks the KVM ioctl protocol directly: it defines the kernel
//! structures bit for bit ([`abi`]), issues the requests itself, and decodes
//! the shared run page into typed exits.
//!
//! # KVM Architecture
//!
//! KVM is driven through ioctls on three kinds of file descriptor:
//!
//! - `/dev/kvm` - system-level operations (API version, capabilities, create VMs)
//! - VM file descriptor - VM-level operations (create vCPUs, set memory)
//! - vCPU file descriptor - vCPU-level operations (run, get/set registers)
//!
//! ```text
//! User Space                          Kernel Space (KVM)
//! ┌──────────────┐                   ┌──────────────────┐
//! │  Kvm ────────┼──────────────────►│  /dev/kvm        │
//! │   │          │    ioctl()        │                  │
//! │   ▼          │                   │  ┌────────────┐  │
//! │  Vm ─────────┼──────────────────►│  │ VM State   │  │
//! │   │  slots   │                   │  └────────────┘  │
//! │   ▼          │                   │  ┌────────────┐  │
//! │  Vcpu ───────┼──────────────────►│  │ vCPU State │  │
//! │   run page ◄─┼───── mmap ───────►│  └────────────┘  │
//! └──────────────┘                   └──────────────────┘
//! ```
//!
//! # Ownership
//!
//! - [`Kvm`] is a cheap, cloneable handle; the device descriptor closes when
//!   the last clone (including the ones held by VMs) is dropped.
//! - [`Vm`] owns its memory slots (and the host buffers backing them) and its
//!   vCPUs. Dropping a `Vm` unmaps every run page, closes every vCPU, closes
//!   the VM, and only then releases guest memory.
//! - [`Vcpu`] owns its descriptor and its run page; the page is unmapped
//!   before the descriptor closes.
//! - A [`VcpuExit`] borrows the vCPU mutably, so it cannot be kept across
//!   the next `run()`.
//!
//! # Execution Model
//!
//! 1. Caller invokes `vcpu.run()` - control transfers to the guest
//! 2. Guest executes until a VM exit
//! 3. KVM returns; the exit is decoded from the run page
//! 4. Caller handles the exit (I/O, MMIO, ...)
//! 5. Caller invokes `vcpu.run()` again
//!
//! `run()` blocks the calling thread. To run several vCPUs at once, drive
//! each one from its own thread.
//!
//! # Example Usage
//!
//! ```ignore
//! let kvm = Kvm::new()?;
//! let mut vm = kvm.create_vm("MyVM")?;
//!
//! let ram = GuestRam::with_contents(1 << 20, &[0xf4])?; // hlt
//! vm.add_mem_region(0, ram, false)?;
//!
//! let vcpu = vm.add_vcpu(0)?;
//! loop {
//!     let exit = vcpu.run()?;
//!     match exit.reason {
//!         ExitReason::Hlt => break,
//!         ExitReason::Interrupted => continue,
//!         other => println!("{other}"),
//!     }
//! }
//! ```

pub mod abi;
mod caps;
mod exit;
mod ioctls;
mod memory;
mod vcpu;
mod vm;

pub use caps::{
    capability_by_name, Capability, Extension, Extensions, CAPABILITIES, KVM_CAP_DEBUGREGS,
    KVM_CAP_MAX_VCPUS, KVM_CAP_NR_MEMSLOTS, KVM_CAP_NR_VCPUS, KVM_CAP_READONLY_MEM,
    KVM_CAP_SET_GUEST_DEBUG,
};
pub use exit::{
    decode, exit_reason_name, DebugExit, ExitReason, Hypercall, InternalError,
    InternalErrorCause, IoDirection, IoExit, MmioExit, VcpuExit,
};
pub use memory::GuestRam;
pub use vcpu::{RunPage, Vcpu};
pub use vm::{MemorySlot, Vm};

use abi::KVM_API_VERSION;
use log::{debug, info};
use nix::errno::Errno;
use std::fs::OpenOptions;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Device node opened by [`Kvm::new`].
pub const DEFAULT_DEVICE_PATH: &str = "/dev/kvm";

/// Result type for KVM operations.
pub type Result<T> = std::result::Result<T, KvmError>;

/// Errors that can occur during KVM operations.
#[derive(Error, Debug)]
pub enum KvmError {
    /// Failed to open the KVM device node.
    ///
    /// This usually means:
    /// - KVM is not available (module not loaded)
    /// - Insufficient permissions (user not in kvm group)
    /// - Running in a VM without nested virtualization enabled
    #[error("Failed to open {}: {source}", .path.display())]
    DeviceUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The kernel speaks a different KVM API version.
    #[error("KVM API version unsupported: {found} (expected {expected})")]
    UnsupportedVersion { found: i32, expected: i32 },

    /// The kernel refused to create a VM or vCPU.
    #[error("Failed to create {what}: {source}")]
    CreationFailed {
        what: &'static str,
        #[source]
        source: Errno,
    },

    /// A vCPU with this id is already registered on the VM.
    #[error("vCPU with id {0} already exists")]
    DuplicateVcpu(u64),

    /// Every memory slot the kernel offers is already assigned.
    #[error("Maximum number of memory slots ({max}) already assigned")]
    SlotLimitExceeded { max: usize },

    /// No memory slot with this number was registered.
    #[error("No memory slot {0}")]
    NoSuchSlot(u32),

    /// The kernel rejected a memory region (overlap, alignment, resources).
    #[error("Failed to set user memory region for slot {slot}: {source}")]
    RegionRejected {
        slot: u32,
        #[source]
        source: Errno,
    },

    /// Failed to map the vCPU run page.
    #[error("Failed to map vCPU run page: {0}")]
    MapFailed(#[source] Errno),

    /// The kernel reported a run page smaller than `struct kvm_run`.
    #[error("vCPU run page is {size} bytes, at least {required} required")]
    RunPageTooSmall { size: usize, required: usize },

    /// Any other ioctl failure, tagged with the request that failed.
    #[error("{op} failed: {source}")]
    Ioctl {
        op: &'static str,
        #[source]
        source: Errno,
    },

    /// Allocating or accessing a host buffer failed.
    #[error("Guest memory error: {0}")]
    GuestMemory(#[source] std::io::Error),

    /// The run page carries an exit discriminant this binding cannot decode.
    ///
    /// This points at a mismatch between the binding and the kernel ABI.
    #[error("Unknown exit reason {code} ({})", exit_name_or_unnamed(.code))]
    UnknownExitReason { code: u32 },

    /// The I/O exit is a guest read (IN); there is no guest data to fetch.
    #[error("I/O exit on port {port:#x} is not a write")]
    NotWritable { port: u16 },

    /// The I/O exit is a guest write (OUT); there is nothing to answer.
    #[error("I/O exit on port {port:#x} is not a read")]
    NotReadable { port: u16 },

    /// Response data does not match the size of the guest access.
    #[error("Data size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    /// The I/O data window lies outside the mapped run page.
    #[error("I/O data window {offset:#x}+{len} lies outside the {page_len}-byte run page")]
    IoWindowOutOfBounds {
        offset: u64,
        len: usize,
        page_len: usize,
    },

    /// The last exit was not an MMIO read, so there is nothing to complete.
    #[error("No pending MMIO read to complete")]
    NoPendingMmioRead,
}

fn exit_name_or_unnamed(code: &u32) -> &'static str {
    exit_reason_name(*code).unwrap_or("unnamed")
}

impl KvmError {
    /// Error mapper for `map_err` on a failed ioctl.
    pub(crate) fn ioctl(op: &'static str) -> impl FnOnce(Errno) -> Self {
        move |source| Self::Ioctl { op, source }
    }
}

#[derive(Debug)]
struct Device {
    fd: OwnedFd,
    path: PathBuf,
    max_mem_slots: usize,
}

/// Handle to the KVM device.
///
/// Cloning is cheap and shares the same descriptor.
#[derive(Debug, Clone)]
pub struct Kvm {
    device: Arc<Device>,
}

impl Kvm {
    /// Open [`DEFAULT_DEVICE_PATH`].
    pub fn new() -> Result<Self> {
        Self::open(DEFAULT_DEVICE_PATH)
    }

    /// Open a KVM device node.
    ///
    /// The API version is checked and the memory slot ceiling queried before
    /// the handle is returned; a version mismatch is fatal.
    ///
    /// # Errors
    ///
    /// - [`KvmError::DeviceUnavailable`] if the node cannot be opened
    /// - [`KvmError::UnsupportedVersion`] if the kernel is not at API 12
    /// - [`KvmError::Ioctl`] if a query fails
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| KvmError::DeviceUnavailable {
                path: path.to_path_buf(),
                source,
            })?;
        let fd = OwnedFd::from(file);

        check_api_version(fd.as_fd())?;
        let max_mem_slots = query_max_mem_slots(fd.as_fd())?;

        info!(
            "Opened {} (API version {}, {} memory slots per VM)",
            path.display(),
            KVM_API_VERSION,
            max_mem_slots
        );

        Ok(Self {
            device: Arc::new(Device {
                fd,
                path: path.to_path_buf(),
                max_mem_slots,
            }),
        })
    }

    /// Build a handle around an already-open descriptor without querying it.
    #[cfg(test)]
    pub(crate) fn from_parts(fd: OwnedFd, max_mem_slots: usize) -> Self {
        Self {
            device: Arc::new(Device {
                fd,
                path: PathBuf::new(),
                max_mem_slots,
            }),
        }
    }

    /// Path of the device node this handle was opened from.
    pub fn path(&self) -> &Path {
        &self.device.path
    }

    /// `KVM_GET_API_VERSION`.
    pub fn api_version(&self) -> Result<i32> {
        api_version(self.as_fd())
    }

    /// Memory slots available per VM, as reported by `KVM_CAP_NR_MEMSLOTS`
    /// when the handle was opened.
    pub fn max_mem_slots(&self) -> usize {
        self.device.max_mem_slots
    }

    /// `KVM_CHECK_EXTENSION` for a single capability number.
    pub fn check_extension(&self, cap: u32) -> Result<i32> {
        check_extension(self.as_fd(), cap)
    }

    /// Enumerate every known capability, sorted by name.
    ///
    /// The iterator is lazy: each item issues one `KVM_CHECK_EXTENSION`.
    pub fn extensions(&self) -> Extensions<'_> {
        Extensions::new(self)
    }

    /// `KVM_GET_VCPU_MMAP_SIZE`: size of the run page each vCPU maps.
    ///
    /// Queried on every call.
    pub fn vcpu_mmap_size(&self) -> Result<usize> {
        // SAFETY: system ioctl on the /dev/kvm descriptor, no pointer argument.
        let size = unsafe { ioctls::kvm_get_vcpu_mmap_size(self.as_raw_fd(), 0) }
            .map_err(KvmError::ioctl("KVM_GET_VCPU_MMAP_SIZE"))?;
        Ok(size as usize)
    }

    /// Create a new VM.
    ///
    /// `name` is a host-side label only; it is never sent to the kernel.
    pub fn create_vm(&self, name: impl Into<String>) -> Result<Vm> {
        let name = name.into();

        // SAFETY: system ioctl; machine type 0 is the default VM type.
        let raw = unsafe { ioctls::kvm_create_vm(self.as_raw_fd(), 0) }
            .map_err(|source| KvmError::CreationFailed { what: "VM", source })?;
        // SAFETY: KVM_CREATE_VM returned a fresh descriptor that nothing else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        info!("Created VM {name:?}");
        Ok(Vm::new(self.clone(), fd, name))
    }
}

impl AsFd for Kvm {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.device.fd.as_fd()
    }
}

impl AsRawFd for Kvm {
    fn as_raw_fd(&self) -> RawFd {
        self.device.fd.as_raw_fd()
    }
}

fn api_version(fd: BorrowedFd<'_>) -> Result<i32> {
    // SAFETY: system ioctl without a pointer argument.
    unsafe { ioctls::kvm_get_api_version(fd.as_raw_fd(), 0) }
        .map_err(KvmError::ioctl("KVM_GET_API_VERSION"))
}

fn check_api_version(fd: BorrowedFd<'_>) -> Result<()> {
    let found = api_version(fd)?;
    if found != KVM_API_VERSION {
        return Err(KvmError::UnsupportedVersion {
            found,
            expected: KVM_API_VERSION,
        });
    }
    Ok(())
}

fn check_extension(fd: BorrowedFd<'_>, cap: u32) -> Result<i32> {
    let cap = libc::c_int::try_from(cap).map_err(|_| KvmError::Ioctl {
        op: "KVM_CHECK_EXTENSION",
        source: Errno::EINVAL,
    })?;
    // SAFETY: system ioctl taking the capability number by value.
    unsafe { ioctls::kvm_check_extension(fd.as_raw_fd(), cap) }
        .map_err(KvmError::ioctl("KVM_CHECK_EXTENSION"))
}

fn query_max_mem_slots(fd: BorrowedFd<'_>) -> Result<usize> {
    let slots = check_extension(fd, KVM_CAP_NR_MEMSLOTS)?;
    debug!("KVM_CAP_NR_MEMSLOTS = {slots}");
    Ok(usize::try_from(slots).unwrap_or(0))
}
