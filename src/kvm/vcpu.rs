//! Virtual CPU handle and its shared run page.
//!
//! Each vCPU has its own descriptor and a `struct kvm_run` page mapped from
//! it. The kernel fills the page on every exit; [`Vcpu::run`] decodes it into
//! a [`VcpuExit`] that borrows the vCPU until the caller is done with it.
//!
//! # Register State
//!
//! - General-purpose registers (`Regs`): RAX..R15, RIP, RFLAGS
//! - Special registers (`Sregs`): segments, descriptor tables, control registers
//! - Debug registers (`DebugRegs`): DR0-DR3, DR6, DR7
//!
//! Setters write exactly what they are given. Read-modify-write is the
//! caller's business.

use super::abi::{
    DebugRegs, GuestDebug, KvmRun, Regs, Sregs, KVM_GUESTDBG_ENABLE, KVM_GUESTDBG_SINGLESTEP,
};
use super::exit::{self, ExitReason, VcpuExit};
use super::{ioctls, Kvm, KvmError, Result};
use log::{debug, error};
use nix::errno::Errno;
use nix::sys::mman::{mmap, mmap_anonymous, munmap, MapFlags, ProtFlags};
use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::ptr::NonNull;
use std::time::Instant;

/// A mapped `struct kvm_run` page.
///
/// The mapping is `len` bytes long (the kernel-reported mmap size); the
/// structure occupies the start and the I/O data window usually lies past it.
/// Unmapped on drop.
pub struct RunPage {
    ptr: NonNull<c_void>,
    len: usize,
}

// SAFETY: the page is only reachable through `&self`/`&mut self`, and the
// kernel writes to it only while KVM_RUN holds the owning vCPU mutably.
unsafe impl Send for RunPage {}

impl RunPage {
    /// Map the run page of a vCPU descriptor.
    pub(crate) fn map(fd: BorrowedFd<'_>, len: usize) -> Result<Self> {
        let size = Self::checked_len(len)?;

        // SAFETY: a fresh shared mapping of a vCPU descriptor at offset 0;
        // nothing else aliases it.
        let ptr = unsafe {
            mmap(
                None,
                size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
        }
        .map_err(KvmError::MapFailed)?;

        debug!("Mapped {len}-byte run page at {ptr:p}");
        Ok(Self { ptr, len })
    }

    /// A zeroed private page with the same layout, not backed by a vCPU.
    ///
    /// Useful to stage exits by hand and run them through [`exit::decode`].
    pub fn anonymous(len: usize) -> Result<Self> {
        let size = Self::checked_len(len)?;

        // SAFETY: a fresh private anonymous mapping.
        let ptr = unsafe {
            mmap_anonymous(
                None,
                size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .map_err(KvmError::MapFailed)?;

        Ok(Self { ptr, len })
    }

    fn checked_len(len: usize) -> Result<NonZeroUsize> {
        let required = size_of::<KvmRun>();
        NonZeroUsize::new(len)
            .filter(|size| size.get() >= required)
            .ok_or(KvmError::RunPageTooSmall {
                size: len,
                required,
            })
    }

    /// Length of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr().cast()
    }

    pub fn run(&self) -> &KvmRun {
        // SAFETY: the mapping is page aligned and at least size_of::<KvmRun>()
        // bytes long (checked at construction); every bit pattern is valid.
        unsafe { self.ptr.cast::<KvmRun>().as_ref() }
    }

    pub fn run_mut(&mut self) -> &mut KvmRun {
        // SAFETY: as in `run`, and `&mut self` guarantees exclusivity.
        unsafe { self.ptr.cast::<KvmRun>().as_mut() }
    }

    /// Bytes `offset..offset + len` of the page, or `None` when the range
    /// leaves the mapping.
    pub fn bytes(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        // SAFETY: the range was checked against the mapping length.
        Some(unsafe { std::slice::from_raw_parts(self.as_ptr().add(offset), len) })
    }

    pub fn bytes_mut(&mut self, offset: usize, len: usize) -> Option<&mut [u8]> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        // SAFETY: the range was checked against the mapping length and
        // `&mut self` guarantees exclusivity.
        Some(unsafe {
            std::slice::from_raw_parts_mut(self.ptr.as_ptr().cast::<u8>().add(offset), len)
        })
    }
}

impl Drop for RunPage {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` describe a mapping created in `map`/`anonymous`
        // and not unmapped since.
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            error!("Failed to unmap run page at {:p}: {e}", self.ptr);
        }
    }
}

impl std::fmt::Debug for RunPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunPage")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// A virtual CPU.
///
/// Created through [`Vm::add_vcpu`](super::Vm::add_vcpu) and owned by its VM.
#[derive(Debug)]
pub struct Vcpu {
    id: u64,
    // Field order matters: the run page is unmapped before the fd closes.
    run: RunPage,
    fd: OwnedFd,
}

impl Vcpu {
    pub(crate) fn new(kvm: &Kvm, fd: OwnedFd, id: u64) -> Result<Self> {
        let size = kvm.vcpu_mmap_size().map_err(|e| match e {
            KvmError::Ioctl { source, .. } => KvmError::MapFailed(source),
            other => other,
        })?;
        let run = RunPage::map(fd.as_fd(), size)?;
        Ok(Self { id, run, fd })
    }

    /// Build a vCPU from an already-open descriptor and page without asking
    /// the kernel for anything.
    #[cfg(test)]
    pub(crate) fn from_parts(id: u64, run: RunPage, fd: OwnedFd) -> Self {
        Self { id, run, fd }
    }

    /// The id this vCPU was created with.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The mapped run page.
    pub fn run_page(&self) -> &RunPage {
        &self.run
    }

    /// Enter the guest until the next VM exit.
    ///
    /// Blocks the calling thread. A signal arriving while the guest runs
    /// yields [`ExitReason::Interrupted`]; nothing is retried.
    pub fn run(&mut self) -> Result<VcpuExit<'_>> {
        let start = Instant::now();
        // SAFETY: vCPU ioctl whose argument must be 0; the run page stays
        // mapped for as long as `self` lives.
        let result = unsafe { ioctls::kvm_run(self.fd.as_raw_fd(), 0) };
        let elapsed = start.elapsed();

        match result {
            Ok(_) => exit::decode(&mut self.run, elapsed),
            Err(Errno::EINTR) => {
                debug!("vCPU {} interrupted after {:?}", self.id, elapsed);
                Ok(VcpuExit {
                    reason: ExitReason::Interrupted,
                    elapsed,
                })
            }
            Err(source) => Err(KvmError::Ioctl {
                op: "KVM_RUN",
                source,
            }),
        }
    }

    /// `KVM_GET_REGS`.
    pub fn get_regs(&self) -> Result<Regs> {
        let mut regs = Regs::default();
        // SAFETY: `regs` is a live, correctly sized buffer for the kernel to fill.
        unsafe { ioctls::kvm_get_regs(self.fd.as_raw_fd(), &mut regs) }
            .map_err(KvmError::ioctl("KVM_GET_REGS"))?;
        Ok(regs)
    }

    /// `KVM_SET_REGS`.
    pub fn set_regs(&self, regs: &Regs) -> Result<()> {
        // SAFETY: `regs` outlives the call and matches the encoded size.
        unsafe { ioctls::kvm_set_regs(self.fd.as_raw_fd(), regs) }
            .map_err(KvmError::ioctl("KVM_SET_REGS"))?;
        Ok(())
    }

    /// `KVM_GET_SREGS`.
    pub fn get_sregs(&self) -> Result<Sregs> {
        let mut sregs = Sregs::default();
        // SAFETY: as in `get_regs`.
        unsafe { ioctls::kvm_get_sregs(self.fd.as_raw_fd(), &mut sregs) }
            .map_err(KvmError::ioctl("KVM_GET_SREGS"))?;
        Ok(sregs)
    }

    /// `KVM_SET_SREGS`.
    pub fn set_sregs(&self, sregs: &Sregs) -> Result<()> {
        // SAFETY: as in `set_regs`.
        unsafe { ioctls::kvm_set_sregs(self.fd.as_raw_fd(), sregs) }
            .map_err(KvmError::ioctl("KVM_SET_SREGS"))?;
        Ok(())
    }

    /// `KVM_GET_DEBUGREGS`.
    pub fn get_debug_regs(&self) -> Result<DebugRegs> {
        let mut dregs = DebugRegs::default();
        // SAFETY: as in `get_regs`.
        unsafe { ioctls::kvm_get_debugregs(self.fd.as_raw_fd(), &mut dregs) }
            .map_err(KvmError::ioctl("KVM_GET_DEBUGREGS"))?;
        Ok(dregs)
    }

    /// `KVM_SET_DEBUGREGS`.
    pub fn set_debug_regs(&self, dregs: &DebugRegs) -> Result<()> {
        // SAFETY: as in `set_regs`.
        unsafe { ioctls::kvm_set_debugregs(self.fd.as_raw_fd(), dregs) }
            .map_err(KvmError::ioctl("KVM_SET_DEBUGREGS"))?;
        Ok(())
    }

    /// `KVM_SET_GUEST_DEBUG` with an arbitrary control word and debug
    /// register set.
    pub fn set_guest_debug(&self, debug: &GuestDebug) -> Result<()> {
        // SAFETY: as in `set_regs`.
        unsafe { ioctls::kvm_set_guest_debug(self.fd.as_raw_fd(), debug) }
            .map_err(KvmError::ioctl("KVM_SET_GUEST_DEBUG"))?;
        Ok(())
    }

    /// Trap after every guest instruction.
    ///
    /// Each subsequent `run()` returns [`ExitReason::Debug`] after a single
    /// instruction. On some kernels enabling it has been seen to perturb
    /// other register state; compare snapshots if that matters.
    pub fn enable_single_step(&self) -> Result<()> {
        self.set_guest_debug(&GuestDebug {
            control: KVM_GUESTDBG_ENABLE | KVM_GUESTDBG_SINGLESTEP,
            ..GuestDebug::default()
        })?;
        debug!("Single-step enabled on vCPU {}", self.id);
        Ok(())
    }

    /// Turn off every guest debug facility.
    pub fn disable_guest_debug(&self) -> Result<()> {
        self.set_guest_debug(&GuestDebug::default())?;
        debug!("Guest debug disabled on vCPU {}", self.id);
        Ok(())
    }

    /// Ask the kernel to exit with `IrqWindowOpen` as soon as the guest can
    /// take an interrupt.
    pub fn set_request_interrupt_window(&mut self, request: bool) {
        self.run.run_mut().request_interrupt_window = u8::from(request);
    }

    pub fn request_interrupt_window(&self) -> bool {
        self.run.run().request_interrupt_window != 0
    }

    /// Whether the guest can accept an interrupt right now (valid after an exit).
    pub fn ready_for_interrupt_injection(&self) -> bool {
        self.run.run().ready_for_interrupt_injection != 0
    }

    /// The guest's RFLAGS.IF at the last exit.
    pub fn if_flag(&self) -> bool {
        self.run.run().if_flag != 0
    }

    pub fn cr8(&self) -> u64 {
        self.run.run().cr8
    }

    pub fn apic_base(&self) -> u64 {
        self.run.run().apic_base
    }

    /// Supply the value of a pending MMIO read before the next `run()`.
    ///
    /// # Errors
    ///
    /// - [`KvmError::NoPendingMmioRead`] if the last exit was not an MMIO read
    /// - [`KvmError::SizeMismatch`] if `data` is not exactly the access width
    pub fn complete_mmio_read(&mut self, data: &[u8]) -> Result<()> {
        let run = self.run.run_mut();
        if run.exit_reason != super::abi::exit_code::KVM_EXIT_MMIO {
            return Err(KvmError::NoPendingMmioRead);
        }
        // SAFETY: exit_reason says the mmio member is live; it is plain data.
        let mmio = unsafe { &mut run.exit.mmio };
        if mmio.is_write != 0 {
            return Err(KvmError::NoPendingMmioRead);
        }
        let expected = (mmio.len as usize).min(mmio.data.len());
        if data.len() != expected {
            return Err(KvmError::SizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        mmio.data[..expected].copy_from_slice(data);
        Ok(())
    }
}

impl AsFd for Vcpu {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for Vcpu {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
