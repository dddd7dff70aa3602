//! Virtual Machine handle: memory slots and vCPUs.
//!
//! # Memory Regions
//!
//! Guest memory is managed through "memory slots". Each slot maps a range of
//! guest physical addresses onto a host buffer ([`GuestRam`]):
//!
//! ```text
//! Guest Physical               Host Virtual
//! ┌──────────────┐ gpa         ┌──────────────┐ host_addr
//! │   slot n     │ ──────────► │  GuestRam    │
//! │              │             │              │
//! └──────────────┘ gpa + len   └──────────────┘ host_addr + len
//! ```
//!
//! Slots are numbered in registration order starting at 0 and never reused.
//! The VM keeps every buffer it was given alive until it is dropped, after
//! the VM descriptor has been closed.
//!
//! A slot may be moved or made read-only later with
//! [`Vm::update_mem_region`]; the recorded state only changes once the
//! kernel has accepted the update.

use super::abi::{UserspaceMemoryRegion, KVM_MEM_READONLY};
use super::{ioctls, GuestRam, Kvm, KvmError, Result, Vcpu};
use log::debug;
use nix::errno::Errno;
use std::collections::BTreeMap;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

/// One registered memory slot.
#[derive(Debug)]
pub struct MemorySlot {
    slot: u32,
    guest_phys_addr: u64,
    read_only: bool,
    memory: GuestRam,
}

impl MemorySlot {
    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn guest_phys_addr(&self) -> u64 {
        self.guest_phys_addr
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// The host buffer backing this slot.
    pub fn memory(&self) -> &GuestRam {
        &self.memory
    }

    /// The region descriptor as submitted to the kernel.
    pub fn region(&self) -> UserspaceMemoryRegion {
        UserspaceMemoryRegion {
            slot: self.slot,
            flags: region_flags(self.read_only),
            guest_phys_addr: self.guest_phys_addr,
            memory_size: self.memory.len() as u64,
            userspace_addr: self.memory.host_addr(),
        }
    }
}

fn region_flags(read_only: bool) -> u32 {
    if read_only {
        KVM_MEM_READONLY
    } else {
        0
    }
}

/// A virtual machine.
///
/// Created by [`Kvm::create_vm`]. Owns its vCPUs and memory slots.
#[derive(Debug)]
pub struct Vm {
    name: String,
    // Drop order: vCPUs (run pages, then fds), the VM fd, guest memory.
    vcpus: BTreeMap<u64, Vcpu>,
    fd: OwnedFd,
    slots: Vec<MemorySlot>,
    kvm: Kvm,
}

impl Vm {
    pub(crate) fn new(kvm: Kvm, fd: OwnedFd, name: String) -> Self {
        Self {
            name,
            vcpus: BTreeMap::new(),
            fd,
            slots: Vec::new(),
            kvm,
        }
    }

    /// Host-side label given at creation.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The device handle this VM was created from.
    pub fn kvm(&self) -> &Kvm {
        &self.kvm
    }

    /// Slot ceiling inherited from the device.
    pub fn max_mem_slots(&self) -> usize {
        self.kvm.max_mem_slots()
    }

    /// Create a vCPU with the given id and map its run page.
    ///
    /// # Errors
    ///
    /// - [`KvmError::DuplicateVcpu`] if `id` is already taken; the kernel is
    ///   not asked
    /// - [`KvmError::CreationFailed`] if the kernel refuses
    /// - [`KvmError::MapFailed`] / [`KvmError::RunPageTooSmall`] if the run
    ///   page cannot be mapped
    pub fn add_vcpu(&mut self, id: u64) -> Result<&mut Vcpu> {
        if self.vcpus.contains_key(&id) {
            return Err(KvmError::DuplicateVcpu(id));
        }

        let raw_id = libc::c_int::try_from(id).map_err(|_| KvmError::CreationFailed {
            what: "vCPU",
            source: Errno::EINVAL,
        })?;
        // SAFETY: VM ioctl taking the vCPU id by value.
        let raw = unsafe { ioctls::kvm_create_vcpu(self.fd.as_raw_fd(), raw_id) }
            .map_err(|source| KvmError::CreationFailed {
                what: "vCPU",
                source,
            })?;
        // SAFETY: KVM_CREATE_VCPU returned a fresh descriptor that nothing else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        let vcpu = Vcpu::new(&self.kvm, fd, id)?;

        debug!("VM {:?}: created vCPU {id}", self.name);
        Ok(self.vcpus.entry(id).or_insert(vcpu))
    }

    pub fn vcpu(&self, id: u64) -> Option<&Vcpu> {
        self.vcpus.get(&id)
    }

    pub fn vcpu_mut(&mut self, id: u64) -> Option<&mut Vcpu> {
        self.vcpus.get_mut(&id)
    }

    /// All vCPUs in ascending id order.
    pub fn vcpus(&self) -> impl Iterator<Item = &Vcpu> {
        self.vcpus.values()
    }

    /// All vCPUs, mutably, for handing out to per-vCPU threads.
    pub fn vcpus_mut(&mut self) -> impl Iterator<Item = &mut Vcpu> {
        self.vcpus.values_mut()
    }

    pub fn vcpu_count(&self) -> usize {
        self.vcpus.len()
    }

    /// Register `memory` at `guest_phys_addr` in the next free slot.
    ///
    /// Returns the slot number. On failure nothing is recorded and the
    /// buffer is dropped.
    ///
    /// # Errors
    ///
    /// - [`KvmError::SlotLimitExceeded`] if every slot is taken; the kernel
    ///   is not asked
    /// - [`KvmError::RegionRejected`] if the kernel refuses the region
    pub fn add_mem_region(
        &mut self,
        guest_phys_addr: u64,
        memory: GuestRam,
        read_only: bool,
    ) -> Result<u32> {
        let max = self.max_mem_slots();
        if self.slots.len() >= max {
            return Err(KvmError::SlotLimitExceeded { max });
        }
        let slot =
            u32::try_from(self.slots.len()).map_err(|_| KvmError::SlotLimitExceeded { max })?;

        let entry = MemorySlot {
            slot,
            guest_phys_addr,
            read_only,
            memory,
        };
        self.set_user_memory_region(&entry.region())?;

        debug!(
            "VM {:?}: slot {slot} maps {:#x}+{:#x} -> host {:#x}{}",
            self.name,
            guest_phys_addr,
            entry.memory.len(),
            entry.memory.host_addr(),
            if read_only { " (read-only)" } else { "" }
        );
        self.slots.push(entry);
        Ok(slot)
    }

    /// Move an existing slot and/or change its read-only flag.
    ///
    /// The backing buffer stays the same. The recorded slot only changes if
    /// the kernel accepts the update.
    pub fn update_mem_region(
        &mut self,
        slot: u32,
        guest_phys_addr: u64,
        read_only: bool,
    ) -> Result<()> {
        let index = slot as usize;
        let current = self.slots.get(index).ok_or(KvmError::NoSuchSlot(slot))?;
        let region = UserspaceMemoryRegion {
            flags: region_flags(read_only),
            guest_phys_addr,
            ..current.region()
        };
        self.set_user_memory_region(&region)?;

        let entry = &mut self.slots[index];
        entry.guest_phys_addr = guest_phys_addr;
        entry.read_only = read_only;
        debug!(
            "VM {:?}: slot {slot} now at {guest_phys_addr:#x}{}",
            self.name,
            if read_only { " (read-only)" } else { "" }
        );
        Ok(())
    }

    /// Registered slots, in slot order.
    pub fn slots(&self) -> &[MemorySlot] {
        &self.slots
    }

    pub fn slot(&self, slot: u32) -> Option<&MemorySlot> {
        self.slots.get(slot as usize)
    }

    fn set_user_memory_region(&self, region: &UserspaceMemoryRegion) -> Result<()> {
        // SAFETY: `region` points at a buffer owned by `self.slots` (or about
        // to be), which outlives the VM descriptor.
        unsafe { ioctls::kvm_set_user_memory_region(self.fd.as_raw_fd(), region) }.map_err(
            |source| KvmError::RegionRejected {
                slot: region.slot,
                source,
            },
        )?;
        Ok(())
    }
}

impl AsFd for Vm {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for Vm {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvm::RunPage;
    use std::fs::File;

    fn null_fd() -> OwnedFd {
        OwnedFd::from(File::open("/dev/null").unwrap())
    }

    /// A VM whose descriptor is /dev/null: every ioctl fails with ENOTTY.
    fn detached_vm(max_mem_slots: usize) -> Vm {
        let kvm = Kvm::from_parts(null_fd(), max_mem_slots);
        Vm::new(kvm, null_fd(), "test".to_string())
    }

    #[test]
    fn test_slot_ceiling_checked_before_kernel() {
        let mut vm = detached_vm(0);
        let ram = GuestRam::new(4096).unwrap();
        assert!(matches!(
            vm.add_mem_region(0, ram, false),
            Err(KvmError::SlotLimitExceeded { max: 0 })
        ));
        assert!(vm.slots().is_empty());
    }

    #[test]
    fn test_rejected_region_leaves_state_unchanged() {
        let mut vm = detached_vm(4);
        let ram = GuestRam::new(4096).unwrap();
        let err = vm.add_mem_region(0x1000, ram, true).unwrap_err();
        assert!(matches!(
            err,
            KvmError::RegionRejected {
                slot: 0,
                source: Errno::ENOTTY
            }
        ));
        assert!(vm.slots().is_empty());
        assert!(vm.slot(0).is_none());
    }

    #[test]
    fn test_update_unknown_slot() {
        let mut vm = detached_vm(4);
        assert!(matches!(
            vm.update_mem_region(3, 0, false),
            Err(KvmError::NoSuchSlot(3))
        ));
    }

    #[test]
    fn test_vcpu_creation_failure_leaves_map_empty() {
        let mut vm = detached_vm(4);
        assert!(matches!(
            vm.add_vcpu(0),
            Err(KvmError::CreationFailed { what: "vCPU", .. })
        ));
        assert_eq!(vm.vcpu_count(), 0);
        assert!(vm.vcpu(0).is_none());
    }

    #[test]
    fn test_duplicate_vcpu_checked_before_kernel() {
        let mut vm = detached_vm(4);
        let page = RunPage::anonymous(3 * 4096).unwrap();
        vm.vcpus.insert(0, Vcpu::from_parts(0, page, null_fd()));

        // The VM fd is /dev/null, so reaching the kernel would give
        // CreationFailed instead.
        assert!(matches!(vm.add_vcpu(0), Err(KvmError::DuplicateVcpu(0))));
        assert_eq!(vm.vcpu_count(), 1);
        assert_eq!(vm.vcpu(0).map(Vcpu::id), Some(0));
    }

    #[test]
    fn test_region_descriptor() {
        let memory = GuestRam::new(2 * 4096).unwrap();
        let host_addr = memory.host_addr();
        let slot = MemorySlot {
            slot: 2,
            guest_phys_addr: 0x10_0000,
            read_only: true,
            memory,
        };
        let region = slot.region();
        assert_eq!(region.slot, 2);
        assert_eq!(region.flags, KVM_MEM_READONLY);
        assert_eq!(region.guest_phys_addr, 0x10_0000);
        assert_eq!(region.memory_size, 8192);
        assert_eq!(region.userspace_addr, host_addr);
    }

    #[test]
    fn test_name_and_ceiling() {
        let vm = detached_vm(509);
        assert_eq!(vm.name(), "test");
        assert_eq!(vm.max_mem_slots(), 509);
    }
}
