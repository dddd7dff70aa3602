//! kvmbind - a control-plane binding to the Linux KVM hypervisor device.
//!
//! Opens `/dev/kvm`, creates VMs and vCPUs, maps guest memory, runs guest
//! code and decodes why it stopped. Device emulation, boot protocols and
//! interrupt controllers are left to the caller.
//!
//! Only x86-64 Linux hosts are supported; elsewhere the crate is empty.

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod kvm;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use kvm::{
    ExitReason, GuestRam, IoDirection, Kvm, KvmError, MemorySlot, Vcpu, VcpuExit, Vm,
};
