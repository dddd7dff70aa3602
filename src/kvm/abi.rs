//! Bit-exact layouts of the KVM structures exchanged with the kernel.
//!
//! Every structure here mirrors a definition from `<linux/kvm.h>` (and
//! `<asm/kvm.h>` for x86-64). The layouts are not left to chance: a block of
//! compile-time assertions at the bottom of this file pins the size of each
//! structure and the offset of every run-page field against the published
//! ABI. If a field is added, removed or reordered, the crate stops building.
//!
//! # Run Page
//!
//! The run page is mapped from the vCPU file descriptor and shared with KVM:
//!
//! ```text
//! offset  size  field
//! ──────  ────  ─────────────────────────────────────────────
//!      0     8  request_interrupt_window, immediate_exit, pad   (in)
//!      8     8  exit_reason, ready_for_interrupt_injection,
//!               if_flag, flags                                  (out)
//!     16    16  cr8, apic_base                                  (in/out)
//!     32   256  exit union (active member chosen by exit_reason)
//!    288    16  kvm_valid_regs, kvm_dirty_regs
//!    304  2048  sync regs region
//! ──────  ────
//!   2352
//! ```
//!
//! The page handed out by the kernel is larger than `KvmRun`; I/O exits keep
//! their data bytes beyond the structure, at `ExitIo::data_offset`.

use std::mem::{offset_of, size_of};

/// The only KVM API version this binding speaks.
pub const KVM_API_VERSION: i32 = 12;

/// Number of interrupt vectors covered by `Sregs::interrupt_bitmap`.
pub const KVM_NR_INTERRUPTS: usize = 256;

/// Size of the sync regs region at the end of the run page.
pub const SYNC_REGS_SIZE_BYTES: usize = 2048;

/// Size of the tagged union in the run page.
pub const EXIT_UNION_SIZE: usize = 256;

/// `kvm_userspace_memory_region::flags` bits.
pub const KVM_MEM_LOG_DIRTY_PAGES: u32 = 1 << 0;
pub const KVM_MEM_READONLY: u32 = 1 << 1;

/// `kvm_guest_debug::control` bits.
pub const KVM_GUESTDBG_ENABLE: u32 = 1 << 0;
pub const KVM_GUESTDBG_SINGLESTEP: u32 = 1 << 1;

/// `ExitIo::direction` values.
pub const KVM_EXIT_IO_IN: u8 = 0;
pub const KVM_EXIT_IO_OUT: u8 = 1;

/// `ExitInternalError::suberror` values.
pub const KVM_INTERNAL_ERROR_EMULATION: u32 = 1;
pub const KVM_INTERNAL_ERROR_SIMUL_EX: u32 = 2;
pub const KVM_INTERNAL_ERROR_DELIVERY_EV: u32 = 3;

/// Upper bound of `ExitInternalError::data`.
pub const KVM_INTERNAL_ERROR_MAX_DATA: usize = 16;

/// Exit discriminants written to `KvmRun::exit_reason`.
pub mod exit_code {
    pub const KVM_EXIT_UNKNOWN: u32 = 0;
    pub const KVM_EXIT_EXCEPTION: u32 = 1;
    pub const KVM_EXIT_IO: u32 = 2;
    pub const KVM_EXIT_HYPERCALL: u32 = 3;
    pub const KVM_EXIT_DEBUG: u32 = 4;
    pub const KVM_EXIT_HLT: u32 = 5;
    pub const KVM_EXIT_MMIO: u32 = 6;
    pub const KVM_EXIT_IRQ_WINDOW_OPEN: u32 = 7;
    pub const KVM_EXIT_SHUTDOWN: u32 = 8;
    pub const KVM_EXIT_FAIL_ENTRY: u32 = 9;
    pub const KVM_EXIT_INTR: u32 = 10;
    pub const KVM_EXIT_SET_TPR: u32 = 11;
    pub const KVM_EXIT_TPR_ACCESS: u32 = 12;
    pub const KVM_EXIT_S390_SIEIC: u32 = 13;
    pub const KVM_EXIT_S390_RESET: u32 = 14;
    pub const KVM_EXIT_DCR: u32 = 15;
    pub const KVM_EXIT_NMI: u32 = 16;
    pub const KVM_EXIT_INTERNAL_ERROR: u32 = 17;
    pub const KVM_EXIT_OSI: u32 = 18;
    pub const KVM_EXIT_PAPR_HCALL: u32 = 19;
    pub const KVM_EXIT_S390_UCONTROL: u32 = 20;
    pub const KVM_EXIT_WATCHDOG: u32 = 21;
    pub const KVM_EXIT_S390_TSCH: u32 = 22;
    pub const KVM_EXIT_EPR: u32 = 23;
    pub const KVM_EXIT_SYSTEM_EVENT: u32 = 24;
}

/// General-purpose registers (`struct kvm_regs`).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Regs {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

/// Segment descriptor as seen by KVM (`struct kvm_segment`).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub base: u64,
    pub limit: u32,
    pub selector: u16,
    pub type_: u8,
    pub present: u8,
    pub dpl: u8,
    pub db: u8,
    pub s: u8,
    pub l: u8,
    pub g: u8,
    pub avl: u8,
    pub unusable: u8,
    pub padding: u8,
}

/// GDT/IDT register (`struct kvm_dtable`).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorTable {
    pub base: u64,
    pub limit: u16,
    pub padding: [u16; 3],
}

/// Special registers (`struct kvm_sregs`).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Sregs {
    pub cs: Segment,
    pub ds: Segment,
    pub es: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub ss: Segment,
    pub tr: Segment,
    pub ldt: Segment,
    pub gdt: DescriptorTable,
    pub idt: DescriptorTable,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
    pub efer: u64,
    pub apic_base: u64,
    pub interrupt_bitmap: [u64; KVM_NR_INTERRUPTS.div_ceil(64)],
}

/// Hardware debug registers (`struct kvm_debugregs`).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DebugRegs {
    pub db: [u64; 4],
    pub dr6: u64,
    pub dr7: u64,
    pub flags: u64,
    pub reserved: [u64; 9],
}

/// Guest debug control record (`struct kvm_guest_debug`, x86 arch part).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GuestDebug {
    pub control: u32,
    pub pad: u32,
    pub debugreg: [u64; 8],
}

/// Memory region descriptor (`struct kvm_userspace_memory_region`).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UserspaceMemoryRegion {
    pub slot: u32,
    pub flags: u32,
    pub guest_phys_addr: u64,
    pub memory_size: u64,
    pub userspace_addr: u64,
}

/// `KVM_EXIT_UNKNOWN` payload.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitUnknown {
    pub hardware_exit_reason: u64,
}

/// `KVM_EXIT_FAIL_ENTRY` payload.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitFailEntry {
    pub hardware_entry_failure_reason: u64,
    pub cpu: u32,
}

/// `KVM_EXIT_EXCEPTION` payload.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitException {
    pub exception: u32,
    pub error_code: u32,
}

/// `KVM_EXIT_IO` payload. `data_offset` is relative to the start of the
/// run page.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitIo {
    pub direction: u8,
    pub size: u8,
    pub port: u16,
    pub count: u32,
    pub data_offset: u64,
}

/// `KVM_EXIT_DEBUG` payload (`struct kvm_debug_exit_arch`).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitDebug {
    pub exception: u32,
    pub pad: u32,
    pub pc: u64,
    pub dr6: u64,
    pub dr7: u64,
}

/// `KVM_EXIT_MMIO` payload.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitMmio {
    pub phys_addr: u64,
    pub data: [u8; 8],
    pub len: u32,
    pub is_write: u8,
    pub padding: [u8; 3],
}

/// `KVM_EXIT_HYPERCALL` payload.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitHypercall {
    pub nr: u64,
    pub args: [u64; 6],
    pub ret: u64,
    pub longmode: u32,
    pub pad: u32,
}

/// `KVM_EXIT_TPR_ACCESS` payload.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitTprAccess {
    pub rip: u64,
    pub is_write: u32,
    pub pad: u32,
}

/// `KVM_EXIT_INTERNAL_ERROR` payload. Only the first `ndata` entries of
/// `data` are meaningful.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitInternalError {
    pub suberror: u32,
    pub ndata: u32,
    pub data: [u64; KVM_INTERNAL_ERROR_MAX_DATA],
}

/// `KVM_EXIT_SYSTEM_EVENT` payload. `data[0]` doubles as the legacy
/// `flags` field.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitSystemEvent {
    pub type_: u32,
    pub ndata: u32,
    pub data: [u64; 16],
}

/// The tagged union of the run page. Which member is live depends on
/// `KvmRun::exit_reason`; reading any other member yields stale bytes.
#[repr(C)]
#[derive(Clone, Copy)]
pub union ExitInfo {
    pub hw: ExitUnknown,
    pub fail_entry: ExitFailEntry,
    pub ex: ExitException,
    pub io: ExitIo,
    pub debug: ExitDebug,
    pub mmio: ExitMmio,
    pub hypercall: ExitHypercall,
    pub tpr_access: ExitTprAccess,
    pub internal: ExitInternalError,
    pub system_event: ExitSystemEvent,
    pub padding: [u8; EXIT_UNION_SIZE],
}

impl Default for ExitInfo {
    fn default() -> Self {
        Self {
            padding: [0; EXIT_UNION_SIZE],
        }
    }
}

/// The shared run page (`struct kvm_run`).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct KvmRun {
    // in
    pub request_interrupt_window: u8,
    pub immediate_exit: u8,
    pub padding1: [u8; 6],

    // out
    pub exit_reason: u32,
    pub ready_for_interrupt_injection: u8,
    pub if_flag: u8,
    pub flags: u16,

    // in (pre run), out (post run)
    pub cr8: u64,
    pub apic_base: u64,

    pub exit: ExitInfo,

    pub kvm_valid_regs: u64,
    pub kvm_dirty_regs: u64,
    pub sync_regs: [u8; SYNC_REGS_SIZE_BYTES],
}

impl std::fmt::Debug for KvmRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvmRun")
            .field("request_interrupt_window", &self.request_interrupt_window)
            .field("exit_reason", &self.exit_reason)
            .field(
                "ready_for_interrupt_injection",
                &self.ready_for_interrupt_injection,
            )
            .field("if_flag", &self.if_flag)
            .field("cr8", &self.cr8)
            .field("apic_base", &self.apic_base)
            .finish_non_exhaustive()
    }
}

// Layout pins against the x86-64 kernel ABI.
const _: () = {
    assert!(size_of::<Regs>() == 144);
    assert!(size_of::<Segment>() == 24);
    assert!(size_of::<DescriptorTable>() == 16);
    assert!(size_of::<Sregs>() == 312);
    assert!(offset_of!(Sregs, gdt) == 192);
    assert!(offset_of!(Sregs, cr0) == 224);
    assert!(offset_of!(Sregs, interrupt_bitmap) == 280);
    assert!(size_of::<DebugRegs>() == 128);
    assert!(size_of::<GuestDebug>() == 72);
    assert!(size_of::<UserspaceMemoryRegion>() == 32);

    assert!(size_of::<ExitIo>() == 16);
    assert!(offset_of!(ExitIo, data_offset) == 8);
    assert!(size_of::<ExitMmio>() == 24);
    assert!(offset_of!(ExitMmio, len) == 16);
    assert!(offset_of!(ExitMmio, is_write) == 20);
    assert!(size_of::<ExitDebug>() == 32);
    assert!(size_of::<ExitHypercall>() == 72);
    assert!(size_of::<ExitInternalError>() == 136);
    assert!(offset_of!(ExitInternalError, data) == 8);
    assert!(offset_of!(ExitSystemEvent, data) == 8);
    assert!(size_of::<ExitInfo>() == EXIT_UNION_SIZE);

    assert!(offset_of!(KvmRun, request_interrupt_window) == 0);
    assert!(offset_of!(KvmRun, immediate_exit) == 1);
    assert!(offset_of!(KvmRun, exit_reason) == 8);
    assert!(offset_of!(KvmRun, ready_for_interrupt_injection) == 12);
    assert!(offset_of!(KvmRun, if_flag) == 13);
    assert!(offset_of!(KvmRun, flags) == 14);
    assert!(offset_of!(KvmRun, cr8) == 16);
    assert!(offset_of!(KvmRun, apic_base) == 24);
    assert!(offset_of!(KvmRun, exit) == 32);
    assert!(offset_of!(KvmRun, kvm_valid_regs) == 288);
    assert!(offset_of!(KvmRun, kvm_dirty_regs) == 296);
    assert!(offset_of!(KvmRun, sync_regs) == 304);
    assert!(size_of::<KvmRun>() == 2352);
};
