//! KVM capability table and lazy capability enumeration.
//!
//! `KVM_CHECK_EXTENSION` takes a capability number and answers with `0` when
//! the capability is missing, `1` when it is present, or a count for
//! capabilities that describe a limit (e.g. `KVM_CAP_NR_MEMSLOTS`).

use super::{Kvm, Result};

/// Memory slots available to each VM.
pub const KVM_CAP_NR_MEMSLOTS: u32 = 10;
/// Recommended number of vCPUs per VM.
pub const KVM_CAP_NR_VCPUS: u32 = 9;
/// Maximum number of vCPUs per VM.
pub const KVM_CAP_MAX_VCPUS: u32 = 66;
/// Read-only memory slots (`KVM_MEM_READONLY`).
pub const KVM_CAP_READONLY_MEM: u32 = 81;
/// `KVM_SET_GUEST_DEBUG` is available.
pub const KVM_CAP_SET_GUEST_DEBUG: u32 = 23;
/// `KVM_GET_DEBUGREGS` / `KVM_SET_DEBUGREGS` are available.
pub const KVM_CAP_DEBUGREGS: u32 = 50;

/// A named KVM capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    pub name: &'static str,
    pub id: u32,
}

impl Capability {
    const fn new(name: &'static str, id: u32) -> Self {
        Self { name, id }
    }
}

/// Every capability the binding knows by name, sorted by name.
pub static CAPABILITIES: &[Capability] = &[
    Capability::new("KVM_CAP_ARM_PSCI", 87),
    Capability::new("KVM_CAP_ARM_SET_DEVICE_ADDR", 88),
    Capability::new("KVM_CAP_ASSIGN_DEV_IRQ", 29),
    Capability::new("KVM_CAP_ASYNC_PF", 59),
    Capability::new("KVM_CAP_CLOCKSOURCE", 8),
    Capability::new("KVM_CAP_COALESCED_MMIO", 15),
    Capability::new("KVM_CAP_DEBUGREGS", 50),
    Capability::new("KVM_CAP_DESTROY_MEMORY_REGION_WORKS", 21),
    Capability::new("KVM_CAP_DEVICE_ASSIGNMENT", 17),
    Capability::new("KVM_CAP_DEVICE_CTRL", 89),
    Capability::new("KVM_CAP_DEVICE_DEASSIGNMENT", 27),
    Capability::new("KVM_CAP_DEVICE_MSI", 20),
    Capability::new("KVM_CAP_DEVICE_MSIX", 28),
    Capability::new("KVM_CAP_ENABLE_CAP", 54),
    Capability::new("KVM_CAP_EXT_CPUID", 7),
    Capability::new("KVM_CAP_GET_TSC_KHZ", 61),
    Capability::new("KVM_CAP_HLT", 1),
    Capability::new("KVM_CAP_HYPERV", 44),
    Capability::new("KVM_CAP_HYPERV_SPIN", 46),
    Capability::new("KVM_CAP_HYPERV_TIME", 96),
    Capability::new("KVM_CAP_HYPERV_VAPIC", 45),
    Capability::new("KVM_CAP_INTERNAL_ERROR_DATA", 40),
    Capability::new("KVM_CAP_INTR_SHADOW", 49),
    Capability::new("KVM_CAP_IOAPIC_POLARITY_IGNORED", 97),
    Capability::new("KVM_CAP_IOEVENTFD", 36),
    Capability::new("KVM_CAP_IOMMU", 18),
    Capability::new("KVM_CAP_IRQCHIP", 0),
    Capability::new("KVM_CAP_IRQFD", 32),
    Capability::new("KVM_CAP_IRQFD_RESAMPLE", 82),
    Capability::new("KVM_CAP_IRQ_INJECT_STATUS", 26),
    Capability::new("KVM_CAP_IRQ_MPIC", 90),
    Capability::new("KVM_CAP_IRQ_ROUTING", 25),
    Capability::new("KVM_CAP_IRQ_XICS", 92),
    Capability::new("KVM_CAP_JOIN_MEMORY_REGIONS_WORKS", 30),
    Capability::new("KVM_CAP_KVMCLOCK_CTRL", 76),
    Capability::new("KVM_CAP_MAX_VCPUS", 66),
    Capability::new("KVM_CAP_MCE", 31),
    Capability::new("KVM_CAP_MMU_SHADOW_CACHE_CONTROL", 2),
    Capability::new("KVM_CAP_MP_STATE", 14),
    Capability::new("KVM_CAP_NOP_IO_DELAY", 12),
    Capability::new("KVM_CAP_NR_MEMSLOTS", 10),
    Capability::new("KVM_CAP_NR_VCPUS", 9),
    Capability::new("KVM_CAP_ONE_REG", 70),
    Capability::new("KVM_CAP_PCI_2_3", 75),
    Capability::new("KVM_CAP_PCI_SEGMENT", 47),
    Capability::new("KVM_CAP_PIT", 11),
    Capability::new("KVM_CAP_PIT2", 33),
    Capability::new("KVM_CAP_PIT_STATE2", 35),
    Capability::new("KVM_CAP_PPC_ALLOC_HTAB", 80),
    Capability::new("KVM_CAP_PPC_BOOKE_SREGS", 62),
    Capability::new("KVM_CAP_PPC_BOOKE_WATCHDOG", 83),
    Capability::new("KVM_CAP_PPC_EPR", 86),
    Capability::new("KVM_CAP_PPC_GET_PVINFO", 57),
    Capability::new("KVM_CAP_PPC_GET_SMMU_INFO", 78),
    Capability::new("KVM_CAP_PPC_HIOR", 67),
    Capability::new("KVM_CAP_PPC_HTAB_FD", 84),
    Capability::new("KVM_CAP_PPC_IRQ_LEVEL", 58),
    Capability::new("KVM_CAP_PPC_OSI", 52),
    Capability::new("KVM_CAP_PPC_PAIRED_SINGLES", 48),
    Capability::new("KVM_CAP_PPC_PAPR", 68),
    Capability::new("KVM_CAP_PPC_RMA", 65),
    Capability::new("KVM_CAP_PPC_RTAS", 91),
    Capability::new("KVM_CAP_PPC_SEGSTATE", 43),
    Capability::new("KVM_CAP_PPC_SMT", 64),
    Capability::new("KVM_CAP_PPC_UNSET_IRQ", 53),
    Capability::new("KVM_CAP_PV_MMU", 13),
    Capability::new("KVM_CAP_READONLY_MEM", 81),
    Capability::new("KVM_CAP_REINJECT_CONTROL", 24),
    Capability::new("KVM_CAP_S390_COW", 79),
    Capability::new("KVM_CAP_S390_CSS_SUPPORT", 85),
    Capability::new("KVM_CAP_S390_GMAP", 71),
    Capability::new("KVM_CAP_S390_PSW", 42),
    Capability::new("KVM_CAP_S390_UCONTROL", 73),
    Capability::new("KVM_CAP_SET_BOOT_CPU_ID", 34),
    Capability::new("KVM_CAP_SET_GUEST_DEBUG", 23),
    Capability::new("KVM_CAP_SET_IDENTITY_MAP_ADDR", 37),
    Capability::new("KVM_CAP_SET_TSS_ADDR", 4),
    Capability::new("KVM_CAP_SIGNAL_MSI", 77),
    Capability::new("KVM_CAP_SPAPR_TCE", 63),
    Capability::new("KVM_CAP_SW_TLB", 69),
    Capability::new("KVM_CAP_SYNC_MMU", 16),
    Capability::new("KVM_CAP_SYNC_REGS", 74),
    Capability::new("KVM_CAP_TSC_CONTROL", 60),
    Capability::new("KVM_CAP_TSC_DEADLINE_TIMER", 72),
    Capability::new("KVM_CAP_USER_MEMORY", 3),
    Capability::new("KVM_CAP_USER_NMI", 22),
    Capability::new("KVM_CAP_VAPIC", 6),
    Capability::new("KVM_CAP_VCPU_EVENTS", 41),
    Capability::new("KVM_CAP_X86_ROBUST_SINGLESTEP", 51),
    Capability::new("KVM_CAP_XCRS", 56),
    Capability::new("KVM_CAP_XEN_HVM", 38),
    Capability::new("KVM_CAP_XSAVE", 55),
];

/// Look up a capability by its kernel name.
pub fn capability_by_name(name: &str) -> Option<Capability> {
    CAPABILITIES
        .binary_search_by(|cap| cap.name.cmp(name))
        .ok()
        .map(|index| CAPABILITIES[index])
}

/// The kernel's answer for one capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extension {
    pub capability: Capability,
    /// Raw `KVM_CHECK_EXTENSION` result: 0 = unsupported, otherwise a flag
    /// or a count depending on the capability.
    pub value: i32,
}

impl Extension {
    pub fn name(&self) -> &'static str {
        self.capability.name
    }

    pub fn is_supported(&self) -> bool {
        self.value > 0
    }
}

/// Lazy iterator over [`CAPABILITIES`], querying the kernel once per item.
///
/// Created by [`Kvm::extensions`]. Calling that again starts a fresh pass
/// that re-queries the kernel.
pub struct Extensions<'a> {
    kvm: &'a Kvm,
    next: usize,
}

impl<'a> Extensions<'a> {
    pub(crate) fn new(kvm: &'a Kvm) -> Self {
        Self { kvm, next: 0 }
    }
}

impl Iterator for Extensions<'_> {
    type Item = Result<Extension>;

    fn next(&mut self) -> Option<Self::Item> {
        let capability = *CAPABILITIES.get(self.next)?;
        self.next += 1;
        Some(
            self.kvm
                .check_extension(capability.id)
                .map(|value| Extension { capability, value }),
        )
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = CAPABILITIES.len() - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Extensions<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use kvm_bindings as kb;

    #[test]
    fn test_table_sorted_and_unique() {
        for pair in CAPABILITIES.windows(2) {
            assert!(pair[0].name < pair[1].name, "{} >= {}", pair[0].name, pair[1].name);
        }
    }

    #[test]
    fn test_lookup_by_name() {
        let cap = capability_by_name("KVM_CAP_NR_MEMSLOTS").unwrap();
        assert_eq!(cap.id, KVM_CAP_NR_MEMSLOTS);
        assert!(capability_by_name("KVM_CAP_DOES_NOT_EXIST").is_none());
    }

    #[test]
    fn test_named_constants_match_bindgen() {
        assert_eq!(KVM_CAP_NR_MEMSLOTS, kb::KVM_CAP_NR_MEMSLOTS);
        assert_eq!(KVM_CAP_NR_VCPUS, kb::KVM_CAP_NR_VCPUS);
        assert_eq!(KVM_CAP_MAX_VCPUS, kb::KVM_CAP_MAX_VCPUS);
        assert_eq!(KVM_CAP_READONLY_MEM, kb::KVM_CAP_READONLY_MEM);
        assert_eq!(KVM_CAP_SET_GUEST_DEBUG, kb::KVM_CAP_SET_GUEST_DEBUG);
        assert_eq!(KVM_CAP_DEBUGREGS, kb::KVM_CAP_DEBUGREGS);
    }

    #[test]
    fn test_table_agrees_with_named_constants() {
        for (name, id) in [
            ("KVM_CAP_NR_MEMSLOTS", KVM_CAP_NR_MEMSLOTS),
            ("KVM_CAP_NR_VCPUS", KVM_CAP_NR_VCPUS),
            ("KVM_CAP_MAX_VCPUS", KVM_CAP_MAX_VCPUS),
            ("KVM_CAP_READONLY_MEM", KVM_CAP_READONLY_MEM),
            ("KVM_CAP_SET_GUEST_DEBUG", KVM_CAP_SET_GUEST_DEBUG),
            ("KVM_CAP_DEBUGREGS", KVM_CAP_DEBUGREGS),
        ] {
            assert_eq!(capability_by_name(name).map(|c| c.id), Some(id));
        }
    }

    #[test]
    fn test_extension_support() {
        let capability = capability_by_name("KVM_CAP_HLT").unwrap();
        assert!(!Extension { capability, value: 0 }.is_supported());
        assert!(Extension { capability, value: 1 }.is_supported());
        assert!(Extension { capability, value: 32764 }.is_supported());
    }
}
