//! Raw KVM ioctl requests.
//!
//! Request codes are derived from the structures in [`super::abi`] through
//! nix's `_IO`/`_IOR`/`_IOW` encoders, so a layout change there is reflected
//! in the request number automatically.
//!
//! Every wrapper is `unsafe`: the caller must pass a descriptor of the right
//! kind (system, VM or vCPU) and, where a pointer is involved, a pointer to a
//! live value of the encoded type.

use super::abi::{DebugRegs, GuestDebug, Regs, Sregs, UserspaceMemoryRegion};
use nix::{ioctl_read, ioctl_write_int_bad, ioctl_write_ptr, request_code_none};

/// KVM ioctl magic number.
const KVMIO: u8 = 0xAE;

// System ioctls, issued on the /dev/kvm descriptor.
ioctl_write_int_bad!(kvm_get_api_version, request_code_none!(KVMIO, 0x00));
ioctl_write_int_bad!(kvm_create_vm, request_code_none!(KVMIO, 0x01));
ioctl_write_int_bad!(kvm_check_extension, request_code_none!(KVMIO, 0x03));
ioctl_write_int_bad!(kvm_get_vcpu_mmap_size, request_code_none!(KVMIO, 0x04));

// VM ioctls.
ioctl_write_int_bad!(kvm_create_vcpu, request_code_none!(KVMIO, 0x41));
ioctl_write_ptr!(
    kvm_set_user_memory_region,
    KVMIO,
    0x46,
    UserspaceMemoryRegion
);

// vCPU ioctls.
// KVM_RUN rejects a non-zero argument, so it must be passed explicitly.
ioctl_write_int_bad!(kvm_run, request_code_none!(KVMIO, 0x80));
ioctl_read!(kvm_get_regs, KVMIO, 0x81, Regs);
ioctl_write_ptr!(kvm_set_regs, KVMIO, 0x82, Regs);
ioctl_read!(kvm_get_sregs, KVMIO, 0x83, Sregs);
ioctl_write_ptr!(kvm_set_sregs, KVMIO, 0x84, Sregs);
ioctl_write_ptr!(kvm_set_guest_debug, KVMIO, 0x9b, GuestDebug);
ioctl_read!(kvm_get_debugregs, KVMIO, 0xa1, DebugRegs);
ioctl_write_ptr!(kvm_set_debugregs, KVMIO, 0xa2, DebugRegs);

#[cfg(test)]
mod tests {
    use super::*;
    use nix::{request_code_read, request_code_write};
    use std::mem::size_of;

    #[test]
    fn test_run_takes_explicit_argument() {
        let run: unsafe fn(libc::c_int, libc::c_int) -> nix::Result<libc::c_int> = kvm_run;
        let file = std::fs::File::open("/dev/null").unwrap();
        // SAFETY: /dev/null rejects every ioctl.
        let err = unsafe { run(std::os::fd::AsRawFd::as_raw_fd(&file), 0) }.unwrap_err();
        assert_eq!(err, nix::errno::Errno::ENOTTY);
    }

    // Values produced by the kernel headers' _IO* macros on x86-64.
    #[test]
    fn test_request_codes() {
        assert_eq!(request_code_none!(KVMIO, 0x00) as u32, 0x0000_AE00);
        assert_eq!(request_code_none!(KVMIO, 0x01) as u32, 0x0000_AE01);
        assert_eq!(request_code_none!(KVMIO, 0x03) as u32, 0x0000_AE03);
        assert_eq!(request_code_none!(KVMIO, 0x04) as u32, 0x0000_AE04);
        assert_eq!(request_code_none!(KVMIO, 0x41) as u32, 0x0000_AE41);
        assert_eq!(request_code_none!(KVMIO, 0x80) as u32, 0x0000_AE80);
        assert_eq!(
            request_code_write!(KVMIO, 0x46, size_of::<UserspaceMemoryRegion>()) as u32,
            0x4020_AE46
        );
        assert_eq!(
            request_code_read!(KVMIO, 0x81, size_of::<Regs>()) as u32,
            0x8090_AE81
        );
        assert_eq!(
            request_code_write!(KVMIO, 0x82, size_of::<Regs>()) as u32,
            0x4090_AE82
        );
        assert_eq!(
            request_code_read!(KVMIO, 0x83, size_of::<Sregs>()) as u32,
            0x8138_AE83
        );
        assert_eq!(
            request_code_write!(KVMIO, 0x84, size_of::<Sregs>()) as u32,
            0x4138_AE84
        );
        assert_eq!(
            request_code_write!(KVMIO, 0x9b, size_of::<GuestDebug>()) as u32,
            0x4048_AE9B
        );
        assert_eq!(
            request_code_read!(KVMIO, 0xa1, size_of::<DebugRegs>()) as u32,
            0x8080_AEA1
        );
        assert_eq!(
            request_code_write!(KVMIO, 0xa2, size_of::<DebugRegs>()) as u32,
            0x4080_AEA2
        );
    }
}
