//! Tests against a real /dev/kvm.
//!
//! All of them are ignored by default. Run with:
//!
//! ```text
//! cargo test --test kvm_integration -- --ignored
//! ```

#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

use kvmbind::kvm::abi::{DebugRegs, Regs};
use kvmbind::kvm::{ExitReason, GuestRam, IoDirection, Kvm, KvmError, Vcpu, Vm};

const LOAD_ADDR: u64 = 0x1000;
const MIB: usize = 1 << 20;

const HLT: &[u8] = &[0xf4];

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Point the vCPU at `LOAD_ADDR` in flat real mode.
fn enter_real_mode(vcpu: &Vcpu) {
    let mut sregs = vcpu.get_sregs().unwrap();
    sregs.cs.base = 0;
    sregs.cs.selector = 0;
    vcpu.set_sregs(&sregs).unwrap();

    let regs = Regs {
        rip: LOAD_ADDR,
        rflags: 0x2,
        ..Regs::default()
    };
    vcpu.set_regs(&regs).unwrap();
}

/// A VM with `mem_size` bytes of RAM at GPA 0, `code` at `LOAD_ADDR`, and
/// vCPU 0 ready to execute it.
fn guest_vm(code: &[u8], mem_size: usize) -> Vm {
    let kvm = Kvm::new().unwrap();
    let mut vm = kvm.create_vm("MyVM").unwrap();
    let ram = GuestRam::new(mem_size).unwrap();
    ram.write(LOAD_ADDR, code).unwrap();
    vm.add_mem_region(0, ram, false).unwrap();
    let vcpu = vm.add_vcpu(0).unwrap();
    enter_real_mode(vcpu);
    vm
}

#[test]
#[ignore] // Requires /dev/kvm
fn test_open_device() {
    init();
    let kvm = Kvm::new().unwrap();
    assert_eq!(kvm.api_version().unwrap(), 12);
    assert!(kvm.max_mem_slots() > 0);
    assert!(kvm.vcpu_mmap_size().unwrap() >= 2352);
}

#[test]
#[ignore] // Requires /dev/kvm
fn test_matches_kvm_ioctls() {
    let ours = Kvm::new().unwrap();
    let theirs = kvm_ioctls::Kvm::new().unwrap();

    assert_eq!(ours.api_version().unwrap(), theirs.get_api_version());
    assert_eq!(
        ours.vcpu_mmap_size().unwrap(),
        theirs.get_vcpu_mmap_size().unwrap()
    );
    assert_eq!(ours.max_mem_slots(), theirs.get_nr_memslots());
}

#[test]
#[ignore] // Requires /dev/kvm
fn test_extensions_repeatable() {
    let kvm = Kvm::new().unwrap();
    let first: Vec<_> = kvm.extensions().map(|e| e.unwrap()).collect();
    let second: Vec<_> = kvm.extensions().map(|e| e.unwrap()).collect();
    assert_eq!(first, second);

    let memslots = first
        .iter()
        .find(|e| e.name() == "KVM_CAP_NR_MEMSLOTS")
        .unwrap();
    assert_eq!(memslots.value as usize, kvm.max_mem_slots());
}

#[test]
#[ignore] // Requires /dev/kvm
fn test_halt() {
    init();
    let mut vm = guest_vm(HLT, MIB);
    assert_eq!(vm.name(), "MyVM");
    assert_eq!(vm.slots().len(), 1);
    assert_eq!(vm.slot(0).unwrap().memory().len(), MIB);

    let vcpu = vm.vcpu_mut(0).unwrap();
    let exit = vcpu.run().unwrap();
    assert!(matches!(exit.reason, ExitReason::Hlt), "{exit}");

    // hlt is one byte long.
    assert_eq!(vcpu.get_regs().unwrap().rip, LOAD_ADDR + 1);
}

#[test]
#[ignore] // Requires /dev/kvm
fn test_serial_out() {
    let code = [
        0xba, 0xf8, 0x03, // mov dx, 0x3f8
        0xb0, b'o', 0xee, // mov al, 'o'; out dx, al
        0xb0, b'k', 0xee, // mov al, 'k'; out dx, al
        0xf4, // hlt
    ];
    let mut vm = guest_vm(&code, MIB);
    let vcpu = vm.vcpu_mut(0).unwrap();

    let mut output = Vec::new();
    loop {
        let exit = vcpu.run().unwrap();
        match exit.reason {
            ExitReason::Io(io) => {
                assert_eq!(io.port(), 0x3f8);
                assert_eq!(io.direction(), IoDirection::Out);
                assert_eq!(io.size(), 1);
                output.extend_from_slice(io.data().unwrap());
            }
            ExitReason::Hlt => break,
            other => panic!("unexpected exit: {other}"),
        }
    }
    assert_eq!(output, b"ok");
}

#[test]
#[ignore] // Requires /dev/kvm
fn test_io_in_answer_reaches_guest() {
    let code = [
        0xba, 0x60, 0x00, // mov dx, 0x60
        0xec, // in al, dx
        0xba, 0xf8, 0x03, // mov dx, 0x3f8
        0xee, // out dx, al
        0xf4, // hlt
    ];
    let mut vm = guest_vm(&code, MIB);
    let vcpu = vm.vcpu_mut(0).unwrap();

    {
        let mut exit = vcpu.run().unwrap();
        let ExitReason::Io(io) = &mut exit.reason else {
            panic!("expected I/O exit");
        };
        assert_eq!(io.port(), 0x60);
        assert_eq!(io.direction(), IoDirection::In);
        assert!(matches!(io.data(), Err(KvmError::NotWritable { port: 0x60 })));
        io.set_data(&[0x5a]).unwrap();
    }
    {
        let exit = vcpu.run().unwrap();
        let ExitReason::Io(io) = &exit.reason else {
            panic!("expected I/O exit, got {exit}");
        };
        assert_eq!(io.port(), 0x3f8);
        assert_eq!(io.data().unwrap(), &[0x5a]);
    }
    assert!(matches!(vcpu.run().unwrap().reason, ExitReason::Hlt));
}

#[test]
#[ignore] // Requires /dev/kvm
fn test_mmio_round_trip() {
    let code = [
        0xc6, 0x06, 0x00, 0x80, 0xab, // mov byte [0x8000], 0xab
        0xa0, 0x00, 0x80, // mov al, [0x8000]
        0xba, 0xf8, 0x03, // mov dx, 0x3f8
        0xee, // out dx, al
        0xf4, // hlt
    ];
    // RAM ends at 0x4000, so 0x8000 is unbacked.
    let mut vm = guest_vm(&code, 0x4000);
    let vcpu = vm.vcpu_mut(0).unwrap();

    match vcpu.run().unwrap().reason {
        ExitReason::Mmio(mmio) => {
            assert!(mmio.is_write);
            assert_eq!(mmio.phys_addr, 0x8000);
            assert_eq!(mmio.data(), &[0xab]);
        }
        other => panic!("expected MMIO write, got {other}"),
    }
    assert!(matches!(
        vcpu.complete_mmio_read(&[0x42]),
        Err(KvmError::NoPendingMmioRead)
    ));

    match vcpu.run().unwrap().reason {
        ExitReason::Mmio(mmio) => {
            assert!(!mmio.is_write);
            assert_eq!(mmio.len, 1);
        }
        other => panic!("expected MMIO read, got {other}"),
    }
    vcpu.complete_mmio_read(&[0x42]).unwrap();

    match vcpu.run().unwrap().reason {
        ExitReason::Io(io) => assert_eq!(io.data().unwrap(), &[0x42]),
        other => panic!("expected I/O exit, got {other}"),
    }
}

#[test]
#[ignore] // Requires /dev/kvm
fn test_register_round_trip() {
    let mut vm = guest_vm(HLT, MIB);
    let vcpu = vm.vcpu_mut(0).unwrap();

    let regs = Regs {
        rax: 0x1122_3344_5566_7788,
        rbx: 1,
        r15: u64::MAX,
        rip: LOAD_ADDR,
        rflags: 0x2,
        ..Regs::default()
    };
    vcpu.set_regs(&regs).unwrap();
    assert_eq!(vcpu.get_regs().unwrap(), regs);

    // Reset CR0 is ET | NW | CD; switch caching back on and set WP | AM.
    let mut sregs = vcpu.get_sregs().unwrap();
    sregs.cr0 = (1 << 4) | (1 << 16) | (1 << 18);
    sregs.cr2 = 0xdead_b000;
    sregs.fs.base = 0x12_3000;
    sregs.gs.base = 0xffff_8000_0000_0000;
    vcpu.set_sregs(&sregs).unwrap();
    assert_eq!(vcpu.get_sregs().unwrap(), sregs);

    let dregs = DebugRegs {
        db: [0x2000, 0x3000, 0x4000, 0x5000],
        dr6: 0xffff_0ff1,
        // L0 plus the always-set bit 10; nothing ever executes at 0x2000.
        dr7: 0x401,
        ..DebugRegs::default()
    };
    vcpu.set_debug_regs(&dregs).unwrap();
    assert_eq!(vcpu.get_debug_regs().unwrap(), dregs);

    // Registers survive a run; only RIP moves past the hlt.
    assert!(matches!(vcpu.run().unwrap().reason, ExitReason::Hlt));
    let after = vcpu.get_regs().unwrap();
    assert_eq!(
        after,
        Regs {
            rip: LOAD_ADDR + 1,
            ..regs
        }
    );
    assert_eq!(vcpu.get_sregs().unwrap(), sregs);
    assert_eq!(vcpu.get_debug_regs().unwrap(), dregs);
}

/// A set bit in the interrupt bitmap queues that vector, so this uses a
/// vCPU that never runs.
#[test]
#[ignore] // Requires /dev/kvm
fn test_interrupt_bitmap_round_trip() {
    let kvm = Kvm::new().unwrap();
    let mut vm = kvm.create_vm("bitmap").unwrap();
    let vcpu = vm.add_vcpu(0).unwrap();

    let mut sregs = vcpu.get_sregs().unwrap();
    assert!(sregs.interrupt_bitmap.iter().all(|&word| word == 0));
    sregs.interrupt_bitmap[0] = 1 << 32; // vector 0x20
    vcpu.set_sregs(&sregs).unwrap();
    assert_eq!(vcpu.get_sregs().unwrap().interrupt_bitmap, sregs.interrupt_bitmap);
}

/// Enabling single-step has been seen to perturb register state on some
/// kernels. This checks that a step only moves RIP.
#[test]
#[ignore] // Requires /dev/kvm
fn test_single_step() {
    let code = [0x90, 0x90, 0xf4]; // nop; nop; hlt
    let mut vm = guest_vm(&code, MIB);
    let vcpu = vm.vcpu_mut(0).unwrap();

    let before = vcpu.get_regs().unwrap();
    vcpu.enable_single_step().unwrap();

    let exit = vcpu.run().unwrap();
    let ExitReason::Debug(debug) = exit.reason else {
        panic!("expected debug exit, got {exit}");
    };
    assert_eq!(debug.pc, LOAD_ADDR + 1);

    let after = vcpu.get_regs().unwrap();
    assert_eq!(
        after,
        Regs {
            rip: LOAD_ADDR + 1,
            ..before
        }
    );

    vcpu.disable_guest_debug().unwrap();
    assert!(matches!(vcpu.run().unwrap().reason, ExitReason::Hlt));
}

#[test]
#[ignore] // Requires /dev/kvm
fn test_duplicate_vcpu() {
    let kvm = Kvm::new().unwrap();
    let mut vm = kvm.create_vm("dup").unwrap();
    vm.add_vcpu(0).unwrap();
    assert!(matches!(vm.add_vcpu(0), Err(KvmError::DuplicateVcpu(0))));
    assert_eq!(vm.vcpu_count(), 1);
}

#[test]
#[ignore] // Requires /dev/kvm
fn test_overlapping_region_rejected() {
    let kvm = Kvm::new().unwrap();
    let mut vm = kvm.create_vm("overlap").unwrap();
    let slot = vm.add_mem_region(0, GuestRam::new(MIB).unwrap(), false).unwrap();
    assert_eq!(slot, 0);

    let err = vm
        .add_mem_region(0x1000, GuestRam::new(MIB).unwrap(), false)
        .unwrap_err();
    assert!(matches!(err, KvmError::RegionRejected { slot: 1, .. }));
    assert_eq!(vm.slots().len(), 1);

    let slot = vm
        .add_mem_region(MIB as u64, GuestRam::new(MIB).unwrap(), true)
        .unwrap();
    assert_eq!(slot, 1);
    assert!(vm.slot(1).unwrap().read_only());
}

#[test]
#[ignore] // Requires /dev/kvm
fn test_update_mem_region_moves_slot() {
    let kvm = Kvm::new().unwrap();
    let mut vm = kvm.create_vm("move").unwrap();
    vm.add_mem_region(0, GuestRam::new(MIB).unwrap(), false).unwrap();

    vm.update_mem_region(0, 4 * MIB as u64, false).unwrap();
    assert_eq!(vm.slot(0).unwrap().guest_phys_addr(), 4 * MIB as u64);
}

#[test]
#[ignore] // Requires /dev/kvm
fn test_vcpus_on_threads() {
    let mut vm = guest_vm(HLT, MIB);
    let vcpu = vm.add_vcpu(1).unwrap();
    enter_real_mode(vcpu);

    std::thread::scope(|s| {
        for vcpu in vm.vcpus_mut() {
            s.spawn(move || {
                let exit = vcpu.run().unwrap();
                assert!(matches!(exit.reason, ExitReason::Hlt), "{exit}");
            });
        }
    });
}
