//! kvmbind - smoke test for the KVM binding.
//!
//! Creates a VM with one vCPU and a small RAM slot, places a real-mode
//! program that prints a banner on COM1 and halts, and drives the
//! run/decode loop until the guest stops.
//!
//! This binary requires Linux with KVM support. It will not run on other platforms.

use clap::Parser;
use std::error::Error;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "kvmbind")]
#[command(about = "Run a tiny real-mode guest through the KVM binding")]
struct Args {
    /// KVM device node
    #[arg(short, long, env = "KVMBIND_DEVICE", default_value = "/dev/kvm")]
    device: String,

    /// Guest memory size in KiB
    #[arg(short, long, env = "KVMBIND_MEMORY_KIB", default_value = "1024")]
    memory: usize,

    /// Stop after this many VM exits
    #[arg(long, env = "KVMBIND_MAX_EXITS", default_value = "256")]
    max_exits: u64,

    /// Trap after every guest instruction
    #[arg(long)]
    single_step: bool,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("Error: {e}");
        let mut source = e.source();
        while let Some(cause) = source {
            eprintln!("  caused by: {cause}");
            source = cause.source();
        }
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod guest {
    /// Guest physical address the program is loaded at.
    pub const LOAD_ADDR: u64 = 0x1000;

    /// COM1 data port.
    pub const SERIAL_PORT: u16 = 0x3f8;

    pub const BANNER: &[u8] = b"Hello from kvmbind\n";

    /// Guest RAM size in bytes, or `None` if `kib` KiB does not fit.
    pub fn mem_size(kib: usize) -> Option<usize> {
        kib.checked_mul(1024)
    }

    /// Real-mode code writing `banner` to COM1 one byte at a time, then `hlt`.
    pub fn program(banner: &[u8]) -> Vec<u8> {
        let [lo, hi] = SERIAL_PORT.to_le_bytes();
        let mut code = vec![0xba, lo, hi]; // mov dx, SERIAL_PORT
        for &byte in banner {
            code.extend_from_slice(&[0xb0, byte, 0xee]); // mov al, byte; out dx, al
        }
        code.push(0xf4); // hlt
        code
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn run(args: Args) -> Result<(), Box<dyn Error>> {
    use kvmbind::kvm::{ExitReason, GuestRam, Kvm};
    use log::{info, trace, warn};
    use std::io::Write;

    let kvm = Kvm::open(&args.device)?;
    info!("API version {}", kvm.api_version()?);
    let supported = kvm
        .extensions()
        .filter_map(Result::ok)
        .filter(|ext| ext.is_supported())
        .count();
    info!("{supported} of {} known capabilities supported", kvm.extensions().len());

    let mut vm = kvm.create_vm("MyVM")?;

    let mem_size = guest::mem_size(args.memory).ok_or("--memory is too large")?;
    let ram = GuestRam::new(mem_size)?;
    ram.write(guest::LOAD_ADDR, &guest::program(guest::BANNER))?;
    vm.add_mem_region(0, ram, false)?;

    let vcpu = vm.add_vcpu(0)?;

    let mut sregs = vcpu.get_sregs()?;
    sregs.cs.base = 0;
    sregs.cs.selector = 0;
    vcpu.set_sregs(&sregs)?;

    let mut regs = vcpu.get_regs()?;
    regs.rip = guest::LOAD_ADDR;
    regs.rflags = 0x2;
    vcpu.set_regs(&regs)?;

    if args.single_step {
        vcpu.enable_single_step()?;
    }

    info!("Starting vCPU {}...", vcpu.id());
    let mut stdout = std::io::stdout();
    let mut exits = 0u64;
    loop {
        if exits == args.max_exits {
            warn!("Stopping after {exits} exits");
            break;
        }
        exits += 1;

        let exit = vcpu.run()?;
        trace!("{exit}");
        match exit.reason {
            ExitReason::Io(io) if io.port() == guest::SERIAL_PORT && io.is_write() => {
                stdout.write_all(io.data()?)?;
                stdout.flush()?;
            }
            ExitReason::Io(io) => {
                info!("Unhandled {}", ExitReason::Io(io));
            }
            ExitReason::Debug(debug) => {
                info!("Single step: rip={:#x}", debug.pc);
            }
            ExitReason::Interrupted => {}
            ExitReason::Hlt => {
                info!("Guest halted after {exits} exits");
                break;
            }
            other => {
                warn!("Stopping on unexpected exit: {other}");
                let regs = vcpu.get_regs()?;
                warn!("Final RIP: {:#x}", regs.rip);
                break;
            }
        }
    }

    Ok(())
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
fn run(_args: Args) -> Result<(), Box<dyn Error>> {
    Err("kvmbind requires x86-64 Linux with KVM support. This platform is not supported.".into())
}
