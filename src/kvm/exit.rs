//! Decoding of VM exits.
//!
//! After `KVM_RUN` returns, `kvm_run.exit_reason` selects which member of the
//! exit union is live. [`decode`] looks the discriminant up in a fixed table
//! of per-reason decoders and produces an [`ExitReason`]:
//!
//! ```text
//! exit_reason ──► DECODERS[exit_reason] ──► ExitReason
//!                   │
//!                   └─ None / out of range ──► KvmError::UnknownExitReason
//! ```
//!
//! Only an I/O exit keeps a view into the run page: its data window is
//! borrowed for as long as the exit lives, which in turn keeps the vCPU
//! borrowed. Every other payload is copied out.

use super::abi::exit_code::*;
use super::abi::{
    KVM_EXIT_IO_OUT, KVM_INTERNAL_ERROR_DELIVERY_EV, KVM_INTERNAL_ERROR_EMULATION,
    KVM_INTERNAL_ERROR_MAX_DATA, KVM_INTERNAL_ERROR_SIMUL_EX,
};
use super::vcpu::RunPage;
use super::{KvmError, Result};
use log::trace;
use std::fmt;
use std::time::Duration;

/// Number of exit discriminants this binding knows by name.
const EXIT_REASON_COUNT: usize = 25;

static EXIT_REASON_NAMES: [&str; EXIT_REASON_COUNT] = [
    "KVM_EXIT_UNKNOWN",
    "KVM_EXIT_EXCEPTION",
    "KVM_EXIT_IO",
    "KVM_EXIT_HYPERCALL",
    "KVM_EXIT_DEBUG",
    "KVM_EXIT_HLT",
    "KVM_EXIT_MMIO",
    "KVM_EXIT_IRQ_WINDOW_OPEN",
    "KVM_EXIT_SHUTDOWN",
    "KVM_EXIT_FAIL_ENTRY",
    "KVM_EXIT_INTR",
    "KVM_EXIT_SET_TPR",
    "KVM_EXIT_TPR_ACCESS",
    "KVM_EXIT_S390_SIEIC",
    "KVM_EXIT_S390_RESET",
    "KVM_EXIT_DCR",
    "KVM_EXIT_NMI",
    "KVM_EXIT_INTERNAL_ERROR",
    "KVM_EXIT_OSI",
    "KVM_EXIT_PAPR_HCALL",
    "KVM_EXIT_S390_UCONTROL",
    "KVM_EXIT_WATCHDOG",
    "KVM_EXIT_S390_TSCH",
    "KVM_EXIT_EPR",
    "KVM_EXIT_SYSTEM_EVENT",
];

/// Kernel name of an exit discriminant, if it is one this binding knows.
pub fn exit_reason_name(code: u32) -> Option<&'static str> {
    EXIT_REASON_NAMES.get(code as usize).copied()
}

/// Direction of a port I/O access, seen from the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    /// Guest executed IN: it expects data.
    In,
    /// Guest executed OUT: it supplied data.
    Out,
}

impl fmt::Display for IoDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::In => f.write_str("in"),
            Self::Out => f.write_str("out"),
        }
    }
}

/// A port I/O exit.
///
/// `data` is the live window into the run page at `data_offset`, `size`
/// bytes long. For OUT it holds what the guest wrote; for IN whatever is
/// stored there is what the guest reads on the next run.
#[derive(Debug)]
pub struct IoExit<'a> {
    direction: IoDirection,
    size: u8,
    port: u16,
    count: u32,
    data: &'a mut [u8],
}

impl<'a> IoExit<'a> {
    pub fn direction(&self) -> IoDirection {
        self.direction
    }

    /// Access width in bytes (1, 2 or 4).
    pub fn size(&self) -> u8 {
        self.size
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Repeat count of a string instruction; 1 otherwise.
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_write(&self) -> bool {
        self.direction == IoDirection::Out
    }

    /// The bytes the guest wrote.
    ///
    /// Fails with [`KvmError::NotWritable`] on an IN exit.
    pub fn data(&self) -> Result<&[u8]> {
        match self.direction {
            IoDirection::Out => Ok(self.data),
            IoDirection::In => Err(KvmError::NotWritable { port: self.port }),
        }
    }

    /// Store the bytes the guest will read.
    ///
    /// Fails with [`KvmError::NotReadable`] on an OUT exit, or
    /// [`KvmError::SizeMismatch`] when `bytes` is not exactly `size` long.
    pub fn set_data(&mut self, bytes: &[u8]) -> Result<()> {
        if self.direction == IoDirection::Out {
            return Err(KvmError::NotReadable { port: self.port });
        }
        if bytes.len() != self.data.len() {
            return Err(KvmError::SizeMismatch {
                expected: self.data.len(),
                actual: bytes.len(),
            });
        }
        self.data.copy_from_slice(bytes);
        Ok(())
    }
}

/// An MMIO exit. The payload is a copy; answer a read with
/// [`Vcpu::complete_mmio_read`](super::Vcpu::complete_mmio_read).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioExit {
    pub phys_addr: u64,
    pub data: [u8; 8],
    pub len: u32,
    pub is_write: bool,
}

impl MmioExit {
    /// The meaningful prefix of `data`.
    pub fn data(&self) -> &[u8] {
        &self.data[..(self.len as usize).min(self.data.len())]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hypercall {
    pub nr: u64,
    pub args: [u64; 6],
    pub ret: u64,
    pub longmode: bool,
}

/// Debug trap (single-step, breakpoint, watchpoint).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugExit {
    pub exception: u32,
    pub pc: u64,
    pub dr6: u64,
    pub dr7: u64,
}

/// Category of a `KVM_EXIT_INTERNAL_ERROR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalErrorCause {
    Emulation,
    SimultaneousException,
    DeliveryEvent,
    Other(u32),
}

impl From<u32> for InternalErrorCause {
    fn from(suberror: u32) -> Self {
        match suberror {
            KVM_INTERNAL_ERROR_EMULATION => Self::Emulation,
            KVM_INTERNAL_ERROR_SIMUL_EX => Self::SimultaneousException,
            KVM_INTERNAL_ERROR_DELIVERY_EV => Self::DeliveryEvent,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for InternalErrorCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Emulation => f.write_str("emulation failure"),
            Self::SimultaneousException => f.write_str("simultaneous exception"),
            Self::DeliveryEvent => f.write_str("event delivery failure"),
            Self::Other(code) => write!(f, "suberror {code:#x}"),
        }
    }
}

/// A `KVM_EXIT_INTERNAL_ERROR` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InternalError {
    pub suberror: u32,
    ndata: usize,
    raw: [u64; KVM_INTERNAL_ERROR_MAX_DATA],
}

impl InternalError {
    pub fn cause(&self) -> InternalErrorCause {
        InternalErrorCause::from(self.suberror)
    }

    /// The diagnostic words reported by the kernel.
    pub fn data(&self) -> &[u64] {
        &self.raw[..self.ndata]
    }
}

/// Why the vCPU left the guest.
#[derive(Debug)]
pub enum ExitReason<'a> {
    Unknown { hardware_exit_reason: u64 },
    Exception { exception: u32, error_code: u32 },
    Io(IoExit<'a>),
    Hypercall(Hypercall),
    Debug(DebugExit),
    Hlt,
    Mmio(MmioExit),
    IrqWindowOpen,
    Shutdown,
    FailEntry {
        hardware_entry_failure_reason: u64,
        cpu: u32,
    },
    /// A signal interrupted `KVM_RUN`.
    Interrupted,
    SetTpr,
    TprAccess { rip: u64, is_write: bool },
    Nmi,
    InternalError(InternalError),
    SystemEvent { kind: u32, flags: u64 },
}

impl ExitReason<'_> {
    /// The kernel discriminant this reason was decoded from.
    pub fn code(&self) -> u32 {
        match self {
            Self::Unknown { .. } => KVM_EXIT_UNKNOWN,
            Self::Exception { .. } => KVM_EXIT_EXCEPTION,
            Self::Io(_) => KVM_EXIT_IO,
            Self::Hypercall(_) => KVM_EXIT_HYPERCALL,
            Self::Debug(_) => KVM_EXIT_DEBUG,
            Self::Hlt => KVM_EXIT_HLT,
            Self::Mmio(_) => KVM_EXIT_MMIO,
            Self::IrqWindowOpen => KVM_EXIT_IRQ_WINDOW_OPEN,
            Self::Shutdown => KVM_EXIT_SHUTDOWN,
            Self::FailEntry { .. } => KVM_EXIT_FAIL_ENTRY,
            Self::Interrupted => KVM_EXIT_INTR,
            Self::SetTpr => KVM_EXIT_SET_TPR,
            Self::TprAccess { .. } => KVM_EXIT_TPR_ACCESS,
            Self::Nmi => KVM_EXIT_NMI,
            Self::InternalError(_) => KVM_EXIT_INTERNAL_ERROR,
            Self::SystemEvent { .. } => KVM_EXIT_SYSTEM_EVENT,
        }
    }

    pub fn name(&self) -> &'static str {
        exit_reason_name(self.code()).unwrap_or("KVM_EXIT_UNKNOWN")
    }
}

impl fmt::Display for ExitReason<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown {
                hardware_exit_reason,
            } => write!(f, "Unknown reason. Hardware reason: {hardware_exit_reason:#x}"),
            Self::Exception {
                exception,
                error_code,
            } => write!(f, "Exception {exception:#x}, error code {error_code:#x}"),
            Self::Io(io) => write!(
                f,
                "I/O: {} port {:#x} ({} bytes x {})",
                io.direction, io.port, io.size, io.count
            ),
            Self::Hypercall(h) => write!(f, "Hypercall {:#x}", h.nr),
            Self::Debug(d) => write!(f, "Debug exception {:#x} at {:#x}", d.exception, d.pc),
            Self::Hlt => f.write_str("Halted"),
            Self::Mmio(m) => write!(
                f,
                "MMIO: {} {:#x} ({} bytes)",
                if m.is_write { "write to" } else { "read from" },
                m.phys_addr,
                m.len
            ),
            Self::IrqWindowOpen => f.write_str("Interrupt window open"),
            Self::Shutdown => f.write_str("Shutdown"),
            Self::FailEntry {
                hardware_entry_failure_reason,
                cpu,
            } => write!(
                f,
                "Entry failure on cpu {cpu}. Hardware reason: {hardware_entry_failure_reason:#x}"
            ),
            Self::Interrupted => f.write_str("Interrupted by signal"),
            Self::SetTpr => f.write_str("Set TPR"),
            Self::TprAccess { rip, is_write } => write!(
                f,
                "TPR {} at {rip:#x}",
                if *is_write { "write" } else { "read" }
            ),
            Self::Nmi => f.write_str("NMI"),
            Self::InternalError(e) => write!(
                f,
                "Internal error: {} ({} data words)",
                e.cause(),
                e.ndata
            ),
            Self::SystemEvent { kind, flags } => {
                write!(f, "System event {kind} (flags {flags:#x})")
            }
        }
    }
}

/// The result of one `run()`: why the guest stopped, and how long it ran.
#[derive(Debug)]
pub struct VcpuExit<'a> {
    pub reason: ExitReason<'a>,
    /// Wall time spent inside `KVM_RUN`.
    pub elapsed: Duration,
}

impl fmt::Display for VcpuExit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "KVM exit (dt = {:.3} ms): {}",
            self.elapsed.as_secs_f64() * 1000.0,
            self.reason
        )
    }
}

type DecodeFn = for<'a> fn(&'a mut RunPage) -> Result<ExitReason<'a>>;

static DECODERS: [Option<DecodeFn>; EXIT_REASON_COUNT] = {
    let mut table: [Option<DecodeFn>; EXIT_REASON_COUNT] = [None; EXIT_REASON_COUNT];
    table[KVM_EXIT_UNKNOWN as usize] = Some(decode_unknown as DecodeFn);
    table[KVM_EXIT_EXCEPTION as usize] = Some(decode_exception as DecodeFn);
    table[KVM_EXIT_IO as usize] = Some(decode_io as DecodeFn);
    table[KVM_EXIT_HYPERCALL as usize] = Some(decode_hypercall as DecodeFn);
    table[KVM_EXIT_DEBUG as usize] = Some(decode_debug as DecodeFn);
    table[KVM_EXIT_HLT as usize] = Some(decode_hlt as DecodeFn);
    table[KVM_EXIT_MMIO as usize] = Some(decode_mmio as DecodeFn);
    table[KVM_EXIT_IRQ_WINDOW_OPEN as usize] = Some(decode_irq_window_open as DecodeFn);
    table[KVM_EXIT_SHUTDOWN as usize] = Some(decode_shutdown as DecodeFn);
    table[KVM_EXIT_FAIL_ENTRY as usize] = Some(decode_fail_entry as DecodeFn);
    table[KVM_EXIT_INTR as usize] = Some(decode_intr as DecodeFn);
    table[KVM_EXIT_SET_TPR as usize] = Some(decode_set_tpr as DecodeFn);
    table[KVM_EXIT_TPR_ACCESS as usize] = Some(decode_tpr_access as DecodeFn);
    table[KVM_EXIT_NMI as usize] = Some(decode_nmi as DecodeFn);
    table[KVM_EXIT_INTERNAL_ERROR as usize] = Some(decode_internal_error as DecodeFn);
    table[KVM_EXIT_SYSTEM_EVENT as usize] = Some(decode_system_event as DecodeFn);
    table
};

/// Decode the exit currently recorded in `page`.
///
/// # Errors
///
/// - [`KvmError::UnknownExitReason`] for a discriminant with no decoder
/// - [`KvmError::IoWindowOutOfBounds`] for an I/O exit whose data window
///   does not fit in the page
pub fn decode(page: &mut RunPage, elapsed: Duration) -> Result<VcpuExit<'_>> {
    let code = page.run().exit_reason;
    let decoder = DECODERS
        .get(code as usize)
        .copied()
        .flatten()
        .ok_or(KvmError::UnknownExitReason { code })?;

    trace!(
        "{} after {:?}",
        exit_reason_name(code).unwrap_or("?"),
        elapsed
    );
    let reason = decoder(page)?;
    Ok(VcpuExit { reason, elapsed })
}

// SAFETY (all decoders): each reads only the union member selected by the
// discriminant it is registered under. Every member is plain integers, so
// any bit pattern is a valid value.

fn decode_unknown(page: &mut RunPage) -> Result<ExitReason<'_>> {
    let hw = unsafe { page.run().exit.hw };
    Ok(ExitReason::Unknown {
        hardware_exit_reason: hw.hardware_exit_reason,
    })
}

fn decode_exception(page: &mut RunPage) -> Result<ExitReason<'_>> {
    let ex = unsafe { page.run().exit.ex };
    Ok(ExitReason::Exception {
        exception: ex.exception,
        error_code: ex.error_code,
    })
}

fn decode_io(page: &mut RunPage) -> Result<ExitReason<'_>> {
    let io = unsafe { page.run().exit.io };
    let direction = if io.direction == KVM_EXIT_IO_OUT {
        IoDirection::Out
    } else {
        IoDirection::In
    };
    let len = usize::from(io.size);
    let page_len = page.len();
    let out_of_bounds = KvmError::IoWindowOutOfBounds {
        offset: io.data_offset,
        len,
        page_len,
    };
    let Ok(offset) = usize::try_from(io.data_offset) else {
        return Err(out_of_bounds);
    };
    let data = page.bytes_mut(offset, len).ok_or(out_of_bounds)?;

    Ok(ExitReason::Io(IoExit {
        direction,
        size: io.size,
        port: io.port,
        count: io.count,
        data,
    }))
}

fn decode_hypercall(page: &mut RunPage) -> Result<ExitReason<'_>> {
    let h = unsafe { page.run().exit.hypercall };
    Ok(ExitReason::Hypercall(Hypercall {
        nr: h.nr,
        args: h.args,
        ret: h.ret,
        longmode: h.longmode != 0,
    }))
}

fn decode_debug(page: &mut RunPage) -> Result<ExitReason<'_>> {
    let d = unsafe { page.run().exit.debug };
    Ok(ExitReason::Debug(DebugExit {
        exception: d.exception,
        pc: d.pc,
        dr6: d.dr6,
        dr7: d.dr7,
    }))
}

fn decode_hlt(_: &mut RunPage) -> Result<ExitReason<'_>> {
    Ok(ExitReason::Hlt)
}

fn decode_mmio(page: &mut RunPage) -> Result<ExitReason<'_>> {
    let m = unsafe { page.run().exit.mmio };
    Ok(ExitReason::Mmio(MmioExit {
        phys_addr: m.phys_addr,
        data: m.data,
        len: m.len,
        is_write: m.is_write != 0,
    }))
}

fn decode_irq_window_open(_: &mut RunPage) -> Result<ExitReason<'_>> {
    Ok(ExitReason::IrqWindowOpen)
}

fn decode_shutdown(_: &mut RunPage) -> Result<ExitReason<'_>> {
    Ok(ExitReason::Shutdown)
}

fn decode_fail_entry(page: &mut RunPage) -> Result<ExitReason<'_>> {
    let fe = unsafe { page.run().exit.fail_entry };
    Ok(ExitReason::FailEntry {
        hardware_entry_failure_reason: fe.hardware_entry_failure_reason,
        cpu: fe.cpu,
    })
}

fn decode_intr(_: &mut RunPage) -> Result<ExitReason<'_>> {
    Ok(ExitReason::Interrupted)
}

fn decode_set_tpr(_: &mut RunPage) -> Result<ExitReason<'_>> {
    Ok(ExitReason::SetTpr)
}

fn decode_tpr_access(page: &mut RunPage) -> Result<ExitReason<'_>> {
    let t = unsafe { page.run().exit.tpr_access };
    Ok(ExitReason::TprAccess {
        rip: t.rip,
        is_write: t.is_write != 0,
    })
}

fn decode_nmi(_: &mut RunPage) -> Result<ExitReason<'_>> {
    Ok(ExitReason::Nmi)
}

fn decode_internal_error(page: &mut RunPage) -> Result<ExitReason<'_>> {
    let e = unsafe { page.run().exit.internal };
    Ok(ExitReason::InternalError(InternalError {
        suberror: e.suberror,
        ndata: (e.ndata as usize).min(KVM_INTERNAL_ERROR_MAX_DATA),
        raw: e.data,
    }))
}

fn decode_system_event(page: &mut RunPage) -> Result<ExitReason<'_>> {
    let s = unsafe { page.run().exit.system_event };
    Ok(ExitReason::SystemEvent {
        kind: s.type_,
        flags: s.data[0],
    })
}
