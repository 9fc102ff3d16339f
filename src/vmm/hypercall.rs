//! Guest-to-host hypercall interface
//!
//! ABI: the guest puts the call number in `x0`, a single argument in `x1`,
//! and executes `hvc #0`. The backend has already stepped PC past the HVC
//! when the exit is reported, so no PC adjustment happens here.

use tracing::{debug, error, warn};

use crate::devices::console::OutputSink;
use crate::vmm::memory::GuestMemoryRegion;

/// Guest requests termination of the calling vCPU.
pub const HYPERCALL_EXIT: u64 = 0;
/// Print the low byte of the argument.
pub const HYPERCALL_PUTCHAR: u64 = 1;
/// Print the NUL-terminated string at the guest-physical address in the argument.
pub const HYPERCALL_PUTS: u64 = 2;

/// A decoded hypercall
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hypercall {
    Exit,
    Putchar(u8),
    Puts { gpa: u64 },
}

impl Hypercall {
    /// Decode a call number and argument. `None` for unknown numbers.
    pub fn decode(number: u64, arg: u64) -> Option<Self> {
        match number {
            HYPERCALL_EXIT => Some(Hypercall::Exit),
            HYPERCALL_PUTCHAR => Some(Hypercall::Putchar(arg as u8)),
            HYPERCALL_PUTS => Some(Hypercall::Puts { gpa: arg }),
            _ => None,
        }
    }
}

/// What the runner should do after a hypercall
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypercallOutcome {
    Continue,
    StopThisCpu,
    /// Unrecognized call number; logged, and the guest continues.
    UnknownLogged,
}

/// Performs hypercall side effects for one vCPU
#[derive(Debug, Clone)]
pub struct HypercallDispatcher<'a> {
    memory: &'a GuestMemoryRegion,
    sink: OutputSink,
    vcpu_index: usize,
}

impl<'a> HypercallDispatcher<'a> {
    pub fn new(memory: &'a GuestMemoryRegion, sink: OutputSink, vcpu_index: usize) -> Self {
        Self {
            memory,
            sink,
            vcpu_index,
        }
    }

    /// Perform the call `number(arg)`. `pc` is only used for logging.
    pub fn dispatch(&self, number: u64, arg: u64, pc: u64) -> HypercallOutcome {
        let Some(call) = Hypercall::decode(number, arg) else {
            warn!(
                "vCPU {}: unknown hypercall {} at PC={:#x}",
                self.vcpu_index, number, pc
            );
            return HypercallOutcome::UnknownLogged;
        };

        match call {
            Hypercall::Exit => {
                debug!("vCPU {}: guest requested exit", self.vcpu_index);
                HypercallOutcome::StopThisCpu
            }
            Hypercall::Putchar(byte) => {
                self.emit(&[byte]);
                HypercallOutcome::Continue
            }
            Hypercall::Puts { gpa } => {
                match self.memory.read_c_string(gpa) {
                    Some(bytes) => self.emit(&bytes),
                    None => debug!(
                        "vCPU {}: PUTS address {:#x} outside guest memory, ignored",
                        self.vcpu_index, gpa
                    ),
                }
                HypercallOutcome::Continue
            }
        }
    }

    fn emit(&self, bytes: &[u8]) {
        if let Err(e) = self.sink.write(bytes) {
            error!("vCPU {}: console write failed: {}", self.vcpu_index, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmm::memory::page_size;

    fn fixture() -> (GuestMemoryRegion, OutputSink, crate::devices::console::CapturedOutput) {
        let memory = GuestMemoryRegion::allocate(page_size() * 2).unwrap();
        let (sink, out) = OutputSink::capture();
        (memory, sink, out)
    }

    #[test]
    fn test_decode() {
        assert_eq!(Hypercall::decode(0, 99), Some(Hypercall::Exit));
        assert_eq!(Hypercall::decode(1, 0x1_41), Some(Hypercall::Putchar(0x41)));
        assert_eq!(
            Hypercall::decode(2, 0x800),
            Some(Hypercall::Puts { gpa: 0x800 })
        );
        assert_eq!(Hypercall::decode(3, 0), None);
        assert_eq!(Hypercall::decode(u64::MAX, 0), None);
    }

    #[test]
    fn test_putchar_sequence() {
        let (memory, sink, out) = fixture();
        let dispatcher = HypercallDispatcher::new(&memory, sink, 0);
        for &c in b"Hi!" {
            assert_eq!(
                dispatcher.dispatch(HYPERCALL_PUTCHAR, 0xff00 | c as u64, 0),
                HypercallOutcome::Continue
            );
        }
        assert_eq!(out.to_string_lossy(), "Hi!");
    }

    #[test]
    fn test_puts() {
        let (memory, sink, out) = fixture();
        memory.write(0x100, b"hello\0world\0").unwrap();
        let dispatcher = HypercallDispatcher::new(&memory, sink, 0);

        assert_eq!(
            dispatcher.dispatch(HYPERCALL_PUTS, 0x100, 0),
            HypercallOutcome::Continue
        );
        assert_eq!(out.to_string_lossy(), "hello");
    }

    #[test]
    fn test_puts_out_of_range_is_noop() {
        let (memory, sink, out) = fixture();
        let dispatcher = HypercallDispatcher::new(&memory, sink, 0);
        let len = memory.len() as u64;

        assert_eq!(
            dispatcher.dispatch(HYPERCALL_PUTS, len, 0),
            HypercallOutcome::Continue
        );
        assert_eq!(
            dispatcher.dispatch(HYPERCALL_PUTS, u64::MAX, 0),
            HypercallOutcome::Continue
        );
        assert!(out.bytes().is_empty());
    }

    #[test]
    fn test_exit_and_unknown() {
        let (memory, sink, out) = fixture();
        let dispatcher = HypercallDispatcher::new(&memory, sink, 1);
        assert_eq!(
            dispatcher.dispatch(HYPERCALL_EXIT, 0, 0x1_0000),
            HypercallOutcome::StopThisCpu
        );
        assert_eq!(
            dispatcher.dispatch(42, 0, 0x1_0000),
            HypercallOutcome::UnknownLogged
        );
        assert!(out.bytes().is_empty());
    }
}
