//! VM exit classification
//!
//! Turns the raw exit record of one backend run into exactly one
//! [`ExitEvent`]. Exception exits are decoded from the exception class (EC)
//! field of the syndrome register.

use std::fmt;

use crate::backend::{ExitReason, RawExit, Reg, VcpuBackend};
use crate::Result;

/// Bit position of the EC field in ESR_EL2.
pub const ESR_EC_SHIFT: u32 = 26;
/// Width mask of the EC field.
pub const ESR_EC_MASK: u64 = 0x3f;

/// Unknown reason (undefined instruction and friends).
pub const EC_UNKNOWN: u8 = 0x00;
/// HVC instruction executed in AArch64 state.
pub const EC_HVC64: u8 = 0x16;
/// MSR/MRS or system instruction trapped from AArch64 state.
pub const EC_SYS64: u8 = 0x18;
/// Instruction abort from a lower exception level.
pub const EC_IABORT_LOWER: u8 = 0x20;
/// Data abort from a lower exception level.
pub const EC_DABORT_LOWER: u8 = 0x24;

/// Register holding the hypercall number.
pub const HYPERCALL_NUMBER_REG: Reg = Reg::X0;
/// Register holding the hypercall argument.
pub const HYPERCALL_ARG_REG: Reg = Reg::X1;

/// Extract the exception class from a syndrome value.
pub const fn exception_class(syndrome: u64) -> u8 {
    ((syndrome >> ESR_EC_SHIFT) & ESR_EC_MASK) as u8
}

/// Whether a memory fault came from fetching an instruction or accessing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Instruction,
    Data,
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessKind::Instruction => f.write_str("instruction"),
            AccessKind::Data => f.write_str("data"),
        }
    }
}

/// A classified VM exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitEvent {
    /// Guest executed HVC; the call number and argument are already read.
    Hypercall { number: u64, arg: u64 },
    /// Guest touched a trapped system register. `pc` is the trapping instruction.
    TrappedSystemAccess { pc: u64 },
    /// Instruction or data abort.
    MemoryFault {
        pc: u64,
        fault_address: u64,
        access: AccessKind,
    },
    /// The backend canceled the run.
    Canceled,
    /// The virtual timer fired.
    TimerTick,
    /// Anything else: an unrecognized exception class or exit reason.
    Unhandled { reason: u32, syndrome: u64, pc: u64 },
}

/// Classify the exit just returned by `vcpu`'s run call.
///
/// Registers are read only when the event needs them.
pub fn classify<V: VcpuBackend>(vcpu: &V, exit: &RawExit) -> Result<ExitEvent> {
    let event = match exit.reason {
        ExitReason::EXCEPTION => match exception_class(exit.syndrome) {
            EC_HVC64 => ExitEvent::Hypercall {
                number: vcpu.get_reg(HYPERCALL_NUMBER_REG)?,
                arg: vcpu.get_reg(HYPERCALL_ARG_REG)?,
            },
            EC_SYS64 => ExitEvent::TrappedSystemAccess {
                pc: vcpu.get_reg(Reg::PC)?,
            },
            EC_IABORT_LOWER => ExitEvent::MemoryFault {
                pc: vcpu.get_reg(Reg::PC)?,
                fault_address: exit.virtual_address,
                access: AccessKind::Instruction,
            },
            EC_DABORT_LOWER => ExitEvent::MemoryFault {
                pc: vcpu.get_reg(Reg::PC)?,
                fault_address: exit.virtual_address,
                access: AccessKind::Data,
            },
            _ => ExitEvent::Unhandled {
                reason: exit.reason.0,
                syndrome: exit.syndrome,
                pc: vcpu.get_reg(Reg::PC)?,
            },
        },
        ExitReason::CANCELED => ExitEvent::Canceled,
        ExitReason::VTIMER_ACTIVATED => ExitEvent::TimerTick,
        ExitReason(reason) => ExitEvent::Unhandled {
            reason,
            syndrome: 0,
            pc: vcpu.get_reg(Reg::PC)?,
        },
    };
    Ok(event)
}
