//! Backend abstraction for hardware-assisted virtualization.
//!
//! This module defines the [`Hypervisor`] and [`VcpuBackend`] traits the
//! VMM core drives. They capture the fixed backend surface: VM instance
//! creation, guest memory mapping, vCPU creation, register access and the
//! blocking run primitive.
//!
//! Backends:
//! - **macOS / Apple Silicon**: `hvf::HvfHypervisor`, Hypervisor.framework
//! - **Any host**: [`EmulatedHypervisor`](emulated::EmulatedHypervisor), a small AArch64 interpreter

pub mod emulated;

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
pub mod hvf;

use std::fmt;

use crate::{Error, Result};

const ERR_COMMON_HYPERVISOR: i32 = 0xfae9_4000_u32 as i32;

/// Status code returned by a backend call.
///
/// Uses the Hypervisor.framework code space so every backend reports
/// failures the same way.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct HvReturn(pub i32);

impl HvReturn {
    pub const SUCCESS: Self = Self(0);
    pub const ERROR: Self = Self(ERR_COMMON_HYPERVISOR | 0x1);
    pub const BUSY: Self = Self(ERR_COMMON_HYPERVISOR | 0x2);
    pub const BAD_ARGUMENT: Self = Self(ERR_COMMON_HYPERVISOR | 0x3);
    pub const NO_RESOURCES: Self = Self(ERR_COMMON_HYPERVISOR | 0x5);
    pub const NO_DEVICE: Self = Self(ERR_COMMON_HYPERVISOR | 0x6);
    pub const DENIED: Self = Self(ERR_COMMON_HYPERVISOR | 0x7);
    pub const UNSUPPORTED: Self = Self(ERR_COMMON_HYPERVISOR | 0xf);

    /// Turn the status of `call` into a `Result`.
    pub fn check(self, call: &'static str) -> Result<()> {
        if self == Self::SUCCESS {
            Ok(())
        } else {
            Err(Error::backend(call, self))
        }
    }
}

impl fmt::Display for HvReturn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::SUCCESS => "success",
            Self::ERROR => "error",
            Self::BUSY => "busy",
            Self::BAD_ARGUMENT => "bad argument",
            Self::NO_RESOURCES => "no resources",
            Self::NO_DEVICE => "no device",
            Self::DENIED => "denied (missing hypervisor entitlement?)",
            Self::UNSUPPORTED => "unsupported",
            _ => return write!(f, "unknown status {:#x}", self.0 as u32),
        };
        f.pad(s)
    }
}

impl fmt::Debug for HvReturn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HvReturn({:#x}: {})", self.0 as u32, self)
    }
}

/// Why the backend returned from [`VcpuBackend::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct ExitReason(pub u32);

impl ExitReason {
    pub const CANCELED: Self = Self(0);
    pub const EXCEPTION: Self = Self(1);
    pub const VTIMER_ACTIVATED: Self = Self(2);
    pub const UNKNOWN: Self = Self(3);
}

/// Exit information copied out of the backend after each run.
///
/// `syndrome` and `virtual_address` are only meaningful when `reason` is
/// [`ExitReason::EXCEPTION`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawExit {
    pub reason: ExitReason,
    pub syndrome: u64,
    pub virtual_address: u64,
}

impl RawExit {
    /// Exit with no exception payload.
    pub fn new(reason: ExitReason) -> Self {
        Self {
            reason,
            syndrome: 0,
            virtual_address: 0,
        }
    }

    /// Exception exit carrying a syndrome and fault address.
    pub fn exception(syndrome: u64, fault_address: u64) -> Self {
        Self {
            reason: ExitReason::EXCEPTION,
            syndrome,
            virtual_address: fault_address,
        }
    }
}

/// General-purpose and special register identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Reg(pub u32);

impl Reg {
    pub const X0: Self = Self(0);
    pub const X1: Self = Self(1);
    pub const PC: Self = Self(31);
    pub const CPSR: Self = Self(34);

    /// Number of general-purpose registers (`x0` through `x30`).
    pub const GPR_COUNT: u32 = 31;

    /// Iterator over `x0..=x30`.
    pub fn gprs() -> impl Iterator<Item = Reg> {
        (0..Self::GPR_COUNT).map(Reg)
    }
}

/// System register identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct SysReg(pub u16);

impl SysReg {
    pub const SP_EL1: Self = Self(0xe208);
}

/// Guest mapping permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct MemoryPermissions(pub u64);

impl MemoryPermissions {
    pub const READ: Self = Self(1 << 0);
    pub const WRITE: Self = Self(1 << 1);
    pub const EXEC: Self = Self(1 << 2);
    pub const RWX: Self = Self(Self::READ.0 | Self::WRITE.0 | Self::EXEC.0);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// A hardware-virtualization backend.
///
/// The backend owns at most one VM instance. Implementations must be
/// shareable across the threads that run vCPUs.
pub trait Hypervisor: Send + Sync {
    /// vCPU handle type. Handles are bound to the thread that created them.
    type Vcpu: VcpuBackend;

    /// Create the VM instance.
    fn create_vm(&self) -> Result<()>;

    /// Map `len` bytes of host memory at guest-physical address `gpa`.
    ///
    /// # Safety
    ///
    /// `host` must point to `len` bytes that stay valid and unmoved until
    /// the matching [`Hypervisor::unmap`] call returns.
    unsafe fn map(
        &self,
        host: *mut u8,
        gpa: u64,
        len: usize,
        perms: MemoryPermissions,
    ) -> Result<()>;

    /// Remove the mapping at `gpa`.
    fn unmap(&self, gpa: u64, len: usize) -> Result<()>;

    /// Destroy the VM instance. Every vCPU must be destroyed first.
    fn destroy_vm(&self) -> Result<()>;

    /// Create a vCPU on the calling thread. The returned handle must only be
    /// used, and dropped, on this thread.
    fn create_vcpu(&self) -> Result<Self::Vcpu>;
}

/// A backend vCPU handle. Dropping it destroys the backend vCPU.
pub trait VcpuBackend {
    fn get_reg(&self, reg: Reg) -> Result<u64>;
    fn set_reg(&self, reg: Reg, value: u64) -> Result<()>;
    fn get_sys_reg(&self, reg: SysReg) -> Result<u64>;
    fn set_sys_reg(&self, reg: SysReg, value: u64) -> Result<()>;

    /// Run the vCPU until the next VM exit.
    ///
    /// An `Err` means the run call itself failed, independent of guest
    /// behavior.
    fn run(&mut self) -> Result<RawExit>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_check() {
        assert!(HvReturn::SUCCESS.check("hv_vm_create").is_ok());
        let err = HvReturn::NO_RESOURCES.check("hv_vm_map").unwrap_err();
        assert!(matches!(
            err,
            Error::Backend {
                call: "hv_vm_map",
                status: HvReturn::NO_RESOURCES
            }
        ));
    }

    #[test]
    fn test_unknown_status_display() {
        assert_eq!(HvReturn(0x1234).to_string(), "unknown status 0x1234");
    }

    #[test]
    fn test_gpr_range() {
        let gprs: Vec<Reg> = Reg::gprs().collect();
        assert_eq!(gprs.len(), 31);
        assert_eq!(gprs[0], Reg::X0);
        assert!(!gprs.contains(&Reg::PC));
    }

    #[test]
    fn test_permissions() {
        assert!(MemoryPermissions::RWX.contains(MemoryPermissions::WRITE));
        assert!(!MemoryPermissions::READ.contains(MemoryPermissions::EXEC));
        assert!(!MemoryPermissions::READ.contains(MemoryPermissions::RWX));
    }
}
