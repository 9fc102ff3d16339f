//! vCPU lifecycle and configuration
//!
//! A [`Vcpu`] moves through `Created → Configured → Running → Exited →
//! Destroyed`, never skipping or revisiting a state. Backend handles are
//! thread-bound, so a `Vcpu` is created, run and destroyed on one thread.

use std::fmt;

use tracing::debug;

use crate::backend::{HvReturn, Hypervisor, Reg, SysReg, VcpuBackend};
use crate::vmm::exit::AccessKind;
use crate::{Error, Result};

/// Processor state at entry: EL1h with D, A, I and F masked.
pub const INITIAL_CPSR: u64 = 0x3c5;

/// Register the guest reads its VM identifier from.
pub const VM_ID_REG: Reg = Reg::X0;
/// Register the guest reads its core index from.
pub const CORE_INDEX_REG: Reg = Reg::X1;

/// Stack pointer register selected by [`INITIAL_CPSR`].
pub const STACK_POINTER_REG: SysReg = SysReg::SP_EL1;

/// Initial register values for one vCPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VcpuSetup {
    pub entry_pc: u64,
    pub stack_pointer: u64,
    pub vm_id: u64,
    pub core_index: u64,
}

/// What went wrong in a faulting guest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Instruction or data abort
    Abort(AccessKind),
    /// Exception class with no handler
    UnhandledException { class: u8, syndrome: u64 },
    /// Exit reason the backend documents no meaning for
    UnknownExit { reason: u32 },
}

/// A fatal guest fault, with the context available at the exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestFault {
    pub kind: FaultKind,
    pub pc: u64,
    pub fault_address: Option<u64>,
}

impl fmt::Display for GuestFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FaultKind::Abort(access) => write!(f, "{} abort at PC={:#x}", access, self.pc)?,
            FaultKind::UnhandledException { class, syndrome } => write!(
                f,
                "unhandled exception EC={:#x} at PC={:#x} (syndrome={:#x})",
                class, self.pc, syndrome
            )?,
            FaultKind::UnknownExit { reason } => {
                write!(f, "unknown exit reason {} at PC={:#x}", reason, self.pc)?
            }
        }
        if let Some(addr) = self.fault_address {
            write!(f, ", fault address {:#x}", addr)?;
        }
        Ok(())
    }
}

/// Why a vCPU stopped running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCause {
    /// The guest issued the EXIT hypercall
    Success,
    /// The guest faulted
    Fault(GuestFault),
    /// The backend canceled execution
    Canceled,
    /// The backend run call itself failed
    RunFailed(HvReturn),
}

impl fmt::Display for ExitCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitCause::Success => f.write_str("exited"),
            ExitCause::Fault(fault) => write!(f, "guest fault: {}", fault),
            ExitCause::Canceled => f.write_str("canceled"),
            ExitCause::RunFailed(status) => write!(f, "run failed: {}", status),
        }
    }
}

/// Lifecycle state of a vCPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuState {
    Created,
    Configured,
    Running,
    Exited(ExitCause),
    Destroyed,
}

impl VcpuState {
    fn name(&self) -> &'static str {
        match self {
            VcpuState::Created => "Created",
            VcpuState::Configured => "Configured",
            VcpuState::Running => "Running",
            VcpuState::Exited(_) => "Exited",
            VcpuState::Destroyed => "Destroyed",
        }
    }
}

/// A virtual CPU bound to the thread that created it
pub struct Vcpu<V: VcpuBackend> {
    index: usize,
    handle: Option<V>,
    setup: Option<VcpuSetup>,
    state: VcpuState,
}

impl<V: VcpuBackend> Vcpu<V> {
    /// Create the backend vCPU on the calling thread
    pub fn create<H>(hypervisor: &H, index: usize) -> Result<Self>
    where
        H: Hypervisor<Vcpu = V>,
    {
        let handle = hypervisor.create_vcpu()?;
        debug!("Created vCPU {}", index);
        Ok(Self {
            index,
            handle: Some(handle),
            setup: None,
            state: VcpuState::Created,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> VcpuState {
        self.state
    }

    /// Initial register values, once configured
    pub fn setup(&self) -> Option<&VcpuSetup> {
        self.setup.as_ref()
    }

    /// Backend handle. Fails once the handle has been released.
    pub fn handle(&self) -> Result<&V> {
        self.handle.as_ref().ok_or_else(|| released(self.index))
    }

    pub(crate) fn handle_mut(&mut self) -> Result<&mut V> {
        let index = self.index;
        self.handle.as_mut().ok_or_else(|| released(index))
    }

    fn transition(&mut self, allowed: bool, to: VcpuState) -> Result<()> {
        if !allowed {
            return Err(Error::InvalidState {
                index: self.index,
                from: self.state.name(),
                to: to.name(),
            });
        }
        self.state = to;
        Ok(())
    }

    /// Write the initial register file. Only valid once, from `Created`.
    ///
    /// A failing backend call leaves the registers partially written; the
    /// caller discards the vCPU.
    pub fn configure(&mut self, setup: VcpuSetup) -> Result<()> {
        if self.state != VcpuState::Created {
            return self.transition(false, VcpuState::Configured);
        }
        let vcpu = self.handle()?;

        vcpu.set_reg(Reg::PC, setup.entry_pc)?;
        vcpu.set_sys_reg(STACK_POINTER_REG, setup.stack_pointer)?;
        vcpu.set_reg(Reg::CPSR, INITIAL_CPSR)?;
        for reg in Reg::gprs() {
            vcpu.set_reg(reg, 0)?;
        }
        vcpu.set_reg(VM_ID_REG, setup.vm_id)?;
        vcpu.set_reg(CORE_INDEX_REG, setup.core_index)?;

        debug!(
            "vCPU {} initialized: PC={:#x}, SP={:#x}",
            self.index, setup.entry_pc, setup.stack_pointer
        );
        self.setup = Some(setup);
        self.transition(true, VcpuState::Configured)
    }

    /// `Configured → Running`, on the first run call
    pub(crate) fn start(&mut self) -> Result<()> {
        let allowed = self.state == VcpuState::Configured;
        self.transition(allowed, VcpuState::Running)
    }

    /// `Running → Exited`
    pub(crate) fn exit(&mut self, cause: ExitCause) -> Result<()> {
        let allowed = self.state == VcpuState::Running;
        self.transition(allowed, VcpuState::Exited(cause))
    }

    /// Release the backend handle. `Exited → Destroyed`.
    pub fn destroy(&mut self) -> Result<()> {
        let allowed = matches!(self.state, VcpuState::Exited(_));
        self.transition(allowed, VcpuState::Destroyed)?;
        self.handle = None;
        debug!("Destroyed vCPU {}", self.index);
        Ok(())
    }

    /// Release the backend handle of a vCPU that never ran
    pub(crate) fn discard(mut self) {
        debug!("Discarding vCPU {} in state {}", self.index, self.state.name());
        self.handle = None;
    }
}

fn released(index: usize) -> Error {
    Error::Vcpu(format!("vCPU {} backend handle already released", index))
}

impl<V: VcpuBackend> fmt::Debug for Vcpu<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vcpu")
            .field("index", &self.index)
            .field("state", &self.state)
            .field("setup", &self.setup)
            .finish()
    }
}
