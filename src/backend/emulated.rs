//! Software backend: a small AArch64 interpreter.
//!
//! Implements the [`Hypervisor`] surface without virtualization hardware so
//! the VMM core runs on any host. Guests are flat, MMU-off EL1 programs;
//! only the handful of instructions below are understood, anything else
//! exits with an unknown exception class.
//!
//! Supported: `MOVZ`, `ADD` (immediate, shifted register), `SUBS`/`CMP`
//! (immediate), `B`, `B.cond`, `LDRB`/`STRB` (unsigned offset), `NOP`,
//! `HVC`, and `MSR`/`MRS` which always trap.
//!
//! Exit semantics follow Hypervisor.framework: `HVC` returns with PC past
//! the instruction, a system register access returns with PC still on it.
//!
//! [`BackendFault`]s make chosen backend calls fail, so the VMM's error
//! paths can be driven deterministically.

use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};
use vm_memory::{Bytes, VolatileSlice};

use super::{
    ExitReason, HvReturn, Hypervisor, MemoryPermissions, RawExit, Reg, SysReg, VcpuBackend,
};
use crate::vmm::exit::{EC_DABORT_LOWER, EC_HVC64, EC_IABORT_LOWER, EC_SYS64, EC_UNKNOWN};
use crate::{Error, Result};

/// Default number of instructions per run before a virtual timer exit.
pub const DEFAULT_TIMER_QUANTUM: u64 = 4096;

/// Instruction length bit of ESR_EL2.
const ESR_IL: u64 = 1 << 25;
/// Write-not-read bit in a data abort ISS.
const ISS_WNR: u64 = 1 << 6;

const NOP: u32 = 0xd503_201f;

/// A backend call that fails on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendFault {
    /// `run` fails with `status` when entered with PC at `pc`.
    Run { pc: u64, status: HvReturn },
    /// `set_reg(reg, value)` fails with `status`.
    SetReg {
        reg: Reg,
        value: u64,
        status: HvReturn,
    },
    /// `unmap` fails with `status`.
    Unmap { status: HvReturn },
    /// `destroy_vm` fails with `status`.
    DestroyVm { status: HvReturn },
}

/// Interpreter-backed VM instance.
#[derive(Debug, Clone)]
pub struct EmulatedHypervisor {
    shared: Arc<Shared>,
    timer_quantum: u64,
    instruction_budget: Option<u64>,
    vcpu_limit: usize,
    faults: Vec<BackendFault>,
}

#[derive(Debug, Default)]
struct Shared {
    vm: Mutex<VmState>,
    live_vcpus: AtomicUsize,
}

#[derive(Debug, Default)]
struct VmState {
    created: bool,
    mapping: Option<Mapping>,
}

#[derive(Debug, Clone, Copy)]
struct Mapping {
    host: NonNull<u8>,
    gpa: u64,
    len: usize,
    perms: MemoryPermissions,
}

// SAFETY: the mapping is only dereferenced while it is installed, and the
// `Hypervisor::map` contract keeps the host buffer alive until unmap.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    fn slice(&self) -> VolatileSlice<'_> {
        // SAFETY: `host..host + len` stays valid while the mapping is installed.
        unsafe { VolatileSlice::new(self.host.as_ptr(), self.len) }
    }

    fn offset(&self, gpa: u64, size: usize, perm: MemoryPermissions) -> Option<usize> {
        if !self.perms.contains(perm) || gpa < self.gpa {
            return None;
        }
        let off = gpa - self.gpa;
        let end = off.checked_add(size as u64)?;
        if end > self.len as u64 {
            return None;
        }
        Some(off as usize)
    }

    fn read(&self, gpa: u64, buf: &mut [u8], perm: MemoryPermissions) -> Option<()> {
        let off = self.offset(gpa, buf.len(), perm)?;
        self.slice().read_slice(buf, off).ok()
    }

    fn write(&self, gpa: u64, data: &[u8]) -> Option<()> {
        let off = self.offset(gpa, data.len(), MemoryPermissions::WRITE)?;
        self.slice().write_slice(data, off).ok()
    }

    fn fetch(&self, gpa: u64) -> Option<u32> {
        let mut bytes = [0u8; 4];
        self.read(gpa, &mut bytes, MemoryPermissions::EXEC)?;
        Some(u32::from_le_bytes(bytes))
    }
}

impl Default for EmulatedHypervisor {
    fn default() -> Self {
        Self {
            shared: Arc::default(),
            timer_quantum: DEFAULT_TIMER_QUANTUM,
            instruction_budget: None,
            vcpu_limit: 64,
            faults: Vec::new(),
        }
    }
}

impl EmulatedHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instructions executed per run before a virtual timer exit (0 disables).
    pub fn with_timer_quantum(mut self, quantum: u64) -> Self {
        self.timer_quantum = quantum;
        self
    }

    /// Total instructions a vCPU may execute before the backend cancels it.
    pub fn with_instruction_budget(mut self, budget: u64) -> Self {
        self.instruction_budget = Some(budget);
        self
    }

    /// Maximum number of simultaneously live vCPUs.
    pub fn with_vcpu_limit(mut self, limit: usize) -> Self {
        self.vcpu_limit = limit;
        self
    }

    /// Make a backend call fail. Applies to vCPUs created afterwards.
    pub fn with_fault(mut self, fault: BackendFault) -> Self {
        self.faults.push(fault);
        self
    }

    fn vm(&self) -> MutexGuard<'_, VmState> {
        self.shared.vm.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn injected(&self, call: &'static str) -> Result<()> {
        let status = self.faults.iter().find_map(|fault| match (*fault, call) {
            (BackendFault::Unmap { status }, "unmap")
            | (BackendFault::DestroyVm { status }, "destroy_vm") => Some(status),
            _ => None,
        });
        match status {
            Some(status) => {
                debug!("Injected {} failure: {}", call, status);
                Err(Error::backend(call, status))
            }
            None => Ok(()),
        }
    }
}

impl Hypervisor for EmulatedHypervisor {
    type Vcpu = EmulatedVcpu;

    fn create_vm(&self) -> Result<()> {
        let mut vm = self.vm();
        if vm.created {
            return Err(Error::backend("create_vm", HvReturn::BUSY));
        }
        vm.created = true;
        debug!("Created emulated VM");
        Ok(())
    }

    unsafe fn map(
        &self,
        host: *mut u8,
        gpa: u64,
        len: usize,
        perms: MemoryPermissions,
    ) -> Result<()> {
        let mut vm = self.vm();
        if !vm.created {
            return Err(Error::backend("map", HvReturn::NO_DEVICE));
        }
        let host = NonNull::new(host).ok_or(Error::backend("map", HvReturn::BAD_ARGUMENT))?;
        if vm.mapping.is_some() || len == 0 {
            return Err(Error::backend("map", HvReturn::BAD_ARGUMENT));
        }
        vm.mapping = Some(Mapping {
            host,
            gpa,
            len,
            perms,
        });
        Ok(())
    }

    fn unmap(&self, gpa: u64, len: usize) -> Result<()> {
        self.injected("unmap")?;
        let mut vm = self.vm();
        match vm.mapping {
            Some(m) if m.gpa == gpa && m.len == len => {
                vm.mapping = None;
                Ok(())
            }
            _ => Err(Error::backend("unmap", HvReturn::BAD_ARGUMENT)),
        }
    }

    fn destroy_vm(&self) -> Result<()> {
        self.injected("destroy_vm")?;
        let mut vm = self.vm();
        if !vm.created {
            return Err(Error::backend("destroy_vm", HvReturn::NO_DEVICE));
        }
        if self.shared.live_vcpus.load(Ordering::SeqCst) != 0 {
            return Err(Error::backend("destroy_vm", HvReturn::BUSY));
        }
        *vm = VmState::default();
        debug!("Destroyed emulated VM");
        Ok(())
    }

    fn create_vcpu(&self) -> Result<EmulatedVcpu> {
        if !self.vm().created {
            return Err(Error::backend("create_vcpu", HvReturn::NO_DEVICE));
        }
        let limit = self.vcpu_limit;
        self.shared
            .live_vcpus
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            })
            .map_err(|_| Error::backend("create_vcpu", HvReturn::NO_RESOURCES))?;

        Ok(EmulatedVcpu {
            shared: Arc::clone(&self.shared),
            state: RefCell::default(),
            timer_quantum: self.timer_quantum,
            budget: self.instruction_budget,
            faults: self.faults.clone(),
            _thread_bound: PhantomData,
        })
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Top-level A64 encoding group, selected by `op1` (bits 28:25).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeGroup {
    ImmediateData,
    BranchesExceptionsAndSystem,
    LoadStore,
    RegisterData,
    Unallocated,
}

fn decode_group(opcode: u32) -> DecodeGroup {
    match (opcode >> 25) & 0xf {
        8 | 9 => DecodeGroup::ImmediateData,
        10 | 11 => DecodeGroup::BranchesExceptionsAndSystem,
        4 | 6 | 12 | 14 => DecodeGroup::LoadStore,
        5 | 13 => DecodeGroup::RegisterData,
        _ => DecodeGroup::Unallocated,
    }
}

/// `MOVZ`, `ADD` and `SUBS` with an immediate operand.
struct DataImmediate(u32);

impl DataImmediate {
    fn rd(&self) -> u32 {
        self.0 & 0x1f
    }

    fn rn(&self) -> u32 {
        (self.0 >> 5) & 0x1f
    }

    /// `MOVZ` immediate, already shifted by `hw`.
    fn wide_imm(&self) -> u64 {
        let hw = (self.0 >> 21) & 0x3;
        (((self.0 >> 5) & 0xffff) as u64) << (hw * 16)
    }

    /// `ADD`/`SUBS` immediate, already shifted by `sh`.
    fn arith_imm(&self) -> u64 {
        let imm12 = ((self.0 >> 10) & 0xfff) as u64;
        if self.0 & 0x0040_0000 != 0 {
            imm12 << 12
        } else {
            imm12
        }
    }
}

/// `ADD` (shifted register).
struct AddShiftedRegister(u32);

impl AddShiftedRegister {
    fn rd(&self) -> u32 {
        self.0 & 0x1f
    }

    fn rn(&self) -> u32 {
        (self.0 >> 5) & 0x1f
    }

    fn rm(&self) -> u32 {
        (self.0 >> 16) & 0x1f
    }

    fn amount(&self) -> u32 {
        (self.0 >> 10) & 0x3f
    }

    fn shift(&self) -> u32 {
        (self.0 >> 22) & 0x3
    }
}

/// `MSR`/`MRS` (register), reported to the host as an ISS.
struct SystemRegisterMove(u32);

impl SystemRegisterMove {
    fn iss(&self) -> u64 {
        let field = |shift: u32, mask: u32| ((self.0 >> shift) & mask) as u64;
        let (op0, op1, crn, crm, op2) = (
            field(19, 0x3),
            field(16, 0x7),
            field(12, 0xf),
            field(8, 0xf),
            field(5, 0x7),
        );
        let rt = field(0, 0x1f);
        let read = field(21, 0x1);
        (op0 << 20) | (op2 << 17) | (op1 << 14) | (crn << 10) | (rt << 5) | (crm << 1) | read
    }
}

/// `LDRB`/`STRB` (unsigned immediate offset).
struct LoadStoreByte(u32);

impl LoadStoreByte {
    fn rt(&self) -> u32 {
        self.0 & 0x1f
    }

    fn rn(&self) -> u32 {
        (self.0 >> 5) & 0x1f
    }

    fn offset(&self) -> u64 {
        ((self.0 >> 10) & 0xfff) as u64
    }

    fn is_load(&self) -> bool {
        self.0 & 0x0040_0000 != 0
    }
}

/// Effect of one instruction on control flow.
enum Step {
    /// Continue with the next instruction.
    Next,
    /// Continue at an absolute address.
    Branch(u64),
    /// Exit with PC past the instruction.
    Call(RawExit),
    /// Exit with PC still on the instruction.
    Trap(RawExit),
}

fn syndrome(ec: u8, iss: u64) -> u64 {
    ((ec as u64) << 26) | ESR_IL | (iss & 0x1ff_ffff)
}

fn sign_extend(value: u64, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

fn undefined(opcode: u32) -> Step {
    trace!("Undefined instruction {:#010x}", opcode);
    Step::Trap(RawExit::exception(syndrome(EC_UNKNOWN, 0), 0))
}

// ============================================================================
// Execution
// ============================================================================

#[derive(Debug, Default)]
struct CpuState {
    x: [u64; 31],
    pc: u64,
    cpsr: u64,
    sys: HashMap<u16, u64>,
}

impl CpuState {
    const N: u64 = 1 << 31;
    const Z: u64 = 1 << 30;
    const C: u64 = 1 << 29;
    const V: u64 = 1 << 28;

    /// Register read where index 31 is the zero register.
    fn xzr(&self, r: u32) -> u64 {
        if r == 31 {
            0
        } else {
            self.x[r as usize]
        }
    }

    fn set_xzr(&mut self, r: u32, value: u64) {
        if r != 31 {
            self.x[r as usize] = value;
        }
    }

    /// Register read where index 31 is the stack pointer.
    fn xsp(&self, r: u32) -> u64 {
        if r == 31 {
            self.sys.get(&SysReg::SP_EL1.0).copied().unwrap_or(0)
        } else {
            self.x[r as usize]
        }
    }

    fn set_xsp(&mut self, r: u32, value: u64) {
        if r == 31 {
            self.sys.insert(SysReg::SP_EL1.0, value);
        } else {
            self.x[r as usize] = value;
        }
    }

    fn flag(&self, bit: u64) -> bool {
        self.cpsr & bit != 0
    }

    fn set_nzcv(&mut self, n: bool, z: bool, c: bool, v: bool) {
        let mut flags = 0;
        for (set, bit) in [(n, Self::N), (z, Self::Z), (c, Self::C), (v, Self::V)] {
            if set {
                flags |= bit;
            }
        }
        self.cpsr = (self.cpsr & !(Self::N | Self::Z | Self::C | Self::V)) | flags;
    }

    fn condition_holds(&self, cond: u32) -> bool {
        let (n, z, c, v) = (
            self.flag(Self::N),
            self.flag(Self::Z),
            self.flag(Self::C),
            self.flag(Self::V),
        );
        let base = match cond >> 1 {
            0 => z,
            1 => c,
            2 => n,
            3 => v,
            4 => c && !z,
            5 => n == v,
            6 => !z && n == v,
            _ => true,
        };
        if cond & 1 == 1 && cond != 0xf {
            !base
        } else {
            base
        }
    }

    fn execute(&mut self, mem: Option<&Mapping>, opcode: u32) -> Option<RawExit> {
        let step = match decode_group(opcode) {
            DecodeGroup::ImmediateData => self.data_immediate(DataImmediate(opcode)),
            DecodeGroup::RegisterData if opcode & 0xff20_0000 == 0x8b00_0000 => {
                self.add_shifted_register(AddShiftedRegister(opcode))
            }
            DecodeGroup::BranchesExceptionsAndSystem => self.branch_or_system(opcode),
            DecodeGroup::LoadStore if opcode & 0xff80_0000 == 0x3900_0000 => {
                self.load_store_byte(mem, LoadStoreByte(opcode))
            }
            _ => undefined(opcode),
        };
        match step {
            Step::Next => {
                self.pc = self.pc.wrapping_add(4);
                None
            }
            Step::Branch(target) => {
                self.pc = target;
                None
            }
            Step::Call(exit) => {
                self.pc = self.pc.wrapping_add(4);
                Some(exit)
            }
            Step::Trap(exit) => Some(exit),
        }
    }

    fn data_immediate(&mut self, op: DataImmediate) -> Step {
        match op.0 & 0xff80_0000 {
            // MOVZ (64-bit)
            0xd280_0000 => self.set_xzr(op.rd(), op.wide_imm()),
            // ADD (immediate, 64-bit)
            0x9100_0000 => {
                let value = self.xsp(op.rn()).wrapping_add(op.arith_imm());
                self.set_xsp(op.rd(), value);
            }
            // SUBS (immediate, 64-bit); CMP when rd is xzr
            0xf100_0000 => {
                let (a, imm) = (self.xsp(op.rn()), op.arith_imm());
                let result = a.wrapping_sub(imm);
                self.set_nzcv(
                    (result >> 63) & 1 == 1,
                    result == 0,
                    a >= imm,
                    ((a ^ imm) & (a ^ result)) >> 63 == 1,
                );
                self.set_xzr(op.rd(), result);
            }
            _ => return undefined(op.0),
        }
        Step::Next
    }

    fn add_shifted_register(&mut self, op: AddShiftedRegister) -> Step {
        let operand = self.xzr(op.rm());
        let amount = op.amount();
        let shifted = match op.shift() {
            0 => operand << amount,
            1 => operand >> amount,
            2 => ((operand as i64) >> amount) as u64,
            _ => return undefined(op.0),
        };
        let value = self.xzr(op.rn()).wrapping_add(shifted);
        self.set_xzr(op.rd(), value);
        Step::Next
    }

    fn branch_or_system(&mut self, opcode: u32) -> Step {
        if opcode == NOP {
            Step::Next
        } else if opcode & 0xffe0_001f == 0xd400_0002 {
            // HVC: the exception return address is the next instruction.
            let imm16 = ((opcode >> 5) & 0xffff) as u64;
            Step::Call(RawExit::exception(syndrome(EC_HVC64, imm16), 0))
        } else if opcode & 0xffd0_0000 == 0xd510_0000 {
            let iss = SystemRegisterMove(opcode).iss();
            Step::Trap(RawExit::exception(syndrome(EC_SYS64, iss), 0))
        } else if opcode & 0xfc00_0000 == 0x1400_0000 {
            let offset = sign_extend((opcode & 0x03ff_ffff) as u64, 26) * 4;
            Step::Branch(self.pc.wrapping_add(offset as u64))
        } else if opcode & 0xff00_0010 == 0x5400_0000 {
            if self.condition_holds(opcode & 0xf) {
                let offset = sign_extend(((opcode >> 5) & 0x7_ffff) as u64, 19) * 4;
                Step::Branch(self.pc.wrapping_add(offset as u64))
            } else {
                Step::Next
            }
        } else {
            undefined(opcode)
        }
    }

    fn load_store_byte(&mut self, mem: Option<&Mapping>, op: LoadStoreByte) -> Step {
        let addr = self.xsp(op.rn()).wrapping_add(op.offset());
        let abort =
            |wnr: u64| Step::Trap(RawExit::exception(syndrome(EC_DABORT_LOWER, wnr), addr));
        if op.is_load() {
            let mut byte = [0u8; 1];
            if mem
                .and_then(|m| m.read(addr, &mut byte, MemoryPermissions::READ))
                .is_none()
            {
                return abort(0);
            }
            self.set_xzr(op.rt(), byte[0] as u64);
        } else {
            let value = [self.xzr(op.rt()) as u8];
            if mem.and_then(|m| m.write(addr, &value)).is_none() {
                return abort(ISS_WNR);
            }
        }
        Step::Next
    }
}

/// An interpreter vCPU, bound to its creating thread like a real handle.
#[derive(Debug)]
pub struct EmulatedVcpu {
    shared: Arc<Shared>,
    state: RefCell<CpuState>,
    timer_quantum: u64,
    budget: Option<u64>,
    faults: Vec<BackendFault>,
    _thread_bound: PhantomData<*const ()>,
}

impl EmulatedVcpu {
    fn mapping(&self) -> Option<Mapping> {
        self.shared
            .vm
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .mapping
    }

    fn run_fault(&self, pc: u64) -> Option<HvReturn> {
        self.faults.iter().find_map(|fault| match *fault {
            BackendFault::Run { pc: at, status } if at == pc => Some(status),
            _ => None,
        })
    }

    fn set_reg_fault(&self, reg: Reg, value: u64) -> Option<HvReturn> {
        self.faults.iter().find_map(|fault| match *fault {
            BackendFault::SetReg {
                reg: r,
                value: v,
                status,
            } if r == reg && v == value => Some(status),
            _ => None,
        })
    }
}

impl VcpuBackend for EmulatedVcpu {
    fn get_reg(&self, reg: Reg) -> Result<u64> {
        let s = self.state.borrow();
        match reg {
            Reg::PC => Ok(s.pc),
            Reg::CPSR => Ok(s.cpsr),
            Reg(n @ 0..=30) => Ok(s.x[n as usize]),
            _ => Err(Error::backend("get_reg", HvReturn::BAD_ARGUMENT)),
        }
    }

    fn set_reg(&self, reg: Reg, value: u64) -> Result<()> {
        if let Some(status) = self.set_reg_fault(reg, value) {
            debug!("Injected set_reg failure for {:?}", reg);
            return Err(Error::backend("set_reg", status));
        }
        let mut s = self.state.borrow_mut();
        match reg {
            Reg::PC => s.pc = value,
            Reg::CPSR => s.cpsr = value,
            Reg(n @ 0..=30) => s.x[n as usize] = value,
            _ => return Err(Error::backend("set_reg", HvReturn::BAD_ARGUMENT)),
        }
        Ok(())
    }

    fn get_sys_reg(&self, reg: SysReg) -> Result<u64> {
        Ok(self.state.borrow().sys.get(&reg.0).copied().unwrap_or(0))
    }

    fn set_sys_reg(&self, reg: SysReg, value: u64) -> Result<()> {
        self.state.borrow_mut().sys.insert(reg.0, value);
        Ok(())
    }

    fn run(&mut self) -> Result<RawExit> {
        let entry = self.state.get_mut().pc;
        if let Some(status) = self.run_fault(entry) {
            debug!("Injected run failure: {}", status);
            return Err(Error::backend("run", status));
        }

        let mapping = self.mapping();
        let state = self.state.get_mut();
        let mut executed = 0u64;

        loop {
            if self.timer_quantum != 0 && executed >= self.timer_quantum {
                return Ok(RawExit::new(ExitReason::VTIMER_ACTIVATED));
            }
            if let Some(budget) = self.budget.as_mut() {
                if *budget == 0 {
                    return Ok(RawExit::new(ExitReason::CANCELED));
                }
                *budget -= 1;
            }

            let pc = state.pc;
            let opcode = match mapping.as_ref().and_then(|m| m.fetch(pc)) {
                Some(opcode) if pc % 4 == 0 => opcode,
                _ => return Ok(RawExit::exception(syndrome(EC_IABORT_LOWER, 0), pc)),
            };
            executed += 1;

            if let Some(exit) = state.execute(mapping.as_ref(), opcode) {
                return Ok(exit);
            }
        }
    }
}

impl Drop for EmulatedVcpu {
    fn drop(&mut self) {
        self.shared.live_vcpus.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::asm;
    use crate::vmm::exit::exception_class;

    struct Guest {
        hv: EmulatedHypervisor,
        mem: Vec<u8>,
    }

    impl Guest {
        fn new(code: &[u32]) -> Self {
            Self::with_hypervisor(EmulatedHypervisor::new(), code)
        }

        fn with_hypervisor(hv: EmulatedHypervisor, code: &[u32]) -> Self {
            let mut mem = vec![0u8; 0x4000];
            let bytes = asm::assemble(code);
            mem[..bytes.len()].copy_from_slice(&bytes);
            hv.create_vm().unwrap();
            let mut guest = Guest { hv, mem };
            let len = guest.mem.len();
            unsafe {
                guest
                    .hv
                    .map(guest.mem.as_mut_ptr(), 0, len, MemoryPermissions::RWX)
                    .unwrap();
            }
            guest
        }
    }

    #[test]
    fn test_decode_groups() {
        assert_eq!(decode_group(asm::movz(0, 1)), DecodeGroup::ImmediateData);
        assert_eq!(decode_group(asm::cmp_imm(1, 2)), DecodeGroup::ImmediateData);
        assert_eq!(decode_group(asm::add_reg(1, 2, 3)), DecodeGroup::RegisterData);
        assert_eq!(
            decode_group(asm::hvc(0)),
            DecodeGroup::BranchesExceptionsAndSystem
        );
        assert_eq!(decode_group(asm::b(0)), DecodeGroup::BranchesExceptionsAndSystem);
        assert_eq!(decode_group(asm::ldrb(1, 2, 0)), DecodeGroup::LoadStore);
        assert_eq!(decode_group(0), DecodeGroup::Unallocated);
    }

    #[test]
    fn test_hvc_advances_pc() {
        let guest = Guest::new(&[asm::movz(0, 1), asm::movz(1, b'A' as u16), asm::hvc(0)]);
        let mut vcpu = guest.hv.create_vcpu().unwrap();
        let exit = vcpu.run().unwrap();

        assert_eq!(exit.reason, ExitReason::EXCEPTION);
        assert_eq!(exception_class(exit.syndrome), EC_HVC64);
        assert_eq!(vcpu.get_reg(Reg::PC).unwrap(), 12);
        assert_eq!(vcpu.get_reg(Reg::X0).unwrap(), 1);
        assert_eq!(vcpu.get_reg(Reg::X1).unwrap(), b'A' as u64);
    }

    #[test]
    fn test_sysreg_access_leaves_pc() {
        let guest = Guest::new(&[asm::nop(), asm::mrs_midr(3)]);
        let mut vcpu = guest.hv.create_vcpu().unwrap();
        let exit = vcpu.run().unwrap();

        assert_eq!(exception_class(exit.syndrome), EC_SYS64);
        assert_eq!(vcpu.get_reg(Reg::PC).unwrap(), 4);
        // MRS direction bit and Rt are reported in the ISS.
        assert_eq!(exit.syndrome & 1, 1);
        assert_eq!((exit.syndrome >> 5) & 0x1f, 3);
    }

    #[test]
    fn test_fetch_outside_mapping_aborts() {
        let guest = Guest::new(&[asm::nop()]);
        let mut vcpu = guest.hv.create_vcpu().unwrap();
        vcpu.set_reg(Reg::PC, 0x10_0000).unwrap();
        let exit = vcpu.run().unwrap();

        assert_eq!(exception_class(exit.syndrome), EC_IABORT_LOWER);
        assert_eq!(exit.virtual_address, 0x10_0000);
    }

    #[test]
    fn test_store_outside_mapping_aborts() {
        let guest = Guest::new(&[asm::movz_lsl16(2, 1), asm::strb(0, 2, 0)]);
        let mut vcpu = guest.hv.create_vcpu().unwrap();
        let exit = vcpu.run().unwrap();

        assert_eq!(exception_class(exit.syndrome), EC_DABORT_LOWER);
        assert_eq!(exit.virtual_address, 0x1_0000);
        assert_ne!(exit.syndrome & ISS_WNR, 0);
    }

    #[test]
    fn test_byte_load_and_store() {
        let guest = Guest::new(&[
            asm::movz(1, 0x41),
            asm::movz(2, 0x100),
            asm::strb(1, 2, 3),
            asm::ldrb(4, 2, 3),
            asm::hvc(0),
        ]);
        let mut vcpu = guest.hv.create_vcpu().unwrap();
        vcpu.run().unwrap();
        assert_eq!(vcpu.get_reg(Reg(4)).unwrap(), 0x41);
        assert_eq!(guest.mem[0x103], 0x41);
    }

    #[test]
    fn test_counted_loop() {
        // x19 counts to 5 with a backwards B.LT.
        let guest = Guest::new(&[
            asm::movz(19, 0),
            asm::add_imm(19, 19, 1),
            asm::cmp_imm(19, 5),
            asm::b_cond(asm::Cond::Lt, -2),
            asm::hvc(0),
        ]);
        let mut vcpu = guest.hv.create_vcpu().unwrap();
        vcpu.run().unwrap();
        assert_eq!(vcpu.get_reg(Reg(19)).unwrap(), 5);
    }

    #[test]
    fn test_add_register() {
        let guest = Guest::new(&[
            asm::movz(1, 0x30),
            asm::movz(19, 7),
            asm::add_reg(1, 1, 19),
            asm::hvc(0),
        ]);
        let mut vcpu = guest.hv.create_vcpu().unwrap();
        vcpu.run().unwrap();
        assert_eq!(vcpu.get_reg(Reg::X1).unwrap(), 0x37);
    }

    #[test]
    fn test_undefined_instruction() {
        let guest = Guest::new(&[0xd420_0000]); // BRK #0
        let mut vcpu = guest.hv.create_vcpu().unwrap();
        let exit = vcpu.run().unwrap();
        assert_eq!(exit.reason, ExitReason::EXCEPTION);
        assert_eq!(exception_class(exit.syndrome), EC_UNKNOWN);
        assert_eq!(vcpu.get_reg(Reg::PC).unwrap(), 0);
    }

    #[test]
    fn test_timer_quantum_preempts_spin() {
        let guest = Guest::new(&[asm::b(0)]);
        let hv = guest.hv.clone().with_timer_quantum(16);
        let mut vcpu = hv.create_vcpu().unwrap();
        let exit = vcpu.run().unwrap();
        assert_eq!(exit.reason, ExitReason::VTIMER_ACTIVATED);
        assert_eq!(vcpu.get_reg(Reg::PC).unwrap(), 0);
    }

    #[test]
    fn test_budget_cancels() {
        let guest = Guest::new(&[asm::b(0)]);
        let hv = guest
            .hv
            .clone()
            .with_timer_quantum(0)
            .with_instruction_budget(100);
        let mut vcpu = hv.create_vcpu().unwrap();
        assert_eq!(vcpu.run().unwrap().reason, ExitReason::CANCELED);
    }

    #[test]
    fn test_unknown_register_rejected() {
        let guest = Guest::new(&[asm::nop()]);
        let vcpu = guest.hv.create_vcpu().unwrap();
        assert!(vcpu.get_reg(Reg(32)).is_err());
        assert!(vcpu.set_reg(Reg(40), 1).is_err());
    }

    #[test]
    fn test_vm_lifecycle_errors() {
        let hv = EmulatedHypervisor::new().with_vcpu_limit(1);
        assert!(hv.create_vcpu().is_err());
        hv.create_vm().unwrap();
        assert!(hv.create_vm().is_err());

        let vcpu = hv.create_vcpu().unwrap();
        assert!(matches!(
            hv.create_vcpu(),
            Err(Error::Backend {
                status: HvReturn::NO_RESOURCES,
                ..
            })
        ));
        assert!(hv.destroy_vm().is_err());
        drop(vcpu);
        hv.destroy_vm().unwrap();
    }

    #[test]
    fn test_injected_run_failure() {
        let hv = EmulatedHypervisor::new().with_fault(BackendFault::Run {
            pc: 8,
            status: HvReturn::DENIED,
        });
        let guest = Guest::with_hypervisor(hv, &[asm::nop(), asm::nop(), asm::hvc(0)]);
        let mut vcpu = guest.hv.create_vcpu().unwrap();

        // Entered at 0: runs normally.
        assert_eq!(vcpu.run().unwrap().reason, ExitReason::EXCEPTION);
        vcpu.set_reg(Reg::PC, 8).unwrap();
        assert!(matches!(
            vcpu.run(),
            Err(Error::Backend {
                call: "run",
                status: HvReturn::DENIED
            })
        ));
    }

    #[test]
    fn test_injected_set_reg_failure() {
        let hv = EmulatedHypervisor::new().with_fault(BackendFault::SetReg {
            reg: Reg::X1,
            value: 2,
            status: HvReturn::BAD_ARGUMENT,
        });
        hv.create_vm().unwrap();
        let vcpu = hv.create_vcpu().unwrap();

        vcpu.set_reg(Reg::X1, 1).unwrap();
        assert!(vcpu.set_reg(Reg::X1, 2).is_err());
        assert!(vcpu.set_reg(Reg(2), 2).is_ok());
        assert_eq!(vcpu.get_reg(Reg::X1).unwrap(), 1);
    }

    #[test]
    fn test_injected_unmap_keeps_mapping() {
        let hv = EmulatedHypervisor::new().with_fault(BackendFault::Unmap {
            status: HvReturn::BUSY,
        });
        let guest = Guest::with_hypervisor(hv, &[asm::hvc(0)]);
        let len = guest.mem.len();

        assert!(guest.hv.unmap(0, len).is_err());
        let mut vcpu = guest.hv.create_vcpu().unwrap();
        assert_eq!(exception_class(vcpu.run().unwrap().syndrome), EC_HVC64);
    }
}
