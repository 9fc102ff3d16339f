//! Apple Hypervisor.framework backend.
//!
//! The framework allows one VM instance per process and binds every vCPU to
//! the thread that created it. [`HvfVcpu`] is `!Send` so the compiler
//! enforces the second rule.

use std::ffi::c_void;
use std::marker::PhantomData;
use std::ptr;

use tracing::{debug, warn};

use super::{
    ExitReason, HvReturn, Hypervisor, MemoryPermissions, RawExit, Reg, SysReg, VcpuBackend,
};
use crate::{Error, Result};

mod ffi {
    use std::ffi::c_void;

    use crate::backend::HvReturn;

    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    pub struct HvVcpuExitException {
        pub syndrome: u64,
        pub virtual_address: u64,
        pub physical_address: u64,
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    pub struct HvVcpuExit {
        pub reason: u32,
        pub exception: HvVcpuExitException,
    }

    #[link(name = "Hypervisor", kind = "framework")]
    extern "C" {
        pub fn hv_vm_create(config: *mut c_void) -> HvReturn;
        pub fn hv_vm_destroy() -> HvReturn;
        pub fn hv_vm_map(addr: *mut c_void, ipa: u64, size: usize, flags: u64) -> HvReturn;
        pub fn hv_vm_unmap(ipa: u64, size: usize) -> HvReturn;
        pub fn hv_vcpu_create(
            vcpu: *mut u64,
            exit: *mut *const HvVcpuExit,
            config: *mut c_void,
        ) -> HvReturn;
        pub fn hv_vcpu_destroy(vcpu: u64) -> HvReturn;
        pub fn hv_vcpu_run(vcpu: u64) -> HvReturn;
        pub fn hv_vcpu_get_reg(vcpu: u64, reg: u32, value: *mut u64) -> HvReturn;
        pub fn hv_vcpu_set_reg(vcpu: u64, reg: u32, value: u64) -> HvReturn;
        pub fn hv_vcpu_get_sys_reg(vcpu: u64, reg: u16, value: *mut u64) -> HvReturn;
        pub fn hv_vcpu_set_sys_reg(vcpu: u64, reg: u16, value: u64) -> HvReturn;
    }
}

/// Hypervisor.framework VM instance for the current process.
#[derive(Debug, Default)]
pub struct HvfHypervisor {
    _private: (),
}

impl HvfHypervisor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Hypervisor for HvfHypervisor {
    type Vcpu = HvfVcpu;

    fn create_vm(&self) -> Result<()> {
        // SAFETY: a null config requests the default VM configuration.
        unsafe { ffi::hv_vm_create(ptr::null_mut()) }.check("hv_vm_create")?;
        debug!("Created Hypervisor.framework VM");
        Ok(())
    }

    unsafe fn map(
        &self,
        host: *mut u8,
        gpa: u64,
        len: usize,
        perms: MemoryPermissions,
    ) -> Result<()> {
        // SAFETY: the caller guarantees `host` is valid for `len` bytes until unmap.
        unsafe { ffi::hv_vm_map(host.cast::<c_void>(), gpa, len, perms.0) }.check("hv_vm_map")
    }

    fn unmap(&self, gpa: u64, len: usize) -> Result<()> {
        // SAFETY: unmapping only affects the guest view of memory.
        unsafe { ffi::hv_vm_unmap(gpa, len) }.check("hv_vm_unmap")
    }

    fn destroy_vm(&self) -> Result<()> {
        // SAFETY: the caller has destroyed every vCPU.
        unsafe { ffi::hv_vm_destroy() }.check("hv_vm_destroy")
    }

    fn create_vcpu(&self) -> Result<HvfVcpu> {
        let mut id = 0u64;
        let mut exit: *const ffi::HvVcpuExit = ptr::null();
        // SAFETY: both out-pointers are valid locals; a null config selects defaults.
        unsafe { ffi::hv_vcpu_create(&mut id, &mut exit, ptr::null_mut()) }
            .check("hv_vcpu_create")?;
        if exit.is_null() {
            return Err(Error::backend("hv_vcpu_create", HvReturn::ERROR));
        }
        debug!("Created HVF vCPU {}", id);
        Ok(HvfVcpu {
            id,
            exit,
            _thread_bound: PhantomData,
        })
    }
}

/// A Hypervisor.framework vCPU, usable only on its creating thread.
#[derive(Debug)]
pub struct HvfVcpu {
    id: u64,
    /// Exit record owned by the framework, refreshed by every `hv_vcpu_run`.
    exit: *const ffi::HvVcpuExit,
    _thread_bound: PhantomData<*const ()>,
}

impl VcpuBackend for HvfVcpu {
    fn get_reg(&self, reg: Reg) -> Result<u64> {
        let mut value = 0;
        // SAFETY: `value` is a valid out-pointer and the vCPU belongs to this thread.
        unsafe { ffi::hv_vcpu_get_reg(self.id, reg.0, &mut value) }.check("hv_vcpu_get_reg")?;
        Ok(value)
    }

    fn set_reg(&self, reg: Reg, value: u64) -> Result<()> {
        // SAFETY: the vCPU belongs to this thread.
        unsafe { ffi::hv_vcpu_set_reg(self.id, reg.0, value) }.check("hv_vcpu_set_reg")
    }

    fn get_sys_reg(&self, reg: SysReg) -> Result<u64> {
        let mut value = 0;
        // SAFETY: `value` is a valid out-pointer and the vCPU belongs to this thread.
        unsafe { ffi::hv_vcpu_get_sys_reg(self.id, reg.0, &mut value) }
            .check("hv_vcpu_get_sys_reg")?;
        Ok(value)
    }

    fn set_sys_reg(&self, reg: SysReg, value: u64) -> Result<()> {
        // SAFETY: the vCPU belongs to this thread.
        unsafe { ffi::hv_vcpu_set_sys_reg(self.id, reg.0, value) }.check("hv_vcpu_set_sys_reg")
    }

    fn run(&mut self) -> Result<RawExit> {
        // SAFETY: the vCPU belongs to this thread.
        unsafe { ffi::hv_vcpu_run(self.id) }.check("hv_vcpu_run")?;
        // SAFETY: the framework keeps the exit record alive for the vCPU's lifetime
        // and only writes it during `hv_vcpu_run`.
        let exit = unsafe { ptr::read(self.exit) };
        Ok(RawExit {
            reason: ExitReason(exit.reason),
            syndrome: exit.exception.syndrome,
            virtual_address: exit.exception.virtual_address,
        })
    }
}

impl Drop for HvfVcpu {
    fn drop(&mut self) {
        // SAFETY: dropped on the creating thread since the type is !Send.
        if let Err(e) = unsafe { ffi::hv_vcpu_destroy(self.id) }.check("hv_vcpu_destroy") {
            warn!("Failed to destroy vCPU {}: {}", self.id, e);
        }
    }
}
