//! VMM core
//!
//! This module contains the core VMM components:
//! - Guest memory and its mapping into the backend
//! - vCPU lifecycle, exit classification and the run loop
//! - The hypercall console
//! - [`VirtualMachine`], which ties them together and coordinates vCPU threads

pub mod config;
pub mod cpu;
pub mod exit;
pub mod hypercall;
pub mod memory;
pub mod runner;

use std::mem;
use std::sync::{Condvar, Mutex, PoisonError};
use std::thread;

use tracing::{debug, error, info, warn};

use crate::backend::{Hypervisor, MemoryPermissions};
use crate::devices::console::OutputSink;
use crate::guest::GuestPayload;
use crate::{Error, Result};

use self::config::VmConfig;
use self::cpu::{Vcpu, VcpuSetup};
use self::hypercall::HypercallDispatcher;
use self::memory::{GuestMemoryRegion, GUEST_BASE};
use self::runner::{run_vcpu, VcpuReport};

/// Outcome of running a VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmReport {
    pub vm_id: u64,
    /// One report per vCPU, in core order
    pub vcpus: Vec<VcpuReport>,
}

impl VmReport {
    /// True iff every vCPU left through the EXIT hypercall
    pub fn success(&self) -> bool {
        !self.vcpus.is_empty() && self.vcpus.iter().all(VcpuReport::success)
    }
}

/// Lifecycle phase of a [`VirtualMachine`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmPhase {
    /// Memory mapped, nothing has run yet
    Ready,
    Running,
    /// Every vCPU reached a terminal state
    Finished,
    Destroyed,
}

/// A VM instance: guest memory, its backend mapping, and the vCPUs that run in it
pub struct VirtualMachine<H: Hypervisor> {
    hypervisor: H,
    config: VmConfig,
    memory: Option<GuestMemoryRegion>,
    vm_created: bool,
    mapped: bool,
    phase: VmPhase,
}

impl<H: Hypervisor> VirtualMachine<H> {
    /// Allocate guest memory, create the backend VM and map the memory RWX at 0
    pub fn create(hypervisor: H, config: VmConfig) -> Result<Self> {
        info!(
            "Creating VM {} with {} KB memory, {} vCPU(s)",
            config.vm_id,
            config.memory_size / 1024,
            config.vcpus
        );
        config.validate()?;

        // Anything acquired below is released by Drop if a later step fails.
        let mut vm = Self {
            hypervisor,
            config,
            memory: None,
            vm_created: false,
            mapped: false,
            phase: VmPhase::Ready,
        };

        let memory = GuestMemoryRegion::allocate(vm.config.memory_size)?;
        let (host, len) = (memory.host_address()?, memory.len());
        vm.memory = Some(memory);

        vm.hypervisor.create_vm()?;
        vm.vm_created = true;

        // SAFETY: the region is owned by `vm` and `destroy` only drops it
        // once the mapping is gone; otherwise it is leaked.
        unsafe {
            vm.hypervisor
                .map(host, GUEST_BASE, len, MemoryPermissions::RWX)?;
        }
        vm.mapped = true;
        info!("Mapped guest memory: GPA {:#x} - {:#x}", GUEST_BASE, len);

        Ok(vm)
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn hypervisor(&self) -> &H {
        &self.hypervisor
    }

    pub fn phase(&self) -> VmPhase {
        self.phase
    }

    /// Whether vCPUs are currently executing
    pub fn is_running(&self) -> bool {
        self.phase == VmPhase::Running
    }

    /// Guest memory, until the VM is destroyed
    pub fn memory(&self) -> Option<&GuestMemoryRegion> {
        self.memory.as_ref()
    }

    /// Load `payload`, run every vCPU to a terminal state and report.
    ///
    /// With one vCPU the run loop executes on the calling thread; otherwise
    /// each vCPU gets its own thread, which creates, configures and runs it.
    /// A setup failure on any vCPU stops all of them before the first
    /// instruction and is returned as the error.
    pub fn run(&mut self, payload: &GuestPayload, sink: &OutputSink) -> Result<VmReport> {
        if self.phase != VmPhase::Ready {
            return Err(Error::Vm(format!(
                "VM {} cannot run in phase {:?}",
                self.config.vm_id, self.phase
            )));
        }
        let memory = self
            .memory
            .as_ref()
            .ok_or_else(|| Error::Vm("guest memory released".into()))?;

        payload.check_vcpus(self.config.vcpus)?;
        payload.load(memory)?;
        let setups = (0..self.config.vcpus)
            .map(|index| {
                let entry_pc = payload
                    .entry_for(index)
                    .ok_or_else(|| Error::Load(format!("no image for vCPU {}", index)))?;
                Ok(VcpuSetup {
                    entry_pc,
                    stack_pointer: self.config.stack_pointer(index),
                    vm_id: self.config.vm_id,
                    core_index: index as u64,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        self.phase = VmPhase::Running;
        let result = match setups.as_slice() {
            [setup] => run_on_current_thread(&self.hypervisor, memory, sink, *setup),
            _ => run_on_threads(&self.hypervisor, memory, sink, &setups),
        };
        self.phase = VmPhase::Finished;

        let vcpus = result?;
        let report = VmReport {
            vm_id: self.config.vm_id,
            vcpus,
        };
        info!(
            "VM {} finished: {}",
            report.vm_id,
            if report.success() {
                "all vCPUs exited"
            } else {
                "failed"
            }
        );
        Ok(report)
    }

    /// Unmap guest memory, release it and destroy the backend VM.
    ///
    /// Only what was acquired is released; calling it again after success
    /// is a no-op. If the backend refuses to unmap, the host buffer is
    /// leaked instead of freed, the backend VM is still destroyed, and the
    /// first error is returned.
    pub fn destroy(&mut self) -> Result<()> {
        if self.phase == VmPhase::Running {
            return Err(Error::Vm("cannot destroy a running VM".into()));
        }

        let mut first_error = None;
        if self.mapped {
            match self.hypervisor.unmap(GUEST_BASE, self.config.memory_size) {
                Ok(()) => self.mapped = false,
                Err(e) => first_error = Some(e),
            }
        }
        if self.mapped {
            // The backend can still reach the buffer.
            if let Some(memory) = self.memory.take() {
                warn!(
                    "Leaking {} KB of guest memory still mapped by VM {}",
                    memory.len() / 1024,
                    self.config.vm_id
                );
                mem::forget(memory);
            }
        } else {
            self.memory = None;
        }

        if self.vm_created {
            match self.hypervisor.destroy_vm() {
                Ok(()) => {
                    self.vm_created = false;
                    // Mappings go away with the VM.
                    self.mapped = false;
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        if self.phase != VmPhase::Destroyed {
            debug!("VM {} destroyed", self.config.vm_id);
            self.phase = VmPhase::Destroyed;
        }
        Ok(())
    }
}

impl<H: Hypervisor> Drop for VirtualMachine<H> {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            error!("Failed to tear down VM {}: {}", self.config.vm_id, e);
        }
    }
}

impl<H: Hypervisor> std::fmt::Debug for VirtualMachine<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualMachine")
            .field("config", &self.config)
            .field("mapped", &self.mapped)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

/// Create and configure a vCPU on the calling thread
fn setup_vcpu<H: Hypervisor>(hypervisor: &H, setup: VcpuSetup) -> Result<Vcpu<H::Vcpu>> {
    let mut vcpu = Vcpu::create(hypervisor, setup.core_index as usize)?;
    match vcpu.configure(setup) {
        Ok(()) => Ok(vcpu),
        Err(e) => {
            vcpu.discard();
            Err(e)
        }
    }
}

fn run_and_destroy<V: crate::backend::VcpuBackend>(
    mut vcpu: Vcpu<V>,
    memory: &GuestMemoryRegion,
    sink: &OutputSink,
) -> Result<VcpuReport> {
    let dispatcher = HypercallDispatcher::new(memory, sink.clone(), vcpu.index());
    let report = run_vcpu(&mut vcpu, &dispatcher)?;
    vcpu.destroy()?;
    Ok(report)
}

fn run_on_current_thread<H: Hypervisor>(
    hypervisor: &H,
    memory: &GuestMemoryRegion,
    sink: &OutputSink,
    setup: VcpuSetup,
) -> Result<Vec<VcpuReport>> {
    let vcpu = setup_vcpu(hypervisor, setup)?;
    Ok(vec![run_and_destroy(vcpu, memory, sink)?])
}

fn run_on_threads<H: Hypervisor>(
    hypervisor: &H,
    memory: &GuestMemoryRegion,
    sink: &OutputSink,
    setups: &[VcpuSetup],
) -> Result<Vec<VcpuReport>> {
    let gate = StartGate::new(setups.len());

    let results: Vec<Result<Option<VcpuReport>>> = thread::scope(|s| {
        let mut handles = Vec::with_capacity(setups.len());
        let mut spawn_error = None;
        for (index, &setup) in setups.iter().enumerate() {
            let gate = &gate;
            let spawned = thread::Builder::new()
                .name(format!("vcpu-{}", index))
                .spawn_scoped(s, move || -> Result<Option<VcpuReport>> {
                    let vcpu = setup_vcpu(hypervisor, setup);
                    if !gate.arrive(vcpu.is_ok()) {
                        // Another vCPU failed setup: release ours without running.
                        return match vcpu {
                            Ok(vcpu) => {
                                vcpu.discard();
                                Ok(None)
                            }
                            Err(e) => Err(e),
                        };
                    }
                    run_and_destroy(vcpu?, memory, sink).map(Some)
                });
            match spawned {
                Ok(handle) => handles.push((index, handle)),
                Err(e) => {
                    gate.abort();
                    spawn_error = Some(Error::Vcpu(format!(
                        "Failed to spawn vCPU {} thread: {}",
                        index, e
                    )));
                    break;
                }
            }
        }

        let mut results: Vec<_> = handles
            .into_iter()
            .map(|(index, handle)| {
                handle.join().unwrap_or_else(|_| {
                    Err(Error::Vcpu(format!("vCPU {} thread panicked", index)))
                })
            })
            .collect();
        results.extend(spawn_error.map(Err));
        results
    });

    // First error in core order wins; a failed setup means nothing ran.
    let mut reports = Vec::with_capacity(results.len());
    for result in results {
        if let Some(report) = result? {
            reports.push(report);
        }
    }
    Ok(reports)
}

/// Barrier that also carries whether every participant arrived ready.
///
/// Unlike [`std::sync::Barrier`] it can be aborted, so waiters are released
/// when a participant will never arrive.
struct StartGate {
    state: Mutex<GateState>,
    cond: Condvar,
    parties: usize,
}

#[derive(Default)]
struct GateState {
    arrived: usize,
    failed: bool,
    aborted: bool,
}

impl StartGate {
    fn new(parties: usize) -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            cond: Condvar::new(),
            parties,
        }
    }

    /// Wait for every party. Returns true iff all of them arrived ready.
    fn arrive(&self, ready: bool) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.arrived += 1;
        state.failed |= !ready;
        if state.arrived >= self.parties {
            self.cond.notify_all();
        }
        let state = self
            .cond
            .wait_while(state, |s| s.arrived < self.parties && !s.aborted)
            .unwrap_or_else(PoisonError::into_inner);
        !state.failed && !state.aborted
    }

    /// Release every waiter as failed
    fn abort(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.aborted = true;
        self.cond.notify_all();
    }
}
