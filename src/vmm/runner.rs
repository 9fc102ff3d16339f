//! vCPU run loop
//!
//! Repeatedly enters the guest, classifies each exit and applies the resume
//! policy until the vCPU reaches a terminal state.

use tracing::{debug, error, info, info_span, trace, warn};

use crate::backend::{ExitReason, HvReturn, Reg, VcpuBackend};
use crate::vmm::cpu::{ExitCause, FaultKind, GuestFault, Vcpu};
use crate::vmm::exit::{self, ExitEvent};
use crate::vmm::hypercall::{HypercallDispatcher, HypercallOutcome};
use crate::{Error, Result};

/// Width of every AArch64 instruction.
pub const INSTRUCTION_SIZE: u64 = 4;

/// How one vCPU ended, plus exit counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VcpuReport {
    pub index: usize,
    pub cause: ExitCause,
    /// VM exits handled, including the terminal one
    pub exits: u64,
    /// Hypercalls dispatched, including unknown ones
    pub hypercalls: u64,
}

impl VcpuReport {
    /// Whether the guest left through the EXIT hypercall
    pub fn success(&self) -> bool {
        self.cause == ExitCause::Success
    }
}

/// What the runner does after handling one exit
enum Action {
    Resume,
    Stop(ExitCause),
}

/// Run a configured vCPU to completion.
///
/// Guest faults and backend run failures end the vCPU and are reported in
/// the returned [`VcpuReport`]; `Err` is only returned for lifecycle misuse.
pub fn run_vcpu<V: VcpuBackend>(
    vcpu: &mut Vcpu<V>,
    dispatcher: &HypercallDispatcher<'_>,
) -> Result<VcpuReport> {
    let index = vcpu.index();
    let _span = info_span!("vcpu", index).entered();

    vcpu.start()?;
    info!("vCPU {} running", index);

    let mut report = VcpuReport {
        index,
        cause: ExitCause::Success,
        exits: 0,
        hypercalls: 0,
    };

    let cause = loop {
        let handle = vcpu.handle_mut()?;
        let action = match step(handle, dispatcher, &mut report) {
            Ok(action) => action,
            Err(e) => {
                error!("vCPU {} run error: {}", index, e);
                Action::Stop(ExitCause::RunFailed(status_of(&e)))
            }
        };
        if let Action::Stop(cause) = action {
            break cause;
        }
    };

    vcpu.exit(cause)?;
    report.cause = cause;
    match cause {
        ExitCause::Success => info!("vCPU {} exited after {} exits", index, report.exits),
        other => info!("vCPU {} stopped: {}", index, other),
    }
    Ok(report)
}

/// Enter the guest once and apply the resume policy to the exit.
fn step<V: VcpuBackend>(
    vcpu: &mut V,
    dispatcher: &HypercallDispatcher<'_>,
    report: &mut VcpuReport,
) -> Result<Action> {
    let raw = vcpu.run()?;
    report.exits += 1;
    let event = exit::classify(vcpu, &raw)?;
    trace!("vCPU {} exit: {:?}", report.index, event);

    let action = match event {
        ExitEvent::Hypercall { number, arg } => {
            report.hypercalls += 1;
            // PC already points past the HVC; step back for the log context.
            let pc = vcpu.get_reg(Reg::PC)?.wrapping_sub(INSTRUCTION_SIZE);
            match dispatcher.dispatch(number, arg, pc) {
                HypercallOutcome::StopThisCpu => Action::Stop(ExitCause::Success),
                HypercallOutcome::Continue | HypercallOutcome::UnknownLogged => Action::Resume,
            }
        }
        ExitEvent::TrappedSystemAccess { pc } => {
            warn!(
                "vCPU {}: system register access at PC={:#x} (syndrome={:#x}), skipping",
                report.index, pc, raw.syndrome
            );
            vcpu.set_reg(Reg::PC, pc.wrapping_add(INSTRUCTION_SIZE))?;
            Action::Resume
        }
        ExitEvent::MemoryFault {
            pc,
            fault_address,
            access,
        } => fatal(
            report.index,
            GuestFault {
                kind: FaultKind::Abort(access),
                pc,
                fault_address: Some(fault_address),
            },
        ),
        ExitEvent::Unhandled {
            reason,
            syndrome,
            pc,
        } => {
            let kind = if raw.reason == ExitReason::EXCEPTION {
                FaultKind::UnhandledException {
                    class: exit::exception_class(syndrome),
                    syndrome,
                }
            } else {
                FaultKind::UnknownExit { reason }
            };
            fatal(
                report.index,
                GuestFault {
                    kind,
                    pc,
                    fault_address: None,
                },
            )
        }
        ExitEvent::Canceled => {
            debug!("vCPU {} canceled by backend", report.index);
            Action::Stop(ExitCause::Canceled)
        }
        ExitEvent::TimerTick => Action::Resume,
    };
    Ok(action)
}

fn fatal(index: usize, fault: GuestFault) -> Action {
    error!("vCPU {}: {}", index, fault);
    Action::Stop(ExitCause::Fault(fault))
}

fn status_of(err: &Error) -> HvReturn {
    match err {
        Error::Backend { status, .. } => *status,
        _ => HvReturn::ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::emulated::{BackendFault, EmulatedHypervisor};
    use crate::backend::{Hypervisor, MemoryPermissions};
    use crate::devices::console::{CapturedOutput, OutputSink};
    use crate::guest::asm::{self, Cond};
    use crate::vmm::cpu::{VcpuSetup, VcpuState};
    use crate::vmm::exit::AccessKind;
    use crate::vmm::memory::{page_size, GuestMemoryRegion};

    struct Fixture {
        hv: EmulatedHypervisor,
        memory: GuestMemoryRegion,
        sink: OutputSink,
        out: CapturedOutput,
    }

    impl Fixture {
        fn new(hv: EmulatedHypervisor, code: &[u32]) -> Self {
            let memory = GuestMemoryRegion::allocate(page_size() * 16).unwrap();
            memory.write(0, &asm::assemble(code)).unwrap();
            hv.create_vm().unwrap();
            unsafe {
                hv.map(
                    memory.host_address().unwrap(),
                    0,
                    memory.len(),
                    MemoryPermissions::RWX,
                )
                .unwrap();
            }
            let (sink, out) = OutputSink::capture();
            Self {
                hv,
                memory,
                sink,
                out,
            }
        }

        fn run(&self) -> VcpuReport {
            let mut vcpu = Vcpu::create(&self.hv, 0).unwrap();
            vcpu.configure(VcpuSetup {
                entry_pc: 0,
                stack_pointer: 0x8000,
                vm_id: 0,
                core_index: 0,
            })
            .unwrap();
            let dispatcher = HypercallDispatcher::new(&self.memory, self.sink.clone(), 0);
            let report = run_vcpu(&mut vcpu, &dispatcher).unwrap();
            assert_eq!(vcpu.state(), VcpuState::Exited(report.cause));
            vcpu.destroy().unwrap();
            report
        }
    }

    #[test]
    fn test_putchar_then_exit() {
        let fx = Fixture::new(
            EmulatedHypervisor::new(),
            &[
                asm::movz(0, 1),
                asm::movz(1, b'H' as u16),
                asm::hvc(0),
                asm::movz(1, b'i' as u16),
                asm::hvc(0),
                asm::movz(0, 0),
                asm::hvc(0),
            ],
        );
        let report = fx.run();
        assert!(report.success());
        assert_eq!(report.hypercalls, 3);
        assert_eq!(fx.out.to_string_lossy(), "Hi");
    }

    #[test]
    fn test_unknown_hypercall_continues() {
        let fx = Fixture::new(
            EmulatedHypervisor::new(),
            &[asm::movz(0, 9), asm::hvc(0), asm::movz(0, 0), asm::hvc(0)],
        );
        let report = fx.run();
        assert!(report.success());
        assert_eq!(report.hypercalls, 2);
    }

    #[test]
    fn test_sysreg_trap_is_skipped() {
        let fx = Fixture::new(
            EmulatedHypervisor::new(),
            &[
                asm::mrs_midr(5),
                asm::msr_tpidr_el1(5),
                asm::movz(0, 1),
                asm::movz(1, b'!' as u16),
                asm::hvc(0),
                asm::movz(0, 0),
                asm::hvc(0),
            ],
        );
        let report = fx.run();
        assert!(report.success());
        assert_eq!(fx.out.to_string_lossy(), "!");
        assert_eq!(report.exits, 4);
    }

    #[test]
    fn test_data_abort_is_fatal() {
        let fx = Fixture::new(
            EmulatedHypervisor::new(),
            &[asm::movz_lsl16(2, 0x10), asm::ldrb(3, 2, 0)],
        );
        let report = fx.run();
        assert_eq!(
            report.cause,
            ExitCause::Fault(GuestFault {
                kind: FaultKind::Abort(AccessKind::Data),
                pc: 4,
                fault_address: Some(0x10_0000),
            })
        );
    }

    #[test]
    fn test_undefined_instruction_is_fatal() {
        let fx = Fixture::new(EmulatedHypervisor::new(), &[0xffff_ffff]);
        let report = fx.run();
        assert!(matches!(
            report.cause,
            ExitCause::Fault(GuestFault {
                kind: FaultKind::UnhandledException { class: 0, .. },
                pc: 0,
                ..
            })
        ));
        assert_eq!(report.hypercalls, 0);
    }

    #[test]
    fn test_timer_ticks_resume() {
        // Spin 100 times, then exit. A tiny quantum forces timer exits.
        let fx = Fixture::new(
            EmulatedHypervisor::new().with_timer_quantum(8),
            &[
                asm::add_imm(19, 19, 1),
                asm::cmp_imm(19, 100),
                asm::b_cond(Cond::Lt, -2),
                asm::movz(0, 0),
                asm::hvc(0),
            ],
        );
        let report = fx.run();
        assert!(report.success());
        assert!(report.exits > 30, "only {} exits", report.exits);
    }

    #[test]
    fn test_budget_cancels_runaway_guest() {
        let fx = Fixture::new(
            EmulatedHypervisor::new().with_instruction_budget(1000),
            &[asm::b(0)],
        );
        let report = fx.run();
        assert_eq!(report.cause, ExitCause::Canceled);
        assert!(!report.success());
    }

    #[test]
    fn test_backend_run_failure_ends_vcpu() {
        // The first run enters at 0; the second one, after PUTCHAR, fails.
        let fx = Fixture::new(
            EmulatedHypervisor::new().with_fault(BackendFault::Run {
                pc: 12,
                status: HvReturn::NO_RESOURCES,
            }),
            &[
                asm::movz(0, 1),
                asm::movz(1, b'x' as u16),
                asm::hvc(0),
                asm::movz(0, 0),
                asm::hvc(0),
            ],
        );
        let report = fx.run();
        assert_eq!(report.cause, ExitCause::RunFailed(HvReturn::NO_RESOURCES));
        assert!(!report.success());
        assert_eq!(report.exits, 1);
        assert_eq!(report.hypercalls, 1);
        assert_eq!(fx.out.to_string_lossy(), "x");
    }

    #[test]
    fn test_run_failure_status() {
        assert_eq!(
            status_of(&Error::backend("hv_vcpu_run", HvReturn::DENIED)),
            HvReturn::DENIED
        );
        assert_eq!(status_of(&Error::Vcpu("gone".into())), HvReturn::ERROR);
    }
}
