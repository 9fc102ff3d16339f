//! tinyvmm: a minimal virtual machine monitor
//!
//! Runs flat AArch64 guest programs at EL1 on top of a hardware
//! virtualization backend. Guests talk to the host through a three-call
//! hypercall interface (EXIT, PUTCHAR, PUTS); everything else they do either
//! runs natively or ends the vCPU with a reported fault.
//!
//! # Key Features
//!
//! - **Backends**: Hypervisor.framework on Apple silicon, and a portable
//!   AArch64 interpreter that honors the same exit semantics
//! - **SMP**: one thread per vCPU, with a start gate so a setup failure on
//!   any core stops the whole VM before it runs
//! - **Reporting**: every vCPU ends with an exit cause and counters
//!
//! # Example
//!
//! ```no_run
//! use tinyvmm::backend::emulated::EmulatedHypervisor;
//! use tinyvmm::devices::OutputSink;
//! use tinyvmm::{guest, VirtualMachine, VmConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = VmConfig::new().vcpus(2).vm_id(7);
//!     let mut vm = VirtualMachine::create(EmulatedHypervisor::new(), config)?;
//!
//!     let report = vm.run(&guest::smp(), &OutputSink::stdout())?;
//!     for vcpu in &report.vcpus {
//!         println!("vCPU {}: {}", vcpu.index, vcpu.cause);
//!     }
//!
//!     vm.destroy()?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod devices;
pub mod error;
pub mod guest;
pub mod vmm;

// Re-exports for convenience
pub use error::{Error, Result};
pub use vmm::config::VmConfig;
pub use vmm::cpu::{ExitCause, GuestFault};
pub use vmm::runner::VcpuReport;
pub use vmm::{VirtualMachine, VmReport};
