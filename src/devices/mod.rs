//! Host-side devices for tinyvmm VMs
//!
//! The only device is the hypercall console, a mutex-guarded output sink
//! shared by every vCPU of a VM.

pub mod console;

pub use console::{CapturedOutput, OutputSink};
