//! Error types for tinyvmm

use thiserror::Error;

use crate::backend::HvReturn;

/// Result type alias using tinyvmm Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or running a VM
#[derive(Error, Debug)]
pub enum Error {
    /// A backend call returned a non-success status
    #[error("{call} failed: {status}")]
    Backend {
        /// Name of the backend call
        call: &'static str,
        /// Status code returned by the backend
        status: HvReturn,
    },

    /// Host memory could not be acquired
    #[error("Allocation error: {0}")]
    Allocation(String),

    /// Guest payload does not fit the guest memory region
    #[error("Load error: {0}")]
    Load(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// vCPU lifecycle operation attempted from the wrong state
    #[error("vCPU {index}: invalid state transition from {from} to {to}")]
    InvalidState {
        /// Index of the vCPU within its VM
        index: usize,
        /// State the vCPU was in
        from: &'static str,
        /// State the operation wanted to reach
        to: &'static str,
    },

    /// vCPU thread errors
    #[error("vCPU error: {0}")]
    Vcpu(String),

    /// VM-level operation in the wrong lifecycle phase
    #[error("VM error: {0}")]
    Vm(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a backend error for `call` from a raw status code
    pub fn backend(call: &'static str, status: HvReturn) -> Self {
        Error::Backend { call, status }
    }
}
