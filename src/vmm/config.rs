//! Configuration for tinyvmm VMs

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::vmm::memory::page_size;
use crate::{Error, Result};

/// Smallest guest memory size accepted
pub const MIN_MEMORY_SIZE: usize = 64 * 1024;
/// Largest guest memory size accepted
pub const MAX_MEMORY_SIZE: usize = 1024 * 1024 * 1024;
/// Maximum number of vCPUs per VM
pub const MAX_VCPUS: usize = 64;

/// Configuration for creating a VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Guest memory size in bytes (default: 1 MiB)
    pub memory_size: usize,
    /// Number of vCPUs (default: 1)
    pub vcpus: usize,
    /// Value the guest finds in its VM identification register
    pub vm_id: u64,
    /// Initial stack pointer of vCPU 0 (default: one page below the top of memory)
    pub stack_top: Option<u64>,
    /// Distance between the initial stack pointers of consecutive vCPUs
    pub stack_stride: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            memory_size: 1024 * 1024,
            vcpus: 1,
            vm_id: 0,
            stack_top: None,
            stack_stride: 0x1000,
        }
    }
}

impl VmConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the guest memory size in bytes
    pub fn memory_size(mut self, bytes: usize) -> Self {
        self.memory_size = bytes;
        self
    }

    /// Set the number of vCPUs
    pub fn vcpus(mut self, count: usize) -> Self {
        self.vcpus = count;
        self
    }

    /// Set the VM identifier handed to the guest
    pub fn vm_id(mut self, id: u64) -> Self {
        self.vm_id = id;
        self
    }

    /// Set the initial stack pointer of vCPU 0
    pub fn stack_top(mut self, addr: u64) -> Self {
        self.stack_top = Some(addr);
        self
    }

    /// Set the per-vCPU stack spacing
    pub fn stack_stride(mut self, stride: u64) -> Self {
        self.stack_stride = stride;
        self
    }

    /// Initial stack pointer for vCPU `index`
    pub fn stack_pointer(&self, index: usize) -> u64 {
        let top = self
            .stack_top
            .unwrap_or((self.memory_size as u64).saturating_sub(0x1000));
        top.saturating_sub(index as u64 * self.stack_stride)
    }

    /// Load a configuration from a YAML (`.yaml`/`.yml`) or JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;

        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
            .unwrap_or(false);

        let config: VmConfig = if is_yaml {
            serde_yaml::from_str(&raw).map_err(|e| {
                Error::Config(format!("invalid YAML config {}: {}", path.display(), e))
            })?
        } else {
            serde_json::from_str(&raw).map_err(|e| {
                Error::Config(format!("invalid JSON config {}: {}", path.display(), e))
            })?
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.memory_size < MIN_MEMORY_SIZE {
            return Err(Error::Config(format!(
                "Memory must be at least {} KB",
                MIN_MEMORY_SIZE / 1024
            )));
        }
        if self.memory_size > MAX_MEMORY_SIZE {
            return Err(Error::Config(format!(
                "Memory must be at most {} MB",
                MAX_MEMORY_SIZE / (1024 * 1024)
            )));
        }
        let page = page_size();
        if self.memory_size % page != 0 {
            return Err(Error::Config(format!(
                "Memory size {:#x} is not a multiple of the host page size {:#x}",
                self.memory_size, page
            )));
        }

        if self.vcpus == 0 {
            return Err(Error::Config("Must have at least 1 vCPU".into()));
        }
        if self.vcpus > MAX_VCPUS {
            return Err(Error::Config(format!(
                "Maximum {} vCPUs supported",
                MAX_VCPUS
            )));
        }

        if let Some(top) = self.stack_top {
            if top >= self.memory_size as u64 {
                return Err(Error::Config(format!(
                    "Stack top {:#x} outside guest memory",
                    top
                )));
            }
        }
        let top = self.stack_pointer(0);
        if top % 16 != 0 {
            return Err(Error::Config(format!(
                "Stack top {:#x} must be 16-byte aligned",
                top
            )));
        }
        if self.stack_stride % 16 != 0 {
            return Err(Error::Config(format!(
                "Stack stride {:#x} must be a multiple of 16",
                self.stack_stride
            )));
        }
        let span = (self.vcpus as u64 - 1).checked_mul(self.stack_stride);
        if span.is_none_or(|span| span >= top) {
            return Err(Error::Config(format!(
                "{} stacks of {:#x} bytes do not fit below {:#x}",
                self.vcpus, self.stack_stride, top
            )));
        }

        Ok(())
    }
}
