#![cfg(all(target_os = "macos", target_arch = "aarch64"))]
//! Hypervisor.framework smoke tests.
//!
//! These run real guests on Apple silicon and are **opt-in**: the test
//! binary must be signed with the `com.apple.security.hypervisor`
//! entitlement, and Hypervisor.framework allows one VM per process, so run
//! them single-threaded:
//!
//! ```bash
//! cargo test --test hvf_integration -- --ignored --test-threads=1
//! ```

use tinyvmm::backend::hvf::HvfHypervisor;
use tinyvmm::devices::OutputSink;
use tinyvmm::{guest, VirtualMachine, VmConfig};

#[test]
#[ignore = "requires the hypervisor entitlement"]
fn test_hvf_hello() {
    let mut vm = VirtualMachine::create(HvfHypervisor::new(), VmConfig::new()).unwrap();
    let (sink, out) = OutputSink::capture();

    let report = vm.run(&guest::hello(), &sink).unwrap();
    vm.destroy().unwrap();

    assert!(report.success(), "{report:?}");
    assert_eq!(out.to_string_lossy(), "Hello from VM!\n0 1 2 3 4 \n");
}

#[test]
#[ignore = "requires the hypervisor entitlement"]
fn test_hvf_smp() {
    let config = VmConfig::new().vcpus(4);
    let mut vm = VirtualMachine::create(HvfHypervisor::new(), config).unwrap();
    let (sink, out) = OutputSink::capture();

    let report = vm.run(&guest::smp(), &sink).unwrap();
    vm.destroy().unwrap();

    assert!(report.success(), "{report:?}");
    let mut digits = out.bytes();
    digits.sort_unstable();
    assert_eq!(digits, b"0123");
}
