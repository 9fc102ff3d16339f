//! tinyvmm CLI entry point.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tinyvmm::backend::emulated::EmulatedHypervisor;
use tinyvmm::backend::Hypervisor;
use tinyvmm::devices::OutputSink;
use tinyvmm::guest::{self, GuestPayload, DEFAULT_LOAD_ADDR};
use tinyvmm::{Error, Result, VirtualMachine, VmConfig, VmReport};

/// tinyvmm - minimal AArch64 virtual machine monitor
#[derive(Parser, Debug)]
#[command(name = "tinyvmm")]
#[command(about = "Run flat AArch64 guest programs with a hypercall console")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a VM, run a guest program to completion and tear it down
    Run(RunCmd),
}

#[derive(Args, Debug)]
struct RunCmd {
    /// VM configuration file (YAML or JSON); flags override its values
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Built-in guest program
    #[arg(long, value_enum, conflicts_with = "binary")]
    program: Option<Program>,

    /// Raw guest binary to load instead of a built-in program
    #[arg(long, value_name = "FILE")]
    binary: Option<PathBuf>,

    /// Guest-physical address the binary is loaded at [default: 0x10000]
    #[arg(long, value_parser = parse_addr, requires = "binary")]
    load_addr: Option<u64>,

    /// Guest-physical entry point (default: the load address)
    #[arg(long, value_parser = parse_addr, requires = "binary")]
    entry: Option<u64>,

    /// Number of vCPUs
    #[arg(long, help_heading = "Resources")]
    vcpus: Option<usize>,

    /// Guest memory in KiB
    #[arg(long, value_name = "KB", help_heading = "Resources")]
    memory_kb: Option<usize>,

    /// Value handed to the guest in x0
    #[arg(long, value_parser = parse_addr, help_heading = "Resources")]
    vm_id: Option<u64>,

    /// Virtualization backend
    #[arg(long, value_enum, default_value_t = Backend::default(), env = "TINYVMM_BACKEND")]
    backend: Backend,

    /// Cancel each vCPU after this many instructions (emulated backend only)
    #[arg(long, value_name = "N")]
    max_instructions: Option<u64>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Program {
    /// "Hello from VM!" and a counter
    Hello,
    /// Each core prints its index
    Smp,
    /// A string printed with one PUTS call
    Puts,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Apple Hypervisor.framework
    Hvf,
    /// Built-in AArch64 interpreter
    Emulated,
}

impl Default for Backend {
    fn default() -> Self {
        if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
            Backend::Hvf
        } else {
            Backend::Emulated
        }
    }
}

/// Parse a decimal or `0x`-prefixed hexadecimal number.
fn parse_addr(s: &str) -> std::result::Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", s, e))
}

impl RunCmd {
    fn vm_config(&self) -> Result<VmConfig> {
        let mut config = match &self.config {
            Some(path) => VmConfig::load(path)?,
            None => VmConfig::default(),
        };
        if let Some(vcpus) = self.vcpus {
            config.vcpus = vcpus;
        }
        if let Some(kb) = self.memory_kb {
            config.memory_size = kb
                .checked_mul(1024)
                .ok_or_else(|| Error::Config(format!("{} KB is too much memory", kb)))?;
        }
        if let Some(id) = self.vm_id {
            config.vm_id = id;
        }
        Ok(config)
    }

    fn payload(&self) -> Result<GuestPayload> {
        if let Some(path) = &self.binary {
            let load_addr = self.load_addr.unwrap_or(DEFAULT_LOAD_ADDR);
            return GuestPayload::from_file(path, load_addr, self.entry);
        }
        Ok(match self.program.unwrap_or(Program::Hello) {
            Program::Hello => guest::hello(),
            Program::Smp => guest::smp(),
            Program::Puts => guest::puts(),
        })
    }

    fn run(&self) -> Result<VmReport> {
        let config = self.vm_config()?;
        let payload = self.payload()?;

        match self.backend {
            Backend::Emulated => {
                let mut hv = EmulatedHypervisor::new();
                if let Some(n) = self.max_instructions {
                    hv = hv.with_instruction_budget(n);
                }
                run_vm(hv, config, &payload)
            }
            Backend::Hvf => run_hvf(config, &payload),
        }
    }
}

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
fn run_hvf(config: VmConfig, payload: &GuestPayload) -> Result<VmReport> {
    run_vm(tinyvmm::backend::hvf::HvfHypervisor::new(), config, payload)
}

#[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
fn run_hvf(_config: VmConfig, _payload: &GuestPayload) -> Result<VmReport> {
    Err(Error::Config(
        "the hvf backend needs macOS on Apple silicon; use --backend emulated".into(),
    ))
}

fn run_vm<H: Hypervisor>(hv: H, config: VmConfig, payload: &GuestPayload) -> Result<VmReport> {
    let mut vm = VirtualMachine::create(hv, config)?;
    let report = vm.run(payload, &OutputSink::stdout())?;
    vm.destroy()?;
    Ok(report)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging();

    let result = match cli.command {
        Commands::Run(cmd) => cmd.run(),
    };

    match result {
        Ok(report) => {
            for vcpu in &report.vcpus {
                info!(
                    "vCPU {}: {} ({} exits, {} hypercalls)",
                    vcpu.index, vcpu.cause, vcpu.exits, vcpu.hypercalls
                );
            }
            if report.success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Initialize the tracing subscriber on stderr; guest output owns stdout.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_addr() {
        assert_eq!(parse_addr("0x10000").unwrap(), 0x10000);
        assert_eq!(parse_addr("4096").unwrap(), 4096);
        assert_eq!(parse_addr("0x1_0000").unwrap(), 0x10000);
        assert!(parse_addr("0xzz").is_err());
    }

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "tinyvmm",
            "run",
            "--program",
            "smp",
            "--vcpus",
            "4",
            "--memory-kb",
            "512",
            "--vm-id",
            "0x2a",
            "--backend",
            "emulated",
        ])
        .unwrap();
        let Commands::Run(cmd) = cli.command;
        let config = cmd.vm_config().unwrap();
        assert_eq!(config.vcpus, 4);
        assert_eq!(config.memory_size, 512 * 1024);
        assert_eq!(config.vm_id, 42);
        assert_eq!(cmd.backend, Backend::Emulated);
    }

    #[test]
    fn test_program_conflicts_with_binary() {
        assert!(Cli::try_parse_from([
            "tinyvmm",
            "run",
            "--program",
            "hello",
            "--binary",
            "guest.bin"
        ])
        .is_err());
        assert!(Cli::try_parse_from(["tinyvmm", "run", "--entry", "0x10000"]).is_err());
    }
}
