//! Guest payloads
//!
//! A payload is one or more flat images copied into guest memory before any
//! vCPU is configured. A single image is shared by every vCPU; otherwise
//! there must be exactly one image per vCPU, in core order.

pub mod asm;

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::vmm::hypercall::{HYPERCALL_EXIT, HYPERCALL_PUTCHAR, HYPERCALL_PUTS};
use crate::vmm::memory::GuestMemoryRegion;
use crate::{Error, Result};

use self::asm::Cond;

/// Where the built-in programs are linked
pub const DEFAULT_LOAD_ADDR: u64 = 0x1_0000;

const EXIT: u16 = HYPERCALL_EXIT as u16;
const PUTCHAR: u16 = HYPERCALL_PUTCHAR as u16;
const PUTS: u16 = HYPERCALL_PUTS as u16;

/// Flat code/data blob and its entry point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestImage {
    /// Guest-physical address the bytes are copied to
    pub load_offset: u64,
    /// Raw bytes
    pub code: Vec<u8>,
    /// Guest-physical address of the first instruction
    pub entry: u64,
}

impl GuestImage {
    /// Image whose entry point is its first byte
    pub fn new(load_offset: u64, code: Vec<u8>) -> Self {
        Self {
            load_offset,
            code,
            entry: load_offset,
        }
    }

    /// Image assembled from instruction words
    pub fn from_insns(load_offset: u64, insns: &[u32]) -> Self {
        Self::new(load_offset, asm::assemble(insns))
    }

    /// Override the entry point
    pub fn with_entry(mut self, entry: u64) -> Self {
        self.entry = entry;
        self
    }
}

/// Everything that gets loaded into a VM before it runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestPayload {
    images: Vec<GuestImage>,
}

impl GuestPayload {
    /// One image run by every vCPU
    pub fn single(image: GuestImage) -> Self {
        Self {
            images: vec![image],
        }
    }

    /// One image per vCPU, in core order
    pub fn per_vcpu(images: Vec<GuestImage>) -> Self {
        Self { images }
    }

    /// Raw binary read from `path`
    pub fn from_file(path: &Path, load_addr: u64, entry: Option<u64>) -> Result<Self> {
        let code = fs::read(path)
            .map_err(|e| Error::Load(format!("failed to read {}: {}", path.display(), e)))?;
        if code.is_empty() {
            return Err(Error::Load(format!("{} is empty", path.display())));
        }
        let image = GuestImage::new(load_addr, code).with_entry(entry.unwrap_or(load_addr));
        Ok(Self::single(image))
    }

    pub fn images(&self) -> &[GuestImage] {
        &self.images
    }

    /// Check that the payload can serve `vcpus` cores
    pub fn check_vcpus(&self, vcpus: usize) -> Result<()> {
        match self.images.len() {
            0 => Err(Error::Load("payload has no images".into())),
            1 => Ok(()),
            n if n == vcpus => Ok(()),
            n => Err(Error::Load(format!(
                "payload has {} images for {} vCPUs (need 1 or {})",
                n, vcpus, vcpus
            ))),
        }
    }

    /// Image run by vCPU `index`
    pub fn image_for(&self, index: usize) -> Option<&GuestImage> {
        match self.images.as_slice() {
            [only] => Some(only),
            images => images.get(index),
        }
    }

    /// Entry point of vCPU `index`
    pub fn entry_for(&self, index: usize) -> Option<u64> {
        self.image_for(index).map(|image| image.entry)
    }

    /// Copy every image into `memory`, bounds checked
    pub fn load(&self, memory: &GuestMemoryRegion) -> Result<()> {
        for image in &self.images {
            if !memory.contains(image.load_offset, image.code.len()) {
                return Err(Error::Load(format!(
                    "{} byte image at {:#x} does not fit in {:#x} bytes of guest memory",
                    image.code.len(),
                    image.load_offset,
                    memory.len()
                )));
            }
            memory.write(image.load_offset, &image.code)?;
            debug!(
                "Loaded {} bytes of guest code at GPA {:#x}",
                image.code.len(),
                image.load_offset
            );
        }
        Ok(())
    }
}

/// Print `text` one PUTCHAR at a time
fn putchars(insns: &mut Vec<u32>, text: &[u8]) {
    for &c in text {
        insns.push(asm::movz(1, c as u16));
        insns.push(asm::movz(0, PUTCHAR));
        insns.push(asm::hvc(0));
    }
}

/// Prints `Hello from VM!`, counts `0 1 2 3 4`, then exits.
pub fn hello() -> GuestPayload {
    let mut insns = Vec::new();
    putchars(&mut insns, b"Hello from VM!\n");

    insns.push(asm::movz(19, 0));
    // loop:
    insns.extend([
        asm::movz(1, b'0' as u16),
        asm::add_reg(1, 1, 19),
        asm::movz(0, PUTCHAR),
        asm::hvc(0),
    ]);
    putchars(&mut insns, b" ");
    insns.extend([
        asm::add_imm(19, 19, 1),
        asm::cmp_imm(19, 5),
        asm::b_cond(Cond::Lt, -9),
    ]);
    putchars(&mut insns, b"\n");

    insns.extend([asm::movz(0, EXIT), asm::hvc(0), asm::b(0)]);
    GuestPayload::single(GuestImage::from_insns(DEFAULT_LOAD_ADDR, &insns))
}

/// Every core prints its own index as a digit, then exits.
///
/// Meant for up to ten vCPUs.
pub fn smp() -> GuestPayload {
    GuestPayload::single(GuestImage::from_insns(
        DEFAULT_LOAD_ADDR,
        &[
            asm::add_imm(1, 1, b'0' as u16),
            asm::movz(0, PUTCHAR),
            asm::hvc(0),
            asm::movz(0, EXIT),
            asm::hvc(0),
            asm::b(0),
        ],
    ))
}

/// Offset of the string inside the [`puts`] image
const PUTS_STRING_OFFSET: u16 = 0x100;

/// Prints a NUL-terminated string with a single PUTS, then exits.
pub fn puts() -> GuestPayload {
    let mut code = asm::assemble(&[
        asm::movz_lsl16(1, (DEFAULT_LOAD_ADDR >> 16) as u16),
        asm::add_imm(1, 1, PUTS_STRING_OFFSET),
        asm::movz(0, PUTS),
        asm::hvc(0),
        asm::movz(0, EXIT),
        asm::hvc(0),
        asm::b(0),
    ]);
    code.resize(PUTS_STRING_OFFSET as usize, 0);
    code.extend_from_slice(b"Hello via PUTS!\n\0");
    GuestPayload::single(GuestImage::new(DEFAULT_LOAD_ADDR, code))
}
