//! Minimal AArch64 instruction encoder for building guest payloads.
//!
//! Register numbers are raw (`0..=30`); 31 means `xzr` or `sp` depending on
//! the instruction, as in the architecture.

/// Condition codes for [`b_cond`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Cond {
    Eq = 0x0,
    Ne = 0x1,
    Hs = 0x2,
    Lo = 0x3,
    Mi = 0x4,
    Pl = 0x5,
    Hi = 0x8,
    Ls = 0x9,
    Ge = 0xa,
    Lt = 0xb,
    Gt = 0xc,
    Le = 0xd,
    Al = 0xe,
}

/// `mov xd, #imm16`
pub const fn movz(rd: u32, imm16: u16) -> u32 {
    0xd280_0000 | ((imm16 as u32) << 5) | (rd & 0x1f)
}

/// `mov xd, #(imm16 << 16)`
pub const fn movz_lsl16(rd: u32, imm16: u16) -> u32 {
    movz(rd, imm16) | (1 << 21)
}

/// `add xd, xn, #imm12`
pub const fn add_imm(rd: u32, rn: u32, imm12: u16) -> u32 {
    0x9100_0000 | (((imm12 & 0xfff) as u32) << 10) | ((rn & 0x1f) << 5) | (rd & 0x1f)
}

/// `add xd, xn, xm`
pub const fn add_reg(rd: u32, rn: u32, rm: u32) -> u32 {
    0x8b00_0000 | ((rm & 0x1f) << 16) | ((rn & 0x1f) << 5) | (rd & 0x1f)
}

/// `cmp xn, #imm12`
pub const fn cmp_imm(rn: u32, imm12: u16) -> u32 {
    0xf100_0000 | (((imm12 & 0xfff) as u32) << 10) | ((rn & 0x1f) << 5) | 0x1f
}

/// `b` by `offset` instructions relative to this one.
pub const fn b(offset: i32) -> u32 {
    0x1400_0000 | ((offset as u32) & 0x03ff_ffff)
}

/// `b.<cond>` by `offset` instructions relative to this one.
pub const fn b_cond(cond: Cond, offset: i32) -> u32 {
    0x5400_0000 | (((offset as u32) & 0x7_ffff) << 5) | cond as u32
}

/// `ldrb wt, [xn, #offset]`
pub const fn ldrb(rt: u32, rn: u32, offset: u16) -> u32 {
    0x3940_0000 | (((offset & 0xfff) as u32) << 10) | ((rn & 0x1f) << 5) | (rt & 0x1f)
}

/// `strb wt, [xn, #offset]`
pub const fn strb(rt: u32, rn: u32, offset: u16) -> u32 {
    0x3900_0000 | (((offset & 0xfff) as u32) << 10) | ((rn & 0x1f) << 5) | (rt & 0x1f)
}

/// `hvc #imm16`
pub const fn hvc(imm16: u16) -> u32 {
    0xd400_0002 | ((imm16 as u32) << 5)
}

/// `mrs xt, midr_el1`
pub const fn mrs_midr(rt: u32) -> u32 {
    0xd538_0000 | (rt & 0x1f)
}

/// `msr tpidr_el1, xt`
pub const fn msr_tpidr_el1(rt: u32) -> u32 {
    0xd518_d080 | (rt & 0x1f)
}

pub const fn nop() -> u32 {
    0xd503_201f
}

/// Flatten instruction words into little-endian bytes.
pub fn assemble(code: &[u32]) -> Vec<u8> {
    code.iter().flat_map(|insn| insn.to_le_bytes()).collect()
}
