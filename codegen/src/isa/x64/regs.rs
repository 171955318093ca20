//! X64 register definition.

use crate::isa::reg::{Reg, RegClass};
use crate::regset::{RegBitSet, RegSet};

const ENC_RAX: usize = 0;
const ENC_RCX: usize = 1;
const ENC_RDX: usize = 2;
const ENC_RBX: usize = 3;
const ENC_RSP: usize = 4;
const ENC_RBP: usize = 5;
const ENC_RSI: usize = 6;
const ENC_RDI: usize = 7;
const ENC_R8: usize = 8;
const ENC_R9: usize = 9;
const ENC_R11: usize = 11;
const ENC_R14: usize = 14;

fn gpr(enc: usize) -> Reg {
    Reg::from(RegClass::Int, enc)
}

fn fpr(enc: usize) -> Reg {
    Reg::from(RegClass::Float, enc)
}

/// Constructors for GPR.

pub(crate) fn rax() -> Reg {
    gpr(ENC_RAX)
}
pub(crate) fn rcx() -> Reg {
    gpr(ENC_RCX)
}
pub(crate) fn rdx() -> Reg {
    gpr(ENC_RDX)
}
pub(crate) fn rbx() -> Reg {
    gpr(ENC_RBX)
}
pub(crate) fn rsi() -> Reg {
    gpr(ENC_RSI)
}
pub(crate) fn rdi() -> Reg {
    gpr(ENC_RDI)
}
pub(crate) fn r8() -> Reg {
    gpr(ENC_R8)
}
pub(crate) fn r9() -> Reg {
    gpr(ENC_R9)
}
pub(crate) fn rsp() -> Reg {
    gpr(ENC_RSP)
}
pub(crate) fn rbp() -> Reg {
    gpr(ENC_RBP)
}

/// Used as the scratch register.
/// Non-allocatable.
pub(crate) fn scratch() -> Reg {
    gpr(ENC_R11)
}

/// Used as a pinned register to hold the `VMContext` for the whole
/// function. Non-allocatable.
pub(crate) fn vmctx() -> Reg {
    gpr(ENC_R14)
}

/// Constructors for FPR.

pub(crate) fn xmm(enc: usize) -> Reg {
    debug_assert!(enc < MAX_FPR);
    fpr(enc)
}

/// Used as the float scratch register.
/// Non-allocatable.
pub(crate) fn float_scratch() -> Reg {
    fpr(15)
}

const MAX_GPR: usize = 16;
const MAX_FPR: usize = 16;

const ALL_GPR: u64 = (1 << MAX_GPR) - 1;
const NON_ALLOCATABLE_GPR: u64 =
    (1 << ENC_RBP) | (1 << ENC_RSP) | (1 << ENC_R11) | (1 << ENC_R14);

const ALL_FPR: u64 = (1 << MAX_FPR) - 1;
const NON_ALLOCATABLE_FPR: u64 = 1 << 15;

/// The registers handed out by the cache state.
pub(crate) fn allocatable() -> RegSet {
    RegSet::new(
        RegBitSet::int(ALL_GPR & !NON_ALLOCATABLE_GPR, NON_ALLOCATABLE_GPR, MAX_GPR),
        RegBitSet::float(ALL_FPR & !NON_ALLOCATABLE_FPR, NON_ALLOCATABLE_FPR, MAX_FPR),
    )
}

const GPR_NAMES: [[&str; 4]; 16] = [
    ["al", "ax", "eax", "rax"],
    ["cl", "cx", "ecx", "rcx"],
    ["dl", "dx", "edx", "rdx"],
    ["bl", "bx", "ebx", "rbx"],
    ["spl", "sp", "esp", "rsp"],
    ["bpl", "bp", "ebp", "rbp"],
    ["sil", "si", "esi", "rsi"],
    ["dil", "di", "edi", "rdi"],
    ["r8b", "r8w", "r8d", "r8"],
    ["r9b", "r9w", "r9d", "r9"],
    ["r10b", "r10w", "r10d", "r10"],
    ["r11b", "r11w", "r11d", "r11"],
    ["r12b", "r12w", "r12d", "r12"],
    ["r13b", "r13w", "r13d", "r13"],
    ["r14b", "r14w", "r14d", "r14"],
    ["r15b", "r15w", "r15d", "r15"],
];

/// The assembly name of a general purpose register accessed with the
/// given width, in bytes.
pub(crate) fn gpr_name(reg: Reg, bytes: u32) -> &'static str {
    let names = &GPR_NAMES[reg.hw_enc()];
    match bytes {
        1 => names[0],
        2 => names[1],
        4 => names[2],
        _ => names[3],
    }
}
