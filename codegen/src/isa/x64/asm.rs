//! Assembler library implementation for x64.
//!
//! Instructions are recorded symbolically and printed in Intel syntax. Each
//! recorded instruction advances the code offset by one.

use super::{address::Address, regs::gpr_name};
use crate::{
    buffer::{CodeBuffer, FinalizedCode, MachLabel},
    isa::reg::Reg,
    masm::{Builtin, ExtendKind, IntCmpKind, OperandSize},
};
use anyhow::Result;
use core::fmt;

/// Integer ALU operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum AluOp {
    Add,
    Sub,
    Imul,
    And,
    Or,
    Xor,
    Cmp,
}

impl AluOp {
    fn mnemonic(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Imul => "imul",
            Self::And => "and",
            Self::Or => "or",
            Self::Xor => "xor",
            Self::Cmp => "cmp",
        }
    }
}

/// Scalar single precision operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum XmmOp {
    Addss,
    Subss,
    Mulss,
}

impl XmmOp {
    fn mnemonic(&self) -> &'static str {
        match self {
            Self::Addss => "addss",
            Self::Subss => "subss",
            Self::Mulss => "mulss",
        }
    }
}

/// A recorded x64 instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Inst {
    Push { reg: Reg },
    Pop { reg: Reg },
    MovRR { src: Reg, dst: Reg, size: OperandSize },
    MovIR { imm: i32, dst: Reg, size: OperandSize },
    MovRM { src: Reg, dst: Address, size: OperandSize },
    MovIM { imm: i32, dst: Address, size: OperandSize },
    MovMR { src: Address, dst: Reg, size: OperandSize },
    MovExtendMR { src: Address, dst: Reg, kind: ExtendKind },
    /// Move between a general purpose and an xmm register.
    Movd { src: Reg, dst: Reg, size: OperandSize },
    XmmMovRR { src: Reg, dst: Reg },
    XmmMovRM { src: Reg, dst: Address, size: OperandSize },
    XmmMovMR { src: Address, dst: Reg, size: OperandSize },
    /// Zero an xmm register.
    XmmZero { dst: Reg },
    AluRR { op: AluOp, src: Reg, dst: Reg, size: OperandSize },
    AluIR { op: AluOp, imm: i32, dst: Reg, size: OperandSize },
    CmpRM { lhs: Reg, rhs: Address, size: OperandSize },
    XmmAluRR { op: XmmOp, src: Reg, dst: Reg },
    Test { reg: Reg, size: OperandSize },
    Jmp { target: MachLabel },
    JmpIf { cc: IntCmpKind, target: MachLabel },
    CallBuiltin { builtin: Builtin },
    CallTrapCallback,
    Ret { stack_arg_bytes: u32 },
    Ud2,
}

struct Gpr(Reg, OperandSize);

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(gpr_name(self.0, self.1.bytes()))
    }
}

struct Xmm(Reg);

impl fmt::Display for Xmm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xmm{}", self.0.hw_enc())
    }
}

struct Mem(Address, OperandSize);

impl fmt::Display for Mem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ptr = match self.1 {
            OperandSize::S8 => "byte",
            OperandSize::S16 => "word",
            OperandSize::S32 => "dword",
            OperandSize::S64 => "qword",
        };
        write!(f, "{ptr} ptr {}", self.0)
    }
}

struct Imm(i32);

impl fmt::Display for Imm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 < 0 {
            write!(f, "-{:#x}", self.0.unsigned_abs())
        } else {
            write!(f, "{:#x}", self.0)
        }
    }
}

fn cc_suffix(cc: IntCmpKind) -> &'static str {
    match cc {
        IntCmpKind::Eq => "e",
        IntCmpKind::LeU => "be",
        IntCmpKind::GeU => "ae",
    }
}

fn xmm_mov(size: OperandSize) -> &'static str {
    match size {
        OperandSize::S64 => "movsd",
        _ => "movss",
    }
}

impl Inst {
    /// Print the instruction, with branch targets resolved through `label`.
    pub fn render(&self, label: &dyn Fn(MachLabel) -> Option<u32>) -> String {
        let target = |l: MachLabel| match label(l) {
            Some(offset) => format!("{offset:#x}"),
            None => l.to_string(),
        };
        match *self {
            Inst::Jmp { target: t } => format!("jmp {}", target(t)),
            Inst::JmpIf { cc, target: t } => format!("j{} {}", cc_suffix(cc), target(t)),
            _ => self.to_string(),
        }
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use OperandSize::*;
        match *self {
            Inst::Push { reg } => write!(f, "push {}", Gpr(reg, S64)),
            Inst::Pop { reg } => write!(f, "pop {}", Gpr(reg, S64)),
            Inst::MovRR { src, dst, size } => {
                write!(f, "mov {}, {}", Gpr(dst, size), Gpr(src, size))
            }
            Inst::MovIR { imm, dst, size } => write!(f, "mov {}, {}", Gpr(dst, size), Imm(imm)),
            Inst::MovRM { src, dst, size } => {
                write!(f, "mov {}, {}", Mem(dst, size), Gpr(src, size))
            }
            Inst::MovIM { imm, dst, size } => write!(f, "mov {}, {}", Mem(dst, size), Imm(imm)),
            Inst::MovMR { src, dst, size } => {
                write!(f, "mov {}, {}", Gpr(dst, size), Mem(src, size))
            }
            Inst::MovExtendMR { src, dst, kind } => {
                let op = if kind.signed() { "movsx" } else { "movzx" };
                write!(f, "{op} {}, {}", Gpr(dst, S32), Mem(src, kind.from_size()))
            }
            Inst::Movd { src, dst, size } => {
                let op = if size == S64 { "movq" } else { "movd" };
                match (src.is_float(), dst.is_float()) {
                    (false, true) => write!(f, "{op} {}, {}", Xmm(dst), Gpr(src, size)),
                    _ => write!(f, "{op} {}, {}", Gpr(dst, size), Xmm(src)),
                }
            }
            Inst::XmmMovRR { src, dst } => write!(f, "movaps {}, {}", Xmm(dst), Xmm(src)),
            Inst::XmmMovRM { src, dst, size } => {
                write!(f, "{} {}, {}", xmm_mov(size), Mem(dst, size), Xmm(src))
            }
            Inst::XmmMovMR { src, dst, size } => {
                write!(f, "{} {}, {}", xmm_mov(size), Xmm(dst), Mem(src, size))
            }
            Inst::XmmZero { dst } => write!(f, "xorps {}, {}", Xmm(dst), Xmm(dst)),
            Inst::AluRR { op, src, dst, size } => {
                write!(f, "{} {}, {}", op.mnemonic(), Gpr(dst, size), Gpr(src, size))
            }
            Inst::AluIR { op, imm, dst, size } => {
                write!(f, "{} {}, {}", op.mnemonic(), Gpr(dst, size), Imm(imm))
            }
            Inst::CmpRM { lhs, rhs, size } => {
                write!(f, "cmp {}, {}", Gpr(lhs, size), Mem(rhs, size))
            }
            Inst::XmmAluRR { op, src, dst } => {
                write!(f, "{} {}, {}", op.mnemonic(), Xmm(dst), Xmm(src))
            }
            Inst::Test { reg, size } => {
                write!(f, "test {}, {}", Gpr(reg, size), Gpr(reg, size))
            }
            Inst::Jmp { target } => write!(f, "jmp {target}"),
            Inst::JmpIf { cc, target } => write!(f, "j{} {target}", cc_suffix(cc)),
            Inst::CallBuiltin { builtin } => write!(f, "call {builtin}"),
            Inst::CallTrapCallback => write!(f, "call trap_callback_for_testing"),
            Inst::Ret { stack_arg_bytes: 0 } => write!(f, "ret"),
            Inst::Ret { stack_arg_bytes } => write!(f, "ret {}", Imm(stack_arg_bytes as i32)),
            Inst::Ud2 => write!(f, "ud2"),
        }
    }
}

/// Low level assembler implementation for x64.
#[derive(Default)]
pub(crate) struct Assembler {
    buffer: CodeBuffer<Inst>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    fn emit(&mut self, inst: Inst) {
        self.buffer.push(inst);
    }

    pub fn buffer(&self) -> &CodeBuffer<Inst> {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut CodeBuffer<Inst> {
        &mut self.buffer
    }

    pub fn finalize(self) -> Result<FinalizedCode> {
        self.buffer.finalize(|inst, label| inst.render(label))
    }

    pub fn push_r(&mut self, reg: Reg) {
        self.emit(Inst::Push { reg });
    }

    pub fn pop_r(&mut self, reg: Reg) {
        self.emit(Inst::Pop { reg });
    }

    /// Register-to-register move.
    pub fn mov_rr(&mut self, src: Reg, dst: Reg, size: OperandSize) {
        self.emit(Inst::MovRR { src, dst, size });
    }

    /// Immediate-to-register move.
    pub fn mov_ir(&mut self, imm: i32, dst: Reg, size: OperandSize) {
        self.emit(Inst::MovIR { imm, dst, size });
    }

    /// Register-to-memory move.
    pub fn mov_rm(&mut self, src: Reg, dst: Address, size: OperandSize) {
        self.emit(Inst::MovRM { src, dst, size });
    }

    /// Immediate-to-memory move.
    pub fn mov_im(&mut self, imm: i32, dst: Address, size: OperandSize) {
        self.emit(Inst::MovIM { imm, dst, size });
    }

    /// Memory-to-register load.
    pub fn mov_mr(&mut self, src: Address, dst: Reg, size: OperandSize) {
        self.emit(Inst::MovMR { src, dst, size });
    }

    /// Memory-to-register load with sign or zero extension.
    pub fn movx_mr(&mut self, src: Address, dst: Reg, kind: ExtendKind) {
        self.emit(Inst::MovExtendMR { src, dst, kind });
    }

    /// Move bits between a general purpose and an xmm register.
    pub fn movd(&mut self, src: Reg, dst: Reg, size: OperandSize) {
        self.emit(Inst::Movd { src, dst, size });
    }

    pub fn xmm_mov_rr(&mut self, src: Reg, dst: Reg) {
        self.emit(Inst::XmmMovRR { src, dst });
    }

    pub fn xmm_mov_rm(&mut self, src: Reg, dst: Address, size: OperandSize) {
        self.emit(Inst::XmmMovRM { src, dst, size });
    }

    pub fn xmm_mov_mr(&mut self, src: Address, dst: Reg, size: OperandSize) {
        self.emit(Inst::XmmMovMR { src, dst, size });
    }

    pub fn xmm_zero(&mut self, dst: Reg) {
        self.emit(Inst::XmmZero { dst });
    }

    pub fn alu_rr(&mut self, op: AluOp, src: Reg, dst: Reg, size: OperandSize) {
        self.emit(Inst::AluRR { op, src, dst, size });
    }

    pub fn alu_ir(&mut self, op: AluOp, imm: i32, dst: Reg, size: OperandSize) {
        self.emit(Inst::AluIR { op, imm, dst, size });
    }

    pub fn cmp_rm(&mut self, lhs: Reg, rhs: Address, size: OperandSize) {
        self.emit(Inst::CmpRM { lhs, rhs, size });
    }

    pub fn xmm_alu_rr(&mut self, op: XmmOp, src: Reg, dst: Reg) {
        self.emit(Inst::XmmAluRR { op, src, dst });
    }

    pub fn test_rr(&mut self, reg: Reg, size: OperandSize) {
        self.emit(Inst::Test { reg, size });
    }

    pub fn jmp(&mut self, target: MachLabel) {
        self.buffer.use_label(target);
        self.emit(Inst::Jmp { target });
    }

    pub fn jmp_if(&mut self, cc: IntCmpKind, target: MachLabel) {
        self.buffer.use_label(target);
        self.emit(Inst::JmpIf { cc, target });
    }

    pub fn call_builtin(&mut self, builtin: Builtin) {
        self.emit(Inst::CallBuiltin { builtin });
    }

    pub fn call_trap_callback(&mut self) {
        self.emit(Inst::CallTrapCallback);
    }

    pub fn ret(&mut self, stack_arg_bytes: u32) {
        self.emit(Inst::Ret { stack_arg_bytes });
    }

    pub fn ud2(&mut self) {
        self.emit(Inst::Ud2);
    }
}

#[cfg(test)]
mod tests {
    use super::{AluOp, Assembler};
    use crate::isa::x64::{address::Address, regs};
    use crate::masm::{ExtendKind, IntCmpKind, OperandSize};

    #[test]
    fn test_intel_syntax() {
        let mut asm = Assembler::new();
        asm.mov_ir(-1, regs::rcx(), OperandSize::S32);
        asm.mov_rm(
            regs::rbx(),
            Address::offset(regs::rbp(), -16),
            OperandSize::S32,
        );
        asm.alu_rr(AluOp::Imul, regs::rdx(), regs::rax(), OperandSize::S64);
        asm.movx_mr(
            Address::indexed(regs::rax(), regs::rcx(), 3),
            regs::rdx(),
            ExtendKind::Signed8,
        );
        asm.movd(regs::scratch(), regs::xmm(2), OperandSize::S32);
        asm.ret(0);
        let code = asm.finalize().unwrap();
        assert_eq!(
            code.insts(),
            &[
                "mov ecx, -0x1",
                "mov dword ptr [rbp - 0x10], ebx",
                "imul rax, rdx",
                "movsx edx, byte ptr [rax + rcx + 0x3]",
                "movd xmm2, r11d",
                "ret",
            ]
        );
    }

    #[test]
    fn test_jumps_resolve_to_offsets() {
        let mut asm = Assembler::new();
        let label = asm.buffer_mut().get_label();
        asm.jmp_if(IntCmpKind::GeU, label);
        asm.ud2();
        asm.buffer_mut().bind_label(label).unwrap();
        asm.ret(8);
        let code = asm.finalize().unwrap();
        assert_eq!(code.insts(), &["jae 0x2", "ud2", "ret 0x8"]);
    }
}
