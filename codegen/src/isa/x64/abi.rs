use super::regs;
use crate::abi::ABI;
use crate::isa::reg::{Reg, RegClass};

/// The integer parameter registers, after the `VMContext` in `rdi`.
const INT_ARGS: [fn() -> Reg; 5] = [regs::rsi, regs::rdx, regs::rcx, regs::r8, regs::r9];

/// The number of float parameter registers, `xmm0` to `xmm7`.
const FLOAT_ARGS: usize = 8;

/// The x64 calling convention: System V argument registers, with the
/// `VMContext` as the first integer argument.
#[derive(Default)]
pub(crate) struct X64ABI;

impl ABI for X64ABI {
    fn word_bytes() -> u8 {
        8
    }

    fn stack_align() -> u8 {
        16
    }

    fn vmctx_arg_reg() -> Reg {
        regs::rdi()
    }

    fn vmctx_reg() -> Reg {
        regs::vmctx()
    }

    fn int_arg_reg(index: &mut usize) -> Option<Reg> {
        let reg = INT_ARGS.get(*index).map(|ctor| ctor())?;
        *index += 1;
        Some(reg)
    }

    fn float_arg_reg(index: &mut usize) -> Option<Reg> {
        if *index >= FLOAT_ARGS {
            return None;
        }
        let reg = regs::xmm(*index);
        *index += 1;
        Some(reg)
    }

    fn ret_reg(class: RegClass) -> Reg {
        match class {
            RegClass::Int => regs::rax(),
            _ => regs::xmm(0),
        }
    }

    fn scratch_reg() -> Reg {
        regs::scratch()
    }

    fn float_scratch_reg() -> Reg {
        regs::float_scratch()
    }
}
