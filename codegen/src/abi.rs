//! The calling convention descriptor.
//!
//! A function receives the `VMContext` pointer in a fixed register, followed
//! by its WebAssembly parameters. Each parameter is assigned either a
//! register or a slot in the caller's outgoing argument area. At most one
//! result is returned, in the class-specific return register.

use crate::isa::reg::{Reg, RegClass};
use crate::masm::OperandSize;
use smallvec::SmallVec;
use wasmparser::{FuncType, ValType};

/// The location of a single parameter.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum ABIArg {
    /// A parameter passed in a register.
    Reg { ty: ValType, reg: Reg },
    /// A parameter passed on the stack, at `offset` bytes into the caller's
    /// argument area.
    Stack { ty: ValType, offset: u32 },
}

impl ABIArg {
    pub fn ty(&self) -> ValType {
        match self {
            Self::Reg { ty, .. } | Self::Stack { ty, .. } => *ty,
        }
    }
}

/// The result location.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct ABIResult {
    pub ty: ValType,
    pub reg: Reg,
}

/// The mapping from a function signature to parameter and result locations.
#[derive(Debug, Clone)]
pub(crate) struct ABISig {
    /// The parameter locations, in declaration order.
    pub params: SmallVec<[ABIArg; 6]>,
    /// The results of the signature; more than one result can't be compiled
    /// but is still described.
    pub results: SmallVec<[ValType; 1]>,
    /// The location of the single result, if any.
    pub result: Option<ABIResult>,
    /// Bytes of stack arguments, popped by the callee on return.
    pub stack_args_size: u32,
}

impl ABISig {
    /// Create a signature descriptor for the target ABI.
    pub fn new<A: ABI>(sig: &FuncType) -> Self {
        let mut int_index = 0;
        let mut float_index = 0;
        let mut stack_offset = 0;
        let word = u32::from(A::word_bytes());

        let params = sig
            .params()
            .iter()
            .map(|ty| {
                let reg = match reg_class_for(*ty) {
                    RegClass::Int => A::int_arg_reg(&mut int_index),
                    _ => A::float_arg_reg(&mut float_index),
                };
                match reg {
                    Some(reg) => ABIArg::Reg { ty: *ty, reg },
                    None => {
                        let offset = stack_offset;
                        stack_offset += word;
                        ABIArg::Stack { ty: *ty, offset }
                    }
                }
            })
            .collect();

        let results: SmallVec<[ValType; 1]> = sig.results().iter().copied().collect();
        let result = match results.as_slice() {
            [ty] => Some(ABIResult {
                ty: *ty,
                reg: A::ret_reg(reg_class_for(*ty)),
            }),
            _ => None,
        };

        Self {
            params,
            results,
            result,
            stack_args_size: stack_offset,
        }
    }
}

/// The register class that holds values of the given type.
pub(crate) fn reg_class_for(ty: ValType) -> RegClass {
    match ty {
        ValType::F32 | ValType::F64 | ValType::V128 => RegClass::Float,
        _ => RegClass::Int,
    }
}

/// The operand size of a pointer on targets handled here.
pub(crate) fn ptr_size<A: ABI>() -> OperandSize {
    match A::word_bytes() {
        4 => OperandSize::S32,
        _ => OperandSize::S64,
    }
}

/// Trait implemented by a specific ISA and used to provide
/// information about alignment, parameter passing, usage of
/// specific registers, etc.
pub(crate) trait ABI {
    /// The size of a machine word, in bytes.
    fn word_bytes() -> u8;

    /// The required stack alignment, in bytes.
    fn stack_align() -> u8;

    /// The register the caller passes the `VMContext` in.
    fn vmctx_arg_reg() -> Reg;

    /// The pinned register holding the `VMContext` for the whole function.
    fn vmctx_reg() -> Reg;

    /// The next integer argument register, advancing `index`.
    fn int_arg_reg(index: &mut usize) -> Option<Reg>;

    /// The next float argument register, advancing `index`.
    fn float_arg_reg(index: &mut usize) -> Option<Reg>;

    /// The return register for the given class.
    fn ret_reg(class: RegClass) -> Reg;

    /// The scratch register.
    fn scratch_reg() -> Reg;

    /// The float scratch register.
    fn float_scratch_reg() -> Reg;
}
