use crate::abi::ABI;
use crate::buffer::{FinalizedCode, MachLabel};
use crate::isa::reg::Reg;
use crate::regset::RegList;
use anyhow::Result;
use core::fmt;
use wasmparser::ValType;

/// Operand size, in bits.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum OperandSize {
    /// 8 bits.
    S8,
    /// 16 bits.
    S16,
    /// 32 bits.
    S32,
    /// 64 bits.
    S64,
}

impl OperandSize {
    /// The number of bytes in the operand.
    pub fn bytes(&self) -> u32 {
        match self {
            Self::S8 => 1,
            Self::S16 => 2,
            Self::S32 => 4,
            Self::S64 => 8,
        }
    }

    /// The operand size used to move a value of the given type.
    pub fn for_type(ty: ValType) -> Self {
        match ty {
            ValType::I32 | ValType::F32 => Self::S32,
            _ => Self::S64,
        }
    }
}

/// Integer comparison kinds, used for conditional jumps.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum IntCmpKind {
    /// Equal.
    Eq,
    /// Unsigned less than or equal.
    LeU,
    /// Unsigned greater than or equal.
    GeU,
}

/// Sign or zero extension of narrow memory loads.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum ExtendKind {
    /// Sign-extend 8 bits to 32.
    Signed8,
    /// Zero-extend 8 bits to 32.
    Unsigned8,
    /// Sign-extend 16 bits to 32.
    Signed16,
    /// Zero-extend 16 bits to 32.
    Unsigned16,
}

impl ExtendKind {
    /// The size of the loaded value.
    pub fn from_size(&self) -> OperandSize {
        match self {
            Self::Signed8 | Self::Unsigned8 => OperandSize::S8,
            Self::Signed16 | Self::Unsigned16 => OperandSize::S16,
        }
    }

    pub fn signed(&self) -> bool {
        matches!(self, Self::Signed8 | Self::Signed16)
    }
}

/// An immediate.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Imm {
    /// 32-bit integer.
    I32(i32),
    /// 32-bit float, as raw bits.
    F32(u32),
}

/// A register or an immediate operand.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum RegImm {
    /// A register operand.
    Reg(Reg),
    /// An immediate operand.
    Imm(Imm),
}

impl RegImm {
    /// Register constructor.
    pub fn reg(r: Reg) -> Self {
        RegImm::Reg(r)
    }

    /// I32 immediate constructor.
    pub fn i32(v: i32) -> Self {
        RegImm::Imm(Imm::I32(v))
    }

    /// F32 immediate, stored using its bits representation.
    pub fn f32(bits: u32) -> Self {
        RegImm::Imm(Imm::F32(bits))
    }
}

impl From<Reg> for RegImm {
    fn from(r: Reg) -> Self {
        Self::Reg(r)
    }
}

/// Runtime stubs called from out-of-line code.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Builtin {
    /// Raises the out-of-bounds memory access trap; never returns.
    ThrowMemOutOfBounds,
    /// Handles a stack limit hit at function entry and returns.
    StackGuard,
}

impl fmt::Display for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Builtin::ThrowMemOutOfBounds => write!(f, "ThrowWasmTrapMemOutOfBounds"),
            Builtin::StackGuard => write!(f, "WasmStackGuard"),
        }
    }
}

/// Generic MacroAssembler interface used by the code generation.
///
/// The MacroAssembler trait aims to expose an interface, high-level enough,
/// so that each ISA can provide its own lowering to machine code. For
/// example, for WebAssembly operators that don't have a direct mapping to a
/// machine instruction, the interface defines a signature matching the
/// WebAssembly operator, allowing each implementation to lower such operator
/// entirely.
///
/// Stack slots are addressed by index: slot `i` of the cache state always
/// lives at the same frame offset, so spilling a value never moves it
/// relative to the others.
pub(crate) trait MacroAssembler {
    /// The addressing mode.
    type Address: Copy;

    /// The calling convention of the target.
    type ABI: ABI;

    /// Emit the function prologue.
    fn prologue(&mut self);

    /// Reserve stack space for the frame.
    fn reserve_stack(&mut self, bytes: u32);

    /// Tear down the frame.
    fn leave_frame(&mut self);

    /// Return, popping `stack_arg_bytes` of caller-pushed arguments.
    fn ret(&mut self, stack_arg_bytes: u32);

    /// Emit the function epilogue: frame teardown and return.
    fn epilogue(&mut self, stack_arg_bytes: u32) {
        self.leave_frame();
        self.ret(stack_arg_bytes);
    }

    /// Address of the given stack slot.
    fn slot_address(&self, slot: u32) -> Self::Address;

    /// Address of a stack argument, at `offset` bytes into the caller's
    /// argument area.
    fn caller_arg_address(&self, offset: u32) -> Self::Address;

    /// Construct an address that is relative to the `VMContext` register.
    fn address_at_vmctx(&self, offset: u32) -> Self::Address;

    /// Construct an address that is relative to the given register.
    fn address_at_reg(&self, base: Reg, offset: u32) -> Self::Address;

    /// Construct a `base + index + offset` address.
    fn address_indexed(&self, base: Reg, index: Reg, offset: u32) -> Self::Address;

    /// Perform a stack store.
    fn store(&mut self, src: RegImm, dst: Self::Address, size: OperandSize);

    /// Perform a load.
    fn load(&mut self, src: Self::Address, dst: Reg, size: OperandSize);

    /// Perform a narrow load, extending the value to 32 bits.
    fn load_extend(&mut self, src: Self::Address, dst: Reg, kind: ExtendKind);

    /// Perform a pointer-sized load.
    fn load_ptr(&mut self, src: Self::Address, dst: Reg);

    /// Perform a move.
    fn mov(&mut self, src: RegImm, dst: Reg, size: OperandSize);

    /// Copy a stack slot into another one.
    fn move_slot(&mut self, src: u32, dst: u32, size: OperandSize);

    /// Perform add operation.
    fn add(&mut self, dst: Reg, lhs: Reg, rhs: Reg, size: OperandSize) -> Result<()>;

    /// Perform subtraction operation.
    fn sub(&mut self, dst: Reg, lhs: Reg, rhs: Reg, size: OperandSize) -> Result<()>;

    /// Perform multiplication operation.
    fn mul(&mut self, dst: Reg, lhs: Reg, rhs: Reg, size: OperandSize) -> Result<()>;

    /// Perform logical and operation.
    fn and(&mut self, dst: Reg, lhs: Reg, rhs: Reg, size: OperandSize) -> Result<()>;

    /// Perform logical or operation.
    fn or(&mut self, dst: Reg, lhs: Reg, rhs: Reg, size: OperandSize) -> Result<()>;

    /// Perform logical exclusive or operation.
    fn xor(&mut self, dst: Reg, lhs: Reg, rhs: Reg, size: OperandSize) -> Result<()>;

    /// Perform a floating point add operation.
    fn float_add(&mut self, dst: Reg, lhs: Reg, rhs: Reg, size: OperandSize) -> Result<()>;

    /// Perform a floating point subtraction operation.
    fn float_sub(&mut self, dst: Reg, lhs: Reg, rhs: Reg, size: OperandSize) -> Result<()>;

    /// Perform a floating point multiplication operation.
    fn float_mul(&mut self, dst: Reg, lhs: Reg, rhs: Reg, size: OperandSize) -> Result<()>;

    /// Compare two registers, setting the flags for a following
    /// [`MacroAssembler::jmp_if`].
    fn cmp(&mut self, lhs: Reg, rhs: Reg, size: OperandSize);

    /// Compare a register against zero.
    fn test(&mut self, reg: Reg, size: OperandSize);

    /// Jump to the label if the flags satisfy `kind`.
    fn jmp_if(&mut self, kind: IntCmpKind, target: MachLabel);

    /// Unconditional jump.
    fn jmp(&mut self, target: MachLabel);

    /// Allocate a new label.
    fn get_label(&mut self) -> MachLabel;

    /// Bind the label at the current code offset.
    fn bind(&mut self, label: MachLabel) -> Result<()>;

    /// Returns true if the label is bound.
    fn is_bound(&self, label: MachLabel) -> bool;

    /// Jump to `target` when the stack pointer reaches the limit stored in
    /// the `VMContext` at `limit_offset`.
    fn stack_check(&mut self, limit_offset: u32, target: MachLabel);

    /// Save the registers on the machine stack.
    fn push_regs(&mut self, regs: RegList);

    /// Restore registers saved by [`MacroAssembler::push_regs`].
    fn pop_regs(&mut self, regs: RegList);

    /// Call a runtime stub.
    fn call_builtin(&mut self, builtin: Builtin);

    /// Call the trap callback installed for testing, used when runtime
    /// exceptions are unavailable.
    fn call_trap_callback_for_testing(&mut self);

    /// Mark a code position that execution must never reach.
    fn unreachable(&mut self);

    /// The scratch register of the class of `reg`; never allocatable.
    fn scratch_for(&self, reg: Reg) -> Reg;

    /// The current code offset.
    fn current_code_offset(&self) -> u32;

    /// Finalize the assembly and return the result.
    fn finalize(self) -> Result<FinalizedCode>;
}
