use crate::{
    buffer::MachLabel,
    masm::{Builtin, MacroAssembler},
    regset::RegList,
    tables::{SafepointTableBuilder, SourcePositionTableBuilder},
};
use anyhow::Result;

/// The kind of an out-of-line block.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum OutOfLineKind {
    /// A trap; the stub never returns.
    Trap,
    /// The slow path of the function entry stack check; execution resumes at
    /// the continuation.
    StackCheck { continuation: MachLabel },
}

/// A block emitted after the function body, reached only through a jump
/// from the inline code.
#[derive(Debug, Clone)]
pub(crate) struct OutOfLineCode {
    pub kind: OutOfLineKind,
    /// Entry of the block.
    pub label: MachLabel,
    pub builtin: Builtin,
    /// Byte offset of the operator the block belongs to.
    pub position: u32,
    /// Registers live across the stub call.
    pub regs_to_save: RegList,
}

impl OutOfLineCode {
    pub fn trap(label: MachLabel, builtin: Builtin, position: u32) -> Self {
        Self {
            kind: OutOfLineKind::Trap,
            label,
            builtin,
            position,
            regs_to_save: RegList::empty(),
        }
    }

    pub fn stack_check(
        label: MachLabel,
        continuation: MachLabel,
        position: u32,
        regs_to_save: RegList,
    ) -> Self {
        Self {
            kind: OutOfLineKind::StackCheck { continuation },
            label,
            builtin: Builtin::StackGuard,
            position,
            regs_to_save,
        }
    }

    pub fn is_stack_check(&self) -> bool {
        matches!(self.kind, OutOfLineKind::StackCheck { .. })
    }
}

/// Sinks filled while out-of-line code is emitted.
pub(crate) struct OutOfLineTables<'a> {
    pub safepoints: &'a mut SafepointTableBuilder,
    pub source_positions: &'a mut SourcePositionTableBuilder,
}

/// Emit a single out-of-line block.
///
/// Without runtime exception support the block calls the testing trap
/// callback and returns from the function; stack checks are never emitted
/// in that mode.
pub(crate) fn emit_out_of_line<M: MacroAssembler>(
    ool: &OutOfLineCode,
    masm: &mut M,
    tables: OutOfLineTables<'_>,
    runtime_exception_support: bool,
    stack_args_size: u32,
) -> Result<()> {
    if !masm.is_bound(ool.label) {
        masm.bind(ool.label)?;
    }

    if !runtime_exception_support {
        debug_assert!(!ool.is_stack_check());
        masm.call_trap_callback_for_testing();
        masm.epilogue(stack_args_size);
        return Ok(());
    }

    if !ool.regs_to_save.is_empty() {
        masm.push_regs(ool.regs_to_save);
    }
    tables
        .source_positions
        .add_position(masm.current_code_offset(), ool.position, false);
    masm.call_builtin(ool.builtin);
    tables.safepoints.define_safepoint(masm.current_code_offset());
    if !ool.regs_to_save.is_empty() {
        masm.pop_regs(ool.regs_to_save);
    }

    match ool.kind {
        OutOfLineKind::StackCheck { continuation } => masm.jmp(continuation),
        OutOfLineKind::Trap => masm.unreachable(),
    }
    Ok(())
}
