use crate::{
    abi::{ABI, ABIArg, ABISig, reg_class_for},
    buffer::MachLabel,
    masm::{MacroAssembler, OperandSize, RegImm},
    regset::{RegList, RegSet},
    settings::Settings,
    tables::{
        SafepointTable, SafepointTableBuilder, SourcePosition, SourcePositionTableBuilder,
    },
};
use anyhow::{Result, anyhow, bail};
use core::fmt::Write;
use core::sync::atomic::{AtomicBool, Ordering};
use smallvec::SmallVec;
use wasmparser::{FuncValidator, FunctionBody, Operator, ValType, ValidatorResources};

pub(crate) mod bounds;
mod cache;
pub(crate) use cache::*;
mod context;
pub(crate) use context::*;
mod control;
pub(crate) use control::*;
pub mod env;
pub use env::{ModuleEnv, VMContextOffsets};
use env::FuncEnv;
mod error;
pub use error::*;
mod merge;
mod ool;
use ool::{OutOfLineCode, OutOfLineTables, emit_out_of_line};

/// The maximum number of values on the operand stack of a function.
///
/// The frame reserves one slot per local and per operand stack value, so the
/// limit bounds the frame size.
pub const MAX_VALUE_STACK_HEIGHT: usize = 64;

/// The size of a stack slot, in bytes.
pub(crate) const STACK_SLOT_SIZE: u32 = 8;

/// Tables produced by a successful compilation.
#[derive(Debug)]
pub(crate) struct Emitted {
    pub safepoints: SafepointTable,
    pub source_positions: Vec<SourcePosition>,
    pub frame_slot_count: u32,
}

/// The code generation abstraction.
///
/// Drives a single pass over a function body: every operator updates the
/// cache state and emits inline code through the MacroAssembler. Slow paths
/// are queued as out-of-line code and emitted after the body.
pub(crate) struct CodeGen<'a, M>
where
    M: MacroAssembler,
{
    /// The ABI-specific representation of the function signature.
    pub sig: ABISig,

    /// The code generation context.
    pub context: CodeGenContext,

    /// A reference to the function compilation environment.
    pub env: FuncEnv<'a>,

    /// The MacroAssembler.
    pub masm: &'a mut M,

    /// Compilation settings.
    pub settings: &'a Settings,

    /// Stack frames for control flow, outermost first.
    pub control_frames: SmallVec<[ControlFrame; 16]>,

    /// Blocks emitted after the function body, in creation order.
    pub out_of_line_code: Vec<OutOfLineCode>,

    safepoints: SafepointTableBuilder,
    source_positions: SourcePositionTableBuilder,

    /// Byte offset of the operator being compiled.
    pub position: u32,

    /// The reason the function can't be compiled, once known.
    bailout: Option<String>,
}

impl<'a, M> CodeGen<'a, M>
where
    M: MacroAssembler,
{
    pub fn new(
        settings: &'a Settings,
        masm: &'a mut M,
        regset: RegSet,
        env: FuncEnv<'a>,
        sig: ABISig,
    ) -> Self {
        Self {
            sig,
            context: CodeGenContext::new(regset),
            env,
            masm,
            settings,
            control_frames: SmallVec::new(),
            out_of_line_code: Vec::new(),
            safepoints: SafepointTableBuilder::new(),
            source_positions: SourcePositionTableBuilder::new(),
            position: 0,
            bailout: None,
        }
    }

    /// Emit the function body to machine code.
    ///
    /// Validation errors and internal errors are returned as errors. A
    /// construct that can't be compiled is not: it is recorded as the
    /// bailout reason and reported by [`CodeGen::finish`], once every label
    /// has been bound.
    pub fn emit(
        &mut self,
        body: &FunctionBody<'_>,
        validator: &mut FuncValidator<ValidatorResources>,
        abort: Option<&AtomicBool>,
    ) -> Result<()> {
        let locals = self.read_locals(body, validator)?;
        self.emit_prologue(&locals)?;
        self.emit_body(body, validator, abort)?;
        self.emit_end()
    }

    fn read_locals(
        &mut self,
        body: &FunctionBody<'_>,
        validator: &mut FuncValidator<ValidatorResources>,
    ) -> Result<SmallVec<[ValType; 16]>> {
        let mut locals: SmallVec<[ValType; 16]> = self.sig.params.iter().map(ABIArg::ty).collect();
        let mut reader = body.get_locals_reader().map_err(CodeGenError::from)?;
        for _ in 0..reader.get_count() {
            let offset = reader.original_position();
            let (count, ty) = reader.read().map_err(CodeGenError::from)?;
            validator
                .define_locals(offset, count, ty)
                .map_err(CodeGenError::from)?;
            locals.extend(core::iter::repeat_n(ty, count as usize));
        }
        Ok(locals)
    }

    /// Code generation prologue.
    ///
    /// Enters the frame and assigns every local its initial location:
    /// parameters where the caller left them, or in a fresh register, and
    /// declared locals as zero.
    pub fn emit_prologue(&mut self, locals: &[ValType]) -> Result<()> {
        let label = self.masm.get_label();
        self.control_frames.push(ControlFrame::function(
            label,
            locals.len(),
            self.sig.results.len(),
        ));
        self.context.num_locals = locals.len();

        for ty in locals {
            let reason = match ty {
                ValType::I32 | ValType::F32 => continue,
                ValType::I64 => "i64 param/local",
                ValType::F64 => "f64 param/local",
                _ => "exotic param/local",
            };
            return self.unsupported(reason);
        }
        if self.sig.results.len() > 1 {
            return self.unsupported("multi-return");
        }

        self.masm.prologue();
        self.masm.reserve_stack(self.frame_size());
        self.masm.mov(
            <M::ABI as ABI>::vmctx_arg_reg().into(),
            <M::ABI as ABI>::vmctx_reg(),
            OperandSize::S64,
        );

        let param_regs: RegList = self
            .sig
            .params
            .iter()
            .filter_map(|arg| match arg {
                ABIArg::Reg { reg, .. } => Some(*reg),
                ABIArg::Stack { .. } => None,
            })
            .collect();
        for arg in self.sig.params.clone() {
            self.process_param(arg, param_regs)?;
        }

        let mut zero_f32 = None;
        for ty in &locals[self.sig.params.len()..] {
            match ty {
                ValType::F32 => {
                    let reg = match zero_f32 {
                        Some(reg) => reg,
                        None => {
                            // May spill a parameter.
                            let reg = self.context.reg_for_class(
                                reg_class_for(ValType::F32),
                                RegList::empty(),
                                self.masm,
                            )?;
                            self.masm.mov(RegImm::f32(0), reg, OperandSize::S32);
                            zero_f32 = Some(reg);
                            reg
                        }
                    };
                    self.context.push_reg(ValType::F32, reg);
                }
                _ => self.context.push_i32(0),
            }
        }

        self.stack_check()?;
        self.check_stack_size_limit()
    }

    fn process_param(&mut self, arg: ABIArg, param_regs: RegList) -> Result<()> {
        let ty = arg.ty();
        let size = OperandSize::for_type(ty);
        match arg {
            ABIArg::Reg { reg, .. } if self.context.regset.is_allocatable(reg) => {
                self.context.push_reg(ty, reg);
            }
            ABIArg::Reg { reg, .. } => {
                let dst = self
                    .context
                    .reg_for_class(reg.class(), param_regs, self.masm)?;
                self.masm.mov(reg.into(), dst, size);
                self.context.push_reg(ty, dst);
            }
            ABIArg::Stack { offset, .. } => {
                let dst = self
                    .context
                    .reg_for_class(reg_class_for(ty), param_regs, self.masm)?;
                let addr = self.masm.caller_arg_address(offset);
                self.masm.load(addr, dst, size);
                self.context.push_reg(ty, dst);
            }
        }
        Ok(())
    }

    /// The function entry stack check. The slow path saves every register
    /// holding a parameter or local.
    fn stack_check(&mut self) -> Result<()> {
        if !self.settings.stack_checks || !self.settings.runtime_exception_support {
            return Ok(());
        }
        let label = self.masm.get_label();
        let continuation = self.masm.get_label();
        // Position 0 is never the position of an operator.
        self.out_of_line_code.push(OutOfLineCode::stack_check(
            label,
            continuation,
            0,
            self.context.state.used_registers(),
        ));
        self.masm
            .stack_check(self.env.module.vmctx.stack_limit, label);
        self.masm.bind(continuation)
    }

    /// Number of stack slots in the frame: one per local and one per operand
    /// stack value.
    pub fn frame_slot_count(&self) -> u32 {
        (self.context.num_locals + MAX_VALUE_STACK_HEIGHT) as u32
    }

    fn frame_size(&self) -> u32 {
        let align = u32::from(<M::ABI as ABI>::stack_align());
        (self.frame_slot_count() * STACK_SLOT_SIZE).next_multiple_of(align)
    }

    fn emit_body(
        &mut self,
        body: &FunctionBody<'_>,
        validator: &mut FuncValidator<ValidatorResources>,
        abort: Option<&AtomicBool>,
    ) -> Result<()> {
        let mut reader = body.get_operators_reader().map_err(CodeGenError::from)?;
        while !reader.eof() {
            if self.bailout.is_some() {
                return Ok(());
            }
            let offset = reader.original_position();
            let op = reader.read().map_err(CodeGenError::from)?;
            validator.op(offset, &op).map_err(CodeGenError::from)?;
            if abort.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                return self.unsupported("compilation aborted");
            }
            self.visit_op(&op, offset)?;
        }
        Ok(())
    }

    /// Compile a single operator.
    ///
    /// In unreachable code only the operators opening or closing a control
    /// frame are visited, to keep the frame stack balanced.
    pub fn visit_op(&mut self, op: &Operator<'_>, offset: usize) -> Result<()> {
        if self.bailout.is_some() {
            return Ok(());
        }
        if !self.context.reachable && !visit_when_unreachable(op) {
            return Ok(());
        }
        self.position = offset as u32;
        log::trace!("{offset:#x}: {op:?}");
        self.visit(op)
    }

    /// Emit the out-of-line code.
    ///
    /// Runs after a bailout too, so that every label used by a trap jump is
    /// bound.
    pub fn emit_end(&mut self) -> Result<()> {
        for ool in core::mem::take(&mut self.out_of_line_code) {
            emit_out_of_line(
                &ool,
                self.masm,
                OutOfLineTables {
                    safepoints: &mut self.safepoints,
                    source_positions: &mut self.source_positions,
                },
                self.settings.runtime_exception_support,
                self.sig.stack_args_size,
            )?;
        }
        Ok(())
    }

    /// Consume the code generator, returning the side tables, or the
    /// bailout reason if the function couldn't be compiled.
    pub fn finish(self) -> Result<Emitted> {
        if let Some(reason) = self.bailout {
            bail!(CodeGenError::unsupported(reason));
        }
        let frame_slot_count = self.frame_slot_count();
        Ok(Emitted {
            safepoints: self.safepoints.finish(frame_slot_count),
            source_positions: self.source_positions.finish(),
            frame_slot_count,
        })
    }

    /// The bailout reason, if any.
    #[cfg(test)]
    pub fn bailout(&self) -> Option<&str> {
        self.bailout.as_deref()
    }

    /// Give up on the function.
    ///
    /// Only the first reason is kept. Every label of the open control frames
    /// and of the queued out-of-line code is bound, so that no label is left
    /// referenced but unbound; the code emitted so far is discarded by the
    /// caller.
    pub fn unsupported(&mut self, reason: impl Into<String>) -> Result<()> {
        if self.bailout.is_some() {
            return Ok(());
        }
        let reason = reason.into();
        log::debug!("unsupported at {:#x}: {reason}", self.position);
        self.bailout = Some(reason);
        self.bind_unbound_labels()
    }

    fn bind_unbound_labels(&mut self) -> Result<()> {
        let labels: SmallVec<[MachLabel; 32]> = self
            .control_frames
            .iter()
            .map(|frame| frame.label)
            .chain(self.out_of_line_code.iter().map(|ool| ool.label))
            .collect();
        for label in labels {
            if !self.masm.is_bound(label) {
                self.masm.bind(label)?;
            }
        }
        Ok(())
    }

    /// Bail out if the operand stack grew past [`MAX_VALUE_STACK_HEIGHT`].
    pub fn check_stack_size_limit(&mut self) -> Result<()> {
        if self.context.operand_stack_height() > MAX_VALUE_STACK_HEIGHT {
            return self.unsupported("value stack grows too large");
        }
        Ok(())
    }

    /// Log the cache state of every open frame's label, outermost first,
    /// followed by the current one.
    pub fn trace_cache_state(&self) {
        if !log::log_enabled!(log::Level::Trace) {
            return;
        }
        let mut line = String::new();
        for frame in &self.control_frames {
            let _ = write!(line, "{}; ", frame.label_state);
        }
        let _ = write!(line, "{}", self.context.state);
        log::trace!("{line}");
    }

    /// The index of the frame targeted by a branch of the given relative
    /// depth.
    pub fn frame_index(&self, depth: u32) -> Result<usize> {
        self.control_frames
            .len()
            .checked_sub(depth as usize + 1)
            .ok_or_else(|| anyhow!(CodeGenError::control_frame_expected()))
    }

    /// Return from the function with the value at the top of the stack, if
    /// the function has a result.
    pub fn do_return(&mut self) -> Result<()> {
        if let Some(result) = self.sig.result {
            let reg =
                self.context
                    .pop_to_reg(reg_class_for(result.ty), RegList::empty(), self.masm)?;
            if reg != result.reg {
                self.masm
                    .mov(reg.into(), result.reg, OperandSize::for_type(result.ty));
            }
        }
        self.masm.epilogue(self.sig.stack_args_size);
        Ok(())
    }
}

fn visit_when_unreachable(op: &Operator<'_>) -> bool {
    use Operator::*;
    matches!(
        op,
        Block { .. } | Loop { .. } | If { .. } | Else | End | Try { .. } | TryTable { .. }
    )
}

#[cfg(test)]
mod tests;
