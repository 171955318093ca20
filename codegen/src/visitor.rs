//! This module is the central place for machine code emission.
//! It dispatches every operator to its handler on `CodeGen`. Operators
//! outside the supported subset make the function bail out.

use crate::abi::reg_class_for;
use crate::codegen::{CacheState, CodeGen, CodeGenError, ControlFrame, ControlKind};
use crate::isa::reg::{Reg, RegClass};
use crate::masm::{ExtendKind, IntCmpKind, MacroAssembler, OperandSize, RegImm};
use crate::regset::RegList;
use anyhow::Result;
use wasmparser::{BlockType, MemArg, Operator, ValType};

/// The emitter of a binary operation: `dst = lhs op rhs`.
type BinOpEmit<M> = fn(&mut M, Reg, Reg, Reg, OperandSize) -> Result<()>;

/// Describes a binary operation: the type of its operands and result, and
/// the MacroAssembler method emitting it.
pub(crate) struct BinOp<M: MacroAssembler> {
    pub ty: ValType,
    pub emit: BinOpEmit<M>,
}

impl<M: MacroAssembler> BinOp<M> {
    /// The descriptor of a supported binary operator.
    pub fn from_op(op: &Operator<'_>) -> Option<Self> {
        use Operator::*;
        let (ty, emit): (ValType, BinOpEmit<M>) = match op {
            I32Add => (ValType::I32, M::add),
            I32Sub => (ValType::I32, M::sub),
            I32Mul => (ValType::I32, M::mul),
            I32And => (ValType::I32, M::and),
            I32Or => (ValType::I32, M::or),
            I32Xor => (ValType::I32, M::xor),
            F32Add => (ValType::F32, M::float_add),
            F32Sub => (ValType::F32, M::float_sub),
            F32Mul => (ValType::F32, M::float_mul),
            _ => return None,
        };
        Some(Self { ty, emit })
    }

    pub fn class(&self) -> RegClass {
        reg_class_for(self.ty)
    }
}

/// The name reported when bailing out on an operator without a dedicated
/// reason: its variant name, e.g. `I64Add`.
pub(crate) fn op_name(op: &Operator<'_>) -> String {
    let debug = format!("{op:?}");
    let end = debug
        .find(|c: char| c == ' ' || c == '{' || c == '(')
        .unwrap_or(debug.len());
    debug[..end].to_string()
}

impl<'a, M> CodeGen<'a, M>
where
    M: MacroAssembler,
{
    /// Compile a single operator.
    pub fn visit(&mut self, op: &Operator<'_>) -> Result<()> {
        use Operator::*;

        if let Some(binop) = BinOp::from_op(op) {
            return self.visit_binop(binop);
        }

        match op {
            Nop => Ok(()),
            Unreachable => self.unsupported("unreachable"),
            Block { blockty } => self.visit_block(*blockty),
            Loop { blockty } => self.visit_loop(*blockty),
            If { .. } => self.visit_if(),
            Else => self.visit_else(),
            Try { .. } | TryTable { .. } => self.visit_try(),
            Throw { .. } | ThrowRef | Rethrow { .. } => self.unsupported("throw"),
            End => self.visit_end(),
            Br { relative_depth } => self.visit_br(*relative_depth),
            BrIf { relative_depth } => self.visit_br_if(*relative_depth),
            BrTable { .. } => self.unsupported("br_table"),
            Return => self.visit_return(),
            Call { .. } => self.unsupported("call"),
            CallIndirect { .. } => self.unsupported("call_indirect"),
            Drop => self.visit_drop(),
            Select | TypedSelect { .. } => self.unsupported("select"),
            LocalGet { local_index } => self.visit_local_get(*local_index),
            LocalSet { local_index } => self.visit_local_set(*local_index, false),
            LocalTee { local_index } => self.visit_local_set(*local_index, true),
            GlobalGet { global_index } => self.visit_global_get(*global_index),
            GlobalSet { global_index } => self.visit_global_set(*global_index),
            I32Load { memarg } => self.visit_load(memarg, None),
            I32Load8S { memarg } => self.visit_load(memarg, Some(ExtendKind::Signed8)),
            I32Load8U { memarg } => self.visit_load(memarg, Some(ExtendKind::Unsigned8)),
            I32Load16S { memarg } => self.visit_load(memarg, Some(ExtendKind::Signed16)),
            I32Load16U { memarg } => self.visit_load(memarg, Some(ExtendKind::Unsigned16)),
            I64Load { .. }
            | I64Load8S { .. }
            | I64Load8U { .. }
            | I64Load16S { .. }
            | I64Load16U { .. }
            | I64Load32S { .. }
            | I64Load32U { .. }
            | F32Load { .. }
            | F64Load { .. } => self.unsupported("non-i32 load"),
            I32Store { memarg } => self.visit_store(memarg, OperandSize::S32),
            I32Store8 { memarg } => self.visit_store(memarg, OperandSize::S8),
            I32Store16 { memarg } => self.visit_store(memarg, OperandSize::S16),
            I64Store { .. }
            | I64Store8 { .. }
            | I64Store16 { .. }
            | I64Store32 { .. }
            | F32Store { .. }
            | F64Store { .. } => self.unsupported("non-i32 store"),
            MemorySize { .. } => self.unsupported("current_memory"),
            MemoryGrow { .. } => self.unsupported("grow_memory"),
            I32Const { value } => self.visit_i32_const(*value),
            I64Const { .. } => self.unsupported("i64.const"),
            F32Const { value } => self.visit_f32_const(value.bits()),
            F64Const { .. } => self.unsupported("f64.const"),
            op => self.unsupported(op_name(op)),
        }
    }

    /// The number of results of a block, or `None` after bailing out on a
    /// block with a function type.
    fn block_results(&mut self, blockty: BlockType) -> Result<Option<usize>> {
        match blockty {
            BlockType::Empty => Ok(Some(0)),
            BlockType::Type(_) => Ok(Some(1)),
            BlockType::FuncType(_) => self.unsupported("multi-value").map(|_| None),
        }
    }

    /// Track a frame entered in unreachable code.
    fn push_unreachable_frame(&mut self, kind: ControlKind) {
        let label = self.masm.get_label();
        let stack_base = self.context.state.height();
        self.control_frames
            .push(ControlFrame::unreachable(kind, label, stack_base));
    }

    fn visit_block(&mut self, blockty: BlockType) -> Result<()> {
        if !self.context.reachable {
            self.push_unreachable_frame(ControlKind::Block);
            return Ok(());
        }
        let Some(results) = self.block_results(blockty)? else {
            return Ok(());
        };
        self.trace_cache_state();
        let label = self.masm.get_label();
        self.control_frames.push(ControlFrame::block(
            label,
            self.context.state.height(),
            results,
        ));
        Ok(())
    }

    fn visit_loop(&mut self, blockty: BlockType) -> Result<()> {
        if !self.context.reachable {
            self.push_unreachable_frame(ControlKind::Loop);
            return Ok(());
        }
        let Some(results) = self.block_results(blockty)? else {
            return Ok(());
        };
        self.trace_cache_state();
        // Back edges find every local on the stack.
        self.context.spill_locals(self.masm)?;
        let label = self.masm.get_label();
        self.masm.bind(label)?;
        self.control_frames
            .push(ControlFrame::loop_(label, &self.context.state, results));
        Ok(())
    }

    fn visit_if(&mut self) -> Result<()> {
        if self.context.reachable {
            return self.unsupported("if");
        }
        self.push_unreachable_frame(ControlKind::If);
        Ok(())
    }

    fn visit_else(&mut self) -> Result<()> {
        // The matching `if` was either rejected or is unreachable, in which
        // case so is the `else` arm.
        if self.context.reachable {
            return self.unsupported("else");
        }
        Ok(())
    }

    fn visit_try(&mut self) -> Result<()> {
        if self.context.reachable {
            return self.unsupported("try");
        }
        self.push_unreachable_frame(ControlKind::Try);
        Ok(())
    }

    fn visit_end(&mut self) -> Result<()> {
        let index = self.frame_index(0)?;
        let frame = &mut self.control_frames[index];

        if self.context.reachable && frame.reachable_at_entry && !frame.is_loop() {
            // Fall through to the end of the frame.
            if self.context.state.height() != frame.stack_base + frame.end_arity {
                return Err(CodeGenError::control_frame_state_mismatch().into());
            }
            if frame.reached {
                self.context
                    .merge_full_stack_with(&frame.label_state, self.masm)?;
            } else {
                frame.label_state = self.context.state.split();
                frame.reached = true;
            }
        }
        self.trace_cache_state();

        let Some(frame) = self.control_frames.pop() else {
            return Ok(());
        };
        if !frame.reachable_at_entry {
            return Ok(());
        }
        let is_function = frame.is_function();
        if !frame.is_loop() && frame.reached {
            self.context.state.steal(frame.label_state);
            self.context.reachable = true;
        }
        if !self.masm.is_bound(frame.label) {
            self.masm.bind(frame.label)?;
        }
        if is_function && self.context.reachable {
            self.do_return()?;
            self.context.reachable = false;
        }
        Ok(())
    }

    /// Branch to the frame at `depth`.
    ///
    /// The first branch to a block defines the state at its end; every
    /// later one moves its values to match.
    fn emit_br(&mut self, depth: u32) -> Result<()> {
        let index = self.frame_index(depth)?;
        let frame = &mut self.control_frames[index];
        if !frame.reached {
            frame.label_state = CacheState::init_merge(
                &self.context.state,
                self.context.num_locals,
                frame.stack_base,
                frame.br_arity,
                &self.context.regset,
            )?;
            frame.reached = true;
        }
        self.context
            .merge_stack_with(&frame.label_state, frame.br_arity, self.masm)?;
        self.masm.jmp(frame.label);
        Ok(())
    }

    fn visit_br(&mut self, depth: u32) -> Result<()> {
        self.trace_cache_state();
        self.emit_br(depth)?;
        self.context.reachable = false;
        Ok(())
    }

    fn visit_br_if(&mut self, depth: u32) -> Result<()> {
        self.trace_cache_state();
        let cond = self
            .context
            .pop_to_reg(RegClass::Int, RegList::empty(), self.masm)?;
        let cont_false = self.masm.get_label();
        self.masm.test(cond, OperandSize::S32);
        self.masm.jmp_if(IntCmpKind::Eq, cont_false);
        self.emit_br(depth)?;
        self.masm.bind(cont_false)
    }

    fn visit_return(&mut self) -> Result<()> {
        self.trace_cache_state();
        self.do_return()?;
        self.context.reachable = false;
        Ok(())
    }

    fn visit_drop(&mut self) -> Result<()> {
        self.trace_cache_state();
        self.context.drop_slot()
    }

    fn visit_binop(&mut self, binop: BinOp<M>) -> Result<()> {
        self.trace_cache_state();
        let class = binop.class();
        let mut pinned = RegList::empty();
        let dst = pinned.set(self.context.binop_target_reg(class, pinned, self.masm)?);
        let rhs = pinned.set(self.context.pop_to_reg(class, pinned, self.masm)?);
        let lhs = self.context.pop_to_reg(class, pinned, self.masm)?;
        (binop.emit)(self.masm, dst, lhs, rhs, OperandSize::for_type(binop.ty))?;
        self.context.push_reg(binop.ty, dst);
        Ok(())
    }

    fn visit_i32_const(&mut self, value: i32) -> Result<()> {
        self.trace_cache_state();
        self.context.push_i32(value);
        self.check_stack_size_limit()
    }

    fn visit_f32_const(&mut self, bits: u32) -> Result<()> {
        let reg = self
            .context
            .reg_for_class(RegClass::Float, RegList::empty(), self.masm)?;
        self.masm.mov(RegImm::f32(bits), reg, OperandSize::S32);
        self.context.push_reg(ValType::F32, reg);
        self.check_stack_size_limit()
    }

    fn visit_local_get(&mut self, index: u32) -> Result<()> {
        self.context.get_local(index as usize, self.masm)?;
        self.check_stack_size_limit()
    }

    fn visit_local_set(&mut self, index: u32, tee: bool) -> Result<()> {
        self.context.set_local(index as usize, tee, self.masm)
    }

    fn visit_global_get(&mut self, index: u32) -> Result<()> {
        let global = *self.env.module.global(index)?;
        if !matches!(global.ty, ValType::I32 | ValType::I64) {
            return self.unsupported("non-int global");
        }
        let mut pinned = RegList::empty();
        let addr = pinned.set(self.context.any_gpr(pinned, self.masm)?);
        let globals = self
            .masm
            .address_at_vmctx(self.env.module.vmctx.globals_start);
        self.masm.load_ptr(globals, addr);
        let value = self
            .context
            .reg_for_class(reg_class_for(global.ty), pinned, self.masm)?;
        let src = self.masm.address_at_reg(addr, global.offset);
        self.masm
            .load(src, value, OperandSize::for_type(global.ty));
        self.context.push_reg(global.ty, value);
        self.check_stack_size_limit()
    }

    fn visit_global_set(&mut self, index: u32) -> Result<()> {
        let global = *self.env.module.global(index)?;
        if !matches!(global.ty, ValType::I32 | ValType::I64) {
            return self.unsupported("non-int global");
        }
        let mut pinned = RegList::empty();
        let addr = pinned.set(self.context.any_gpr(pinned, self.masm)?);
        let globals = self
            .masm
            .address_at_vmctx(self.env.module.vmctx.globals_start);
        self.masm.load_ptr(globals, addr);
        let value = self
            .context
            .pop_to_reg(reg_class_for(global.ty), pinned, self.masm)?;
        let dst = self.masm.address_at_reg(addr, global.offset);
        self.masm
            .store(value.into(), dst, OperandSize::for_type(global.ty));
        Ok(())
    }

    /// The static offset of a memory access to use as displacement, or
    /// `None` after bailing out.
    fn memarg_offset(&mut self, memarg: &MemArg) -> Result<Option<u32>> {
        if !self.settings.use_trap_handler {
            return self.unsupported("non-traphandler").map(|_| None);
        }
        if memarg.memory != 0 {
            return self.unsupported("multi-memory").map(|_| None);
        }
        if self.env.module.memory().is_some_and(|memory| memory.memory64) {
            return self.unsupported("memory64").map(|_| None);
        }
        match u32::try_from(memarg.offset) {
            Ok(offset) => Ok(Some(offset)),
            // The bounds check traps unconditionally, the access itself is
            // never executed.
            Err(_) if self.settings.bounds_checks => Ok(Some(0)),
            Err(_) => self.unsupported("memory offset").map(|_| None),
        }
    }

    fn visit_load(&mut self, memarg: &MemArg, extend: Option<ExtendKind>) -> Result<()> {
        let Some(offset) = self.memarg_offset(memarg)? else {
            return Ok(());
        };
        self.trace_cache_state();
        let access_size = extend.map_or(OperandSize::S32, |kind| kind.from_size());

        let mut pinned = RegList::empty();
        let index = pinned.set(self.context.pop_to_reg(RegClass::Int, pinned, self.masm)?);
        self.bounds_check_mem(access_size.bytes(), memarg.offset, index, pinned)?;
        let addr = pinned.set(self.context.any_gpr(pinned, self.masm)?);
        let memory = self
            .masm
            .address_at_vmctx(self.env.module.vmctx.memory_start);
        self.masm.load_ptr(memory, addr);

        let value = self.context.any_gpr(pinned, self.masm)?;
        let src = self.masm.address_indexed(addr, index, offset);
        match extend {
            Some(kind) => self.masm.load_extend(src, value, kind),
            None => self.masm.load(src, value, OperandSize::S32),
        }
        self.context.push_reg(ValType::I32, value);
        self.check_stack_size_limit()
    }

    fn visit_store(&mut self, memarg: &MemArg, size: OperandSize) -> Result<()> {
        let Some(offset) = self.memarg_offset(memarg)? else {
            return Ok(());
        };
        self.trace_cache_state();

        let mut pinned = RegList::empty();
        let value = pinned.set(self.context.pop_to_reg(RegClass::Int, pinned, self.masm)?);
        let index = pinned.set(self.context.pop_to_reg(RegClass::Int, pinned, self.masm)?);
        self.bounds_check_mem(size.bytes(), memarg.offset, index, pinned)?;
        let addr = pinned.set(self.context.any_gpr(pinned, self.masm)?);
        let memory = self
            .masm
            .address_at_vmctx(self.env.module.vmctx.memory_start);
        self.masm.load_ptr(memory, addr);
        let dst = self.masm.address_indexed(addr, index, offset);
        self.masm.store(value.into(), dst, size);
        Ok(())
    }
}
