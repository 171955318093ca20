use super::cache::{CacheState, Loc, Slot};
use crate::{
    abi::reg_class_for,
    codegen::CodeGenError,
    isa::reg::{Reg, RegClass},
    masm::{MacroAssembler, OperandSize, RegImm},
    regset::{RegList, RegSet},
};
use anyhow::{Result, bail};
use wasmparser::ValType;

/// The code generation context.
///
/// The context owns the cache state of the current position in the
/// function, together with the register file it allocates from. Every
/// change to the location of a value, and every register handed out to an
/// instruction handler, goes through the context so that the ownership
/// table stays in sync with the slots.
///
/// Operations that may spill take the MacroAssembler, since spilling emits
/// code.
pub(crate) struct CodeGenContext {
    /// The current cache state.
    pub state: CacheState,
    /// The allocatable registers.
    pub regset: RegSet,
    /// Number of locals, parameters included.
    pub num_locals: usize,
    /// Reachability state.
    pub reachable: bool,
}

impl CodeGenContext {
    /// Create a new code generation context.
    pub fn new(regset: RegSet) -> Self {
        Self {
            state: CacheState::new(),
            regset,
            num_locals: 0,
            reachable: true,
        }
    }

    /// The number of values on the operand stack, excluding locals.
    pub fn operand_stack_height(&self) -> usize {
        debug_assert!(self.state.height() >= self.num_locals);
        self.state.height() - self.num_locals
    }

    /// Request a register of the given class that is not in `pinned`,
    /// spilling an occupied one if none is free.
    ///
    /// The returned register is unused; it is up to the caller to push it or
    /// pin it before requesting another register.
    pub fn reg_for_class<M: MacroAssembler>(
        &mut self,
        class: RegClass,
        pinned: RegList,
        masm: &mut M,
    ) -> Result<Reg> {
        let candidates = self.regset.candidates(class);
        match self.state.regs.unused_reg(candidates, pinned) {
            Some(reg) => Ok(reg),
            None => self.spill_one_register(candidates, pinned, masm),
        }
    }

    /// Convenience wrapper around [`CodeGenContext::reg_for_class`] to
    /// request a general purpose register.
    pub fn any_gpr<M: MacroAssembler>(&mut self, pinned: RegList, masm: &mut M) -> Result<Reg> {
        self.reg_for_class(RegClass::Int, pinned, masm)
    }

    fn spill_one_register<M: MacroAssembler>(
        &mut self,
        candidates: RegList,
        pinned: RegList,
        masm: &mut M,
    ) -> Result<Reg> {
        let Some(reg) = self.state.regs.next_spill_reg(candidates, pinned) else {
            bail!(CodeGenError::expected_register_to_be_available());
        };
        self.spill_reg(reg, masm);
        Ok(reg)
    }

    /// Move every slot held in `reg` to its stack slot, freeing the register.
    pub fn spill_reg<M: MacroAssembler>(&mut self, reg: Reg, masm: &mut M) {
        for (index, slot) in self.state.slots.iter_mut().enumerate() {
            if slot.get_reg() == Some(reg) {
                let addr = masm.slot_address(index as u32);
                masm.store(reg.into(), addr, OperandSize::for_type(slot.ty));
                slot.loc = Loc::Stack;
            }
        }
        self.state.regs.clear_used(reg);
    }

    /// Move the slot at `index` to its stack slot.
    ///
    /// Spilling a slot that already lives on the stack emits nothing.
    pub fn spill_slot<M: MacroAssembler>(&mut self, index: usize, masm: &mut M) -> Result<()> {
        let slot = *self.state.slot(index)?;
        let src = match slot.loc {
            Loc::Stack => return Ok(()),
            Loc::Reg(reg) => {
                self.state.regs.dec_used(reg);
                RegImm::reg(reg)
            }
            Loc::I32Const(value) => RegImm::i32(value),
        };
        let addr = masm.slot_address(index as u32);
        masm.store(src, addr, OperandSize::for_type(slot.ty));
        self.state.slots[index].loc = Loc::Stack;
        Ok(())
    }

    /// Move every local to its stack slot.
    pub fn spill_locals<M: MacroAssembler>(&mut self, masm: &mut M) -> Result<()> {
        for index in 0..self.num_locals {
            self.spill_slot(index, masm)?;
        }
        Ok(())
    }

    /// Materialize the value of the slot at `index` in `dst`.
    fn load_to_reg<M: MacroAssembler>(slot: &Slot, index: usize, dst: Reg, masm: &mut M) {
        let size = OperandSize::for_type(slot.ty);
        match slot.loc {
            Loc::Reg(src) if src == dst => {}
            Loc::Reg(src) => masm.mov(src.into(), dst, size),
            Loc::I32Const(value) => masm.mov(RegImm::i32(value), dst, size),
            Loc::Stack => {
                let addr = masm.slot_address(index as u32);
                masm.load(addr, dst, size);
            }
        }
    }

    /// Pop the value at the top of the operand stack into a register of the
    /// given class.
    ///
    /// A value already in a register is returned as is. The reference the
    /// slot held is dropped: the register becomes owned by the caller, which
    /// must pin it while requesting further registers.
    pub fn pop_to_reg<M: MacroAssembler>(
        &mut self,
        class: RegClass,
        pinned: RegList,
        masm: &mut M,
    ) -> Result<Reg> {
        let slot = self.pop_slot()?;
        if let Some(reg) = slot.get_reg() {
            self.state.regs.dec_used(reg);
            return Ok(reg);
        }
        let reg = self.reg_for_class(class, pinned, masm)?;
        Self::load_to_reg(&slot, self.state.height(), reg, masm);
        Ok(reg)
    }

    /// Remove the top slot without touching the ownership table.
    fn pop_slot(&mut self) -> Result<Slot> {
        if self.state.height() <= self.num_locals {
            bail!(CodeGenError::pop_below_locals());
        }
        self.state
            .slots
            .pop()
            .ok_or_else(|| CodeGenError::missing_values_in_stack().into())
    }

    /// Push a value held in a register.
    pub fn push_reg(&mut self, ty: ValType, reg: Reg) {
        self.state.push_reg(ty, reg);
    }

    /// Push an i32 constant, without materializing it.
    pub fn push_i32(&mut self, value: i32) {
        self.state.push_i32(value);
    }

    /// Pop the top value and drop its register reference, if any.
    pub fn drop_slot(&mut self) -> Result<()> {
        let slot = self.pop_slot()?;
        self.state.release(&slot);
        Ok(())
    }

    /// The register to hold the result of a binary operation on the two
    /// values at the top of the stack.
    ///
    /// An operand register only referenced by its operand slot is reused,
    /// since popping the operands frees it.
    pub fn binop_target_reg<M: MacroAssembler>(
        &mut self,
        class: RegClass,
        pinned: RegList,
        masm: &mut M,
    ) -> Result<Reg> {
        let height = self.state.height();
        if height < self.num_locals + 2 {
            bail!(CodeGenError::missing_values_in_stack());
        }
        let reusable = self.state.slots[height - 2..]
            .iter()
            .rev()
            .filter_map(Slot::get_reg)
            .find(|reg| {
                reg.class() == class && !pinned.has(*reg) && self.state.regs.use_count(*reg) == 1
            });
        match reusable {
            Some(reg) => Ok(reg),
            None => self.reg_for_class(class, pinned, masm),
        }
    }

    /// Push a copy of the local at `index`.
    ///
    /// Registers and constants are aliased rather than copied; a local on
    /// the stack is loaded into a fresh register.
    pub fn get_local<M: MacroAssembler>(&mut self, index: usize, masm: &mut M) -> Result<()> {
        let slot = self.local(index)?;
        match slot.loc {
            Loc::Reg(reg) => self.push_reg(slot.ty, reg),
            Loc::I32Const(value) => self.push_i32(value),
            Loc::Stack => {
                let reg = self.reg_for_class(slot.class(), RegList::empty(), masm)?;
                Self::load_to_reg(&slot, index, reg, masm);
                self.push_reg(slot.ty, reg);
            }
        }
        Ok(())
    }

    /// Store the top of the stack into the local at `index`, popping it
    /// unless `tee` is set.
    pub fn set_local<M: MacroAssembler>(
        &mut self,
        index: usize,
        tee: bool,
        masm: &mut M,
    ) -> Result<()> {
        let local = self.local(index)?;
        if self.state.height() <= self.num_locals {
            bail!(CodeGenError::pop_below_locals());
        }
        let src_index = self.state.height() - 1;
        let src = self.state.slots[src_index];

        match src.loc {
            Loc::Reg(reg) => {
                self.state.release(&local);
                self.state.slots[index] = src;
                if tee {
                    self.state.regs.inc_used(reg);
                }
            }
            Loc::I32Const(_) => {
                self.state.release(&local);
                self.state.slots[index] = src;
            }
            Loc::Stack => self.set_local_from_stack_slot(index, local, src_index, masm)?,
        }

        if !tee {
            // Any register reference moved to the local.
            self.state.slots.pop();
        }
        Ok(())
    }

    fn set_local_from_stack_slot<M: MacroAssembler>(
        &mut self,
        index: usize,
        local: Slot,
        src_index: usize,
        masm: &mut M,
    ) -> Result<()> {
        let size = OperandSize::for_type(local.ty);
        if let Some(reg) = local.get_reg() {
            if self.state.regs.use_count(reg) == 1 {
                let addr = masm.slot_address(src_index as u32);
                masm.load(addr, reg, size);
                return Ok(());
            }
        }
        self.state.release(&local);
        self.state.slots[index] = Slot::stack(local.ty);
        let reg = self.reg_for_class(reg_class_for(local.ty), RegList::empty(), masm)?;
        let addr = masm.slot_address(src_index as u32);
        masm.load(addr, reg, size);
        self.state.regs.inc_used(reg);
        self.state.slots[index] = Slot::reg(local.ty, reg);
        Ok(())
    }

    fn local(&self, index: usize) -> Result<Slot> {
        if index >= self.num_locals {
            bail!(CodeGenError::unexpected_value_stack_index());
        }
        self.state.slot(index).copied()
    }
}
