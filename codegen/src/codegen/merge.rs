//! Reconciliation of the current cache state with the state expected at a
//! branch target.

use super::cache::{CacheState, Loc};
use super::context::CodeGenContext;
use crate::{
    codegen::CodeGenError,
    isa::reg::Reg,
    masm::{MacroAssembler, OperandSize, RegImm},
};
use anyhow::{Result, bail};
use smallvec::SmallVec;

#[derive(Debug, Copy, Clone)]
struct RegMove {
    dst: Reg,
    src: Reg,
    size: OperandSize,
}

#[derive(Debug, Copy, Clone)]
enum RegLoad {
    Const { dst: Reg, value: i32 },
    Slot { dst: Reg, index: u32, size: OperandSize },
}

impl RegLoad {
    fn dst(&self) -> Reg {
        match self {
            Self::Const { dst, .. } | Self::Slot { dst, .. } => *dst,
        }
    }
}

/// The code needed to move values from one layout into another.
///
/// Writes to stack slots are emitted as soon as they are recorded, since
/// they only read registers and slots of the source layout. Register to
/// register moves are then executed as a parallel move, and registers
/// loaded from constants or stack slots are filled last, once no move reads
/// them anymore.
struct TransferRecipe<'m, M: MacroAssembler> {
    masm: &'m mut M,
    moves: SmallVec<[RegMove; 8]>,
    loads: SmallVec<[RegLoad; 8]>,
}

impl<'m, M: MacroAssembler> TransferRecipe<'m, M> {
    fn new(masm: &'m mut M) -> Self {
        Self {
            masm,
            moves: SmallVec::new(),
            loads: SmallVec::new(),
        }
    }

    /// Record the transfer of the source slot at `src_index` into the
    /// target slot at `dst_index`.
    fn transfer_slot(
        &mut self,
        source: &CacheState,
        target: &CacheState,
        dst_index: usize,
        src_index: usize,
    ) -> Result<()> {
        let dst = target.slot(dst_index)?;
        let src = source.slot(src_index)?;
        let size = OperandSize::for_type(dst.ty);
        match (dst.loc, src.loc) {
            (Loc::Stack, Loc::Stack) => {
                if src_index != dst_index {
                    self.masm
                        .move_slot(src_index as u32, dst_index as u32, size);
                }
            }
            (Loc::Stack, Loc::Reg(reg)) => {
                let addr = self.masm.slot_address(dst_index as u32);
                self.masm.store(reg.into(), addr, size);
            }
            (Loc::Stack, Loc::I32Const(value)) => {
                let addr = self.masm.slot_address(dst_index as u32);
                self.masm.store(RegImm::i32(value), addr, size);
            }
            (Loc::Reg(dst), Loc::Reg(src)) => self.move_reg(dst, src, size),
            (Loc::Reg(dst), Loc::I32Const(value)) => self.load(RegLoad::Const { dst, value }),
            (Loc::Reg(dst), Loc::Stack) => self.load(RegLoad::Slot {
                dst,
                index: src_index as u32,
                size,
            }),
            (Loc::I32Const(expected), Loc::I32Const(value)) if expected == value => {}
            (Loc::I32Const(_), _) => bail!(CodeGenError::control_frame_state_mismatch()),
        }
        Ok(())
    }

    fn writes(&self, reg: Reg) -> bool {
        self.moves.iter().any(|m| m.dst == reg) || self.loads.iter().any(|l| l.dst() == reg)
    }

    // A register may back several target slots; they hold the same value, so
    // the first transfer into it wins.
    fn move_reg(&mut self, dst: Reg, src: Reg, size: OperandSize) {
        if dst != src && !self.writes(dst) {
            self.moves.push(RegMove { dst, src, size });
        }
    }

    fn load(&mut self, load: RegLoad) {
        if !self.writes(load.dst()) {
            self.loads.push(load);
        }
    }

    /// Emit the pending register moves and loads.
    fn execute(mut self) {
        self.execute_moves();
        for load in core::mem::take(&mut self.loads) {
            match load {
                RegLoad::Const { dst, value } => {
                    self.masm.mov(RegImm::i32(value), dst, OperandSize::S32)
                }
                RegLoad::Slot { dst, index, size } => {
                    let addr = self.masm.slot_address(index);
                    self.masm.load(addr, dst, size);
                }
            }
        }
    }

    fn execute_moves(&mut self) {
        while !self.moves.is_empty() {
            let mut executed = 0;
            let mut index = 0;
            while index < self.moves.len() {
                let mv = self.moves[index];
                if self.moves.iter().any(|other| other.src == mv.dst) {
                    index += 1;
                    continue;
                }
                self.masm.mov(mv.src.into(), mv.dst, mv.size);
                self.moves.remove(index);
                executed += 1;
            }

            if executed == 0 {
                // Every destination is still read: the moves form cycles.
                // Save one destination in the scratch register and redirect
                // its readers there.
                let blocked = self.moves[self.moves.len() - 1].dst;
                let scratch = self.masm.scratch_for(blocked);
                self.masm.mov(blocked.into(), scratch, OperandSize::S64);
                for mv in self.moves.iter_mut().filter(|mv| mv.src == blocked) {
                    mv.src = scratch;
                }
            }
        }
    }
}

impl CodeGenContext {
    /// Move every slot of the current state into the location `target`
    /// expects for it. Both states must have the same height.
    pub fn merge_full_stack_with<M: MacroAssembler>(
        &self,
        target: &CacheState,
        masm: &mut M,
    ) -> Result<()> {
        if self.state.height() != target.height() {
            bail!(CodeGenError::control_frame_state_mismatch());
        }
        let mut recipe = TransferRecipe::new(masm);
        for index in 0..target.height() {
            recipe.transfer_slot(&self.state, target, index, index)?;
        }
        recipe.execute();
        Ok(())
    }

    /// Move the locals, the values below the target's merge values, and the
    /// top `arity` values of the current state into the locations `target`
    /// expects. Values between the target height and the top `arity` values
    /// are discarded.
    pub fn merge_stack_with<M: MacroAssembler>(
        &self,
        target: &CacheState,
        arity: usize,
        masm: &mut M,
    ) -> Result<()> {
        let target_height = target.height();
        let height = self.state.height();
        if target_height < arity || height < target_height {
            bail!(CodeGenError::control_frame_state_mismatch());
        }
        let target_base = target_height - arity;
        let base = height - arity;

        let mut recipe = TransferRecipe::new(masm);
        for index in 0..target_base {
            recipe.transfer_slot(&self.state, target, index, index)?;
        }
        for offset in 0..arity {
            recipe.transfer_slot(&self.state, target, target_base + offset, base + offset)?;
        }
        recipe.execute();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::cache::{CacheState, Loc, Slot};
    use super::super::context::CodeGenContext;
    use crate::isa::reg::Reg;
    use crate::isa::x64::{X64Masm, regs};
    use crate::masm::MacroAssembler;
    use wasmparser::ValType;

    fn context_with(slots: &[Slot], num_locals: usize) -> CodeGenContext {
        let mut cx = CodeGenContext::new(regs::allocatable());
        for slot in slots {
            match slot.get_reg() {
                Some(reg) => cx.push_reg(slot.ty, reg),
                None => cx.state.slots.push(*slot),
            }
        }
        cx.num_locals = num_locals;
        cx
    }

    fn rendered(masm: X64Masm) -> Vec<String> {
        masm.finalize().unwrap().insts().to_vec()
    }

    #[test]
    fn test_identical_states_emit_nothing() {
        let cx = context_with(&[Slot::reg(ValType::I32, Reg::int(0)), Slot::i32(3)], 1);
        let target = cx.state.split();
        let mut masm = X64Masm::new();
        cx.merge_full_stack_with(&target, &mut masm).unwrap();
        assert_eq!(masm.current_code_offset(), 0);
    }

    #[test]
    fn test_swap_goes_through_scratch() {
        let cx = context_with(
            &[
                Slot::reg(ValType::I32, Reg::int(0)),
                Slot::reg(ValType::I32, Reg::int(1)),
            ],
            2,
        );
        let target = context_with(
            &[
                Slot::reg(ValType::I32, Reg::int(1)),
                Slot::reg(ValType::I32, Reg::int(0)),
            ],
            2,
        )
        .state;
        let mut masm = X64Masm::new();
        cx.merge_full_stack_with(&target, &mut masm).unwrap();
        let insts = rendered(masm);
        assert_eq!(insts.len(), 3);
        assert!(insts[0].contains("r11"));
    }

    #[test]
    fn test_stack_writes_precede_register_moves() {
        // Slot 0 goes to the stack from rax, while rax is overwritten by the
        // value of slot 1.
        let cx = context_with(
            &[
                Slot::reg(ValType::I32, Reg::int(0)),
                Slot::reg(ValType::I32, Reg::int(1)),
            ],
            2,
        );
        let target = context_with(
            &[Slot::stack(ValType::I32), Slot::reg(ValType::I32, Reg::int(0))],
            2,
        )
        .state;
        let mut masm = X64Masm::new();
        cx.merge_full_stack_with(&target, &mut masm).unwrap();
        let insts = rendered(masm);
        assert_eq!(insts.len(), 2);
        assert!(insts[0].starts_with("mov dword ptr [rbp"));
        assert!(insts[1].starts_with("mov eax"));
    }

    #[test]
    fn test_merge_values_are_moved_down() {
        // One local, one discarded value and one merge value.
        let cx = context_with(
            &[
                Slot::stack(ValType::I32),
                Slot::i32(9),
                Slot::reg(ValType::I32, Reg::int(3)),
            ],
            1,
        );
        let target = context_with(&[Slot::stack(ValType::I32), Slot::stack(ValType::I32)], 1).state;
        let mut masm = X64Masm::new();
        cx.merge_stack_with(&target, 1, &mut masm).unwrap();
        let insts = rendered(masm);
        assert_eq!(insts, vec!["mov dword ptr [rbp - 0x10], ebx".to_string()]);
    }

    #[test]
    fn test_constant_mismatch_is_an_error() {
        let cx = context_with(&[Slot::i32(1)], 1);
        let target = context_with(&[Slot::i32(2)], 1).state;
        let mut masm = X64Masm::new();
        assert!(cx.merge_full_stack_with(&target, &mut masm).is_err());
    }

    #[test]
    fn test_paths_agree_after_merge() {
        // Two paths reach the same block end with the merge value in
        // different places.
        let first = context_with(
            &[Slot::reg(ValType::I32, Reg::int(2)), Slot::i32(4)],
            1,
        );
        let second = context_with(
            &[Slot::stack(ValType::I32), Slot::reg(ValType::I32, Reg::int(6))],
            1,
        );
        let target =
            CacheState::init_merge(&first.state, 1, 1, 1, &regs::allocatable()).unwrap();
        assert_eq!(target.slots[0].loc, Loc::Reg(Reg::int(2)));
        assert_eq!(target.slots[1].loc, Loc::Reg(Reg::int(0)));

        let mut masm = X64Masm::new();
        first.merge_stack_with(&target, 1, &mut masm).unwrap();
        assert_eq!(rendered(masm), vec!["mov eax, 0x4".to_string()]);

        let mut masm = X64Masm::new();
        second.merge_stack_with(&target, 1, &mut masm).unwrap();
        assert_eq!(
            rendered(masm),
            vec![
                "mov eax, esi".to_string(),
                "mov edx, dword ptr [rbp - 0x8]".to_string()
            ]
        );
    }
}
