//! Explicit bounds checks for linear memory accesses.

use super::{CodeGen, ool::OutOfLineCode};
use crate::{
    isa::reg::Reg,
    masm::{Builtin, IntCmpKind, MacroAssembler, OperandSize, RegImm},
    regset::RegList,
};
use anyhow::Result;

impl<'a, M> CodeGen<'a, M>
where
    M: MacroAssembler,
{
    /// Emit a check that `index + offset + access_size` lies within the
    /// memory, jumping to a trap otherwise.
    ///
    /// Every check gets its own trap block. Accesses that can't be in bounds
    /// even for the largest memory jump to the trap unconditionally. If the
    /// access might exceed the smallest memory, the end offset is first
    /// compared against the actual memory size, loaded at run time; then the
    /// index is compared against the size left after the end offset.
    pub fn bounds_check_mem(
        &mut self,
        access_size: u32,
        offset: u64,
        index: Reg,
        pinned: RegList,
    ) -> Result<()> {
        if !self.settings.bounds_checks {
            return Ok(());
        }

        let trap = self.masm.get_label();
        self.out_of_line_code.push(OutOfLineCode::trap(
            trap,
            Builtin::ThrowMemOutOfBounds,
            self.position,
        ));

        let max_size = self.env.max_size;
        let access_size = u64::from(access_size);
        if access_size > max_size || offset > max_size - access_size {
            // Out of bounds even for the largest memory.
            self.masm.jmp(trap);
            return Ok(());
        }
        let end_offset = offset + access_size - 1;

        let mut pinned = pinned;
        let end_offset_reg = pinned.set(self.context.any_gpr(pinned, self.masm)?);
        let mem_size = self.context.any_gpr(pinned, self.masm)?;
        let size_addr = self
            .masm
            .address_at_vmctx(self.env.module.vmctx.memory_size);
        self.masm.load(size_addr, mem_size, OperandSize::S64);
        // `end_offset` is below the largest memory size, which fits in 32 bits.
        self.masm
            .mov(RegImm::i32(end_offset as u32 as i32), end_offset_reg, OperandSize::S32);

        if end_offset >= self.env.min_size {
            self.masm.cmp(end_offset_reg, mem_size, OperandSize::S64);
            self.masm.jmp_if(IntCmpKind::GeU, trap);
        }

        // The end offset register now holds the effective size.
        self.masm
            .sub(end_offset_reg, mem_size, end_offset_reg, OperandSize::S64)?;
        self.masm.cmp(index, end_offset_reg, OperandSize::S64);
        self.masm.jmp_if(IntCmpKind::GeU, trap);
        Ok(())
    }
}
