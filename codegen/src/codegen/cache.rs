//! The cache state: where every local and operand stack value lives.

use crate::abi::reg_class_for;
use crate::codegen::CodeGenError;
use crate::isa::reg::{Reg, RegClass};
use crate::regalloc::RegAlloc;
use crate::regset::{RegList, RegSet};
use anyhow::Result;
use core::fmt;
use smallvec::SmallVec;
use wasmparser::ValType;

/// The location of a value.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Loc {
    /// The value lives in its stack slot.
    Stack,
    /// The value lives in a register.
    Reg(Reg),
    /// The value is a 32-bit constant, not materialized anywhere.
    I32Const(i32),
}

/// A local or an operand stack value.
///
/// The type of a slot never changes; only its location does.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Slot {
    pub ty: ValType,
    pub loc: Loc,
}

impl Slot {
    /// A value held in a register.
    pub fn reg(ty: ValType, reg: Reg) -> Self {
        Self {
            ty,
            loc: Loc::Reg(reg),
        }
    }

    /// An i32 constant.
    pub fn i32(value: i32) -> Self {
        Self {
            ty: ValType::I32,
            loc: Loc::I32Const(value),
        }
    }

    /// A value in its stack slot.
    pub fn stack(ty: ValType) -> Self {
        Self { ty, loc: Loc::Stack }
    }

    #[cfg(test)]
    pub fn is_reg(&self) -> bool {
        matches!(self.loc, Loc::Reg(_))
    }

    #[cfg(test)]
    pub fn is_stack(&self) -> bool {
        self.loc == Loc::Stack
    }

    /// The register holding the value, if any.
    pub fn get_reg(&self) -> Option<Reg> {
        match self.loc {
            Loc::Reg(reg) => Some(reg),
            _ => None,
        }
    }

    /// The register class values of this slot need.
    pub fn class(&self) -> RegClass {
        reg_class_for(self.ty)
    }
}

/// The model of the value stack: locals at indices `[0, num_locals)`,
/// followed by the operand stack.
///
/// Every slot in a register is reflected in the ownership table with a
/// matching use count.
#[derive(Debug, Clone, Default)]
pub(crate) struct CacheState {
    pub slots: SmallVec<[Slot; 32]>,
    pub regs: RegAlloc,
}

impl CacheState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of slots, locals included.
    pub fn height(&self) -> usize {
        self.slots.len()
    }

    /// Push a value held in a register, taking a reference to it.
    pub fn push_reg(&mut self, ty: ValType, reg: Reg) {
        self.regs.inc_used(reg);
        self.slots.push(Slot::reg(ty, reg));
    }

    /// Push an i32 constant.
    pub fn push_i32(&mut self, value: i32) {
        self.slots.push(Slot::i32(value));
    }

    pub fn slot(&self, index: usize) -> Result<&Slot> {
        self.slots
            .get(index)
            .ok_or_else(|| CodeGenError::unexpected_value_stack_index().into())
    }

    /// Drop the reference a slot holds on its register, if any.
    pub fn release(&mut self, slot: &Slot) {
        if let Some(reg) = slot.get_reg() {
            self.regs.dec_used(reg);
        }
    }

    pub fn used_registers(&self) -> RegList {
        self.regs.used()
    }

    /// A copy of this state describing the expected layout at a branch
    /// target, with its own ownership table.
    pub fn split(&self) -> Self {
        self.clone()
    }

    /// Adopt `other` wholesale.
    pub fn steal(&mut self, other: CacheState) {
        *self = other;
    }

    /// Build the state expected at a branch target reached for the first
    /// time, from the state at the branch site.
    ///
    /// ```text
    /// |------locals------|---(in between)---|--(discarded)--|----merge----|
    ///  <-- num_locals -->                   ^stack_base      <-- arity -->
    /// ```
    ///
    /// Locals and merge values keep the registers they use in `source`, but
    /// no register is used twice; unused registers are taken where possible,
    /// otherwise the value goes to its stack slot. Values in between keep
    /// constants and registers not already claimed, everything else is
    /// spilled.
    pub fn init_merge(
        source: &CacheState,
        num_locals: usize,
        stack_base: usize,
        arity: usize,
        regset: &RegSet,
    ) -> Result<Self> {
        let height = source.height();
        if stack_base < num_locals || height < stack_base + arity {
            return Err(CodeGenError::control_frame_state_mismatch().into());
        }
        let mut target = Self::new();
        target
            .slots
            .resize(stack_base + arity, Slot::stack(ValType::I32));

        let merge = (height - arity..height).zip(stack_base..stack_base + arity);
        let locals = (0..num_locals).zip(0..num_locals);
        for (src_index, dst_index) in merge.chain(locals) {
            let src = source.slots[src_index];
            let class = src.class();
            let reg = match src.get_reg() {
                Some(reg) if target.regs.is_free(reg) => Some(reg),
                _ => target.regs.unused_reg(regset.candidates(class), RegList::empty()),
            };
            target.slots[dst_index] = match reg {
                Some(reg) => {
                    target.regs.inc_used(reg);
                    Slot::reg(src.ty, reg)
                }
                None => Slot::stack(src.ty),
            };
        }

        for index in num_locals..stack_base {
            let src = source.slots[index];
            target.slots[index] = match src.loc {
                Loc::Reg(reg) if target.regs.is_used(reg) => Slot::stack(src.ty),
                Loc::Reg(reg) => {
                    target.regs.inc_used(reg);
                    src
                }
                Loc::I32Const(_) => src,
                Loc::Stack => Slot::stack(src.ty),
            };
        }

        target.regs.set_last_spilled(source.regs.last_spilled());
        Ok(target)
    }

    /// Returns true if the use count of every register matches the number
    /// of slots referring to it.
    #[cfg(test)]
    pub fn use_counts_consistent(&self) -> bool {
        let mut seen = RegList::empty();
        for reg in self.slots.iter().filter_map(Slot::get_reg) {
            seen.set(reg);
        }
        if seen != self.regs.used() {
            return false;
        }
        seen.iter().all(|reg| {
            let refs = self
                .slots
                .iter()
                .filter(|slot| slot.get_reg() == Some(reg))
                .count();
            refs as u32 == self.regs.use_count(reg)
        })
    }
}

fn type_name(ty: ValType) -> &'static str {
    match ty {
        ValType::I32 => "i32",
        ValType::I64 => "i64",
        ValType::F32 => "f32",
        ValType::F64 => "f64",
        ValType::V128 => "v128",
        _ => "ref",
    }
}

/// Prints the slots as `type:location` joined by `-`, where the location is
/// `s` for a stack slot, `c` for a constant or the register name.
impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, slot) in self.slots.iter().enumerate() {
            if index > 0 {
                write!(f, "-")?;
            }
            write!(f, "{}:", type_name(slot.ty))?;
            match slot.loc {
                Loc::Stack => write!(f, "s")?,
                Loc::Reg(reg) => write!(f, "{reg}")?,
                Loc::I32Const(_) => write!(f, "c")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{CacheState, Loc, Slot};
    use crate::isa::reg::Reg;
    use crate::regset::{RegBitSet, RegSet};
    use wasmparser::ValType;

    fn regset() -> RegSet {
        RegSet::new(
            RegBitSet::int(0b1111, 0, 16),
            RegBitSet::float(0b11, 0, 16),
        )
    }

    #[test]
    fn test_split_and_steal() {
        let mut state = CacheState::new();
        state.push_reg(ValType::I32, Reg::int(0));
        let split = state.split();
        state.push_i32(3);
        assert_eq!(split.height(), 1);
        assert_eq!(split.regs.use_count(Reg::int(0)), 1);

        state.steal(split);
        assert_eq!(state.height(), 1);
        assert!(state.use_counts_consistent());
    }

    #[test]
    fn test_init_merge_never_shares_registers() {
        // One local and two stack values, all in the same register.
        let mut source = CacheState::new();
        source.push_reg(ValType::I32, Reg::int(1));
        source.push_reg(ValType::I32, Reg::int(1));
        source.push_reg(ValType::I32, Reg::int(1));

        let target = CacheState::init_merge(&source, 1, 1, 1, &regset()).unwrap();
        assert_eq!(target.height(), 2);
        // The merge value is assigned first and keeps the register.
        assert_eq!(target.slots[1].loc, Loc::Reg(Reg::int(1)));
        // The local gets the first unused register instead.
        assert_eq!(target.slots[0].loc, Loc::Reg(Reg::int(0)));
        assert!(target.use_counts_consistent());
    }

    #[test]
    fn test_init_merge_in_between_region() {
        let mut source = CacheState::new();
        source.push_reg(ValType::I32, Reg::int(2));
        source.push_i32(7);
        source.push_reg(ValType::I32, Reg::int(2));
        source.push_reg(ValType::F32, Reg::float(0));
        source.slots.push(Slot::stack(ValType::I32));

        // Local 0, three values in between and no merge values.
        let target = CacheState::init_merge(&source, 1, 5, 0, &regset()).unwrap();
        assert_eq!(target.slots[0].loc, Loc::Reg(Reg::int(2)));
        assert_eq!(target.slots[1].loc, Loc::I32Const(7));
        // Already claimed by the local.
        assert_eq!(target.slots[2].loc, Loc::Stack);
        assert_eq!(target.slots[3].loc, Loc::Reg(Reg::float(0)));
        assert_eq!(target.slots[4].loc, Loc::Stack);
        assert!(target.use_counts_consistent());
    }

    #[test]
    fn test_init_merge_falls_back_to_stack() {
        let small = RegSet::new(RegBitSet::int(0b1, 0, 16), RegBitSet::float(0, 0, 16));
        let mut source = CacheState::new();
        source.push_i32(1);
        source.push_i32(2);
        let target = CacheState::init_merge(&source, 2, 2, 0, &small).unwrap();
        assert_eq!(target.slots[0].loc, Loc::Reg(Reg::int(0)));
        assert_eq!(target.slots[1].loc, Loc::Stack);
    }

    #[test]
    fn test_trace_format() {
        let mut state = CacheState::new();
        state.push_reg(ValType::I32, Reg::int(3));
        state.slots.push(Slot::stack(ValType::F32));
        state.push_i32(0);
        assert_eq!(state.to_string(), "i32:gp3-f32:s-i32:c");
    }
}
