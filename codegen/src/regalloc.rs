use crate::{
    isa::reg::{Reg, RegClass},
    regset::RegList,
};

/// Number of distinct register codes: 64 per register class.
const NUM_REG_CODES: usize = 128;

/// The register ownership table.
///
/// The register allocator uses a single-pass algorithm; a register is handed
/// out to a value on the cache state and stays owned until every slot
/// referring to it is popped, overwritten or spilled. A single register can
/// back several slots at once (e.g. a local and its copies on the operand
/// stack), so ownership is tracked as a reference count per register.
///
/// If no register of a class is free upon request the caller spills the one
/// returned by [`RegAlloc::next_spill_reg`], which moves every slot held in
/// that register to its stack slot.
#[derive(Debug, Clone)]
pub(crate) struct RegAlloc {
    /// Registers with a non-zero use count.
    used: RegList,
    /// Use count per register code.
    counts: [u32; NUM_REG_CODES],
    /// Registers spilled recently; spill candidates rotate through the
    /// register file instead of evicting the same register repeatedly.
    last_spilled: RegList,
}

impl Default for RegAlloc {
    fn default() -> Self {
        Self::new()
    }
}

fn code(reg: Reg) -> usize {
    match reg.class() {
        RegClass::Int => reg.hw_enc(),
        RegClass::Float => 64 + reg.hw_enc(),
        c => unreachable!("Unexpected register class {:?}", c),
    }
}

impl RegAlloc {
    /// Create an empty ownership table.
    pub fn new() -> Self {
        Self {
            used: RegList::empty(),
            counts: [0; NUM_REG_CODES],
            last_spilled: RegList::empty(),
        }
    }

    pub fn inc_used(&mut self, reg: Reg) {
        self.used.set(reg);
        self.counts[code(reg)] += 1;
    }

    pub fn dec_used(&mut self, reg: Reg) {
        let count = &mut self.counts[code(reg)];
        debug_assert!(*count > 0, "register {reg} is not in use");
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.used.clear(reg);
        }
    }

    /// Drop every reference to the given register.
    pub fn clear_used(&mut self, reg: Reg) {
        self.counts[code(reg)] = 0;
        self.used.clear(reg);
    }

    pub fn is_used(&self, reg: Reg) -> bool {
        self.used.has(reg)
    }

    pub fn is_free(&self, reg: Reg) -> bool {
        !self.is_used(reg)
    }

    pub fn use_count(&self, reg: Reg) -> u32 {
        self.counts[code(reg)]
    }

    /// The registers with a non-zero use count.
    pub fn used(&self) -> RegList {
        self.used
    }

    /// Returns the lowest free register among `candidates` that is not
    /// pinned.
    pub fn unused_reg(&self, candidates: RegList, pinned: RegList) -> Option<Reg> {
        candidates.mask_out(self.used).mask_out(pinned).first()
    }

    /// Picks the register to evict when none of `candidates` is free.
    ///
    /// Registers are rotated through: a register spilled recently is only
    /// picked again once every other unpinned candidate has been spilled.
    /// Among the remaining ones, the register backing the fewest slots wins.
    /// Returns `None` only if every candidate is pinned.
    pub fn next_spill_reg(&mut self, candidates: RegList, pinned: RegList) -> Option<Reg> {
        let unpinned = candidates.mask_out(pinned);
        if unpinned.is_empty() {
            return None;
        }
        let mut unspilled = unpinned.mask_out(self.last_spilled);
        if unspilled.is_empty() {
            self.last_spilled = RegList::empty();
            unspilled = unpinned;
        }
        let reg = unspilled.iter().min_by_key(|r| self.use_count(*r))?;
        self.last_spilled.set(reg);
        Some(reg)
    }

    pub fn last_spilled(&self) -> RegList {
        self.last_spilled
    }

    pub fn set_last_spilled(&mut self, regs: RegList) {
        self.last_spilled = regs;
    }
}

#[cfg(test)]
mod tests {
    use super::RegAlloc;
    use crate::{isa::reg::Reg, regset::RegList};

    fn gprs(n: usize) -> RegList {
        (0..n).map(Reg::int).collect()
    }

    #[test]
    fn test_use_counts() {
        let mut regs = RegAlloc::new();
        let r = Reg::int(2);
        regs.inc_used(r);
        regs.inc_used(r);
        assert_eq!(regs.use_count(r), 2);
        assert!(regs.is_used(r));

        regs.dec_used(r);
        assert!(regs.is_used(r));
        regs.dec_used(r);
        assert!(regs.is_free(r));
        assert_eq!(regs.used(), RegList::empty());
    }

    #[test]
    fn test_classes_do_not_alias() {
        let mut regs = RegAlloc::new();
        regs.inc_used(Reg::int(1));
        assert!(regs.is_free(Reg::float(1)));
        assert_eq!(regs.use_count(Reg::float(1)), 0);
    }

    #[test]
    fn test_unused_reg_honors_pinned() {
        let mut regs = RegAlloc::new();
        regs.inc_used(Reg::int(0));
        let mut pinned = RegList::empty();
        pinned.set(Reg::int(1));
        assert_eq!(regs.unused_reg(gprs(4), pinned), Some(Reg::int(2)));
        regs.inc_used(Reg::int(2));
        regs.inc_used(Reg::int(3));
        assert_eq!(regs.unused_reg(gprs(4), pinned), None);
    }

    #[test]
    fn test_spill_candidates_rotate() {
        let mut regs = RegAlloc::new();
        for r in gprs(3).iter() {
            regs.inc_used(r);
        }
        let first = regs.next_spill_reg(gprs(3), RegList::empty());
        let second = regs.next_spill_reg(gprs(3), RegList::empty());
        let third = regs.next_spill_reg(gprs(3), RegList::empty());
        assert_eq!(first, Some(Reg::int(0)));
        assert_eq!(second, Some(Reg::int(1)));
        assert_eq!(third, Some(Reg::int(2)));
        // Once every register was spilled the rotation starts over.
        assert_eq!(
            regs.next_spill_reg(gprs(3), RegList::empty()),
            Some(Reg::int(0))
        );
    }

    #[test]
    fn test_spill_prefers_fewest_uses() {
        let mut regs = RegAlloc::new();
        regs.inc_used(Reg::int(0));
        regs.inc_used(Reg::int(0));
        regs.inc_used(Reg::int(1));
        assert_eq!(
            regs.next_spill_reg(gprs(2), RegList::empty()),
            Some(Reg::int(1))
        );
    }

    #[test]
    fn test_spill_never_returns_pinned() {
        let mut regs = RegAlloc::new();
        let all = gprs(2);
        assert_eq!(regs.next_spill_reg(all, all), None);
        let mut pinned = RegList::empty();
        pinned.set(Reg::int(0));
        assert_eq!(regs.next_spill_reg(all, pinned), Some(Reg::int(1)));
        assert_eq!(regs.next_spill_reg(all, pinned), Some(Reg::int(1)));
    }
}
