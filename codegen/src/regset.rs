use crate::isa::reg::{Reg, RegClass};
use core::fmt;
use std::ops::{Index, IndexMut};

/// The registers a target makes available to the cache state, per class.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RegSet {
    /// Bitset of allocatable general purpose registers.
    gpr: RegBitSet,
    /// Bitset of allocatable floating-point registers.
    fpr: RegBitSet,
}

impl Index<RegClass> for RegSet {
    type Output = RegBitSet;

    fn index(&self, class: RegClass) -> &Self::Output {
        match class {
            RegClass::Int => &self.gpr,
            RegClass::Float => &self.fpr,
            c => unreachable!("Unexpected register class {:?}", c),
        }
    }
}

impl IndexMut<RegClass> for RegSet {
    fn index_mut(&mut self, class: RegClass) -> &mut Self::Output {
        match class {
            RegClass::Int => &mut self.gpr,
            RegClass::Float => &mut self.fpr,
            c => unreachable!("Unexpected register class {:?}", c),
        }
    }
}

/// Bitset for a particular register class.
#[derive(Debug, Clone, Copy)]
pub struct RegBitSet {
    /// The register class.
    class: RegClass,
    /// The set of allocatable registers.
    allocatable: u64,
    /// The set of non-alloctable registers.
    non_allocatable: u64,
    /// The max number of registers.
    /// Invariant:
    /// The encoding (index) of every register in the set must be less than
    /// the max property.
    max: usize,
}

impl RegBitSet {
    /// Creates an integer register class bitset.
    pub fn int(allocatable: u64, non_allocatable: u64, max: usize) -> Self {
        // Assert that one set is the complement of the other.
        debug_assert!(allocatable & non_allocatable == 0);
        Self {
            class: RegClass::Int,
            allocatable,
            non_allocatable,
            max,
        }
    }

    /// Creates a float register class bitset.
    pub fn float(allocatable: u64, non_allocatable: u64, max: usize) -> Self {
        // Assert that one set is the complement of the other.
        debug_assert!(allocatable & non_allocatable == 0);
        Self {
            class: RegClass::Float,
            allocatable,
            non_allocatable,
            max,
        }
    }
}

impl RegSet {
    /// Create a new register set.
    pub fn new(gpr: RegBitSet, fpr: RegBitSet) -> Self {
        debug_assert!(gpr.class == RegClass::Int);
        debug_assert!(fpr.class == RegClass::Float);

        Self { gpr, fpr }
    }

    /// The allocatable registers of the given class.
    pub fn candidates(&self, class: RegClass) -> RegList {
        RegList::from_bits(class, self[class].allocatable)
    }

    /// Returns true if the register can be handed out by the cache state.
    pub fn is_allocatable(&self, reg: Reg) -> bool {
        let bitset = &self[reg.class()];
        assert!(reg.hw_enc() < bitset.max);
        let index = 1 << reg.hw_enc();
        bitset.allocatable & index != 0 && bitset.non_allocatable & index == 0
    }
}

/// A set of registers of both classes, keyed by hardware encoding.
///
/// Used for the registers in use by a cache state, for the registers pinned
/// while emitting a single instruction, and for the registers saved around
/// out-of-line calls.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub(crate) struct RegList {
    gpr: u64,
    fpr: u64,
}

impl RegList {
    /// The empty list.
    pub const fn empty() -> Self {
        Self { gpr: 0, fpr: 0 }
    }

    fn from_bits(class: RegClass, bits: u64) -> Self {
        match class {
            RegClass::Int => Self { gpr: bits, fpr: 0 },
            RegClass::Float => Self { gpr: 0, fpr: bits },
            c => unreachable!("Unexpected register class {:?}", c),
        }
    }

    fn bits(&self, class: RegClass) -> u64 {
        match class {
            RegClass::Int => self.gpr,
            RegClass::Float => self.fpr,
            c => unreachable!("Unexpected register class {:?}", c),
        }
    }

    fn bits_mut(&mut self, class: RegClass) -> &mut u64 {
        match class {
            RegClass::Int => &mut self.gpr,
            RegClass::Float => &mut self.fpr,
            c => unreachable!("Unexpected register class {:?}", c),
        }
    }

    pub fn has(&self, reg: Reg) -> bool {
        self.bits(reg.class()) & (1 << reg.hw_enc()) != 0
    }

    /// Adds the register to the list, returning it.
    pub fn set(&mut self, reg: Reg) -> Reg {
        *self.bits_mut(reg.class()) |= 1 << reg.hw_enc();
        reg
    }

    pub fn clear(&mut self, reg: Reg) {
        *self.bits_mut(reg.class()) &= !(1 << reg.hw_enc());
    }

    pub fn is_empty(&self) -> bool {
        self.gpr == 0 && self.fpr == 0
    }

    #[cfg(test)]
    pub fn len(&self) -> u32 {
        self.gpr.count_ones() + self.fpr.count_ones()
    }

    /// The registers in `self` that are not in `other`.
    pub fn mask_out(self, other: Self) -> Self {
        Self {
            gpr: self.gpr & !other.gpr,
            fpr: self.fpr & !other.fpr,
        }
    }

    /// The register with the lowest encoding, general purpose registers
    /// first.
    pub fn first(&self) -> Option<Reg> {
        if self.gpr != 0 {
            Some(Reg::int(self.gpr.trailing_zeros() as usize))
        } else if self.fpr != 0 {
            Some(Reg::float(self.fpr.trailing_zeros() as usize))
        } else {
            None
        }
    }

    /// Iterate over the registers in ascending encoding order, general purpose
    /// registers first.
    pub fn iter(&self) -> impl Iterator<Item = Reg> {
        let gpr = BitIter(self.gpr).map(Reg::int);
        let fpr = BitIter(self.fpr).map(Reg::float);
        gpr.chain(fpr)
    }
}

impl FromIterator<Reg> for RegList {
    fn from_iter<T: IntoIterator<Item = Reg>>(iter: T) -> Self {
        let mut list = RegList::empty();
        for reg in iter {
            list.set(reg);
        }
        list
    }
}

impl fmt::Debug for RegList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

struct BitIter(u64);

impl Iterator for BitIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.0 == 0 {
            return None;
        }
        let index = self.0.trailing_zeros() as usize;
        self.0 &= self.0 - 1;
        Some(index)
    }
}
