use core::fmt;
use regalloc2::PReg;
pub use regalloc2::RegClass;

/// A physical register representation.
///
/// Liftoff only deals with physical registers; the wrapped `PReg` provides
/// the hardware encoding and the register class.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Reg(PReg);

impl Reg {
    /// Create a register from its encoding and class.
    pub fn from(class: RegClass, enc: usize) -> Self {
        Self::new(PReg::new(enc, class))
    }

    /// Create a new register from a physical register.
    pub const fn new(raw: PReg) -> Self {
        Reg(raw)
    }

    /// Create a new general purpose register from encoding.
    pub fn int(enc: usize) -> Self {
        Self::new(PReg::new(enc, RegClass::Int))
    }

    /// Create a new floating point register from encoding.
    pub fn float(enc: usize) -> Self {
        Self::new(PReg::new(enc, RegClass::Float))
    }

    /// Get the class of the underlying register.
    pub fn class(self) -> RegClass {
        self.0.class()
    }

    /// Get the encoding of the underlying register.
    pub fn hw_enc(self) -> usize {
        self.0.hw_enc()
    }

    /// Returns true if the registers is a general purpose
    /// integer register.
    pub fn is_int(&self) -> bool {
        self.class() == RegClass::Int
    }

    /// Returns true if the registers is a float register.
    pub fn is_float(&self) -> bool {
        self.class() == RegClass::Float
    }
}

impl From<Reg> for PReg {
    fn from(reg: Reg) -> Self {
        reg.0
    }
}

/// Target independent register names, `gpN` and `fpN`, as used when tracing
/// the cache state.
impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.class() {
            RegClass::Int => write!(f, "gp{}", self.hw_enc()),
            _ => write!(f, "fp{}", self.hw_enc()),
        }
    }
}
