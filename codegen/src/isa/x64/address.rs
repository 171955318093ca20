//! x64 addressing mode.

use super::regs::gpr_name;
use crate::isa::reg::Reg;
use core::fmt;

/// Memory address representation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Address {
    /// Base register with an immediate offset.
    Offset { base: Reg, offset: i32 },
    /// Base register plus an index register plus an immediate offset.
    Indexed { base: Reg, index: Reg, offset: u32 },
}

impl Address {
    /// Create an offset.
    pub fn offset(base: Reg, offset: i32) -> Self {
        Self::Offset { base, offset }
    }

    /// Create an indexed address.
    pub fn indexed(base: Reg, index: Reg, offset: u32) -> Self {
        Self::Indexed {
            base,
            index,
            offset,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Offset { base, offset } => {
                write!(f, "[{}", gpr_name(base, 8))?;
                match offset {
                    0 => {}
                    o if o < 0 => write!(f, " - {:#x}", o.unsigned_abs())?,
                    o => write!(f, " + {o:#x}")?,
                }
                write!(f, "]")
            }
            Self::Indexed {
                base,
                index,
                offset,
            } => {
                write!(f, "[{} + {}", gpr_name(base, 8), gpr_name(index, 8))?;
                if offset != 0 {
                    write!(f, " + {offset:#x}")?;
                }
                write!(f, "]")
            }
        }
    }
}
