//! Code buffer and label arena shared by every backend.
//!
//! Labels are handles into an arena owned by the buffer, never addresses, so
//! they can be copied freely into control frames and out-of-line entries.

use crate::codegen::{CodeGenError, InternalError};
use anyhow::Result;
use core::fmt;

/// A branch target.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct MachLabel(u32);

impl MachLabel {
    /// The index of the label in its arena.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for MachLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Binding state of a label.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LabelState {
    /// Not yet bound; jumps to it are resolved once it is.
    Unbound,
    /// Bound at the given instruction offset.
    Bound(u32),
}

#[derive(Debug, Copy, Clone)]
struct LabelData {
    state: LabelState,
    referenced: bool,
}

/// A buffer of instructions plus the labels pointing into it.
///
/// Code offsets are instruction indices.
pub(crate) struct CodeBuffer<I> {
    insts: Vec<I>,
    labels: Vec<LabelData>,
}

impl<I> Default for CodeBuffer<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I> CodeBuffer<I> {
    pub fn new() -> Self {
        Self {
            insts: Vec::new(),
            labels: Vec::new(),
        }
    }

    /// Allocate a fresh, unbound label.
    pub fn get_label(&mut self) -> MachLabel {
        let index = self.labels.len() as u32;
        self.labels.push(LabelData {
            state: LabelState::Unbound,
            referenced: false,
        });
        MachLabel(index)
    }

    /// Bind the label to the current offset.
    pub fn bind_label(&mut self, label: MachLabel) -> Result<()> {
        let offset = self.cur_offset();
        let data = self.data_mut(label)?;
        if let LabelState::Bound(_) = data.state {
            return Err(CodeGenError::label_bound_twice(label.0).into());
        }
        data.state = LabelState::Bound(offset);
        Ok(())
    }

    /// Record that a branch refers to the label.
    pub fn use_label(&mut self, label: MachLabel) {
        if let Some(data) = self.labels.get_mut(label.0 as usize) {
            data.referenced = true;
        }
    }

    pub fn label_state(&self, label: MachLabel) -> LabelState {
        self.labels
            .get(label.0 as usize)
            .map_or(LabelState::Unbound, |data| data.state)
    }

    pub fn is_bound(&self, label: MachLabel) -> bool {
        matches!(self.label_state(label), LabelState::Bound(_))
    }

    /// Labels that are the target of some branch but not yet bound.
    pub fn unbound_referenced(&self) -> impl Iterator<Item = MachLabel> + '_ {
        self.labels
            .iter()
            .enumerate()
            .filter(|(_, data)| data.referenced && data.state == LabelState::Unbound)
            .map(|(index, _)| MachLabel(index as u32))
    }

    pub fn cur_offset(&self) -> u32 {
        self.insts.len() as u32
    }

    pub fn push(&mut self, inst: I) {
        self.insts.push(inst);
    }

    #[cfg(test)]
    pub fn insts(&self) -> &[I] {
        &self.insts
    }

    /// Finish the buffer, checking that no referenced label is left unbound.
    ///
    /// Every instruction is rendered through `render`, which gets access to
    /// the final label offsets.
    pub fn finalize<F>(self, mut render: F) -> Result<FinalizedCode>
    where
        F: FnMut(&I, &dyn Fn(MachLabel) -> Option<u32>) -> String,
    {
        if let Some(label) = self.unbound_referenced().next() {
            return Err(CodeGenError::unbound_label(label.0).into());
        }
        let label_offsets: Vec<Option<u32>> = self
            .labels
            .iter()
            .map(|data| match data.state {
                LabelState::Bound(offset) => Some(offset),
                LabelState::Unbound => None,
            })
            .collect();
        let resolve = |label: MachLabel| label_offsets.get(label.0 as usize).copied().flatten();
        let insts = self.insts.iter().map(|inst| render(inst, &resolve)).collect();
        Ok(FinalizedCode {
            insts,
            label_offsets,
        })
    }

    fn data_mut(&mut self, label: MachLabel) -> Result<&mut LabelData> {
        self.labels
            .get_mut(label.0 as usize)
            .ok_or_else(|| CodeGenError::Internal(InternalError::UnknownLabel(label.0)).into())
    }
}

/// The finished code of a function.
///
/// Instructions are kept in their symbolic, printable form.
#[derive(Debug, Clone)]
pub struct FinalizedCode {
    insts: Vec<String>,
    label_offsets: Vec<Option<u32>>,
}

impl FinalizedCode {
    /// The instructions, in emission order.
    pub fn insts(&self) -> &[String] {
        &self.insts
    }

    /// The offset a label was bound at.
    pub fn label_offset(&self, label: MachLabel) -> Option<u32> {
        self.label_offsets.get(label.0 as usize).copied().flatten()
    }

    /// Code size, in instructions.
    pub fn len(&self) -> usize {
        self.insts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }
}

impl fmt::Display for FinalizedCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (offset, inst) in self.insts.iter().enumerate() {
            writeln!(f, "{offset:>4}: {inst}")?;
        }
        Ok(())
    }
}
