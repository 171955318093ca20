//! Side tables produced alongside the code of a function.

/// A code offset at which the runtime may inspect the frame, i.e. the
/// return address of a call out of compiled code.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Safepoint {
    /// The code offset right after the call.
    pub code_offset: u32,
}

/// The safepoints of a function.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SafepointTable {
    entries: Vec<Safepoint>,
    frame_slot_count: u32,
}

impl SafepointTable {
    pub fn entries(&self) -> &[Safepoint] {
        &self.entries
    }

    /// Total number of stack slots of the frame described by the table.
    pub fn frame_slot_count(&self) -> u32 {
        self.frame_slot_count
    }

    /// Find the safepoint recorded at `code_offset`.
    pub fn find(&self, code_offset: u32) -> Option<&Safepoint> {
        self.entries
            .binary_search_by_key(&code_offset, |entry| entry.code_offset)
            .ok()
            .map(|index| &self.entries[index])
    }
}

/// Collects safepoints in code order.
#[derive(Debug, Default)]
pub(crate) struct SafepointTableBuilder {
    entries: Vec<Safepoint>,
}

impl SafepointTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define_safepoint(&mut self, code_offset: u32) {
        debug_assert!(
            self.entries
                .last()
                .is_none_or(|last| last.code_offset <= code_offset)
        );
        self.entries.push(Safepoint { code_offset });
    }

    pub fn finish(self, frame_slot_count: u32) -> SafepointTable {
        SafepointTable {
            entries: self.entries,
            frame_slot_count,
        }
    }
}

/// Maps a code offset to the byte offset of the operator in the module it
/// was generated for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SourcePosition {
    pub code_offset: u32,
    pub position: u32,
    /// Whether the position marks a statement boundary.
    pub is_statement: bool,
}

/// Collects source positions in code order.
#[derive(Debug, Default)]
pub(crate) struct SourcePositionTableBuilder {
    entries: Vec<SourcePosition>,
}

impl SourcePositionTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_position(&mut self, code_offset: u32, position: u32, is_statement: bool) {
        self.entries.push(SourcePosition {
            code_offset,
            position,
            is_statement,
        });
    }

    pub fn finish(self) -> Vec<SourcePosition> {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::{SafepointTableBuilder, SourcePositionTableBuilder};

    #[test]
    fn test_safepoint_lookup() {
        let mut builder = SafepointTableBuilder::new();
        builder.define_safepoint(4);
        builder.define_safepoint(9);
        let table = builder.finish(70);
        assert_eq!(table.frame_slot_count(), 70);
        assert_eq!(table.entries().len(), 2);
        assert!(table.find(9).is_some());
        assert!(table.find(5).is_none());
    }

    #[test]
    fn test_source_positions_keep_order() {
        let mut builder = SourcePositionTableBuilder::new();
        builder.add_position(3, 0, false);
        builder.add_position(10, 42, false);
        let positions = builder.finish();
        assert_eq!(positions[1].position, 42);
        assert_eq!(positions[0].code_offset, 3);
    }
}
