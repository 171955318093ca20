use super::cache::CacheState;
use crate::buffer::MachLabel;

/// The kind of a control frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ControlKind {
    /// The implicit block of the function body; its end is the return.
    Function,
    /// A `block`.
    Block,
    /// A `loop`.
    Loop,
    /// An `if`; only tracked in unreachable code.
    If,
    /// A `try` or `try_table`; only tracked in unreachable code.
    Try,
}

/// Holds the state of a control construct while its body is compiled.
///
/// Every frame owns a label and the cache state expected at that label.
/// For blocks the label marks the end of the block and is bound when the
/// frame is popped; its state is defined by the first branch or fallthrough
/// reaching the end. For loops the label marks the loop header: it is bound
/// on entry, and its state is the state at entry, with every local spilled.
#[derive(Debug)]
pub(crate) struct ControlFrame {
    pub kind: ControlKind,
    /// The branch target of the frame.
    pub label: MachLabel,
    /// The cache state at `label`.
    pub label_state: CacheState,
    /// Height of the cache state when the frame was entered.
    pub stack_base: usize,
    /// Number of values carried by a branch to this frame.
    pub br_arity: usize,
    /// Number of values the frame leaves on the stack.
    pub end_arity: usize,
    /// Whether `label_state` has been defined by some branch or fallthrough.
    pub reached: bool,
    /// Whether the frame was entered in reachable code. Frames entered in
    /// unreachable code are only tracked to keep the frame stack balanced.
    pub reachable_at_entry: bool,
}

impl ControlFrame {
    fn new(
        kind: ControlKind,
        label: MachLabel,
        stack_base: usize,
        br_arity: usize,
        end_arity: usize,
    ) -> Self {
        Self {
            kind,
            label,
            label_state: CacheState::new(),
            stack_base,
            br_arity,
            end_arity,
            reached: false,
            reachable_at_entry: true,
        }
    }

    /// The frame of the function body.
    pub fn function(label: MachLabel, num_locals: usize, results: usize) -> Self {
        Self::new(ControlKind::Function, label, num_locals, results, results)
    }

    /// A block; branches carry its results.
    pub fn block(label: MachLabel, stack_base: usize, results: usize) -> Self {
        Self::new(ControlKind::Block, label, stack_base, results, results)
    }

    /// A loop, entered with `state`; branches carry its parameters, of
    /// which there are none.
    pub fn loop_(label: MachLabel, state: &CacheState, results: usize) -> Self {
        let mut frame = Self::new(ControlKind::Loop, label, state.height(), 0, results);
        frame.label_state = state.split();
        frame.reached = true;
        frame
    }

    /// A frame entered in unreachable code.
    pub fn unreachable(kind: ControlKind, label: MachLabel, stack_base: usize) -> Self {
        let mut frame = Self::new(kind, label, stack_base, 0, 0);
        frame.reachable_at_entry = false;
        frame
    }

    pub fn is_loop(&self) -> bool {
        self.kind == ControlKind::Loop
    }

    pub fn is_function(&self) -> bool {
        self.kind == ControlKind::Function
    }
}
