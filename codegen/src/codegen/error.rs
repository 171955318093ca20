//! Classification of code generation errors.

use thiserror::Error;

/// A code generation error.
#[derive(Error, Debug)]
pub enum CodeGenError {
    /// The function uses a construct outside the supported subset and must
    /// be compiled by another tier.
    ///
    /// Every label of the function is bound by the time this is reported.
    #[error("unsupported liftoff operation: {0}")]
    Unsupported(String),
    /// The function body is malformed or fails validation.
    #[error(transparent)]
    Validation(#[from] wasmparser::BinaryReaderError),
    /// An internal error.
    ///
    /// This error means that an internal invariant was not met and usually
    /// implies a compiler bug.
    #[error("Liftoff internal error: {0}")]
    Internal(InternalError),
}

/// An internal error.
#[derive(Error, Debug)]
pub enum InternalError {
    /// Register allocation error.
    #[error("Expected register to be available")]
    ExpectedRegisterToBeAvailable,
    /// Control frame expected.
    #[error("Expected control frame")]
    ControlFrameExpected,
    /// Not enough values in the value stack.
    #[error("Not enough values in the value stack")]
    MissingValuesInStack,
    /// A pop reached the function locals.
    #[error("Popping a local from the value stack")]
    PopBelowLocals,
    /// Accessing the value stack with an invalid index.
    #[error("Unexpected value stack index")]
    UnexpectedValueStackIndex,
    /// Two states meeting at a merge point disagree on their shape.
    #[error("Mismatch in control frame state")]
    ControlFrameStateMismatch,
    /// A global index without a definition in the module environment.
    #[error("Unknown global {0}")]
    UnknownGlobal(u32),
    /// A label handle not allocated by the code buffer.
    #[error("Unknown label {0}")]
    UnknownLabel(u32),
    /// A label was bound more than once.
    #[error("Label {0} bound twice")]
    LabelBoundTwice(u32),
    /// A label was the target of a branch but never bound.
    #[error("Label {0} referenced but never bound")]
    UnboundLabel(u32),
}

impl CodeGenError {
    pub(crate) fn unsupported(reason: impl Into<String>) -> Self {
        Self::Unsupported(reason.into())
    }

    pub(crate) const fn expected_register_to_be_available() -> Self {
        Self::Internal(InternalError::ExpectedRegisterToBeAvailable)
    }

    pub(crate) const fn control_frame_expected() -> Self {
        Self::Internal(InternalError::ControlFrameExpected)
    }

    pub(crate) const fn missing_values_in_stack() -> Self {
        Self::Internal(InternalError::MissingValuesInStack)
    }

    pub(crate) const fn pop_below_locals() -> Self {
        Self::Internal(InternalError::PopBelowLocals)
    }

    pub(crate) const fn unexpected_value_stack_index() -> Self {
        Self::Internal(InternalError::UnexpectedValueStackIndex)
    }

    pub(crate) const fn control_frame_state_mismatch() -> Self {
        Self::Internal(InternalError::ControlFrameStateMismatch)
    }

    pub(crate) const fn unknown_global(index: u32) -> Self {
        Self::Internal(InternalError::UnknownGlobal(index))
    }

    pub(crate) const fn label_bound_twice(label: u32) -> Self {
        Self::Internal(InternalError::LabelBoundTwice(label))
    }

    pub(crate) const fn unbound_label(label: u32) -> Self {
        Self::Internal(InternalError::UnboundLabel(label))
    }

    /// The bailout reason, if this error is an unsupported construct.
    pub fn unsupported_reason(&self) -> Option<&str> {
        match self {
            Self::Unsupported(reason) => Some(reason),
            _ => None,
        }
    }
}
