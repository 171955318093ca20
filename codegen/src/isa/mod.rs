use crate::{
    buffer::FinalizedCode,
    codegen::ModuleEnv,
    settings::Settings,
    tables::{SafepointTable, SourcePosition},
};
use anyhow::{Result, anyhow};
use core::fmt::Formatter;
use core::sync::atomic::AtomicBool;
use std::{
    error,
    fmt::{self, Debug, Display},
};
use target_lexicon::{Architecture, Triple};
use wasmparser::{FuncType, FuncValidator, FunctionBody, ValidatorResources};

#[cfg(feature = "x64")]
pub(crate) mod x64;

pub(crate) mod reg;

macro_rules! isa_builder {
    ($name: ident, $cfg_terms: tt, $triple: ident) => {{
        #[cfg $cfg_terms]
        {
            Ok($name::isa_builder($triple))
        }
        #[cfg(not $cfg_terms)]
        {
            Err(anyhow!(LookupError::SupportDisabled))
        }
    }};
}

/// The target ISA constructor.
type Constructor = fn(Triple, Settings) -> Result<Box<dyn TargetIsa>>;

/// The target ISA builder.
#[derive(Clone)]
pub struct Builder {
    /// The target triple.
    triple: Triple,
    /// The Target ISA constructor.
    constructor: Constructor,
}

impl Builder {
    pub(crate) fn new(triple: Triple, constructor: Constructor) -> Self {
        Self {
            triple,
            constructor,
        }
    }

    /// The target triple of the ISA to build.
    pub fn triple(&self) -> &Triple {
        &self.triple
    }

    /// Create a TargetIsa compiling with the given settings.
    pub fn build(self, settings: Settings) -> Result<Box<dyn TargetIsa>> {
        (self.constructor)(self.triple, settings)
    }
}

/// Look for an ISA builder for the given target triple.
pub fn lookup(triple: Triple) -> Result<Builder> {
    match triple.architecture {
        Architecture::X86_64 => {
            isa_builder!(x64, (feature = "x64"), triple)
        }

        _ => Err(anyhow!(LookupError::Unsupported)),
    }
}

impl error::Error for LookupError {}
impl Display for LookupError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LookupError::Unsupported => write!(f, "This target is not supported yet"),
            LookupError::SupportDisabled => write!(f, "Support for this target was disabled"),
        }
    }
}

#[derive(Debug)]
pub(crate) enum LookupError {
    Unsupported,
    // Never constructed when every backend is enabled.
    #[allow(dead_code)]
    SupportDisabled,
}

/// The output of a successful function compilation.
#[derive(Debug, Clone)]
pub struct CompiledFunction {
    /// The finalized code.
    pub code: FinalizedCode,
    /// One safepoint per runtime stub call.
    pub safepoints: SafepointTable,
    /// Source positions of the runtime stub calls.
    pub source_positions: Vec<SourcePosition>,
    /// Number of stack slots in the frame.
    pub frame_slot_count: u32,
}

/// A trait representing commonalities between the supported
/// instruction set architectures.
pub trait TargetIsa: Send + Sync {
    /// Get the name of the ISA.
    fn name(&self) -> &'static str;

    /// Get the target triple of the ISA.
    fn triple(&self) -> &Triple;

    /// The settings every function is compiled with.
    fn settings(&self) -> &Settings;

    /// Compile a single function.
    ///
    /// A function using a construct outside the supported subset fails with
    /// [`crate::CodeGenError::Unsupported`], carrying the reason. The
    /// validator is fed every operator compiled; after a bailout the rest of
    /// the body is neither compiled nor validated. Setting `abort` makes the
    /// compilation bail out before the next operator.
    fn compile_function(
        &self,
        sig: &FuncType,
        body: &FunctionBody,
        env: &ModuleEnv,
        validator: &mut FuncValidator<ValidatorResources>,
        abort: Option<&AtomicBool>,
    ) -> Result<CompiledFunction>;

    /// Get the endianess of the underlying target triple.
    fn endianness(&self) -> Option<target_lexicon::Endianness> {
        self.triple().endianness().ok()
    }
}

impl Debug for &dyn TargetIsa {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Target ISA {{ triple: {:?}, settings: {:?} }}",
            self.triple(),
            self.settings()
        )
    }
}
