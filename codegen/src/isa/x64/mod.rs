use crate::{
    abi::ABISig,
    codegen::{CodeGen, ModuleEnv, env::FuncEnv},
    isa::{Builder, CompiledFunction, TargetIsa},
    masm::MacroAssembler,
    settings::Settings,
};
use anyhow::Result;
use core::sync::atomic::AtomicBool;
use target_lexicon::Triple;
use wasmparser::{FuncType, FuncValidator, FunctionBody, ValidatorResources};

pub(crate) use self::masm::MacroAssembler as X64Masm;

pub(crate) mod abi;
mod address;
mod asm;
mod masm;
// Not all the register constructors are used outside of tests.
#[allow(dead_code)]
pub(crate) mod regs;

/// Create an ISA builder.
pub(crate) fn isa_builder(triple: Triple) -> Builder {
    Builder::new(triple, |triple, settings| {
        Ok(Box::new(X64::new(triple, settings)))
    })
}

/// x64 ISA.
pub(crate) struct X64 {
    /// The target triple.
    triple: Triple,
    /// Compilation settings.
    settings: Settings,
}

impl X64 {
    /// Create a x64 ISA.
    pub fn new(triple: Triple, settings: Settings) -> Self {
        Self { triple, settings }
    }
}

impl TargetIsa for X64 {
    fn name(&self) -> &'static str {
        "x64"
    }

    fn triple(&self) -> &Triple {
        &self.triple
    }

    fn settings(&self) -> &Settings {
        &self.settings
    }

    fn compile_function(
        &self,
        sig: &FuncType,
        body: &FunctionBody,
        env: &ModuleEnv,
        validator: &mut FuncValidator<ValidatorResources>,
        abort: Option<&AtomicBool>,
    ) -> Result<CompiledFunction> {
        let mut masm = X64Masm::new();
        let abi_sig = ABISig::new::<abi::X64ABI>(sig);
        let env = FuncEnv::new(env);

        let mut codegen = CodeGen::new(
            &self.settings,
            &mut masm,
            regs::allocatable(),
            env,
            abi_sig,
        );
        // Errors other than a bailout leave the code in an unknown state.
        codegen.emit(body, validator, abort)?;
        let emitted = codegen.finish();

        // Labels are verified even for a bailout.
        let code = masm.finalize()?;
        let emitted = emitted?;

        Ok(CompiledFunction {
            code,
            safepoints: emitted.safepoints,
            source_positions: emitted.source_positions,
            frame_slot_count: emitted.frame_slot_count,
        })
    }
}
