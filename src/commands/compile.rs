//! The module that implements the `liftoff-tools compile` command.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use liftoff_codegen::{CodeGenError, CompiledFunction, Settings, TargetIsa, lookup};
use rayon::prelude::*;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Instant;
use target_lexicon::Triple;
use wasmparser::FuncValidatorAllocations;

/// Flags shared by the commands that compile code.
#[derive(Parser)]
pub struct CodegenOptions {
    /// The target triple; defaults to the host triple.
    #[arg(long, value_name = "TARGET")]
    target: Option<String>,

    /// Don't emit explicit bounds checks before memory accesses.
    #[arg(long)]
    no_bounds_checks: bool,

    /// Don't emit the stack limit check at function entry.
    #[arg(long)]
    no_stack_checks: bool,

    /// Assume memory faults are not routed through a trap handler.
    #[arg(long)]
    no_trap_handler: bool,

    /// Call the testing trap callback instead of the runtime stubs.
    #[arg(long)]
    no_runtime_exceptions: bool,
}

impl CodegenOptions {
    /// The target triple to compile for.
    pub fn triple(&self) -> Result<Triple> {
        match &self.target {
            Some(target) => Triple::from_str(target).map_err(|e| anyhow!("{e}")),
            None => Ok(Triple::host()),
        }
    }

    /// The compilation settings selected by the flags.
    pub fn settings(&self) -> Settings {
        Settings {
            use_trap_handler: !self.no_trap_handler,
            bounds_checks: !self.no_bounds_checks,
            stack_checks: !self.no_stack_checks,
            runtime_exception_support: !self.no_runtime_exceptions,
        }
    }

    /// Build the ISA compiling with these options.
    pub fn isa(&self) -> Result<Box<dyn TargetIsa>> {
        let triple = self.triple()?;
        lookup(triple.clone())
            .with_context(|| format!("failed to find a backend for `{triple}`"))?
            .build(self.settings())
    }
}

/// Compiles every function of a WebAssembly module and prints the code.
#[derive(Parser)]
pub struct CompileCommand {
    #[command(flatten)]
    codegen: CodegenOptions,

    /// Only print the bailouts and the summary.
    #[arg(long, short)]
    quiet: bool,

    /// The path of the module to compile, in binary or text format.
    #[arg(value_name = "MODULE")]
    module: PathBuf,
}

impl CompileCommand {
    /// Executes the command.
    pub fn execute(self) -> Result<()> {
        let isa = self.codegen.isa()?;
        let bytes = std::fs::read(&self.module)
            .with_context(|| format!("failed to read `{}`", self.module.display()))?;
        let wasm = wat::parse_bytes(&bytes)
            .with_context(|| format!("failed to parse `{}`", self.module.display()))?;
        let translation = liftoff_codegen::translate_module(&wasm)?;
        log::debug!(
            "compiling {} functions for {}",
            translation.functions.len(),
            isa.triple()
        );

        let start = Instant::now();
        let env = &translation.env;
        let results = translation
            .functions
            .into_par_iter()
            .map(|func| {
                let mut validator = func
                    .validator
                    .into_validator(FuncValidatorAllocations::default());
                let result =
                    isa.compile_function(&func.sig, &func.body, env, &mut validator, None);
                (func.index, result)
            })
            .collect::<Vec<_>>();
        let elapsed = start.elapsed();

        let mut compiled = 0;
        let mut bailouts = 0;
        for (index, result) in &results {
            match result {
                Ok(func) => {
                    compiled += 1;
                    if !self.quiet {
                        print_function(*index, func);
                    }
                }
                Err(e) => match e.downcast_ref::<CodeGenError>() {
                    Some(CodeGenError::Unsupported(reason)) => {
                        bailouts += 1;
                        println!(";; function {index}");
                        println!(";; bailout: {reason}");
                    }
                    _ => return Err(anyhow!("failed to compile function {index}: {e:#}")),
                },
            }
        }

        println!(";; {compiled} compiled, {bailouts} bailed out in {elapsed:?}");
        Ok(())
    }
}

fn print_function(index: u32, func: &CompiledFunction) {
    println!(";; function {index}");
    println!(
        ";; {} instructions, {} stack slots",
        func.code.len(),
        func.frame_slot_count
    );
    for (offset, inst) in func.code.insts().iter().enumerate() {
        let safepoint = if func.safepoints.find(offset as u32 + 1).is_some() {
            "  ;; safepoint"
        } else {
            ""
        };
        println!("  {offset:#06x}: {inst}{safepoint}");
    }
}
