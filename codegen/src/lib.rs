//! Liftoff: a single-pass, non-optimizing WebAssembly compiler.
//!
//! Liftoff walks a validated function body once and emits machine code
//! directly. Values are tracked in a cache state that maps every local and
//! operand stack slot to a register, an inline constant or a spill slot.
//! Anything outside the supported subset makes the whole function bail out,
//! so that a more general tier can compile it instead.

mod abi;
pub mod buffer;
mod codegen;
pub use codegen::{CodeGenError, InternalError, ModuleEnv, VMContextOffsets};
pub mod isa;
pub use isa::*;
mod masm;
pub use masm::Builtin;
mod regalloc;
mod regset;
mod settings;
pub use settings::Settings;
pub mod tables;
mod translate;
pub use translate::{FunctionTranslation, ModuleTranslation, translate_module};
mod visitor;

pub use codegen::env::{GlobalData, MAX_MEMORY_PAGES, MemoryData, WASM_PAGE_SIZE};
pub use codegen::MAX_VALUE_STACK_HEIGHT;
