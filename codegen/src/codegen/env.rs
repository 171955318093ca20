use crate::codegen::CodeGenError;
use anyhow::Result;
use wasmparser::{ValType, WasmModuleResources};

/// The size of a WebAssembly page, in bytes.
pub const WASM_PAGE_SIZE: u64 = 0x10000;

/// The number of pages assumed for a memory without a declared maximum.
pub const MAX_MEMORY_PAGES: u64 = 0x10000;

/// The size of a global in the globals area, in bytes.
const GLOBAL_SLOT_SIZE: u32 = 8;

/// Offsets of the fields of the `VMContext` read by compiled code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VMContextOffsets {
    /// Pointer to the start of linear memory.
    pub memory_start: u32,
    /// Current size of linear memory, in bytes.
    pub memory_size: u32,
    /// Pointer to the globals area.
    pub globals_start: u32,
    /// The stack limit checked at function entry.
    pub stack_limit: u32,
}

impl Default for VMContextOffsets {
    fn default() -> Self {
        Self {
            memory_start: 0,
            memory_size: 8,
            globals_start: 16,
            stack_limit: 24,
        }
    }
}

/// A global's type and location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalData {
    /// The value type of the global.
    pub ty: ValType,
    /// Whether the global is mutable.
    pub mutable: bool,
    /// Offset of the global in the globals area.
    pub offset: u32,
}

/// The linear memory of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryData {
    /// Initial size, in pages.
    pub initial_pages: u64,
    /// Maximum size, in pages.
    pub maximum_pages: Option<u64>,
    /// Whether the memory is indexed with 64-bit addresses.
    pub memory64: bool,
}

impl MemoryData {
    /// The smallest size the memory can have, in bytes.
    pub fn min_size(&self) -> u64 {
        self.initial_pages.saturating_mul(WASM_PAGE_SIZE)
    }

    /// The largest size the memory can grow to, in bytes.
    pub fn max_size(&self) -> u64 {
        self.maximum_pages
            .unwrap_or(MAX_MEMORY_PAGES)
            .min(MAX_MEMORY_PAGES)
            .saturating_mul(WASM_PAGE_SIZE)
    }
}

/// The module-level information the compiler reads.
///
/// The environment is immutable while functions are compiled and may be
/// shared by every compilation of the module.
#[derive(Debug, Clone, Default)]
pub struct ModuleEnv {
    globals: Vec<GlobalData>,
    memory: Option<MemoryData>,
    /// The layout of the `VMContext`.
    pub vmctx: VMContextOffsets,
}

impl ModuleEnv {
    /// An environment without memory and globals.
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect globals and the first memory from a module's validator
    /// resources.
    pub fn from_resources<R: WasmModuleResources>(resources: &R) -> Self {
        let mut env = Self::new();
        for global in (0..).map_while(|index| resources.global_at(index)) {
            env = env.with_global(global.content_type, global.mutable);
        }
        if let Some(memory) = resources.memory_at(0) {
            env.memory = Some(MemoryData {
                initial_pages: memory.initial,
                maximum_pages: memory.maximum,
                memory64: memory.memory64,
            });
        }
        env
    }

    /// Append a global; globals are laid out in declaration order.
    pub fn with_global(mut self, ty: ValType, mutable: bool) -> Self {
        let offset = self.globals.len() as u32 * GLOBAL_SLOT_SIZE;
        self.globals.push(GlobalData {
            ty,
            mutable,
            offset,
        });
        self
    }

    /// Declare a 32-bit memory with the given limits, in pages.
    pub fn with_memory(mut self, initial_pages: u64, maximum_pages: Option<u64>) -> Self {
        self.memory = Some(MemoryData {
            initial_pages,
            maximum_pages,
            memory64: false,
        });
        self
    }

    pub fn globals(&self) -> &[GlobalData] {
        &self.globals
    }

    pub fn global(&self, index: u32) -> Result<&GlobalData> {
        self.globals
            .get(index as usize)
            .ok_or_else(|| CodeGenError::unknown_global(index).into())
    }

    pub fn memory(&self) -> Option<&MemoryData> {
        self.memory.as_ref()
    }
}

/// The per-function view of the module environment.
///
/// Memory bounds are derived once, when the function's compiler is created.
pub(crate) struct FuncEnv<'a> {
    pub module: &'a ModuleEnv,
    /// Smallest possible memory size, in bytes.
    pub min_size: u64,
    /// Largest possible memory size, in bytes.
    pub max_size: u64,
}

impl<'a> FuncEnv<'a> {
    pub fn new(module: &'a ModuleEnv) -> Self {
        let (min_size, max_size) = module
            .memory()
            .map_or((0, 0), |memory| (memory.min_size(), memory.max_size()));
        Self {
            module,
            min_size,
            max_size,
        }
    }
}
