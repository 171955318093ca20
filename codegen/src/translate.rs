//! Splitting a module into the inputs of per-function compilation.

use crate::codegen::{CodeGenError, ModuleEnv};
use anyhow::{Result, anyhow};
use wasmparser::{
    FuncToValidate, FuncType, FunctionBody, Parser, ValidPayload, Validator, ValidatorResources,
    WasmModuleResources,
};

/// A function body ready to be compiled.
pub struct FunctionTranslation<'data> {
    /// The function index, imported functions included.
    pub index: u32,
    /// The function signature.
    pub sig: FuncType,
    /// The undecoded body.
    pub body: FunctionBody<'data>,
    /// The validator of the body, fed while the body is compiled.
    pub validator: FuncToValidate<ValidatorResources>,
}

/// A validated module, split into its environment and function bodies.
pub struct ModuleTranslation<'data> {
    /// The module environment shared by every function.
    pub env: ModuleEnv,
    /// The defined functions, in index order.
    pub functions: Vec<FunctionTranslation<'data>>,
}

/// Validate the module-level sections of `wasm` and collect its function
/// bodies.
///
/// Function bodies themselves are validated as they are compiled.
pub fn translate_module(wasm: &[u8]) -> Result<ModuleTranslation<'_>> {
    let mut validator = Validator::new();
    let mut env = None;
    let mut functions = Vec::new();

    for payload in Parser::new(0).parse_all(wasm) {
        let payload = payload.map_err(CodeGenError::from)?;
        match validator.payload(&payload).map_err(CodeGenError::from)? {
            ValidPayload::Func(validator, body) => {
                // Every section the environment reads precedes the code
                // section.
                if env.is_none() {
                    env = Some(ModuleEnv::from_resources(&validator.resources));
                }
                let sig = function_type(&validator.resources, validator.index)?;
                log::trace!("function {}: {sig:?}", validator.index);
                functions.push(FunctionTranslation {
                    index: validator.index,
                    sig,
                    body,
                    validator,
                });
            }
            _ => {}
        }
    }

    Ok(ModuleTranslation {
        env: env.unwrap_or_default(),
        functions,
    })
}

fn function_type(resources: &ValidatorResources, index: u32) -> Result<FuncType> {
    let type_index = resources
        .type_index_of_function(index)
        .ok_or_else(|| anyhow!("missing type of function {index}"))?;
    let sub_type = resources
        .sub_type_at(type_index)
        .ok_or_else(|| anyhow!("missing type {type_index}"))?;
    Ok(sub_type.unwrap_func().clone())
}

#[cfg(test)]
mod tests {
    use super::translate_module;
    use wasmparser::ValType;

    #[test]
    fn test_function_signatures_skip_imports() {
        let wasm = wat::parse_str(
            r#"
            (module
              (import "env" "f" (func (param i64)))
              (memory 2 4)
              (global (mut i32) (i32.const 0))
              (func (param i32 f32) (result f32) (local.get 1))
              (func))
            "#,
        )
        .unwrap();
        let translation = translate_module(&wasm).unwrap();
        let indices: Vec<_> = translation.functions.iter().map(|f| f.index).collect();
        assert_eq!(indices, [1, 2]);
        let sig = &translation.functions[0].sig;
        assert_eq!(sig.params(), [ValType::I32, ValType::F32]);
        assert_eq!(sig.results(), [ValType::F32]);
        assert!(translation.functions[1].sig.params().is_empty());
        assert!(translation.env.memory().is_some());
    }
}
