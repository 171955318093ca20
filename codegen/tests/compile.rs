use anyhow::Result;
use liftoff_codegen::{
    CodeGenError, CompiledFunction, Settings, TargetIsa, lookup, translate_module,
};
use std::str::FromStr;
use std::sync::atomic::AtomicBool;
use target_lexicon::Triple;
use wasmparser::FuncValidatorAllocations;

fn isa(settings: Settings) -> Box<dyn TargetIsa> {
    lookup(Triple::from_str("x86_64-unknown-linux-gnu").unwrap())
        .unwrap()
        .build(settings)
        .unwrap()
}

fn compile_with(
    wat: &str,
    settings: Settings,
    abort: Option<&AtomicBool>,
) -> Vec<Result<CompiledFunction>> {
    let _ = env_logger::try_init();
    let wasm = wat::parse_str(wat).unwrap();
    let translation = translate_module(&wasm).unwrap();
    let isa = isa(settings);
    translation
        .functions
        .into_iter()
        .map(|func| {
            let mut validator = func
                .validator
                .into_validator(FuncValidatorAllocations::default());
            isa.compile_function(
                &func.sig,
                &func.body,
                &translation.env,
                &mut validator,
                abort,
            )
        })
        .collect()
}

fn compile(wat: &str) -> Vec<Result<CompiledFunction>> {
    compile_with(wat, Settings::default(), None)
}

fn bailout_reason(result: &Result<CompiledFunction>) -> Option<String> {
    let err = result.as_ref().err()?;
    err.downcast_ref::<CodeGenError>()?
        .unsupported_reason()
        .map(str::to_string)
}

#[test]
fn compiles_supported_subset() {
    let results = compile(
        r#"
        (module
          (memory 1)
          (global $counter (mut i32) (i32.const 0))
          (func (param i32 i32) (result i32)
            (i32.add (local.get 0) (local.get 1)))
          (func (param f32 f32) (result f32)
            (f32.mul (f32.sub (local.get 0) (local.get 1)) (f32.const 2.5)))
          (func (param $ptr i32) (result i32)
            (local $sum i32)
            (block $done
              (loop $next
                (br_if $done (local.get $ptr))
                (local.set $sum
                  (i32.xor (local.get $sum) (i32.load8_u offset=3 (local.get $ptr))))
                (i32.store (local.get $ptr) (local.get $sum))
                (global.set $counter
                  (i32.and (global.get $counter) (i32.const 0xff)))
                (br $next)))
            (local.get $sum)))
        "#,
    );
    assert_eq!(results.len(), 3);
    for result in &results {
        assert!(result.is_ok(), "{:?}", result.as_ref().err());
    }
    assert_eq!(
        bailout_reason(&compile("(module (func (result i32) (i32.eqz (i32.const 0))))")[0])
            .as_deref(),
        Some("I32Eqz")
    );
}

#[test]
fn compiles_loops_and_branches() {
    let results = compile(
        r#"
        (module
          (memory 1)
          (func (param $ptr i32) (param $n i32) (result i32)
            (local $sum i32)
            (block $done
              (loop $next
                (br_if $done (local.get $n))
                (local.set $sum
                  (i32.or (local.get $sum) (i32.load16_s (local.get $ptr))))
                (local.set $n (i32.sub (local.get $n) (i32.const 1)))
                (br $next)))
            (local.get $sum)))
        "#,
    );
    let compiled = results[0].as_ref().unwrap();
    let insts = compiled.code.insts();
    assert!(insts.iter().any(|i| i.starts_with("movsx ") && i.contains("word ptr [")));
    assert!(
        insts
            .iter()
            .any(|i| i.starts_with("sub ") && !i.starts_with("sub rsp"))
    );
    // The stack check and the bounds check trap.
    assert_eq!(compiled.safepoints.entries().len(), 2);
    assert_eq!(compiled.source_positions.len(), 2);
    assert_eq!(compiled.frame_slot_count, 3 + 64);
    assert_eq!(compiled.safepoints.frame_slot_count(), compiled.frame_slot_count);
}

#[test]
fn stack_parameters_are_loaded_from_the_caller_frame() {
    let results = compile(
        r#"
        (module
          (func (param i32 i32 i32 i32 i32 i32 i32) (result i32)
            (i32.mul (local.get 5) (local.get 6))))
        "#,
    );
    let compiled = results[0].as_ref().unwrap();
    let insts = compiled.code.insts();
    assert!(insts.iter().any(|i| i.ends_with("dword ptr [rbp + 0x10]")));
    assert!(insts.iter().any(|i| i.ends_with("dword ptr [rbp + 0x18]")));
    assert!(insts.contains(&"ret 0x10".to_string()));
}

#[test]
fn reports_unsupported_constructs() {
    let results = compile(
        r#"
        (module
          (memory 1)
          (func $callee)
          (func (param i32) (result i32)
            (select (i32.const 1) (i32.const 2) (local.get 0)))
          (func (param i32)
            (if (local.get 0) (then (call $callee))))
          (func (param i64))
          (func (param f64))
          (func (result i32 i32) (i32.const 1) (i32.const 2))
          (func (result i32) (memory.grow (i32.const 1)))
          (func (result i64) (i64.const 1))
          (func (param i32) (result i32) (i32.div_s (local.get 0) (local.get 0)))
          (func (result f64) (f64.load (i32.const 0)))
          (func (block (result i32 i32) (i32.const 1) (i32.const 2)) drop drop)
          (func unreachable))
        "#,
    );
    let reasons: Vec<_> = results.iter().map(bailout_reason).collect();
    assert!(results[0].is_ok());
    assert_eq!(
        reasons[1..],
        [
            Some("select".to_string()),
            Some("if".to_string()),
            Some("i64 param/local".to_string()),
            Some("f64 param/local".to_string()),
            Some("multi-return".to_string()),
            Some("grow_memory".to_string()),
            Some("i64.const".to_string()),
            Some("I32DivS".to_string()),
            Some("non-i32 load".to_string()),
            Some("multi-value".to_string()),
            Some("unreachable".to_string()),
        ]
    );
}

#[test]
fn validation_errors_are_not_bailouts() {
    let wasm = wat::parse_str(
        r#"
        (module
          (func (result i32)
            (i32.add (i32.const 1) (f32.const 1))))
        "#,
    )
    .unwrap();
    let translation = translate_module(&wasm).unwrap();
    let func = translation.functions.into_iter().next().unwrap();
    let mut validator = func
        .validator
        .into_validator(FuncValidatorAllocations::default());
    let result = isa(Settings::default()).compile_function(
        &func.sig,
        &func.body,
        &translation.env,
        &mut validator,
        None,
    );
    let err = result.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<CodeGenError>(),
        Some(CodeGenError::Validation(_))
    ));
}

#[test]
fn abort_flag_bails_out() {
    let abort = AtomicBool::new(true);
    let results = compile_with(
        "(module (func (result i32) (i32.const 1)))",
        Settings::default(),
        Some(&abort),
    );
    assert_eq!(
        bailout_reason(&results[0]).as_deref(),
        Some("compilation aborted")
    );
}

#[test]
fn traps_without_runtime_exception_support() {
    let settings = Settings {
        runtime_exception_support: false,
        ..Settings::default()
    };
    let results = compile_with(
        r#"
        (module
          (memory 1)
          (func (param i32) (result i32) (i32.load (local.get 0))))
        "#,
        settings,
        None,
    );
    let compiled = results[0].as_ref().unwrap();
    let insts = compiled.code.insts();
    assert!(insts.contains(&"call trap_callback_for_testing".to_string()));
    assert!(!insts.iter().any(|i| i.starts_with("call Wasm")));
    assert!(!insts.iter().any(|i| i.starts_with("cmp rsp")));
    assert!(compiled.safepoints.entries().is_empty());
}

#[test]
fn explicit_bounds_checks_can_be_disabled() {
    let settings = Settings {
        bounds_checks: false,
        stack_checks: false,
        ..Settings::default()
    };
    let results = compile_with(
        r#"
        (module
          (memory 1)
          (func (param i32) (result i32) (i32.load (local.get 0))))
        "#,
        settings,
        None,
    );
    let compiled = results[0].as_ref().unwrap();
    assert!(!compiled.code.insts().iter().any(|i| i.starts_with("j")));
    assert!(compiled.safepoints.entries().is_empty());
}

#[test]
fn stack_check_slow_path_saves_live_parameters() {
    let results = compile("(module (func (param i32 f32)))");
    let compiled = results[0].as_ref().unwrap();
    let insts = compiled.code.insts();

    let check = insts
        .iter()
        .position(|i| i.starts_with("cmp rsp"))
        .unwrap();
    assert_eq!(insts[check], "cmp rsp, qword ptr [r14 + 0x18]");
    let entry = insts[check + 1]
        .strip_prefix("jbe 0x")
        .map(|target| usize::from_str_radix(target, 16).unwrap())
        .unwrap();
    // Execution resumes right after the inline check.
    let continuation = check + 2;

    assert_eq!(insts.len(), entry + 8);
    assert_eq!(
        insts[entry..entry + 7],
        [
            "push rsi",
            "sub rsp, 0x10",
            "movsd qword ptr [rsp], xmm0",
            "call WasmStackGuard",
            "movsd xmm0, qword ptr [rsp]",
            "add rsp, 0x10",
            "pop rsi",
        ]
    );
    assert_eq!(insts[entry + 7], format!("jmp {continuation:#x}"));

    let call = (entry + 3) as u32;
    assert_eq!(compiled.safepoints.entries().len(), 1);
    assert!(compiled.safepoints.find(call + 1).is_some());
    assert_eq!(compiled.source_positions.len(), 1);
    assert_eq!(compiled.source_positions[0].code_offset, call);
    assert_eq!(compiled.source_positions[0].position, 0);
}
