use super::{CodeGen, Loc, MAX_VALUE_STACK_HEIGHT, env::FuncEnv};
use crate::abi::ABISig;
use crate::buffer::FinalizedCode;
use crate::codegen::ModuleEnv;
use crate::isa::x64::{X64Masm, abi::X64ABI, regs};
use crate::masm::MacroAssembler;
use crate::settings::Settings;
use proptest::prelude::*;
use wasmparser::{BlockType, FuncType, MemArg, Operator, ValType};

use wasmparser::ValType::{F32, I32};

struct Harness {
    settings: Settings,
    env: ModuleEnv,
    masm: X64Masm,
}

impl Harness {
    fn new() -> Self {
        Self::with_env(ModuleEnv::new())
    }

    fn with_env(env: ModuleEnv) -> Self {
        Self {
            settings: Settings::default(),
            env,
            masm: X64Masm::new(),
        }
    }

    /// A code generator for a function with the given signature, past its
    /// prologue.
    fn codegen(&mut self, params: &[ValType], results: &[ValType]) -> CodeGen<'_, X64Masm> {
        let sig = FuncType::new(params.iter().copied(), results.iter().copied());
        let sig = ABISig::new::<X64ABI>(&sig);
        let mut codegen = CodeGen::new(
            &self.settings,
            &mut self.masm,
            regs::allocatable(),
            FuncEnv::new(&self.env),
            sig,
        );
        codegen.emit_prologue(params).unwrap();
        codegen
    }

    fn finish(self) -> FinalizedCode {
        self.masm.finalize().unwrap()
    }
}

fn visit(codegen: &mut CodeGen<'_, X64Masm>, ops: &[Operator<'_>]) {
    for (offset, op) in ops.iter().enumerate() {
        codegen.visit_op(op, offset + 1).unwrap();
    }
}

fn memarg(offset: u64) -> MemArg {
    MemArg {
        align: 2,
        max_align: 2,
        offset,
        memory: 0,
    }
}

#[test]
fn test_add_returns_in_rax() {
    let mut h = Harness::new();
    let mut codegen = h.codegen(&[I32, I32], &[I32]);
    visit(
        &mut codegen,
        &[
            Operator::LocalGet { local_index: 0 },
            Operator::LocalGet { local_index: 1 },
            Operator::I32Add,
        ],
    );
    assert_eq!(codegen.context.state.height(), 3);
    assert_eq!(codegen.context.operand_stack_height(), 1);
    assert!(codegen.context.state.slot(2).unwrap().is_reg());
    assert!(codegen.context.state.use_counts_consistent());

    visit(&mut codegen, &[Operator::End]);
    assert!(codegen.control_frames.is_empty());
    codegen.emit_end().unwrap();
    let emitted = codegen.finish().unwrap();
    assert_eq!(emitted.frame_slot_count, 2 + MAX_VALUE_STACK_HEIGHT as u32);

    let code = h.finish();
    let insts = code.insts();
    assert_eq!(
        &insts[..4],
        &["push rbp", "mov rbp, rsp", "sub rsp, 0x210", "mov r14, rdi"]
    );
    let leave = insts.iter().position(|i| i == "mov rsp, rbp").unwrap();
    // The last instruction of the body leaves the result in the return
    // register.
    assert_eq!(insts[leave - 1].split_whitespace().nth(1), Some("eax,"));
    assert_eq!(&insts[leave + 1..leave + 3], &["pop rbp", "ret"]);
}

#[test]
fn test_f32_result_is_moved_to_xmm0() {
    let mut h = Harness::new();
    let mut codegen = h.codegen(&[F32, F32], &[F32]);
    visit(
        &mut codegen,
        &[
            Operator::LocalGet { local_index: 0 },
            Operator::LocalGet { local_index: 1 },
            Operator::F32Add,
            Operator::End,
        ],
    );
    codegen.emit_end().unwrap();
    codegen.finish().unwrap();

    let code = h.finish();
    let insts = code.insts();
    let leave = insts.iter().position(|i| i == "mov rsp, rbp").unwrap();
    assert_eq!(
        &insts[leave - 3..leave],
        &["movaps xmm2, xmm0", "addss xmm2, xmm1", "movaps xmm0, xmm2"]
    );
}

#[test]
fn test_loop_header_is_bound_on_entry() {
    let mut h = Harness::new();
    let mut codegen = h.codegen(&[I32], &[]);
    visit(
        &mut codegen,
        &[Operator::Loop {
            blockty: BlockType::Empty,
        }],
    );
    let header = codegen.control_frames.last().unwrap().label;
    let header_offset = codegen.masm.current_code_offset();
    assert!(codegen.masm.is_bound(header));

    visit(
        &mut codegen,
        &[
            Operator::LocalGet { local_index: 0 },
            Operator::I32Const { value: 1 },
            Operator::I32Add,
            Operator::LocalSet { local_index: 0 },
        ],
    );
    // The local now lives in a register, but the back edge expects it on
    // the stack.
    assert!(codegen.context.state.slot(0).unwrap().is_reg());
    let target = &codegen.control_frames.last().unwrap().label_state;
    assert!(target.slots[..1].iter().all(|slot| slot.is_stack()));

    visit(
        &mut codegen,
        &[
            Operator::Br { relative_depth: 0 },
            Operator::End,
            Operator::End,
        ],
    );
    assert!(!codegen.context.reachable);
    codegen.emit_end().unwrap();
    codegen.finish().unwrap();

    let code = h.finish();
    assert_eq!(code.label_offset(header), Some(header_offset));
    let insts = code.insts();
    let back_edge = insts
        .iter()
        .position(|i| *i == format!("jmp {header_offset:#x}"))
        .unwrap();
    assert!(insts[back_edge - 1].starts_with("mov dword ptr [rbp - 0x8], "));
}

#[test]
fn test_block_result_paths_agree() {
    let mut h = Harness::new();
    let mut codegen = h.codegen(&[I32, I32], &[I32]);
    visit(
        &mut codegen,
        &[
            Operator::Block {
                blockty: BlockType::Type(I32),
            },
            Operator::LocalGet { local_index: 0 },
            Operator::LocalGet { local_index: 1 },
            Operator::BrIf { relative_depth: 0 },
            Operator::Drop,
            Operator::I32Const { value: 5 },
        ],
    );
    let target = codegen.control_frames.last().unwrap().label_state.split();
    visit(&mut codegen, &[Operator::End]);

    // The state after the block is the one defined by the branch.
    assert_eq!(codegen.context.state.height(), 3);
    assert_eq!(
        codegen.context.state.slot(2).unwrap(),
        target.slot(2).unwrap()
    );
    assert!(codegen.context.state.slot(2).unwrap().is_reg());
    assert!(codegen.context.state.use_counts_consistent());

    visit(&mut codegen, &[Operator::End]);
    codegen.emit_end().unwrap();
    codegen.finish().unwrap();
    h.finish();
}

#[test]
fn test_bailout_binds_every_label() {
    let mut h = Harness::with_env(ModuleEnv::new().with_memory(1, None));
    let mut codegen = h.codegen(&[I32], &[]);
    visit(
        &mut codegen,
        &[
            Operator::Block {
                blockty: BlockType::Empty,
            },
            Operator::Block {
                blockty: BlockType::Empty,
            },
            Operator::LocalGet { local_index: 0 },
            Operator::BrIf { relative_depth: 1 },
            Operator::LocalGet { local_index: 0 },
            Operator::I32Load { memarg: memarg(0) },
            Operator::Drop,
            Operator::I64Add,
        ],
    );
    assert_eq!(codegen.bailout(), Some("I64Add"));
    assert_eq!(codegen.control_frames.len(), 3);
    for frame in &codegen.control_frames {
        assert!(codegen.masm.is_bound(frame.label));
    }
    for ool in &codegen.out_of_line_code {
        assert!(codegen.masm.is_bound(ool.label));
    }

    // Nothing is compiled past the bailout.
    let offset = codegen.masm.current_code_offset();
    visit(&mut codegen, &[Operator::I32Const { value: 1 }, Operator::Drop]);
    assert_eq!(codegen.masm.current_code_offset(), offset);

    codegen.emit_end().unwrap();
    let err = codegen.finish().unwrap_err();
    assert_eq!(err.to_string(), "unsupported liftoff operation: I64Add");
    // No label is left referenced but unbound.
    h.finish();
}

#[test]
fn test_first_bailout_reason_wins() {
    let mut h = Harness::new();
    let mut codegen = h.codegen(&[], &[]);
    codegen.unsupported("select").unwrap();
    codegen.unsupported("call").unwrap();
    assert_eq!(codegen.bailout(), Some("select"));
}

#[test]
fn test_static_out_of_bounds_access_traps() {
    let mut h = Harness::with_env(ModuleEnv::new().with_memory(1, Some(1)));
    let mut codegen = h.codegen(&[I32], &[I32]);
    visit(
        &mut codegen,
        &[
            Operator::LocalGet { local_index: 0 },
            Operator::I32Load {
                memarg: memarg(65536),
            },
            Operator::End,
        ],
    );
    assert!(codegen.bailout().is_none());
    assert_eq!(codegen.out_of_line_code.len(), 2);
    codegen.emit_end().unwrap();
    let emitted = codegen.finish().unwrap();
    assert_eq!(emitted.safepoints.entries().len(), 2);
    assert!(
        emitted
            .source_positions
            .iter()
            .any(|position| position.position == 2 && !position.is_statement)
    );

    let code = h.finish();
    let insts = code.insts();
    // No memory size load, no comparison.
    assert!(!insts.iter().any(|i| i.contains("[r14 + 0x8]")));
    assert!(!insts.iter().any(|i| i.starts_with("jae")));
    assert!(insts.iter().any(|i| i.starts_with("jmp ")));
    assert!(insts.contains(&"call ThrowWasmTrapMemOutOfBounds".to_string()));
    assert_eq!(insts.last().map(String::as_str), Some("ud2"));
}

#[test]
fn test_dynamic_bounds_checks() {
    // The access may exceed the smallest memory: both checks.
    let mut h = Harness::with_env(ModuleEnv::new().with_memory(0, None));
    let mut codegen = h.codegen(&[I32], &[I32]);
    visit(
        &mut codegen,
        &[
            Operator::LocalGet { local_index: 0 },
            Operator::I32Load { memarg: memarg(0) },
            Operator::End,
        ],
    );
    codegen.emit_end().unwrap();
    codegen.finish().unwrap();
    let code = h.finish();
    let checks = code.insts().iter().filter(|i| i.starts_with("jae")).count();
    assert_eq!(checks, 2);
    assert!(code.insts().iter().any(|i| i.contains("qword ptr [r14 + 0x8]")));

    // The end offset is always within the smallest memory: index check only.
    let mut h = Harness::with_env(ModuleEnv::new().with_memory(1, Some(1)));
    let mut codegen = h.codegen(&[I32], &[I32]);
    visit(
        &mut codegen,
        &[
            Operator::LocalGet { local_index: 0 },
            Operator::I32Load { memarg: memarg(16) },
            Operator::End,
        ],
    );
    codegen.emit_end().unwrap();
    codegen.finish().unwrap();
    let code = h.finish();
    let checks = code.insts().iter().filter(|i| i.starts_with("jae")).count();
    assert_eq!(checks, 1);
    assert!(code.insts().iter().any(|i| i.ends_with(" + 0x10]")));
}

#[test]
fn test_store_pushes_nothing() {
    let mut h = Harness::with_env(ModuleEnv::new().with_memory(1, None));
    let mut codegen = h.codegen(&[I32], &[]);
    visit(
        &mut codegen,
        &[
            Operator::LocalGet { local_index: 0 },
            Operator::I32Const { value: 7 },
            Operator::I32Store8 { memarg: memarg(4) },
        ],
    );
    assert_eq!(codegen.context.operand_stack_height(), 0);
    assert!(codegen.context.state.use_counts_consistent());
    visit(&mut codegen, &[Operator::End]);
    codegen.emit_end().unwrap();
    codegen.finish().unwrap();
    let code = h.finish();
    assert!(
        code.insts()
            .iter()
            .any(|i| i.starts_with("mov byte ptr [") && i.contains(" + 0x4], "))
    );
}

#[test]
fn test_memory_access_settings() {
    let mut h = Harness::with_env(ModuleEnv::new().with_memory(1, None));
    h.settings.use_trap_handler = false;
    let mut codegen = h.codegen(&[I32], &[I32]);
    visit(
        &mut codegen,
        &[
            Operator::LocalGet { local_index: 0 },
            Operator::I32Load { memarg: memarg(0) },
        ],
    );
    assert_eq!(codegen.bailout(), Some("non-traphandler"));

    let mut h = Harness::with_env(ModuleEnv::new().with_memory(1, None));
    h.settings.bounds_checks = false;
    let mut codegen = h.codegen(&[I32], &[I32]);
    visit(
        &mut codegen,
        &[
            Operator::LocalGet { local_index: 0 },
            Operator::I32Load16U { memarg: memarg(0) },
        ],
    );
    assert!(codegen.bailout().is_none());
    // Only the stack check.
    assert_eq!(codegen.out_of_line_code.len(), 1);
}

#[test]
fn test_globals() {
    let env = ModuleEnv::new()
        .with_global(I32, true)
        .with_global(F32, true);
    let mut h = Harness::with_env(env);
    let mut codegen = h.codegen(&[], &[]);
    visit(
        &mut codegen,
        &[
            Operator::GlobalGet { global_index: 0 },
            Operator::GlobalSet { global_index: 0 },
        ],
    );
    assert!(codegen.bailout().is_none());
    assert_eq!(codegen.context.operand_stack_height(), 0);
    visit(&mut codegen, &[Operator::GlobalGet { global_index: 1 }]);
    assert_eq!(codegen.bailout(), Some("non-int global"));
}

#[test]
fn test_stack_height_limit() {
    let mut h = Harness::new();
    let mut codegen = h.codegen(&[], &[]);
    for value in 0..MAX_VALUE_STACK_HEIGHT as i32 {
        codegen
            .visit_op(&Operator::I32Const { value }, 1)
            .unwrap();
    }
    assert!(codegen.bailout().is_none());
    codegen
        .visit_op(&Operator::I32Const { value: 0 }, 1)
        .unwrap();
    assert_eq!(codegen.bailout(), Some("value stack grows too large"));
}

#[test]
fn test_control_in_unreachable_code() {
    let mut h = Harness::new();
    let mut codegen = h.codegen(&[], &[]);
    visit(
        &mut codegen,
        &[
            Operator::Block {
                blockty: BlockType::Empty,
            },
            Operator::Br { relative_depth: 0 },
            Operator::If {
                blockty: BlockType::Empty,
            },
            Operator::I64Add,
            Operator::Else,
            Operator::End,
            Operator::End,
        ],
    );
    assert!(codegen.bailout().is_none());
    assert!(codegen.context.reachable);
    assert_eq!(codegen.control_frames.len(), 1);

    visit(
        &mut codegen,
        &[Operator::If {
            blockty: BlockType::Empty,
        }],
    );
    assert_eq!(codegen.bailout(), Some("if"));
}

#[test]
fn test_non_i32_locals_bail_out() {
    let mut h = Harness::new();
    let codegen = h.codegen(&[I32, ValType::I64], &[]);
    assert_eq!(codegen.bailout(), Some("i64 param/local"));

    let mut h = Harness::new();
    let codegen = h.codegen(&[I32], &[I32, I32]);
    assert_eq!(codegen.bailout(), Some("multi-return"));
}

#[test]
fn test_declared_f32_locals_share_a_zero_register() {
    let mut h = Harness::new();
    let sig = FuncType::new([I32], []);
    let sig = ABISig::new::<X64ABI>(&sig);
    let mut codegen = CodeGen::new(
        &h.settings,
        &mut h.masm,
        regs::allocatable(),
        FuncEnv::new(&h.env),
        sig,
    );
    codegen.emit_prologue(&[I32, F32, F32, I32]).unwrap();
    assert!(codegen.bailout().is_none());
    let state = &codegen.context.state;
    let zero = state.slot(1).unwrap().get_reg().unwrap();
    assert_eq!(state.slot(2).unwrap().get_reg(), Some(zero));
    assert_eq!(state.regs.use_count(zero), 2);
    assert_eq!(state.slot(3).unwrap().loc, Loc::I32Const(0));
}

proptest! {
    #[test]
    fn i32_constants_stay_inline(value in any::<i32>()) {
        let mut h = Harness::new();
        let mut codegen = h.codegen(&[], &[]);
        let offset = codegen.masm.current_code_offset();
        codegen.visit_op(&Operator::I32Const { value }, 1).unwrap();
        prop_assert_eq!(codegen.context.state.slot(0).unwrap().loc, Loc::I32Const(value));
        prop_assert_eq!(codegen.masm.current_code_offset(), offset);
    }
}
