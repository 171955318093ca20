use super::{
    abi::X64ABI,
    address::Address,
    asm::{AluOp, Assembler, XmmOp},
    regs::{self, rbp, rsp},
};
use crate::abi::{ABI, ptr_size};
use crate::buffer::{FinalizedCode, MachLabel};
use crate::codegen::STACK_SLOT_SIZE;
use crate::isa::reg::{Reg, RegClass};
use crate::masm::{
    Builtin, ExtendKind, Imm, IntCmpKind, MacroAssembler as Masm, OperandSize, RegImm,
};
use crate::regset::RegList;
use anyhow::Result;

/// Bytes reserved on the machine stack for a saved xmm register.
const XMM_SAVE_BYTES: i32 = 16;

/// x64 MacroAssembler.
#[derive(Default)]
pub(crate) struct MacroAssembler {
    /// Low level assembler.
    asm: Assembler,
}

impl MacroAssembler {
    /// Create an x64 MacroAssembler.
    pub fn new() -> Self {
        Self {
            asm: Assembler::new(),
        }
    }

    /// Emit `dst = lhs op rhs` with a two-address instruction.
    fn alu_op(&mut self, op: AluOp, dst: Reg, lhs: Reg, rhs: Reg, size: OperandSize) {
        let commutative = !matches!(op, AluOp::Sub);
        if dst == lhs {
            self.asm.alu_rr(op, rhs, dst, size);
        } else if dst == rhs && commutative {
            self.asm.alu_rr(op, lhs, dst, size);
        } else if dst == rhs {
            let scratch = regs::scratch();
            self.asm.mov_rr(rhs, scratch, size);
            self.asm.mov_rr(lhs, dst, size);
            self.asm.alu_rr(op, scratch, dst, size);
        } else {
            self.asm.mov_rr(lhs, dst, size);
            self.asm.alu_rr(op, rhs, dst, size);
        }
    }

    /// Emit `dst = lhs op rhs` for scalar floats.
    fn xmm_op(&mut self, op: XmmOp, dst: Reg, lhs: Reg, rhs: Reg) {
        let commutative = !matches!(op, XmmOp::Subss);
        if dst == lhs {
            self.asm.xmm_alu_rr(op, rhs, dst);
        } else if dst == rhs && commutative {
            self.asm.xmm_alu_rr(op, lhs, dst);
        } else if dst == rhs {
            let scratch = regs::float_scratch();
            self.asm.xmm_mov_rr(rhs, scratch);
            self.asm.xmm_mov_rr(lhs, dst);
            self.asm.xmm_alu_rr(op, scratch, dst);
        } else {
            self.asm.xmm_mov_rr(lhs, dst);
            self.asm.xmm_alu_rr(op, rhs, dst);
        }
    }
}

impl Masm for MacroAssembler {
    type Address = Address;
    type ABI = X64ABI;

    fn prologue(&mut self) {
        let frame_pointer = rbp();
        let stack_pointer = rsp();

        self.asm.push_r(frame_pointer);
        self.asm
            .mov_rr(stack_pointer, frame_pointer, OperandSize::S64);
    }

    fn reserve_stack(&mut self, bytes: u32) {
        if bytes == 0 {
            return;
        }
        self.asm
            .alu_ir(AluOp::Sub, bytes as i32, rsp(), OperandSize::S64);
    }

    fn leave_frame(&mut self) {
        self.asm.mov_rr(rbp(), rsp(), OperandSize::S64);
        self.asm.pop_r(rbp());
    }

    fn ret(&mut self, stack_arg_bytes: u32) {
        self.asm.ret(stack_arg_bytes);
    }

    fn slot_address(&self, slot: u32) -> Address {
        let offset = (slot + 1) * STACK_SLOT_SIZE;
        Address::offset(rbp(), -(offset as i32))
    }

    fn caller_arg_address(&self, offset: u32) -> Address {
        // Skip the saved frame pointer and the return address.
        let base = 2 * u32::from(<Self::ABI as ABI>::word_bytes());
        Address::offset(rbp(), (base + offset) as i32)
    }

    fn address_at_vmctx(&self, offset: u32) -> Address {
        Address::offset(<Self::ABI as ABI>::vmctx_reg(), offset as i32)
    }

    fn address_at_reg(&self, base: Reg, offset: u32) -> Address {
        Address::offset(base, offset as i32)
    }

    fn address_indexed(&self, base: Reg, index: Reg, offset: u32) -> Address {
        Address::indexed(base, index, offset)
    }

    fn store(&mut self, src: RegImm, dst: Address, size: OperandSize) {
        match src {
            RegImm::Reg(reg) if reg.is_float() => self.asm.xmm_mov_rm(reg, dst, size),
            RegImm::Reg(reg) => self.asm.mov_rm(reg, dst, size),
            RegImm::Imm(Imm::I32(value)) => self.asm.mov_im(value, dst, size),
            RegImm::Imm(Imm::F32(bits)) => self.asm.mov_im(bits as i32, dst, size),
        }
    }

    fn load(&mut self, src: Address, dst: Reg, size: OperandSize) {
        if dst.is_float() {
            self.asm.xmm_mov_mr(src, dst, size);
        } else {
            self.asm.mov_mr(src, dst, size);
        }
    }

    fn load_extend(&mut self, src: Address, dst: Reg, kind: ExtendKind) {
        self.asm.movx_mr(src, dst, kind);
    }

    fn load_ptr(&mut self, src: Address, dst: Reg) {
        self.load(src, dst, ptr_size::<Self::ABI>());
    }

    fn mov(&mut self, src: RegImm, dst: Reg, size: OperandSize) {
        match (src, dst.class()) {
            (RegImm::Reg(src), _) if src == dst => {}
            (RegImm::Reg(src), RegClass::Float) if src.is_float() => {
                self.asm.xmm_mov_rr(src, dst)
            }
            (RegImm::Reg(src), _) if src.is_float() || dst.is_float() => {
                self.asm.movd(src, dst, size)
            }
            (RegImm::Reg(src), _) => self.asm.mov_rr(src, dst, size),
            (RegImm::Imm(Imm::F32(0)), RegClass::Float) => self.asm.xmm_zero(dst),
            (RegImm::Imm(imm), RegClass::Float) => {
                let bits = match imm {
                    Imm::I32(value) => value,
                    Imm::F32(bits) => bits as i32,
                };
                let scratch = regs::scratch();
                self.asm.mov_ir(bits, scratch, OperandSize::S32);
                self.asm.movd(scratch, dst, OperandSize::S32);
            }
            (RegImm::Imm(Imm::I32(value)), _) => self.asm.mov_ir(value, dst, size),
            (RegImm::Imm(Imm::F32(bits)), _) => self.asm.mov_ir(bits as i32, dst, size),
        }
    }

    fn move_slot(&mut self, src: u32, dst: u32, size: OperandSize) {
        let scratch = regs::scratch();
        self.asm.mov_mr(self.slot_address(src), scratch, size);
        self.asm.mov_rm(scratch, self.slot_address(dst), size);
    }

    fn add(&mut self, dst: Reg, lhs: Reg, rhs: Reg, size: OperandSize) -> Result<()> {
        self.alu_op(AluOp::Add, dst, lhs, rhs, size);
        Ok(())
    }

    fn sub(&mut self, dst: Reg, lhs: Reg, rhs: Reg, size: OperandSize) -> Result<()> {
        self.alu_op(AluOp::Sub, dst, lhs, rhs, size);
        Ok(())
    }

    fn mul(&mut self, dst: Reg, lhs: Reg, rhs: Reg, size: OperandSize) -> Result<()> {
        self.alu_op(AluOp::Imul, dst, lhs, rhs, size);
        Ok(())
    }

    fn and(&mut self, dst: Reg, lhs: Reg, rhs: Reg, size: OperandSize) -> Result<()> {
        self.alu_op(AluOp::And, dst, lhs, rhs, size);
        Ok(())
    }

    fn or(&mut self, dst: Reg, lhs: Reg, rhs: Reg, size: OperandSize) -> Result<()> {
        self.alu_op(AluOp::Or, dst, lhs, rhs, size);
        Ok(())
    }

    fn xor(&mut self, dst: Reg, lhs: Reg, rhs: Reg, size: OperandSize) -> Result<()> {
        self.alu_op(AluOp::Xor, dst, lhs, rhs, size);
        Ok(())
    }

    fn float_add(&mut self, dst: Reg, lhs: Reg, rhs: Reg, _size: OperandSize) -> Result<()> {
        self.xmm_op(XmmOp::Addss, dst, lhs, rhs);
        Ok(())
    }

    fn float_sub(&mut self, dst: Reg, lhs: Reg, rhs: Reg, _size: OperandSize) -> Result<()> {
        self.xmm_op(XmmOp::Subss, dst, lhs, rhs);
        Ok(())
    }

    fn float_mul(&mut self, dst: Reg, lhs: Reg, rhs: Reg, _size: OperandSize) -> Result<()> {
        self.xmm_op(XmmOp::Mulss, dst, lhs, rhs);
        Ok(())
    }

    fn cmp(&mut self, lhs: Reg, rhs: Reg, size: OperandSize) {
        // `cmp a, b` sets the flags of `a - b`.
        self.asm.alu_rr(AluOp::Cmp, rhs, lhs, size);
    }

    fn test(&mut self, reg: Reg, size: OperandSize) {
        self.asm.test_rr(reg, size);
    }

    fn jmp_if(&mut self, kind: IntCmpKind, target: MachLabel) {
        self.asm.jmp_if(kind, target);
    }

    fn jmp(&mut self, target: MachLabel) {
        self.asm.jmp(target);
    }

    fn get_label(&mut self) -> MachLabel {
        self.asm.buffer_mut().get_label()
    }

    fn bind(&mut self, label: MachLabel) -> Result<()> {
        self.asm.buffer_mut().bind_label(label)
    }

    fn is_bound(&self, label: MachLabel) -> bool {
        self.asm.buffer().is_bound(label)
    }

    fn stack_check(&mut self, limit_offset: u32, target: MachLabel) {
        let limit = self.address_at_vmctx(limit_offset);
        self.asm.cmp_rm(rsp(), limit, OperandSize::S64);
        self.asm.jmp_if(IntCmpKind::LeU, target);
    }

    fn push_regs(&mut self, regs: RegList) {
        for reg in regs.iter() {
            if reg.is_float() {
                self.asm
                    .alu_ir(AluOp::Sub, XMM_SAVE_BYTES, rsp(), OperandSize::S64);
                self.asm
                    .xmm_mov_rm(reg, Address::offset(rsp(), 0), OperandSize::S64);
            } else {
                self.asm.push_r(reg);
            }
        }
    }

    fn pop_regs(&mut self, regs: RegList) {
        let saved: Vec<Reg> = regs.iter().collect();
        for reg in saved.into_iter().rev() {
            if reg.is_float() {
                self.asm
                    .xmm_mov_mr(Address::offset(rsp(), 0), reg, OperandSize::S64);
                self.asm
                    .alu_ir(AluOp::Add, XMM_SAVE_BYTES, rsp(), OperandSize::S64);
            } else {
                self.asm.pop_r(reg);
            }
        }
    }

    fn call_builtin(&mut self, builtin: Builtin) {
        self.asm.call_builtin(builtin);
    }

    fn call_trap_callback_for_testing(&mut self) {
        self.asm.call_trap_callback();
    }

    fn unreachable(&mut self) {
        self.asm.ud2();
    }

    fn scratch_for(&self, reg: Reg) -> Reg {
        match reg.class() {
            RegClass::Int => <Self::ABI as ABI>::scratch_reg(),
            _ => <Self::ABI as ABI>::float_scratch_reg(),
        }
    }

    fn current_code_offset(&self) -> u32 {
        self.asm.buffer().cur_offset()
    }

    fn finalize(self) -> Result<FinalizedCode> {
        self.asm.finalize()
    }
}
