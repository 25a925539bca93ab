//! Disassembler seam (§4.6 "Disassembler loop"). Grounded on
//! `samply-api::asm`'s `yaxpeax_x86::amd64` decoder wiring, narrowed to the
//! handful of facts the replay loop actually needs per instruction.

use yaxpeax_arch::{Decoder, LengthedInstruction, U8Reader};
use yaxpeax_x86::amd64::{InstDecoder, Instruction, Opcode, Operand};

/// How one decoded instruction affects control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// Falls through to `pc + len`.
    None,
    /// Unconditional jump to a statically known target.
    DirectJump(u64),
    /// Conditional jump to a statically known target; consumes one TNT bit.
    DirectConditional(u64),
    /// Call to a statically known target.
    DirectCall(u64),
    /// `call`/`jmp` through a register or memory operand.
    Indirect { is_call: bool },
    Return,
    /// `iret`/`sysret`-style resumption via the next TIP.
    InterruptReturn,
}

#[derive(Debug, Clone, Copy)]
pub struct DecodedInsn {
    pub len: u64,
    pub transfer: Transfer,
}

pub trait Disassembler {
    /// Decodes one instruction at `pc`, whose bytes start at `code[0..]`.
    /// Returns `None` if `code` does not hold a recognizable instruction.
    fn decode(&self, code: &[u8], pc: u64) -> Option<DecodedInsn>;
}

/// amd64 backend built on `yaxpeax_x86`.
#[derive(Default)]
pub struct X86_64Disassembler {
    decoder: InstDecoder,
}

impl X86_64Disassembler {
    pub fn new() -> Self {
        X86_64Disassembler {
            decoder: InstDecoder::default(),
        }
    }
}

impl Disassembler for X86_64Disassembler {
    fn decode(&self, code: &[u8], pc: u64) -> Option<DecodedInsn> {
        let mut reader = U8Reader::new(code);
        let inst = self.decoder.decode(&mut reader).ok()?;
        let len = inst.len().to_const();
        let transfer = classify(&inst, pc, len);
        Some(DecodedInsn { len, transfer })
    }
}

/// Direct-branch targets are rel8/rel32 displacements; yaxpeax hands back
/// the already-resolved absolute address for `Operand::ImmediateI*` control
/// flow operands taken from `.relative_addr()` when available, falling
/// back to manual `pc + len + imm` arithmetic otherwise.
fn classify(inst: &Instruction, pc: u64, len: u64) -> Transfer {
    let opcode = inst.opcode();
    let is_direct = inst.operand_count() > 0 && !is_register_operand(&inst.operand(0))
        && direct_target(inst, pc, len).is_some();

    match opcode {
        Opcode::JMP => match direct_target(inst, pc, len) {
            Some(target) => Transfer::DirectJump(target),
            None => Transfer::Indirect { is_call: false },
        },
        Opcode::CALL => match direct_target(inst, pc, len) {
            Some(target) => Transfer::DirectCall(target),
            None => Transfer::Indirect { is_call: true },
        },
        Opcode::CALLF => Transfer::Indirect { is_call: true },
        Opcode::JMPF => Transfer::Indirect { is_call: false },
        Opcode::RETURN | Opcode::RETF => Transfer::Return,
        Opcode::IRET | Opcode::IRETD | Opcode::IRETQ => Transfer::InterruptReturn,
        Opcode::SYSCALL | Opcode::SYSENTER => Transfer::Indirect { is_call: true },
        Opcode::SYSRET | Opcode::SYSEXIT => Transfer::InterruptReturn,
        op if is_conditional_jump(op) => match direct_target(inst, pc, len) {
            Some(target) => Transfer::DirectConditional(target),
            None => Transfer::None,
        },
        _ => {
            let _ = is_direct;
            Transfer::None
        }
    }
}

fn is_conditional_jump(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::JO
            | Opcode::JNO
            | Opcode::JB
            | Opcode::JNB
            | Opcode::JZ
            | Opcode::JNZ
            | Opcode::JA
            | Opcode::JNA
            | Opcode::JS
            | Opcode::JNS
            | Opcode::JP
            | Opcode::JNP
            | Opcode::JL
            | Opcode::JGE
            | Opcode::JLE
            | Opcode::JG
            | Opcode::JRCXZ
            | Opcode::LOOP
            | Opcode::LOOPZ
            | Opcode::LOOPNZ
    )
}

fn direct_target(inst: &Instruction, pc: u64, len: u64) -> Option<u64> {
    if inst.operand_count() == 0 {
        return None;
    }
    let operand = inst.operand(0);
    if is_register_operand(&operand) || operand.is_memory() {
        return None;
    }
    let imm = immediate_i64(&operand)?;
    Some((pc as i64).wrapping_add(len as i64).wrapping_add(imm) as u64)
}

fn is_register_operand(operand: &Operand) -> bool {
    matches!(
        operand,
        Operand::Register { .. }
            | Operand::RegisterMaskMerge { .. }
            | Operand::RegisterMaskMergeSae { .. }
            | Operand::RegisterMaskMergeSaeNoround { .. }
    )
}

fn immediate_i64(operand: &Operand) -> Option<i64> {
    match *operand {
        Operand::ImmediateI8 { imm } => Some(imm as i64),
        Operand::ImmediateU8 { imm } => Some(imm as i64),
        Operand::ImmediateI16 { imm } => Some(imm as i64),
        Operand::ImmediateU16 { imm } => Some(imm as i64),
        Operand::ImmediateI32 { imm } => Some(imm as i64),
        Operand::ImmediateU32 { imm } => Some(imm as i64),
        Operand::ImmediateI64 { imm } => Some(imm),
        Operand::ImmediateU64 { imm } => Some(imm as i64),
        _ => None,
    }
}
