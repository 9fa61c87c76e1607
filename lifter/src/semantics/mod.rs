//! Backend independent meaning of every VM opcode.

pub mod machine;

use std::fmt;

use iced_x86::Register;

use crate::{
    error::{Error, Result},
    handler::{Handler, VOpcode},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    Bit,
    Dword,
    Qword,
}

impl Width {
    pub fn bits(self) -> u32 {
        match self {
            Width::Bit => 1,
            Width::Dword => 32,
            Width::Qword => 64,
        }
    }

    pub fn bytes(self) -> u64 {
        match self {
            Width::Bit => 1,
            Width::Dword => 4,
            Width::Qword => 8,
        }
    }

    pub fn mask(self) -> u64 {
        match self {
            Width::Qword => u64::MAX,
            _ => (1u64 << self.bits()) - 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Or,
    And,
    Xor,
}

impl BinOp {
    pub fn apply(self, width: Width, lhs: u64, rhs: u64) -> u64 {
        let result = match self {
            BinOp::Add => lhs.wrapping_add(rhs),
            BinOp::Sub => lhs.wrapping_sub(rhs),
            BinOp::Or => lhs | rhs,
            BinOp::And => lhs & rhs,
            BinOp::Xor => lhs ^ rhs,
        };
        result & width.mask()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SavedReg {
    Gpr(Register),
    Flags,
}

impl fmt::Display for SavedReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SavedReg::Gpr(reg) => write!(f, "{}", format!("{:?}", reg).to_lowercase()),
            SavedReg::Flags => write!(f, "rflags"),
        }
    }
}

/// Push order of the native context at routine entry. The exit epilogue pops
/// in exactly the reverse order.
pub const SAVE_ORDER: [SavedReg; 17] = [
    SavedReg::Gpr(Register::R15),
    SavedReg::Gpr(Register::R14),
    SavedReg::Gpr(Register::R13),
    SavedReg::Gpr(Register::R12),
    SavedReg::Gpr(Register::R11),
    SavedReg::Gpr(Register::R10),
    SavedReg::Gpr(Register::R9),
    SavedReg::Gpr(Register::R8),
    SavedReg::Gpr(Register::RSP),
    SavedReg::Gpr(Register::RBP),
    SavedReg::Gpr(Register::RDI),
    SavedReg::Gpr(Register::RSI),
    SavedReg::Gpr(Register::RDX),
    SavedReg::Gpr(Register::RCX),
    SavedReg::Gpr(Register::RBX),
    SavedReg::Gpr(Register::RAX),
    SavedReg::Flags,
];

pub const RETURN_REGISTER: Register = Register::RAX;

pub fn restore_order() -> impl Iterator<Item = SavedReg> {
    SAVE_ORDER.iter().rev().copied()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackEffect {
    pub pops: &'static [Width],
    pub pushes: &'static [Width],
}

impl StackEffect {
    const fn new(pops: &'static [Width], pushes: &'static [Width]) -> Self {
        Self { pops, pushes }
    }

    pub fn consumed(&self) -> u64 {
        self.pops.iter().map(|w| w.bytes()).sum()
    }

    pub fn produced(&self) -> u64 {
        self.pushes.iter().map(|w| w.bytes()).sum()
    }

    /// Change of stack depth in bytes; positive means the stack grew.
    pub fn delta(&self) -> i64 {
        self.produced() as i64 - self.consumed() as i64
    }
}

const CONTEXT: &[Width] = &[Width::Qword; 17];

/// Stack discipline of `opcode`. `POP_VSP` replaces the stack pointer, so the
/// listed effect only covers the value it consumes.
pub fn effect(opcode: VOpcode) -> Option<StackEffect> {
    use Width::{Dword as D, Qword as Q};

    let effect = match opcode {
        VOpcode::Unknown => return None,
        VOpcode::VmInit => StackEffect::new(&[], CONTEXT),
        VOpcode::VmExit => StackEffect::new(CONTEXT, &[]),
        VOpcode::PopVr64 | VOpcode::PopVsp => StackEffect::new(&[Q], &[]),
        VOpcode::PopVr32 => StackEffect::new(&[D], &[]),
        VOpcode::PushVr64 | VOpcode::PushVsp | VOpcode::Push64 => StackEffect::new(&[], &[Q]),
        VOpcode::PushVr32 | VOpcode::Push32 => StackEffect::new(&[], &[D]),
        VOpcode::Sub64 | VOpcode::Add64 => StackEffect::new(&[Q, Q], &[Q, Q]),
        VOpcode::Sub32 | VOpcode::Add32 | VOpcode::Or32 | VOpcode::And32 | VOpcode::Xor32 => {
            StackEffect::new(&[D, D], &[D, Q])
        }
        VOpcode::Write32 => StackEffect::new(&[Q, D], &[]),
        VOpcode::Load32 => StackEffect::new(&[Q], &[D]),
        VOpcode::Load64 => StackEffect::new(&[Q], &[Q]),
        VOpcode::Jnz => StackEffect::new(&[Q], &[]),
    };

    Some(effect)
}

pub fn arithmetic(opcode: VOpcode) -> Option<(BinOp, Width)> {
    let pair = match opcode {
        VOpcode::Sub64 => (BinOp::Sub, Width::Qword),
        VOpcode::Sub32 => (BinOp::Sub, Width::Dword),
        VOpcode::Add64 => (BinOp::Add, Width::Qword),
        VOpcode::Add32 => (BinOp::Add, Width::Dword),
        VOpcode::Or32 => (BinOp::Or, Width::Dword),
        VOpcode::And32 => (BinOp::And, Width::Dword),
        VOpcode::Xor32 => (BinOp::Xor, Width::Dword),
        _ => return None,
    };
    Some(pair)
}

pub fn sign_extend(width: Width, value: u64) -> u64 {
    match width {
        Width::Bit => {
            if value & 1 != 0 {
                u64::MAX
            } else {
                0
            }
        }
        Width::Dword => value as u32 as i32 as i64 as u64,
        Width::Qword => value,
    }
}

/// The flag word pushed after arithmetic: all ones when the result was zero,
/// zero otherwise. `JNZ` branches when this word is non-zero.
pub fn zero_flag_word(width: Width, result: u64) -> u64 {
    let is_zero = (sign_extend(width, result) == 0) as u64;
    sign_extend(Width::Bit, is_zero)
}

pub trait StackMachine {
    type Value: Copy;

    fn vreg_count(&self) -> usize;

    fn constant(&mut self, width: Width, value: u64) -> Self::Value;

    fn push(&mut self, width: Width, value: Self::Value);

    fn pop(&mut self, width: Width) -> Self::Value;

    fn read_vreg(&mut self, width: Width, index: usize) -> Self::Value;

    fn write_vreg(&mut self, width: Width, index: usize, value: Self::Value);

    /// Current virtual stack pointer as a 64-bit integer.
    fn read_vsp(&mut self) -> Self::Value;

    fn write_vsp(&mut self, value: Self::Value);

    fn read_register(&mut self, reg: SavedReg) -> Self::Value;

    fn write_register(&mut self, reg: SavedReg, value: Self::Value);

    fn binary(&mut self, op: BinOp, width: Width, lhs: Self::Value, rhs: Self::Value)
        -> Self::Value;

    fn sign_extend(&mut self, from: Width, value: Self::Value) -> Self::Value;

    fn is_zero(&mut self, width: Width, value: Self::Value) -> Self::Value;

    fn is_nonzero(&mut self, width: Width, value: Self::Value) -> Self::Value;

    fn load(&mut self, width: Width, address: Self::Value) -> Self::Value;

    fn store(&mut self, width: Width, address: Self::Value, value: Self::Value);

    fn save_context(&mut self) {
        for reg in SAVE_ORDER {
            let value = self.read_register(reg);
            self.push(Width::Qword, value);
        }
    }

    fn restore_context(&mut self) {
        for reg in restore_order() {
            let value = self.pop(Width::Qword);
            self.write_register(reg, value);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow<V> {
    Next,
    Branch { condition: V, target: u64 },
    Exit,
}

pub fn zero_flag<M: StackMachine>(m: &mut M, width: Width, result: M::Value) -> M::Value {
    let wide = match width {
        Width::Qword => result,
        _ => m.sign_extend(width, result),
    };
    let is_zero = m.is_zero(Width::Qword, wide);
    m.sign_extend(Width::Bit, is_zero)
}

fn vreg_index<M: StackMachine>(m: &M, handler: &Handler, position: usize) -> Result<usize> {
    if handler.data >= m.vreg_count() as u64 {
        return Err(Error::VirtualRegisterOutOfRange {
            index: handler.data,
            position,
        });
    }
    Ok(handler.data as usize)
}

pub fn lower_effect<M: StackMachine>(
    m: &mut M,
    handler: &Handler,
    position: usize,
) -> Result<Flow<M::Value>> {
    use Width::{Dword, Qword};

    if let Some((op, width)) = arithmetic(handler.opcode) {
        let first = m.pop(width);
        let second = m.pop(width);
        let result = m.binary(op, width, second, first);
        m.push(width, result);
        let flag = zero_flag(m, width, result);
        m.push(Qword, flag);
        return Ok(Flow::Next);
    }

    match handler.opcode {
        VOpcode::Unknown => {
            return Err(Error::UnknownOpcode {
                address: handler.address,
                position,
            })
        }
        VOpcode::VmInit => m.save_context(),
        VOpcode::VmExit => {
            m.restore_context();
            return Ok(Flow::Exit);
        }
        VOpcode::PopVr64 | VOpcode::PopVr32 => {
            let width = if handler.opcode == VOpcode::PopVr64 { Qword } else { Dword };
            let index = vreg_index(m, handler, position)?;
            let value = m.pop(width);
            m.write_vreg(width, index, value);
        }
        VOpcode::PushVr64 | VOpcode::PushVr32 => {
            let width = if handler.opcode == VOpcode::PushVr64 { Qword } else { Dword };
            let index = vreg_index(m, handler, position)?;
            let value = m.read_vreg(width, index);
            m.push(width, value);
        }
        VOpcode::PushVsp => {
            let vsp = m.read_vsp();
            m.push(Qword, vsp);
        }
        VOpcode::PopVsp => {
            let vsp = m.pop(Qword);
            m.write_vsp(vsp);
        }
        VOpcode::Push64 => {
            let value = m.constant(Qword, handler.data);
            m.push(Qword, value);
        }
        VOpcode::Push32 => {
            let value = m.constant(Dword, handler.data & Dword.mask());
            m.push(Dword, value);
        }
        VOpcode::Sub64
        | VOpcode::Sub32
        | VOpcode::Add64
        | VOpcode::Add32
        | VOpcode::Or32
        | VOpcode::And32
        | VOpcode::Xor32 => {
            // Lowered above.
        }
        VOpcode::Write32 => {
            let address = m.pop(Qword);
            let value = m.pop(Dword);
            m.store(Dword, address, value);
        }
        VOpcode::Load32 | VOpcode::Load64 => {
            let width = if handler.opcode == VOpcode::Load64 { Qword } else { Dword };
            let address = m.pop(Qword);
            let value = m.load(width, address);
            m.push(width, value);
        }
        VOpcode::Jnz => {
            let flag = m.pop(Qword);
            let condition = m.is_nonzero(Qword, flag);
            return Ok(Flow::Branch {
                condition,
                target: handler.data,
            });
        }
    }

    Ok(Flow::Next)
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn test_zero_flag_word() {
        assert_eq!(zero_flag_word(Width::Qword, 0), u64::MAX);
        assert_eq!(zero_flag_word(Width::Qword, 8), 0);
        assert_eq!(zero_flag_word(Width::Dword, 0), u64::MAX);
        assert_eq!(zero_flag_word(Width::Dword, 0x8000_0000), 0);
    }

    #[test]
    fn test_restore_mirrors_save() {
        let mut restored = restore_order().collect::<Vec<_>>();
        restored.reverse();
        assert_eq!(restored, SAVE_ORDER.to_vec());
        assert_eq!(restore_order().next(), Some(SavedReg::Flags));
    }

    #[test]
    fn test_save_order_covers_all_gprs() {
        let gprs = SAVE_ORDER
            .iter()
            .filter_map(|reg| match reg {
                SavedReg::Gpr(reg) => Some(*reg),
                SavedReg::Flags => None,
            })
            .collect::<std::collections::HashSet<_>>();

        assert_eq!(gprs.len(), 16);
        assert!(gprs.iter().all(|reg| reg.is_gpr64()));
    }

    #[test]
    fn test_arithmetic_is_balanced() {
        for opcode in VOpcode::iter() {
            if let Some((_, width)) = arithmetic(opcode) {
                let effect = effect(opcode).unwrap();
                assert_eq!(effect.consumed(), 2 * width.bytes());
                assert_eq!(effect.produced(), width.bytes() + 8);
            }
        }
        assert_eq!(effect(VOpcode::Add64).unwrap().delta(), 0);
        assert_eq!(effect(VOpcode::Xor32).unwrap().delta(), 4);
    }

    #[test]
    fn test_arithmetic_lowers_result_and_flag() {
        for opcode in VOpcode::iter() {
            let Some((op, width)) = arithmetic(opcode) else {
                continue;
            };

            let mut m = machine::Machine::new(64, 32);
            m.push(width, 12);
            m.push(width, 12);

            let handler = Handler {
                opcode,
                ..Default::default()
            };
            let flow = lower_effect(&mut m, &handler, 1).unwrap();

            assert_eq!(flow, Flow::Next, "{}", opcode);
            assert_eq!(m.depth(), (width.bytes() + 8) as i64, "{}", opcode);
            assert_eq!(m.peek(width, 8), op.apply(width, 12, 12), "{}", opcode);
            assert_eq!(
                m.peek(Width::Qword, 0),
                zero_flag_word(width, op.apply(width, 12, 12)),
                "{}",
                opcode
            );
        }
    }

    #[test]
    fn test_context_effect() {
        assert_eq!(effect(VOpcode::VmInit).unwrap().delta(), 17 * 8);
        assert_eq!(effect(VOpcode::VmExit).unwrap().delta(), -17 * 8);
        assert!(effect(VOpcode::Unknown).is_none());
    }

    #[test]
    fn test_binop_truncates() {
        assert_eq!(BinOp::Add.apply(Width::Dword, 0xFFFF_FFFF, 1), 0);
        assert_eq!(BinOp::Sub.apply(Width::Qword, 3, 5), (-2i64) as u64);
        assert_eq!(BinOp::Xor.apply(Width::Dword, 0xF0, 0xFF), 0x0F);
    }

    #[test]
    fn test_saved_reg_names() {
        assert_eq!(SavedReg::Gpr(Register::R15).to_string(), "r15");
        assert_eq!(SavedReg::Flags.to_string(), "rflags");
    }
}
