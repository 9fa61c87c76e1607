//! A register-transfer IR of basic blocks keyed by virtual instruction
//! pointer.

pub mod emit;

use std::{
    collections::{btree_map::Entry, BTreeMap},
    fmt,
};

use iced_x86::Register;
use strum_macros::Display;

/// Virtual instruction pointer: a bytecode offset relative to the image base.
pub type Vip = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterKind {
    Physical(Register),
    Flags,
    StackPointer,
    Virtual(u32),
    Temporary(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegisterDesc {
    pub kind: RegisterKind,
    pub bits: u32,
}

impl RegisterDesc {
    pub const FLAGS: RegisterDesc = RegisterDesc::new(RegisterKind::Flags, 64);
    pub const SP: RegisterDesc = RegisterDesc::new(RegisterKind::StackPointer, 64);

    pub const fn new(kind: RegisterKind, bits: u32) -> Self {
        Self { kind, bits }
    }

    pub const fn physical(reg: Register) -> Self {
        Self::new(RegisterKind::Physical(reg), 64)
    }
}

impl fmt::Display for RegisterDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            RegisterKind::Physical(reg) => write!(f, "{}", format!("{:?}", reg).to_lowercase())?,
            RegisterKind::Flags => write!(f, "$flags")?,
            RegisterKind::StackPointer => write!(f, "$sp")?,
            RegisterKind::Virtual(index) => write!(f, "vr{}", index)?,
            RegisterKind::Temporary(index) => write!(f, "t{}", index)?,
        }

        if self.bits != 64 {
            write!(f, ":{}", self.bits)?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(RegisterDesc),
    Imm { value: u64, bits: u32 },
}

impl Operand {
    pub fn imm(value: u64, bits: u32) -> Self {
        Operand::Imm { value, bits }
    }

    pub fn bits(&self) -> u32 {
        match self {
            Operand::Reg(reg) => reg.bits,
            Operand::Imm { bits, .. } => *bits,
        }
    }
}

impl From<RegisterDesc> for Operand {
    fn from(reg: RegisterDesc) -> Self {
        Operand::Reg(reg)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(reg) => write!(f, "{}", reg),
            Operand::Imm { value, bits: 64 } => write!(f, "0x{:X}", value),
            Operand::Imm { value, bits } => write!(f, "0x{:X}:{}", value, bits),
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Op {
    Mov,
    Movsx,
    Add,
    Sub,
    Or,
    And,
    Xor,
    /// `dst = lhs == rhs`
    Te,
    /// `dst = lhs != rhs`
    Tne,
    /// Load: `dst = [base + offset]`.
    Ldd,
    /// Store: `[base + offset] = value`.
    Str,
    Push,
    Pop,
    Pushf,
    Popf,
    Js,
    Jmp,
    Vexit,
}

impl Op {
    pub fn is_branching(self) -> bool {
        matches!(self, Op::Js | Op::Jmp | Op::Vexit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub op: Op,
    pub operands: Vec<Operand>,
    /// Virtual stack offset relative to block entry, before this instruction.
    pub sp_offset: i64,
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:>+5}] {:<6}", self.sp_offset, self.op.to_string())?;

        for (index, operand) in self.operands.iter().enumerate() {
            if index > 0 {
                write!(f, ",")?;
            }
            write!(f, " {}", operand)?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    pub vip: Vip,
    pub instructions: Vec<Instruction>,
    pub prev: Vec<Vip>,
    pub next: Vec<Vip>,
    sp_offset: i64,
    last_temporary: u32,
}

impl BasicBlock {
    pub fn new(vip: Vip) -> Self {
        Self {
            vip,
            instructions: Vec::new(),
            prev: Vec::new(),
            next: Vec::new(),
            sp_offset: 0,
            last_temporary: 0,
        }
    }

    pub fn tmp(&mut self, bits: u32) -> RegisterDesc {
        let index = self.last_temporary;
        self.last_temporary += 1;
        RegisterDesc::new(RegisterKind::Temporary(index), bits)
    }

    pub fn emit(&mut self, op: Op, operands: Vec<Operand>) -> &mut Self {
        let sp_offset = self.sp_offset;

        match op {
            Op::Push => self.sp_offset -= operands.first().map_or(8, |o| o.bits() as i64 / 8),
            Op::Pop => self.sp_offset += operands.first().map_or(8, |o| o.bits() as i64 / 8),
            Op::Pushf => self.sp_offset -= 8,
            Op::Popf => self.sp_offset += 8,
            _ => {}
        }

        self.instructions.push(Instruction {
            op,
            operands,
            sp_offset,
        });
        self
    }

    pub fn sp_offset(&self) -> i64 {
        self.sp_offset
    }

    pub fn is_complete(&self) -> bool {
        self.instructions
            .last()
            .is_some_and(|instruction| instruction.op.is_branching())
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routine {
    pub entry: Vip,
    blocks: BTreeMap<Vip, BasicBlock>,
}

impl Routine {
    pub fn new(entry: Vip) -> Self {
        let mut blocks = BTreeMap::new();
        blocks.insert(entry, BasicBlock::new(entry));
        Self { entry, blocks }
    }

    /// Returns the block at `vip`, creating it when needed. The flag is set
    /// when the block was created by this call.
    pub fn create_block(&mut self, vip: Vip) -> (&mut BasicBlock, bool) {
        match self.blocks.entry(vip) {
            Entry::Occupied(entry) => (entry.into_mut(), false),
            Entry::Vacant(entry) => (entry.insert(BasicBlock::new(vip)), true),
        }
    }

    pub fn fork(&mut self, from: Vip, to: Vip) -> bool {
        let (target, created) = self.create_block(to);
        if !target.prev.contains(&from) {
            target.prev.push(from);
        }

        if let Some(source) = self.blocks.get_mut(&from) {
            if !source.next.contains(&to) {
                source.next.push(to);
            }
        }

        created
    }

    pub fn is_explored(&self, vip: Vip) -> bool {
        self.blocks.contains_key(&vip)
    }

    pub fn block(&self, vip: Vip) -> Option<&BasicBlock> {
        self.blocks.get(&vip)
    }

    pub fn block_mut(&mut self, vip: Vip) -> Option<&mut BasicBlock> {
        self.blocks.get_mut(&vip)
    }

    pub fn blocks(&self) -> impl Iterator<Item = &BasicBlock> {
        self.blocks.values()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn instruction_count(&self) -> usize {
        self.blocks.values().map(BasicBlock::len).sum()
    }

    /// Serializes the routine into a flat little-endian image:
    /// a `VRTN` header, then each block with its instructions and edges.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::new();

        bytes.extend_from_slice(b"VRTN");
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&self.entry.to_le_bytes());
        bytes.extend_from_slice(&(self.blocks.len() as u32).to_le_bytes());

        for block in self.blocks.values() {
            bytes.extend_from_slice(&block.vip.to_le_bytes());
            bytes.extend_from_slice(&(block.instructions.len() as u32).to_le_bytes());

            for instruction in &block.instructions {
                bytes.push(instruction.op as u8);
                bytes.extend_from_slice(&instruction.sp_offset.to_le_bytes());
                bytes.push(instruction.operands.len() as u8);

                for operand in &instruction.operands {
                    encode_operand(&mut bytes, operand);
                }
            }

            for edges in [&block.prev, &block.next] {
                bytes.extend_from_slice(&(edges.len() as u32).to_le_bytes());
                for vip in edges {
                    bytes.extend_from_slice(&vip.to_le_bytes());
                }
            }
        }

        bytes
    }
}

fn encode_operand(bytes: &mut Vec<u8>, operand: &Operand) {
    match operand {
        Operand::Imm { value, bits } => {
            bytes.push(0);
            bytes.extend_from_slice(&value.to_le_bytes());
            bytes.push(*bits as u8);
        }
        Operand::Reg(reg) => {
            let (kind, id) = match reg.kind {
                RegisterKind::Physical(reg) => (1u8, reg as u32),
                RegisterKind::Flags => (2, 0),
                RegisterKind::StackPointer => (3, 0),
                RegisterKind::Virtual(index) => (4, index),
                RegisterKind::Temporary(index) => (5, index),
            };
            bytes.push(kind);
            bytes.extend_from_slice(&id.to_le_bytes());
            bytes.push(reg.bits as u8);
        }
    }
}

fn vip_list(vips: &[Vip]) -> String {
    vips.iter()
        .map(|vip| format!("0x{:X}", vip))
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for Routine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for block in self.blocks.values() {
            write!(f, "vip 0x{:X}", block.vip)?;
            if !block.prev.is_empty() {
                write!(f, " <- [{}]", vip_list(&block.prev))?;
            }
            if !block.next.is_empty() {
                write!(f, " -> [{}]", vip_list(&block.next))?;
            }
            writeln!(f)?;

            for instruction in &block.instructions {
                writeln!(f, "  {}", instruction)?;
            }
        }
        Ok(())
    }
}
