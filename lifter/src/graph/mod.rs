//! A small typed SSA IR with basic blocks, printed in LLVM textual syntax.

pub mod builder;
pub mod emit;

use std::{
    collections::{HashMap, HashSet},
    fmt,
};

use crate::{
    error::{Error, Result},
    semantics::{BinOp, SavedReg, Width},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    I1,
    I32,
    I64,
    Ptr,
}

impl From<Width> for Type {
    fn from(width: Width) -> Self {
        match width {
            Width::Bit => Type::I1,
            Width::Dword => Type::I32,
            Width::Qword => Type::I64,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Type::I1 => "i1",
            Type::I32 => "i32",
            Type::I64 => "i64",
            Type::Ptr => "ptr",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Value(ValueId, Type),
    Const(Type, u64),
}

impl Operand {
    pub fn ty(&self) -> Type {
        match self {
            Operand::Value(_, ty) | Operand::Const(ty, _) => *ty,
        }
    }

    fn value(&self) -> Option<ValueId> {
        match self {
            Operand::Value(id, _) => Some(*id),
            Operand::Const(..) => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Value(id, _) => write!(f, "%{}", id.0),
            Operand::Const(Type::I1, value) => {
                f.write_str(if *value & 1 != 0 { "true" } else { "false" })
            }
            Operand::Const(Type::I32, value) => write!(f, "{}", *value as u32 as i32),
            Operand::Const(Type::I64, value) => write!(f, "{}", *value as i64),
            Operand::Const(Type::Ptr, 0) => f.write_str("null"),
            Operand::Const(Type::Ptr, value) => write!(f, "inttoptr (i64 {} to ptr)", value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastOp {
    SExt,
    ZExt,
    PtrToInt,
    IntToPtr,
}

impl fmt::Display for CastOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CastOp::SExt => "sext",
            CastOp::ZExt => "zext",
            CastOp::PtrToInt => "ptrtoint",
            CastOp::IntToPtr => "inttoptr",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predicate {
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inst {
    Alloca {
        dst: ValueId,
        bytes: u64,
    },
    /// Byte-granular pointer arithmetic (`getelementptr i8`).
    PtrAdd {
        dst: ValueId,
        base: Operand,
        offset: i64,
    },
    Load {
        dst: ValueId,
        ty: Type,
        ptr: Operand,
    },
    Store {
        value: Operand,
        ptr: Operand,
    },
    Binary {
        dst: ValueId,
        op: BinOp,
        lhs: Operand,
        rhs: Operand,
    },
    ICmp {
        dst: ValueId,
        predicate: Predicate,
        lhs: Operand,
        rhs: Operand,
    },
    Cast {
        dst: ValueId,
        op: CastOp,
        value: Operand,
        to: Type,
    },
    ReadReg {
        dst: ValueId,
        reg: SavedReg,
    },
    WriteReg {
        reg: SavedReg,
        value: Operand,
    },
}

impl Inst {
    pub fn dst(&self) -> Option<ValueId> {
        match self {
            Inst::Alloca { dst, .. }
            | Inst::PtrAdd { dst, .. }
            | Inst::Load { dst, .. }
            | Inst::Binary { dst, .. }
            | Inst::ICmp { dst, .. }
            | Inst::Cast { dst, .. }
            | Inst::ReadReg { dst, .. } => Some(*dst),
            Inst::Store { .. } | Inst::WriteReg { .. } => None,
        }
    }

    pub fn operands(&self) -> Vec<Operand> {
        match self {
            Inst::Alloca { .. } | Inst::ReadReg { .. } => vec![],
            Inst::PtrAdd { base, .. } => vec![*base],
            Inst::Load { ptr, .. } => vec![*ptr],
            Inst::Store { value, ptr } => vec![*value, *ptr],
            Inst::Binary { lhs, rhs, .. } | Inst::ICmp { lhs, rhs, .. } => vec![*lhs, *rhs],
            Inst::Cast { value, .. } => vec![*value],
            Inst::WriteReg { value, .. } => vec![*value],
        }
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inst::Alloca { dst, bytes } => write!(f, "%{} = alloca [{} x i8], align 8", dst.0, bytes),
            Inst::PtrAdd { dst, base, offset } => write!(
                f,
                "%{} = getelementptr i8, ptr {}, i64 {}",
                dst.0, base, offset
            ),
            Inst::Load { dst, ty, ptr } => write!(f, "%{} = load {}, ptr {}", dst.0, ty, ptr),
            Inst::Store { value, ptr } => {
                write!(f, "store {} {}, ptr {}", value.ty(), value, ptr)
            }
            Inst::Binary { dst, op, lhs, rhs } => {
                let name = match op {
                    BinOp::Add => "add",
                    BinOp::Sub => "sub",
                    BinOp::Or => "or",
                    BinOp::And => "and",
                    BinOp::Xor => "xor",
                };
                write!(f, "%{} = {} {} {}, {}", dst.0, name, lhs.ty(), lhs, rhs)
            }
            Inst::ICmp {
                dst,
                predicate,
                lhs,
                rhs,
            } => {
                let name = match predicate {
                    Predicate::Eq => "eq",
                    Predicate::Ne => "ne",
                };
                write!(f, "%{} = icmp {} {} {}, {}", dst.0, name, lhs.ty(), lhs, rhs)
            }
            Inst::Cast { dst, op, value, to } => {
                write!(f, "%{} = {} {} {} to {}", dst.0, op, value.ty(), value, to)
            }
            Inst::ReadReg { dst, reg } => write!(f, "%{} = load i64, ptr @{}", dst.0, reg),
            Inst::WriteReg { reg, value } => {
                write!(f, "store {} {}, ptr @{}", value.ty(), value, reg)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminator {
    Br(BlockId),
    CondBr {
        condition: Operand,
        then: BlockId,
        otherwise: BlockId,
    },
    Ret(Option<Operand>),
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Br(target) => vec![*target],
            Terminator::CondBr {
                then, otherwise, ..
            } => vec![*then, *otherwise],
            Terminator::Ret(_) => vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub name: String,
    pub insts: Vec<Inst>,
    pub terminator: Option<Terminator>,
}

impl Block {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            insts: Vec::new(),
            terminator: None,
        }
    }

    pub fn successors(&self) -> Vec<BlockId> {
        self.terminator
            .as_ref()
            .map(Terminator::successors)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub name: String,
    pub return_type: Type,
    blocks: Vec<Block>,
    next_value: u32,
}

impl Function {
    pub fn new(name: impl Into<String>, return_type: Type) -> Self {
        Self {
            name: name.into(),
            return_type,
            blocks: Vec::new(),
            next_value: 0,
        }
    }

    pub fn add_block(&mut self, name: impl Into<String>) -> BlockId {
        self.blocks.push(Block::new(name));
        BlockId(self.blocks.len() - 1)
    }

    pub fn fresh_value(&mut self) -> ValueId {
        let id = ValueId(self.next_value);
        self.next_value += 1;
        id
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.0]
    }

    pub fn blocks(&self) -> impl Iterator<Item = (BlockId, &Block)> {
        self.blocks
            .iter()
            .enumerate()
            .map(|(index, block)| (BlockId(index), block))
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn find(&self, name: &str) -> Option<BlockId> {
        self.blocks
            .iter()
            .position(|block| block.name == name)
            .map(BlockId)
    }

    pub fn successors(&self, id: BlockId) -> Vec<BlockId> {
        self.block(id).successors()
    }

    pub fn predecessors(&self, id: BlockId) -> Vec<BlockId> {
        self.blocks()
            .filter(|(_, block)| block.successors().contains(&id))
            .map(|(from, _)| from)
            .collect()
    }

    /// Checks the structural rules every emitted function must satisfy:
    /// unique labels, one terminator per block, targets in range, values
    /// defined once and defined before their use within a block.
    pub fn verify(&self) -> Result<()> {
        let mut names = HashSet::new();
        let mut defined = HashMap::new();

        for (id, block) in self.blocks() {
            if !names.insert(block.name.as_str()) {
                return Err(Error::Malformed(format!("duplicate label {}", block.name)));
            }

            let Some(terminator) = &block.terminator else {
                return Err(Error::Malformed(format!("{} has no terminator", block.name)));
            };

            if let Some(target) = terminator
                .successors()
                .into_iter()
                .find(|target| target.0 >= self.blocks.len())
            {
                return Err(Error::Malformed(format!(
                    "{} branches to missing block {}",
                    block.name, target.0
                )));
            }

            for (index, inst) in block.insts.iter().enumerate() {
                if let Some(dst) = inst.dst() {
                    if defined.insert(dst, (id, index)).is_some() {
                        return Err(Error::Malformed(format!("%{} is defined twice", dst.0)));
                    }
                }
            }
        }

        for (id, block) in self.blocks() {
            let terminator_uses = match &block.terminator {
                Some(Terminator::CondBr { condition, .. }) => vec![*condition],
                Some(Terminator::Ret(Some(value))) => vec![*value],
                _ => vec![],
            };

            let uses = block
                .insts
                .iter()
                .enumerate()
                .flat_map(|(index, inst)| inst.operands().into_iter().map(move |op| (index, op)))
                .chain(
                    terminator_uses
                        .into_iter()
                        .map(|op| (block.insts.len(), op)),
                );

            for (index, operand) in uses {
                let Some(value) = operand.value() else {
                    continue;
                };

                match defined.get(&value) {
                    None => {
                        return Err(Error::Malformed(format!(
                            "%{} is used in {} but never defined",
                            value.0, block.name
                        )))
                    }
                    Some((at, def)) if *at == id && *def >= index => {
                        return Err(Error::Malformed(format!(
                            "%{} is used in {} before its definition",
                            value.0, block.name
                        )))
                    }
                    _ => {}
                }
            }
        }

        Ok(())
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "define {} @{}() {{", self.return_type, self.name)?;

        for (index, block) in self.blocks.iter().enumerate() {
            if index > 0 {
                writeln!(f)?;
            }
            writeln!(f, "{}:", block.name)?;

            for inst in &block.insts {
                writeln!(f, "  {}", inst)?;
            }

            match &block.terminator {
                Some(Terminator::Br(target)) => {
                    writeln!(f, "  br label %{}", self.block(*target).name)?
                }
                Some(Terminator::CondBr {
                    condition,
                    then,
                    otherwise,
                }) => writeln!(
                    f,
                    "  br i1 {}, label %{}, label %{}",
                    condition,
                    self.block(*then).name,
                    self.block(*otherwise).name
                )?,
                Some(Terminator::Ret(Some(value))) => {
                    writeln!(f, "  ret {} {}", value.ty(), value)?
                }
                Some(Terminator::Ret(None)) => writeln!(f, "  ret void")?,
                None => writeln!(f, "  unreachable")?,
            }
        }

        writeln!(f, "}}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    pub name: String,
    pub functions: Vec<Function>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: Vec::new(),
        }
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|function| function.name == name)
    }

    fn registers(&self) -> Vec<SavedReg> {
        let mut seen = Vec::new();
        for function in &self.functions {
            for (_, block) in function.blocks() {
                for inst in &block.insts {
                    let reg = match inst {
                        Inst::ReadReg { reg, .. } | Inst::WriteReg { reg, .. } => *reg,
                        _ => continue,
                    };
                    if !seen.contains(&reg) {
                        seen.push(reg);
                    }
                }
            }
        }
        seen
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; ModuleID = '{}'", self.name)?;
        writeln!(f, "source_filename = \"{}\"", self.name)?;

        let registers = self.registers();
        if !registers.is_empty() {
            writeln!(f)?;
            for reg in registers {
                writeln!(f, "@{} = external global i64", reg)?;
            }
        }

        for function in &self.functions {
            writeln!(f)?;
            write!(f, "{}", function)?;
        }

        Ok(())
    }
}
