use super::{BlockId, CastOp, Function, Inst, Operand, Predicate, Terminator, Type, ValueId};
use crate::semantics::{BinOp, SavedReg};

/// Appends instructions to one block of a [`Function`] at a time.
pub struct Builder {
    function: Function,
    current: BlockId,
}

impl Builder {
    pub fn new(mut function: Function, entry: &str) -> Self {
        let current = function.add_block(entry);
        Self { function, current }
    }

    pub fn function(&self) -> &Function {
        &self.function
    }

    pub fn finish(self) -> Function {
        self.function
    }

    pub fn add_block(&mut self, name: impl Into<String>) -> BlockId {
        self.function.add_block(name)
    }

    pub fn position_at(&mut self, block: BlockId) {
        self.current = block;
    }

    pub fn current(&self) -> BlockId {
        self.current
    }

    fn insert(&mut self, inst: Inst) {
        self.function.block_mut(self.current).insts.push(inst);
    }

    fn define(&mut self, ty: Type, build: impl FnOnce(ValueId) -> Inst) -> Operand {
        let dst = self.function.fresh_value();
        self.insert(build(dst));
        Operand::Value(dst, ty)
    }

    fn terminate(&mut self, terminator: Terminator) {
        let block = self.function.block_mut(self.current);
        debug_assert!(block.terminator.is_none(), "{} is already terminated", block.name);
        block.terminator = Some(terminator);
    }

    pub fn alloca(&mut self, bytes: u64) -> Operand {
        self.define(Type::Ptr, |dst| Inst::Alloca { dst, bytes })
    }

    pub fn ptr_add(&mut self, base: Operand, offset: i64) -> Operand {
        self.define(Type::Ptr, |dst| Inst::PtrAdd { dst, base, offset })
    }

    pub fn load(&mut self, ty: Type, ptr: Operand) -> Operand {
        self.define(ty, |dst| Inst::Load { dst, ty, ptr })
    }

    pub fn store(&mut self, value: Operand, ptr: Operand) {
        self.insert(Inst::Store { value, ptr });
    }

    pub fn binary(&mut self, op: BinOp, lhs: Operand, rhs: Operand) -> Operand {
        self.define(lhs.ty(), |dst| Inst::Binary { dst, op, lhs, rhs })
    }

    pub fn icmp(&mut self, predicate: Predicate, lhs: Operand, rhs: Operand) -> Operand {
        self.define(Type::I1, |dst| Inst::ICmp {
            dst,
            predicate,
            lhs,
            rhs,
        })
    }

    pub fn cast(&mut self, op: CastOp, value: Operand, to: Type) -> Operand {
        self.define(to, |dst| Inst::Cast { dst, op, value, to })
    }

    pub fn read_reg(&mut self, reg: SavedReg) -> Operand {
        self.define(Type::I64, |dst| Inst::ReadReg { dst, reg })
    }

    pub fn write_reg(&mut self, reg: SavedReg, value: Operand) {
        self.insert(Inst::WriteReg { reg, value });
    }

    pub fn br(&mut self, target: BlockId) {
        self.terminate(Terminator::Br(target));
    }

    pub fn cond_br(&mut self, condition: Operand, then: BlockId, otherwise: BlockId) {
        self.terminate(Terminator::CondBr {
            condition,
            then,
            otherwise,
        });
    }

    pub fn ret(&mut self, value: Option<Operand>) {
        self.terminate(Terminator::Ret(value));
    }
}
