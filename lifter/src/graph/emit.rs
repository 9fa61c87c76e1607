use logger::{debug, info};

use super::{
    builder::Builder, BlockId, CastOp, Function, Module, Operand, Predicate, Type,
};
use crate::{
    config::LifterConfig,
    error::{Error, Result},
    handler::HandlerTable,
    lift::{self, Emitter, Enter, Successor},
    semantics::{BinOp, SavedReg, StackMachine, Width, RETURN_REGISTER},
};

pub const MODULE_NAME: &str = "devirt_module";
pub const FUNCTION_NAME: &str = "devirtualized";
pub const EXIT_LABEL: &str = "vm_exit";

/// Lowers a handler table into a single-function [`Module`]. Every handler
/// gets its own block named `<OPCODE>_<position>`. The virtual stack pointer
/// and the register file live in stack slots so any control flow between
/// blocks stays well formed.
pub struct GraphEmitter {
    builder: Builder,
    vstack_size: usize,
    vreg_count: usize,
    vsp_slot: Operand,
    vregs: Operand,
    handlers: Vec<BlockId>,
    exit: Option<BlockId>,
}

impl GraphEmitter {
    pub fn new(config: &LifterConfig) -> Self {
        let function = Function::new(FUNCTION_NAME, Type::I64);

        Self {
            builder: Builder::new(function, "entry"),
            vstack_size: config.vstack_size,
            vreg_count: config.vreg_count,
            vsp_slot: Operand::Const(Type::Ptr, 0),
            vregs: Operand::Const(Type::Ptr, 0),
            handlers: Vec::new(),
            exit: None,
        }
    }

    pub fn run(&mut self, table: &HandlerTable) -> Result<()> {
        if table.is_empty() {
            return Err(Error::Precondition("handler table is empty".to_string()));
        }

        lift::lower(self, table)?;
        self.builder.function().verify()?;

        info!(
            "Emitted {} blocks for {} handlers",
            self.builder.function().len(),
            table.len()
        );

        Ok(())
    }

    pub fn function(&self) -> &Function {
        self.builder.function()
    }

    pub fn handler_block(&self, position: usize) -> Option<BlockId> {
        self.handlers.get(position).copied()
    }

    pub fn exit_block(&self) -> Option<BlockId> {
        self.exit
    }

    pub fn into_module(self) -> Module {
        let mut module = Module::new(MODULE_NAME);
        module.functions.push(self.builder.finish());
        module
    }

    fn successor_block(&mut self, successor: Successor) -> BlockId {
        match successor {
            Successor::Handler(position) => self.handlers[position],
            Successor::Exit => self.exit_path(),
        }
    }

    fn exit_path(&mut self) -> BlockId {
        if let Some(exit) = self.exit {
            return exit;
        }

        let exit = self.builder.add_block(EXIT_LABEL);
        self.exit = Some(exit);

        let resume = self.builder.current();
        self.builder.position_at(exit);
        self.restore_context();
        self.emit_return();
        self.builder.position_at(resume);

        exit
    }

    fn emit_return(&mut self) {
        let value = self.builder.read_reg(SavedReg::Gpr(RETURN_REGISTER));
        self.builder.ret(Some(value));
    }

    fn vreg_pointer(&mut self, index: usize) -> Operand {
        self.builder.ptr_add(self.vregs, index as i64 * 8)
    }
}

impl StackMachine for GraphEmitter {
    type Value = Operand;

    fn vreg_count(&self) -> usize {
        self.vreg_count
    }

    fn constant(&mut self, width: Width, value: u64) -> Operand {
        Operand::Const(width.into(), value & width.mask())
    }

    fn push(&mut self, width: Width, value: Operand) {
        let vsp = self.builder.load(Type::Ptr, self.vsp_slot);
        let next = self.builder.ptr_add(vsp, -(width.bytes() as i64));
        self.builder.store(next, self.vsp_slot);
        self.builder.store(value, next);
    }

    fn pop(&mut self, width: Width) -> Operand {
        let vsp = self.builder.load(Type::Ptr, self.vsp_slot);
        let value = self.builder.load(width.into(), vsp);
        let next = self.builder.ptr_add(vsp, width.bytes() as i64);
        self.builder.store(next, self.vsp_slot);
        value
    }

    fn read_vreg(&mut self, width: Width, index: usize) -> Operand {
        let pointer = self.vreg_pointer(index);
        self.builder.load(width.into(), pointer)
    }

    fn write_vreg(&mut self, width: Width, index: usize, value: Operand) {
        let pointer = self.vreg_pointer(index);
        let value = match width {
            Width::Qword => value,
            _ => self.builder.cast(CastOp::ZExt, value, Type::I64),
        };
        self.builder.store(value, pointer);
    }

    fn read_vsp(&mut self) -> Operand {
        let vsp = self.builder.load(Type::Ptr, self.vsp_slot);
        self.builder.cast(CastOp::PtrToInt, vsp, Type::I64)
    }

    fn write_vsp(&mut self, value: Operand) {
        let vsp = self.builder.cast(CastOp::IntToPtr, value, Type::Ptr);
        self.builder.store(vsp, self.vsp_slot);
    }

    fn read_register(&mut self, reg: SavedReg) -> Operand {
        self.builder.read_reg(reg)
    }

    fn write_register(&mut self, reg: SavedReg, value: Operand) {
        self.builder.write_reg(reg, value);
    }

    fn binary(&mut self, op: BinOp, _width: Width, lhs: Operand, rhs: Operand) -> Operand {
        self.builder.binary(op, lhs, rhs)
    }

    fn sign_extend(&mut self, _from: Width, value: Operand) -> Operand {
        self.builder.cast(CastOp::SExt, value, Type::I64)
    }

    fn is_zero(&mut self, width: Width, value: Operand) -> Operand {
        self.builder
            .icmp(Predicate::Eq, value, Operand::Const(width.into(), 0))
    }

    fn is_nonzero(&mut self, width: Width, value: Operand) -> Operand {
        self.builder
            .icmp(Predicate::Ne, value, Operand::Const(width.into(), 0))
    }

    fn load(&mut self, width: Width, address: Operand) -> Operand {
        let pointer = self.builder.cast(CastOp::IntToPtr, address, Type::Ptr);
        self.builder.load(width.into(), pointer)
    }

    fn store(&mut self, _width: Width, address: Operand, value: Operand) {
        let pointer = self.builder.cast(CastOp::IntToPtr, address, Type::Ptr);
        self.builder.store(value, pointer);
    }
}

impl Emitter for GraphEmitter {
    fn begin(&mut self, table: &HandlerTable) -> Result<()> {
        let vstack = self.builder.alloca(self.vstack_size as u64);
        self.vsp_slot = self.builder.alloca(8);
        self.vregs = self.builder.alloca(self.vreg_count as u64 * 8);

        let top = self.builder.ptr_add(vstack, self.vstack_size as i64);
        self.builder.store(top, self.vsp_slot);

        self.handlers = table
            .iter()
            .enumerate()
            .map(|(position, handler)| {
                self.builder
                    .add_block(format!("{}_{}", handler.opcode, position))
            })
            .collect();

        self.builder.br(self.handlers[0]);

        Ok(())
    }

    fn enter(&mut self, table: &HandlerTable, position: usize) -> Result<Enter> {
        let block = self
            .handler_block(position)
            .ok_or(Error::MissingBlock {
                opcode: table[position].opcode,
                position,
            })?;

        debug!("Lowering {} into {}", table[position], self.function().block(block).name);

        self.builder.position_at(block);
        Ok(Enter::Lower)
    }

    fn jump(&mut self, _table: &HandlerTable, _position: usize, to: Successor) -> Result<()> {
        let target = self.successor_block(to);
        self.builder.br(target);
        Ok(())
    }

    fn branch(
        &mut self,
        _table: &HandlerTable,
        _position: usize,
        condition: Operand,
        taken: usize,
        fallthrough: Successor,
    ) -> Result<()> {
        let then = self.handlers[taken];
        let otherwise = self.successor_block(fallthrough);
        self.builder.cond_br(condition, then, otherwise);
        Ok(())
    }

    fn ret(&mut self) -> Result<()> {
        self.emit_return();
        Ok(())
    }
}
