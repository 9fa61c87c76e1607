use std::collections::HashSet;

use logger::{debug, info};

use super::{BasicBlock, Op, Operand, RegisterDesc, RegisterKind, Routine, Vip};
use crate::{
    config::LifterConfig,
    error::{Error, Result},
    handler::HandlerTable,
    lift::{self, Emitter, Enter, Successor},
    semantics::{
        restore_order, BinOp, SavedReg, StackMachine, Width, RETURN_REGISTER, SAVE_ORDER,
    },
};

/// Lowers a handler table into a [`Routine`]. Blocks are keyed by handler
/// address, so every branch to an already explored address reuses its block.
pub struct RoutineEmitter {
    routine: Routine,
    current: Vip,
    vreg_count: usize,
    lowered: HashSet<Vip>,
    after_exit: bool,
}

impl RoutineEmitter {
    pub fn new(config: &LifterConfig) -> Self {
        Self {
            routine: Routine::new(0),
            current: 0,
            vreg_count: config.vreg_count,
            lowered: HashSet::new(),
            after_exit: false,
        }
    }

    pub fn run(&mut self, table: &HandlerTable) -> Result<()> {
        if table.is_empty() {
            return Err(Error::Precondition("handler table is empty".to_string()));
        }

        lift::lower(self, table)?;

        info!(
            "Emitted {} routine blocks ({} instructions)",
            self.routine.len(),
            self.routine.instruction_count()
        );

        Ok(())
    }

    pub fn routine(&self) -> &Routine {
        &self.routine
    }

    pub fn into_routine(self) -> Routine {
        self.routine
    }

    fn block(&mut self) -> &mut BasicBlock {
        self.routine.create_block(self.current).0
    }

    fn temporary(&mut self, width: Width) -> RegisterDesc {
        self.block().tmp(width.bits())
    }

    fn vip_of(table: &HandlerTable, successor: Successor) -> Vip {
        match successor {
            Successor::Handler(position) => table[position].address as Vip,
            Successor::Exit => exit_vip(table),
        }
    }

    fn link(&mut self, table: &HandlerTable, to: Successor) {
        let vip = Self::vip_of(table, to);
        self.routine.fork(self.current, vip);

        if to == Successor::Exit && self.lowered.insert(vip) {
            let resume = self.current;
            self.current = vip;
            self.restore_context();
            self.emit_vexit();
            self.current = resume;
        }
    }

    fn emit_vexit(&mut self) {
        self.block()
            .emit(Op::Vexit, vec![RegisterDesc::physical(RETURN_REGISTER).into()]);
    }
}

pub fn exit_vip(table: &HandlerTable) -> Vip {
    table.last().map_or(0, |handler| handler.end())
}

fn saved(reg: SavedReg) -> RegisterDesc {
    match reg {
        SavedReg::Gpr(reg) => RegisterDesc::physical(reg),
        SavedReg::Flags => RegisterDesc::FLAGS,
    }
}

impl StackMachine for RoutineEmitter {
    type Value = Operand;

    fn vreg_count(&self) -> usize {
        self.vreg_count
    }

    fn constant(&mut self, width: Width, value: u64) -> Operand {
        Operand::imm(value & width.mask(), width.bits())
    }

    fn push(&mut self, _width: Width, value: Operand) {
        self.block().emit(Op::Push, vec![value]);
    }

    fn pop(&mut self, width: Width) -> Operand {
        let tmp = self.temporary(width);
        self.block().emit(Op::Pop, vec![tmp.into()]);
        tmp.into()
    }

    fn read_vreg(&mut self, width: Width, index: usize) -> Operand {
        RegisterDesc::new(RegisterKind::Virtual(index as u32), width.bits()).into()
    }

    fn write_vreg(&mut self, _width: Width, index: usize, value: Operand) {
        // Narrow writes zero the upper half of the register.
        let vreg = RegisterDesc::new(RegisterKind::Virtual(index as u32), 64);
        self.block().emit(Op::Mov, vec![vreg.into(), value]);
    }

    fn read_vsp(&mut self) -> Operand {
        RegisterDesc::SP.into()
    }

    fn write_vsp(&mut self, value: Operand) {
        self.block().emit(Op::Mov, vec![RegisterDesc::SP.into(), value]);
    }

    fn read_register(&mut self, reg: SavedReg) -> Operand {
        saved(reg).into()
    }

    fn write_register(&mut self, reg: SavedReg, value: Operand) {
        self.block().emit(Op::Mov, vec![saved(reg).into(), value]);
    }

    fn binary(&mut self, op: BinOp, width: Width, lhs: Operand, rhs: Operand) -> Operand {
        let op = match op {
            BinOp::Add => Op::Add,
            BinOp::Sub => Op::Sub,
            BinOp::Or => Op::Or,
            BinOp::And => Op::And,
            BinOp::Xor => Op::Xor,
        };

        let tmp = self.temporary(width);
        self.block()
            .emit(Op::Mov, vec![tmp.into(), lhs])
            .emit(op, vec![tmp.into(), rhs]);
        tmp.into()
    }

    fn sign_extend(&mut self, _from: Width, value: Operand) -> Operand {
        let tmp = self.temporary(Width::Qword);
        self.block().emit(Op::Movsx, vec![tmp.into(), value]);
        tmp.into()
    }

    fn is_zero(&mut self, width: Width, value: Operand) -> Operand {
        let tmp = self.temporary(Width::Bit);
        self.block()
            .emit(Op::Te, vec![tmp.into(), value, Operand::imm(0, width.bits())]);
        tmp.into()
    }

    fn is_nonzero(&mut self, width: Width, value: Operand) -> Operand {
        let tmp = self.temporary(Width::Bit);
        self.block()
            .emit(Op::Tne, vec![tmp.into(), value, Operand::imm(0, width.bits())]);
        tmp.into()
    }

    fn load(&mut self, width: Width, address: Operand) -> Operand {
        let tmp = self.temporary(width);
        self.block()
            .emit(Op::Ldd, vec![tmp.into(), address, Operand::imm(0, 64)]);
        tmp.into()
    }

    fn store(&mut self, _width: Width, address: Operand, value: Operand) {
        self.block()
            .emit(Op::Str, vec![address, Operand::imm(0, 64), value]);
    }

    fn save_context(&mut self) {
        for reg in SAVE_ORDER {
            match reg {
                SavedReg::Flags => self.block().emit(Op::Pushf, vec![]),
                SavedReg::Gpr(reg) => self
                    .block()
                    .emit(Op::Push, vec![RegisterDesc::physical(reg).into()]),
            };
        }
    }

    fn restore_context(&mut self) {
        for reg in restore_order() {
            match reg {
                SavedReg::Flags => self.block().emit(Op::Popf, vec![]),
                SavedReg::Gpr(reg) => self
                    .block()
                    .emit(Op::Pop, vec![RegisterDesc::physical(reg).into()]),
            };
        }
    }
}

impl Emitter for RoutineEmitter {
    fn begin(&mut self, table: &HandlerTable) -> Result<()> {
        let entry = table[0].address as Vip;

        self.routine = Routine::new(entry);
        self.current = entry;
        self.lowered.clear();
        self.after_exit = false;

        Ok(())
    }

    fn enter(&mut self, table: &HandlerTable, position: usize) -> Result<Enter> {
        let vip = table[position].address as Vip;

        if self.lowered.contains(&vip) {
            return Ok(Enter::Skip);
        }

        if !self.routine.is_explored(vip) {
            // Nothing branches here yet; code after an exit may still be
            // reached by a later branch.
            if self.after_exit {
                return Ok(Enter::Skip);
            }

            return Err(Error::MissingBlock {
                opcode: table[position].opcode,
                position,
            });
        }

        debug!("Lowering {} into vip 0x{:X}", table[position], vip);

        self.current = vip;
        self.lowered.insert(vip);
        self.after_exit = false;

        Ok(Enter::Lower)
    }

    fn jump(&mut self, table: &HandlerTable, _position: usize, to: Successor) -> Result<()> {
        let target = Self::vip_of(table, to);
        self.block().emit(Op::Jmp, vec![Operand::imm(target, 64)]);
        self.link(table, to);
        Ok(())
    }

    fn branch(
        &mut self,
        table: &HandlerTable,
        _position: usize,
        condition: Operand,
        taken: usize,
        fallthrough: Successor,
    ) -> Result<()> {
        let taken = Successor::Handler(taken);
        let then = Self::vip_of(table, taken);
        let otherwise = Self::vip_of(table, fallthrough);

        self.block().emit(
            Op::Js,
            vec![
                condition,
                Operand::imm(then, 64),
                Operand::imm(otherwise, 64),
            ],
        );

        self.link(table, taken);
        self.link(table, fallthrough);
        Ok(())
    }

    fn ret(&mut self) -> Result<()> {
        self.emit_vexit();
        self.after_exit = true;
        Ok(())
    }

    fn pending(&self, table: &HandlerTable) -> Option<usize> {
        table.iter().position(|handler| {
            let vip = handler.address as Vip;
            self.routine.is_explored(vip) && !self.lowered.contains(&vip)
        })
    }
}
