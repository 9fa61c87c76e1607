use std::collections::HashMap;

use crate::{
    config::LifterConfig,
    error::Result,
    handler::HandlerTable,
    semantics::{self, BinOp, Flow, SavedReg, StackMachine, Width},
};

pub const STACK_BASE: u64 = 0x7FFF_0000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Execution continues at `next`; `taken` is set when a `JNZ` branched.
    Continue { next: usize, taken: bool },
    Exit,
}

#[derive(Debug, Clone)]
pub struct Machine {
    memory: HashMap<u64, u8>,
    vsp: u64,
    top: u64,
    vregs: Vec<u64>,
    registers: HashMap<SavedReg, u64>,
}

impl Machine {
    pub fn new(vstack_size: usize, vreg_count: usize) -> Self {
        let top = STACK_BASE + vstack_size as u64;

        Self {
            memory: HashMap::new(),
            vsp: top,
            top,
            vregs: vec![0; vreg_count],
            registers: HashMap::new(),
        }
    }

    pub fn with_config(config: &LifterConfig) -> Self {
        Self::new(config.vstack_size, config.vreg_count)
    }

    pub fn vsp(&self) -> u64 {
        self.vsp
    }

    pub fn depth(&self) -> i64 {
        self.top as i64 - self.vsp as i64
    }

    /// Reads a value `offset` bytes above the stack pointer without popping.
    pub fn peek(&self, width: Width, offset: u64) -> u64 {
        self.read_memory(width, self.vsp.wrapping_add(offset))
    }

    pub fn vreg(&self, index: usize) -> u64 {
        self.vregs[index]
    }

    pub fn register(&self, reg: SavedReg) -> u64 {
        self.registers.get(&reg).copied().unwrap_or(0)
    }

    pub fn set_register(&mut self, reg: SavedReg, value: u64) {
        self.registers.insert(reg, value);
    }

    pub fn read_memory(&self, width: Width, address: u64) -> u64 {
        let mut value = 0u64;
        for i in (0..width.bytes()).rev() {
            let byte = self
                .memory
                .get(&address.wrapping_add(i))
                .copied()
                .unwrap_or(0);
            value = (value << 8) | byte as u64;
        }
        value
    }

    pub fn write_memory(&mut self, width: Width, address: u64, value: u64) {
        for i in 0..width.bytes() {
            self.memory
                .insert(address.wrapping_add(i), (value >> (i * 8)) as u8);
        }
    }

    /// Executes the handler at `position`. Falling through past the last
    /// handler runs the exit epilogue.
    pub fn step(&mut self, table: &HandlerTable, position: usize) -> Result<Step> {
        let handler = &table[position];

        let (next, taken) = match semantics::lower_effect(self, handler, position)? {
            Flow::Exit => return Ok(Step::Exit),
            Flow::Next => (position + 1, false),
            Flow::Branch { condition, target } => {
                if condition != 0 {
                    (table.resolve(target, position)?, true)
                } else {
                    (position + 1, false)
                }
            }
        };

        if next >= table.len() {
            self.restore_context();
            return Ok(Step::Exit);
        }

        Ok(Step::Continue { next, taken })
    }

    /// Runs from the first handler for at most `limit` steps and returns the
    /// number of steps executed if the routine exited.
    pub fn run(&mut self, table: &HandlerTable, limit: usize) -> Result<Option<usize>> {
        let mut position = 0;

        for steps in 1..=limit {
            match self.step(table, position)? {
                Step::Exit => return Ok(Some(steps)),
                Step::Continue { next, .. } => position = next,
            }
        }

        Ok(None)
    }
}

impl StackMachine for Machine {
    type Value = u64;

    fn vreg_count(&self) -> usize {
        self.vregs.len()
    }

    fn constant(&mut self, width: Width, value: u64) -> u64 {
        value & width.mask()
    }

    fn push(&mut self, width: Width, value: u64) {
        self.vsp = self.vsp.wrapping_sub(width.bytes());
        self.write_memory(width, self.vsp, value);
    }

    fn pop(&mut self, width: Width) -> u64 {
        let value = self.read_memory(width, self.vsp);
        self.vsp = self.vsp.wrapping_add(width.bytes());
        value
    }

    fn read_vreg(&mut self, width: Width, index: usize) -> u64 {
        self.vregs[index] & width.mask()
    }

    fn write_vreg(&mut self, width: Width, index: usize, value: u64) {
        self.vregs[index] = value & width.mask();
    }

    fn read_vsp(&mut self) -> u64 {
        self.vsp
    }

    fn write_vsp(&mut self, value: u64) {
        self.vsp = value;
    }

    fn read_register(&mut self, reg: SavedReg) -> u64 {
        self.register(reg)
    }

    fn write_register(&mut self, reg: SavedReg, value: u64) {
        self.set_register(reg, value);
    }

    fn binary(&mut self, op: BinOp, width: Width, lhs: u64, rhs: u64) -> u64 {
        op.apply(width, lhs, rhs)
    }

    fn sign_extend(&mut self, from: Width, value: u64) -> u64 {
        semantics::sign_extend(from, value)
    }

    fn is_zero(&mut self, width: Width, value: u64) -> u64 {
        (value & width.mask() == 0) as u64
    }

    fn is_nonzero(&mut self, width: Width, value: u64) -> u64 {
        (value & width.mask() != 0) as u64
    }

    fn load(&mut self, width: Width, address: u64) -> u64 {
        self.read_memory(width, address)
    }

    fn store(&mut self, width: Width, address: u64, value: u64) {
        self.write_memory(width, address, value);
    }
}
