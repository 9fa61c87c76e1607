use logger::debug;

use crate::{
    error::Result,
    handler::HandlerTable,
    semantics::{self, Flow, StackMachine},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Successor {
    Handler(usize),
    /// Past the last handler; continues in the exit epilogue.
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enter {
    Lower,
    Skip,
}

/// A [`StackMachine`] that also records control flow between handlers.
pub trait Emitter: StackMachine {
    fn begin(&mut self, table: &HandlerTable) -> Result<()>;

    fn enter(&mut self, table: &HandlerTable, position: usize) -> Result<Enter>;

    fn jump(&mut self, table: &HandlerTable, position: usize, to: Successor) -> Result<()>;

    fn branch(
        &mut self,
        table: &HandlerTable,
        position: usize,
        condition: Self::Value,
        taken: usize,
        fallthrough: Successor,
    ) -> Result<()>;

    /// Terminates the current block by returning from the routine. The
    /// context has already been restored.
    fn ret(&mut self) -> Result<()>;

    /// A handler that became reachable after its turn in the linear pass.
    fn pending(&self, _table: &HandlerTable) -> Option<usize> {
        None
    }
}

pub fn lower<E: Emitter>(emitter: &mut E, table: &HandlerTable) -> Result<()> {
    if table.is_empty() {
        return Ok(());
    }

    emitter.begin(table)?;

    for position in 0..table.len() {
        lower_one(emitter, table, position)?;
    }

    while let Some(position) = emitter.pending(table) {
        lower_one(emitter, table, position)?;
    }

    Ok(())
}

fn lower_one<E: Emitter>(emitter: &mut E, table: &HandlerTable, position: usize) -> Result<()> {
    let handler = &table[position];

    if emitter.enter(table, position)? == Enter::Skip {
        debug!("Skipping {}_{}", handler.opcode, position);
        return Ok(());
    }

    let next = if position + 1 < table.len() {
        Successor::Handler(position + 1)
    } else {
        Successor::Exit
    };

    match semantics::lower_effect(emitter, handler, position)? {
        Flow::Next => match next {
            Successor::Handler(_) => emitter.jump(table, position, next),
            Successor::Exit => {
                emitter.restore_context();
                emitter.ret()
            }
        },
        Flow::Branch { condition, target } => {
            let taken = table.resolve(target, position)?;
            emitter.branch(table, position, condition, taken, next)
        }
        Flow::Exit => emitter.ret(),
    }
}
