use std::{collections::HashSet, fmt, ops::Index};

use strum_macros::{Display, EnumIter, EnumString};

use crate::error::{Error, Result};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumIter, EnumString)]
pub enum VOpcode {
    #[default]
    #[strum(serialize = "UNKNOWN")]
    Unknown,
    #[strum(serialize = "VM_INIT")]
    VmInit,
    #[strum(serialize = "VM_EXIT")]
    VmExit,
    #[strum(serialize = "POP_VR64")]
    PopVr64,
    #[strum(serialize = "POP_VR32")]
    PopVr32,
    #[strum(serialize = "PUSH_VR64")]
    PushVr64,
    #[strum(serialize = "PUSH_VR32")]
    PushVr32,
    #[strum(serialize = "PUSH_VSP")]
    PushVsp,
    #[strum(serialize = "POP_VSP")]
    PopVsp,
    #[strum(serialize = "PUSH_64")]
    Push64,
    #[strum(serialize = "PUSH_32")]
    Push32,
    #[strum(serialize = "SUB64")]
    Sub64,
    #[strum(serialize = "SUB32")]
    Sub32,
    #[strum(serialize = "ADD64")]
    Add64,
    #[strum(serialize = "ADD32")]
    Add32,
    #[strum(serialize = "WRITE32")]
    Write32,
    #[strum(serialize = "LOAD32")]
    Load32,
    #[strum(serialize = "LOAD64")]
    Load64,
    #[strum(serialize = "OR_32")]
    Or32,
    #[strum(serialize = "AND_32")]
    And32,
    #[strum(serialize = "XOR_32")]
    Xor32,
    #[strum(serialize = "JNZ")]
    Jnz,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Handler {
    pub opcode: VOpcode,
    /// Immediate payload, opcode dependent (register index, constant or
    /// branch target).
    pub data: u64,
    /// Offset of this handler's slot in the bytecode stream, relative to the
    /// image base.
    pub address: u32,
    pub dispatch: u32,
    /// Slot size in bytes, including the trailing 4-byte dispatch pointer.
    pub width: usize,
}

impl Handler {
    pub fn entry(address: u32, dispatch: u32) -> Self {
        Self {
            opcode: VOpcode::VmInit,
            data: 0,
            address,
            dispatch,
            width: 4,
        }
    }

    pub fn end(&self) -> u64 {
        self.address as u64 + self.width as u64
    }
}

impl fmt::Display for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08X}  {:<10} data: 0x{:X}, width: {}, next: 0x{:X}",
            self.address, self.opcode, self.data, self.width, self.dispatch
        )
    }
}

/// Ordered handlers of one VM routine. Index 0 is always the synthetic
/// `VM_INIT` entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerTable {
    handlers: Vec<Handler>,
}

impl HandlerTable {
    pub fn new(handlers: Vec<Handler>) -> Self {
        Self { handlers }
    }

    pub fn push(&mut self, handler: Handler) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn last(&self) -> Option<&Handler> {
        self.handlers.last()
    }

    pub fn get(&self, index: usize) -> Option<&Handler> {
        self.handlers.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Handler> {
        self.handlers.iter()
    }

    pub fn as_slice(&self) -> &[Handler] {
        &self.handlers
    }

    pub fn position_of(&self, target: u64) -> Option<usize> {
        self.handlers
            .iter()
            .position(|handler| handler.address as u64 == target)
    }

    pub fn resolve(&self, target: u64, position: usize) -> Result<usize> {
        self.position_of(target).ok_or(Error::UnresolvedBranch {
            address: target,
            position,
        })
    }

    pub fn unique_dispatch_targets(&self) -> usize {
        self.handlers
            .iter()
            .map(|handler| handler.dispatch)
            .collect::<HashSet<_>>()
            .len()
    }
}

impl Index<usize> for HandlerTable {
    type Output = Handler;

    fn index(&self, index: usize) -> &Self::Output {
        &self.handlers[index]
    }
}

impl<'a> IntoIterator for &'a HandlerTable {
    type Item = &'a Handler;
    type IntoIter = std::slice::Iter<'a, Handler>;

    fn into_iter(self) -> Self::IntoIter {
        self.handlers.iter()
    }
}

impl fmt::Display for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, handler) in self.handlers.iter().enumerate() {
            writeln!(f, "{:>5}  {}", index, handler)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use strum::IntoEnumIterator;

    use super::*;

    fn handler(opcode: VOpcode, address: u32, data: u64) -> Handler {
        Handler {
            opcode,
            data,
            address,
            dispatch: 0,
            width: 12,
        }
    }

    #[test]
    fn test_names_roundtrip() {
        for opcode in VOpcode::iter() {
            assert_eq!(VOpcode::from_str(&opcode.to_string()).unwrap(), opcode);
        }
        assert_eq!(VOpcode::PushVsp.to_string(), "PUSH_VSP");
        assert_eq!(VOpcode::Xor32.to_string(), "XOR_32");
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let table = HandlerTable::new(vec![
            Handler::entry(0x100, 0x6101),
            handler(VOpcode::Push64, 0x104, 5),
            handler(VOpcode::Push64, 0x104, 3),
            handler(VOpcode::Jnz, 0x110, 0x104),
        ]);

        let first = table.resolve(0x104, 3).unwrap();
        for _ in 0..8 {
            assert_eq!(table.resolve(0x104, 3).unwrap(), first);
        }
        assert_eq!(first, 1);
    }

    #[test]
    fn test_resolve_unknown_target() {
        let table = HandlerTable::new(vec![Handler::entry(0x100, 0x6101)]);

        let err = table.resolve(0xDEAD, 0).unwrap_err();
        assert!(matches!(
            err,
            Error::UnresolvedBranch {
                address: 0xDEAD,
                position: 0
            }
        ));
    }

    #[test]
    fn test_unique_dispatch_targets() {
        let mut table = HandlerTable::default();
        table.push(Handler::entry(0, 0x10));
        table.push(Handler {
            dispatch: 0x10,
            ..handler(VOpcode::Push64, 4, 0)
        });
        table.push(Handler {
            dispatch: 0x20,
            ..handler(VOpcode::Push64, 16, 0)
        });

        assert_eq!(table.unique_dispatch_targets(), 2);
    }
}
