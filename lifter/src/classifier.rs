use std::{collections::HashMap, str::FromStr};

use iced_x86::{Instruction, Mnemonic, OpKind, Register};
use serde::Deserialize;

use crate::{
    error::{Error, Result},
    handler::VOpcode,
};

const DEFAULT_HANDLERS: &[(u64, VOpcode)] = &[
    (0x140016101, VOpcode::PopVr64),
    (0x14001606A, VOpcode::PushVr64),
    (0x14001620A, VOpcode::PushVsp),
    (0x140016194, VOpcode::Push64),
    (0x14001631F, VOpcode::Sub64),
    (0x14001626C, VOpcode::PopVsp),
    (0x1400162B1, VOpcode::Add64),
    (0x140016090, VOpcode::PushVr32),
    (0x140016707, VOpcode::Write32),
    (0x1400161B1, VOpcode::Push32),
    (0x14001669F, VOpcode::Load32),
    (0x140016689, VOpcode::Load64),
    (0x140016481, VOpcode::Or32),
    (0x140016413, VOpcode::And32),
    (0x1400162C9, VOpcode::Add32),
    (0x140016337, VOpcode::Sub32),
    (0x1400163A5, VOpcode::Xor32),
    (0x140016126, VOpcode::PopVr32),
    (0x14001676B, VOpcode::Jnz),
];

#[derive(Deserialize)]
struct OpcodeMapFile {
    handlers: HashMap<String, String>,
}

/// Maps native handler entry addresses to VM opcodes. The mapping is specific
/// to one compiled VM build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpcodeMap {
    map: HashMap<u64, VOpcode>,
}

impl Default for OpcodeMap {
    fn default() -> Self {
        DEFAULT_HANDLERS.iter().copied().collect()
    }
}

impl FromIterator<(u64, VOpcode)> for OpcodeMap {
    fn from_iter<I: IntoIterator<Item = (u64, VOpcode)>>(iter: I) -> Self {
        Self {
            map: iter.into_iter().collect(),
        }
    }
}

impl OpcodeMap {
    pub fn empty() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    pub fn insert(&mut self, address: u64, opcode: VOpcode) {
        self.map.insert(address, opcode);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, VOpcode)> + '_ {
        self.map.iter().map(|(address, opcode)| (*address, *opcode))
    }

    pub fn address_of(&self, opcode: VOpcode) -> Option<u64> {
        self.iter()
            .filter(|(_, candidate)| *candidate == opcode)
            .map(|(address, _)| address)
            .min()
    }

    pub fn lookup(&self, address: u64) -> VOpcode {
        self.map.get(&address).copied().unwrap_or(VOpcode::Unknown)
    }

    /// Parses a `[handlers]` table of `"0x140016101" = "POP_VR64"` entries.
    pub fn from_toml(content: &str) -> Result<Self> {
        let file: OpcodeMapFile = toml::from_str(content)
            .map_err(|e| Error::InvalidConfig(format!("failed to parse opcode map: {}", e)))?;

        let mut map = Self::empty();

        for (address, name) in file.handlers {
            let address = parse_address(&address)?;
            let opcode = VOpcode::from_str(&name)
                .map_err(|_| Error::InvalidConfig(format!("unknown opcode name '{}'", name)))?;
            map.insert(address, opcode);
        }

        Ok(map)
    }
}

pub fn parse_address(text: &str) -> Result<u64> {
    let text = text.trim();

    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse::<u64>(),
    };

    parsed.map_err(|_| Error::InvalidConfig(format!("invalid address '{}'", text)))
}

#[derive(Debug, Clone)]
pub struct Classifier {
    opcodes: OpcodeMap,
    vip: Register,
}

impl Classifier {
    /// `vip` is the native register the VM uses as its bytecode instruction
    /// pointer.
    pub fn new(opcodes: OpcodeMap, vip: Register) -> Self {
        Self { opcodes, vip }
    }

    /// Returns the opcode of the stub starting at `instructions[0]` and the
    /// total number of bytes the stub advances the bytecode pointer by.
    pub fn classify(&self, instructions: &[Instruction]) -> (VOpcode, usize) {
        let mut width: i64 = 0;

        for instruction in instructions {
            match instruction.mnemonic() {
                Mnemonic::Add if self.writes_vip(instruction) => {
                    if let Some(imm) = immediate(instruction) {
                        width += imm;
                    }
                }
                Mnemonic::Inc if self.writes_vip(instruction) => width += 1,
                Mnemonic::Jmp => break,
                _ => {}
            }
        }

        let opcode = instructions
            .first()
            .map(|first| self.opcodes.lookup(first.ip()))
            .unwrap_or(VOpcode::Unknown);

        (opcode, width.max(0) as usize)
    }

    fn writes_vip(&self, instruction: &Instruction) -> bool {
        instruction.op_count() > 0
            && instruction.op0_kind() == OpKind::Register
            && instruction.op0_register() == self.vip
    }
}

fn immediate(instruction: &Instruction) -> Option<i64> {
    if instruction.op_count() < 2 {
        return None;
    }

    match instruction.op1_kind() {
        OpKind::Immediate8
        | OpKind::Immediate16
        | OpKind::Immediate32
        | OpKind::Immediate8to16
        | OpKind::Immediate8to32
        | OpKind::Immediate8to64
        | OpKind::Immediate32to64
        | OpKind::Immediate64 => Some(instruction.immediate(1) as i64),
        _ => None,
    }
}
