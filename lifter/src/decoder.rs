use std::collections::HashMap;

use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic};

/// Read access to the mapped image. Implementations may return fewer bytes
/// than requested near the end of a section.
pub trait ByteSource {
    fn read(&self, address: u64, length: usize) -> Vec<u8>;
}

/// Decodes at most `limit` instructions from `bytes`, stopping after the
/// first instruction whose mnemonic is `stop` or at the first undecodable
/// byte.
pub fn decode_until(bytes: &[u8], ip: u64, stop: Mnemonic, limit: usize) -> Vec<Instruction> {
    let mut decoder = Decoder::with_ip(64, bytes, ip, DecoderOptions::NONE);

    let mut instructions = Vec::new();
    let mut instruction = Instruction::default();

    while decoder.can_decode() && instructions.len() < limit {
        decoder.decode_out(&mut instruction);

        if instruction.is_invalid() {
            break;
        }

        instructions.push(instruction);

        if instruction.mnemonic() == stop {
            break;
        }
    }

    instructions
}

#[derive(Debug, Default, Clone)]
pub struct MemoryImage {
    regions: HashMap<u64, Vec<u8>>,
}

impl MemoryImage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(&mut self, address: u64, bytes: &[u8]) {
        self.regions.insert(address, bytes.to_vec());
    }
}

impl ByteSource for MemoryImage {
    fn read(&self, address: u64, length: usize) -> Vec<u8> {
        for (base, bytes) in &self.regions {
            if address >= *base && address < base + bytes.len() as u64 {
                let start = (address - base) as usize;
                let end = (start + length).min(bytes.len());
                return bytes[start..end].to_vec();
            }
        }

        Vec::new()
    }
}
