use iced_x86::Register;

use crate::{
    classifier::OpcodeMap,
    error::{Error, Result},
};

pub const MIN_HANDLER_INSTRUCTIONS: usize = 50;
pub const MIN_VREG_COUNT: usize = 32;

#[derive(Debug, Clone)]
pub struct LifterConfig {
    pub image_base: u64,
    /// Native register holding the bytecode instruction pointer.
    pub vip_register: Register,
    pub handler_window: usize,
    pub max_handler_instructions: usize,
    pub stream_limit: usize,
    pub vstack_size: usize,
    pub vreg_count: usize,
    pub opcode_map: OpcodeMap,
}

impl Default for LifterConfig {
    fn default() -> Self {
        Self {
            image_base: 0x140000000,
            vip_register: Register::R13,
            handler_window: 0x100,
            max_handler_instructions: 64,
            stream_limit: 100_000,
            vstack_size: 2048,
            vreg_count: MIN_VREG_COUNT,
            opcode_map: OpcodeMap::default(),
        }
    }
}

impl LifterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_handler_instructions < MIN_HANDLER_INSTRUCTIONS {
            return Err(Error::InvalidConfig(format!(
                "handler scan limit {} is below {}",
                self.max_handler_instructions, MIN_HANDLER_INSTRUCTIONS
            )));
        }

        if self.vreg_count < MIN_VREG_COUNT {
            return Err(Error::InvalidConfig(format!(
                "register file of {} slots is below {}",
                self.vreg_count, MIN_VREG_COUNT
            )));
        }

        if self.vstack_size == 0 || self.vstack_size % 8 != 0 {
            return Err(Error::InvalidConfig(format!(
                "virtual stack size {} is not a non-zero multiple of 8",
                self.vstack_size
            )));
        }

        if !self.vip_register.is_gpr64() {
            return Err(Error::InvalidConfig(format!(
                "{:?} is not a 64-bit general purpose register",
                self.vip_register
            )));
        }

        Ok(())
    }
}
