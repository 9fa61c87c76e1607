use thiserror::Error;

use crate::handler::VOpcode;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Precondition,
    UnresolvedBranch,
    UnknownOpcode,
    InternalInvariant,
    Config,
    Io,
}

/// Every lifting failure is fatal: lowering stops at the first one and no
/// partial output is produced.
#[derive(Debug, Error)]
pub enum Error {
    #[error("vm entry precondition failed: {0}")]
    Precondition(String),

    #[error("couldn't resolve jnz target 0x{address:X} (handler {position})")]
    UnresolvedBranch { address: u64, position: usize },

    #[error("encountered an unknown opcode at 0x{address:X} (handler {position})")]
    UnknownOpcode { address: u32, position: usize },

    #[error("block is not created for {opcode}:{position}")]
    MissingBlock { opcode: VOpcode, position: usize },

    #[error("virtual register {index} is out of range (handler {position})")]
    VirtualRegisterOutOfRange { index: u64, position: usize },

    #[error("malformed output: {0}")]
    Malformed(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Precondition(_) => ErrorKind::Precondition,
            Error::UnresolvedBranch { .. } => ErrorKind::UnresolvedBranch,
            Error::UnknownOpcode { .. } => ErrorKind::UnknownOpcode,
            Error::MissingBlock { .. }
            | Error::VirtualRegisterOutOfRange { .. }
            | Error::Malformed(_) => ErrorKind::InternalInvariant,
            Error::InvalidConfig(_) => ErrorKind::Config,
            Error::Io(_) => ErrorKind::Io,
        }
    }
}
