use iced_x86::{Instruction, Mnemonic, OpKind};

use crate::error::{Error, Result};

pub const ENTRY_WINDOW: usize = 10;

/// Validates the `push imm32; jmp rel32` stub that transfers control into the
/// VM and returns the pushed bytecode offset.
pub fn parse_entry(instructions: &[Instruction]) -> Result<u32> {
    let (push, jmp) = match instructions {
        [push, jmp, ..] => (push, jmp),
        _ => {
            return Err(Error::Precondition(format!(
                "expected 2 instructions, decoded {}",
                instructions.len()
            )))
        }
    };

    let pushes_immediate = push.mnemonic() == Mnemonic::Push
        && matches!(
            push.op0_kind(),
            OpKind::Immediate8to64 | OpKind::Immediate32to64 | OpKind::Immediate32
        );

    if !pushes_immediate {
        return Err(Error::Precondition(format!(
            "expected push imm at 0x{:X}",
            push.ip()
        )));
    }

    let jumps_relative = jmp.mnemonic() == Mnemonic::Jmp
        && matches!(jmp.op0_kind(), OpKind::NearBranch64 | OpKind::NearBranch32);

    if !jumps_relative {
        return Err(Error::Precondition(format!(
            "expected relative jmp at 0x{:X}",
            jmp.ip()
        )));
    }

    Ok(push.immediate(0) as u32)
}

#[cfg(test)]
mod tests {
    use iced_x86::code_asm::{rax, CodeAssembler};

    use super::*;
    use crate::{decoder::decode_until, error::ErrorKind};

    fn decode(build: impl FnOnce(&mut CodeAssembler)) -> Vec<Instruction> {
        let mut asm = CodeAssembler::new(64).unwrap();
        build(&mut asm);
        let code = asm.assemble(0x140017A41).unwrap();
        decode_until(&code, 0x140017A41, Mnemonic::Jmp, 64)
    }

    #[test]
    fn test_push_jmp() {
        let instructions = decode(|asm| {
            asm.push(0x1678F).unwrap();
            asm.jmp(0x140016000u64).unwrap();
        });

        assert_eq!(parse_entry(&instructions).unwrap(), 0x1678F);
    }

    #[test]
    fn test_register_jmp() {
        let instructions = decode(|asm| {
            asm.push(0x1678F).unwrap();
            asm.jmp(rax).unwrap();
        });

        let err = parse_entry(&instructions).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[test]
    fn test_missing_push() {
        let instructions = decode(|asm| {
            asm.push(rax).unwrap();
            asm.jmp(0x140016000u64).unwrap();
        });

        assert!(parse_entry(&instructions).is_err());
    }

    #[test]
    fn test_empty() {
        assert_eq!(parse_entry(&[]).unwrap_err().kind(), ErrorKind::Precondition);
    }
}
