#[cfg(test)]
mod tests {
    use iced_x86::{
        code_asm::{r13, rax, CodeAssembler},
        Register,
    };
    use lifter::{
        builder::TableBuilder,
        classifier::OpcodeMap,
        config::LifterConfig,
        decoder::MemoryImage,
        graph::emit::{GraphEmitter, EXIT_LABEL},
        handler::{Handler, HandlerTable, VOpcode},
        routine::{
            emit::{exit_vip, RoutineEmitter},
            BasicBlock,
        },
        semantics::{
            self,
            machine::{Machine, Step},
            SavedReg, Width,
        },
    };
    use rand::Rng;

    const IMAGE_BASE: u64 = 0x140000000;
    const STREAM: u32 = 0x1678F;
    /// Dispatch target of the last slot; nothing is mapped there.
    const TERMINAL: u32 = 0x17000;

    fn immediate_size(opcode: VOpcode) -> usize {
        match opcode {
            VOpcode::Push64 | VOpcode::Jnz => 8,
            VOpcode::Push32 => 4,
            VOpcode::PopVr64 | VOpcode::PopVr32 | VOpcode::PushVr64 | VOpcode::PushVr32 => 1,
            _ => 0,
        }
    }

    fn rva(opcode: VOpcode) -> u32 {
        let address = OpcodeMap::default().address_of(opcode).unwrap();
        (address - IMAGE_BASE) as u32
    }

    /// Stream offset of the slot of `program[index]`.
    fn slot(program: &[(VOpcode, u64)], index: usize) -> u64 {
        let skipped = program[..index]
            .iter()
            .map(|(opcode, _)| immediate_size(*opcode) + 4)
            .sum::<usize>();
        STREAM as u64 + 4 + skipped as u64
    }

    /// Maps a handler stub for every opcode the default map knows, each
    /// advancing the bytecode pointer the way the real handlers do: by
    /// `add`, or by single `inc`s for one-byte operands.
    fn map_handlers(image: &mut MemoryImage) {
        for (address, opcode) in OpcodeMap::default().iter() {
            let width = immediate_size(opcode) + 4;

            let mut asm = CodeAssembler::new(64).unwrap();
            asm.mov(rax, r13).unwrap();
            if width == 5 {
                asm.add(r13, 4).unwrap();
                asm.inc(r13).unwrap();
            } else {
                asm.add(r13, width as i32).unwrap();
            }
            asm.jmp(rax).unwrap();

            image.map(address, &asm.assemble(address).unwrap());
        }
    }

    fn encode(program: &[(VOpcode, u64)]) -> Vec<u8> {
        let first = program.first().map_or(TERMINAL, |(opcode, _)| rva(*opcode));

        let mut stream = first.to_le_bytes().to_vec();

        for (index, (opcode, data)) in program.iter().enumerate() {
            let size = immediate_size(*opcode);
            stream.extend_from_slice(&data.to_le_bytes()[..size]);

            let next = program
                .get(index + 1)
                .map_or(TERMINAL, |(opcode, _)| rva(*opcode));
            stream.extend_from_slice(&next.to_le_bytes());
        }

        stream
    }

    fn build(program: &[(VOpcode, u64)]) -> HandlerTable {
        let mut image = MemoryImage::new();
        map_handlers(&mut image);
        image.map(IMAGE_BASE + STREAM as u64, &encode(program));

        let config = LifterConfig::default();
        TableBuilder::new(&image, &config).build(STREAM)
    }

    /// A table built directly, bypassing the classifier.
    fn table(entries: &[(VOpcode, u64)]) -> HandlerTable {
        let mut table = HandlerTable::new(vec![Handler::entry(STREAM, 0)]);
        let mut address = STREAM + 4;
        for (opcode, data) in entries {
            let width = immediate_size(*opcode) + 4;
            table.push(Handler {
                opcode: *opcode,
                data: *data,
                address,
                dispatch: 0,
                width,
            });
            address += width as u32;
        }
        table
    }

    #[test]
    fn test_builder_recovers_program() {
        let program = [
            (VOpcode::Push64, 0x1122_3344_5566_7788),
            (VOpcode::PopVr64, 7),
            (VOpcode::PushVr32, 7),
            (VOpcode::Push32, 0xCAFE),
            (VOpcode::Xor32, 0),
        ];
        let table = build(&program);

        assert_eq!(table.len(), program.len() + 1);
        assert_eq!(table[0], Handler::entry(STREAM, rva(VOpcode::Push64)));

        for (index, (opcode, data)) in program.iter().enumerate() {
            let handler = &table[index + 1];
            assert_eq!(handler.opcode, *opcode, "handler {}", index + 1);
            assert_eq!(handler.data, *data, "handler {}", index + 1);
            assert_eq!(handler.address as u64, slot(&program, index));
            assert_eq!(handler.width, immediate_size(*opcode) + 4);
        }

        assert_eq!(table.last().unwrap().dispatch, TERMINAL);
    }

    #[test]
    fn test_end_to_end_loop() {
        let program = [
            (VOpcode::Push64, 5),
            (VOpcode::Push64, 3),
            (VOpcode::Add64, 0),
            (VOpcode::Jnz, slot(&[(VOpcode::Push64, 5)], 0)),
        ];
        let table = build(&program);

        let opcodes = table.iter().map(|handler| handler.opcode).collect::<Vec<_>>();
        assert_eq!(
            opcodes,
            vec![
                VOpcode::VmInit,
                VOpcode::Push64,
                VOpcode::Push64,
                VOpcode::Add64,
                VOpcode::Jnz
            ]
        );

        // Graph backend: one block per handler plus the entry and the
        // epilogue, with the loop edge and the exit edge on the JNZ block.
        let config = LifterConfig::default();
        let mut graph = GraphEmitter::new(&config);
        graph.run(&table).unwrap();
        let function = graph.function();

        assert_eq!(function.len(), 7);
        let jnz = graph.handler_block(4).unwrap();
        let head = graph.handler_block(1).unwrap();
        let exit = function.find(EXIT_LABEL).unwrap();
        assert_eq!(function.successors(jnz), vec![head, exit]);
        assert_eq!(function.block(head).name, "PUSH_64_1");

        // Routine backend: the loop head is shared and the fallthrough lands
        // on the block right after the last slot.
        let mut emitter = RoutineEmitter::new(&config);
        emitter.run(&table).unwrap();
        let routine = emitter.routine();

        let head = routine.block(table[1].address as u64).unwrap();
        assert!(head.prev.contains(&(table[4].address as u64)));
        assert_eq!(exit_vip(&table), table[4].end());
        assert!(routine.block(exit_vip(&table)).is_some());
        assert!(routine.blocks().all(BasicBlock::is_complete));

        // Concrete execution: 5 + 3 is non-zero so the flag word is clear
        // and the branch falls out of the routine.
        let mut machine = Machine::with_config(&config);
        for position in 0..4 {
            machine.step(&table, position).unwrap();
        }
        assert_eq!(machine.peek(Width::Qword, 0), 0);
        assert_eq!(machine.peek(Width::Qword, 8), 8);
        assert_eq!(machine.step(&table, 4).unwrap(), Step::Exit);
    }

    #[test]
    fn test_shared_branch_target() {
        let head = STREAM as u64 + 4;
        let program = [
            (VOpcode::Push64, 1),
            (VOpcode::Jnz, head),
            (VOpcode::Push64, 1),
            (VOpcode::Jnz, head),
        ];
        let table = build(&program);
        assert_eq!(table.len(), 5);

        let config = LifterConfig::default();

        let mut emitter = RoutineEmitter::new(&config);
        emitter.run(&table).unwrap();
        let routine = emitter.routine();

        assert_eq!(routine.len(), 6);
        let target = routine.block(head).unwrap();
        assert!(target.prev.contains(&slot(&program, 1)));
        assert!(target.prev.contains(&slot(&program, 3)));

        let mut graph = GraphEmitter::new(&config);
        graph.run(&table).unwrap();
        let function = graph.function();

        let preds = function.predecessors(graph.handler_block(1).unwrap());
        assert_eq!(
            preds,
            vec![
                graph.handler_block(0).unwrap(),
                graph.handler_block(2).unwrap(),
                graph.handler_block(4).unwrap(),
            ]
        );
    }

    #[test]
    fn test_context_survives_routine() {
        let program = [
            (VOpcode::Push64, 0x41),
            (VOpcode::PopVr64, 0),
            (VOpcode::PushVsp, 0),
            (VOpcode::PopVsp, 0),
        ];
        let table = build(&program);

        let mut machine = Machine::new(2048, 32);
        for (index, reg) in semantics::SAVE_ORDER.iter().enumerate() {
            machine.set_register(*reg, 0x1000 * (index as u64 + 1));
        }

        let steps = machine.run(&table, 100).unwrap();
        assert_eq!(steps, Some(table.len()));
        assert_eq!(machine.depth(), 0);
        assert_eq!(machine.vreg(0), 0x41);

        for (index, reg) in semantics::SAVE_ORDER.iter().enumerate() {
            assert_eq!(
                machine.register(*reg),
                0x1000 * (index as u64 + 1),
                "Failed: {} was not restored",
                reg
            );
        }
        assert_eq!(
            machine.register(SavedReg::Gpr(Register::RAX)),
            0x1000 * 16
        );
    }

    #[test]
    fn test_zero_flag_random() {
        let mut rng = rand::thread_rng();

        for round in 0..256 {
            let a = rng.gen::<u64>();
            // Every fourth round subtracts a value from itself.
            let b = if round % 4 == 0 { a } else { rng.gen::<u64>() };

            for (push, sub, width) in [
                (VOpcode::Push64, VOpcode::Sub64, Width::Qword),
                (VOpcode::Push32, VOpcode::Sub32, Width::Dword),
            ] {
                let table = table(&[(push, a), (push, b), (sub, 0), (VOpcode::PopVr64, 0)]);

                let mut machine = Machine::new(2048, 32);
                for position in 1..=3 {
                    machine.step(&table, position).unwrap();
                }

                let expected = semantics::sign_extend(width, a.wrapping_sub(b)) & width.mask();
                let flag = machine.peek(Width::Qword, 0);

                assert_eq!(
                    flag,
                    semantics::zero_flag_word(width, expected),
                    "Failed: {} 0x{:X} - 0x{:X}",
                    sub,
                    a,
                    b
                );
                assert_eq!(flag == u64::MAX, expected == 0);
                assert_eq!(machine.peek(width, 8), expected);
            }
        }
    }

    #[test]
    fn test_stack_balance_random() {
        let mut rng = rand::thread_rng();

        for opcode in [
            VOpcode::PopVr64,
            VOpcode::PopVr32,
            VOpcode::PushVr64,
            VOpcode::PushVr32,
            VOpcode::PushVsp,
            VOpcode::Push64,
            VOpcode::Push32,
            VOpcode::Sub64,
            VOpcode::Sub32,
            VOpcode::Add64,
            VOpcode::Add32,
            VOpcode::Write32,
            VOpcode::Load32,
            VOpcode::Load64,
            VOpcode::Or32,
            VOpcode::And32,
            VOpcode::Xor32,
            VOpcode::Jnz,
        ] {
            let effect = semantics::effect(opcode).unwrap();

            // Operands are pushed so that the first pop sees the first
            // listed width.
            let mut entries = effect
                .pops
                .iter()
                .rev()
                .map(|width| match width {
                    Width::Dword => (VOpcode::Push32, rng.gen::<u32>() as u64),
                    _ => (VOpcode::Push64, rng.gen::<u64>()),
                })
                .collect::<Vec<_>>();

            let data = match opcode {
                VOpcode::Jnz => STREAM as u64,
                VOpcode::PopVr64 | VOpcode::PopVr32 | VOpcode::PushVr64 | VOpcode::PushVr32 => {
                    rng.gen_range(0..32)
                }
                _ => rng.gen::<u64>(),
            };
            entries.push((opcode, data));
            entries.push((VOpcode::Push64, 0));

            let table = table(&entries);
            let under_test = entries.len() - 1;

            let mut machine = Machine::new(2048, 32);
            for position in 1..under_test {
                machine.step(&table, position).unwrap();
            }

            let before = machine.depth();
            machine.step(&table, under_test).unwrap();

            assert_eq!(
                machine.depth() - before,
                effect.delta(),
                "Failed: {} changed the stack by {} bytes",
                opcode,
                machine.depth() - before
            );
        }
    }

    #[test]
    fn test_unknown_handler_aborts_both_backends() {
        let mut image = MemoryImage::new();
        map_handlers(&mut image);

        let mut stream = encode(&[(VOpcode::Push64, 1), (VOpcode::Push64, 2)]);
        // Point the second slot's handler at an unmapped stub that still
        // advances the bytecode pointer.
        let mut asm = CodeAssembler::new(64).unwrap();
        asm.add(r13, 12).unwrap();
        asm.jmp(rax).unwrap();
        image.map(IMAGE_BASE + 0x20000, &asm.assemble(IMAGE_BASE + 0x20000).unwrap());
        stream[12..16].copy_from_slice(&0x20000u32.to_le_bytes());
        image.map(IMAGE_BASE + STREAM as u64, &stream);

        let config = LifterConfig::default();
        let table = TableBuilder::new(&image, &config).build(STREAM);
        assert_eq!(table[2].opcode, VOpcode::Unknown);

        let mut graph = GraphEmitter::new(&config);
        assert!(graph.run(&table).is_err());

        let mut emitter = RoutineEmitter::new(&config);
        assert!(emitter.run(&table).is_err());
    }
}
