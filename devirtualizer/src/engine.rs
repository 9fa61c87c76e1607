use std::path::Path;

use exe::{Arch, Buffer, PETranslation, VecPE, PE, RVA};
use iced_x86::Mnemonic;
use lifter::{
    builder::TableBuilder,
    config::LifterConfig,
    decoder::{decode_until, ByteSource},
    entry::{parse_entry, ENTRY_WINDOW},
    error::{Error, Result},
    graph::{emit::GraphEmitter, Module},
    handler::HandlerTable,
    routine::{emit::RoutineEmitter, Routine},
};
use logger::{debug, info};

pub struct Image {
    pe: VecPE,
    image_base: u64,
}

impl Image {
    pub fn load(filename: &Path) -> Result<Self> {
        let pe = VecPE::from_disk_file(filename).map_err(|err| {
            Error::Precondition(format!("couldn't load '{}': {:?}", filename.display(), err))
        })?;

        match pe.get_arch() {
            Ok(Arch::X64) => {}
            _ => {
                return Err(Error::Precondition(
                    "only 64-bit binaries are supported".to_string(),
                ))
            }
        }

        let image_base = pe
            .get_image_base()
            .map_err(|err| Error::Precondition(format!("couldn't read image base: {:?}", err)))?;

        info!(
            "Loaded 64-bit binary ({:.2} MB, image base 0x{:X})",
            pe.len() as f64 / 1_000_000.0,
            image_base
        );

        Ok(Self { pe, image_base })
    }

    pub fn image_base(&self) -> u64 {
        self.image_base
    }
}

impl ByteSource for Image {
    fn read(&self, address: u64, length: usize) -> Vec<u8> {
        let Some(rva) = address.checked_sub(self.image_base) else {
            return Vec::new();
        };

        let Ok(offset) = self.pe.translate(PETranslation::Memory(RVA(rva as u32))) else {
            return Vec::new();
        };

        let available = self.pe.len().saturating_sub(offset);

        self.pe
            .get_slice_ref::<u8>(offset, length.min(available))
            .map(|bytes| bytes.to_vec())
            .unwrap_or_default()
    }
}

pub struct Lifted {
    pub table: HandlerTable,
    pub module: Module,
    pub routine: Routine,
}

pub struct Engine {
    image: Image,
    config: LifterConfig,
}

impl Engine {
    pub fn new(image: Image, config: LifterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { image, config })
    }

    /// Follows the entry stub at `routine` into the VM and lifts the
    /// bytecode it runs through both backends.
    pub fn lift(&self, routine: u64) -> Result<Lifted> {
        let code = self.image.read(routine, ENTRY_WINDOW);
        let instructions = decode_until(&code, routine, Mnemonic::Jmp, 2);
        let stream = parse_entry(&instructions)?;

        info!(
            "Routine 0x{:X} enters the VM with bytecode at 0x{:X}",
            routine,
            self.config.image_base + stream as u64
        );

        let table = TableBuilder::new(&self.image, &self.config).build(stream);

        if table.is_empty() {
            return Err(Error::Precondition(format!(
                "no bytecode at offset 0x{:X}",
                stream
            )));
        }

        if logger::is_verbose() {
            print!("{}", table);
        }

        let mut graph = GraphEmitter::new(&self.config);
        graph.run(&table)?;

        let mut emitter = RoutineEmitter::new(&self.config);
        emitter.run(&table)?;

        debug!("{}", emitter.routine());

        Ok(Lifted {
            table,
            module: graph.into_module(),
            routine: emitter.into_routine(),
        })
    }
}
