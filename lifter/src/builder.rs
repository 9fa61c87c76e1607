use iced_x86::Mnemonic;
use logger::{debug, info};

use crate::{
    classifier::Classifier,
    config::LifterConfig,
    decoder::{decode_until, ByteSource},
    handler::{Handler, HandlerTable},
};

/// Size of the trailing next-handler pointer in every slot.
pub const DISPATCH_SIZE: usize = 4;

pub struct TableBuilder<'a, S: ByteSource> {
    source: &'a S,
    config: &'a LifterConfig,
    classifier: Classifier,
}

impl<'a, S: ByteSource> TableBuilder<'a, S> {
    pub fn new(source: &'a S, config: &'a LifterConfig) -> Self {
        let classifier = Classifier::new(config.opcode_map.clone(), config.vip_register);

        Self {
            source,
            config,
            classifier,
        }
    }

    pub fn build(&self, stream: u32) -> HandlerTable {
        let bytes = self
            .source
            .read(self.config.image_base + stream as u64, self.config.stream_limit);

        self.build_from(stream, &bytes)
    }

    /// Walks `bytes`, the bytecode found at offset `stream`, following each
    /// handler's dispatch pointer into native code to classify the next one.
    pub fn build_from(&self, stream: u32, bytes: &[u8]) -> HandlerTable {
        let mut table = HandlerTable::default();

        let Some(dispatch) = read_u32(bytes, 0) else {
            return table;
        };

        table.push(Handler::entry(stream, dispatch));

        let mut i = DISPATCH_SIZE;
        let mut previous = dispatch;

        while i < bytes.len() {
            let address = self.config.image_base + previous as u64;
            let code = self.source.read(address, self.config.handler_window);
            let instructions = decode_until(
                &code,
                address,
                Mnemonic::Jmp,
                self.config.max_handler_instructions,
            );

            let (opcode, width) = self.classifier.classify(&instructions);

            if width < DISPATCH_SIZE || i + width > bytes.len() {
                debug!(
                    "Stopped at stream offset 0x{:X} ({} width {})",
                    i, opcode, width
                );
                break;
            }

            let immediate = &bytes[i..i + width - DISPATCH_SIZE];
            let mut data = [0u8; 8];
            let length = immediate.len().min(data.len());
            data[..length].copy_from_slice(&immediate[..length]);

            let Some(next) = read_u32(bytes, i + width - DISPATCH_SIZE) else {
                break;
            };

            let handler = Handler {
                opcode,
                data: u64::from_le_bytes(data),
                address: stream.wrapping_add(i as u32),
                dispatch: next,
                width,
            };

            debug!("{:>5}  {}", table.len(), handler);

            table.push(handler);

            previous = next;
            i += width;
        }

        info!(
            "Extracted {} handlers ({} unique dispatch targets)",
            table.len(),
            table.unique_dispatch_targets()
        );

        table
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let slice = bytes.get(offset..offset + 4)?;
    Some(u32::from_le_bytes(slice.try_into().ok()?))
}
