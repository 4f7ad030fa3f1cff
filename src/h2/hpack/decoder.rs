//! Field block decoding.
use bytes::{Buf, Bytes};

use super::integer;
use super::table::{DynamicTable, Field};
use super::HpackError;

use HpackError as E;

/// Stateful decoder, one per connection.
#[derive(Debug)]
pub(crate) struct Decoder {
    table: DynamicTable,
    /// Cap on dynamic table resizes, our SETTINGS_HEADER_TABLE_SIZE.
    max_size: usize,
}

impl Decoder {
    pub(crate) fn new(max_size: usize) -> Self {
        Self {
            table: DynamicTable::new(max_size),
            max_size,
        }
    }

    /// Decodes a complete field block into `(name, value)` pairs.
    pub(crate) fn decode_block(
        &mut self,
        mut block: Bytes,
    ) -> Result<Vec<(Bytes, Bytes)>, HpackError> {
        let mut fields = Vec::with_capacity(16);
        let mut can_resize = true;

        while block.has_remaining() {
            let prefix = block.get_u8();

            // 001xxxxx: dynamic table size update, only before the first
            // field of a block
            if prefix & 0b1110_0000 == 0b0010_0000 {
                if !can_resize {
                    return Err(E::SizeUpdate);
                }
                let size = integer::decode(prefix, 31, &mut block)?;
                if size > self.max_size {
                    return Err(E::SizeUpdate);
                }
                self.table.resize(size);
                continue;
            }
            can_resize = false;

            // 1xxxxxxx: indexed field
            if prefix & 0b1000_0000 != 0 {
                let index = integer::decode(prefix, 127, &mut block)?;
                let field = self.table.get(index)?;
                fields.push((field.name, field.value));
                continue;
            }

            // 01xxxxxx: literal with incremental indexing
            // 0000xxxx: literal without indexing
            // 0001xxxx: literal never indexed
            let (indexed, name_index) = if prefix & 0b0100_0000 != 0 {
                (true, integer::decode(prefix, 63, &mut block)?)
            } else {
                (false, integer::decode(prefix, 15, &mut block)?)
            };

            let name = match name_index {
                0 => integer::decode_string(&mut block)?,
                index => self.table.get(index)?.name,
            };
            let value = integer::decode_string(&mut block)?;

            if indexed {
                self.table.insert(Field::new(name.clone(), value.clone()));
            }
            fields.push((name, value));
        }

        Ok(fields)
    }
}

// ===== Test =====
