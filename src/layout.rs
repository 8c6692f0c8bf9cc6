//! Message memory layout.
//!
//! A decoded message is a 16-byte header, then 32-bit words holding
//! presence bits and oneof which-words, then the hot field region. Cold
//! slots live in a lazily-allocated side region; their offsets are encoded
//! as the bit complement in a negative `data` word.

use crate::error::CompileError;
use crate::ir::IrMessage;
use crate::message::HEADER_SIZE;
use crate::table::{Card, FieldKind, NO_BIT, ONEOF_FLAG};
use crate::util::align_up;

const REGION_CAP: u64 = 1 << 31;

fn needs_presence_bit(field: &crate::ir::IrField) -> bool {
    field.card == Card::Optional
        && field.oneof.is_none()
        && !matches!(
            field.kind,
            FieldKind::Message | FieldKind::Group | FieldKind::Map
        )
}

pub(crate) fn layout_message(msg: &mut IrMessage) -> Result<(), CompileError> {
    // Presence bits in declaration order, then one which-word per oneof.
    let mut bits = 0u32;
    for field in &mut msg.fields {
        if let Some(o) = field.oneof {
            let word = o; // placed after the presence words, patched below
            field.bit = ONEOF_FLAG | word;
        } else if needs_presence_bit(field) {
            field.bit = bits;
            bits += 1;
        } else {
            field.bit = NO_BIT;
        }
    }
    let presence_words = bits.div_ceil(32);
    for field in &mut msg.fields {
        if field.bit != NO_BIT && field.bit & ONEOF_FLAG != 0 {
            field.bit = ONEOF_FLAG | (presence_words + (field.bit & !ONEOF_FLAG));
        }
    }
    msg.presence_bits = bits;
    msg.bit_words = presence_words + msg.oneof_count;

    // Storage order: hot before cold, then alignment descending; the sort is
    // stable so declaration order breaks ties.
    let mut order: Vec<u32> = (0..msg.slots.len() as u32).collect();
    order.sort_by_key(|&s| {
        let slot = &msg.slots[s as usize];
        (!slot.hot, core::cmp::Reverse(slot.align))
    });

    let mut hot = HEADER_SIZE as u64 + msg.bit_words as u64 * 4;
    let mut cold = 0u64;
    for &s in &order {
        let slot = &mut msg.slots[s as usize];
        if slot.hot {
            hot = align_up(hot as usize, slot.align as usize) as u64;
            slot.offset = hot as i32;
            hot += slot.size as u64;
        } else {
            cold = align_up(cold as usize, slot.align as usize) as u64;
            slot.offset = !(cold as i32);
            cold += slot.size as u64;
        }
        if hot >= REGION_CAP || cold >= REGION_CAP {
            return Err(CompileError::RegionOverflow {
                message: msg.full_name.clone(),
            });
        }
    }
    msg.size = align_up(hot as usize, 8) as u32;
    msg.cold_size = align_up(cold as usize, 8) as u32;

    for field in &mut msg.fields {
        field.data = msg.slots[field.slot as usize].offset;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{DescriptorPool, FieldDescriptor, Kind, MessageDescriptor};
    use crate::ir::build_message;
    use crate::profile::{FieldHints, Profile};

    fn laid_out(desc: MessageDescriptor, profile: Option<&Profile>) -> IrMessage {
        let mut pool = DescriptorPool::new();
        let idx = pool.add(desc);
        let mut ir = build_message(&pool, idx, profile, None).unwrap();
        layout_message(&mut ir).unwrap();
        ir
    }

    #[test]
    fn bits_come_before_fields_and_alignment_packs() {
        let ir = laid_out(
            MessageDescriptor::new("t.M")
                .field(FieldDescriptor::new(1, "a", Kind::Bool).optional())
                .field(FieldDescriptor::new(2, "b", Kind::Double).optional())
                .field(FieldDescriptor::new(3, "c", Kind::Int32).optional()),
            None,
        );
        assert_eq!(ir.presence_bits, 3);
        assert_eq!(ir.bit_words, 1);
        // Storage is sorted align-descending: double (8), int32 (4), bool (1).
        let base = HEADER_SIZE as i32 + 4;
        let b = &ir.fields[1];
        let c = &ir.fields[2];
        let a = &ir.fields[0];
        assert_eq!(b.data, align_up(base as usize, 8) as i32);
        assert_eq!(c.data, b.data + 8);
        assert_eq!(a.data, c.data + 4);
        assert_eq!(ir.size % 8, 0);
        assert_eq!(ir.cold_size, 0);
    }

    #[test]
    fn cold_slots_get_complement_offsets() {
        let profile = Profile::new().rule(
            "t.M.rare*",
            FieldHints {
                decode_probability: 0.0,
                ..Default::default()
            },
        );
        let ir = laid_out(
            MessageDescriptor::new("t.M")
                .field(FieldDescriptor::new(1, "rare_a", Kind::Fixed64))
                .field(FieldDescriptor::new(2, "keep", Kind::Int32))
                .field(FieldDescriptor::new(3, "rare_b", Kind::Int32)),
            Some(&profile),
        );
        assert!(ir.fields[0].data < 0);
        assert!(ir.fields[1].data > 0);
        assert!(ir.fields[2].data < 0);
        let off_a = crate::table::FieldOffset {
            data: ir.fields[0].data,
            bit: NO_BIT,
            number: 1,
        };
        assert_eq!(off_a.cold_offset(), 0);
        assert_eq!(ir.cold_size, 16); // 8 (fixed64) + 4 (int32) rounded up
    }

    #[test]
    fn oneof_which_word_follows_presence_words() {
        let ir = laid_out(
            MessageDescriptor::new("t.M")
                .oneofs(1)
                .field(FieldDescriptor::new(1, "s", Kind::String).in_oneof(0))
                .field(FieldDescriptor::new(2, "n", Kind::Int64).in_oneof(0))
                .field(FieldDescriptor::new(3, "o", Kind::Int32).optional()),
            None,
        );
        assert_eq!(ir.presence_bits, 1);
        assert_eq!(ir.bit_words, 2);
        assert_eq!(ir.fields[0].bit, ONEOF_FLAG | 1);
        assert_eq!(ir.fields[0].bit, ir.fields[1].bit);
        assert_eq!(ir.fields[0].data, ir.fields[1].data);
        assert_eq!(ir.fields[2].bit, 0);
    }
}
