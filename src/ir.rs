//! Compile-time field classification.
//!
//! Each declared (or resolver-supplied extension) field is classified into
//! an archetype by `(cardinality, kind, oneof)` and given a storage slot;
//! oneof siblings coalesce into one slot. Three views of the field list are
//! maintained: declaration order (`fields`), execution order (`exec`, hot
//! parsers before cold) and storage order (computed during layout).

use crate::descriptor::{
    Cardinality, DescriptorPool, ExtensionResolver, FieldDescriptor, Kind, MapKey, MessageIndex,
};
use crate::error::CompileError;
use crate::profile::{FieldHints, Profile};
use crate::swiss::KeyShape;
use crate::table::{Card, FieldKind};

pub(crate) const MAX_FIELD_NUMBER: u32 = 536_870_911;

#[derive(Clone, Debug)]
pub(crate) struct MapIr {
    pub key: FieldKind,
    pub key_shape: KeyShape,
    pub value: FieldKind,
    pub value_child: Option<MessageIndex>,
}

#[derive(Clone, Debug)]
pub(crate) struct IrField {
    pub name: String,
    pub number: u32,
    pub kind: FieldKind,
    pub card: Card,
    pub required: bool,
    pub packed: bool,
    pub oneof: Option<u32>,
    pub child: Option<MessageIndex>,
    pub map: Option<MapIr>,
    pub hints: FieldHints,
    pub hot: bool,
    /// Index into `IrMessage::slots`.
    pub slot: u32,
    // Resolved during layout.
    pub data: i32,
    pub bit: u32,
}

#[derive(Clone, Debug)]
pub(crate) struct IrSlot {
    pub size: u32,
    pub align: u32,
    pub hot: bool,
    pub offset: i32,
}

pub(crate) struct IrMessage {
    pub index: MessageIndex,
    pub full_name: String,
    /// t-fields: declaration order, extensions appended.
    pub fields: Vec<IrField>,
    /// p-fields: indices into `fields`, hot before cold, otherwise stable.
    pub exec: Vec<u32>,
    pub slots: Vec<IrSlot>,
    pub oneof_count: u32,
    pub discard_unknown: bool,
    pub has_required: bool,
    // Filled by layout.
    pub presence_bits: u32,
    pub bit_words: u32,
    pub size: u32,
    pub cold_size: u32,
}

fn classify(kind: &Kind) -> (FieldKind, Option<MessageIndex>) {
    match kind {
        Kind::Bool => (FieldKind::Bool, None),
        Kind::Int32 => (FieldKind::Int32, None),
        Kind::Int64 => (FieldKind::Int64, None),
        Kind::UInt32 => (FieldKind::UInt32, None),
        Kind::UInt64 => (FieldKind::UInt64, None),
        Kind::SInt32 => (FieldKind::SInt32, None),
        Kind::SInt64 => (FieldKind::SInt64, None),
        Kind::Fixed32 => (FieldKind::Fixed32, None),
        Kind::Fixed64 => (FieldKind::Fixed64, None),
        Kind::SFixed32 => (FieldKind::SFixed32, None),
        Kind::SFixed64 => (FieldKind::SFixed64, None),
        Kind::Float => (FieldKind::Float, None),
        Kind::Double => (FieldKind::Double, None),
        Kind::Enum => (FieldKind::Enum, None),
        Kind::String => (FieldKind::String, None),
        Kind::Bytes => (FieldKind::Bytes, None),
        Kind::Message(m) => (FieldKind::Message, Some(*m)),
        Kind::Group(m) => (FieldKind::Group, Some(*m)),
        Kind::Map { .. } => (FieldKind::Map, None),
    }
}

fn map_key_ir(key: MapKey) -> (FieldKind, KeyShape) {
    match key {
        MapKey::Bool => (FieldKind::Bool, KeyShape::U8),
        MapKey::Int32 => (FieldKind::Int32, KeyShape::U32),
        MapKey::Int64 => (FieldKind::Int64, KeyShape::U64),
        MapKey::UInt32 => (FieldKind::UInt32, KeyShape::U32),
        MapKey::UInt64 => (FieldKind::UInt64, KeyShape::U64),
        MapKey::SInt32 => (FieldKind::SInt32, KeyShape::U32),
        MapKey::SInt64 => (FieldKind::SInt64, KeyShape::U64),
        MapKey::Fixed32 => (FieldKind::Fixed32, KeyShape::U32),
        MapKey::Fixed64 => (FieldKind::Fixed64, KeyShape::U64),
        MapKey::SFixed32 => (FieldKind::SFixed32, KeyShape::U32),
        MapKey::SFixed64 => (FieldKind::SFixed64, KeyShape::U64),
        MapKey::String => (FieldKind::String, KeyShape::Bytes),
    }
}

/// Wire type of a singular value of this kind.
pub(crate) fn wire_type(kind: FieldKind) -> u32 {
    use crate::wire::*;
    match kind {
        FieldKind::Bool
        | FieldKind::Int32
        | FieldKind::Int64
        | FieldKind::UInt32
        | FieldKind::UInt64
        | FieldKind::SInt32
        | FieldKind::SInt64
        | FieldKind::Enum => WT_VARINT,
        FieldKind::Fixed32 | FieldKind::SFixed32 | FieldKind::Float => WT_I32,
        FieldKind::Fixed64 | FieldKind::SFixed64 | FieldKind::Double => WT_I64,
        FieldKind::String | FieldKind::Bytes | FieldKind::Message | FieldKind::Map => WT_LEN,
        FieldKind::Group => WT_SGROUP,
    }
}

/// Storage footprint of a field slot.
pub(crate) fn storage(kind: FieldKind, card: Card) -> (u32, u32) {
    if card == Card::Repeated && kind != FieldKind::Map {
        return (16, 8); // RawSlice
    }
    match kind {
        FieldKind::Map => (8, 8),               // *mut Swiss
        FieldKind::Message | FieldKind::Group => (8, 8), // *mut u8
        FieldKind::String | FieldKind::Bytes => (8, 4),  // ZcRange
        FieldKind::Bool => (1, 1),
        FieldKind::Int32
        | FieldKind::UInt32
        | FieldKind::SInt32
        | FieldKind::Fixed32
        | FieldKind::SFixed32
        | FieldKind::Float
        | FieldKind::Enum => (4, 4),
        _ => (8, 8),
    }
}

fn build_field(
    owner: &str,
    desc: &FieldDescriptor,
    pool: &DescriptorPool,
    profile: Option<&Profile>,
) -> Result<IrField, CompileError> {
    if desc.number == 0 || desc.number > MAX_FIELD_NUMBER {
        return Err(CompileError::InvalidFieldNumber {
            message: owner.to_string(),
            number: desc.number,
        });
    }
    let (kind, child) = classify(&desc.kind);
    let map = if let Kind::Map { key, value } = &desc.kind {
        let (vkind, vchild) = classify(value);
        if matches!(**value, Kind::Map { .. } | Kind::Group(_)) {
            return Err(CompileError::InvalidMapKey {
                message: owner.to_string(),
                number: desc.number,
            });
        }
        let (kkind, kshape) = map_key_ir(*key);
        Some(MapIr {
            key: kkind,
            key_shape: kshape,
            value: vkind,
            value_child: vchild,
        })
    } else {
        None
    };
    let child = child.or_else(|| map.as_ref().and_then(|m| m.value_child));
    if let Some(c) = child {
        if pool.get(c).is_none() {
            return Err(CompileError::UnresolvedType {
                message: owner.to_string(),
                field: desc.number,
            });
        }
    }
    let card = match desc.cardinality {
        Cardinality::Implicit => Card::Implicit,
        Cardinality::Optional | Cardinality::Required => Card::Optional,
        Cardinality::Repeated => Card::Repeated,
    };
    let full = format!("{owner}.{}", desc.name);
    let hints = profile.map(|p| p.lookup(&full)).unwrap_or_default();
    Ok(IrField {
        name: desc.name.clone(),
        number: desc.number,
        kind,
        card,
        required: desc.cardinality == Cardinality::Required,
        packed: desc.is_packed(),
        oneof: desc.oneof,
        child,
        map,
        hints,
        hot: hints.decode_probability >= 0.5,
        slot: 0,
        data: 0,
        bit: crate::table::NO_BIT,
    })
}

pub(crate) fn build_message(
    pool: &DescriptorPool,
    index: MessageIndex,
    profile: Option<&Profile>,
    resolver: Option<&dyn ExtensionResolver>,
) -> Result<IrMessage, CompileError> {
    let desc = pool.get(index).expect("reachable message");
    let mut fields = Vec::with_capacity(desc.fields.len());
    let mut seen = std::collections::HashSet::new();
    for f in &desc.fields {
        if !seen.insert(f.number) {
            return Err(CompileError::DuplicateFieldNumber {
                message: desc.full_name.clone(),
                number: f.number,
            });
        }
        fields.push(build_field(&desc.full_name, f, pool, profile)?);
    }
    // Extensions follow declared fields; on a number tie the declaration
    // (and earlier resolver entries) win.
    if let Some(resolver) = resolver {
        for ext in resolver.extensions_of(&desc.full_name) {
            if !seen.insert(ext.number) {
                continue;
            }
            fields.push(build_field(&desc.full_name, &ext, pool, profile)?);
        }
    }

    // One slot per field, oneof siblings coalesced to the widest member.
    let mut slots: Vec<IrSlot> = Vec::new();
    let mut oneof_slot = std::collections::HashMap::<u32, u32>::new();
    let mut oneof_prob = std::collections::HashMap::<u32, (f32, u32)>::new();
    for field in &mut fields {
        let (size, align) = storage(field.kind, field.card);
        match field.oneof {
            Some(o) => {
                let slot = *oneof_slot.entry(o).or_insert_with(|| {
                    slots.push(IrSlot {
                        size: 0,
                        align: 1,
                        hot: true,
                        offset: 0,
                    });
                    slots.len() as u32 - 1
                });
                let s = &mut slots[slot as usize];
                s.size = s.size.max(size);
                s.align = s.align.max(align);
                let e = oneof_prob.entry(o).or_insert((0.0, 0));
                e.0 += field.hints.decode_probability;
                e.1 += 1;
                field.slot = slot;
            }
            None => {
                slots.push(IrSlot {
                    size,
                    align,
                    hot: field.hot,
                    offset: 0,
                });
                field.slot = slots.len() as u32 - 1;
            }
        }
    }
    // Oneof slots are hot when the per-variant mean probability is >= 0.5.
    for (o, (sum, n)) in &oneof_prob {
        let slot = oneof_slot[o];
        slots[slot as usize].hot = sum / *n as f32 >= 0.5;
    }
    // A field is parsed hot iff its slot is hot.
    for field in &mut fields {
        field.hot = slots[field.slot as usize].hot;
    }

    let mut exec: Vec<u32> = (0..fields.len() as u32)
        .filter(|&i| fields[i as usize].hot)
        .collect();
    exec.extend((0..fields.len() as u32).filter(|&i| !fields[i as usize].hot));

    let has_required = fields.iter().any(|f| f.required);
    Ok(IrMessage {
        index,
        full_name: desc.full_name.clone(),
        fields,
        exec,
        slots,
        oneof_count: desc.oneof_count,
        discard_unknown: desc.discard_unknown,
        has_required,
        presence_bits: 0,
        bit_words: 0,
        size: 0,
        cold_size: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::MessageDescriptor;

    fn pool_with(desc: MessageDescriptor) -> (DescriptorPool, MessageIndex) {
        let mut pool = DescriptorPool::new();
        let idx = pool.add(desc);
        (pool, idx)
    }

    #[test]
    fn oneof_members_share_a_slot() {
        let (pool, idx) = pool_with(
            MessageDescriptor::new("t.M")
                .oneofs(1)
                .field(FieldDescriptor::new(1, "a", Kind::Int32).in_oneof(0))
                .field(FieldDescriptor::new(2, "b", Kind::Double).in_oneof(0))
                .field(FieldDescriptor::new(3, "c", Kind::Bool)),
        );
        let ir = build_message(&pool, idx, None, None).unwrap();
        assert_eq!(ir.slots.len(), 2);
        assert_eq!(ir.fields[0].slot, ir.fields[1].slot);
        let oneof_slot = &ir.slots[ir.fields[0].slot as usize];
        assert_eq!(oneof_slot.size, 8);
        assert_eq!(oneof_slot.align, 8);
    }

    #[test]
    fn cold_fields_parse_after_hot() {
        let profile = Profile::new().rule(
            "t.M.rare",
            FieldHints {
                decode_probability: 0.01,
                ..Default::default()
            },
        );
        let (pool, idx) = pool_with(
            MessageDescriptor::new("t.M")
                .field(FieldDescriptor::new(1, "rare", Kind::Int32))
                .field(FieldDescriptor::new(2, "common", Kind::Int32)),
        );
        let ir = build_message(&pool, idx, Some(&profile), None).unwrap();
        assert!(!ir.fields[0].hot);
        assert!(ir.fields[1].hot);
        assert_eq!(ir.exec, vec![1, 0]);
    }

    #[test]
    fn duplicate_numbers_rejected() {
        let (pool, idx) = pool_with(
            MessageDescriptor::new("t.M")
                .field(FieldDescriptor::new(1, "a", Kind::Int32))
                .field(FieldDescriptor::new(1, "b", Kind::Int32)),
        );
        assert!(matches!(
            build_message(&pool, idx, None, None),
            Err(CompileError::DuplicateFieldNumber { number: 1, .. })
        ));
    }

    #[test]
    fn extension_ties_defer_to_declaration() {
        struct Exts;
        impl ExtensionResolver for Exts {
            fn extensions_of(&self, full_name: &str) -> Vec<FieldDescriptor> {
                assert_eq!(full_name, "t.M");
                vec![
                    FieldDescriptor::new(1, "clash", Kind::Int64),
                    FieldDescriptor::new(100, "ext", Kind::String),
                ]
            }
        }
        let (pool, idx) = pool_with(
            MessageDescriptor::new("t.M").field(FieldDescriptor::new(1, "a", Kind::Int32)),
        );
        let ir = build_message(&pool, idx, None, Some(&Exts)).unwrap();
        assert_eq!(ir.fields.len(), 2);
        assert_eq!(ir.fields[0].kind, FieldKind::Int32);
        assert_eq!(ir.fields[1].number, 100);
    }
}
