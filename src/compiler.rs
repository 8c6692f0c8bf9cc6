//! Descriptor-to-image compilation.
//!
//! Two phases, because descriptor graphs may be cyclic: first gather every
//! message reachable from the root, classify and lay it out, and allocate
//! one symbol per record; only then emit record bytes, leaving every
//! cross-record reference to the linker's relocation pass. Names are
//! interned into a string blob inside the image so the library outlives the
//! descriptor pool that produced it.

use std::collections::HashMap;

use crate::arena::Arena;
use crate::descriptor::{DescriptorPool, ExtensionResolver, MessageIndex};
use crate::error::CompileError;
use crate::ir::{self, IrMessage};
use crate::layout;
use crate::linker::{Image, Linker, RelocKind, SymbolId};
use crate::message::HEADER_SIZE;
use crate::profile::Profile;
use crate::scc;
use crate::swiss::{KeyShape, Swiss, hash_bytes};
use crate::table::{
    Field, FieldKind, FieldOffset, MapInfo, NO_COLD, NameRef, TYPE_CONTAINS_REQUIRED,
    TYPE_DISCARD_UNKNOWN, TagLut, Type, TypeParser,
};
use crate::thunks;

/// Base of all deterministic per-instance hash seeds ("protovm1").
const SEED_BASE: u64 = 0x7072_6f74_6f76_6d31;

pub(crate) struct Compiled {
    pub image: Image,
    pub root_type_off: u32,
    /// `(full_name, Type offset)` for every compiled message.
    pub types: Vec<(String, u32)>,
}

struct MsgSyms {
    ty: SymbolId,
    tp: SymbolId,
    parsers: SymbolId,
    fields: SymbolId,
    index: SymbolId,
    dispatch: SymbolId,
    empty: SymbolId,
    /// Per map field (t-order index) a `MapInfo` symbol.
    maps: Vec<(u32, SymbolId)>,
}

pub(crate) fn compile(
    pool: &DescriptorPool,
    root: MessageIndex,
    profile: Option<&Profile>,
    resolver: Option<&dyn ExtensionResolver>,
    arena: &mut Arena,
) -> Result<Compiled, CompileError> {
    if pool.get(root).is_none() {
        return Err(CompileError::UnknownRoot);
    }

    // Phase 1a: gather reachable messages in first-visit order.
    let mut local_of = HashMap::<MessageIndex, u32>::new();
    let mut messages: Vec<IrMessage> = Vec::new();
    let mut work = vec![root];
    local_of.insert(root, 0);
    while let Some(idx) = work.pop() {
        let ir = ir::build_message(pool, idx, profile, resolver)?;
        for field in &ir.fields {
            if let Some(child) = field.child {
                if !local_of.contains_key(&child) {
                    local_of.insert(child, (messages.len() + work.len() + 1) as u32);
                    work.push(child);
                }
            }
        }
        messages.push(ir);
    }
    // The worklist is a stack, so recompute local ids from the final order.
    local_of.clear();
    for (i, m) in messages.iter().enumerate() {
        local_of.insert(m.index, i as u32);
    }

    // Phase 1b: required-field analysis over the condensed graph.
    let adjacency: Vec<Vec<u32>> = messages
        .iter()
        .map(|m| {
            let mut edges: Vec<u32> = m
                .fields
                .iter()
                .filter_map(|f| f.child.map(|c| local_of[&c]))
                .collect();
            edges.sort_unstable();
            edges.dedup();
            edges
        })
        .collect();
    let has_required: Vec<bool> = messages.iter().map(|m| m.has_required).collect();
    let scc_info = scc::condense(&adjacency, &has_required);

    // Phase 1c: storage layout.
    for msg in &mut messages {
        layout::layout_message(msg)?;
    }

    // Phase 2: symbol allocation, then emission.
    let mut linker = Linker::new();
    let names = linker.symbol(1);
    let syms: Vec<MsgSyms> = messages
        .iter()
        .map(|m| MsgSyms {
            ty: linker.symbol(4),
            tp: linker.symbol(8),
            parsers: linker.symbol(8),
            fields: linker.symbol(4),
            index: linker.symbol(8),
            dispatch: linker.symbol(8),
            empty: linker.symbol(8),
            maps: m
                .fields
                .iter()
                .enumerate()
                .filter(|(_, f)| f.kind == FieldKind::Map)
                .map(|(i, _)| (i as u32, linker.symbol(8)))
                .collect(),
        })
        .collect();

    let mut intern = |linker: &mut Linker, s: &str| -> (u32, u32) {
        let off = linker.push_bytes(names, s.as_bytes());
        (off, s.len() as u32)
    };

    for (i, msg) in messages.iter().enumerate() {
        let ms = &syms[i];
        let type_seed = hash_bytes(SEED_BASE, msg.full_name.as_bytes());
        let (name_off, name_len) = intern(&mut linker, &msg.full_name);
        let field_names: Vec<(u32, u32)> = msg
            .fields
            .iter()
            .map(|f| intern(&mut linker, &f.name))
            .collect();

        emit_map_infos(&mut linker, msg, ms, &syms, &local_of, type_seed);
        emit_fields(&mut linker, msg, ms, &syms, &local_of, &field_names, names);
        emit_index(&mut linker, msg, ms, type_seed);
        let parser_plans = emit_parsers(&mut linker, msg, ms, &syms, &local_of);
        emit_dispatch(&mut linker, ms, &parser_plans, type_seed);
        emit_type_parser(&mut linker, ms, &parser_plans);
        emit_type(
            &mut linker,
            msg,
            ms,
            scc_info.contains_required(i as u32),
            NameRef {
                off: name_off,
                len: name_len,
            },
            names,
        );
        emit_empty(&mut linker, msg, ms);
    }

    let image = linker.link(arena);
    let types = messages
        .iter()
        .zip(&syms)
        .map(|(m, s)| (m.full_name.clone(), image.offsets[s.ty.0 as usize]))
        .collect();
    let root_type_off = image.offsets[syms[0].ty.0 as usize];
    Ok(Compiled {
        image,
        root_type_off,
        types,
    })
}

fn map_key_tag(kind: FieldKind) -> u32 {
    1 << 3 | ir::wire_type(kind)
}

fn map_val_tag(kind: FieldKind) -> u32 {
    2 << 3 | ir::wire_type(kind)
}

fn emit_map_infos(
    linker: &mut Linker,
    msg: &IrMessage,
    ms: &MsgSyms,
    syms: &[MsgSyms],
    local_of: &HashMap<MessageIndex, u32>,
    type_seed: u64,
) {
    for &(field_idx, sym) in &ms.maps {
        let field = &msg.fields[field_idx as usize];
        let map = field.map.as_ref().expect("map field");
        let info = MapInfo {
            key_shape: map.key_shape as u8,
            key_kind: map.key as u8,
            val_kind: map.value as u8,
            _pad: 0,
            key_tag: map_key_tag(map.key),
            val_tag: map_val_tag(map.value),
            val_type: 0,
            seed: crate::swiss::hash_word(type_seed, field.number as u64),
        };
        let at = linker.push_record(sym, &info);
        if let Some(child) = map.value_child {
            let child_sym = syms[local_of[&child] as usize].ty;
            linker.reloc(
                sym,
                at + core::mem::offset_of!(MapInfo, val_type) as u32,
                child_sym,
                0,
                RelocKind::Rel32,
            );
        }
    }
}

fn field_offset_of(field: &crate::ir::IrField) -> FieldOffset {
    FieldOffset {
        data: field.data,
        bit: field.bit,
        number: field.number,
    }
}

fn emit_fields(
    linker: &mut Linker,
    msg: &IrMessage,
    ms: &MsgSyms,
    syms: &[MsgSyms],
    local_of: &HashMap<MessageIndex, u32>,
    field_names: &[(u32, u32)],
    names: SymbolId,
) {
    use crate::table::{FIELD_ONEOF, FIELD_PACKED, FIELD_REQUIRED, FIELD_VALIDATE_UTF8};
    for (i, field) in msg.fields.iter().enumerate() {
        let mut flags = 0u16;
        if field.kind == FieldKind::String && !field.hints.assume_utf8 {
            flags |= FIELD_VALIDATE_UTF8;
        }
        if field.packed {
            flags |= FIELD_PACKED;
        }
        if field.required {
            flags |= FIELD_REQUIRED;
        }
        if field.oneof.is_some() {
            flags |= FIELD_ONEOF;
        }
        let record = Field {
            offset: field_offset_of(field),
            kind: field.kind as u8,
            card: field.card as u8,
            flags,
            name: NameRef {
                off: 0,
                len: field_names[i].1,
            },
            aux: 0,
        };
        let at = linker.push_record(ms.fields, &record);
        linker.reloc(
            ms.fields,
            at + core::mem::offset_of!(Field, name) as u32,
            names,
            field_names[i].0,
            RelocKind::Rel32,
        );
        let aux_at = at + core::mem::offset_of!(Field, aux) as u32;
        match field.kind {
            FieldKind::Message | FieldKind::Group => {
                let child = syms[local_of[&field.child.expect("message child")] as usize].ty;
                linker.reloc(ms.fields, aux_at, child, 0, RelocKind::Rel32);
            }
            FieldKind::Map => {
                let (_, info_sym) = ms
                    .maps
                    .iter()
                    .find(|(idx, _)| *idx == i as u32)
                    .expect("map info symbol");
                linker.reloc(ms.fields, aux_at, *info_sym, 0, RelocKind::Rel32);
            }
            _ => {}
        }
    }
    // Trailing sentinel.
    let sentinel: Field = unsafe { core::mem::zeroed() };
    linker.push_record(ms.fields, &sentinel);
}

fn emit_index(linker: &mut Linker, msg: &IrMessage, ms: &MsgSyms, type_seed: u64) {
    let entries: Vec<(u64, u64)> = msg
        .fields
        .iter()
        .enumerate()
        .map(|(i, f)| (f.number as u64, i as u64))
        .collect();
    let bytes = Swiss::build_image(&entries, KeyShape::U32, 4, type_seed);
    linker.push_bytes(ms.index, &bytes);
}

struct ParserPlan {
    tag: u32,
}

fn emit_parsers(
    linker: &mut Linker,
    msg: &IrMessage,
    ms: &MsgSyms,
    syms: &[MsgSyms],
    local_of: &HashMap<MessageIndex, u32>,
) -> Vec<ParserPlan> {
    use crate::table::FieldParser;
    let rec_size = core::mem::size_of::<FieldParser>() as u32;

    // Dense record list in execution order: hot fields first, expected
    // encoding of each field first.
    let mut plans: Vec<(u32, thunks::Plan)> = Vec::new();
    for &fi in &msg.exec {
        for p in thunks::plan(&msg.fields[fi as usize]) {
            plans.push((fi, p));
        }
    }
    let count = plans.len() as u32;
    linker.reserve(ms.parsers, plans.len() * rec_size as usize);
    let hot_count = plans
        .iter()
        .filter(|(fi, _)| msg.fields[*fi as usize].hot)
        .count() as u32;

    // Oneof siblings count as one dispatch target for NextOk purposes.
    let group_key = |fi: u32| {
        let f = &msg.fields[fi as usize];
        match f.oneof {
            Some(o) => (1u32, o),
            None => (0u32, f.number),
        }
    };

    for (i, (fi, p)) in plans.iter().enumerate() {
        let field = &msg.fields[*fi as usize];
        let next_ok = if (i as u32) < hot_count {
            // First hot parser of a different field or oneof, wrapping.
            let mut found = i as u32;
            for step in 1..hot_count.max(1) {
                let j = (i as u32 + step) % hot_count;
                if group_key(plans[j as usize].0) != group_key(*fi) {
                    found = j;
                    break;
                }
            }
            found
        } else {
            0
        };
        let next_err = (i as u32 + 1) % count.max(1);

        let record = FieldParser {
            tag: p.tag,
            offset: field_offset_of(field),
            preload: field.hints.expected_count,
            flags: p.flags,
            next_ok: 0,
            next_err: 0,
            aux: 0,
            _pad: 0,
            thunk: p.thunk as usize,
        };
        let at = linker.push_record(ms.parsers, &record);
        linker.reloc(
            ms.parsers,
            at + core::mem::offset_of!(FieldParser, next_ok) as u32,
            ms.parsers,
            next_ok * rec_size,
            RelocKind::Rel32,
        );
        linker.reloc(
            ms.parsers,
            at + core::mem::offset_of!(FieldParser, next_err) as u32,
            ms.parsers,
            next_err * rec_size,
            RelocKind::Rel32,
        );
        let aux_at = at + core::mem::offset_of!(FieldParser, aux) as u32;
        match field.kind {
            FieldKind::Message | FieldKind::Group => {
                let child = syms[local_of[&field.child.expect("message child")] as usize].tp;
                linker.reloc(ms.parsers, aux_at, child, 0, RelocKind::Rel32);
            }
            FieldKind::Map => {
                let (_, info_sym) = ms
                    .maps
                    .iter()
                    .find(|(idx, _)| *idx == *fi)
                    .expect("map info symbol");
                linker.reloc(ms.parsers, aux_at, *info_sym, 0, RelocKind::Rel32);
            }
            _ => {}
        }
    }

    plans
        .iter()
        .map(|(_, p)| ParserPlan { tag: p.tag })
        .collect()
}

fn emit_dispatch(linker: &mut Linker, ms: &MsgSyms, plans: &[ParserPlan], type_seed: u64) {
    let entries: Vec<(u64, u64)> = plans
        .iter()
        .enumerate()
        .map(|(i, p)| (p.tag as u64, i as u64))
        .collect();
    let bytes = Swiss::build_image(
        &entries,
        KeyShape::U32,
        4,
        type_seed.rotate_left(32),
    );
    linker.push_bytes(ms.dispatch, &bytes);
}

fn emit_type_parser(linker: &mut Linker, ms: &MsgSyms, plans: &[ParserPlan]) {
    let mut lut = TagLut::EMPTY;
    // Reverse order so the earliest (hottest) record wins a tag byte.
    for (i, p) in plans.iter().enumerate().rev() {
        if p.tag < 128 && i < 255 {
            lut.0[p.tag as usize] = i as u8 + 1;
        }
    }
    let record = TypeParser {
        type_off: 0,
        entry: 0,
        parsers: 0,
        parser_count: plans.len() as u32,
        dispatch: 0,
        _pad: 0,
        tag_lut: lut,
    };
    let at = linker.push_record(ms.tp, &record);
    linker.reloc(
        ms.tp,
        at + core::mem::offset_of!(TypeParser, type_off) as u32,
        ms.ty,
        0,
        RelocKind::Rel32,
    );
    if !plans.is_empty() {
        linker.reloc(
            ms.tp,
            at + core::mem::offset_of!(TypeParser, entry) as u32,
            ms.parsers,
            0,
            RelocKind::Rel32,
        );
        linker.reloc(
            ms.tp,
            at + core::mem::offset_of!(TypeParser, parsers) as u32,
            ms.parsers,
            0,
            RelocKind::Rel32,
        );
    }
    linker.reloc(
        ms.tp,
        at + core::mem::offset_of!(TypeParser, dispatch) as u32,
        ms.dispatch,
        0,
        RelocKind::Rel32,
    );
}

fn emit_type(
    linker: &mut Linker,
    msg: &IrMessage,
    ms: &MsgSyms,
    contains_required: bool,
    name: NameRef,
    names: SymbolId,
) {
    let mut flags = 0u32;
    if contains_required {
        flags |= TYPE_CONTAINS_REQUIRED;
    }
    if msg.discard_unknown {
        flags |= TYPE_DISCARD_UNKNOWN;
    }
    let mut num_lut = TagLut::EMPTY;
    for (i, f) in msg.fields.iter().enumerate().rev() {
        if f.number < 128 && i < 255 {
            num_lut.0[f.number as usize] = i as u8 + 1;
        }
    }
    let record = Type {
        size: msg.size,
        cold_size: msg.cold_size,
        parser: 0,
        fields: 0,
        field_count: msg.fields.len() as u32,
        index: 0,
        empty: 0,
        flags,
        name: NameRef { off: 0, len: name.len },
        num_lut,
    };
    let at = linker.push_record(ms.ty, &record);
    for (field, target, addend) in [
        (core::mem::offset_of!(Type, parser), ms.tp, 0u32),
        (core::mem::offset_of!(Type, fields), ms.fields, 0),
        (core::mem::offset_of!(Type, index), ms.index, 0),
        (core::mem::offset_of!(Type, empty), ms.empty, 0),
        (core::mem::offset_of!(Type, name), names, name.off),
    ] {
        linker.reloc(ms.ty, at + field as u32, target, addend, RelocKind::Rel32);
    }
}

fn emit_empty(linker: &mut Linker, msg: &IrMessage, ms: &MsgSyms) {
    use crate::message::MessageHeader;
    let at = linker.push_bytes(ms.empty, &vec![0u8; msg.size as usize]);
    debug_assert!(msg.size as usize >= HEADER_SIZE);
    linker.reloc(
        ms.empty,
        at + core::mem::offset_of!(MessageHeader, type_off) as u32,
        ms.ty,
        0,
        RelocKind::Rel32,
    );
    linker.write_at(
        ms.empty,
        at + core::mem::offset_of!(MessageHeader, cold_index) as u32,
        &NO_COLD.to_le_bytes(),
    );
}
