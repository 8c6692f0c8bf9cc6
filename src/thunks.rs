//! Per-archetype parse thunks.
//!
//! One small function per (cardinality, kind) combination, all with the
//! uniform [`ThunkFn`] signature. A thunk parses exactly one wire record at
//! the cursor, advances past it, and writes the decoded value into the slot
//! addressed by its `FieldParser` record, setting the presence bit or oneof
//! which-word on the way. Frame-stack mutation goes through the VM's
//! push helpers and happens only in the message, group and map thunks.

use crate::error::ErrorKind;
use crate::ir::{self, IrField};
use crate::slice::{Repeated, ZcRange};
use crate::swiss::{Insert, KeyShape, MIN_CAP, Swiss};
use crate::table::{
    self, Card, FieldKind, FieldParser, MapInfo, NO_BIT, ONEOF_FLAG, PARSER_VALIDATE_UTF8, Type,
    TypeParser,
};
use crate::vm::{Fail, NOT_IN_GROUP, ThunkFn, Vm, run};
use crate::wire::{self, VarintFault, WT_EGROUP, WT_LEN};

/// One `FieldParser` record to emit for a field.
pub(crate) struct Plan {
    pub tag: u32,
    pub thunk: ThunkFn,
    pub flags: u32,
}

/// Records for a field in emission order: the expected encoding first, so
/// it takes the hot position in the miss chain.
pub(crate) fn plan(field: &IrField) -> Vec<Plan> {
    let number = field.number;
    let tag_of = |wt: u32| number << 3 | wt;
    let utf8_flag = if field.kind == FieldKind::String && !field.hints.assume_utf8 {
        PARSER_VALIDATE_UTF8
    } else {
        0
    };
    let one = |wt: u32, thunk: ThunkFn| {
        vec![Plan {
            tag: tag_of(wt),
            thunk,
            flags: utf8_flag,
        }]
    };
    match field.kind {
        FieldKind::Map => return one(WT_LEN, t_map),
        FieldKind::Message => {
            return one(
                WT_LEN,
                if field.card == Card::Repeated {
                    t_rep_message
                } else {
                    t_message
                },
            );
        }
        FieldKind::Group => {
            return one(
                wire::WT_SGROUP,
                if field.card == Card::Repeated {
                    t_rep_group
                } else {
                    t_group
                },
            );
        }
        FieldKind::String | FieldKind::Bytes => {
            return one(
                WT_LEN,
                if field.card == Card::Repeated {
                    t_rep_string
                } else {
                    t_string
                },
            );
        }
        _ => {}
    }
    let wt = ir::wire_type(field.kind);
    if field.card != Card::Repeated {
        let thunk: ThunkFn = match field.kind {
            FieldKind::Bool => t_bool,
            FieldKind::SInt32 => t_sint32,
            FieldKind::SInt64 => t_sint64,
            FieldKind::Int32 | FieldKind::UInt32 | FieldKind::Enum => t_varint32,
            FieldKind::Int64 | FieldKind::UInt64 => t_varint64,
            FieldKind::Fixed32 | FieldKind::SFixed32 | FieldKind::Float => t_fixed32,
            _ => t_fixed64,
        };
        return one(wt, thunk);
    }
    let (element, packed): (ThunkFn, ThunkFn) = match field.kind {
        FieldKind::Bool => (t_rep_bool, t_packed_bool),
        FieldKind::SInt32 => (t_rep_sint32, t_packed_sint32),
        FieldKind::SInt64 => (t_rep_sint64, t_packed_sint64),
        FieldKind::Int32 | FieldKind::UInt32 | FieldKind::Enum => (t_rep_varint32, t_packed_varint32),
        FieldKind::Int64 | FieldKind::UInt64 => (t_rep_varint64, t_packed_varint64),
        FieldKind::Fixed32 | FieldKind::SFixed32 | FieldKind::Float => {
            (t_rep_fixed32, t_packed_fixed32)
        }
        _ => (t_rep_fixed64, t_packed_fixed64),
    };
    let mut plans = vec![
        Plan {
            tag: tag_of(WT_LEN),
            thunk: packed,
            flags: 0,
        },
        Plan {
            tag: tag_of(wt),
            thunk: element,
            flags: 0,
        },
    ];
    if !field.packed {
        plans.swap(0, 1);
    }
    plans
}

// --- singular scalars ------------------------------------------------------

fn t_varint32(vm: &mut Vm<'_, '_>, rec: &FieldParser) -> Result<(), Fail> {
    let v = vm.read_varint()?;
    vm.store32(rec.offset, v as u32);
    Ok(())
}

fn t_varint64(vm: &mut Vm<'_, '_>, rec: &FieldParser) -> Result<(), Fail> {
    let v = vm.read_varint()?;
    vm.store64(rec.offset, v);
    Ok(())
}

fn t_sint32(vm: &mut Vm<'_, '_>, rec: &FieldParser) -> Result<(), Fail> {
    let v = vm.read_varint()?;
    vm.store32(rec.offset, wire::zigzag32(v) as u32);
    Ok(())
}

fn t_sint64(vm: &mut Vm<'_, '_>, rec: &FieldParser) -> Result<(), Fail> {
    let v = vm.read_varint()?;
    vm.store64(rec.offset, wire::zigzag64(v) as u64);
    Ok(())
}

fn t_bool(vm: &mut Vm<'_, '_>, rec: &FieldParser) -> Result<(), Fail> {
    let v = vm.read_varint()?;
    vm.store8(rec.offset, (v != 0) as u8);
    Ok(())
}

fn t_fixed32(vm: &mut Vm<'_, '_>, rec: &FieldParser) -> Result<(), Fail> {
    vm.need(4)?;
    let v = unsafe { wire::read_fixed32(vm.ptr) };
    vm.ptr = unsafe { vm.ptr.add(4) };
    vm.store32(rec.offset, v);
    Ok(())
}

fn t_fixed64(vm: &mut Vm<'_, '_>, rec: &FieldParser) -> Result<(), Fail> {
    vm.need(8)?;
    let v = unsafe { wire::read_fixed64(vm.ptr) };
    vm.ptr = unsafe { vm.ptr.add(8) };
    vm.store64(rec.offset, v);
    Ok(())
}

// --- strings and bytes -----------------------------------------------------

#[inline(always)]
fn read_range(vm: &mut Vm<'_, '_>, flags: u32) -> Result<ZcRange, Fail> {
    let len = vm.read_len()?;
    let payload = vm.ptr;
    if flags & PARSER_VALIDATE_UTF8 != 0 {
        let bytes = unsafe { core::slice::from_raw_parts(payload, len) };
        if !wire::validate_utf8(bytes) {
            return Err(vm.fail_at(ErrorKind::Utf8, payload));
        }
    }
    vm.ptr = unsafe { payload.add(len) };
    Ok(ZcRange::new(vm.offset_of(payload) as u32, len as u32))
}

fn t_string(vm: &mut Vm<'_, '_>, rec: &FieldParser) -> Result<(), Fail> {
    let range = read_range(vm, rec.flags)?;
    vm.store_range(rec.offset, range);
    Ok(())
}

fn t_rep_string(vm: &mut Vm<'_, '_>, rec: &FieldParser) -> Result<(), Fail> {
    let range = read_range(vm, rec.flags)?;
    let rep = vm.repeated_slot::<ZcRange>(rec.offset, rec.preload);
    unsafe { (*rep).push(range, vm.arena) };
    Ok(())
}

// --- messages and groups ---------------------------------------------------

fn t_message(vm: &mut Vm<'_, '_>, rec: &FieldParser) -> Result<(), Fail> {
    let len = vm.read_len()?;
    let sub_end = unsafe { vm.ptr.add(len) };
    let child_tp: &TypeParser = unsafe { table::resolve(vm.base, rec.aux) };
    let child_ty: &Type = unsafe { child_tp.ty(vm.base) };
    let slot = vm.slot_ptr(rec.offset) as *mut *mut u8;
    // A oneof slot aliases its siblings: reuse the existing message only
    // when this variant is the active one.
    let active = if rec.offset.bit != NO_BIT && rec.offset.bit & ONEOF_FLAG != 0 {
        let word = rec.offset.bit & !ONEOF_FLAG;
        (unsafe { crate::message::which_word(vm.msg, word) }) == rec.offset.number
    } else {
        true
    };
    let existing = if active {
        unsafe { *slot }
    } else {
        core::ptr::null_mut()
    };
    let child = if existing.is_null() {
        let c = vm.alloc_message(child_ty);
        unsafe { *slot = c };
        c
    } else {
        existing
    };
    vm.mark(rec.offset);
    vm.push_message_frame(child, child_tp, sub_end)
}

fn t_group(vm: &mut Vm<'_, '_>, rec: &FieldParser) -> Result<(), Fail> {
    let child_tp: &TypeParser = unsafe { table::resolve(vm.base, rec.aux) };
    let child_ty: &Type = unsafe { child_tp.ty(vm.base) };
    let slot = vm.slot_ptr(rec.offset) as *mut *mut u8;
    let active = if rec.offset.bit != NO_BIT && rec.offset.bit & ONEOF_FLAG != 0 {
        let word = rec.offset.bit & !ONEOF_FLAG;
        (unsafe { crate::message::which_word(vm.msg, word) }) == rec.offset.number
    } else {
        true
    };
    let existing = if active {
        unsafe { *slot }
    } else {
        core::ptr::null_mut()
    };
    let child = if existing.is_null() {
        let c = vm.alloc_message(child_ty);
        unsafe { *slot = c };
        c
    } else {
        existing
    };
    vm.mark(rec.offset);
    vm.push_group_frame(child, child_tp, (rec.tag & !7) | WT_EGROUP)
}

fn t_rep_message(vm: &mut Vm<'_, '_>, rec: &FieldParser) -> Result<(), Fail> {
    let len = vm.read_len()?;
    let sub_end = unsafe { vm.ptr.add(len) };
    let child_tp: &TypeParser = unsafe { table::resolve(vm.base, rec.aux) };
    let child_ty: &Type = unsafe { child_tp.ty(vm.base) };
    let child = vm.alloc_message(child_ty);
    let rep = vm.repeated_slot::<*mut u8>(rec.offset, rec.preload);
    unsafe { (*rep).push(child, vm.arena) };
    vm.push_message_frame(child, child_tp, sub_end)
}

fn t_rep_group(vm: &mut Vm<'_, '_>, rec: &FieldParser) -> Result<(), Fail> {
    let child_tp: &TypeParser = unsafe { table::resolve(vm.base, rec.aux) };
    let child_ty: &Type = unsafe { child_tp.ty(vm.base) };
    let child = vm.alloc_message(child_ty);
    let rep = vm.repeated_slot::<*mut u8>(rec.offset, rec.preload);
    unsafe { (*rep).push(child, vm.arena) };
    vm.push_group_frame(child, child_tp, (rec.tag & !7) | WT_EGROUP)
}

// --- repeated scalars, unpacked elements -----------------------------------

#[inline(always)]
fn rep_varint<T: Copy>(
    vm: &mut Vm<'_, '_>,
    rec: &FieldParser,
    decode: impl Fn(u64) -> T,
) -> Result<(), Fail> {
    let v = vm.read_varint()?;
    let rep = vm.repeated_slot::<T>(rec.offset, rec.preload);
    unsafe { (*rep).push(decode(v), vm.arena) };
    Ok(())
}

fn t_rep_varint32(vm: &mut Vm<'_, '_>, rec: &FieldParser) -> Result<(), Fail> {
    rep_varint(vm, rec, |v| v as u32)
}

fn t_rep_varint64(vm: &mut Vm<'_, '_>, rec: &FieldParser) -> Result<(), Fail> {
    rep_varint(vm, rec, |v| v)
}

fn t_rep_sint32(vm: &mut Vm<'_, '_>, rec: &FieldParser) -> Result<(), Fail> {
    rep_varint(vm, rec, |v| wire::zigzag32(v) as u32)
}

fn t_rep_sint64(vm: &mut Vm<'_, '_>, rec: &FieldParser) -> Result<(), Fail> {
    rep_varint(vm, rec, |v| wire::zigzag64(v) as u64)
}

fn t_rep_bool(vm: &mut Vm<'_, '_>, rec: &FieldParser) -> Result<(), Fail> {
    rep_varint(vm, rec, |v| v != 0)
}

fn t_rep_fixed32(vm: &mut Vm<'_, '_>, rec: &FieldParser) -> Result<(), Fail> {
    vm.need(4)?;
    let v = unsafe { wire::read_fixed32(vm.ptr) };
    vm.ptr = unsafe { vm.ptr.add(4) };
    let rep = vm.repeated_slot::<u32>(rec.offset, rec.preload);
    unsafe { (*rep).push(v, vm.arena) };
    Ok(())
}

fn t_rep_fixed64(vm: &mut Vm<'_, '_>, rec: &FieldParser) -> Result<(), Fail> {
    vm.need(8)?;
    let v = unsafe { wire::read_fixed64(vm.ptr) };
    vm.ptr = unsafe { vm.ptr.add(8) };
    let rep = vm.repeated_slot::<u64>(rec.offset, rec.preload);
    unsafe { (*rep).push(v, vm.arena) };
    Ok(())
}

// --- packed scalars --------------------------------------------------------

/// Packed varints: an exact element count comes from a popcount of cleared
/// sign bits, so the slice is reserved once before the decode loop.
#[inline(always)]
fn packed_varints<T: Copy>(
    vm: &mut Vm<'_, '_>,
    rec: &FieldParser,
    decode: impl Fn(u64) -> T,
) -> Result<(), Fail> {
    let len = vm.read_len()?;
    let payload = vm.ptr;
    let end = unsafe { payload.add(len) };
    let count = wire::count_packed_varints(unsafe { core::slice::from_raw_parts(payload, len) });
    let rep_ptr = vm.repeated_slot::<T>(rec.offset, rec.preload);
    let rep = unsafe { &mut *rep_ptr };
    rep.reserve(rep.len() + count, vm.arena);
    let mut p = payload;
    while p < end {
        let (v, np) = match wire::read_varint(p, end) {
            Ok(x) => x,
            Err(VarintFault::Truncated) => return Err(vm.fail_at(ErrorKind::Truncated, end)),
            Err(VarintFault::Overflow) => return Err(vm.fail_at(ErrorKind::Overflow, p)),
        };
        rep.push(decode(v), vm.arena);
        p = np;
    }
    vm.ptr = end;
    Ok(())
}

fn t_packed_varint32(vm: &mut Vm<'_, '_>, rec: &FieldParser) -> Result<(), Fail> {
    packed_varints(vm, rec, |v| v as u32)
}

fn t_packed_varint64(vm: &mut Vm<'_, '_>, rec: &FieldParser) -> Result<(), Fail> {
    packed_varints(vm, rec, |v| v)
}

fn t_packed_sint32(vm: &mut Vm<'_, '_>, rec: &FieldParser) -> Result<(), Fail> {
    packed_varints(vm, rec, |v| wire::zigzag32(v) as u32)
}

fn t_packed_sint64(vm: &mut Vm<'_, '_>, rec: &FieldParser) -> Result<(), Fail> {
    packed_varints(vm, rec, |v| wire::zigzag64(v) as u64)
}

fn t_packed_bool(vm: &mut Vm<'_, '_>, rec: &FieldParser) -> Result<(), Fail> {
    packed_varints(vm, rec, |v| v != 0)
}

/// Packed fixed elements: an empty destination adopts the input range as an
/// off-arena borrow; anything else copies element-wise.
#[inline(always)]
fn packed_fixed<T: Copy>(
    vm: &mut Vm<'_, '_>,
    rec: &FieldParser,
    read: impl Fn(*const u8) -> T,
) -> Result<(), Fail> {
    let width = core::mem::size_of::<T>();
    let len = vm.read_len()?;
    let payload = vm.ptr;
    if len % width != 0 {
        return Err(vm.fail_at(ErrorKind::Truncated, payload));
    }
    let n = len / width;
    vm.ptr = unsafe { payload.add(len) };
    if n == 0 {
        return Ok(());
    }
    let rep_ptr = vm.repeated_slot::<T>(rec.offset, 0);
    let rep = unsafe { &mut *rep_ptr };
    if cfg!(target_endian = "little")
        && rep.is_empty()
        && rep.capacity() == 0
        && payload as usize % core::mem::align_of::<T>() == 0
    {
        rep.adopt_off_arena(payload, n);
        return Ok(());
    }
    rep.reserve(rep.len() + n, vm.arena);
    for i in 0..n {
        rep.push(read(unsafe { payload.add(i * width) }), vm.arena);
    }
    Ok(())
}

fn t_packed_fixed32(vm: &mut Vm<'_, '_>, rec: &FieldParser) -> Result<(), Fail> {
    packed_fixed::<u32>(vm, rec, |p| unsafe { wire::read_fixed32(p) })
}

fn t_packed_fixed64(vm: &mut Vm<'_, '_>, rec: &FieldParser) -> Result<(), Fail> {
    packed_fixed::<u64>(vm, rec, |p| unsafe { wire::read_fixed64(p) })
}

// --- maps ------------------------------------------------------------------

struct EntryScan {
    key: u64,
    val: u64,
    /// Message values are parsed after the scan, from this range.
    val_range: Option<ZcRange>,
}

#[inline(always)]
fn map_scalar(
    vm: &mut Vm<'_, '_>,
    kind: FieldKind,
    p: *const u8,
    end: *const u8,
    validate: bool,
) -> Result<(u64, *const u8), Fail> {
    match kind {
        FieldKind::String | FieldKind::Bytes => {
            let (len, np) = match wire::read_len(p, end) {
                Ok(x) => x,
                Err(f) => return Err(map_varint_fail(vm, f, p, end)),
            };
            if len as usize > end as usize - np as usize {
                return Err(vm.fail_at(ErrorKind::Truncated, end));
            }
            if validate && kind == FieldKind::String {
                let bytes = unsafe { core::slice::from_raw_parts(np, len as usize) };
                if !wire::validate_utf8(bytes) {
                    return Err(vm.fail_at(ErrorKind::Utf8, np));
                }
            }
            let range = ZcRange::new(vm.offset_of(np) as u32, len);
            Ok((range.to_bits(), unsafe { np.add(len as usize) }))
        }
        FieldKind::Fixed32 | FieldKind::SFixed32 | FieldKind::Float => {
            if (end as usize - p as usize) < 4 {
                return Err(vm.fail_at(ErrorKind::Truncated, end));
            }
            Ok((unsafe { wire::read_fixed32(p) } as u64, unsafe { p.add(4) }))
        }
        FieldKind::Fixed64 | FieldKind::SFixed64 | FieldKind::Double => {
            if (end as usize - p as usize) < 8 {
                return Err(vm.fail_at(ErrorKind::Truncated, end));
            }
            Ok((unsafe { wire::read_fixed64(p) }, unsafe { p.add(8) }))
        }
        _ => {
            let (v, np) = match wire::read_varint(p, end) {
                Ok(x) => x,
                Err(f) => return Err(map_varint_fail(vm, f, p, end)),
            };
            let v = match kind {
                FieldKind::Bool => (v != 0) as u64,
                FieldKind::SInt32 => wire::zigzag32(v) as u32 as u64,
                FieldKind::SInt64 => wire::zigzag64(v) as u64,
                FieldKind::Int32 | FieldKind::UInt32 | FieldKind::Enum => v as u32 as u64,
                _ => v,
            };
            Ok((v, np))
        }
    }
}

fn map_varint_fail(vm: &mut Vm<'_, '_>, f: VarintFault, p: *const u8, end: *const u8) -> Fail {
    match f {
        VarintFault::Truncated => vm.fail_at(ErrorKind::Truncated, end),
        VarintFault::Overflow => vm.fail_at(ErrorKind::Overflow, p),
    }
}

/// Side-effect-free decode of one entry field value for the fast path;
/// `None` defers to the generic scan (which also owns error reporting).
fn fast_scalar(
    input: *const u8,
    kind: FieldKind,
    p: *const u8,
    end: *const u8,
) -> Option<(u64, *const u8)> {
    match kind {
        FieldKind::String | FieldKind::Bytes => {
            let (len, np) = wire::read_len(p, end).ok()?;
            if len as usize > end as usize - np as usize {
                return None;
            }
            let bytes = unsafe { core::slice::from_raw_parts(np, len as usize) };
            if kind == FieldKind::String && !wire::validate_utf8(bytes) {
                return None;
            }
            let range = ZcRange::new((np as usize - input as usize) as u32, len);
            Some((range.to_bits(), unsafe { np.add(len as usize) }))
        }
        FieldKind::Fixed32 | FieldKind::SFixed32 | FieldKind::Float => {
            if (end as usize - p as usize) < 4 {
                return None;
            }
            Some((unsafe { wire::read_fixed32(p) } as u64, unsafe { p.add(4) }))
        }
        FieldKind::Fixed64 | FieldKind::SFixed64 | FieldKind::Double => {
            if (end as usize - p as usize) < 8 {
                return None;
            }
            Some((unsafe { wire::read_fixed64(p) }, unsafe { p.add(8) }))
        }
        _ => {
            let (v, np) = wire::read_varint(p, end).ok()?;
            let v = match kind {
                FieldKind::Bool => (v != 0) as u64,
                FieldKind::SInt32 => wire::zigzag32(v) as u32 as u64,
                FieldKind::SInt64 => wire::zigzag64(v) as u64,
                FieldKind::Int32 | FieldKind::UInt32 | FieldKind::Enum => v as u32 as u64,
                _ => v,
            };
            Some((v, np))
        }
    }
}

/// The common case: key tag, value tag, exact length. Entry tags are always
/// one byte (fields 1 and 2). Anything irregular defers to the scan.
fn fast_entry(
    input: *const u8,
    info: &MapInfo,
    start: *const u8,
    end: *const u8,
) -> Option<EntryScan> {
    let mut p = start;
    if p >= end || unsafe { *p } as u32 != info.key_tag {
        return None;
    }
    p = unsafe { p.add(1) };
    let (key, np) = fast_scalar(input, FieldKind::from_u8(info.key_kind), p, end)?;
    p = np;
    if p >= end || unsafe { *p } as u32 != info.val_tag {
        return None;
    }
    p = unsafe { p.add(1) };
    let val_is_message = info.val_kind == FieldKind::Message as u8;
    let mut out = EntryScan {
        key,
        val: 0,
        val_range: None,
    };
    if val_is_message {
        let (len, np) = wire::read_len(p, end).ok()?;
        if len as usize > end as usize - np as usize {
            return None;
        }
        out.val_range = Some(ZcRange::new((np as usize - input as usize) as u32, len));
        p = unsafe { np.add(len as usize) };
    } else {
        let (v, np) = fast_scalar(input, FieldKind::from_u8(info.val_kind), p, end)?;
        out.val = v;
        p = np;
    }
    if p != end {
        return None;
    }
    Some(out)
}

/// Generic two-field scan of one map entry: tolerates swapped order,
/// duplicate fields (last wins) and unknown fields inside the entry.
fn scan_entry(
    vm: &mut Vm<'_, '_>,
    info: &MapInfo,
    start: *const u8,
    end: *const u8,
) -> Result<EntryScan, Fail> {
    let mut out = EntryScan {
        key: 0,
        val: 0,
        val_range: None,
    };
    let val_is_message = info.val_kind == FieldKind::Message as u8;
    let mut p = start;
    while p < end {
        let tag_start = p;
        let (tag, np) = match wire::read_tag_slow(p, end) {
            Ok(x) => x,
            Err(f) => return Err(map_varint_fail(vm, f, p, end)),
        };
        p = np;
        if tag >> 3 == 0 {
            return Err(vm.fail_at(ErrorKind::FieldNumber, tag_start));
        }
        if tag == info.key_tag {
            let (k, np) = map_scalar(vm, FieldKind::from_u8(info.key_kind), p, end, true)?;
            out.key = k;
            p = np;
        } else if tag == info.val_tag {
            if val_is_message {
                let (len, np) = match wire::read_len(p, end) {
                    Ok(x) => x,
                    Err(f) => return Err(map_varint_fail(vm, f, p, end)),
                };
                if len as usize > end as usize - np as usize {
                    return Err(vm.fail_at(ErrorKind::Truncated, end));
                }
                out.val_range = Some(ZcRange::new(vm.offset_of(np) as u32, len));
                p = unsafe { np.add(len as usize) };
            } else {
                let (v, np) = map_scalar(vm, FieldKind::from_u8(info.val_kind), p, end, true)?;
                out.val = v;
                p = np;
            }
        } else {
            match wire::consume_field_value(tag, p, end) {
                Ok(np) => p = np,
                Err(wire::SkipFault::Truncated) => {
                    return Err(vm.fail_at(ErrorKind::Truncated, end));
                }
                Err(wire::SkipFault::Reserved) => {
                    return Err(vm.fail_at(ErrorKind::Reserved, tag_start));
                }
                Err(_) => return Err(vm.fail_at(ErrorKind::EndGroup, tag_start)),
            }
        }
    }
    Ok(out)
}

/// Map entries are length-prefixed submessages with key = 1 and value = 2.
fn t_map(vm: &mut Vm<'_, '_>, rec: &FieldParser) -> Result<(), Fail> {
    let len = vm.read_len()?;
    let start = vm.ptr;
    let end = unsafe { start.add(len) };
    vm.ptr = end;
    let info: &MapInfo = unsafe { table::resolve(vm.base, rec.aux) };

    let mut scan = match fast_entry(vm.input, info, start, end) {
        Some(scan) => scan,
        None => scan_entry(vm, info, start, end)?,
    };

    // Message values parse into a fresh child after the scan; a missing
    // value decodes as the empty message.
    if info.val_kind == FieldKind::Message as u8 {
        let child_ty: &Type = unsafe { table::resolve(vm.base, info.val_type) };
        let child_tp: &TypeParser = unsafe { child_ty.type_parser(vm.base) };
        let child = vm.alloc_message(child_ty);
        if let Some(range) = scan.val_range {
            parse_value_message(vm, child, child_tp, range)?;
        }
        scan.val = child as usize as u64;
    }

    let shape = KeyShape::from_u8(info.key_shape);
    let slot = vm.slot_ptr(rec.offset) as *mut *mut Swiss;
    let mut table_ptr = unsafe { *slot };
    if table_ptr.is_null() {
        table_ptr = Swiss::new_in(vm.arena, MIN_CAP, info.seed, shape, 8);
        unsafe { *slot = table_ptr };
    }
    let src = vm.input;
    loop {
        let t = unsafe { &mut *table_ptr };
        match t.insert(scan.key, src) {
            Insert::Found(s) | Insert::Inserted(s) => {
                t.write_value(s, scan.val);
                return Ok(());
            }
            Insert::Full => {
                table_ptr = t.grown(vm.arena, src);
                unsafe { *slot = table_ptr };
            }
        }
    }
}

fn parse_value_message(
    vm: &mut Vm<'_, '_>,
    child: *mut u8,
    child_tp: &TypeParser,
    range: ZcRange,
) -> Result<(), Fail> {
    if vm.depth >= vm.rest.max_depth {
        return Err(vm.fail_at(ErrorKind::RecursionDepth, vm.ptr));
    }
    let saved = (
        vm.ptr,
        vm.end,
        vm.group_tag,
        vm.msg,
        vm.rest.tp,
        vm.fp,
        vm.depth,
    );
    vm.ptr = unsafe { vm.input.add(range.offset as usize) };
    vm.end = unsafe { vm.ptr.add(range.len as usize) };
    vm.group_tag = NOT_IN_GROUP;
    vm.msg = child;
    vm.rest.tp = child_tp;
    vm.fp = vm.resolve_fp(child_tp.entry);
    vm.depth += 1;
    let result = run(vm);
    (
        vm.ptr,
        vm.end,
        vm.group_tag,
        vm.msg,
        vm.rest.tp,
        vm.fp,
        vm.depth,
    ) = saved;
    result
}
