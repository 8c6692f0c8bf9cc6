//! Reflection adapters over decoded messages.
//!
//! Thin shims presenting dynamic messages, repeated fields and maps behind
//! a uniform surface: [`Value`] for any field value, [`ListRef`] over the
//! arena-slice storage, [`MapRef`] over the swiss-backed storage. Adapters
//! borrow the shared context and never retain the source pointer past it.

use core::ptr::NonNull;

use crate::message::DynMessage;
use crate::shared::Shared;
use crate::slice::ZcRange;
use crate::swiss::{KeyShape, Swiss};
use crate::table::{self, Card, Field, FieldKind, MapInfo};

/// Handle to one declared field of a compiled type.
#[derive(Clone, Copy)]
pub struct FieldRef<'a> {
    pub(crate) field: &'a Field,
    pub(crate) base: *const u8,
}

impl<'a> FieldRef<'a> {
    pub fn name(&self) -> &'a str {
        unsafe { table::name_str(self.base, self.field.name) }
    }

    pub fn number(&self) -> u32 {
        self.field.offset.number
    }

    pub fn is_repeated(&self) -> bool {
        self.field.card() == Card::Repeated
    }

    pub fn is_map(&self) -> bool {
        self.field.kind() == FieldKind::Map
    }

    pub fn is_oneof_member(&self) -> bool {
        self.field.flags & table::FIELD_ONEOF != 0
    }
}

/// A dynamically-typed field value.
#[derive(Clone, Copy)]
pub enum Value<'a> {
    Bool(bool),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Str(&'a str),
    Bytes(&'a [u8]),
    Message(DynMessage<'a>),
    List(ListRef<'a>),
    Map(MapRef<'a>),
}

impl core::fmt::Debug for Value<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Value::Bool(v) => v.fmt(f),
            Value::I32(v) => v.fmt(f),
            Value::I64(v) => v.fmt(f),
            Value::U32(v) => v.fmt(f),
            Value::U64(v) => v.fmt(f),
            Value::F32(v) => v.fmt(f),
            Value::F64(v) => v.fmt(f),
            Value::Str(v) => v.fmt(f),
            Value::Bytes(v) => v.fmt(f),
            Value::Message(v) => v.fmt(f),
            Value::List(v) => f.debug_list().entries(v.iter().map(DebugValue)).finish(),
            Value::Map(v) => f
                .debug_map()
                .entries(v.iter().map(|(k, val)| (DebugValue(k), DebugValue(val))))
                .finish(),
        }
    }
}

struct DebugValue<'a>(Value<'a>);

impl core::fmt::Debug for DebugValue<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.0.fmt(f)
    }
}

fn scalar_value<'a>(kind: FieldKind, raw: u64) -> Value<'a> {
    match kind {
        FieldKind::Bool => Value::Bool(raw != 0),
        FieldKind::Int32 | FieldKind::SInt32 | FieldKind::SFixed32 | FieldKind::Enum => {
            Value::I32(raw as u32 as i32)
        }
        FieldKind::Int64 | FieldKind::SInt64 | FieldKind::SFixed64 => Value::I64(raw as i64),
        FieldKind::UInt32 | FieldKind::Fixed32 => Value::U32(raw as u32),
        FieldKind::UInt64 | FieldKind::Fixed64 => Value::U64(raw),
        FieldKind::Float => Value::F32(f32::from_bits(raw as u32)),
        FieldKind::Double => Value::F64(f64::from_bits(raw)),
        _ => unreachable!("scalar kind"),
    }
}

fn bytes_value<'a>(kind: FieldKind, bytes: &'a [u8]) -> Value<'a> {
    if kind == FieldKind::String {
        // Fields parsed with `assume_utf8` may carry invalid bytes; degrade
        // to a byte view rather than lie about validity.
        match core::str::from_utf8(bytes) {
            Ok(s) => Value::Str(s),
            Err(_) => Value::Bytes(bytes),
        }
    } else {
        Value::Bytes(bytes)
    }
}

impl<'a> DynMessage<'a> {
    pub fn fields(&self) -> impl Iterator<Item = FieldRef<'a>> + use<'a> {
        let base = self.base();
        let count = self.field_count();
        let this = *self;
        (0..count).map(move |i| FieldRef {
            field: this.field_at(i),
            base,
        })
    }

    pub fn field_by_number(&self, number: u32) -> Option<FieldRef<'a>> {
        self.field_index_of(number).map(|i| FieldRef {
            field: self.field_at(i),
            base: self.base(),
        })
    }

    pub fn field_by_name(&self, name: &str) -> Option<FieldRef<'a>> {
        self.fields().find(|f| f.name() == name)
    }

    /// Explicit or effective presence, per archetype.
    pub fn has(&self, f: FieldRef<'a>) -> bool {
        self.is_set(f.field)
    }

    /// The active field number of the oneof this field belongs to, or zero.
    pub fn which(&self, f: FieldRef<'a>) -> u32 {
        let bit = f.field.offset.bit;
        if bit != table::NO_BIT && bit & table::ONEOF_FLAG != 0 {
            unsafe { crate::message::which_word(self.msg, bit & !table::ONEOF_FLAG) }
        } else {
            0
        }
    }

    /// Visit populated fields in declaration order; stop when the visitor
    /// returns false.
    pub fn range(&self, mut visit: impl FnMut(FieldRef<'a>, Value<'a>) -> bool) {
        for f in self.fields() {
            if self.is_set(f.field) && !visit(f, self.get(f)) {
                return;
            }
        }
    }

    pub fn get(&self, f: FieldRef<'a>) -> Value<'a> {
        let field = f.field;
        let off = field.offset;
        match (field.card(), field.kind()) {
            (_, FieldKind::Map) => Value::Map(self.get_map(f)),
            (Card::Repeated, _) => Value::List(self.get_list(f)),
            (_, FieldKind::Message | FieldKind::Group) => {
                Value::Message(self.message_at(off, field))
            }
            (_, FieldKind::String | FieldKind::Bytes) => {
                bytes_value(field.kind(), self.bytes_view(off))
            }
            (_, FieldKind::Bool) => Value::Bool(self.scalar_bool(off)),
            (_, kind) => {
                let raw = match crate::ir::storage(kind, Card::Implicit).0 {
                    4 => self.scalar_u32(off) as u64,
                    _ => self.scalar_u64(off),
                };
                scalar_value(kind, raw)
            }
        }
    }

    // Typed accessors; unset fields read as defaults.

    pub fn get_bool(&self, f: FieldRef<'a>) -> bool {
        self.scalar_bool(f.field.offset)
    }

    pub fn get_i32(&self, f: FieldRef<'a>) -> i32 {
        self.scalar_u32(f.field.offset) as i32
    }

    pub fn get_u32(&self, f: FieldRef<'a>) -> u32 {
        self.scalar_u32(f.field.offset)
    }

    pub fn get_i64(&self, f: FieldRef<'a>) -> i64 {
        self.scalar_u64(f.field.offset) as i64
    }

    pub fn get_u64(&self, f: FieldRef<'a>) -> u64 {
        self.scalar_u64(f.field.offset)
    }

    pub fn get_f32(&self, f: FieldRef<'a>) -> f32 {
        f32::from_bits(self.scalar_u32(f.field.offset))
    }

    pub fn get_f64(&self, f: FieldRef<'a>) -> f64 {
        f64::from_bits(self.scalar_u64(f.field.offset))
    }

    /// String content; invalid bytes (possible only under `assume_utf8`)
    /// read as empty.
    pub fn get_str(&self, f: FieldRef<'a>) -> &'a str {
        core::str::from_utf8(self.bytes_view(f.field.offset)).unwrap_or_default()
    }

    pub fn get_bytes(&self, f: FieldRef<'a>) -> &'a [u8] {
        self.bytes_view(f.field.offset)
    }

    /// Always non-null: unset submessages read as the shared empty instance
    /// (check [`DynMessage::is_valid`] to tell them apart).
    pub fn get_message(&self, f: FieldRef<'a>) -> DynMessage<'a> {
        self.message_at(f.field.offset, f.field)
    }

    pub fn get_list(&self, f: FieldRef<'a>) -> ListRef<'a> {
        debug_assert!(f.is_repeated() && !f.is_map());
        let (ptr, len) = self.repeated_raw(f.field.offset);
        ListRef {
            kind: f.field.kind(),
            ptr,
            len,
            shared: self.shared,
        }
    }

    pub fn get_map(&self, f: FieldRef<'a>) -> MapRef<'a> {
        debug_assert!(f.is_map());
        let info: &MapInfo = unsafe { table::resolve(self.base(), f.field.aux) };
        MapRef {
            table: self.map_table(f.field.offset),
            info,
            shared: self.shared,
        }
    }
}

/// Façade over a repeated field's arena slice (or off-arena borrow).
#[derive(Clone, Copy)]
pub struct ListRef<'a> {
    kind: FieldKind,
    ptr: *const u8,
    len: usize,
    shared: &'a Shared<'a>,
}

impl<'a> ListRef<'a> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, i: usize) -> Value<'a> {
        assert!(i < self.len, "list index out of bounds");
        unsafe {
            match self.kind {
                FieldKind::Message | FieldKind::Group => {
                    let p = *(self.ptr as *const *const u8).add(i);
                    Value::Message(DynMessage {
                        msg: p,
                        shared: self.shared,
                    })
                }
                FieldKind::String | FieldKind::Bytes => {
                    let range = *(self.ptr as *const ZcRange).add(i);
                    bytes_value(self.kind, range.resolve(self.shared.src_ptr()))
                }
                FieldKind::Bool => Value::Bool(*(self.ptr as *const bool).add(i)),
                kind => {
                    let raw = match crate::ir::storage(kind, Card::Implicit).0 {
                        4 => (self.ptr as *const u32).add(i).read() as u64,
                        _ => (self.ptr as *const u64).add(i).read(),
                    };
                    scalar_value(kind, raw)
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Value<'a>> + use<'a> {
        let this = *self;
        (0..this.len).map(move |i| this.get(i))
    }
}

/// Façade over a map field's swiss table.
#[derive(Clone, Copy)]
pub struct MapRef<'a> {
    table: Option<NonNull<Swiss>>,
    info: &'a MapInfo,
    shared: &'a Shared<'a>,
}

/// Lookup key for [`MapRef::get`].
#[derive(Clone, Copy, Debug)]
pub enum MapKeyRef<'k> {
    Bool(bool),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    Str(&'k str),
}

impl<'a> MapRef<'a> {
    pub fn len(&self) -> usize {
        self.table.map(|t| unsafe { t.as_ref() }.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: MapKeyRef<'_>) -> Option<Value<'a>> {
        let table = unsafe { self.table?.as_ref() };
        let src = self.shared.src_ptr();
        let slot = match key {
            MapKeyRef::Str(s) => table.find_bytes(s.as_bytes(), src)?,
            MapKeyRef::Bool(b) => table.find(b as u64, src)?,
            MapKeyRef::I32(v) => table.find(v as u32 as u64, src)?,
            MapKeyRef::I64(v) => table.find(v as u64, src)?,
            MapKeyRef::U32(v) => table.find(v as u64, src)?,
            MapKeyRef::U64(v) => table.find(v, src)?,
        };
        Some(self.value_at(table, slot))
    }

    pub fn iter(&self) -> MapIter<'a> {
        MapIter {
            map: *self,
            slot: 0,
        }
    }

    fn key_at(&self, table: &Swiss, slot: usize) -> Value<'a> {
        let raw = table.key_bits(slot);
        let kind = FieldKind::from_u8(self.info.key_kind);
        if table.shape() == KeyShape::Bytes {
            let range = ZcRange::from_bits(raw);
            bytes_value(kind, unsafe { range.resolve(self.shared.src_ptr()) })
        } else {
            scalar_value(kind, raw)
        }
    }

    fn value_at(&self, table: &Swiss, slot: usize) -> Value<'a> {
        let raw = table.read_value(slot);
        match FieldKind::from_u8(self.info.val_kind) {
            FieldKind::Message => Value::Message(DynMessage {
                msg: raw as usize as *const u8,
                shared: self.shared,
            }),
            FieldKind::String | FieldKind::Bytes => {
                let range = ZcRange::from_bits(raw);
                bytes_value(
                    FieldKind::from_u8(self.info.val_kind),
                    unsafe { range.resolve(self.shared.src_ptr()) },
                )
            }
            kind => scalar_value(kind, raw),
        }
    }
}

pub struct MapIter<'a> {
    map: MapRef<'a>,
    slot: usize,
}

impl<'a> Iterator for MapIter<'a> {
    type Item = (Value<'a>, Value<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        let table = unsafe { self.map.table?.as_ref() };
        while self.slot < table.cap() as usize {
            let slot = self.slot;
            self.slot += 1;
            if table.slot_occupied(slot) {
                return Some((self.map.key_at(table, slot), self.map.value_at(table, slot)));
            }
        }
        None
    }
}

impl core::fmt::Debug for DynMessage<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut s = f.debug_struct(self.name());
        self.range(|field, value| {
            s.field(field.name(), &DebugValue(value));
            true
        });
        s.finish()
    }
}
