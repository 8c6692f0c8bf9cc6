//! Records of the compiled parser image.
//!
//! The linker lays these out inside one contiguous byte blob. Cross-record
//! references are 32-bit offsets from the image base (`0` means "none"; the
//! image starts with a pad symbol so no record ever sits at offset zero).
//! Thunk program counters are stored as raw `usize` values and transmuted
//! back to function pointers at dispatch.

use crate::swiss::Swiss;

/// `FieldOffset.bit` value for fields without a presence bit.
pub(crate) const NO_BIT: u32 = u32::MAX;
/// High bit of `FieldOffset.bit`: the low bits are a oneof which-word index.
pub(crate) const ONEOF_FLAG: u32 = 1 << 31;
/// `MessageHeader.cold_index` when no cold region has been allocated.
pub(crate) const NO_COLD: u32 = u32::MAX;

/// Pre-baked slot address of a field.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub(crate) struct FieldOffset {
    /// Byte offset from the message base; negative means "cold region at
    /// the bit complement".
    pub data: i32,
    /// Presence: [`NO_BIT`], a presence-bit index, or [`ONEOF_FLAG`] with a
    /// which-word index.
    pub bit: u32,
    pub number: u32,
}

impl FieldOffset {
    pub(crate) const fn cold(self) -> bool {
        self.data < 0
    }

    pub(crate) const fn cold_offset(self) -> u32 {
        !self.data as u32
    }
}

/// Interned name inside the image's string blob.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub(crate) struct NameRef {
    pub off: u32,
    pub len: u32,
}

/// Semantic field kind driving storage width, thunk choice and accessors.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub(crate) enum FieldKind {
    Bool = 0,
    Int32,
    Int64,
    UInt32,
    UInt64,
    SInt32,
    SInt64,
    Fixed32,
    Fixed64,
    SFixed32,
    SFixed64,
    Float,
    Double,
    Enum,
    String,
    Bytes,
    Message,
    Group,
    Map,
}

impl FieldKind {
    pub(crate) fn from_u8(v: u8) -> FieldKind {
        debug_assert!(v <= FieldKind::Map as u8);
        unsafe { core::mem::transmute(v) }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub(crate) enum Card {
    Implicit = 0,
    Optional,
    Repeated,
}

impl Card {
    pub(crate) fn from_u8(v: u8) -> Card {
        debug_assert!(v <= Card::Repeated as u8);
        unsafe { core::mem::transmute(v) }
    }
}

pub(crate) const FIELD_VALIDATE_UTF8: u16 = 1 << 0;
pub(crate) const FIELD_PACKED: u16 = 1 << 1;
pub(crate) const FIELD_REQUIRED: u16 = 1 << 2;
pub(crate) const FIELD_ONEOF: u16 = 1 << 3;

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct Field {
    pub offset: FieldOffset,
    pub kind: u8,
    pub card: u8,
    pub flags: u16,
    pub name: NameRef,
    /// Child `Type` for message/group fields, `MapInfo` for maps, else 0.
    pub aux: u32,
}

impl Field {
    pub(crate) fn kind(&self) -> FieldKind {
        FieldKind::from_u8(self.kind)
    }

    pub(crate) fn card(&self) -> Card {
        Card::from_u8(self.card)
    }
}

/// 128-entry byte table mapping small values directly to indexes; zero is a
/// miss, otherwise the stored byte is `index + 1`.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct TagLut(pub [u8; 128]);

impl TagLut {
    pub(crate) const EMPTY: TagLut = TagLut([0; 128]);

    #[inline(always)]
    pub(crate) fn get(&self, v: u32) -> Option<u32> {
        if v < 128 {
            let b = self.0[v as usize];
            if b != 0 {
                return Some(b as u32 - 1);
            }
        }
        None
    }
}

pub(crate) const TYPE_CONTAINS_REQUIRED: u32 = 1 << 0;
pub(crate) const TYPE_DISCARD_UNKNOWN: u32 = 1 << 1;

#[repr(C)]
pub(crate) struct Type {
    /// Hot struct size: header, bit words and hot region.
    pub size: u32,
    pub cold_size: u32,
    /// The message's `TypeParser`.
    pub parser: u32,
    /// `[Field; field_count + 1]`, declaration order plus a sentinel.
    pub fields: u32,
    pub field_count: u32,
    /// Swiss table: field number -> field index.
    pub index: u32,
    /// Shared zeroed instance returned for unset submessage reads.
    pub empty: u32,
    pub flags: u32,
    pub name: NameRef,
    /// Field number -> field index + 1 for numbers below 128.
    pub num_lut: TagLut,
}

impl Type {
    pub(crate) unsafe fn fields<'a>(&self, base: *const u8) -> &'a [Field] {
        unsafe {
            core::slice::from_raw_parts(
                base.add(self.fields as usize) as *const Field,
                self.field_count as usize,
            )
        }
    }

    pub(crate) unsafe fn name<'a>(&self, base: *const u8) -> &'a str {
        unsafe { name_str(base, self.name) }
    }

    pub(crate) unsafe fn field_index<'a>(&self, base: *const u8) -> &'a Swiss {
        unsafe { resolve(base, self.index) }
    }

    pub(crate) unsafe fn type_parser<'a>(&self, base: *const u8) -> &'a TypeParser {
        unsafe { resolve(base, self.parser) }
    }
}

#[repr(C)]
pub(crate) struct TypeParser {
    /// Back-reference to the owning `Type`.
    pub type_off: u32,
    /// Entrypoint `FieldParser`; 0 when the message has no fields.
    pub entry: u32,
    /// Dense `[FieldParser; parser_count]` in execution order, hot band
    /// first. Placed directly after this record.
    pub parsers: u32,
    pub parser_count: u32,
    /// Swiss table: tag -> parser index.
    pub dispatch: u32,
    pub _pad: u32,
    /// One-byte tag -> parser index + 1.
    pub tag_lut: TagLut,
}

impl TypeParser {
    pub(crate) unsafe fn ty<'a>(&self, base: *const u8) -> &'a Type {
        unsafe { resolve(base, self.type_off) }
    }

    pub(crate) unsafe fn parser_at<'a>(&self, base: *const u8, idx: u32) -> &'a FieldParser {
        debug_assert!(idx < self.parser_count);
        unsafe {
            &*((base.add(self.parsers as usize) as *const FieldParser).add(idx as usize))
        }
    }

    pub(crate) unsafe fn dispatch<'a>(&self, base: *const u8) -> &'a Swiss {
        unsafe { resolve(base, self.dispatch) }
    }
}

/// One record per expected wire encoding of a field, threaded by the
/// `next_ok` / `next_err` successors.
#[repr(C)]
pub(crate) struct FieldParser {
    pub tag: u32,
    pub offset: FieldOffset,
    /// Expected repeated-element count; pre-sizes the slice.
    pub preload: u32,
    pub flags: u32,
    /// Taken after this parser matched: the first hot parser of a different
    /// field or oneof (cold parsers wrap to the hot band head).
    pub next_ok: u32,
    /// Miss chain: the next parser in the dense array, wrapping at the tail.
    pub next_err: u32,
    /// Child `TypeParser` for message/group fields, `MapInfo` for maps.
    pub aux: u32,
    pub _pad: u32,
    /// Thunk program counter; `crate::vm::ThunkFn` stored as `usize`.
    pub thunk: usize,
}

pub(crate) const PARSER_VALIDATE_UTF8: u32 = 1 << 0;

/// Decode plan for one map field.
#[repr(C)]
pub(crate) struct MapInfo {
    pub key_shape: u8,
    pub key_kind: u8,
    pub val_kind: u8,
    pub _pad: u8,
    pub key_tag: u32,
    pub val_tag: u32,
    /// Child `Type` for message values, else 0.
    pub val_type: u32,
    pub seed: u64,
}

#[inline(always)]
pub(crate) unsafe fn resolve<'a, T>(base: *const u8, off: u32) -> &'a T {
    debug_assert!(off != 0);
    unsafe { &*(base.add(off as usize) as *const T) }
}

pub(crate) unsafe fn name_str<'a>(base: *const u8, name: NameRef) -> &'a str {
    unsafe {
        let bytes = core::slice::from_raw_parts(base.add(name.off as usize), name.len as usize);
        core::str::from_utf8_unchecked(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_sizes_and_alignment() {
        // The thunk pointer must land on a pointer-aligned boundary.
        assert_eq!(core::mem::offset_of!(FieldParser, thunk) % 8, 0);
        assert_eq!(core::mem::size_of::<FieldParser>() % 8, 0);
        assert_eq!(core::mem::size_of::<FieldOffset>(), 12);
        assert_eq!(core::mem::align_of::<Type>(), 4);
    }

    #[test]
    fn tag_lut_lookup() {
        let mut lut = TagLut::EMPTY;
        lut.0[0x08] = 3;
        assert_eq!(lut.get(0x08), Some(2));
        assert_eq!(lut.get(0x09), None);
        assert_eq!(lut.get(500), None);
    }

    #[test]
    fn cold_offsets_round_trip() {
        let off = FieldOffset {
            data: !40i32,
            bit: NO_BIT,
            number: 9,
        };
        assert!(off.cold());
        assert_eq!(off.cold_offset(), 40);
        let hot = FieldOffset {
            data: 24,
            bit: 3,
            number: 1,
        };
        assert!(!hot.cold());
    }
}
