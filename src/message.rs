//! Decoded message representation and field access.
//!
//! A message is a 16-byte header `{shared, type_off, cold_index}`, a bitset
//! of presence bits and oneof which-words, and the hot field region. Rare
//! fields and preserved unknown-field ranges live in a lazily-allocated
//! cold region reached through the shared context's side list.

use core::ptr::NonNull;

use crate::shared::Shared;
use crate::slice::{Repeated, ZcRange};
use crate::swiss::Swiss;
use crate::table::{
    self, Card, Field, FieldKind, FieldOffset, NO_BIT, NO_COLD, ONEOF_FLAG, Type,
};

pub(crate) const HEADER_SIZE: usize = 16;
/// The cold region starts with the unknown-field range list.
pub(crate) const COLD_HEADER: usize = core::mem::size_of::<Repeated<ZcRange>>();

const _: () = assert!(core::mem::size_of::<MessageHeader>() <= HEADER_SIZE);

#[repr(C)]
pub(crate) struct MessageHeader {
    /// Erased pointer to the owning shared context; null only in the
    /// per-type empty instances baked into the image.
    pub shared: *const u8,
    pub type_off: u32,
    /// Index into the shared cold-region list, or [`NO_COLD`].
    pub cold_index: u32,
}

#[inline(always)]
pub(crate) unsafe fn header<'a>(msg: *const u8) -> &'a MessageHeader {
    unsafe { &*(msg as *const MessageHeader) }
}

#[inline(always)]
pub(crate) unsafe fn header_mut<'a>(msg: *mut u8) -> &'a mut MessageHeader {
    unsafe { &mut *(msg as *mut MessageHeader) }
}

#[inline(always)]
pub(crate) unsafe fn bit_is_set(msg: *const u8, bit: u32) -> bool {
    unsafe {
        let word = *(msg.add(HEADER_SIZE + (bit as usize / 32) * 4) as *const u32);
        word & (1 << (bit % 32)) != 0
    }
}

#[inline(always)]
pub(crate) unsafe fn set_bit(msg: *mut u8, bit: u32) {
    unsafe {
        let word = msg.add(HEADER_SIZE + (bit as usize / 32) * 4) as *mut u32;
        *word |= 1 << (bit % 32);
    }
}

#[inline(always)]
pub(crate) unsafe fn which_word(msg: *const u8, word: u32) -> u32 {
    unsafe { *(msg.add(HEADER_SIZE + word as usize * 4) as *const u32) }
}

#[inline(always)]
pub(crate) unsafe fn set_which_word(msg: *mut u8, word: u32, number: u32) {
    unsafe { *(msg.add(HEADER_SIZE + word as usize * 4) as *mut u32) = number }
}

/// Read-only view of a decoded message.
///
/// Views borrow the [`Shared`] context that owns the arena, so any live
/// view keeps the whole parse result alive.
#[derive(Clone, Copy)]
pub struct DynMessage<'a> {
    pub(crate) msg: *const u8,
    pub(crate) shared: &'a Shared<'a>,
}

impl<'a> DynMessage<'a> {
    #[inline(always)]
    pub(crate) fn base(&self) -> *const u8 {
        self.shared.image_base()
    }

    pub(crate) fn ty(&self) -> &'a Type {
        unsafe { table::resolve(self.base(), header(self.msg).type_off) }
    }

    /// Message full name, read from the image's interned string blob.
    pub fn name(&self) -> &'a str {
        unsafe { self.ty().name(self.base()) }
    }

    /// False for the shared empty-message adapter returned when an unset
    /// submessage is read.
    pub fn is_valid(&self) -> bool {
        unsafe { !header(self.msg).shared.is_null() }
    }

    pub fn field_count(&self) -> usize {
        self.ty().field_count as usize
    }

    pub(crate) fn field_at(&self, idx: usize) -> &'a Field {
        unsafe { &self.ty().fields(self.base())[idx] }
    }

    pub(crate) fn field_index_of(&self, number: u32) -> Option<usize> {
        let ty = self.ty();
        if let Some(idx) = ty.num_lut.get(number) {
            return Some(idx as usize);
        }
        let index: &Swiss = unsafe { ty.field_index(self.base()) };
        index
            .find(number as u64, core::ptr::null())
            .map(|slot| index.read_value(slot) as usize)
    }

    /// Address of a field slot; `None` when the slot is cold and the cold
    /// region was never allocated (everything in it is default).
    pub(crate) fn slot_ptr(&self, off: FieldOffset) -> Option<*const u8> {
        if !off.cold() {
            return Some(unsafe { self.msg.add(off.data as usize) });
        }
        let cold_index = unsafe { header(self.msg).cold_index };
        if cold_index == NO_COLD {
            return None;
        }
        let cold = self.shared.cold_region(cold_index);
        Some(unsafe { cold.as_ptr().add(COLD_HEADER + off.cold_offset() as usize) })
    }

    /// Oneof slots alias their sibling variants and may hold another
    /// variant's bits; every read of a oneof member checks the which-word
    /// first and reads defaults when the variant is inactive.
    #[inline(always)]
    fn oneof_active(&self, off: FieldOffset) -> bool {
        if off.bit != NO_BIT && off.bit & ONEOF_FLAG != 0 {
            unsafe { which_word(self.msg, off.bit & !ONEOF_FLAG) == off.number }
        } else {
            true
        }
    }

    #[inline(always)]
    unsafe fn read_raw(&self, off: FieldOffset, width: usize) -> u64 {
        if !self.oneof_active(off) {
            return 0;
        }
        match self.slot_ptr(off) {
            None => 0,
            Some(p) => unsafe {
                match width {
                    1 => *p as u64,
                    4 => (p as *const u32).read() as u64,
                    _ => (p as *const u64).read(),
                }
            },
        }
    }

    /// Presence per archetype: bits for optional fields, which-word equality
    /// for oneof variants, non-null for messages, non-empty for repeated and
    /// map fields, and the zero-equals-unset rule for implicit scalars.
    /// Floats compare raw bit patterns, so negative zero counts as set.
    pub(crate) fn is_set(&self, field: &Field) -> bool {
        let off = field.offset;
        if off.bit != NO_BIT {
            if off.bit & ONEOF_FLAG != 0 {
                return unsafe { which_word(self.msg, off.bit & !ONEOF_FLAG) } == off.number;
            }
            return unsafe { bit_is_set(self.msg, off.bit) };
        }
        match field.card() {
            Card::Repeated => match field.kind() {
                FieldKind::Map => !self
                    .map_table(off)
                    .map(|t| unsafe { t.as_ref() }.len() == 0)
                    .unwrap_or(true),
                _ => self.repeated_len(off) != 0,
            },
            _ => match field.kind() {
                FieldKind::Message | FieldKind::Group => {
                    (unsafe { self.read_raw(off, 8) }) != 0
                }
                FieldKind::String | FieldKind::Bytes => !self.byte_range(off).is_empty(),
                FieldKind::Bool => (unsafe { self.read_raw(off, 1) }) != 0,
                FieldKind::Int32
                | FieldKind::UInt32
                | FieldKind::SInt32
                | FieldKind::Fixed32
                | FieldKind::SFixed32
                | FieldKind::Float
                | FieldKind::Enum => (unsafe { self.read_raw(off, 4) }) != 0,
                _ => (unsafe { self.read_raw(off, 8) }) != 0,
            },
        }
    }

    fn repeated_len(&self, off: FieldOffset) -> usize {
        match self.slot_ptr(off) {
            None => 0,
            Some(p) => unsafe { (*(p as *const Repeated<u8>)).len() },
        }
    }

    pub(crate) fn byte_range(&self, off: FieldOffset) -> ZcRange {
        if !self.oneof_active(off) {
            return ZcRange::default();
        }
        match self.slot_ptr(off) {
            None => ZcRange::default(),
            Some(p) => unsafe { *(p as *const ZcRange) },
        }
    }

    pub(crate) fn map_table(&self, off: FieldOffset) -> Option<NonNull<Swiss>> {
        let p = self.slot_ptr(off)?;
        NonNull::new(unsafe { *(p as *const *mut Swiss) })
    }

    // Typed scalar reads. Unset fields read as the type's default.

    pub(crate) fn scalar_u64(&self, off: FieldOffset) -> u64 {
        unsafe { self.read_raw(off, 8) }
    }

    pub(crate) fn scalar_u32(&self, off: FieldOffset) -> u32 {
        unsafe { self.read_raw(off, 4) as u32 }
    }

    pub(crate) fn scalar_bool(&self, off: FieldOffset) -> bool {
        unsafe { self.read_raw(off, 1) != 0 }
    }

    pub(crate) fn bytes_view(&self, off: FieldOffset) -> &'a [u8] {
        let range = self.byte_range(off);
        debug_assert!(range.end() <= self.shared.src_len);
        unsafe { range.resolve(self.shared.src_ptr()) }
    }

    pub(crate) fn message_at(&self, off: FieldOffset, field: &Field) -> DynMessage<'a> {
        debug_assert!(matches!(
            field.kind(),
            FieldKind::Message | FieldKind::Group
        ));
        let ptr = match self.slot_ptr(off) {
            Some(p) if self.oneof_active(off) => unsafe { *(p as *const *const u8) },
            _ => core::ptr::null(),
        };
        if ptr.is_null() {
            // Unset: the per-type empty instance, so traversal never needs a
            // null check.
            let child: &Type = unsafe { table::resolve(self.base(), field.aux) };
            DynMessage {
                msg: unsafe { self.base().add(child.empty as usize) },
                shared: self.shared,
            }
        } else {
            DynMessage {
                msg: ptr,
                shared: self.shared,
            }
        }
    }

    pub(crate) fn repeated_view<T>(&self, off: FieldOffset) -> &'a [T] {
        match self.slot_ptr(off) {
            None => &[],
            Some(p) => unsafe { (*(p as *const Repeated<T>)).as_slice() },
        }
    }

    /// Element pointer and count of a repeated slot, untyped.
    pub(crate) fn repeated_raw(&self, off: FieldOffset) -> (*const u8, usize) {
        let view = self.repeated_view::<u8>(off);
        // `Repeated<T>` length counts elements regardless of `T`.
        (view.as_ptr(), view.len())
    }

    /// Preserved unknown-field byte runs, in input order.
    pub fn unknown_fields(&self) -> UnknownIter<'a> {
        let ranges = match unsafe { header(self.msg).cold_index } {
            NO_COLD => &[],
            idx => {
                let cold = self.shared.cold_region(idx);
                unsafe { (*(cold.as_ptr() as *const Repeated<ZcRange>)).as_slice() }
            }
        };
        UnknownIter {
            ranges,
            src: self.shared.src_ptr(),
            next: 0,
        }
    }
}

pub struct UnknownIter<'a> {
    ranges: &'a [ZcRange],
    src: *const u8,
    next: usize,
}

impl<'a> Iterator for UnknownIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        let r = *self.ranges.get(self.next)?;
        self.next += 1;
        Some(unsafe { r.resolve(self.src) })
    }
}
