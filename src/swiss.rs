//! Arena-resident open-addressed hash table.
//!
//! One contiguous region holds the header, a control-byte array, the key
//! array and the value array, so a table can live inside the linked parser
//! image (field-number and tag dispatch) as well as in the parse arena
//! (map fields). Slots carry a 7-bit fingerprint in the control byte with
//! the high bit marking occupancy; a zero control byte is an empty slot.
//!
//! Lookup reads 8 control bytes at a time starting at an arbitrary slot; an
//! 8-byte mirror of the head after the tail makes the wraparound load free.
//! Probing is triangular in groups. The table never grows itself: insertion
//! reports `Full` at the 7/8 soft cap and the caller rebuilds.

use core::alloc::Layout;

use crate::arena::Arena;
use crate::util::{align_up, broadcast, zero_bytes};

pub(crate) const MIN_CAP: u32 = 64;
const GROUP: usize = 8;
const HEADER: usize = core::mem::size_of::<Swiss>();

const FX_MULT: u64 = 0x517c_c1b7_2722_0a95;

#[inline(always)]
fn mix(h: u64, w: u64) -> u64 {
    (h.rotate_left(5) ^ w).wrapping_mul(FX_MULT)
}

/// fx-derivative word hash with a 26-bit finalizing rotation.
#[inline(always)]
pub(crate) fn hash_word(seed: u64, w: u64) -> u64 {
    mix(seed, w).rotate_left(26)
}

pub(crate) fn hash_bytes(seed: u64, bytes: &[u8]) -> u64 {
    let mut h = mix(seed, bytes.len() as u64);
    let mut chunks = bytes.chunks_exact(8);
    for c in &mut chunks {
        h = mix(h, u64::from_le_bytes(c.try_into().unwrap()));
    }
    let rem = chunks.remainder();
    if !rem.is_empty() {
        let mut tail = [0u8; 8];
        tail[..rem.len()].copy_from_slice(rem);
        h = mix(h, u64::from_le_bytes(tail));
    }
    h.rotate_left(26)
}

/// Key storage shape. Map keys mirror the wire key type; the compiler's own
/// tables use `U32`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub(crate) enum KeyShape {
    U8 = 0,
    U32 = 1,
    U64 = 2,
    /// A `ZcRange` packed into 64 bits; hashed and compared through the
    /// source buffer.
    Bytes = 3,
}

impl KeyShape {
    #[inline(always)]
    pub(crate) const fn width(self) -> usize {
        match self {
            KeyShape::U8 => 1,
            KeyShape::U32 => 4,
            KeyShape::U64 | KeyShape::Bytes => 8,
        }
    }

    pub(crate) fn from_u8(v: u8) -> KeyShape {
        match v {
            0 => KeyShape::U8,
            1 => KeyShape::U32,
            2 => KeyShape::U64,
            _ => KeyShape::Bytes,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Insert {
    /// Key already present; slot index.
    Found(usize),
    /// Key written to a fresh slot; value storage is zeroed.
    Inserted(usize),
    /// Soft cap reached; the caller must rebuild into a larger table.
    Full,
}

#[repr(C)]
pub(crate) struct Swiss {
    len: u32,
    soft_cap: u32,
    cap: u32,
    key_shape: u8,
    val_width: u8,
    _pad: [u8; 2],
    seed: u64,
}

impl Swiss {
    pub(crate) fn region_size(cap: u32, shape: KeyShape, val_width: u8) -> usize {
        let cap = cap as usize;
        let keys_off = align_up(HEADER + cap + GROUP, 8);
        let vals_off = align_up(keys_off + cap * shape.width(), 8);
        vals_off + cap * val_width as usize
    }

    /// Initialize a zeroed region as an empty table. `cap` must be a power
    /// of two, at least [`MIN_CAP`].
    pub(crate) unsafe fn init(
        ptr: *mut u8,
        cap: u32,
        seed: u64,
        shape: KeyShape,
        val_width: u8,
    ) -> *mut Swiss {
        debug_assert!(cap.is_power_of_two() && cap >= MIN_CAP);
        unsafe {
            core::ptr::write_bytes(ptr, 0, Self::region_size(cap, shape, val_width));
            let hdr = ptr as *mut Swiss;
            (*hdr).len = 0;
            (*hdr).soft_cap = cap / 8 * 7;
            (*hdr).cap = cap;
            (*hdr).key_shape = shape as u8;
            (*hdr).val_width = val_width;
            (*hdr).seed = seed;
            hdr
        }
    }

    pub(crate) fn new_in(
        arena: &mut Arena,
        cap: u32,
        seed: u64,
        shape: KeyShape,
        val_width: u8,
    ) -> *mut Swiss {
        let size = Self::region_size(cap, shape, val_width);
        let ptr = arena
            .alloc_raw(Layout::from_size_align(size, 8).unwrap())
            .as_ptr();
        unsafe { Self::init(ptr, cap, seed, shape, val_width) }
    }

    #[inline(always)]
    pub(crate) fn len(&self) -> usize {
        self.len as usize
    }

    #[inline(always)]
    pub(crate) fn cap(&self) -> u32 {
        self.cap
    }

    #[inline(always)]
    pub(crate) fn shape(&self) -> KeyShape {
        KeyShape::from_u8(self.key_shape)
    }

    #[inline(always)]
    fn base(&self) -> *mut u8 {
        self as *const Swiss as *mut u8
    }

    #[inline(always)]
    fn ctrl(&self) -> *mut u8 {
        unsafe { self.base().add(HEADER) }
    }

    #[inline(always)]
    fn keys(&self) -> *mut u8 {
        let cap = self.cap as usize;
        unsafe { self.base().add(align_up(HEADER + cap + GROUP, 8)) }
    }

    #[inline(always)]
    fn vals(&self) -> *mut u8 {
        let cap = self.cap as usize;
        let keys_off = align_up(HEADER + cap + GROUP, 8);
        unsafe {
            self.base()
                .add(align_up(keys_off + cap * self.shape().width(), 8))
        }
    }

    #[inline(always)]
    pub(crate) fn value_ptr(&self, slot: usize) -> *mut u8 {
        unsafe { self.vals().add(slot * self.val_width as usize) }
    }

    #[inline(always)]
    fn load_key(&self, slot: usize) -> u64 {
        let shape = self.shape();
        unsafe {
            let p = self.keys().add(slot * shape.width());
            match shape {
                KeyShape::U8 => *p as u64,
                KeyShape::U32 => (p as *const u32).read() as u64,
                KeyShape::U64 | KeyShape::Bytes => (p as *const u64).read_unaligned(),
            }
        }
    }

    #[inline(always)]
    fn store_key(&self, slot: usize, key: u64) {
        let shape = self.shape();
        unsafe {
            let p = self.keys().add(slot * shape.width());
            match shape {
                KeyShape::U8 => *p = key as u8,
                KeyShape::U32 => (p as *mut u32).write(key as u32),
                KeyShape::U64 | KeyShape::Bytes => (p as *mut u64).write_unaligned(key),
            }
        }
    }

    #[inline(always)]
    fn hash(&self, key: u64, src: *const u8) -> u64 {
        match self.shape() {
            KeyShape::Bytes => {
                let range = crate::slice::ZcRange::from_bits(key);
                debug_assert!(!src.is_null());
                hash_bytes(self.seed, unsafe { range.resolve(src) })
            }
            _ => hash_word(self.seed, key),
        }
    }

    #[inline(always)]
    fn key_eq(&self, slot: usize, key: u64, src: *const u8) -> bool {
        let stored = self.load_key(slot);
        if stored == key {
            return true;
        }
        if self.shape() == KeyShape::Bytes {
            let a = crate::slice::ZcRange::from_bits(stored);
            let b = crate::slice::ZcRange::from_bits(key);
            unsafe { a.resolve(src) == b.resolve(src) }
        } else {
            false
        }
    }

    /// Read the 8-byte control window starting at `slot`. The tail mirror
    /// makes this valid for every `slot < cap`.
    #[inline(always)]
    fn ctrl_window(&self, slot: usize) -> u64 {
        unsafe { core::ptr::read_unaligned(self.ctrl().add(slot) as *const u64) }.to_le()
    }

    #[inline(always)]
    fn set_ctrl(&self, slot: usize, byte: u8) {
        unsafe {
            *self.ctrl().add(slot) = byte;
            if slot < GROUP {
                *self.ctrl().add(self.cap as usize + slot) = byte;
            }
        }
    }

    pub(crate) fn find(&self, key: u64, src: *const u8) -> Option<usize> {
        let h = self.hash(key, src);
        let h2 = 0x80 | (h & 0x7f) as u8;
        let mask = self.cap as usize - 1;
        let mut slot = (h >> 7) as usize & mask;
        let probe_h2 = broadcast(h2);
        let mut stride = 0usize;
        for _ in 0..self.cap as usize / GROUP + 1 {
            let w = self.ctrl_window(slot);
            let mut matches = zero_bytes(w ^ probe_h2);
            while matches != 0 {
                let lane = matches.trailing_zeros() as usize / 8;
                let s = (slot + lane) & mask;
                if self.key_eq(s, key, src) {
                    return Some(s);
                }
                matches &= matches - 1;
            }
            if zero_bytes(w) != 0 {
                return None;
            }
            stride += GROUP;
            slot = (slot + stride) & mask;
        }
        None
    }

    pub(crate) fn insert(&mut self, key: u64, src: *const u8) -> Insert {
        let h = self.hash(key, src);
        let h2 = 0x80 | (h & 0x7f) as u8;
        let mask = self.cap as usize - 1;
        let mut slot = (h >> 7) as usize & mask;
        let probe_h2 = broadcast(h2);
        let mut stride = 0usize;
        for _ in 0..self.cap as usize / GROUP + 1 {
            let w = self.ctrl_window(slot);
            let mut matches = zero_bytes(w ^ probe_h2);
            while matches != 0 {
                let lane = matches.trailing_zeros() as usize / 8;
                let s = (slot + lane) & mask;
                if self.key_eq(s, key, src) {
                    return Insert::Found(s);
                }
                matches &= matches - 1;
            }
            let empties = zero_bytes(w);
            if empties != 0 {
                if self.len == self.soft_cap {
                    return Insert::Full;
                }
                let lane = empties.trailing_zeros() as usize / 8;
                let s = (slot + lane) & mask;
                self.set_ctrl(s, h2);
                self.store_key(s, key);
                self.len += 1;
                return Insert::Inserted(s);
            }
            stride += GROUP;
            slot = (slot + stride) & mask;
        }
        Insert::Full
    }

    /// Probe with key bytes that live outside the source buffer (reflective
    /// map lookups). Only valid for the `Bytes` shape.
    pub(crate) fn find_bytes(&self, key: &[u8], src: *const u8) -> Option<usize> {
        debug_assert!(self.shape() == KeyShape::Bytes);
        let h = hash_bytes(self.seed, key);
        let h2 = 0x80 | (h & 0x7f) as u8;
        let mask = self.cap as usize - 1;
        let mut slot = (h >> 7) as usize & mask;
        let probe_h2 = broadcast(h2);
        let mut stride = 0usize;
        for _ in 0..self.cap as usize / GROUP + 1 {
            let w = self.ctrl_window(slot);
            let mut matches = zero_bytes(w ^ probe_h2);
            while matches != 0 {
                let lane = matches.trailing_zeros() as usize / 8;
                let s = (slot + lane) & mask;
                let stored = crate::slice::ZcRange::from_bits(self.load_key(s));
                if unsafe { stored.resolve(src) } == key {
                    return Some(s);
                }
                matches &= matches - 1;
            }
            if zero_bytes(w) != 0 {
                return None;
            }
            stride += GROUP;
            slot = (slot + stride) & mask;
        }
        None
    }

    #[inline(always)]
    pub(crate) fn key_bits(&self, slot: usize) -> u64 {
        self.load_key(slot)
    }

    #[inline(always)]
    pub(crate) fn slot_occupied(&self, slot: usize) -> bool {
        unsafe { *self.ctrl().add(slot) != 0 }
    }

    /// Occupied slots in table order.
    pub(crate) fn slots(&self) -> impl Iterator<Item = usize> + '_ {
        let ctrl = self.ctrl();
        (0..self.cap as usize).filter(move |&s| unsafe { *ctrl.add(s) } != 0)
    }

    /// Rebuild into a table of twice the capacity, copying keys and values.
    pub(crate) fn grown(&self, arena: &mut Arena, src: *const u8) -> *mut Swiss {
        let new = Self::new_in(arena, self.cap * 2, self.seed, self.shape(), self.val_width);
        let vw = self.val_width as usize;
        for slot in self.slots() {
            let key = self.load_key(slot);
            let out = unsafe { &mut *new };
            match out.insert(key, src) {
                Insert::Inserted(s) => unsafe {
                    core::ptr::copy_nonoverlapping(self.value_ptr(slot), out.value_ptr(s), vw);
                },
                _ => unreachable!("rehash into larger table"),
            }
        }
        new
    }

    /// Build a table as plain bytes for the linker: capacity is chosen from
    /// the entry count, entries are `(key, value)` pairs with integral keys.
    pub(crate) fn build_image(
        entries: &[(u64, u64)],
        shape: KeyShape,
        val_width: u8,
        seed: u64,
    ) -> Vec<u8> {
        let mut cap = MIN_CAP;
        while entries.len() as u32 >= cap / 8 * 7 {
            cap *= 2;
        }
        let mut bytes = vec![0u8; Self::region_size(cap, shape, val_width)];
        let table = unsafe { Self::init(bytes.as_mut_ptr(), cap, seed, shape, val_width) };
        for &(key, val) in entries {
            let t = unsafe { &mut *table };
            match t.insert(key, core::ptr::null()) {
                Insert::Inserted(slot) | Insert::Found(slot) => unsafe {
                    let p = t.value_ptr(slot);
                    match val_width {
                        4 => (p as *mut u32).write(val as u32),
                        _ => (p as *mut u64).write_unaligned(val),
                    }
                },
                Insert::Full => unreachable!("capacity sized from entry count"),
            }
        }
        bytes
    }

    pub(crate) fn read_value(&self, slot: usize) -> u64 {
        unsafe {
            match self.val_width {
                4 => (self.value_ptr(slot) as *const u32).read() as u64,
                _ => (self.value_ptr(slot) as *const u64).read_unaligned(),
            }
        }
    }

    pub(crate) fn write_value(&self, slot: usize, val: u64) {
        unsafe {
            match self.val_width {
                4 => (self.value_ptr(slot) as *mut u32).write(val as u32),
                _ => (self.value_ptr(slot) as *mut u64).write_unaligned(val),
            }
        }
    }
}
