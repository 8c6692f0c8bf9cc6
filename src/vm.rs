//! The interpreter core.
//!
//! Parser state is split into two register groups plus a rest-of-state
//! record: the cursor group (buffer position, limit, open-group tag) and
//! the message group (current message, predicted field parser).
//! The main loop decodes a tag, dispatches through the predicted parser's
//! miss chain, the one-byte tag LUT and the swiss dispatch table in that
//! order, and invokes the matching thunk through the program counter baked
//! into the parser record. Failures write an error record into rest-of-state
//! and unwind non-resumably to the driver.

use core::ptr::NonNull;

use crate::arena::Arena;
use crate::error::{ErrorKind, ParseError};
use crate::message::{COLD_HEADER, MessageHeader, header_mut, set_bit, set_which_word};
use crate::slice::{Repeated, ZcRange};
use crate::table::{
    FieldOffset, FieldParser, NO_BIT, NO_COLD, ONEOF_FLAG, TYPE_DISCARD_UNKNOWN, Type, TypeParser,
};
use crate::util::likely;
use crate::wire::{self, SkipFault, VarintFault, WT_EGROUP};

/// `group_tag` sentinel: not inside a group. No real tag reaches this value.
pub(crate) const NOT_IN_GROUP: u32 = u32::MAX;

/// Misses tolerated on the `next_err` chain before consulting the dispatch
/// table.
pub(crate) const MAX_MISSES: u32 = 4;

/// Non-resumable unwind marker; the error record lives in rest-of-state.
pub(crate) struct Fail;

pub(crate) type ThunkFn = fn(&mut Vm<'_, '_>, &FieldParser) -> Result<(), Fail>;

/// Saved interpreter registers for one suspended message or group scope.
pub(crate) struct Frame {
    pub end: *const u8,
    pub group_tag: u32,
    pub depth: u32,
    pub msg: *mut u8,
    pub tp: *const TypeParser,
    pub fp: *const FieldParser,
}

/// Rest-of-state: everything the hot registers point at.
pub(crate) struct Rest {
    pub err: Option<ParseError>,
    pub frames: Vec<Frame>,
    pub tp: *const TypeParser,
    pub discard_unknown: bool,
    pub max_depth: u32,
}

pub(crate) struct Vm<'s, 'a> {
    // Cursor register group.
    pub ptr: *const u8,
    pub end: *const u8,
    pub group_tag: u32,
    pub depth: u32,
    // Message register group.
    pub msg: *mut u8,
    pub fp: *const FieldParser,
    pub rest: &'s mut Rest,
    // Ambient per-parse state.
    pub base: *const u8,
    pub input: *const u8,
    pub shared_erased: *const u8,
    pub arena: &'s mut Arena<'a>,
    pub cold: &'s mut Vec<NonNull<u8>>,
}

impl<'s, 'a> Vm<'s, 'a> {
    #[inline(always)]
    pub(crate) fn offset_of(&self, p: *const u8) -> usize {
        p as usize - self.input as usize
    }

    #[inline(never)]
    pub(crate) fn fail_at(&mut self, kind: ErrorKind, p: *const u8) -> Fail {
        if self.rest.err.is_none() {
            self.rest.err = Some(ParseError {
                kind,
                offset: self.offset_of(p),
            });
        }
        Fail
    }

    fn fail_varint(&mut self, fault: VarintFault, start: *const u8) -> Fail {
        match fault {
            VarintFault::Truncated => self.fail_at(ErrorKind::Truncated, self.end),
            VarintFault::Overflow => self.fail_at(ErrorKind::Overflow, start),
        }
    }

    fn fail_skip(&mut self, fault: SkipFault, start: *const u8) -> Fail {
        let kind = match fault {
            SkipFault::Truncated => return self.fail_at(ErrorKind::Truncated, self.end),
            SkipFault::Overflow => ErrorKind::Overflow,
            SkipFault::Reserved => ErrorKind::Reserved,
            SkipFault::FieldNumber => ErrorKind::FieldNumber,
            SkipFault::EndGroup => ErrorKind::EndGroup,
            SkipFault::Depth => ErrorKind::RecursionDepth,
        };
        self.fail_at(kind, start)
    }

    #[inline(always)]
    pub(crate) fn read_varint(&mut self) -> Result<u64, Fail> {
        let p = self.ptr;
        if likely(p < self.end) {
            let b = unsafe { *p };
            if likely(b < 0x80) {
                self.ptr = unsafe { p.add(1) };
                return Ok(b as u64);
            }
        }
        match wire::read_varint(p, self.end) {
            Ok((v, np)) => {
                self.ptr = np;
                Ok(v)
            }
            Err(f) => Err(self.fail_varint(f, p)),
        }
    }

    /// Length prefix plus bounds check against the current limit; the cursor
    /// advances past the prefix only.
    #[inline(always)]
    pub(crate) fn read_len(&mut self) -> Result<usize, Fail> {
        let start = self.ptr;
        let len = match wire::read_len(self.ptr, self.end) {
            Ok((len, np)) => {
                self.ptr = np;
                len as usize
            }
            Err(f) => return Err(self.fail_varint(f, start)),
        };
        if len > self.end as usize - self.ptr as usize {
            return Err(self.fail_at(ErrorKind::Truncated, self.end));
        }
        Ok(len)
    }

    #[inline(always)]
    pub(crate) fn need(&mut self, n: usize) -> Result<(), Fail> {
        if likely(self.end as usize - self.ptr as usize >= n) {
            Ok(())
        } else {
            Err(self.fail_at(ErrorKind::Truncated, self.end))
        }
    }

    // --- field storage -----------------------------------------------------

    /// Lazily-allocated cold region of the current message.
    pub(crate) fn cold_region(&mut self) -> *mut u8 {
        let hdr = unsafe { header_mut(self.msg) };
        if hdr.cold_index != NO_COLD {
            return self.cold[hdr.cold_index as usize].as_ptr();
        }
        let ty: &Type = unsafe { (*self.rest.tp).ty(self.base) };
        let region = self
            .arena
            .alloc_zeroed(COLD_HEADER + ty.cold_size as usize);
        hdr.cold_index = self.cold.len() as u32;
        self.cold.push(region);
        region.as_ptr()
    }

    /// Resolved slot address; allocates the cold region on first cold write.
    #[inline(always)]
    pub(crate) fn slot_ptr(&mut self, off: FieldOffset) -> *mut u8 {
        if likely(!off.cold()) {
            unsafe { self.msg.add(off.data as usize) }
        } else {
            let cold = self.cold_region();
            unsafe { cold.add(COLD_HEADER + off.cold_offset() as usize) }
        }
    }

    /// Set the presence bit or oneof which-word, if the field has either.
    #[inline(always)]
    pub(crate) fn mark(&mut self, off: FieldOffset) {
        let bit = off.bit;
        if bit == NO_BIT {
            return;
        }
        unsafe {
            if bit & ONEOF_FLAG != 0 {
                set_which_word(self.msg, bit & !ONEOF_FLAG, off.number);
            } else {
                set_bit(self.msg, bit);
            }
        }
    }

    #[inline(always)]
    pub(crate) fn store8(&mut self, off: FieldOffset, v: u8) {
        unsafe { *self.slot_ptr(off) = v };
        self.mark(off);
    }

    #[inline(always)]
    pub(crate) fn store32(&mut self, off: FieldOffset, v: u32) {
        unsafe { (self.slot_ptr(off) as *mut u32).write(v) };
        self.mark(off);
    }

    #[inline(always)]
    pub(crate) fn store64(&mut self, off: FieldOffset, v: u64) {
        unsafe { (self.slot_ptr(off) as *mut u64).write(v) };
        self.mark(off);
    }

    #[inline(always)]
    pub(crate) fn store_range(&mut self, off: FieldOffset, range: ZcRange) {
        unsafe { (self.slot_ptr(off) as *mut ZcRange).write(range) };
        self.mark(off);
    }

    /// The repeated slice slot, pre-sized from the preload hint on first use.
    #[inline(always)]
    pub(crate) fn repeated_slot<T>(&mut self, off: FieldOffset, preload: u32) -> *mut Repeated<T> {
        let slot = self.slot_ptr(off) as *mut Repeated<T>;
        let rep = unsafe { &mut *slot };
        if preload != 0 && rep.capacity() == 0 && !rep.is_off_arena() {
            rep.reserve(preload as usize, self.arena);
        }
        slot
    }

    // --- message and group scopes ------------------------------------------

    pub(crate) fn resolve_fp(&self, off: u32) -> *const FieldParser {
        if off == 0 {
            core::ptr::null()
        } else {
            unsafe { self.base.add(off as usize) as *const FieldParser }
        }
    }

    pub(crate) fn alloc_message(&mut self, ty: &Type) -> *mut u8 {
        let msg = self.arena.alloc_zeroed(ty.size as usize).as_ptr();
        let type_off = ty as *const Type as usize - self.base as usize;
        unsafe {
            *header_mut(msg) = MessageHeader {
                shared: self.shared_erased,
                type_off: type_off as u32,
                cold_index: NO_COLD,
            };
        }
        msg
    }

    /// Enter a length-prefixed submessage scope. When the subrange is the
    /// whole remaining range and no group is open, the push is elided (tail
    /// position); the parent had nothing left to parse.
    pub(crate) fn push_message_frame(
        &mut self,
        child: *mut u8,
        child_tp: &TypeParser,
        sub_end: *const u8,
    ) -> Result<(), Fail> {
        if self.depth >= self.rest.max_depth {
            return Err(self.fail_at(ErrorKind::RecursionDepth, self.ptr));
        }
        if !(sub_end == self.end && self.group_tag == NOT_IN_GROUP) {
            self.rest.frames.push(Frame {
                end: self.end,
                group_tag: self.group_tag,
                depth: self.depth,
                msg: self.msg,
                tp: self.rest.tp,
                fp: self.fp,
            });
            self.end = sub_end;
            self.group_tag = NOT_IN_GROUP;
        }
        self.depth += 1;
        self.msg = child;
        self.rest.tp = child_tp;
        self.fp = self.resolve_fp(child_tp.entry);
        Ok(())
    }

    /// Enter a group scope; only the matching end-group tag pops it.
    pub(crate) fn push_group_frame(
        &mut self,
        child: *mut u8,
        child_tp: &TypeParser,
        end_tag: u32,
    ) -> Result<(), Fail> {
        if self.depth >= self.rest.max_depth {
            return Err(self.fail_at(ErrorKind::RecursionDepth, self.ptr));
        }
        self.rest.frames.push(Frame {
            end: self.end,
            group_tag: self.group_tag,
            depth: self.depth,
            msg: self.msg,
            tp: self.rest.tp,
            fp: self.fp,
        });
        self.group_tag = end_tag;
        self.depth += 1;
        self.msg = child;
        self.rest.tp = child_tp;
        self.fp = self.resolve_fp(child_tp.entry);
        Ok(())
    }

    fn pop_frame(&mut self) {
        let f = self.rest.frames.pop().expect("frame stack underflow");
        self.end = f.end;
        self.group_tag = f.group_tag;
        self.depth = f.depth;
        self.msg = f.msg;
        self.rest.tp = f.tp;
        self.fp = f.fp;
    }

    fn record_unknown(&mut self, start: *const u8, end: *const u8) {
        let ty: &Type = unsafe { (*self.rest.tp).ty(self.base) };
        if self.rest.discard_unknown || ty.flags & TYPE_DISCARD_UNKNOWN != 0 {
            return;
        }
        let offset = self.offset_of(start) as u32;
        let len = (end as usize - start as usize) as u32;
        let cold = self.cold_region() as *mut Repeated<ZcRange>;
        let list = unsafe { &mut *cold };
        // Adjacent unknown runs coalesce into one range.
        if let Some(last) = list.last_mut() {
            if last.end() == offset {
                last.len += len;
                return;
            }
        }
        list.push(ZcRange::new(offset, len), self.arena);
    }
}

/// The main loop. Runs until the cursor reaches the current limit with the
/// frame stack back at its entry level; re-entrant for map-value parses.
pub(crate) fn run(vm: &mut Vm<'_, '_>) -> Result<(), Fail> {
    let floor = vm.rest.frames.len();
    loop {
        // CheckDone / Pop.
        if vm.ptr >= vm.end {
            debug_assert!(vm.ptr == vm.end, "thunks never overrun the limit");
            if vm.group_tag != NOT_IN_GROUP {
                return Err(vm.fail_at(ErrorKind::Truncated, vm.end));
            }
            if vm.rest.frames.len() == floor {
                return Ok(());
            }
            vm.pop_frame();
            continue;
        }

        // Number: single-byte tags are the overwhelmingly common case.
        let rec_start = vm.ptr;
        let b = unsafe { *vm.ptr };
        let tag = if likely(b < 0x80) {
            vm.ptr = unsafe { vm.ptr.add(1) };
            b as u32
        } else {
            match wire::read_tag_slow(vm.ptr, vm.end) {
                Ok((t, p)) => {
                    vm.ptr = p;
                    t
                }
                Err(f) => return Err(vm.fail_varint(f, rec_start)),
            }
        };
        if tag >> 3 == 0 {
            return Err(vm.fail_at(ErrorKind::FieldNumber, rec_start));
        }

        // Field: predicted parser, then the bounded miss chain.
        let mut fp = vm.fp;
        let mut hit = !fp.is_null() && unsafe { (*fp).tag } == tag;
        if !hit && !fp.is_null() {
            let mut cur = fp;
            for _ in 0..MAX_MISSES {
                cur = unsafe { vm.base.add((*cur).next_err as usize) as *const FieldParser };
                if unsafe { (*cur).tag } == tag {
                    fp = cur;
                    hit = true;
                    break;
                }
            }
        }
        // MissedField: one-byte LUT, then the dispatch table.
        if !hit {
            let tp = unsafe { &*vm.rest.tp };
            let idx = tp.tag_lut.get(tag).or_else(|| {
                let dispatch = unsafe { tp.dispatch(vm.base) };
                dispatch
                    .find(tag as u64, core::ptr::null())
                    .map(|slot| dispatch.read_value(slot) as u32)
            });
            if let Some(idx) = idx {
                fp = unsafe { tp.parser_at(vm.base, idx) };
                hit = true;
            }
        }
        if hit {
            // ParseField: predict the successor before invoking the thunk so
            // message thunks can stash it in their frame.
            let rec = unsafe { &*fp };
            vm.fp = vm.resolve_fp(rec.next_ok);
            let thunk: ThunkFn = unsafe { core::mem::transmute(rec.thunk) };
            thunk(vm, rec)?;
            continue;
        }

        // A matching end-group tag closes the open group scope.
        if tag & 7 == WT_EGROUP {
            if tag == vm.group_tag {
                vm.pop_frame();
                continue;
            }
            return Err(vm.fail_at(ErrorKind::EndGroup, rec_start));
        }

        // Unknown field: wire-type-directed skip, recorded unless discarded.
        match wire::consume_field_value(tag, vm.ptr, vm.end) {
            Ok(p) => {
                vm.ptr = p;
                vm.record_unknown(rec_start, p);
            }
            Err(f) => return Err(vm.fail_skip(f, rec_start)),
        }
    }
}
