//! The shared per-parse context.
//!
//! One `Shared` holds everything a decoded message tree points at: the
//! arena, the compiled library, the source span and the side list of cold
//! regions. All messages of one parse share exactly one context; a context
//! can be recycled across parses with [`Shared::free`]. An exclusive lock
//! is taken for the whole parse call: parses on disjoint contexts run in
//! parallel, a second parse on the same context is a programming error.

use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

use allocator_api2::alloc::Allocator;

use crate::arena::Arena;
use crate::error::{ErrorKind, ParseError};
use crate::message::{DynMessage, MessageHeader, header_mut};
use crate::table::{NO_COLD, Type, TypeParser};
use crate::vm::{self, NOT_IN_GROUP, Rest, Vm};
use crate::{Library, TypeHandle};

#[derive(Clone, Copy, Debug)]
pub struct ParseOptions {
    /// Maximum submessage/group nesting before `RecursionDepth`.
    pub max_depth: u32,
    /// Drop unknown fields instead of recording them (OR-ed with the
    /// per-type flag).
    pub discard_unknown: bool,
    /// Allow zero-copy views into the caller's buffer. When false the input
    /// is copied into the arena first, so views share the arena's lifetime.
    pub alias_input: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        ParseOptions {
            max_depth: 1000,
            discard_unknown: false,
            alias_input: true,
        }
    }
}

/// Pooled per-parse transient state: the preallocated frame stack.
pub(crate) struct Scratch {
    pub frames: Vec<vm::Frame>,
}

pub struct Shared<'a> {
    pub(crate) lib: &'a Library<'a>,
    pub(crate) arena: Arena<'a>,
    pub(crate) src: *const u8,
    pub(crate) src_len: u32,
    lock: AtomicBool,
    /// Cold-region pointers, indexed by `MessageHeader.cold_index`. Lives
    /// off-arena so region pointers stay stable while the list grows.
    pub(crate) cold: Vec<NonNull<u8>>,
}

// Safety: a Shared moves between threads as a whole; raw pointers inside it
// target its own arena or the caller-provided input span.
unsafe impl Send for Shared<'_> {}
unsafe impl Sync for Shared<'_> {}

impl<'a> Shared<'a> {
    pub fn new(lib: &'a Library<'a>, alloc: &'a dyn Allocator) -> Self {
        Shared {
            lib,
            arena: Arena::new(alloc),
            src: core::ptr::null(),
            src_len: 0,
            lock: AtomicBool::new(false),
            cold: Vec::new(),
        }
    }

    #[inline(always)]
    pub(crate) fn image_base(&self) -> *const u8 {
        self.lib.base()
    }

    #[inline(always)]
    pub(crate) fn src_ptr(&self) -> *const u8 {
        self.src
    }

    #[inline(always)]
    pub(crate) fn cold_region(&self, idx: u32) -> NonNull<u8> {
        self.cold[idx as usize]
    }

    /// Recycle the context for another parse. Everything previously decoded
    /// from this context must no longer be referenced.
    pub fn free(&mut self) {
        self.arena.free();
        self.cold.clear();
        self.src = core::ptr::null();
        self.src_len = 0;
    }

    /// Decode one message. Synchronous and non-suspending; runs to
    /// completion on the caller's thread. On failure all arena memory
    /// written so far is discarded.
    pub fn parse(
        &mut self,
        ty: TypeHandle<'a>,
        bytes: &[u8],
        options: &ParseOptions,
    ) -> Result<DynMessage<'_>, ParseError> {
        assert!(
            core::ptr::eq(ty.lib as *const Library, self.lib as *const Library),
            "type handle belongs to a different library"
        );
        if bytes.len() as u64 > u32::MAX as u64 {
            return Err(ParseError {
                kind: ErrorKind::TooBig,
                offset: 0,
            });
        }
        if self.lock.swap(true, Ordering::Acquire) {
            panic!("concurrent parse on one shared context");
        }
        let result = self.parse_locked(ty.off, bytes, options);
        self.lock.store(false, Ordering::Release);
        match result {
            Ok(root) => Ok(DynMessage {
                msg: root,
                shared: self,
            }),
            Err(err) => {
                self.arena.free();
                self.cold.clear();
                Err(err)
            }
        }
    }

    fn parse_locked(
        &mut self,
        type_off: u32,
        bytes: &[u8],
        options: &ParseOptions,
    ) -> Result<*mut u8, ParseError> {
        let lib = self.lib;
        let len = bytes.len();
        let src = if options.alias_input || len == 0 {
            bytes.as_ptr()
        } else {
            let copy = self
                .arena
                .alloc_raw(Layout::from_size_align(len, 1).expect("input layout"));
            unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), copy.as_ptr(), len) };
            copy.as_ptr() as *const u8
        };
        self.src = src;
        self.src_len = len as u32;

        let ty: &Type = lib.type_at(type_off);
        let tp: &TypeParser = unsafe { ty.type_parser(lib.base()) };
        let shared_erased = self as *const Shared as *const u8;

        // Root message.
        let root = self.arena.alloc_zeroed(ty.size as usize).as_ptr();
        unsafe {
            *header_mut(root) = MessageHeader {
                shared: shared_erased,
                type_off,
                cold_index: NO_COLD,
            };
        }

        let mut scratch = lib.acquire_scratch(options.max_depth);
        let mut rest = Rest {
            err: None,
            frames: core::mem::take(&mut scratch.frames),
            tp,
            discard_unknown: options.discard_unknown,
            max_depth: options.max_depth,
        };

        let outcome = {
            let Shared {
                ref mut arena,
                ref mut cold,
                ..
            } = *self;
            let mut vm = Vm {
                ptr: src,
                end: unsafe { src.add(len) },
                group_tag: NOT_IN_GROUP,
                depth: 0,
                msg: root,
                fp: if tp.entry == 0 {
                    core::ptr::null()
                } else {
                    unsafe { lib.base().add(tp.entry as usize) as *const _ }
                },
                rest: &mut rest,
                base: lib.base(),
                input: src,
                shared_erased,
                arena,
                cold,
            };
            vm::run(&mut vm)
        };

        scratch.frames = core::mem::take(&mut rest.frames);
        lib.release_scratch(scratch);

        match outcome {
            Ok(()) => Ok(root),
            Err(_) => Err(rest.err.expect("failed parse recorded an error")),
        }
    }
}
