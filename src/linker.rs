//! Symbol-and-relocation emission of the parser image.
//!
//! The compiler allocates one symbol per record (or record array), fills its
//! data buffer, and registers relocations against other symbols. Linking
//! assigns every symbol a final offset respecting its alignment,
//! concatenates the buffers into a single blob allocated from the library
//! arena, and patches the relocations:
//!
//! - `Rel32`: a 32-bit offset from the image base;
//! - `Abs`: a pointer-sized absolute address inside the final image.

use core::alloc::Layout;
use core::ptr::NonNull;

use crate::arena::Arena;
use crate::util::align_up;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct SymbolId(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum RelocKind {
    /// Pointer-sized absolute address in the final image.
    Abs,
    /// 32-bit offset relative to the image base.
    Rel32,
}

struct Reloc {
    at: u32,
    target: SymbolId,
    /// Byte offset added to the target symbol's address.
    addend: u32,
    kind: RelocKind,
}

struct Symbol {
    align: u32,
    data: Vec<u8>,
    relocs: Vec<Reloc>,
}

#[derive(Default)]
pub(crate) struct Linker {
    symbols: Vec<Symbol>,
}

pub(crate) struct Image {
    pub base: NonNull<u8>,
    pub len: usize,
    /// Final offset of each symbol, indexed by `SymbolId`.
    pub offsets: Vec<u32>,
}

impl Linker {
    pub(crate) fn new() -> Self {
        let mut linker = Linker::default();
        // Offset zero is the "none" sentinel for Rel32 references, so the
        // image starts with a pad symbol no record can land on.
        let pad = linker.symbol(8);
        linker.push_bytes(pad, &[0u8; 8]);
        linker
    }

    pub(crate) fn symbol(&mut self, align: u32) -> SymbolId {
        debug_assert!(align.is_power_of_two());
        let id = SymbolId(self.symbols.len() as u32);
        self.symbols.push(Symbol {
            align,
            data: Vec::new(),
            relocs: Vec::new(),
        });
        id
    }

    pub(crate) fn reserve(&mut self, id: SymbolId, additional: usize) {
        self.symbols[id.0 as usize].data.reserve(additional);
    }

    pub(crate) fn push_bytes(&mut self, id: SymbolId, bytes: &[u8]) -> u32 {
        let data = &mut self.symbols[id.0 as usize].data;
        let at = data.len() as u32;
        data.extend_from_slice(bytes);
        at
    }

    /// Overwrite bytes already pushed to a symbol.
    pub(crate) fn write_at(&mut self, id: SymbolId, at: u32, bytes: &[u8]) {
        let data = &mut self.symbols[id.0 as usize].data;
        data[at as usize..at as usize + bytes.len()].copy_from_slice(bytes);
    }

    /// Append the raw bytes of a `#[repr(C)]` record. Fields that hold
    /// relocated references must be zero; register them with [`Self::reloc`].
    pub(crate) fn push_record<T>(&mut self, id: SymbolId, record: &T) -> u32 {
        let bytes = unsafe {
            core::slice::from_raw_parts(record as *const T as *const u8, core::mem::size_of::<T>())
        };
        self.push_bytes(id, bytes)
    }

    pub(crate) fn reloc(
        &mut self,
        id: SymbolId,
        at: u32,
        target: SymbolId,
        addend: u32,
        kind: RelocKind,
    ) {
        self.symbols[id.0 as usize].relocs.push(Reloc {
            at,
            target,
            addend,
            kind,
        });
    }

    pub(crate) fn link(self, arena: &mut Arena) -> Image {
        let mut offsets = Vec::with_capacity(self.symbols.len());
        let mut cursor = 0usize;
        for sym in &self.symbols {
            cursor = align_up(cursor, sym.align as usize);
            offsets.push(cursor as u32);
            cursor += sym.data.len();
        }
        let len = align_up(cursor.max(1), 8);
        let base = arena.alloc_raw(Layout::from_size_align(len, 8).expect("image layout"));
        unsafe {
            core::ptr::write_bytes(base.as_ptr(), 0, len);
            for (sym, &off) in self.symbols.iter().zip(&offsets) {
                core::ptr::copy_nonoverlapping(
                    sym.data.as_ptr(),
                    base.as_ptr().add(off as usize),
                    sym.data.len(),
                );
            }
            for (sym, &off) in self.symbols.iter().zip(&offsets) {
                for reloc in &sym.relocs {
                    let target = offsets[reloc.target.0 as usize] + reloc.addend;
                    let at = base.as_ptr().add((off + reloc.at) as usize);
                    match reloc.kind {
                        RelocKind::Rel32 => {
                            (at as *mut u32).write_unaligned(target);
                        }
                        RelocKind::Abs => {
                            let addr = base.as_ptr() as usize + target as usize;
                            (at as *mut usize).write_unaligned(addr);
                        }
                    }
                }
            }
        }
        Image {
            base,
            len,
            offsets,
        }
    }
}
