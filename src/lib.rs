//! A data-driven protobuf wire-format decoder.
//!
//! Instead of generating code per message, `protovm` compiles a message
//! descriptor graph known only at run time into an immutable parser image
//! (a [`Library`]), then repeatedly decodes wire bytes into arena-backed
//! dynamic messages inspected through reflection:
//!
//! ```
//! use protovm::descriptor::{DescriptorPool, FieldDescriptor, Kind, MessageDescriptor};
//! use protovm::{CompileOptions, Global, Library, ParseOptions, Shared};
//!
//! let mut pool = DescriptorPool::new();
//! let root = pool.add(
//!     MessageDescriptor::new("demo.Point")
//!         .field(FieldDescriptor::new(1, "x", Kind::Int32))
//!         .field(FieldDescriptor::new(2, "y", Kind::Int32)),
//! );
//! let lib = Library::compile(&pool, root, &CompileOptions::default(), &Global).unwrap();
//! let mut shared = Shared::new(&lib, &Global);
//! let msg = shared
//!     .parse(lib.root(), &[0x08, 0x2A, 0x10, 0x07], &ParseOptions::default())
//!     .unwrap();
//! let x = msg.field_by_name("x").unwrap();
//! assert_eq!(msg.get_i32(x), 42);
//! ```
//!
//! Decoding is zero-copy where the wire format allows it: string, bytes and
//! packed fixed fields are ranges into (or borrows of) the input buffer.
//! One compiled [`Library`] is immutable and freely shared across threads;
//! each thread parses through its own [`Shared`] context.

pub mod arena;
pub mod descriptor;
pub mod error;
pub mod profile;
pub mod reflect;

mod compiler;
mod ir;
mod layout;
mod linker;
mod message;
mod scc;
mod shared;
mod slice;
mod swiss;
mod table;
mod thunks;
mod util;
mod vm;
mod wire;

use std::collections::HashMap;
use std::sync::Mutex;

use allocator_api2::alloc::Allocator;
pub use allocator_api2::alloc::Global;

use arena::Arena;
use descriptor::{DescriptorPool, ExtensionResolver, MessageIndex};
pub use error::{CompileError, ErrorKind, ParseError};
pub use message::DynMessage;
pub use profile::{FieldHints, Profile};
pub use reflect::{FieldRef, ListRef, MapKeyRef, MapRef, Value};
pub use shared::{ParseOptions, Shared};
pub use slice::Repeated;

use core::ptr::NonNull;

#[derive(Default)]
pub struct CompileOptions<'x> {
    /// Field hints driving hot/cold placement, pre-sizing and UTF-8 trust.
    pub profile: Option<&'x Profile>,
    /// Source of extension fields, consulted per message full name.
    pub extensions: Option<&'x dyn ExtensionResolver>,
}

/// A compiled parser image plus the arena that owns it.
///
/// Immutable after compilation; share it freely. Decoding goes through a
/// per-thread [`Shared`] context.
pub struct Library<'a> {
    arena: Arena<'a>,
    image: NonNull<u8>,
    image_len: usize,
    root_off: u32,
    types: HashMap<String, u32>,
    scratch: Mutex<Vec<shared::Scratch>>,
}

// Safety: the image is written only during compile; afterwards everything
// reachable from Library is read-only (the scratch pool is behind a Mutex).
unsafe impl Send for Library<'_> {}
unsafe impl Sync for Library<'_> {}

impl<'a> Library<'a> {
    /// Compile every message reachable from `root` into one parser image.
    pub fn compile(
        pool: &DescriptorPool,
        root: MessageIndex,
        options: &CompileOptions<'_>,
        alloc: &'a dyn Allocator,
    ) -> Result<Self, CompileError> {
        let mut arena = Arena::new(alloc);
        let compiled =
            compiler::compile(pool, root, options.profile, options.extensions, &mut arena)?;
        Ok(Library {
            arena,
            image: compiled.image.base,
            image_len: compiled.image.len,
            root_off: compiled.root_type_off,
            types: compiled.types.into_iter().collect(),
            scratch: Mutex::new(Vec::new()),
        })
    }

    pub fn root(&self) -> TypeHandle<'_> {
        TypeHandle {
            lib: self,
            off: self.root_off,
        }
    }

    pub fn type_by_name(&self, full_name: &str) -> Option<TypeHandle<'_>> {
        self.types.get(full_name).map(|&off| TypeHandle {
            lib: self,
            off,
        })
    }

    /// Total memory held by the compiled image.
    pub fn compiled_size(&self) -> usize {
        self.arena.bytes_allocated()
    }

    #[inline(always)]
    pub(crate) fn base(&self) -> *const u8 {
        self.image.as_ptr()
    }

    pub(crate) fn type_at(&self, off: u32) -> &table::Type {
        debug_assert!((off as usize) < self.image_len);
        unsafe { table::resolve(self.base(), off) }
    }

    pub(crate) fn acquire_scratch(&self, max_depth: u32) -> shared::Scratch {
        let mut scratch = self
            .scratch
            .lock()
            .expect("scratch pool poisoned")
            .pop()
            .unwrap_or(shared::Scratch { frames: Vec::new() });
        if scratch.frames.capacity() < max_depth as usize {
            scratch
                .frames
                .reserve_exact(max_depth as usize - scratch.frames.len());
        }
        scratch
    }

    pub(crate) fn release_scratch(&self, mut scratch: shared::Scratch) {
        scratch.frames.clear();
        self.scratch
            .lock()
            .expect("scratch pool poisoned")
            .push(scratch);
    }
}

/// Handle to one compiled message type inside a [`Library`].
#[derive(Clone, Copy)]
pub struct TypeHandle<'l> {
    pub(crate) lib: &'l Library<'l>,
    pub(crate) off: u32,
}

impl<'l> TypeHandle<'l> {
    pub fn name(&self) -> &'l str {
        unsafe { self.lib.type_at(self.off).name(self.lib.base()) }
    }

    /// Whether this message (transitively, across descriptor cycles)
    /// contains a proto2 required field.
    pub fn contains_required(&self) -> bool {
        self.lib.type_at(self.off).flags & table::TYPE_CONTAINS_REQUIRED != 0
    }

    /// Size of the hot message struct in bytes.
    pub fn message_size(&self) -> usize {
        self.lib.type_at(self.off).size as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use descriptor::{FieldDescriptor, Kind, MapKey, MessageDescriptor};

    fn compile(pool: &DescriptorPool, root: MessageIndex) -> Library<'static> {
        Library::compile(pool, root, &CompileOptions::default(), &Global).unwrap()
    }

    fn parse_ok<'s>(shared: &'s mut Shared<'_>, bytes: &[u8]) -> DynMessage<'s> {
        let ty = shared_root(shared);
        shared.parse(ty, bytes, &ParseOptions::default()).unwrap()
    }

    fn shared_root<'a>(shared: &Shared<'a>) -> TypeHandle<'a> {
        // Shared borrows the library for 'a; the root handle shares it.
        TypeHandle {
            lib: shared_lib(shared),
            off: shared_lib(shared).root_off,
        }
    }

    fn shared_lib<'a>(shared: &Shared<'a>) -> &'a Library<'a> {
        shared.lib
    }

    fn parse_err(pool: &DescriptorPool, root: MessageIndex, bytes: &[u8]) -> ParseError {
        let lib = compile(pool, root);
        let mut shared = Shared::new(&lib, &Global);
        shared
            .parse(lib.root(), bytes, &ParseOptions::default())
            .unwrap_err()
    }

    fn scalar_pool() -> (DescriptorPool, MessageIndex) {
        let mut pool = DescriptorPool::new();
        let root = pool.add(
            MessageDescriptor::new("t.Scalars")
                .field(FieldDescriptor::new(1, "i32", Kind::Int32))
                .field(FieldDescriptor::new(2, "s", Kind::String))
                .field(FieldDescriptor::new(3, "u64s", Kind::UInt64).repeated())
                .field(FieldDescriptor::new(4, "z", Kind::SInt64))
                .field(FieldDescriptor::new(5, "d", Kind::Double))
                .field(FieldDescriptor::new(6, "b", Kind::Bytes))
                .field(FieldDescriptor::new(7, "f", Kind::Float))
                .field(FieldDescriptor::new(8, "ob", Kind::Bool).optional()),
        );
        (pool, root)
    }

    #[test]
    fn singular_varint() {
        let (pool, root) = scalar_pool();
        let lib = compile(&pool, root);
        let mut shared = Shared::new(&lib, &Global);
        let msg = parse_ok(&mut shared, &[0x08, 0x2A]);
        let f = msg.field_by_number(1).unwrap();
        assert!(msg.has(f));
        assert_eq!(msg.get_i32(f), 42);
        // Implicit siblings read as defaults.
        let s = msg.field_by_number(2).unwrap();
        assert!(!msg.has(s));
        assert_eq!(msg.get_str(s), "");
    }

    #[test]
    fn negative_int32_uses_ten_byte_varint() {
        let (pool, root) = scalar_pool();
        let lib = compile(&pool, root);
        let mut shared = Shared::new(&lib, &Global);
        let mut bytes = vec![0x08];
        bytes.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]);
        let msg = parse_ok(&mut shared, &bytes);
        let f = msg.field_by_number(1).unwrap();
        assert_eq!(msg.get_i32(f), -1);
    }

    #[test]
    fn string_is_zero_copy() {
        let (pool, root) = scalar_pool();
        let lib = compile(&pool, root);
        let mut shared = Shared::new(&lib, &Global);
        let input = [0x0A, 0x05, b'h', b'e', b'l', b'l', b'o'];
        let msg = parse_ok(&mut shared, &input);
        let f = msg.field_by_number(2).unwrap();
        assert_eq!(msg.get_str(f), "hello");
        // The view aliases the input buffer.
        assert_eq!(msg.get_bytes(f).as_ptr(), input[2..].as_ptr());
    }

    #[test]
    fn copied_input_when_aliasing_disabled() {
        let (pool, root) = scalar_pool();
        let lib = compile(&pool, root);
        let mut shared = Shared::new(&lib, &Global);
        let input = vec![0x0A, 0x02, b'h', b'i'];
        let opts = ParseOptions {
            alias_input: false,
            ..Default::default()
        };
        let ty = lib.root();
        let msg = shared.parse(ty, &input, &opts).unwrap();
        let f = msg.field_by_number(2).unwrap();
        assert_eq!(msg.get_str(f), "hi");
        assert_ne!(msg.get_bytes(f).as_ptr(), input[2..].as_ptr());
    }

    #[test]
    fn zigzag_and_floats() {
        let (pool, root) = scalar_pool();
        let lib = compile(&pool, root);
        let mut shared = Shared::new(&lib, &Global);
        // z = sint64 -3 (zigzag 5), d = 1.5, f = -2.0
        let mut bytes = vec![0x20, 0x05];
        bytes.push(0x29);
        bytes.extend_from_slice(&1.5f64.to_le_bytes());
        bytes.push(0x3D);
        bytes.extend_from_slice(&(-2.0f32).to_le_bytes());
        let msg = parse_ok(&mut shared, &bytes);
        assert_eq!(msg.get_i64(msg.field_by_number(4).unwrap()), -3);
        assert_eq!(msg.get_f64(msg.field_by_number(5).unwrap()), 1.5);
        assert_eq!(msg.get_f32(msg.field_by_number(7).unwrap()), -2.0);
    }

    #[test]
    fn negative_zero_float_is_present() {
        let (pool, root) = scalar_pool();
        let lib = compile(&pool, root);
        let mut shared = Shared::new(&lib, &Global);
        let mut bytes = vec![0x3D];
        bytes.extend_from_slice(&(-0.0f32).to_le_bytes());
        let msg = parse_ok(&mut shared, &bytes);
        let f = msg.field_by_number(7).unwrap();
        // Raw bit patterns decide: negative zero is set, positive is not.
        assert!(msg.has(f));
        shared.free();
        let mut bytes = vec![0x3D];
        bytes.extend_from_slice(&0.0f32.to_le_bytes());
        let msg = parse_ok(&mut shared, &bytes);
        let f = msg.field_by_number(7).unwrap();
        assert!(!msg.has(f));
    }

    #[test]
    fn optional_bool_presence_bit() {
        let (pool, root) = scalar_pool();
        let lib = compile(&pool, root);
        let mut shared = Shared::new(&lib, &Global);
        let msg = parse_ok(&mut shared, &[0x40, 0x00]);
        let f = msg.field_by_number(8).unwrap();
        // Explicit presence: false on the wire is still present.
        assert!(msg.has(f));
        assert!(!msg.get_bool(f));
    }

    #[test]
    fn packed_repeated_int32() {
        let mut pool = DescriptorPool::new();
        let root = pool.add(
            MessageDescriptor::new("t.Packed")
                .field(FieldDescriptor::new(2, "xs", Kind::Int32).repeated()),
        );
        let lib = compile(&pool, root);
        let mut shared = Shared::new(&lib, &Global);
        let msg = parse_ok(&mut shared, &[0x12, 0x03, 0x01, 0x02, 0x03]);
        let f = msg.field_by_number(2).unwrap();
        let list = msg.get_list(f);
        assert_eq!(list.len(), 3);
        let values: Vec<i32> = list
            .iter()
            .map(|v| match v {
                Value::I32(x) => x,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(values, [1, 2, 3]);
    }

    #[test]
    fn mixed_packed_and_unpacked_elements() {
        let mut pool = DescriptorPool::new();
        let root = pool.add(
            MessageDescriptor::new("t.Packed")
                .field(FieldDescriptor::new(1, "xs", Kind::Int32).repeated()),
        );
        let lib = compile(&pool, root);
        let mut shared = Shared::new(&lib, &Global);
        // Packed run [1, 2], unpacked 3, packed run [4].
        let msg = parse_ok(&mut shared, &[0x0A, 0x02, 0x01, 0x02, 0x08, 0x03, 0x0A, 0x01, 0x04]);
        let list = msg.get_list(msg.field_by_number(1).unwrap());
        let values: Vec<i32> = list
            .iter()
            .map(|v| match v {
                Value::I32(x) => x,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(values, [1, 2, 3, 4]);
    }

    #[test]
    fn packed_fixed_adopts_input_then_spills() {
        let mut pool = DescriptorPool::new();
        let root = pool.add(
            MessageDescriptor::new("t.Fix")
                .field(FieldDescriptor::new(1, "xs", Kind::Fixed32).repeated()),
        );
        let lib = compile(&pool, root);
        let mut shared = Shared::new(&lib, &Global);
        // Offset the payload so it is 4-aligned: tag+len occupy 2 bytes, so
        // build an input whose payload alignment we can observe either way.
        let mut bytes = vec![0x0A, 0x08];
        bytes.extend_from_slice(&7u32.to_le_bytes());
        bytes.extend_from_slice(&9u32.to_le_bytes());
        let msg = parse_ok(&mut shared, &bytes);
        let list = msg.get_list(msg.field_by_number(1).unwrap());
        assert_eq!(list.len(), 2);
        match (list.get(0), list.get(1)) {
            (Value::U32(7), Value::U32(9)) => {}
            other => panic!("unexpected {other:?}"),
        }

        shared.free();
        // A second packed run forces a spill and both runs survive.
        let mut twice = bytes.clone();
        twice.extend_from_slice(&[0x0A, 0x04]);
        twice.extend_from_slice(&1u32.to_le_bytes());
        let msg = parse_ok(&mut shared, &twice);
        let list = msg.get_list(msg.field_by_number(1).unwrap());
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn string_map_decodes_and_swapped_order_matches() {
        let mut pool = DescriptorPool::new();
        let root = pool.add(MessageDescriptor::new("t.M").field(FieldDescriptor::new(
            3,
            "m",
            Kind::Map {
                key: MapKey::String,
                value: Box::new(Kind::Int32),
            },
        )));
        let lib = compile(&pool, root);
        let mut shared = Shared::new(&lib, &Global);
        let input = [
            0x1A, 0x07, 0x0A, 0x03, b'f', b'o', b'o', 0x10, 0x2A, // {"foo": 42}
            0x1A, 0x07, 0x0A, 0x03, b'b', b'a', b'r', 0x10, 0x01, // {"bar": 1}
        ];
        let msg = parse_ok(&mut shared, &input);
        let map = msg.get_map(msg.field_by_number(3).unwrap());
        assert_eq!(map.len(), 2);
        match map.get(MapKeyRef::Str("foo")) {
            Some(Value::I32(42)) => {}
            other => panic!("unexpected {other:?}"),
        }
        match map.get(MapKeyRef::Str("bar")) {
            Some(Value::I32(1)) => {}
            other => panic!("unexpected {other:?}"),
        }
        assert!(map.get(MapKeyRef::Str("baz")).is_none());

        // Swapping key and value tags within an entry decodes identically.
        let mut shared2 = Shared::new(&lib, &Global);
        let swapped = [
            0x1A, 0x07, 0x10, 0x2A, 0x0A, 0x03, b'f', b'o', b'o',
            0x1A, 0x07, 0x10, 0x01, 0x0A, 0x03, b'b', b'a', b'r',
        ];
        let ty = lib.root();
        let msg2 = shared2.parse(ty, &swapped, &ParseOptions::default()).unwrap();
        let map2 = msg2.get_map(msg2.field_by_number(3).unwrap());
        assert_eq!(map2.len(), 2);
        match map2.get(MapKeyRef::Str("foo")) {
            Some(Value::I32(42)) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn map_duplicate_keys_last_wins() {
        let mut pool = DescriptorPool::new();
        let root = pool.add(MessageDescriptor::new("t.M").field(FieldDescriptor::new(
            1,
            "m",
            Kind::Map {
                key: MapKey::UInt32,
                value: Box::new(Kind::UInt64),
            },
        )));
        let lib = compile(&pool, root);
        let mut shared = Shared::new(&lib, &Global);
        let input = [
            0x0A, 0x04, 0x08, 0x07, 0x10, 0x01, // {7: 1}
            0x0A, 0x04, 0x08, 0x07, 0x10, 0x02, // {7: 2}
        ];
        let msg = parse_ok(&mut shared, &input);
        let map = msg.get_map(msg.field_by_number(1).unwrap());
        assert_eq!(map.len(), 1);
        match map.get(MapKeyRef::U32(7)) {
            Some(Value::U64(2)) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn map_with_message_values() {
        let mut pool = DescriptorPool::new();
        let child = pool.add(
            MessageDescriptor::new("t.Child")
                .field(FieldDescriptor::new(1, "v", Kind::Int32)),
        );
        let root = pool.add(MessageDescriptor::new("t.M").field(FieldDescriptor::new(
            1,
            "m",
            Kind::Map {
                key: MapKey::Int32,
                value: Box::new(Kind::Message(child)),
            },
        )));
        let lib = compile(&pool, root);
        let mut shared = Shared::new(&lib, &Global);
        // {5: Child{v: 9}}
        let input = [0x0A, 0x06, 0x08, 0x05, 0x12, 0x02, 0x08, 0x09];
        let msg = parse_ok(&mut shared, &input);
        let map = msg.get_map(msg.field_by_number(1).unwrap());
        match map.get(MapKeyRef::I32(5)) {
            Some(Value::Message(child)) => {
                assert!(child.is_valid());
                assert_eq!(child.get_i32(child.field_by_number(1).unwrap()), 9);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn nested_messages_and_merging() {
        let mut pool = DescriptorPool::new();
        let child = pool.add(
            MessageDescriptor::new("t.Child")
                .field(FieldDescriptor::new(1, "a", Kind::Int32))
                .field(FieldDescriptor::new(2, "b", Kind::Int32)),
        );
        let root = pool.add(
            MessageDescriptor::new("t.Parent")
                .field(FieldDescriptor::new(1, "c", Kind::Message(child)))
                .field(FieldDescriptor::new(2, "tail", Kind::Int32)),
        );
        let lib = compile(&pool, root);
        let mut shared = Shared::new(&lib, &Global);
        // Two occurrences of the submessage merge into one child.
        let input = [
            0x0A, 0x02, 0x08, 0x05, // c { a: 5 }
            0x0A, 0x02, 0x10, 0x06, // c { b: 6 }
            0x10, 0x01, // tail = 1
        ];
        let msg = parse_ok(&mut shared, &input);
        let c = msg.get_message(msg.field_by_number(1).unwrap());
        assert!(c.is_valid());
        assert_eq!(c.get_i32(c.field_by_number(1).unwrap()), 5);
        assert_eq!(c.get_i32(c.field_by_number(2).unwrap()), 6);
        assert_eq!(msg.get_i32(msg.field_by_number(2).unwrap()), 1);
    }

    #[test]
    fn unset_submessage_reads_as_empty_adapter() {
        let mut pool = DescriptorPool::new();
        let child = pool.add(
            MessageDescriptor::new("t.Child")
                .field(FieldDescriptor::new(1, "a", Kind::Int32)),
        );
        let root = pool.add(
            MessageDescriptor::new("t.Parent")
                .field(FieldDescriptor::new(1, "c", Kind::Message(child))),
        );
        let lib = compile(&pool, root);
        let mut shared = Shared::new(&lib, &Global);
        let msg = parse_ok(&mut shared, &[]);
        let f = msg.field_by_number(1).unwrap();
        assert!(!msg.has(f));
        let c = msg.get_message(f);
        assert!(!c.is_valid());
        // Traversal keeps working without null checks.
        assert_eq!(c.get_i32(c.field_by_number(1).unwrap()), 0);
        assert_eq!(c.name(), "t.Child");
    }

    #[test]
    fn repeated_messages() {
        let mut pool = DescriptorPool::new();
        let child = pool.add(
            MessageDescriptor::new("t.Item")
                .field(FieldDescriptor::new(1, "v", Kind::UInt32)),
        );
        let root = pool.add(
            MessageDescriptor::new("t.List")
                .field(FieldDescriptor::new(1, "items", Kind::Message(child)).repeated()),
        );
        let lib = compile(&pool, root);
        let mut shared = Shared::new(&lib, &Global);
        let input = [0x0A, 0x02, 0x08, 0x01, 0x0A, 0x02, 0x08, 0x02, 0x0A, 0x00];
        let msg = parse_ok(&mut shared, &input);
        let list = msg.get_list(msg.field_by_number(1).unwrap());
        assert_eq!(list.len(), 3);
        let vs: Vec<u32> = list
            .iter()
            .map(|v| match v {
                Value::Message(m) => m.get_u32(m.field_by_number(1).unwrap()),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(vs, [1, 2, 0]);
    }

    #[test]
    fn oneof_last_wins_and_which_reports() {
        let mut pool = DescriptorPool::new();
        let root = pool.add(
            MessageDescriptor::new("t.One")
                .oneofs(1)
                .field(FieldDescriptor::new(1, "num", Kind::Int64).in_oneof(0))
                .field(FieldDescriptor::new(2, "txt", Kind::String).in_oneof(0)),
        );
        let lib = compile(&pool, root);
        let mut shared = Shared::new(&lib, &Global);
        let input = [0x08, 0x07, 0x12, 0x02, b'h', b'i'];
        let msg = parse_ok(&mut shared, &input);
        let num = msg.field_by_number(1).unwrap();
        let txt = msg.field_by_number(2).unwrap();
        assert!(!msg.has(num));
        assert!(msg.has(txt));
        assert_eq!(msg.which(num), 2);
        assert_eq!(msg.get_str(txt), "hi");
        // The inactive variant reads as its default; the slot's bits belong
        // to the winning sibling.
        assert_eq!(msg.get_i64(num), 0);
    }

    #[test]
    fn groups_round_trip_and_mismatch_fails() {
        let mut pool = DescriptorPool::new();
        let inner = pool.add(
            MessageDescriptor::new("t.G").field(FieldDescriptor::new(1, "v", Kind::Int32)),
        );
        let root = pool.add(
            MessageDescriptor::new("t.Outer")
                .field(FieldDescriptor::new(3, "g", Kind::Group(inner))),
        );
        let lib = compile(&pool, root);
        let mut shared = Shared::new(&lib, &Global);
        // group 3 { v: 9 } -> SGROUP(3), 08 09, EGROUP(3)
        let msg = parse_ok(&mut shared, &[0x1B, 0x08, 0x09, 0x1C]);
        let g = msg.get_message(msg.field_by_number(3).unwrap());
        assert_eq!(g.get_i32(g.field_by_number(1).unwrap()), 9);

        // Mismatched end-group number is fatal.
        let err = {
            let mut s2 = Shared::new(&lib, &Global);
            let ty = lib.root();
            s2.parse(ty, &[0x1B, 0x08, 0x09, 0x24], &ParseOptions::default())
                .unwrap_err()
        };
        assert_eq!(err.kind, ErrorKind::EndGroup);
    }

    #[test]
    fn unknown_fields_preserved_and_coalesced() {
        let mut pool = DescriptorPool::new();
        let root = pool.add(MessageDescriptor::new("t.Empty"));
        let lib = compile(&pool, root);
        let mut shared = Shared::new(&lib, &Global);
        let input = [0x28, 0x01, 0x32, 0x02, 0x41, 0x42];
        let msg = parse_ok(&mut shared, &input);
        let runs: Vec<&[u8]> = msg.unknown_fields().collect();
        // Adjacent unknown records coalesce into the full input.
        assert_eq!(runs, vec![&input[..]]);
    }

    #[test]
    fn unknown_fields_discarded_on_request() {
        let mut pool = DescriptorPool::new();
        let root = pool.add(MessageDescriptor::new("t.Empty"));
        let lib = compile(&pool, root);
        let mut shared = Shared::new(&lib, &Global);
        let ty = lib.root();
        let opts = ParseOptions {
            discard_unknown: true,
            ..Default::default()
        };
        let msg = shared
            .parse(ty, &[0x28, 0x01, 0x32, 0x02, 0x41, 0x42], &opts)
            .unwrap();
        assert_eq!(msg.unknown_fields().count(), 0);
    }

    #[test]
    fn per_type_discard_unknown_is_ored_with_per_parse() {
        let mut pool = DescriptorPool::new();
        let root = pool.add(MessageDescriptor::new("t.Empty").discard_unknown());
        let lib = compile(&pool, root);
        let mut shared = Shared::new(&lib, &Global);
        let msg = parse_ok(&mut shared, &[0x28, 0x01]);
        assert_eq!(msg.unknown_fields().count(), 0);
    }

    #[test]
    fn unknown_group_is_skipped_whole() {
        let mut pool = DescriptorPool::new();
        let root = pool.add(MessageDescriptor::new("t.Empty"));
        let lib = compile(&pool, root);
        let mut shared = Shared::new(&lib, &Global);
        // group 5 { field 1 varint } then a stray known-nothing varint
        let input = [0x2B, 0x08, 0x01, 0x2C, 0x10, 0x02];
        let msg = parse_ok(&mut shared, &input);
        let runs: Vec<&[u8]> = msg.unknown_fields().collect();
        assert_eq!(runs, vec![&input[..]]);
    }

    #[test]
    fn truncated_varint_reports_offset() {
        let (pool, root) = scalar_pool();
        let err = parse_err(&pool, root, &[0x08, 0x80]);
        assert_eq!(err.kind, ErrorKind::Truncated);
        assert_eq!(err.offset, 2);
    }

    #[test]
    fn varint_overflow_is_detected() {
        let (pool, root) = scalar_pool();
        let mut bytes = vec![0x08];
        bytes.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x02]);
        let err = parse_err(&pool, root, &bytes);
        assert_eq!(err.kind, ErrorKind::Overflow);
    }

    #[test]
    fn reserved_wire_types_fail() {
        let mut pool = DescriptorPool::new();
        let root = pool.add(MessageDescriptor::new("t.Empty"));
        let err = parse_err(&pool, root, &[0x0E]); // field 1, wire type 6
        assert_eq!(err.kind, ErrorKind::Reserved);
    }

    #[test]
    fn zero_field_number_fails() {
        let mut pool = DescriptorPool::new();
        let root = pool.add(MessageDescriptor::new("t.Empty"));
        let err = parse_err(&pool, root, &[0x00]);
        assert_eq!(err.kind, ErrorKind::FieldNumber);
        assert_eq!(err.offset, 0);
    }

    #[test]
    fn invalid_utf8_fails_at_payload_start() {
        let (pool, root) = scalar_pool();
        let err = parse_err(&pool, root, &[0x0A, 0x02, 0xFF, 0xFF]);
        assert_eq!(err.kind, ErrorKind::Utf8);
        assert_eq!(err.offset, 2);
    }

    #[test]
    fn bytes_fields_accept_arbitrary_bytes() {
        let (pool, root) = scalar_pool();
        let lib = compile(&pool, root);
        let mut shared = Shared::new(&lib, &Global);
        let msg = parse_ok(&mut shared, &[0x32, 0x02, 0xFF, 0xFE]);
        let f = msg.field_by_number(6).unwrap();
        assert_eq!(msg.get_bytes(f), &[0xFF, 0xFE]);
    }

    #[test]
    fn recursion_depth_bounded() {
        let mut pool = DescriptorPool::new();
        let node = pool.declare("t.Node");
        pool.define(
            MessageDescriptor::new("t.Node")
                .field(FieldDescriptor::new(1, "next", Kind::Message(node)))
                .field(FieldDescriptor::new(2, "pad", Kind::Int32)),
        );
        let lib = compile(&pool, node);
        let mut shared = Shared::new(&lib, &Global);
        // depth 6 of nesting: 0A <len> ... with a pad so frames are real.
        let mut bytes = vec![0x10, 0x01];
        for _ in 0..6 {
            let mut outer = vec![0x0A, bytes.len() as u8];
            outer.extend_from_slice(&bytes);
            outer.extend_from_slice(&[0x10, 0x01]);
            bytes = outer;
        }
        let ty = lib.root();
        let opts = ParseOptions {
            max_depth: 4,
            ..Default::default()
        };
        let err = shared.parse(ty, &bytes, &opts).unwrap_err();
        assert_eq!(err.kind, ErrorKind::RecursionDepth);

        // The same input parses fine with a higher limit.
        let opts = ParseOptions {
            max_depth: 16,
            ..Default::default()
        };
        assert!(shared.parse(ty, &bytes, &opts).is_ok());
    }

    #[test]
    fn tail_nesting_counts_toward_depth() {
        let mut pool = DescriptorPool::new();
        let node = pool.declare("t.Node");
        pool.define(
            MessageDescriptor::new("t.Node")
                .field(FieldDescriptor::new(1, "next", Kind::Message(node))),
        );
        let lib = compile(&pool, node);
        let mut shared = Shared::new(&lib, &Global);
        // Pure tail nesting elides frames but still consumes depth.
        let mut bytes = Vec::new();
        for _ in 0..8 {
            let mut outer = vec![0x0A, bytes.len() as u8];
            outer.extend_from_slice(&bytes);
            bytes = outer;
        }
        let ty = lib.root();
        let opts = ParseOptions {
            max_depth: 4,
            ..Default::default()
        };
        let err = shared.parse(ty, &bytes, &opts).unwrap_err();
        assert_eq!(err.kind, ErrorKind::RecursionDepth);
    }

    #[test]
    fn failed_parse_resets_the_arena() {
        let (pool, root) = scalar_pool();
        let lib = compile(&pool, root);
        let mut shared = Shared::new(&lib, &Global);
        let ty = lib.root();
        assert!(shared
            .parse(ty, &[0x0A, 0x05, b'x'], &ParseOptions::default())
            .is_err());
        // The context is immediately reusable.
        let msg = shared
            .parse(ty, &[0x08, 0x2A], &ParseOptions::default())
            .unwrap();
        assert_eq!(msg.get_i32(msg.field_by_number(1).unwrap()), 42);
    }

    #[test]
    fn profile_cold_fields_decode_identically() {
        let profile = Profile::new().rule(
            "t.Scalars.s",
            FieldHints {
                decode_probability: 0.01,
                ..Default::default()
            },
        );
        let (pool, root) = scalar_pool();
        let lib = Library::compile(
            &pool,
            root,
            &CompileOptions {
                profile: Some(&profile),
                extensions: None,
            },
            &Global,
        )
        .unwrap();
        let mut shared = Shared::new(&lib, &Global);
        let ty = lib.root();
        let msg = shared
            .parse(
                ty,
                &[0x0A, 0x03, b'a', b'b', b'c', 0x08, 0x05],
                &ParseOptions::default(),
            )
            .unwrap();
        let s = msg.field_by_number(2).unwrap();
        assert!(msg.has(s));
        assert_eq!(msg.get_str(s), "abc");
        assert_eq!(msg.get_i32(msg.field_by_number(1).unwrap()), 5);
    }

    #[test]
    fn assume_utf8_skips_validation() {
        let profile = Profile::new().rule(
            "t.Scalars.s",
            FieldHints {
                assume_utf8: true,
                ..Default::default()
            },
        );
        let (pool, root) = scalar_pool();
        let lib = Library::compile(
            &pool,
            root,
            &CompileOptions {
                profile: Some(&profile),
                extensions: None,
            },
            &Global,
        )
        .unwrap();
        let mut shared = Shared::new(&lib, &Global);
        let ty = lib.root();
        let msg = shared
            .parse(ty, &[0x0A, 0x02, 0xFF, 0xFF], &ParseOptions::default())
            .unwrap();
        let f = msg.field_by_number(2).unwrap();
        // The raw bytes stay reachable even though they are not UTF-8.
        assert_eq!(msg.get_bytes(f), &[0xFF, 0xFF]);
        assert_eq!(msg.get_str(f), "");
    }

    #[test]
    fn extensions_resolve_and_decode() -> anyhow::Result<()> {
        struct Exts;
        impl ExtensionResolver for Exts {
            fn extensions_of(&self, full_name: &str) -> Vec<FieldDescriptor> {
                if full_name == "t.Extensible" {
                    vec![FieldDescriptor::new(200, "ext_tag", Kind::String)]
                } else {
                    Vec::new()
                }
            }
        }
        let mut pool = DescriptorPool::new();
        let root = pool.add(
            MessageDescriptor::new("t.Extensible")
                .field(FieldDescriptor::new(1, "base", Kind::Int32)),
        );
        let lib = Library::compile(
            &pool,
            root,
            &CompileOptions {
                profile: None,
                extensions: Some(&Exts),
            },
            &Global,
        )?;
        let mut shared = Shared::new(&lib, &Global);
        let ty = lib.root();
        // field 200, wire type 2: tag = 1602 -> C2 0C
        let msg = shared.parse(
            ty,
            &[0x08, 0x01, 0xC2, 0x0C, 0x02, b'o', b'k'],
            &ParseOptions::default(),
        )?;
        let ext = msg.field_by_number(200).unwrap();
        assert_eq!(ext.name(), "ext_tag");
        assert_eq!(msg.get_str(ext), "ok");
        Ok(())
    }

    #[test]
    fn compilation_is_deterministic() {
        let (pool, root) = scalar_pool();
        let a = compile(&pool, root);
        let b = compile(&pool, root);
        let bytes_a = unsafe { core::slice::from_raw_parts(a.base(), a.image_len) };
        let bytes_b = unsafe { core::slice::from_raw_parts(b.base(), b.image_len) };
        assert_eq!(bytes_a, bytes_b);
    }

    #[test]
    fn required_field_analysis_crosses_cycles() {
        let mut pool = DescriptorPool::new();
        let a = pool.declare("t.A");
        let b = pool.declare("t.B");
        pool.define(
            MessageDescriptor::new("t.A").field(FieldDescriptor::new(1, "b", Kind::Message(b))),
        );
        pool.define(
            MessageDescriptor::new("t.B")
                .field(FieldDescriptor::new(1, "a", Kind::Message(a)))
                .field(FieldDescriptor::new(2, "must", Kind::Int32).required()),
        );
        let lib = compile(&pool, a);
        assert!(lib.root().contains_required());
        assert!(lib.type_by_name("t.B").unwrap().contains_required());
    }

    #[test]
    fn disjoint_contexts_parse_in_parallel() {
        let (pool, root) = scalar_pool();
        let lib = compile(&pool, root);
        std::thread::scope(|scope| {
            for _ in 0..4 {
                let lib = &lib;
                scope.spawn(move || {
                    let mut shared = Shared::new(lib, &Global);
                    for _ in 0..100 {
                        let ty = lib.root();
                        let msg = shared
                            .parse(ty, &[0x08, 0x2A, 0x20, 0x05], &ParseOptions::default())
                            .unwrap();
                        assert_eq!(msg.get_i32(msg.field_by_number(1).unwrap()), 42);
                        shared.free();
                    }
                });
            }
        });
    }

    #[test]
    fn reflective_range_visits_populated_fields_in_order() {
        let (pool, root) = scalar_pool();
        let lib = compile(&pool, root);
        let mut shared = Shared::new(&lib, &Global);
        let msg = parse_ok(&mut shared, &[0x08, 0x01, 0x20, 0x05]);
        let mut seen = Vec::new();
        msg.range(|f, _| {
            seen.push(f.number());
            true
        });
        assert_eq!(seen, [1, 4]);
    }

    mod prost_equivalence {
        use super::*;
        use prost::Message as _;

        #[derive(Clone, PartialEq, prost::Message)]
        struct RefChild {
            #[prost(uint32, tag = "1")]
            v: u32,
        }

        #[derive(Clone, PartialEq, prost::Message)]
        struct RefMsg {
            #[prost(int32, tag = "1")]
            x: i32,
            #[prost(string, tag = "2")]
            s: String,
            #[prost(uint64, repeated, tag = "3")]
            xs: Vec<u64>,
            #[prost(message, optional, tag = "4")]
            child: Option<RefChild>,
            #[prost(map = "string, int32", tag = "5")]
            m: std::collections::HashMap<String, i32>,
            #[prost(sint64, tag = "6")]
            z: i64,
            #[prost(double, tag = "7")]
            d: f64,
            #[prost(bytes = "vec", tag = "8")]
            b: Vec<u8>,
        }

        fn ref_pool() -> (DescriptorPool, MessageIndex) {
            let mut pool = DescriptorPool::new();
            let child = pool.add(
                MessageDescriptor::new("t.RefChild")
                    .field(FieldDescriptor::new(1, "v", Kind::UInt32)),
            );
            let root = pool.add(
                MessageDescriptor::new("t.RefMsg")
                    .field(FieldDescriptor::new(1, "x", Kind::Int32))
                    .field(FieldDescriptor::new(2, "s", Kind::String))
                    .field(FieldDescriptor::new(3, "xs", Kind::UInt64).repeated())
                    .field(FieldDescriptor::new(4, "child", Kind::Message(child)).optional())
                    .field(FieldDescriptor::new(
                        5,
                        "m",
                        Kind::Map {
                            key: MapKey::String,
                            value: Box::new(Kind::Int32),
                        },
                    ))
                    .field(FieldDescriptor::new(6, "z", Kind::SInt64))
                    .field(FieldDescriptor::new(7, "d", Kind::Double))
                    .field(FieldDescriptor::new(8, "b", Kind::Bytes)),
            );
            (pool, root)
        }

        #[test]
        fn decoded_fields_match_reference_decoder() -> anyhow::Result<()> {
            let reference = RefMsg {
                x: -7,
                s: "wire format".to_string(),
                xs: vec![1, 1 << 40, 3],
                child: Some(RefChild { v: 99 }),
                m: [("k1".to_string(), 10), ("k2".to_string(), -20)]
                    .into_iter()
                    .collect(),
                z: -123456789,
                d: 2.25,
                b: vec![0, 1, 2, 255],
            };
            let bytes = reference.encode_to_vec();

            let (pool, root) = ref_pool();
            let lib = Library::compile(&pool, root, &CompileOptions::default(), &Global)?;
            let mut shared = Shared::new(&lib, &Global);
            let ty = lib.root();
            let msg = shared.parse(ty, &bytes, &ParseOptions::default())?;

            assert_eq!(msg.get_i32(msg.field_by_number(1).unwrap()), reference.x);
            assert_eq!(msg.get_str(msg.field_by_number(2).unwrap()), reference.s);
            let xs: Vec<u64> = msg
                .get_list(msg.field_by_number(3).unwrap())
                .iter()
                .map(|v| match v {
                    Value::U64(x) => x,
                    _ => unreachable!(),
                })
                .collect();
            assert_eq!(xs, reference.xs);
            let child = msg.get_message(msg.field_by_number(4).unwrap());
            assert!(child.is_valid());
            assert_eq!(
                child.get_u32(child.field_by_number(1).unwrap()),
                reference.child.as_ref().unwrap().v
            );
            let map = msg.get_map(msg.field_by_number(5).unwrap());
            assert_eq!(map.len(), reference.m.len());
            for (k, v) in &reference.m {
                match map.get(MapKeyRef::Str(k)) {
                    Some(Value::I32(got)) => assert_eq!(got, *v),
                    other => panic!("missing key {k}: {other:?}"),
                }
            }
            assert_eq!(msg.get_i64(msg.field_by_number(6).unwrap()), reference.z);
            assert_eq!(msg.get_f64(msg.field_by_number(7).unwrap()), reference.d);
            assert_eq!(msg.get_bytes(msg.field_by_number(8).unwrap()), reference.b);

            // Nothing spilled into the unknown list.
            assert_eq!(msg.unknown_fields().count(), 0);
            Ok(())
        }
    }
}
