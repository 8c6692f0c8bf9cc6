//! Structural message descriptors.
//!
//! A [`DescriptorPool`] is the compiler's input: a closed graph of message
//! descriptors addressed by index, so cyclic message references (A contains
//! B contains A) are directly representable. Descriptors carry only the
//! structure the parser needs; loading them from descriptor files is an
//! external concern.

use std::collections::HashMap;

/// Index of a message inside its [`DescriptorPool`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct MessageIndex(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Cardinality {
    /// proto3 implicit presence: zero is absent.
    Implicit,
    /// Explicit presence tracked by a bit.
    Optional,
    Repeated,
    /// proto2 `required`; participates in the contains-required analysis.
    Required,
}

/// Map key kinds the wire format permits.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MapKey {
    Bool,
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
    String,
}

#[derive(Clone, Debug)]
pub enum Kind {
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
    Bool,
    /// Open enums decode as int32.
    Enum,
    String,
    Bytes,
    Message(MessageIndex),
    Group(MessageIndex),
    Map { key: MapKey, value: Box<Kind> },
}

impl Kind {
    pub(crate) fn submessage(&self) -> Option<MessageIndex> {
        match self {
            Kind::Message(m) | Kind::Group(m) => Some(*m),
            Kind::Map { value, .. } => value.submessage(),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct FieldDescriptor {
    pub name: String,
    pub number: u32,
    pub kind: Kind,
    pub cardinality: Cardinality,
    /// Packed encoding preference for repeated scalars; `None` follows the
    /// proto3 default (packed).
    pub packed: Option<bool>,
    /// Index into the owning message's oneof declarations.
    pub oneof: Option<u32>,
}

impl FieldDescriptor {
    pub fn new(number: u32, name: &str, kind: Kind) -> Self {
        FieldDescriptor {
            name: name.to_string(),
            number,
            kind,
            cardinality: Cardinality::Implicit,
            packed: None,
            oneof: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.cardinality = Cardinality::Optional;
        self
    }

    pub fn repeated(mut self) -> Self {
        self.cardinality = Cardinality::Repeated;
        self
    }

    pub fn required(mut self) -> Self {
        self.cardinality = Cardinality::Required;
        self
    }

    pub fn unpacked(mut self) -> Self {
        self.packed = Some(false);
        self
    }

    pub fn in_oneof(mut self, index: u32) -> Self {
        self.oneof = Some(index);
        self.cardinality = Cardinality::Optional;
        self
    }

    pub(crate) fn is_repeated(&self) -> bool {
        self.cardinality == Cardinality::Repeated
    }

    pub(crate) fn is_packed(&self) -> bool {
        self.is_repeated()
            && self.packed.unwrap_or(true)
            && !matches!(
                self.kind,
                Kind::String | Kind::Bytes | Kind::Message(_) | Kind::Group(_) | Kind::Map { .. }
            )
    }
}

#[derive(Clone, Debug, Default)]
pub struct MessageDescriptor {
    pub full_name: String,
    pub fields: Vec<FieldDescriptor>,
    /// Number of oneof declarations; fields refer to them by index.
    pub oneof_count: u32,
    /// Per-type unknown-field policy, OR-ed with the per-parse flag.
    pub discard_unknown: bool,
}

impl MessageDescriptor {
    pub fn new(full_name: &str) -> Self {
        MessageDescriptor {
            full_name: full_name.to_string(),
            ..Default::default()
        }
    }

    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    pub fn oneofs(mut self, count: u32) -> Self {
        self.oneof_count = count;
        self
    }

    pub fn discard_unknown(mut self) -> Self {
        self.discard_unknown = true;
        self
    }
}

/// Supplies extension fields for a message, looked up by full name during
/// compilation. Resolver order is authoritative: on a field-number tie the
/// earlier entry wins.
pub trait ExtensionResolver {
    fn extensions_of(&self, full_name: &str) -> Vec<FieldDescriptor>;
}

/// A resolver with no extensions.
pub struct NoExtensions;

impl ExtensionResolver for NoExtensions {
    fn extensions_of(&self, _full_name: &str) -> Vec<FieldDescriptor> {
        Vec::new()
    }
}

#[derive(Default)]
pub struct DescriptorPool {
    messages: Vec<MessageDescriptor>,
    by_name: HashMap<String, MessageIndex>,
}

impl DescriptorPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve an index before the descriptor body is known, for cycles.
    pub fn declare(&mut self, full_name: &str) -> MessageIndex {
        if let Some(&idx) = self.by_name.get(full_name) {
            return idx;
        }
        let idx = MessageIndex(self.messages.len() as u32);
        self.messages.push(MessageDescriptor::new(full_name));
        self.by_name.insert(full_name.to_string(), idx);
        idx
    }

    /// Install (or replace) the descriptor body at its declared index.
    pub fn define(&mut self, desc: MessageDescriptor) -> MessageIndex {
        let idx = self.declare(&desc.full_name);
        self.messages[idx.0 as usize] = desc;
        idx
    }

    pub fn add(&mut self, desc: MessageDescriptor) -> MessageIndex {
        self.define(desc)
    }

    pub fn get(&self, idx: MessageIndex) -> Option<&MessageDescriptor> {
        self.messages.get(idx.0 as usize)
    }

    pub fn by_name(&self, full_name: &str) -> Option<MessageIndex> {
        self.by_name.get(full_name).copied()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declare_then_define_closes_cycles() {
        let mut pool = DescriptorPool::new();
        let a = pool.declare("test.A");
        let b = pool.define(
            MessageDescriptor::new("test.B")
                .field(FieldDescriptor::new(1, "a", Kind::Message(a))),
        );
        pool.define(
            MessageDescriptor::new("test.A")
                .field(FieldDescriptor::new(1, "b", Kind::Message(b))),
        );
        assert_eq!(pool.by_name("test.A"), Some(a));
        assert_eq!(pool.get(a).unwrap().fields[0].kind.submessage(), Some(b));
        assert_eq!(pool.get(b).unwrap().fields[0].kind.submessage(), Some(a));
    }

    #[test]
    fn packed_defaults() {
        let f = FieldDescriptor::new(1, "xs", Kind::Int32).repeated();
        assert!(f.is_packed());
        assert!(!f.clone().unpacked().is_packed());
        let s = FieldDescriptor::new(2, "ss", Kind::String).repeated();
        assert!(!s.is_packed());
    }
}
