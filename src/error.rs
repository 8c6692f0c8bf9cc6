use core::fmt;

/// Wire-level failure taxonomy. Every parse failure maps to exactly one kind.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ErrorKind {
    /// The input ended in the middle of a record.
    Truncated,
    /// A tag with field number zero.
    FieldNumber,
    /// A varint longer than 10 bytes, or a 10th byte with value > 1.
    Overflow,
    /// Wire types 6 and 7 are reserved.
    Reserved,
    /// An end-group tag that does not match the open group.
    EndGroup,
    /// Submessage nesting exceeded `ParseOptions::max_depth`.
    RecursionDepth,
    /// A proto3 string field holding invalid UTF-8.
    Utf8,
    /// Input longer than 2^32 - 1 bytes.
    TooBig,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Truncated => "truncated input",
            ErrorKind::FieldNumber => "field number is zero",
            ErrorKind::Overflow => "varint overflow",
            ErrorKind::Reserved => "reserved wire type",
            ErrorKind::EndGroup => "mismatched end-group tag",
            ErrorKind::RecursionDepth => "recursion depth exceeded",
            ErrorKind::Utf8 => "invalid UTF-8 in string field",
            ErrorKind::TooBig => "input too large",
        }
    }
}

/// A failed parse: what went wrong and the byte offset at which it did.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ParseError {
    pub kind: ErrorKind,
    pub offset: usize,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at offset {}", self.kind.as_str(), self.offset)
    }
}

impl std::error::Error for ParseError {}

/// A descriptor graph that cannot be compiled into a parser library.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum CompileError {
    /// A field references a message index outside the pool.
    UnresolvedType { message: String, field: u32 },
    /// Two declared fields of one message share a field number.
    DuplicateFieldNumber { message: String, number: u32 },
    /// A field number outside 1..=536_870_911.
    InvalidFieldNumber { message: String, number: u32 },
    /// A map key kind that the wire format does not permit.
    InvalidMapKey { message: String, number: u32 },
    /// The hot or cold region of a message exceeds 2^31 bytes.
    RegionOverflow { message: String },
    /// The root index does not name a message in the pool.
    UnknownRoot,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::UnresolvedType { message, field } => {
                write!(f, "{message}: field {field} references an unknown type")
            }
            CompileError::DuplicateFieldNumber { message, number } => {
                write!(f, "{message}: duplicate field number {number}")
            }
            CompileError::InvalidFieldNumber { message, number } => {
                write!(f, "{message}: invalid field number {number}")
            }
            CompileError::InvalidMapKey { message, number } => {
                write!(f, "{message}: field {number} has an invalid map key kind")
            }
            CompileError::RegionOverflow { message } => {
                write!(f, "{message}: storage region exceeds 2^31 bytes")
            }
            CompileError::UnknownRoot => write!(f, "root message not present in pool"),
        }
    }
}

impl std::error::Error for CompileError {}
