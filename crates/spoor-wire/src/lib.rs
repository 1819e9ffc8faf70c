//! Wire format shared by the hook library, the collector daemon, and the
//! import tool.
//!
//! An entry on the wire is one `<traceentry ...>...</traceentry>` XML
//! element, UTF-8, with no length prefix. Framing relies on the literal
//! sentinel `<traceentry ` (trailing space included) starting every
//! entry: a receiver cuts its buffered stream at each sentinel and
//! decodes the slices independently. The serializer XML-escapes all text
//! content, so the sentinel cannot occur inside an entry; that escaping
//! is what makes the sentinel framing sound.

use std::fmt;

mod decode;
mod frame;
mod plaintext;
mod xml;

pub use decode::decode_entry;
pub use frame::{Framer, ENTRY_SENTINEL};
pub use plaintext::PlaintextSerializer;
pub use xml::XmlSerializer;

use spoor_types::{ProcessShutdownEvent, TraceEntry};

/// Encodes entries into sink-ready byte payloads.
///
/// Implementations may keep internal state (the dispatcher serializes
/// all calls through one mutex), hence `&mut self`.
pub trait Serializer: Send {
    fn serialize(&mut self, entry: &TraceEntry) -> Result<Vec<u8>, SerializeError>;

    fn serialize_shutdown(
        &mut self,
        event: &ProcessShutdownEvent,
    ) -> Result<Vec<u8>, SerializeError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerializeError {
    /// A field could not be rendered (e.g. a timestamp outside the
    /// representable range of the output format).
    Unrepresentable { field: &'static str, value: String },
}

impl fmt::Display for SerializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unrepresentable { field, value } => {
                write!(f, "cannot represent {field} value {value:?} in this format")
            }
        }
    }
}

impl std::error::Error for SerializeError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The slice is not valid UTF-8.
    Utf8 { valid_up_to: usize },
    /// The XML parser rejected the slice.
    Xml { message: String },
    /// The slice contains no `<traceentry>` element at all.
    MissingEntryElement,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Utf8 { valid_up_to } => {
                write!(f, "entry slice is not UTF-8 (valid up to byte {valid_up_to})")
            }
            Self::Xml { message } => write!(f, "malformed entry XML: {message}"),
            Self::MissingEntryElement => write!(f, "no <traceentry> element in slice"),
        }
    }
}

impl std::error::Error for DecodeError {}
