//! Data model shared by the hook-side runtime, the wire codec, the
//! collector daemon, and the import tool.
//!
//! Everything here is plain owned data. A `TraceEntry` is produced once
//! per trace-point hit and flows hit thread → serializer → sink on the
//! instrumented side, and framer → decoder → feeder on the daemon side.

use std::any::{Any, TypeId};
use std::collections::HashMap;

mod value;

pub use value::{variable, ConverterRegistry, TraceValue};

/// Kind of an instrumentation site. The numeric code is what travels in
/// the wire format's `<type>` element and the `trace_point.type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TracePointKind {
    None,
    Log,
    Debug,
    Error,
    Watch,
    WatchWithBacktrace,
}

impl TracePointKind {
    pub fn code(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Log => 1,
            Self::Debug => 2,
            Self::Error => 3,
            Self::Watch => 4,
            Self::WatchWithBacktrace => 5,
        }
    }

    /// Unknown codes map to `None` rather than failing: the decoder must
    /// tolerate entries produced by newer hook libraries.
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::Log,
            2 => Self::Debug,
            3 => Self::Error,
            4 => Self::Watch,
            5 => Self::WatchWithBacktrace,
            _ => Self::None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Log => "LOG",
            Self::Debug => "DEBUG",
            Self::Error => "ERROR",
            Self::Watch | Self::WatchWithBacktrace => "WATCH",
        }
    }

    /// Parse the name used by `<typefilter>` leaves in the configuration.
    pub fn from_config_name(name: &str) -> Option<Self> {
        match name {
            "log" => Some(Self::Log),
            "debug" => Some(Self::Debug),
            "error" => Some(Self::Error),
            "watch" => Some(Self::Watch),
            _ => None,
        }
    }
}

/// Type tag of a snapshotted variable. `code` is the numeric
/// `variable.type_code` column; `label` is the wire `type` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariableType {
    String,
    Integer,
    Float,
    Boolean,
    Opaque,
}

impl VariableType {
    pub fn code(self) -> i64 {
        match self {
            Self::String => 0,
            Self::Integer => 1,
            Self::Float => 2,
            Self::Boolean => 3,
            Self::Opaque => 4,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Opaque => "opaque",
        }
    }

    /// Wire `type` attributes we do not recognize collapse to `Opaque`;
    /// the stringified value is still preserved.
    pub fn from_label(label: &str) -> Self {
        match label {
            "string" => Self::String,
            "integer" => Self::Integer,
            "float" => Self::Float,
            "boolean" => Self::Boolean,
            _ => Self::Opaque,
        }
    }
}

/// One `(name, type, stringified value)` triple captured at a call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableValue {
    pub name: String,
    pub value_type: VariableType,
    pub value: String,
}

/// Ordered sequence of variables captured at one hit. Owned by the
/// `TraceEntry` that carries it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariableSnapshot(pub Vec<VariableValue>);

impl VariableSnapshot {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, value: VariableValue) {
        self.0.push(value);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, VariableValue> {
        self.0.iter()
    }
}

impl FromIterator<VariableValue> for VariableSnapshot {
    fn from_iter<I: IntoIterator<Item = VariableValue>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// One backtrace frame. Depth 0 is the innermost frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub module: String,
    pub function: String,
    pub function_offset: u64,
    pub source_file: String,
    pub line_number: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Backtrace(pub Vec<StackFrame>);

impl Backtrace {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn frames(&self) -> &[StackFrame] {
        &self.0
    }
}

/// A single trace-point hit, fully resolved and owned.
///
/// `timestamp_secs` is whole Unix seconds: that is what the wire format
/// carries, and the storage schema's `trace_entry.timestamp` column uses
/// the same resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub pid: u32,
    pub tid: u32,
    pub timestamp_secs: u64,
    pub process_name: String,
    pub verbosity: u32,
    pub kind: TracePointKind,
    pub path: String,
    pub line: u32,
    pub function: String,
    pub message: String,
    pub variables: VariableSnapshot,
    pub backtrace: Backtrace,
}

/// Synthetic event emitted once when the traced process shuts down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessShutdownEvent {
    pub pid: u32,
    pub process_name: String,
    pub start_time_secs: u64,
    pub shutdown_time_secs: u64,
}

pub(crate) type ConverterFn =
    Box<dyn Fn(&dyn Any) -> Option<(VariableType, String)> + Send + Sync>;

pub(crate) struct RegistryInner {
    pub(crate) converters: HashMap<TypeId, ConverterFn>,
}
