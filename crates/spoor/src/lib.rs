//! Call-site tracing for instrumented applications.
//!
//! Spoor instruments a program with cheap trace points. Every macro
//! expansion plants one static call site capturing its file, line, and
//! enclosing function; at runtime each hit is matched against a
//! declarative filter configuration and, when admitted, serialized and
//! handed to an output sink: standard output, a file, or a TCP
//! connection to the `spoor-collect` daemon.
//!
//! ```no_run
//! fn main() {
//!     spoor::init();
//!
//!     spoor::trace_msg!("main() entered");
//!     let name = "Max";
//!     spoor::watch!("name" => name);
//!     if name.is_empty() {
//!         spoor::error_msg!("empty name");
//!     }
//!
//!     spoor::shutdown();
//! }
//! ```
//!
//! Tracing is entirely configuration-driven: without a configuration
//! file (`spoor.xml` next to the executable, or the path in
//! `SPOOR_CONFIGFILE`) every trace point stays inactive and a hit costs
//! one atomic load. The configuration file is watched; edits take
//! effect without restarting.
//!
//! Tracing never alters application behavior: sink and serializer
//! failures are swallowed, counted, and surfaced through rate-limited
//! `tracing` warnings only.
//!
//! # Cargo features
//!
//! | Feature | Effect |
//! |---------|--------|
//! | `instrumentation` *(default)* | Full runtime. |
//! | *(disabled)* | `visit` is an empty inline function; macro expansions compile down to dead statics and a no-op call. |

use std::path::Path;
use std::sync::OnceLock;

use tracing::warn;

pub mod config;
pub mod filter;
pub mod sink;
pub mod stack;

mod dispatcher;
mod site;
mod watcher;

pub use config::{
    Action, ConfigError, Configuration, OutputSpec, SerializerKind, TracePointSet,
    CONFIG_ENV_VAR, DEFAULT_CONFIG_FILE_NAME, DEFAULT_TCP_PORT,
};
pub use dispatcher::{dispatcher, DiagnosticCounters, Dispatcher};
pub use site::CallSite;
pub use spoor_types::{
    variable, Backtrace, ConverterRegistry, ProcessShutdownEvent, StackFrame, TraceEntry,
    TracePointKind, TraceValue, VariableSnapshot, VariableType, VariableValue,
};
pub use spoor_wire::{PlaintextSerializer, Serializer, XmlSerializer};

/// Load the configuration (explicitly pathed via [`init_with_config_file`],
/// else `SPOOR_CONFIGFILE`, else `spoor.xml` next to the executable) and
/// start watching it for changes. Idempotent; the first call wins.
pub fn init() {
    init_from(None);
}

pub fn init_with_config_file(path: impl AsRef<Path>) {
    init_from(Some(path.as_ref()));
}

fn init_from(explicit: Option<&Path>) {
    static STARTED: OnceLock<()> = OnceLock::new();
    if STARTED.set(()).is_err() {
        return;
    }

    let dispatcher = dispatcher();
    let path = config::resolve_config_path(explicit);
    if path.exists() {
        if let Err(e) = dispatcher.reload_configuration(&path) {
            warn!(path = %path.display(), %e, "initial configuration load failed; tracing stays disabled");
        }
    }
    dispatcher.start_watching(path);
}

/// Emit the synthetic process-shutdown event, flush the sink, and turn
/// every later hit into a no-op.
pub fn shutdown() {
    dispatcher().shutdown();
}

/// The dispatch entry point the macros expand to. Public for the macro
/// expansions; application code calls the macros instead.
#[cfg(feature = "instrumentation")]
pub fn visit(
    site: &CallSite,
    function: &'static str,
    message: Option<String>,
    variables: Option<VariableSnapshot>,
) {
    dispatcher().visit(site, function, message, variables);
}

#[cfg(not(feature = "instrumentation"))]
#[inline(always)]
pub fn visit(
    _site: &CallSite,
    _function: &'static str,
    _message: Option<String>,
    _variables: Option<VariableSnapshot>,
) {
}

/// Path of the enclosing function, as a `&'static str`.
#[doc(hidden)]
#[macro_export]
macro_rules! __function_path {
    () => {{
        fn __spoor_anchor() {}
        fn __type_name_of<T>(_: T) -> &'static str {
            ::core::any::type_name::<T>()
        }
        let name = __type_name_of(__spoor_anchor);
        // Strip the trailing "::__spoor_anchor".
        &name[..name.len() - 16]
    }};
}

#[doc(hidden)]
#[macro_export]
macro_rules! __trace_site {
    ($kind:expr, $key:expr, $msg:expr, $vars:expr) => {{
        static __SPOOR_SITE: $crate::CallSite =
            $crate::CallSite::new($kind, 1, ::core::file!(), ::core::line!(), $key);
        $crate::visit(&__SPOOR_SITE, $crate::__function_path!(), $msg, $vars);
    }};
}

#[doc(hidden)]
#[macro_export]
macro_rules! __snapshot {
    ($($name:expr => $value:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut snapshot = $crate::VariableSnapshot::new();
        $( snapshot.push($crate::variable($name, &$value)); )*
        snapshot
    }};
}

/// Plain log point, verbosity 1, no message.
#[macro_export]
macro_rules! trace {
    () => {
        $crate::__trace_site!(
            $crate::TracePointKind::Log,
            ::core::option::Option::None,
            ::core::option::Option::None,
            ::core::option::Option::None
        )
    };
}

/// Log point with a formatted message: `trace_msg!("x = {x}")`.
#[macro_export]
macro_rules! trace_msg {
    ($($arg:tt)+) => {
        $crate::__trace_site!(
            $crate::TracePointKind::Log,
            ::core::option::Option::None,
            ::core::option::Option::Some(::std::format!($($arg)+)),
            ::core::option::Option::None
        )
    };
}

/// Log point assigned to a grouping key: `trace_key!("io")`.
#[macro_export]
macro_rules! trace_key {
    ($point_key:expr) => {
        $crate::__trace_site!(
            $crate::TracePointKind::Log,
            ::core::option::Option::Some($point_key),
            ::core::option::Option::None,
            ::core::option::Option::None
        )
    };
}

#[macro_export]
macro_rules! trace_key_msg {
    ($point_key:expr, $($arg:tt)+) => {
        $crate::__trace_site!(
            $crate::TracePointKind::Log,
            ::core::option::Option::Some($point_key),
            ::core::option::Option::Some(::std::format!($($arg)+)),
            ::core::option::Option::None
        )
    };
}

#[macro_export]
macro_rules! debug {
    () => {
        $crate::__trace_site!(
            $crate::TracePointKind::Debug,
            ::core::option::Option::None,
            ::core::option::Option::None,
            ::core::option::Option::None
        )
    };
}

#[macro_export]
macro_rules! debug_msg {
    ($($arg:tt)+) => {
        $crate::__trace_site!(
            $crate::TracePointKind::Debug,
            ::core::option::Option::None,
            ::core::option::Option::Some(::std::format!($($arg)+)),
            ::core::option::Option::None
        )
    };
}

#[macro_export]
macro_rules! debug_key {
    ($point_key:expr) => {
        $crate::__trace_site!(
            $crate::TracePointKind::Debug,
            ::core::option::Option::Some($point_key),
            ::core::option::Option::None,
            ::core::option::Option::None
        )
    };
}

#[macro_export]
macro_rules! debug_key_msg {
    ($point_key:expr, $($arg:tt)+) => {
        $crate::__trace_site!(
            $crate::TracePointKind::Debug,
            ::core::option::Option::Some($point_key),
            ::core::option::Option::Some(::std::format!($($arg)+)),
            ::core::option::Option::None
        )
    };
}

#[macro_export]
macro_rules! error {
    () => {
        $crate::__trace_site!(
            $crate::TracePointKind::Error,
            ::core::option::Option::None,
            ::core::option::Option::None,
            ::core::option::Option::None
        )
    };
}

#[macro_export]
macro_rules! error_msg {
    ($($arg:tt)+) => {
        $crate::__trace_site!(
            $crate::TracePointKind::Error,
            ::core::option::Option::None,
            ::core::option::Option::Some(::std::format!($($arg)+)),
            ::core::option::Option::None
        )
    };
}

#[macro_export]
macro_rules! error_key {
    ($point_key:expr) => {
        $crate::__trace_site!(
            $crate::TracePointKind::Error,
            ::core::option::Option::Some($point_key),
            ::core::option::Option::None,
            ::core::option::Option::None
        )
    };
}

#[macro_export]
macro_rules! error_key_msg {
    ($point_key:expr, $($arg:tt)+) => {
        $crate::__trace_site!(
            $crate::TracePointKind::Error,
            ::core::option::Option::Some($point_key),
            ::core::option::Option::Some(::std::format!($($arg)+)),
            ::core::option::Option::None
        )
    };
}

/// Snapshot named variables at this site: `watch!("name" => name)`.
/// Values go through their [`TraceValue`] impl; whether the snapshot is
/// serialized is decided by the configuration (`yieldVariables`).
#[macro_export]
macro_rules! watch {
    ($($name:expr => $value:expr),+ $(,)?) => {
        $crate::__trace_site!(
            $crate::TracePointKind::Watch,
            ::core::option::Option::None,
            ::core::option::Option::None,
            ::core::option::Option::Some($crate::__snapshot!($($name => $value),+))
        )
    };
}

/// `watch_msg!("fmt {}", arg; "name" => name)`: format arguments before
/// the `;`, variable pairs after.
#[macro_export]
macro_rules! watch_msg {
    ($fmt:literal $(, $fmtarg:expr)* ; $($name:expr => $value:expr),* $(,)?) => {
        $crate::__trace_site!(
            $crate::TracePointKind::Watch,
            ::core::option::Option::None,
            ::core::option::Option::Some(::std::format!($fmt $(, $fmtarg)*)),
            ::core::option::Option::Some($crate::__snapshot!($($name => $value),*))
        )
    };
}

#[macro_export]
macro_rules! watch_key {
    ($point_key:expr ; $($name:expr => $value:expr),* $(,)?) => {
        $crate::__trace_site!(
            $crate::TracePointKind::Watch,
            ::core::option::Option::Some($point_key),
            ::core::option::Option::None,
            ::core::option::Option::Some($crate::__snapshot!($($name => $value),*))
        )
    };
}

#[macro_export]
macro_rules! watch_key_msg {
    ($point_key:expr, $fmt:literal $(, $fmtarg:expr)* ; $($name:expr => $value:expr),* $(,)?) => {
        $crate::__trace_site!(
            $crate::TracePointKind::Watch,
            ::core::option::Option::Some($point_key),
            ::core::option::Option::Some(::std::format!($fmt $(, $fmtarg)*)),
            ::core::option::Option::Some($crate::__snapshot!($($name => $value),*))
        )
    };
}
