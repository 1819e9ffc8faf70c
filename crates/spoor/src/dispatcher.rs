//! The per-process trace dispatcher.
//!
//! One instance per process. Every instrumented hit lands in
//! [`Dispatcher::visit`]: a generation check against the site's packed
//! cache decides in one atomic load whether the site is active; only a
//! site whose cache is stale takes the configuration read lock and walks
//! the trace-point sets. Serializer and output each sit behind their own
//! mutex, locked in that order and never nested the other way.
//!
//! Tracing is advisory: nothing in here propagates an error to the
//! instrumented caller. Serializer and sink failures are counted and
//! reported through rate-limited self-diagnostics.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use spoor_types::{
    Backtrace, ConverterRegistry, ProcessShutdownEvent, TraceEntry, TracePointKind,
    VariableSnapshot,
};
use spoor_wire::{PlaintextSerializer, Serializer, XmlSerializer};
use tracing::warn;

use crate::config::{
    self, Action, ConfigError, Configuration, OutputSpec, SerializerKind,
};
use crate::filter::PointFields;
use crate::sink::{FileOutput, Output, StdoutOutput, TcpOutput};
use crate::site::{CallSite, SiteDecision};
use crate::stack::{BacktraceGenerator, SystemBacktraceGenerator};
use crate::watcher;

const DIAGNOSTIC_REPORT_PERIOD: Duration = Duration::from_secs(5);

struct ProcessIdentity {
    pid: u32,
    name: String,
    start_time_secs: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagnosticCounters {
    pub serializer_errors: u64,
    pub sink_errors: u64,
    pub dropped_after_shutdown: u64,
}

struct Diagnostics {
    serializer_errors: AtomicU64,
    sink_errors: AtomicU64,
    dropped_after_shutdown: AtomicU64,
    last_report: Mutex<Option<Instant>>,
}

impl Diagnostics {
    fn new() -> Self {
        Self {
            serializer_errors: AtomicU64::new(0),
            sink_errors: AtomicU64::new(0),
            dropped_after_shutdown: AtomicU64::new(0),
            last_report: Mutex::new(None),
        }
    }

    /// At most one warning per report period; everything else only
    /// bumps the counters.
    fn report(&self, what: &str, detail: &dyn std::fmt::Display) {
        let mut last = self.last_report.lock();
        let now = Instant::now();
        let due = match *last {
            Some(at) => now.duration_since(at) >= DIAGNOSTIC_REPORT_PERIOD,
            None => true,
        };
        if due {
            *last = Some(now);
            warn!(error = %detail, "{what}");
        }
    }
}

pub struct Dispatcher {
    generation: AtomicU64,
    config: RwLock<std::sync::Arc<Configuration>>,
    serializer: Mutex<Box<dyn Serializer>>,
    output: Mutex<Box<dyn Output>>,
    backtraces: RwLock<std::sync::Arc<dyn BacktraceGenerator>>,
    converters: RwLock<ConverterRegistry>,
    process: ProcessIdentity,
    shut_down: AtomicBool,
    diagnostics: Diagnostics,
    watcher: Mutex<Option<watcher::WatcherHandle>>,
}

/// The process-wide dispatcher used by the trace macros.
pub fn dispatcher() -> &'static Dispatcher {
    static DISPATCHER: OnceLock<Dispatcher> = OnceLock::new();
    DISPATCHER.get_or_init(|| Dispatcher::new(default_process_name()))
}

fn default_process_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| String::from("unknown"))
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(target_os = "linux")]
fn current_thread_id() -> u32 {
    (unsafe { libc::syscall(libc::SYS_gettid) }) as u32
}

#[cfg(target_os = "macos")]
fn current_thread_id() -> u32 {
    let mut tid: u64 = 0;
    unsafe {
        libc::pthread_threadid_np(std::ptr::null_mut(), &mut tid);
    }
    tid as u32
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn current_thread_id() -> u32 {
    use std::cell::Cell;
    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static TID: Cell<u32> = Cell::new(0);
    }
    TID.with(|tid| {
        if tid.get() == 0 {
            tid.set(NEXT.fetch_add(1, Ordering::Relaxed) as u32);
        }
        tid.get()
    })
}

impl Dispatcher {
    /// A dispatcher with an explicit process identity. The global
    /// instance derives the name from the executable; tests construct
    /// their own.
    pub fn new(process_name: String) -> Self {
        Self {
            generation: AtomicU64::new(0),
            config: RwLock::new(std::sync::Arc::new(Configuration::default())),
            serializer: Mutex::new(Box::new(PlaintextSerializer::new())),
            output: Mutex::new(Box::new(StdoutOutput::new())),
            backtraces: RwLock::new(std::sync::Arc::new(SystemBacktraceGenerator::default())),
            converters: RwLock::new(ConverterRegistry::new()),
            process: ProcessIdentity {
                pid: std::process::id(),
                name: process_name,
                start_time_secs: unix_now_secs(),
            },
            shut_down: AtomicBool::new(false),
            diagnostics: Diagnostics::new(),
            watcher: Mutex::new(None),
        }
    }

    pub fn process_name(&self) -> &str {
        &self.process.name
    }

    /// The heart of the hit path. Either the entry reaches the sink as a
    /// whole or it is discarded; nothing is partially emitted and no
    /// error escapes to the instrumented caller.
    pub fn visit(
        &self,
        site: &CallSite,
        function: &'static str,
        message: Option<String>,
        variables: Option<VariableSnapshot>,
    ) {
        if self.shut_down.load(Ordering::Relaxed) {
            self.diagnostics
                .dropped_after_shutdown
                .fetch_add(1, Ordering::Relaxed);
            return;
        }
        let generation = self.generation.load(Ordering::Acquire);
        if generation == 0 {
            return;
        }

        site.record_function(function);
        let (cached_generation, cached) = site.cache.load();
        let decision = if cached_generation == generation {
            cached
        } else {
            self.resolve(site)
        };
        if !decision.active {
            // An unused variable snapshot is released here, unserialized.
            return;
        }

        let backtrace = if decision.backtraces {
            self.backtraces.read().clone().capture()
        } else {
            Backtrace::new()
        };
        let variables = if decision.variables {
            variables.unwrap_or_default()
        } else {
            VariableSnapshot::new()
        };

        let entry = TraceEntry {
            pid: self.process.pid,
            tid: current_thread_id(),
            timestamp_secs: unix_now_secs(),
            process_name: self.process.name.clone(),
            verbosity: site.verbosity(),
            kind: site.kind(),
            path: site.file().to_owned(),
            line: site.line(),
            function: function.to_owned(),
            message: message.unwrap_or_default(),
            variables,
            backtrace,
        };

        let payload = match self.serializer.lock().serialize(&entry) {
            Ok(payload) => payload,
            Err(e) => {
                self.diagnostics
                    .serializer_errors
                    .fetch_add(1, Ordering::Relaxed);
                self.diagnostics.report("trace entry serialization failed", &e);
                return;
            }
        };
        if let Err(e) = self.output.lock().write(&payload) {
            self.diagnostics.sink_errors.fetch_add(1, Ordering::Relaxed);
            self.diagnostics.report("trace sink write failed", &e);
        }
    }

    /// Walk the trace-point sets under the configuration read lock and
    /// refresh the site's cache. Racing resolvers for the same
    /// generation write identical words.
    fn resolve(&self, site: &CallSite) -> SiteDecision {
        let config = self.config.read();
        let fields = PointFields {
            kind: site.kind(),
            verbosity: site.verbosity(),
            path: site.file(),
            function: site.function(),
            key: site.key(),
            process_name: &self.process.name,
        };
        let action = config.decide(&fields);
        let active = action != Action::Ignore;
        let decision = SiteDecision {
            active,
            backtraces: action == Action::YieldBacktrace
                || (active && site.kind() == TracePointKind::WatchWithBacktrace),
            variables: action == Action::YieldVariables,
        };
        site.cache.store(config.generation, decision);
        decision
    }

    /// Install a parsed configuration: stamp the next generation, swap
    /// the shared reference, then apply its serializer/output choices.
    /// Every site re-resolves on its next hit.
    pub fn install_configuration(&self, mut configuration: Configuration) -> u64 {
        let serializer_kind = configuration.serializer;
        let output_spec = configuration.output.clone();

        let generation = {
            let mut slot = self.config.write();
            let generation = self.generation.load(Ordering::Relaxed) + 1;
            configuration.generation = generation;
            *slot = std::sync::Arc::new(configuration);
            self.generation.store(generation, Ordering::Release);
            generation
        };

        // Sink swaps happen outside the configuration lock; the sink
        // mutexes are never taken while holding it.
        self.apply_serializer(serializer_kind);
        if let Some(spec) = output_spec {
            self.apply_output(&spec);
        }
        generation
    }

    /// Re-read the descriptor at `path`. On a parse error the installed
    /// configuration and generation stay untouched. A file with no block
    /// for this process installs an empty configuration (every site goes
    /// inactive).
    pub fn reload_configuration(&self, path: &Path) -> Result<u64, ConfigError> {
        let parsed = config::load_configuration(path, &self.process.name)?;
        Ok(self.install_configuration(parsed.unwrap_or_default()))
    }

    pub fn set_serializer(&self, serializer: Box<dyn Serializer>) {
        *self.serializer.lock() = serializer;
    }

    pub fn set_output(&self, output: Box<dyn Output>) {
        *self.output.lock() = output;
    }

    pub fn set_backtrace_generator(&self, generator: std::sync::Arc<dyn BacktraceGenerator>) {
        *self.backtraces.write() = generator;
    }

    pub fn register_converter<T, F>(&self, convert: F)
    where
        T: std::any::Any,
        F: Fn(&T) -> (spoor_types::VariableType, String) + Send + Sync + 'static,
    {
        self.converters.write().register::<T, F>(convert);
    }

    pub fn with_converters<R>(&self, f: impl FnOnce(&ConverterRegistry) -> R) -> R {
        f(&self.converters.read())
    }

    pub fn diagnostics(&self) -> DiagnosticCounters {
        DiagnosticCounters {
            serializer_errors: self.diagnostics.serializer_errors.load(Ordering::Relaxed),
            sink_errors: self.diagnostics.sink_errors.load(Ordering::Relaxed),
            dropped_after_shutdown: self
                .diagnostics
                .dropped_after_shutdown
                .load(Ordering::Relaxed),
        }
    }

    pub(crate) fn start_watching(&'static self, path: std::path::PathBuf) {
        let mut slot = self.watcher.lock();
        if slot.is_none() {
            *slot = Some(watcher::spawn(self, path));
        }
    }

    /// Emit the synthetic shutdown event, flush the sink, and turn every
    /// later `visit` into a no-op. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.watcher.lock() = None;

        if self.generation.load(Ordering::Acquire) == 0 {
            return;
        }
        let event = ProcessShutdownEvent {
            pid: self.process.pid,
            process_name: self.process.name.clone(),
            start_time_secs: self.process.start_time_secs,
            shutdown_time_secs: unix_now_secs(),
        };
        match self.serializer.lock().serialize_shutdown(&event) {
            Ok(payload) => {
                let mut output = self.output.lock();
                if let Err(e) = output.write(&payload) {
                    self.diagnostics.report("shutdown event write failed", &e);
                }
                let _ = output.flush();
            }
            Err(e) => self.diagnostics.report("shutdown event serialization failed", &e),
        }
    }

    fn apply_serializer(&self, kind: SerializerKind) {
        let serializer: Box<dyn Serializer> = match kind {
            SerializerKind::Xml => Box::new(XmlSerializer::new()),
            SerializerKind::Plaintext => Box::new(PlaintextSerializer::new()),
        };
        self.set_serializer(serializer);
    }

    fn apply_output(&self, spec: &OutputSpec) {
        let output: Box<dyn Output> = match spec {
            OutputSpec::Stdout => Box::new(StdoutOutput::new()),
            OutputSpec::File { path, append } => Box::new(FileOutput::new(path.clone(), *append)),
            OutputSpec::Tcp { host, port } => Box::new(TcpOutput::new(host, *port)),
        };
        self.set_output(output);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex as PlMutex;
    use spoor_types::VariableValue;

    use crate::config::TracePointSet;
    use crate::filter::{Filter, Pattern};
    use crate::sink::SinkError;

    use super::*;

    #[derive(Clone, Default)]
    struct CountingOutput {
        payloads: Arc<PlMutex<Vec<Vec<u8>>>>,
    }

    impl Output for CountingOutput {
        fn write(&mut self, payload: &[u8]) -> Result<(), SinkError> {
            self.payloads.lock().push(payload.to_vec());
            Ok(())
        }
    }

    fn path_config(path: &str, action: Action) -> Configuration {
        Configuration {
            sets: vec![TracePointSet {
                filter: Filter::Or(vec![Filter::Path(Pattern::Exact(path.into()))]),
                action,
            }],
            serializer: SerializerKind::Xml,
            ..Configuration::default()
        }
    }

    fn test_site() -> CallSite {
        CallSite::new(TracePointKind::Log, 1, "main.cpp", 8, None)
    }

    #[test]
    fn inactive_site_touches_no_sink() {
        let dispatcher = Dispatcher::new("app".into());
        let sink = CountingOutput::default();
        dispatcher.set_output(Box::new(sink.clone()));
        dispatcher.install_configuration(path_config("other.cpp", Action::Log));

        let site = test_site();
        dispatcher.visit(&site, "int main()", Some("hello".into()), None);

        assert!(sink.payloads.lock().is_empty());
        let (generation, decision) = site.cache.load();
        assert_eq!(generation, 1);
        assert!(!decision.active);
    }

    #[test]
    fn no_configuration_means_no_emission() {
        let dispatcher = Dispatcher::new("app".into());
        let sink = CountingOutput::default();
        dispatcher.set_output(Box::new(sink.clone()));

        let site = test_site();
        dispatcher.visit(&site, "int main()", Some("hello".into()), None);

        assert!(sink.payloads.lock().is_empty());
        // The site never resolved: no configuration was ever installed.
        assert_eq!(site.cache.load().0, 0);
    }

    #[test]
    fn active_site_emits_one_payload_per_hit() {
        let dispatcher = Dispatcher::new("app".into());
        dispatcher.install_configuration(path_config("main.cpp", Action::Log));
        let sink = CountingOutput::default();
        dispatcher.set_output(Box::new(sink.clone()));

        let site = test_site();
        dispatcher.visit(&site, "int main()", Some("first".into()), None);
        dispatcher.visit(&site, "int main()", Some("second".into()), None);

        let payloads = sink.payloads.lock();
        assert_eq!(payloads.len(), 2);
        let first = String::from_utf8(payloads[0].clone()).expect("xml output");
        assert!(first.contains("<message>first</message>"));
        assert!(first.contains("<location lineno=\"8\">main.cpp</location>"));
    }

    #[test]
    fn reload_reresolves_each_site_exactly_once() {
        let dispatcher = Dispatcher::new("app".into());
        dispatcher.install_configuration(path_config("other.cpp", Action::Log));
        let sink = CountingOutput::default();
        dispatcher.set_output(Box::new(sink.clone()));

        let site = test_site();
        dispatcher.visit(&site, "int main()", None, None);
        assert!(sink.payloads.lock().is_empty());
        assert_eq!(site.cache.load().0, 1);

        dispatcher.install_configuration(path_config("main.cpp", Action::Log));
        dispatcher.visit(&site, "int main()", None, None);

        assert_eq!(sink.payloads.lock().len(), 1);
        let (generation, decision) = site.cache.load();
        assert_eq!(generation, 2);
        assert!(decision.active);
    }

    #[test]
    fn variables_are_dropped_unless_yielded() {
        let dispatcher = Dispatcher::new("app".into());
        dispatcher.install_configuration(path_config("main.cpp", Action::Log));
        let sink = CountingOutput::default();
        dispatcher.set_output(Box::new(sink.clone()));

        let site = CallSite::new(TracePointKind::Watch, 1, "main.cpp", 16, None);
        let snapshot: VariableSnapshot = [VariableValue {
            name: "name".into(),
            value_type: spoor_types::VariableType::String,
            value: "Max".into(),
        }]
        .into_iter()
        .collect();
        dispatcher.visit(&site, "int main()", None, Some(snapshot.clone()));

        let first = String::from_utf8(sink.payloads.lock()[0].clone()).expect("xml output");
        assert!(!first.contains("<variables>"));

        let dispatcher = Dispatcher::new("app".into());
        dispatcher.install_configuration(path_config("main.cpp", Action::YieldVariables));
        let sink = CountingOutput::default();
        dispatcher.set_output(Box::new(sink.clone()));

        let site = CallSite::new(TracePointKind::Watch, 1, "main.cpp", 16, None);
        dispatcher.visit(&site, "int main()", None, Some(snapshot));
        let second = String::from_utf8(sink.payloads.lock()[0].clone()).expect("xml output");
        assert!(second.contains(
            "<variables><variable name=\"name\" type=\"string\">Max</variable></variables>"
        ));
    }

    #[test]
    fn yield_backtrace_attaches_frames() {
        let dispatcher = Dispatcher::new("app".into());
        dispatcher.install_configuration(path_config("main.cpp", Action::YieldBacktrace));
        let sink = CountingOutput::default();
        dispatcher.set_output(Box::new(sink.clone()));

        let site = test_site();
        dispatcher.visit(&site, "int main()", None, None);

        let payload = String::from_utf8(sink.payloads.lock()[0].clone()).expect("xml output");
        assert!(payload.contains("<backtrace>"));
    }

    #[test]
    fn visits_after_shutdown_are_no_ops() {
        let dispatcher = Dispatcher::new("app".into());
        dispatcher.install_configuration(path_config("main.cpp", Action::Log));
        let sink = CountingOutput::default();
        dispatcher.set_output(Box::new(sink.clone()));

        dispatcher.shutdown();
        let emitted_at_shutdown = sink.payloads.lock().len();

        let site = test_site();
        dispatcher.visit(&site, "int main()", Some("late".into()), None);
        assert_eq!(sink.payloads.lock().len(), emitted_at_shutdown);
        assert_eq!(dispatcher.diagnostics().dropped_after_shutdown, 1);
    }

    #[test]
    fn shutdown_emits_the_synthetic_event_once() {
        let dispatcher = Dispatcher::new("app".into());
        dispatcher.install_configuration(path_config("main.cpp", Action::Log));
        let sink = CountingOutput::default();
        dispatcher.set_output(Box::new(sink.clone()));

        dispatcher.shutdown();
        dispatcher.shutdown();

        let payloads = sink.payloads.lock();
        assert_eq!(payloads.len(), 1);
        let event = String::from_utf8(payloads[0].clone()).expect("xml output");
        assert!(event.starts_with("<shutdownevent "));
    }

    #[test]
    fn sink_errors_never_reach_the_caller() {
        struct FailingOutput;
        impl Output for FailingOutput {
            fn write(&mut self, _payload: &[u8]) -> Result<(), SinkError> {
                Err(SinkError::Io {
                    context: "test sink",
                    message: "boom".into(),
                })
            }
        }

        let dispatcher = Dispatcher::new("app".into());
        dispatcher.install_configuration(path_config("main.cpp", Action::Log));
        dispatcher.set_output(Box::new(FailingOutput));

        let site = test_site();
        dispatcher.visit(&site, "int main()", Some("x".into()), None);
        assert_eq!(dispatcher.diagnostics().sink_errors, 1);
    }
}
