//! The declarative filter configuration.
//!
//! An XML descriptor selects, per process, an output sink, a serializer,
//! key enablement, and an ordered list of trace-point sets. Parsing is
//! strict: an unrecognized element or attribute value fails the whole
//! parse, and the dispatcher keeps the previously installed
//! configuration in force.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use spoor_types::TracePointKind;

use crate::filter::{Filter, Pattern, PointFields, TraceKeys};

/// Overrides the config file location when no explicit path is given.
pub const CONFIG_ENV_VAR: &str = "SPOOR_CONFIGFILE";
/// Default config file name, looked up next to the executable.
pub const DEFAULT_CONFIG_FILE_NAME: &str = "spoor.xml";
/// Default collector port, shared with the daemon.
pub const DEFAULT_TCP_PORT: u16 = 12382;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerializerKind {
    Xml,
    #[default]
    Plaintext,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSpec {
    Stdout,
    File { path: PathBuf, append: bool },
    Tcp { host: String, port: u16 },
}

impl Default for OutputSpec {
    fn default() -> Self {
        Self::Stdout
    }
}

/// What a matching trace-point set does with a hit. `YieldBacktrace`
/// and `YieldVariables` imply logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Ignore,
    Log,
    YieldBacktrace,
    YieldVariables,
}

impl Action {
    fn parse(text: &str) -> Option<Self> {
        match text {
            "ignore" => Some(Self::Ignore),
            "log" => Some(Self::Log),
            "yieldBacktrace" => Some(Self::YieldBacktrace),
            "yieldVariables" => Some(Self::YieldVariables),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TracePointSet {
    pub filter: Filter,
    pub action: Action,
}

/// One parsed, immutable configuration. `generation` is stamped by the
/// dispatcher when the configuration is installed, never by the parser.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Configuration {
    pub generation: u64,
    pub serializer: SerializerKind,
    pub output: Option<OutputSpec>,
    pub keys: TraceKeys,
    pub sets: Vec<TracePointSet>,
}

impl Configuration {
    /// First matching set wins; no match means the point is ignored.
    pub fn decide(&self, point: &PointFields<'_>) -> Action {
        for set in &self.sets {
            if set.filter.matches(point, &self.keys) {
                return set.action;
            }
        }
        Action::Ignore
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Read { path: PathBuf, message: String },
    Xml { message: String },
    Invalid { message: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read { path, message } => {
                write!(f, "cannot read configuration {}: {message}", path.display())
            }
            Self::Xml { message } => write!(f, "configuration XML error: {message}"),
            Self::Invalid { message } => write!(f, "invalid configuration: {message}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Resolve the configuration path: explicit argument, then the
/// `SPOOR_CONFIGFILE` environment variable, then the default file next
/// to the executable. The returned path may not exist yet; the watcher
/// picks the file up when it appears.
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
        if !env_path.trim().is_empty() {
            return PathBuf::from(env_path);
        }
    }
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));
    match exe_dir {
        Some(dir) => dir.join(DEFAULT_CONFIG_FILE_NAME),
        None => PathBuf::from(DEFAULT_CONFIG_FILE_NAME),
    }
}

pub fn load_configuration(
    path: &Path,
    process_name: &str,
) -> Result<Option<Configuration>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    parse_configuration(&text, process_name)
}

/// Parse the descriptor and pick the `<process>` block whose `<name>`
/// equals `process_name`. `Ok(None)` means the file is valid but has no
/// block for this process: tracing stays disabled.
pub fn parse_configuration(
    xml: &str,
    process_name: &str,
) -> Result<Option<Configuration>, ConfigError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut saw_root = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) if start.name().as_ref() == b"spoorConfiguration" => {
                saw_root = true;
            }
            Ok(Event::Start(start)) if start.name().as_ref() == b"process" => {
                if !saw_root {
                    return Err(invalid("<process> outside <spoorConfiguration>"));
                }
                let block = parse_process(&mut reader)?;
                if block.name == process_name {
                    return Ok(Some(block.configuration));
                }
            }
            Ok(Event::Start(start)) => {
                return Err(invalid(format!(
                    "unknown element <{}>",
                    element_name(&start)
                )));
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(xml_error(e)),
        }
    }

    if !saw_root {
        return Err(invalid("missing <spoorConfiguration> root element"));
    }
    Ok(None)
}

struct ProcessBlock {
    name: String,
    configuration: Configuration,
}

fn parse_process(reader: &mut Reader<&[u8]>) -> Result<ProcessBlock, ConfigError> {
    let mut name = String::new();
    let mut configuration = Configuration::default();

    loop {
        match reader.read_event() {
            Ok(Event::Start(child)) => match child.name().as_ref() {
                b"name" => name = text_content(reader)?,
                b"output" => configuration.output = Some(parse_output(reader, &child)?),
                b"serializer" => {
                    configuration.serializer = parse_serializer(&child)?;
                    consume_element(reader)?;
                }
                b"tracekeys" => parse_trace_keys(reader, &mut configuration.keys)?,
                b"tracepointset" => configuration.sets.push(parse_trace_point_set(reader, &child)?),
                _ => {
                    return Err(invalid(format!(
                        "unknown element <{}> in <process>",
                        element_name(&child)
                    )))
                }
            },
            Ok(Event::Empty(child)) => match child.name().as_ref() {
                b"serializer" => configuration.serializer = parse_serializer(&child)?,
                b"output" => configuration.output = Some(build_output(&child, &HashMap::new())?),
                _ => {
                    return Err(invalid(format!(
                        "unknown element <{}/> in <process>",
                        element_name(&child)
                    )))
                }
            },
            Ok(Event::End(end)) if end.name().as_ref() == b"process" => break,
            Ok(Event::Eof) => return Err(invalid("unterminated <process> block")),
            Ok(_) => {}
            Err(e) => return Err(xml_error(e)),
        }
    }

    if name.is_empty() {
        return Err(invalid("<process> block without a <name>"));
    }
    Ok(ProcessBlock {
        name,
        configuration,
    })
}

fn parse_serializer(element: &BytesStart<'_>) -> Result<SerializerKind, ConfigError> {
    match attr(element, "type")?.as_deref() {
        Some("xml") => Ok(SerializerKind::Xml),
        Some("plaintext") | None => Ok(SerializerKind::Plaintext),
        Some(other) => Err(invalid(format!("unknown serializer type {other:?}"))),
    }
}

fn parse_output(
    reader: &mut Reader<&[u8]>,
    element: &BytesStart<'_>,
) -> Result<OutputSpec, ConfigError> {
    let mut options: HashMap<String, String> = HashMap::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(child)) if child.name().as_ref() == b"option" => {
                let key = attr(&child, "name")?
                    .ok_or_else(|| invalid("<option> without a name attribute"))?;
                options.insert(key, text_content(reader)?);
            }
            Ok(Event::Start(child)) => {
                return Err(invalid(format!(
                    "unknown element <{}> in <output>",
                    element_name(&child)
                )))
            }
            Ok(Event::End(end)) if end.name().as_ref() == b"output" => break,
            Ok(Event::Eof) => return Err(invalid("unterminated <output> block")),
            Ok(_) => {}
            Err(e) => return Err(xml_error(e)),
        }
    }
    build_output(element, &options)
}

fn build_output(
    element: &BytesStart<'_>,
    options: &HashMap<String, String>,
) -> Result<OutputSpec, ConfigError> {
    match attr(element, "type")?.as_deref() {
        Some("stdout") | None => Ok(OutputSpec::Stdout),
        Some("file") => {
            let path = options
                .get("filename")
                .ok_or_else(|| invalid("file output needs a filename option"))?;
            let append = match options.get("append").map(String::as_str) {
                Some("true") | Some("yes") | None => true,
                Some("false") | Some("no") => false,
                Some(other) => return Err(invalid(format!("bad append option {other:?}"))),
            };
            Ok(OutputSpec::File {
                path: PathBuf::from(path),
                append,
            })
        }
        Some("tcp") => {
            let host = options
                .get("host")
                .cloned()
                .unwrap_or_else(|| String::from("127.0.0.1"));
            let port = match options.get("port") {
                Some(text) => text
                    .trim()
                    .parse()
                    .map_err(|_| invalid(format!("bad tcp port {text:?}")))?,
                None => DEFAULT_TCP_PORT,
            };
            Ok(OutputSpec::Tcp { host, port })
        }
        Some(other) => Err(invalid(format!("unknown output type {other:?}"))),
    }
}

fn parse_trace_keys(reader: &mut Reader<&[u8]>, keys: &mut TraceKeys) -> Result<(), ConfigError> {
    loop {
        match reader.read_event() {
            Ok(Event::Start(child)) if child.name().as_ref() == b"key" => {
                let enabled = match attr(&child, "enabled")?.as_deref() {
                    Some("true") | Some("yes") | None => true,
                    Some("false") | Some("no") => false,
                    Some(other) => {
                        return Err(invalid(format!("bad key enabled attribute {other:?}")))
                    }
                };
                let name = text_content(reader)?;
                keys.set(name, enabled);
            }
            Ok(Event::Start(child)) => {
                return Err(invalid(format!(
                    "unknown element <{}> in <tracekeys>",
                    element_name(&child)
                )))
            }
            Ok(Event::End(end)) if end.name().as_ref() == b"tracekeys" => return Ok(()),
            Ok(Event::Eof) => return Err(invalid("unterminated <tracekeys> block")),
            Ok(_) => {}
            Err(e) => return Err(xml_error(e)),
        }
    }
}

fn parse_trace_point_set(
    reader: &mut Reader<&[u8]>,
    element: &BytesStart<'_>,
) -> Result<TracePointSet, ConfigError> {
    let action = match attr(element, "action")?.as_deref() {
        Some(text) => {
            Action::parse(text).ok_or_else(|| invalid(format!("unknown action {text:?}")))?
        }
        None => Action::Log,
    };

    let mut filter = None;
    loop {
        match reader.read_event() {
            Ok(Event::Start(child)) => {
                if filter.is_some() {
                    return Err(invalid("<tracepointset> takes exactly one filter combinator"));
                }
                filter = Some(parse_combinator(reader, &child)?);
            }
            Ok(Event::Empty(child)) => {
                if filter.is_some() {
                    return Err(invalid("<tracepointset> takes exactly one filter combinator"));
                }
                filter = Some(parse_leaf_start(&child, None)?);
            }
            Ok(Event::End(end)) if end.name().as_ref() == b"tracepointset" => break,
            Ok(Event::Eof) => return Err(invalid("unterminated <tracepointset> block")),
            Ok(_) => {}
            Err(e) => return Err(xml_error(e)),
        }
    }

    let filter = filter.ok_or_else(|| invalid("<tracepointset> without a filter"))?;
    Ok(TracePointSet { filter, action })
}

/// Parse a `<matchany>/<matchall>/<matchnone>` combinator (or a bare
/// leaf). Combinators nest arbitrarily.
fn parse_combinator(
    reader: &mut Reader<&[u8]>,
    element: &BytesStart<'_>,
) -> Result<Filter, ConfigError> {
    let name = element.name().as_ref().to_vec();
    match name.as_slice() {
        b"matchany" | b"matchall" | b"matchnone" => {
            let mut children = Vec::new();
            loop {
                match reader.read_event() {
                    Ok(Event::Start(child)) => children.push(parse_combinator(reader, &child)?),
                    Ok(Event::Empty(child)) => children.push(parse_leaf_start(&child, None)?),
                    Ok(Event::End(end)) if end.name().as_ref() == name.as_slice() => break,
                    Ok(Event::End(_)) => {}
                    Ok(Event::Eof) => return Err(invalid("unterminated filter combinator")),
                    Ok(_) => {}
                    Err(e) => return Err(xml_error(e)),
                }
            }
            Ok(match name.as_slice() {
                b"matchany" => Filter::Or(children),
                b"matchall" => Filter::And(children),
                _ => Filter::Not(Box::new(Filter::Or(children))),
            })
        }
        _ => {
            // A leaf with text content (path/function patterns).
            let text = text_content(reader)?;
            parse_leaf_start(element, Some(text))
        }
    }
}

fn parse_leaf_start(
    element: &BytesStart<'_>,
    text: Option<String>,
) -> Result<Filter, ConfigError> {
    match element.name().as_ref() {
        // Self-closed combinators are legal and match their identity.
        b"matchany" => Ok(Filter::Or(Vec::new())),
        b"matchall" => Ok(Filter::And(Vec::new())),
        b"matchnone" => Ok(Filter::Not(Box::new(Filter::Or(Vec::new())))),
        b"pathfilter" => Ok(Filter::Path(leaf_pattern(element, text)?)),
        b"functionfilter" => Ok(Filter::FunctionName(leaf_pattern(element, text)?)),
        b"processfilter" => Ok(Filter::ProcessName(leaf_pattern(element, text)?)),
        b"keyfilter" => Ok(Filter::Group(text.unwrap_or_default())),
        b"verbosityfilter" => {
            let max = attr(element, "maxVerbosity")?
                .ok_or_else(|| invalid("<verbosityfilter> needs maxVerbosity"))?;
            let max = max
                .trim()
                .parse()
                .map_err(|_| invalid(format!("bad maxVerbosity {max:?}")))?;
            Ok(Filter::VerbosityAtMost(max))
        }
        b"typefilter" => {
            let kind = attr(element, "type")?
                .ok_or_else(|| invalid("<typefilter> needs a type attribute"))?;
            let kind = TracePointKind::from_config_name(&kind)
                .ok_or_else(|| invalid(format!("unknown trace point type {kind:?}")))?;
            Ok(Filter::Kind(vec![kind]))
        }
        other => Err(invalid(format!(
            "unknown filter element <{}>",
            String::from_utf8_lossy(other)
        ))),
    }
}

fn leaf_pattern(element: &BytesStart<'_>, text: Option<String>) -> Result<Pattern, ConfigError> {
    let text = text.unwrap_or_default();
    match attr(element, "matchingmode")?.as_deref() {
        Some("strict") | None => Ok(Pattern::Exact(text)),
        Some("substring") => Ok(Pattern::Contains(text)),
        Some("wildcard") => Ok(Pattern::Wildcard(text)),
        Some(other) => Err(invalid(format!("unknown matchingmode {other:?}"))),
    }
}

fn attr(element: &BytesStart<'_>, name: &str) -> Result<Option<String>, ConfigError> {
    match element.try_get_attribute(name) {
        Ok(Some(attr)) => attr
            .unescape_value()
            .map(|v| Some(v.into_owned()))
            .map_err(xml_error),
        Ok(None) => Ok(None),
        Err(e) => Err(xml_error(e)),
    }
}

fn text_content(reader: &mut Reader<&[u8]>) -> Result<String, ConfigError> {
    let mut text = String::new();
    let mut depth = 0usize;
    loop {
        match reader.read_event() {
            Ok(Event::Text(t)) => {
                if depth == 0 {
                    text.push_str(&t.unescape().map_err(xml_error)?);
                }
            }
            Ok(Event::Start(_)) => depth += 1,
            Ok(Event::End(_)) => {
                if depth == 0 {
                    return Ok(text);
                }
                depth -= 1;
            }
            Ok(Event::Eof) => return Ok(text),
            Ok(_) => {}
            Err(e) => return Err(xml_error(e)),
        }
    }
}

/// Consume a started element we only needed the attributes of.
fn consume_element(reader: &mut Reader<&[u8]>) -> Result<(), ConfigError> {
    let mut depth = 0usize;
    loop {
        match reader.read_event() {
            Ok(Event::Start(_)) => depth += 1,
            Ok(Event::End(_)) => {
                if depth == 0 {
                    return Ok(());
                }
                depth -= 1;
            }
            Ok(Event::Eof) => return Ok(()),
            Ok(_) => {}
            Err(e) => return Err(xml_error(e)),
        }
    }
}

fn element_name(element: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(element.name().as_ref()).into_owned()
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        message: message.into(),
    }
}

fn xml_error(e: impl fmt::Display) -> ConfigError {
    ConfigError::Xml {
        message: e.to_string(),
    }
}
