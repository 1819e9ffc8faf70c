//! Stream decoder for a single framed entry slice.
//!
//! Tolerance rules: unknown elements are skipped, missing optional
//! elements keep their defaults, numeric fields that fail to parse read
//! as zero, and an element cut off by end-of-stream still yields what
//! was parsed so far. A slice containing no `<traceentry>` element at
//! all (for example the terminator bytes before the first sentinel) is
//! an error the caller reports and drops.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use spoor_types::{
    Backtrace, StackFrame, TraceEntry, TracePointKind, VariableSnapshot, VariableType,
    VariableValue,
};

use crate::DecodeError;

pub fn decode_entry(slice: &[u8]) -> Result<TraceEntry, DecodeError> {
    let text = std::str::from_utf8(slice).map_err(|e| DecodeError::Utf8 {
        valid_up_to: e.valid_up_to(),
    })?;

    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);
    reader.config_mut().check_end_names = false;

    // Scan past any wrapper (the import tool feeds documents wrapped in
    // <toplevel_trace_element>) until the entry element starts.
    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) if start.name().as_ref() == b"traceentry" => {
                return parse_entry(&mut reader, &start);
            }
            Ok(Event::Eof) => return Err(DecodeError::MissingEntryElement),
            Ok(_) => {}
            Err(e) => return Err(xml_error(e)),
        }
    }
}

fn parse_entry(reader: &mut Reader<&[u8]>, start: &BytesStart<'_>) -> Result<TraceEntry, DecodeError> {
    let mut entry = TraceEntry {
        pid: attr_parse(start, "pid"),
        tid: attr_parse(start, "tid"),
        timestamp_secs: attr_parse(start, "time"),
        process_name: String::new(),
        verbosity: 0,
        kind: TracePointKind::None,
        path: String::new(),
        line: 0,
        function: String::new(),
        message: String::new(),
        variables: VariableSnapshot::new(),
        backtrace: Backtrace::new(),
    };

    loop {
        match reader.read_event() {
            Ok(Event::Start(child)) => match child.name().as_ref() {
                b"processname" => entry.process_name = text_content(reader)?,
                b"verbosity" => entry.verbosity = numeric(&text_content(reader)?),
                b"type" => entry.kind = TracePointKind::from_code(numeric(&text_content(reader)?)),
                b"location" => {
                    entry.line = attr_parse(&child, "lineno");
                    entry.path = text_content(reader)?;
                }
                b"function" => entry.function = text_content(reader)?,
                b"message" => entry.message = text_content(reader)?,
                b"variables" => parse_variables(reader, &mut entry.variables)?,
                b"backtrace" => parse_backtrace(reader, &mut entry.backtrace)?,
                _ => skip_element(reader)?,
            },
            Ok(Event::End(end)) if end.name().as_ref() == b"traceentry" => break,
            // A slice truncated at end-of-stream still yields the fields
            // parsed so far.
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(xml_error(e)),
        }
    }

    Ok(entry)
}

fn parse_variables(
    reader: &mut Reader<&[u8]>,
    variables: &mut VariableSnapshot,
) -> Result<(), DecodeError> {
    loop {
        match reader.read_event() {
            Ok(Event::Start(child)) if child.name().as_ref() == b"variable" => {
                let name = attr_string(&child, "name");
                let value_type = VariableType::from_label(&attr_string(&child, "type"));
                let value = text_content(reader)?;
                variables.push(VariableValue {
                    name,
                    value_type,
                    value,
                });
            }
            Ok(Event::Start(_)) => skip_element(reader)?,
            Ok(Event::End(_)) | Ok(Event::Eof) => return Ok(()),
            Ok(_) => {}
            Err(e) => return Err(xml_error(e)),
        }
    }
}

fn parse_backtrace(
    reader: &mut Reader<&[u8]>,
    backtrace: &mut Backtrace,
) -> Result<(), DecodeError> {
    loop {
        match reader.read_event() {
            Ok(Event::Start(child)) if child.name().as_ref() == b"frame" => {
                backtrace.0.push(parse_frame(reader)?);
            }
            Ok(Event::Start(_)) => skip_element(reader)?,
            Ok(Event::End(_)) | Ok(Event::Eof) => return Ok(()),
            Ok(_) => {}
            Err(e) => return Err(xml_error(e)),
        }
    }
}

fn parse_frame(reader: &mut Reader<&[u8]>) -> Result<StackFrame, DecodeError> {
    let mut frame = StackFrame {
        module: String::new(),
        function: String::new(),
        function_offset: 0,
        source_file: String::new(),
        line_number: 0,
    };

    loop {
        match reader.read_event() {
            Ok(Event::Start(child)) => match child.name().as_ref() {
                b"module" => frame.module = text_content(reader)?,
                b"function" => {
                    frame.function_offset = attr_parse(&child, "offset");
                    frame.function = text_content(reader)?;
                }
                b"location" => {
                    frame.line_number = attr_parse(&child, "lineno");
                    frame.source_file = text_content(reader)?;
                }
                _ => skip_element(reader)?,
            },
            Ok(Event::End(_)) | Ok(Event::Eof) => return Ok(frame),
            Ok(_) => {}
            Err(e) => return Err(xml_error(e)),
        }
    }
}

/// Collect the text of the element whose start tag was just read,
/// consuming its end tag. Nested elements contribute nothing.
fn text_content(reader: &mut Reader<&[u8]>) -> Result<String, DecodeError> {
    let mut text = String::new();
    let mut depth = 0usize;
    loop {
        match reader.read_event() {
            Ok(Event::Text(t)) => {
                if depth == 0 {
                    text.push_str(&t.unescape().map_err(xml_error)?);
                }
            }
            Ok(Event::CData(c)) => {
                if depth == 0 {
                    text.push_str(&String::from_utf8_lossy(&c.into_inner()));
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

fn skip_element(reader: &mut Reader<&[u8]>) -> Result<(), DecodeError> {
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

fn attr_string(start: &BytesStart<'_>, name: &str) -> String {
    match start.try_get_attribute(name) {
        Ok(Some(attr)) => attr
            .unescape_value()
            .map(|v| v.into_owned())
            .unwrap_or_default(),
        _ => String::new(),
    }
}

fn attr_parse<T: std::str::FromStr + Default>(start: &BytesStart<'_>, name: &str) -> T {
    attr_string(start, name).trim().parse().unwrap_or_default()
}

fn numeric<T: std::str::FromStr + Default>(text: &str) -> T {
    text.trim().parse().unwrap_or_default()
}

fn xml_error(e: impl std::fmt::Display) -> DecodeError {
    DecodeError::Xml {
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use spoor_types::ProcessShutdownEvent;

    use crate::{Serializer, XmlSerializer};

    use super::*;

    fn full_entry() -> TraceEntry {
        TraceEntry {
            pid: 2524,
            tid: 468,
            timestamp_secs: 1283529656,
            process_name: "hello_instrumented".into(),
            verbosity: 1,
            kind: TracePointKind::Watch,
            path: "main.cpp".into(),
            line: 16,
            function: "int main()".into(),
            message: "watch hit".into(),
            variables: VariableSnapshot(vec![VariableValue {
                name: "name".into(),
                value_type: VariableType::String,
                value: "Max".into(),
            }]),
            backtrace: Backtrace(vec![
                StackFrame {
                    module: "hello".into(),
                    function: "main".into(),
                    function_offset: 52,
                    source_file: "main.cpp".into(),
                    line_number: 16,
                },
                StackFrame {
                    module: "libc".into(),
                    function: "__libc_start_main".into(),
                    function_offset: 243,
                    source_file: String::new(),
                    line_number: 0,
                },
            ]),
        }
    }

    #[test]
    fn round_trip_preserves_every_field() {
        let entry = full_entry();
        let bytes = XmlSerializer::new()
            .serialize(&entry)
            .expect("entry must serialize");
        let decoded = decode_entry(&bytes).expect("serialized entry must decode");
        assert_eq!(decoded, entry);
    }

    #[test]
    fn empty_optionals_decode_to_defaults() {
        let slice = b"<traceentry pid=\"1\" tid=\"2\" time=\"3\">\
                      <processname>p</processname><verbosity>1</verbosity><type>1</type>\
                      <location lineno=\"4\">f.rs</location><function>f</function>\
                      </traceentry>";
        let entry = decode_entry(slice).expect("minimal entry must decode");
        assert_eq!(entry.message, "");
        assert!(entry.variables.is_empty());
        assert!(entry.backtrace.is_empty());
        assert_eq!(entry.kind, TracePointKind::Log);
        assert_eq!(entry.line, 4);
    }

    #[test]
    fn unknown_variable_type_maps_to_opaque() {
        let slice = b"<traceentry pid=\"1\" tid=\"2\" time=\"3\">\
                      <variables><variable name=\"v\" type=\"matrix4x4\">[..]</variable></variables>\
                      </traceentry>";
        let entry = decode_entry(slice).expect("entry must decode");
        assert_eq!(entry.variables.0[0].value_type, VariableType::Opaque);
        assert_eq!(entry.variables.0[0].value, "[..]");
    }

    #[test]
    fn toplevel_wrapper_is_tolerated() {
        let slice = b"<toplevel_trace_element><traceentry pid=\"7\" tid=\"8\" time=\"9\">\
                      <processname>p</processname></traceentry></toplevel_trace_element>";
        let entry = decode_entry(slice).expect("wrapped entry must decode");
        assert_eq!(entry.pid, 7);
        assert_eq!(entry.process_name, "p");
    }

    #[test]
    fn truncated_tail_yields_the_parsed_prefix() {
        let slice = b"<traceentry pid=\"7\" tid=\"8\" time=\"9\"><processname>p</processname>";
        let entry = decode_entry(slice).expect("truncated entry must decode");
        assert_eq!(entry.pid, 7);
        assert_eq!(entry.process_name, "p");
        assert_eq!(entry.message, "");
    }

    #[test]
    fn slice_without_entry_element_is_rejected() {
        assert_eq!(
            decode_entry(b"<shutdownevent pid=\"1\" starttime=\"2\" endtime=\"3\">p</shutdownevent>"),
            Err(DecodeError::MissingEntryElement)
        );
    }

    #[test]
    fn escaped_text_round_trips() {
        let mut entry = full_entry();
        entry.message = "a < b && c > \"d\"".into();
        let bytes = XmlSerializer::new()
            .serialize(&entry)
            .expect("entry must serialize");
        let decoded = decode_entry(&bytes).expect("escaped entry must decode");
        assert_eq!(decoded.message, entry.message);
    }

    #[test]
    fn trailing_shutdown_bytes_after_an_entry_are_ignored() {
        // The framer cuts only at entry sentinels, so a shutdown element
        // rides along in the preceding slice.
        let mut bytes = XmlSerializer::new()
            .serialize(&full_entry())
            .expect("entry must serialize");
        let shutdown = XmlSerializer::new()
            .serialize_shutdown(&ProcessShutdownEvent {
                pid: 2524,
                process_name: "hello_instrumented".into(),
                start_time_secs: 1,
                shutdown_time_secs: 2,
            })
            .expect("shutdown must serialize");
        bytes.extend_from_slice(&shutdown);

        let decoded = decode_entry(&bytes).expect("entry must decode");
        assert_eq!(decoded, full_entry());
    }
}
