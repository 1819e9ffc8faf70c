//! The normative framed-XML serializer.
//!
//! Output is one `<traceentry ...>` element per entry. Empty optional
//! parts (`message`, `variables`, `backtrace`) are omitted entirely; the
//! decoder defaults them back, so the round trip normalizes empties.

use spoor_types::{ProcessShutdownEvent, TraceEntry};

use crate::{SerializeError, Serializer};

#[derive(Debug, Default)]
pub struct XmlSerializer;

impl XmlSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl Serializer for XmlSerializer {
    fn serialize(&mut self, entry: &TraceEntry) -> Result<Vec<u8>, SerializeError> {
        let mut out = String::with_capacity(256);
        out.push_str("<traceentry pid=\"");
        out.push_str(&entry.pid.to_string());
        out.push_str("\" tid=\"");
        out.push_str(&entry.tid.to_string());
        out.push_str("\" time=\"");
        out.push_str(&entry.timestamp_secs.to_string());
        out.push_str("\">");

        text_element(&mut out, "processname", &entry.process_name);
        text_element(&mut out, "verbosity", &entry.verbosity.to_string());
        text_element(&mut out, "type", &entry.kind.code().to_string());

        out.push_str("<location lineno=\"");
        out.push_str(&entry.line.to_string());
        out.push_str("\">");
        push_escaped_text(&mut out, &entry.path);
        out.push_str("</location>");

        text_element(&mut out, "function", &entry.function);

        if !entry.message.is_empty() {
            text_element(&mut out, "message", &entry.message);
        }

        if !entry.variables.is_empty() {
            out.push_str("<variables>");
            for var in entry.variables.iter() {
                out.push_str("<variable name=\"");
                push_escaped_attr(&mut out, &var.name);
                out.push_str("\" type=\"");
                out.push_str(var.value_type.label());
                out.push_str("\">");
                push_escaped_text(&mut out, &var.value);
                out.push_str("</variable>");
            }
            out.push_str("</variables>");
        }

        if !entry.backtrace.is_empty() {
            out.push_str("<backtrace>");
            for frame in entry.backtrace.frames() {
                out.push_str("<frame>");
                text_element(&mut out, "module", &frame.module);
                out.push_str("<function offset=\"");
                out.push_str(&frame.function_offset.to_string());
                out.push_str("\">");
                push_escaped_text(&mut out, &frame.function);
                out.push_str("</function>");
                out.push_str("<location lineno=\"");
                out.push_str(&frame.line_number.to_string());
                out.push_str("\">");
                push_escaped_text(&mut out, &frame.source_file);
                out.push_str("</location>");
                out.push_str("</frame>");
            }
            out.push_str("</backtrace>");
        }

        out.push_str("</traceentry>");
        Ok(out.into_bytes())
    }

    fn serialize_shutdown(
        &mut self,
        event: &ProcessShutdownEvent,
    ) -> Result<Vec<u8>, SerializeError> {
        let mut out = String::with_capacity(96);
        out.push_str("<shutdownevent pid=\"");
        out.push_str(&event.pid.to_string());
        out.push_str("\" starttime=\"");
        out.push_str(&event.start_time_secs.to_string());
        out.push_str("\" endtime=\"");
        out.push_str(&event.shutdown_time_secs.to_string());
        out.push_str("\">");
        push_escaped_text(&mut out, &event.process_name);
        out.push_str("</shutdownevent>");
        Ok(out.into_bytes())
    }
}

fn text_element(out: &mut String, name: &str, text: &str) {
    out.push('<');
    out.push_str(name);
    out.push('>');
    push_escaped_text(out, text);
    out.push_str("</");
    out.push_str(name);
    out.push('>');
}

fn push_escaped_text(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
}

fn push_escaped_attr(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
}
