//! Human-readable one-line-per-entry serializer for stdout/file sinks.

use chrono::DateTime;
use spoor_types::{ProcessShutdownEvent, TraceEntry};

use crate::{SerializeError, Serializer};

#[derive(Debug, Default)]
pub struct PlaintextSerializer;

impl PlaintextSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl Serializer for PlaintextSerializer {
    fn serialize(&mut self, entry: &TraceEntry) -> Result<Vec<u8>, SerializeError> {
        let mut line = String::with_capacity(128);
        line.push_str(&render_time(entry.timestamp_secs)?);
        line.push_str(": Process ");
        line.push_str(&entry.pid.to_string());
        line.push_str(" (Thread ");
        line.push_str(&entry.tid.to_string());
        line.push_str("): [");
        line.push_str(entry.kind.label());
        line.push(']');
        if !entry.message.is_empty() {
            line.push_str(" '");
            line.push_str(&entry.message);
            line.push('\'');
        }
        line.push(' ');
        line.push_str(&entry.path);
        line.push(':');
        line.push_str(&entry.line.to_string());
        line.push_str(": ");
        line.push_str(&entry.function);

        if !entry.variables.is_empty() {
            line.push_str(" {");
            for (i, var) in entry.variables.iter().enumerate() {
                if i > 0 {
                    line.push_str(", ");
                }
                line.push_str(&var.name);
                line.push('=');
                line.push_str(&var.value);
            }
            line.push('}');
        }

        line.push('\n');
        Ok(line.into_bytes())
    }

    fn serialize_shutdown(
        &mut self,
        event: &ProcessShutdownEvent,
    ) -> Result<Vec<u8>, SerializeError> {
        let line = format!(
            "{}: Process {} [started at {}] finished\n",
            render_time(event.shutdown_time_secs)?,
            event.pid,
            render_time(event.start_time_secs)?,
        );
        Ok(line.into_bytes())
    }
}

fn render_time(secs: u64) -> Result<String, SerializeError> {
    let ts = i64::try_from(secs).ok().and_then(|s| DateTime::from_timestamp(s, 0));
    match ts {
        Some(dt) => Ok(dt.format("%d.%m.%Y %H:%M:%S").to_string()),
        None => Err(SerializeError::Unrepresentable {
            field: "timestamp",
            value: secs.to_string(),
        }),
    }
}
