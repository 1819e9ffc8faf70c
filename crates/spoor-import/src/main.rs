//! Imports an XML trace log into a trace database in one shot.
//!
//! The input is the same self-framing stream the daemon receives over
//! TCP, read from a file or standard input, wrapped in
//! `<toplevel_trace_element>` before parsing. Exit codes mirror the
//! distinct failure stages so scripts can tell them apart.

use std::io::Read;
use std::path::PathBuf;

use clap::error::ErrorKind;
use clap::Parser;
use spoor_collect::{feed_entry, init_schema, Db};
use spoor_wire::{decode_entry, DecodeError, Framer};
use tracing::warn;

mod exit_code {
    pub const NONE: i32 = 0;
    pub const COMMAND_LINE_ARGS: i32 = 1;
    pub const OPEN: i32 = 2;
    pub const FILE: i32 = 3;
    pub const TRANSFORMATION: i32 = 4;
}

#[derive(Debug, Parser)]
#[command(
    name = "spoor-import",
    about = "Writes an XML trace log into a SQLite trace database",
    after_help = "If the XMLFILE argument is omitted the XML trace log is read\n\
                  from the standard input channel."
)]
struct Cli {
    /// Writes the trace database to FILE
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    output: Option<PathBuf>,

    /// XML trace log to import
    #[arg(value_name = "XMLFILE")]
    xml_file: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            print!("{e}");
            std::process::exit(exit_code::NONE);
        }
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(exit_code::COMMAND_LINE_ARGS);
        }
    };

    std::process::exit(run(cli));
}

fn run(cli: Cli) -> i32 {
    let Some(output) = cli.output else {
        eprintln!("Missing output trace database filename. Try --help.");
        return exit_code::COMMAND_LINE_ARGS;
    };

    let db = Db::new(output);
    if let Err(e) = init_schema(&db) {
        eprintln!(
            "Failed to open output trace database {}: {e}",
            db.path().display()
        );
        return exit_code::OPEN;
    }
    let mut conn = match db.open() {
        Ok(conn) => conn,
        Err(e) => {
            eprintln!(
                "Failed to open output trace database {}: {e}",
                db.path().display()
            );
            return exit_code::OPEN;
        }
    };

    let mut input: Box<dyn Read> = match &cli.xml_file {
        Some(path) => match std::fs::File::open(path) {
            Ok(file) => Box::new(file),
            Err(e) => {
                eprintln!("File '{}' cannot be opened for reading: {e}", path.display());
                return exit_code::FILE;
            }
        },
        None => Box::new(std::io::stdin()),
    };

    match transform(&mut conn, input.as_mut()) {
        Ok(stored) => {
            eprintln!("Imported {stored} trace entries.");
            exit_code::NONE
        }
        Err(e) => {
            eprintln!("Transformation error: {e}");
            exit_code::TRANSFORMATION
        }
    }
}

/// Stream the input through the wire framer and feed every decoded
/// entry. The whole batch shares one connection; each entry commits its
/// own transaction, so a storage failure costs at most one entry, then
/// aborts the import with its driver message.
fn transform(conn: &mut rusqlite::Connection, input: &mut dyn Read) -> Result<u64, String> {
    let mut framer = Framer::new();
    // The one-shot convention: the log is parsed as if wrapped in a
    // single toplevel element.
    let leading = framer.push(b"<toplevel_trace_element>");
    debug_assert!(leading.is_empty());

    let mut stored = 0u64;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = input
            .read(&mut buf)
            .map_err(|e| format!("read XML input: {e}"))?;
        if read == 0 {
            break;
        }
        for slice in framer.push(&buf[..read]) {
            stored += store_slice(conn, &slice)?;
        }
    }
    if let Some(tail) = framer.finish() {
        stored += store_slice(conn, &tail)?;
    }
    Ok(stored)
}

fn store_slice(conn: &mut rusqlite::Connection, slice: &[u8]) -> Result<u64, String> {
    let entry = match decode_entry(slice) {
        Ok(entry) => entry,
        // The wrapper/terminator slice carries no entry; real XML
        // damage is reported but fails only that slice.
        Err(DecodeError::MissingEntryElement) => return Ok(0),
        Err(e) => {
            warn!(%e, slice_bytes = slice.len(), "skipping undecodable entry slice");
            return Ok(0);
        }
    };
    feed_entry(conn, &entry)
        .map(|_| 1)
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use spoor_types::{Backtrace, TraceEntry, TracePointKind, VariableSnapshot};
    use spoor_wire::{Serializer, XmlSerializer};

    use super::*;

    fn entry(message: &str) -> TraceEntry {
        TraceEntry {
            pid: 11,
            tid: 12,
            timestamp_secs: 13,
            process_name: "imported".into(),
            verbosity: 1,
            kind: TracePointKind::Log,
            path: "a.rs".into(),
            line: 14,
            function: "f".into(),
            message: message.into(),
            variables: VariableSnapshot::new(),
            backtrace: Backtrace::new(),
        }
    }

    #[test]
    fn transform_imports_a_concatenated_log() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let db = Db::new(dir.path().join("trace.db"));
        init_schema(&db).expect("schema init");
        let mut conn = db.open().expect("open");

        let mut log = Vec::new();
        for i in 0..3 {
            log.extend_from_slice(
                &XmlSerializer::new()
                    .serialize(&entry(&format!("entry {i}")))
                    .expect("serialize"),
            );
        }

        let stored = transform(&mut conn, &mut log.as_slice()).expect("transform");
        assert_eq!(stored, 3);

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM trace_entry", [], |row| row.get(0))
            .expect("count");
        assert_eq!(rows, 3);
    }

    #[test]
    fn empty_input_imports_nothing() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let db = Db::new(dir.path().join("trace.db"));
        init_schema(&db).expect("schema init");
        let mut conn = db.open().expect("open");

        let stored = transform(&mut conn, &mut (&[] as &[u8])).expect("transform");
        assert_eq!(stored, 0);
    }
}
