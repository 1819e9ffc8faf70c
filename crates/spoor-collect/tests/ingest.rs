//! Daemon-side end-to-end: wire bytes through framer, decoder, and
//! feeder, plus a live TCP ingest round trip.

use std::time::Duration;

use rusqlite::Connection;
use spoor_collect::{feed_entry, init_schema, run_acceptor, CollectorState, Db};
use spoor_types::{
    Backtrace, TraceEntry, TracePointKind, VariableSnapshot, VariableType, VariableValue,
};
use spoor_wire::{decode_entry, Framer, Serializer, XmlSerializer};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

fn log_entry() -> TraceEntry {
    TraceEntry {
        pid: 2524,
        tid: 468,
        timestamp_secs: 1283529656,
        process_name: "hello_instrumented".into(),
        verbosity: 1,
        kind: TracePointKind::Log,
        path: "main.cpp".into(),
        line: 8,
        function: "int main()".into(),
        message: "main() entered".into(),
        variables: VariableSnapshot::new(),
        backtrace: Backtrace::new(),
    }
}

fn watch_entry() -> TraceEntry {
    TraceEntry {
        kind: TracePointKind::Watch,
        line: 16,
        message: String::new(),
        variables: VariableSnapshot(vec![VariableValue {
            name: "name".into(),
            value_type: VariableType::String,
            value: "Max".into(),
        }]),
        ..log_entry()
    }
}

fn wire_bytes(entry: &TraceEntry) -> Vec<u8> {
    XmlSerializer::new()
        .serialize(entry)
        .expect("entry must serialize")
}

fn fresh_db() -> (tempfile::TempDir, Db) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let db = Db::new(dir.path().join("trace.db"));
    init_schema(&db).expect("schema init");
    (dir, db)
}

fn count(conn: &Connection, sql: &str) -> i64 {
    conn.query_row(sql, [], |row| row.get(0)).expect("count query")
}

#[test]
fn wire_round_trip_lands_in_every_dimension() {
    let (_dir, db) = fresh_db();
    let mut conn = db.open().expect("open");

    let decoded = decode_entry(&wire_bytes(&watch_entry())).expect("wire bytes decode");
    assert_eq!(decoded, watch_entry());
    feed_entry(&mut conn, &decoded).expect("feed");

    assert_eq!(count(&conn, "SELECT COUNT(*) FROM path_name"), 1);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM function_name"), 1);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM process"), 1);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM traced_thread"), 1);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM trace_point"), 1);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM trace_entry"), 1);

    let (name, value, type_code): (String, String, i64) = conn
        .query_row("SELECT name, value, type_code FROM variable", [], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })
        .expect("variable row");
    assert_eq!(name, "name");
    assert_eq!(value, "Max");
    assert_eq!(type_code, 0);

    let path: String = conn
        .query_row("SELECT name FROM path_name", [], |row| row.get(0))
        .expect("path row");
    assert_eq!(path, "main.cpp");
}

#[test]
fn two_entries_in_one_read_share_dimensions() {
    let (_dir, db) = fresh_db();
    let mut conn = db.open().expect("open");

    let mut joined = wire_bytes(&log_entry());
    joined.extend_from_slice(&wire_bytes(&watch_entry()));

    let mut framer = Framer::new();
    let mut slices = framer.push(&joined);
    slices.extend(framer.finish());
    assert_eq!(slices.len(), 2, "one read, two framed entries");

    for slice in &slices {
        let entry = decode_entry(slice).expect("framed slice decodes");
        feed_entry(&mut conn, &entry).expect("feed");
    }

    assert_eq!(count(&conn, "SELECT COUNT(*) FROM trace_entry"), 2);
    // Same process, thread, path, and function; distinct trace points
    // (different line and type).
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM process"), 1);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM traced_thread"), 1);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM path_name"), 1);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM function_name"), 1);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM trace_point"), 2);
}

#[tokio::test]
async fn tcp_ingest_reassembles_entries_across_reads() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let db_path = dir.path().join("trace.db");
    let state = CollectorState::new(db_path.clone());
    init_schema(state.db()).expect("schema init");

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut notifications = state.subscribe();
    let acceptor = tokio::spawn(run_acceptor(listener, state, shutdown_rx));

    let mut first = wire_bytes(&log_entry());
    let second = wire_bytes(&watch_entry());
    first.extend_from_slice(&second[..20]); // second entry straddles the reads

    let mut client = TcpStream::connect(addr).await.expect("connect");
    client.write_all(&first).await.expect("first write");
    client.flush().await.expect("flush");
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.write_all(&second[20..]).await.expect("second write");
    client.shutdown().await.expect("close write side");
    drop(client);

    let first_notice = tokio::time::timeout(Duration::from_secs(5), notifications.recv())
        .await
        .expect("first entry within deadline")
        .expect("broadcast alive");
    assert_eq!(first_notice.process_name, "hello_instrumented");
    assert_eq!(first_notice.pid, 2524);

    let second_notice = tokio::time::timeout(Duration::from_secs(5), notifications.recv())
        .await
        .expect("second entry within deadline")
        .expect("broadcast alive");
    assert_ne!(first_notice.trace_entry_id, second_notice.trace_entry_id);

    let _ = shutdown_tx.send(true);
    acceptor.await.expect("acceptor exits");

    let conn = Connection::open(&db_path).expect("open db");
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM trace_entry"), 2);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM process"), 1);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM variable"), 1);
}

#[tokio::test]
async fn malformed_slice_skips_without_killing_the_connection() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let db_path = dir.path().join("trace.db");
    let state = CollectorState::new(db_path.clone());
    init_schema(state.db()).expect("schema init");

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut notifications = state.subscribe();
    let acceptor = tokio::spawn(run_acceptor(listener, state, shutdown_rx));

    // Garbage before the first sentinel, then a valid entry.
    let mut stream_bytes = b"not xml at all".to_vec();
    stream_bytes.extend_from_slice(&wire_bytes(&log_entry()));

    let mut client = TcpStream::connect(addr).await.expect("connect");
    client.write_all(&stream_bytes).await.expect("write");
    client.shutdown().await.expect("close write side");
    drop(client);

    let notice = tokio::time::timeout(Duration::from_secs(5), notifications.recv())
        .await
        .expect("valid entry within deadline")
        .expect("broadcast alive");
    assert_eq!(notice.pid, 2524);

    let _ = shutdown_tx.send(true);
    acceptor.await.expect("acceptor exits");

    let conn = Connection::open(&db_path).expect("open db");
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM trace_entry"), 1);
}
