//! Unit tests for `JsonlEventWriter`.
//!
//! Validates:
//! - The log directory is created on construction
//! - Each event becomes one JSON line in today's file
//! - Writes from many threads produce valid JSONL

use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};

use subagent_runtime::audit::{EventLogger, JsonlEventWriter};
use subagent_runtime::models::unit::{UnitEvent, UnitEventKind, UnitStatus};

fn event(unit_id: &str, seq: u64) -> UnitEvent {
    UnitEvent {
        seq,
        unit_id: unit_id.into(),
        at: Utc::now(),
        kind: UnitEventKind::Log {
            line: format!("line {seq}"),
        },
    }
}

fn read_lines(dir: &Path) -> Vec<serde_json::Value> {
    let mut lines = Vec::new();
    for entry in fs::read_dir(dir).expect("read_dir") {
        let path = entry.expect("entry").path();
        let text = fs::read_to_string(&path).expect("read file");
        for line in text.lines() {
            lines.push(serde_json::from_str(line).expect("valid json line"));
        }
    }
    lines
}

#[test]
fn new_creates_missing_directory() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().join("a").join("b");
    assert!(!dir.exists());

    JsonlEventWriter::new(dir.clone()).expect("writer");
    assert!(dir.is_dir());
}

#[test]
fn path_for_date_names_daily_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let writer = JsonlEventWriter::new(temp.path().to_owned()).expect("writer");
    let date = NaiveDate::from_ymd_opt(2026, 3, 9).expect("date");
    assert_eq!(
        writer.path_for_date(date),
        temp.path().join("events-2026-03-09.jsonl")
    );
}

#[test]
fn events_append_as_json_lines() {
    let temp = tempfile::tempdir().expect("tempdir");
    let writer = JsonlEventWriter::new(temp.path().to_owned()).expect("writer");

    writer.log_event(&event("u1", 0)).expect("write 0");
    writer
        .log_event(&UnitEvent {
            seq: 1,
            unit_id: "u1".into(),
            at: Utc::now(),
            kind: UnitEventKind::Finished {
                status: UnitStatus::Completed,
                success: true,
                error: None,
            },
        })
        .expect("write 1");

    let today = writer.path_for_date(Utc::now().date_naive());
    assert!(today.exists(), "today's file is written");

    let lines = read_lines(temp.path());
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["type"], "log");
    assert_eq!(lines[0]["line"], "line 0");
    assert_eq!(lines[1]["type"], "finished");
    assert_eq!(lines[1]["status"], "completed");
}

#[test]
fn concurrent_writes_stay_line_delimited() {
    let temp = tempfile::tempdir().expect("tempdir");
    let writer = Arc::new(JsonlEventWriter::new(temp.path().to_owned()).expect("writer"));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let writer = Arc::clone(&writer);
            std::thread::spawn(move || {
                for seq in 0..25 {
                    writer
                        .log_event(&event(&format!("unit-{t}"), seq))
                        .expect("write");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("thread");
    }

    assert_eq!(read_lines(temp.path()).len(), 100);
}
