use std::fs;
use std::sync::Arc;

use agent_warden::audit::{AuditEntry, AuditEventType, AuditLogger, JsonlAuditWriter};
use chrono::Utc;

fn read_lines(path: &std::path::Path) -> Vec<serde_json::Value> {
    fs::read_to_string(path)
        .expect("read log")
        .lines()
        .map(|line| serde_json::from_str(line).expect("valid json line"))
        .collect()
}

#[test]
fn new_creates_directory_if_missing() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log_dir = temp.path().join("nested").join("logs");

    let writer = JsonlAuditWriter::new(log_dir.clone(), "finalize").expect("writer");
    assert!(log_dir.is_dir());

    writer
        .log_entry(AuditEntry::new(AuditEventType::FinalizeFailed))
        .expect("write");
    assert!(writer.path_for(Utc::now().date_naive()).is_file());
}

#[test]
fn file_name_carries_prefix_and_date() {
    let temp = tempfile::tempdir().expect("tempdir");
    let writer = JsonlAuditWriter::new(temp.path().to_owned(), "finalize").expect("writer");
    let date = chrono::NaiveDate::from_ymd_opt(2026, 3, 9).expect("date");

    assert_eq!(
        writer.path_for(date),
        temp.path().join("finalize-2026-03-09.jsonl")
    );
}

#[test]
fn entries_are_appended_as_json_lines() {
    let temp = tempfile::tempdir().expect("tempdir");
    let writer = JsonlAuditWriter::new(temp.path().to_owned(), "detector").expect("writer");

    writer
        .log_entry(
            AuditEntry::new(AuditEventType::OrphanFailed)
                .with_spawn("s1".into())
                .with_reason("dead_process".into()),
        )
        .expect("first");
    writer
        .log_entry(
            AuditEntry::new(AuditEventType::FinalizeFailed)
                .with_spawn("s2".into())
                .with_session("abc".into())
                .with_error("transcript missing".into()),
        )
        .expect("second");

    let lines = read_lines(&writer.path_for(Utc::now().date_naive()));
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["event_type"], "orphan_failed");
    assert_eq!(lines[0]["reason"], "dead_process");
    assert_eq!(lines[1]["session_id"], "abc");
    assert_eq!(lines[1]["error"], "transcript missing");
}

#[test]
fn concurrent_writes_produce_valid_jsonl() {
    let temp = tempfile::tempdir().expect("tempdir");
    let writer = Arc::new(JsonlAuditWriter::new(temp.path().to_owned(), "finalize").expect("writer"));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let writer = Arc::clone(&writer);
            std::thread::spawn(move || {
                for j in 0..10 {
                    writer
                        .log_entry(
                            AuditEntry::new(AuditEventType::FinalizeFailed)
                                .with_spawn(format!("s{i}-{j}")),
                        )
                        .expect("write");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("thread");
    }

    let lines = read_lines(&writer.path_for(Utc::now().date_naive()));
    assert_eq!(lines.len(), 80);
}
