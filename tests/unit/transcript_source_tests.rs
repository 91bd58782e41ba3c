use std::fs;
use std::path::PathBuf;

use agent_warden::config::TranscriptDir;
use agent_warden::orchestrator::session_linker::{
    format_marker, FsTranscriptSource, TranscriptSource,
};

fn dir(path: PathBuf) -> TranscriptDir {
    TranscriptDir {
        provider: "claude".into(),
        dir: path,
        pattern: "**/*.jsonl".into(),
    }
}

#[test]
fn marker_format() {
    assert_eq!(format_marker("1a2b3c4d"), "[warden:1a2b3c4d]");
}

#[test]
fn lists_matching_files_recursively() {
    let temp = tempfile::tempdir().expect("tempdir");
    let nested = temp.path().join("project-a");
    fs::create_dir_all(&nested).expect("mkdir");
    fs::write(nested.join("abc.jsonl"), "{}\n").expect("write");
    fs::write(temp.path().join("top.jsonl"), "{}\n").expect("write");
    fs::write(temp.path().join("notes.txt"), "ignored").expect("write");

    let source = FsTranscriptSource::new(50).expect("source");
    let mut files = source
        .list_transcript_files(&dir(temp.path().to_owned()))
        .expect("list");
    files.sort_by(|a, b| a.path.cmp(&b.path));

    assert_eq!(files.len(), 2);
    assert!(files.iter().all(|f| f.provider == "claude"));
}

#[test]
fn missing_directory_lists_nothing() {
    let temp = tempfile::tempdir().expect("tempdir");
    let source = FsTranscriptSource::new(50).expect("source");
    let files = source
        .list_transcript_files(&dir(temp.path().join("absent")))
        .expect("list");
    assert!(files.is_empty());
}

#[test]
fn reads_marker_from_early_lines_only() {
    let temp = tempfile::tempdir().expect("tempdir");
    let early = temp.path().join("early.jsonl");
    fs::write(
        &early,
        "{\"type\":\"system\"}\n{\"type\":\"user\",\"text\":\"[warden:0a1b2c3d]\\nPlan it\"}\n",
    )
    .expect("write");

    let late = temp.path().join("late.jsonl");
    let mut body = "{\"type\":\"noise\"}\n".repeat(5);
    body.push_str("[warden:99999999]\n");
    fs::write(&late, body).expect("write");

    let source = FsTranscriptSource::new(3).expect("source");
    assert_eq!(
        source.read_marker(&early).expect("read"),
        Some("0a1b2c3d".to_owned())
    );
    assert_eq!(source.read_marker(&late).expect("read"), None);
}

#[test]
fn native_id_is_file_stem() {
    let source = FsTranscriptSource::new(50).expect("source");
    let id = source
        .native_id(std::path::Path::new("/tmp/projects/7f3e9a.jsonl"))
        .expect("id");
    assert_eq!(id, "7f3e9a");
}

#[test]
fn unreadable_file_is_an_io_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let source = FsTranscriptSource::new(50).expect("source");
    let err = source
        .read_marker(&temp.path().join("absent.jsonl"))
        .expect_err("missing file");
    assert!(matches!(err, agent_warden::AppError::Io(_)));
}
