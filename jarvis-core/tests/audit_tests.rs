// tests/audit_tests.rs
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;

use jarvis_core::services::audit::{
    read_records, verify_chain, AuditEntry, AuditLog, ChainBreak, GENESIS_HASH,
};

fn log_in(dir: &tempfile::TempDir) -> AuditLog {
    AuditLog::open(dir.path().join(".jarvis").join("audit.log")).expect("open audit log")
}

fn counts(kind: &str, n: usize) -> BTreeMap<String, usize> {
    BTreeMap::from([(kind.to_string(), n)])
}

#[test]
fn records_chain_from_genesis() {
    let dir = tempfile::tempdir().unwrap();
    let mut log = log_in(&dir);

    let a = log.append(AuditEntry::new("Scan", "src", true)).unwrap();
    let b = log
        .append(
            AuditEntry::new("Write", "src/a.py", true)
                .with_fixes(counts("DANGEROUS_EVAL", 1))
                .with_run("r1")
                .with_status("fixed"),
        )
        .unwrap();
    let c = log
        .append(
            AuditEntry::new("Write", "src/secrets.env", false)
                .with_denied_by(&["R-credential-exclusion".to_string()])
                .with_error("ConstitutionalDenial"),
        )
        .unwrap();

    assert_eq!(a.prev_hash, GENESIS_HASH);
    assert_eq!(b.prev_hash, a.hash);
    assert_eq!(c.prev_hash, b.hash);
    assert_eq!(a.hash.len(), 64);
    assert!(a.ts <= b.ts && b.ts <= c.ts);

    let on_disk = log.read_all().unwrap();
    assert_eq!(on_disk, vec![a, b, c]);

    let report = log.verify().unwrap();
    assert!(report.valid);
    assert_eq!(report.records, 3);
    assert!(report.broken.is_none());
    assert_eq!(report.torn_lines, 0);
}

#[test]
fn record_fields_serialize_as_one_json_line() {
    let dir = tempfile::tempdir().unwrap();
    let mut log = log_in(&dir);
    log.append(
        AuditEntry::new("Scan", "src", true)
            .with_violations(counts("TODO_COMMENT", 2))
            .with_scan_stats(3, counts("SKIPPED_TOO_LARGE", 1)),
    )
    .unwrap();

    let raw = fs::read_to_string(log.path()).unwrap();
    assert_eq!(raw.lines().count(), 1);
    let v: serde_json::Value = serde_json::from_str(raw.trim_end()).unwrap();
    assert_eq!(v["action"], "Scan");
    assert_eq!(v["allowed"], true);
    assert_eq!(v["violations"]["TODO_COMMENT"], 2);
    assert_eq!(v["files_examined"], 3);
    assert_eq!(v["skipped"]["SKIPPED_TOO_LARGE"], 1);
    assert!(v.get("error").is_none());
    assert!(v["ts"].as_str().unwrap().ends_with('Z'));
}

#[test]
fn reopening_continues_the_chain() {
    let dir = tempfile::tempdir().unwrap();
    let last = {
        let mut log = log_in(&dir);
        log.append(AuditEntry::new("Scan", ".", true)).unwrap();
        log.append(AuditEntry::new("Scan", "src", true)).unwrap()
    };
    let mut log = log_in(&dir);
    let next = log.append(AuditEntry::new("Read", "src/a.py", true)).unwrap();
    assert_eq!(next.prev_hash, last.hash);
    assert!(log.verify().unwrap().valid);
}

#[test]
fn edited_record_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let mut log = log_in(&dir);
    for target in ["a.py", "b.py", "c.py"] {
        log.append(AuditEntry::new("Write", target, false)).unwrap();
    }
    let raw = fs::read_to_string(log.path()).unwrap();
    let mut lines: Vec<String> = raw.lines().map(str::to_string).collect();
    lines[1] = lines[1].replace("\"allowed\":false", "\"allowed\":true");
    fs::write(log.path(), lines.join("\n") + "\n").unwrap();

    let report = verify_chain(log.path()).unwrap();
    assert!(!report.valid);
    assert_eq!(report.broken, Some(ChainBreak::HashMismatch { line: 2 }));
    assert_eq!(report.records, 1);
}

#[test]
fn deleted_record_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let mut log = log_in(&dir);
    for target in ["a.py", "b.py", "c.py"] {
        log.append(AuditEntry::new("Scan", target, true)).unwrap();
    }
    let raw = fs::read_to_string(log.path()).unwrap();
    let kept: Vec<&str> = raw.lines().enumerate().filter(|(i, _)| *i != 1).map(|(_, l)| l).collect();
    fs::write(log.path(), kept.join("\n") + "\n").unwrap();

    let report = verify_chain(log.path()).unwrap();
    assert!(!report.valid);
    assert!(matches!(
        report.broken,
        Some(ChainBreak::PrevHashMismatch { line: 2, .. })
    ));
}

#[test]
fn torn_tail_is_skipped_then_sealed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".jarvis").join("audit.log");
    let first = {
        let mut log = AuditLog::open(&path).unwrap();
        log.append(AuditEntry::new("Scan", ".", true)).unwrap()
    };
    let mut f = OpenOptions::new().append(true).open(&path).unwrap();
    f.write_all(b"{\"ts\":\"2026-01-01T00:00:00Z\",\"act").unwrap();
    drop(f);

    assert_eq!(read_records(&path).unwrap().len(), 1);

    let mut log = AuditLog::open(&path).unwrap();
    let next = log.append(AuditEntry::new("Scan", "src", true)).unwrap();
    assert_eq!(next.prev_hash, first.hash);

    let records = read_records(&path).unwrap();
    assert_eq!(records.len(), 2);
    let report = verify_chain(&path).unwrap();
    assert!(report.valid);
    assert_eq!(report.records, 2);
    assert_eq!(report.torn_lines, 1);
}

#[test]
fn tail_returns_the_newest_records_oldest_first() {
    let dir = tempfile::tempdir().unwrap();
    let mut log = log_in(&dir);
    for i in 0..5 {
        log.append(AuditEntry::new("Scan", format!("f{i}.py"), true)).unwrap();
    }
    let tail: Vec<String> = log.tail(2).unwrap().into_iter().map(|r| r.target).collect();
    assert_eq!(tail, vec!["f3.py", "f4.py"]);
    assert_eq!(log.tail(50).unwrap().len(), 5);
}

#[test]
fn missing_log_reads_empty_and_verifies() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.log");
    assert!(read_records(&path).unwrap().is_empty());
    let report = verify_chain(&path).unwrap();
    assert!(report.valid);
    assert_eq!(report.records, 0);
}

#[test]
fn unwritable_log_is_an_audit_write_failure() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.log");
    fs::create_dir_all(&path).unwrap();
    let err = AuditLog::open(&path).err().expect("directory is not a log");
    assert_eq!(err.kind(), "AuditWriteFailure");
}
