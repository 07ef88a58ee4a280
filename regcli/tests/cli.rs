//! Drives the `hklmreg` binary end to end against a scratch store.

use std::path::Path;
use std::process::Command;

use shared::constants::{REG_DWORD, REG_SZ};
use shared::store::OverlayStore;
use shared::wide::{decode_reg_text, utf16le_bytes_with_nul};

fn hklmreg(db: &Path, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_hklmreg"))
        .arg("--db")
        .arg(db)
        .args(args)
        .output()
        .expect("hklmreg should run")
}

#[test]
fn add_then_delete_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("cli.sqlite");

    let out = hklmreg(
        &db,
        &["add", "HKLM\\Software\\CliTest", "/v", "Name", "/d", "value-1"],
    );
    assert_eq!(out.status.code(), Some(0), "{out:?}");

    let out = hklmreg(
        &db,
        &[
            "add",
            "HKEY_LOCAL_MACHINE\\Software\\CliTest",
            "/v",
            "Answer",
            "/t",
            "REG_DWORD",
            "/d",
            "42",
        ],
    );
    assert_eq!(out.status.code(), Some(0), "{out:?}");

    let store = OverlayStore::open(&db).unwrap();
    let v = store
        .get_value("HKLM\\Software\\CliTest", "Name")
        .unwrap()
        .unwrap();
    assert_eq!(v.value_type, REG_SZ);
    assert_eq!(v.data, utf16le_bytes_with_nul("value-1"));
    let v = store
        .get_value("HKLM\\Software\\CliTest", "Answer")
        .unwrap()
        .unwrap();
    assert_eq!(v.value_type, REG_DWORD);
    assert_eq!(v.data, 42u32.to_le_bytes());
    drop(store);

    let out = hklmreg(&db, &["delete", "HKLM\\Software\\CliTest", "/v", "Name"]);
    assert_eq!(out.status.code(), Some(0));
    let out = hklmreg(&db, &["delete", "HKLM\\Software\\CliTest"]);
    assert_eq!(out.status.code(), Some(0));

    let store = OverlayStore::open(&db).unwrap();
    assert!(store.is_key_deleted("HKLM\\Software\\CliTest").unwrap());
}

#[test]
fn export_import_cycle_preserves_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("source.sqlite");
    let reg_path = dir.path().join("dump.reg");

    hklmreg(
        &db,
        &["add", "HKLM\\Software\\Cycle", "/ve", "/d", "default text"],
    );
    hklmreg(
        &db,
        &[
            "add",
            "HKLM\\Software\\Cycle",
            "/v",
            "Blob",
            "/t",
            "REG_BINARY",
            "/d",
            "de,ad,be,ef",
        ],
    );

    let out = hklmreg(&db, &["export", reg_path.to_str().unwrap()]);
    assert_eq!(out.status.code(), Some(0), "{out:?}");

    // Exported files are UTF-16LE with a byte-order mark.
    let bytes = std::fs::read(&reg_path).unwrap();
    assert_eq!(&bytes[..2], &[0xFF, 0xFE]);
    let text = decode_reg_text(&bytes);
    assert!(text.starts_with("Windows Registry Editor Version 5.00"));
    assert!(text.contains("[HKEY_LOCAL_MACHINE\\Software\\Cycle]"));
    assert!(text.contains("@=\"default text\""));
    assert!(text.contains("\"Blob\"=hex:de,ad,be,ef"));

    let db2 = dir.path().join("copy.sqlite");
    let out = hklmreg(&db2, &["import", reg_path.to_str().unwrap()]);
    assert_eq!(out.status.code(), Some(0), "{out:?}");

    let copy = OverlayStore::open(&db2).unwrap();
    let v = copy.get_value("HKLM\\Software\\Cycle", "").unwrap().unwrap();
    assert_eq!(v.data, utf16le_bytes_with_nul("default text"));
    let v = copy.get_value("HKLM\\Software\\Cycle", "Blob").unwrap().unwrap();
    assert_eq!(v.data, vec![0xde, 0xad, 0xbe, 0xef]);
}

#[test]
fn dump_writes_the_export_to_stdout() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("dump.sqlite");
    hklmreg(&db, &["add", "HKLM\\Software\\DumpMe", "/v", "K", "/d", "v"]);

    let out = hklmreg(&db, &["dump"]);
    assert_eq!(out.status.code(), Some(0));
    let text = decode_reg_text(&out.stdout);
    assert!(text.contains("[HKEY_LOCAL_MACHINE\\Software\\DumpMe]"));
    assert!(text.contains("\"K\"=\"v\""));
}

#[test]
fn usage_errors_exit_with_two() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("usage.sqlite");

    let out = Command::new(env!("CARGO_BIN_EXE_hklmreg"))
        .output()
        .expect("hklmreg should run");
    assert_eq!(out.status.code(), Some(2));

    let out = hklmreg(&db, &["frobnicate"]);
    assert_eq!(out.status.code(), Some(2));

    let out = hklmreg(&db, &["add", "HKLM\\Software\\X", "/bogus"]);
    assert_eq!(out.status.code(), Some(2));

    let out = hklmreg(&db, &["import", "no-such-file.reg"]);
    assert_eq!(out.status.code(), Some(1));
}
