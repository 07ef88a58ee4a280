//! `hklmreg`: offline administration of the overlay store.
//!
//! A REG-like command surface over the store and the `.reg` codec. Runs
//! between launches, never inside the target. Exit codes: 0 success,
//! 1 store/I/O failure, 2 usage error.

use std::fs;
use std::process::exit;

use anyhow::{Context, Result};

use shared::constants::DEFAULT_DB_FILE;
use shared::keypath::canon_key;
use shared::regfile::{build_export_content, import_reg_text, parse_data, parse_type};
use shared::store::OverlayStore;
use shared::wide::{decode_reg_text, encode_utf16le_with_bom};

const EXIT_OK: i32 = 0;
const EXIT_FAILURE: i32 = 1;
const EXIT_USAGE: i32 = 2;

fn print_usage() {
    eprintln!(
        "hklmreg [--db <path>] <add|delete|export|import|dump> [options]\n\
         \n\
         Commands (REG-like subset):\n\
         \x20 add    <KeyName> /v <ValueName> [/t <Type>] /d <Data> [/f]\n\
         \x20 delete <KeyName> [/v <ValueName>] [/f]\n\
         \x20 export <FileName> [<KeyNamePrefix>]\n\
         \x20 dump   [<KeyNamePrefix>]\n\
         \x20 import <FileName>\n\
         \n\
         Default DB: .\\{DEFAULT_DB_FILE} (current directory)\n\
         \n\
         KeyName examples: HKLM\\Software\\MyApp or HKEY_LOCAL_MACHINE\\Software\\MyApp\n\
         Type: REG_SZ | REG_DWORD | REG_QWORD | REG_BINARY (default: REG_SZ)"
    );
}

fn main() {
    exit(run());
}

fn run() -> i32 {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        print_usage();
        return EXIT_USAGE;
    }

    let mut i = 0usize;
    let mut db_path = DEFAULT_DB_FILE.to_string();
    if args[0] == "--db" {
        let Some(path) = args.get(1) else {
            eprintln!("Missing value for --db");
            print_usage();
            return EXIT_USAGE;
        };
        db_path = path.clone();
        i = 2;
    }

    let Some(command) = args.get(i) else {
        print_usage();
        return EXIT_USAGE;
    };
    let command = command.clone();
    let rest = &args[i + 1..];

    let store = match OverlayStore::open(&db_path) {
        Ok(store) => store,
        Err(err) => {
            eprintln!("Failed to open DB: {db_path} ({err})");
            return EXIT_FAILURE;
        }
    };

    match command.as_str() {
        "add" => cmd_add(&store, rest),
        "delete" => cmd_delete(&store, rest),
        "export" => cmd_export(&store, rest),
        "dump" => cmd_dump(&store, rest),
        "import" => cmd_import(&store, rest),
        _ => {
            print_usage();
            EXIT_USAGE
        }
    }
}

fn cmd_add(store: &OverlayStore, args: &[String]) -> i32 {
    let Some(key_arg) = args.first() else {
        print_usage();
        return EXIT_USAGE;
    };
    let key = canon_key(key_arg);

    let mut value_name = String::new();
    let mut type_name = "REG_SZ".to_string();
    let mut data_text: Option<String> = None;

    let mut i = 1usize;
    while i < args.len() {
        match args[i].as_str() {
            "/v" if i + 1 < args.len() => {
                value_name = args[i + 1].clone();
                i += 2;
            }
            "/ve" => {
                value_name.clear();
                i += 1;
            }
            "/t" if i + 1 < args.len() => {
                type_name = args[i + 1].clone();
                i += 2;
            }
            "/d" if i + 1 < args.len() => {
                data_text = Some(args[i + 1].clone());
                i += 2;
            }
            "/f" => i += 1,
            other => {
                eprintln!("Unknown option: {other}");
                return EXIT_USAGE;
            }
        }
    }

    let Some(data_text) = data_text.filter(|d| !d.is_empty()) else {
        print_usage();
        return EXIT_USAGE;
    };
    if key.is_empty() {
        print_usage();
        return EXIT_USAGE;
    }

    let value_type = parse_type(&type_name);
    let Some(data) = parse_data(value_type, &data_text) else {
        eprintln!("Invalid data for type {type_name}: {data_text}");
        return EXIT_USAGE;
    };
    if store.put_value(&key, &value_name, value_type, &data).is_err() {
        eprintln!("Failed to add value");
        return EXIT_FAILURE;
    }
    EXIT_OK
}

fn cmd_delete(store: &OverlayStore, args: &[String]) -> i32 {
    let Some(key_arg) = args.first() else {
        print_usage();
        return EXIT_USAGE;
    };
    let key = canon_key(key_arg);

    let mut value_name: Option<String> = None;
    let mut i = 1usize;
    while i < args.len() {
        match args[i].as_str() {
            "/v" if i + 1 < args.len() => {
                value_name = Some(args[i + 1].clone());
                i += 2;
            }
            "/f" => i += 1,
            other => {
                eprintln!("Unknown option: {other}");
                return EXIT_USAGE;
            }
        }
    }

    let result = match value_name {
        Some(name) => store.delete_value(&key, &name),
        None => store.delete_key_tree(&key),
    };
    if result.is_err() {
        eprintln!("Failed to delete");
        return EXIT_FAILURE;
    }
    EXIT_OK
}

fn cmd_export(store: &OverlayStore, args: &[String]) -> i32 {
    let Some(out_path) = args.first() else {
        print_usage();
        return EXIT_USAGE;
    };
    let prefix = args.get(1).map(|p| canon_key(p)).unwrap_or_default();

    match export_to_file(store, out_path, &prefix) {
        Ok(()) => EXIT_OK,
        Err(err) => {
            eprintln!("Failed to write: {out_path} ({err:#})");
            EXIT_FAILURE
        }
    }
}

fn export_to_file(store: &OverlayStore, out_path: &str, prefix: &str) -> Result<()> {
    let rows = store.export_all().context("reading store")?;
    let content = build_export_content(&rows, prefix);
    fs::write(out_path, encode_utf16le_with_bom(&content)).context("writing file")?;
    Ok(())
}

fn cmd_dump(store: &OverlayStore, args: &[String]) -> i32 {
    let prefix = args.first().map(|p| canon_key(p)).unwrap_or_default();
    let rows = match store.export_all() {
        Ok(rows) => rows,
        Err(err) => {
            eprintln!("Failed to read store: {err}");
            return EXIT_FAILURE;
        }
    };
    let content = build_export_content(&rows, &prefix);
    if write_dump(&content).is_err() {
        eprintln!("Failed to write to stdout");
        return EXIT_FAILURE;
    }
    EXIT_OK
}

/// A real console gets wide characters directly; redirected output is
/// UTF-16LE with a byte-order mark so consumers can detect the encoding.
#[cfg(windows)]
fn write_dump(content: &str) -> Result<()> {
    use std::io::Write;
    use windows_sys::Win32::System::Console::{
        GetConsoleMode, GetStdHandle, STD_OUTPUT_HANDLE, WriteConsoleW,
    };

    unsafe {
        let handle = GetStdHandle(STD_OUTPUT_HANDLE);
        let mut mode = 0u32;
        let is_console = !handle.is_null()
            && handle != windows_sys::Win32::Foundation::INVALID_HANDLE_VALUE
            && GetConsoleMode(handle, &mut mode) != 0;

        if is_console {
            let wide: Vec<u16> = content.encode_utf16().collect();
            let mut written = 0u32;
            let ok = WriteConsoleW(
                handle,
                wide.as_ptr().cast(),
                wide.len() as u32,
                &mut written,
                std::ptr::null(),
            );
            anyhow::ensure!(ok != 0, "WriteConsoleW failed");
            return Ok(());
        }
    }

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&encode_utf16le_with_bom(content))?;
    stdout.flush()?;
    Ok(())
}

#[cfg(not(windows))]
fn write_dump(content: &str) -> Result<()> {
    use std::io::Write;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(content.as_bytes())?;
    stdout.flush()?;
    Ok(())
}

fn cmd_import(store: &OverlayStore, args: &[String]) -> i32 {
    let Some(in_path) = args.first() else {
        print_usage();
        return EXIT_USAGE;
    };
    match import_from_file(store, in_path) {
        Ok(()) => EXIT_OK,
        Err(err) => {
            eprintln!("Import failed: {in_path} ({err:#})");
            EXIT_FAILURE
        }
    }
}

fn import_from_file(store: &OverlayStore, in_path: &str) -> Result<()> {
    let bytes = fs::read(in_path).context("reading file")?;
    anyhow::ensure!(!bytes.is_empty(), "file is empty");
    let text = decode_reg_text(&bytes);
    import_reg_text(store, &text).context("applying registry text")?;
    Ok(())
}
