//! Windows Registry Editor 5.00 text codec.
//!
//! Parses registry-export text into the overlay store and renders the store
//! back out. The parser is deliberately permissive: third-party exports are
//! full of oddities, so malformed lines are skipped rather than rejected.
//! Encoding of the surrounding file (UTF-16LE BOM vs UTF-8, CRLF) is handled
//! by the callers via [`crate::wide`].

use crate::constants::{HKLM_ROOT, REG_BINARY, REG_DWORD, REG_QWORD, REG_SZ};
use crate::errors::RegFileError;
use crate::keypath::{canon_key, case_fold};
use crate::store::{ExportRow, OverlayStore};
use crate::wide::{string_from_utf16le, utf16le_bytes_with_nul};

pub const REG_HEADER: &str = "Windows Registry Editor Version 5.00";

/// Maps a CLI type name onto its registry id. Unknown names fall back to
/// `REG_SZ`, mirroring `reg.exe`'s default.
pub fn parse_type(name: &str) -> u32 {
    match name {
        "REG_DWORD" => REG_DWORD,
        "REG_QWORD" => REG_QWORD,
        "REG_BINARY" => REG_BINARY,
        _ => REG_SZ,
    }
}

/// Parses CLI-style value data for the given type. Numeric types accept
/// decimal or `0x`-prefixed hex; binary accepts hex pairs with arbitrary
/// separators; everything else is stored as a NUL-terminated UTF-16LE string.
pub fn parse_data(value_type: u32, text: &str) -> Option<Vec<u8>> {
    match value_type {
        REG_DWORD => {
            let v = parse_number(text)? as u32;
            Some(v.to_le_bytes().to_vec())
        }
        REG_QWORD => {
            let v = parse_number(text)?;
            Some(v.to_le_bytes().to_vec())
        }
        REG_BINARY => Some(hex_pairs(text)),
        _ => Some(utf16le_bytes_with_nul(text)),
    }
}

fn parse_number(text: &str) -> Option<u64> {
    let t = text.trim();
    if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        t.parse::<u64>().ok()
    }
}

/// Collects hex digit pairs, skipping commas, spaces and any other
/// separator characters.
fn hex_pairs(text: &str) -> Vec<u8> {
    let mut out = Vec::new();
    let mut hi: Option<u8> = None;
    for ch in text.chars() {
        let Some(digit) = ch.to_digit(16) else {
            continue;
        };
        match hi.take() {
            None => hi = Some(digit as u8),
            Some(h) => out.push((h << 4) | digit as u8),
        }
    }
    out
}

fn escape_reg_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 8);
    for ch in s.chars() {
        if ch == '\\' || ch == '"' {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn unescape_reg_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut escaped = false;
    for ch in s.chars() {
        if escaped {
            out.push(ch);
            escaped = false;
            continue;
        }
        if ch == '\\' {
            escaped = true;
            continue;
        }
        out.push(ch);
    }
    if escaped {
        out.push('\\');
    }
    out
}

fn key_to_reg_header(key_path: &str) -> String {
    if key_path == HKLM_ROOT {
        return "[HKEY_LOCAL_MACHINE]".to_string();
    }
    if let Some(rest) = key_path.strip_prefix("HKLM\\") {
        return format!("[HKEY_LOCAL_MACHINE\\{rest}]");
    }
    format!("[{key_path}]")
}

fn value_name_to_reg(name: &str) -> String {
    if name.is_empty() {
        "@".to_string()
    } else {
        format!("\"{}\"", escape_reg_string(name))
    }
}

fn bytes_to_hex_csv(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn format_reg_line(value_name: &str, value_type: u32, data: &[u8]) -> String {
    let left = value_name_to_reg(value_name);
    if value_type == REG_DWORD && data.len() >= 4 {
        let v = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        return format!("{left}=dword:{v:08x}");
    }
    if value_type == REG_QWORD && data.len() >= 8 {
        // .reg represents QWORD as hex(b): with little-endian bytes.
        return format!("{left}=hex(b):{}", bytes_to_hex_csv(&data[..8]));
    }
    if value_type == REG_SZ {
        let s = if data.is_empty() {
            String::new()
        } else {
            string_from_utf16le(data)
        };
        return format!("{left}=\"{}\"", escape_reg_string(&s));
    }
    if value_type == REG_BINARY {
        return format!("{left}=hex:{}", bytes_to_hex_csv(data));
    }
    // Any other type uses the generic typed-hex syntax so it round-trips.
    format!("{left}=hex({value_type:x}):{}", bytes_to_hex_csv(data))
}

/// Renders the export stream as registry text. `prefix` (canonical form)
/// restricts the output to one subtree; empty means everything.
pub fn build_export_content(rows: &[ExportRow], prefix: &str) -> String {
    let mut content = format!("{REG_HEADER}\r\n\r\n");
    let folded_prefix = case_fold(prefix);
    let mut current_key: Option<&str> = None;
    for row in rows {
        if !prefix.is_empty() && !case_fold(&row.key_path).starts_with(&folded_prefix) {
            continue;
        }
        if current_key != Some(row.key_path.as_str()) {
            current_key = Some(row.key_path.as_str());
            content.push_str(&key_to_reg_header(&row.key_path));
            content.push_str("\r\n");
        }
        if !row.is_key_only {
            content.push_str(&format_reg_line(&row.value_name, row.value_type, &row.data));
            content.push_str("\r\n");
        }
    }
    content.push_str("\r\n");
    content
}

/// Applies registry text to the store. Key headers switch the current key
/// (`[-KEY]` deletes the subtree); value lines are matched against the known
/// forms in precedence order and anything unrecognized is skipped.
pub fn import_reg_text(store: &OverlayStore, text: &str) -> Result<(), RegFileError> {
    let mut current_key = String::new();
    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with(';') {
            continue;
        }

        if line.starts_with('[') && line.ends_with(']') {
            let mut inside = &line[1..line.len() - 1];
            let delete = inside.starts_with('-');
            if delete {
                inside = &inside[1..];
            }
            current_key = canon_key(inside);
            if delete {
                store.delete_key_tree(&current_key)?;
            } else {
                store.put_key(&current_key)?;
            }
            continue;
        }

        let Some(eq) = line.find('=') else {
            continue;
        };
        if current_key.is_empty() {
            continue;
        }

        let left = line[..eq].trim();
        let right = line[eq + 1..].trim();
        let value_name = if left == "@" {
            String::new()
        } else if left.len() >= 2 && left.starts_with('"') && left.ends_with('"') {
            unescape_reg_string(&left[1..left.len() - 1])
        } else {
            continue;
        };

        if right == "-" {
            store.delete_value(&current_key, &value_name)?;
            continue;
        }
        if right.len() >= 2 && right.starts_with('"') && right.ends_with('"') {
            let s = unescape_reg_string(&right[1..right.len() - 1]);
            store.put_value(&current_key, &value_name, REG_SZ, &utf16le_bytes_with_nul(&s))?;
            continue;
        }
        if let Some(hex) = right.strip_prefix("dword:") {
            let Ok(v) = u32::from_str_radix(hex.trim(), 16) else {
                continue;
            };
            store.put_value(&current_key, &value_name, REG_DWORD, &v.to_le_bytes())?;
            continue;
        }
        if let Some(hex) = right.strip_prefix("hex(b):") {
            store.put_value(&current_key, &value_name, REG_QWORD, &hex_pairs(hex))?;
            continue;
        }
        if let Some(hex) = right.strip_prefix("hex:") {
            store.put_value(&current_key, &value_name, REG_BINARY, &hex_pairs(hex))?;
            continue;
        }
        // Generic typed hex: hex(<type-id-in-hex>):<byte-csv>. Unknown type
        // ids are preserved verbatim.
        if let Some(rest) = right.strip_prefix("hex(") {
            let Some(close) = rest.find(')') else {
                continue;
            };
            let type_text = rest[..close].trim();
            let after = &rest[close + 1..];
            let Some(hex) = after.strip_prefix(':') else {
                continue;
            };
            if type_text.is_empty() {
                continue;
            }
            let Ok(type_id) = u32::from_str_radix(type_text, 16) else {
                continue;
            };
            store.put_value(&current_key, &value_name, type_id, &hex_pairs(hex))?;
            continue;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::REG_EXPAND_SZ;

    fn open_temp_store() -> (tempfile::TempDir, OverlayStore) {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = OverlayStore::open(dir.path().join("regfile.sqlite")).expect("open store");
        (dir, store)
    }

    fn contains_line(text: &str, needle: &str) -> bool {
        text.contains(&format!("{needle}\r\n"))
    }

    fn count_line(text: &str, needle: &str) -> usize {
        let with_crlf = format!("{needle}\r\n");
        text.matches(&with_crlf).count()
    }

    #[test]
    fn import_export_preserves_values_and_empty_keys() {
        let (_dir, store) = open_temp_store();
        let reg_text = "Windows Registry Editor Version 5.00\r\n\r\n\
            [HKEY_LOCAL_MACHINE\\SOFTWARE\\ExampleVendor\\ExampleApp]\r\n\
            @=\"Example Default\"\r\n\
            \"InstallDir\"=\"C:\\\\Program Files\\\\Example App\"\r\n\
            \"Answer\"=dword:0000002a\r\n\
            \"Big\"=hex(b):88,77,66,55,44,33,22,11\r\n\
            \"Blob\"=hex:de,ad,be,ef\r\n\r\n\
            [HKEY_LOCAL_MACHINE\\SOFTWARE\\ExampleVendor\\ExampleApp\\Settings]\r\n\
            \"Theme\"=\"Dark\"\r\n\r\n\
            [HKEY_LOCAL_MACHINE\\SOFTWARE\\ExampleVendor\\ExampleApp\\EmptyA]\r\n\r\n\
            [HKEY_LOCAL_MACHINE\\SOFTWARE\\ExampleVendor\\ExampleApp\\EmptyB\\Child]\r\n\r\n";

        import_reg_text(&store, reg_text).unwrap();

        let out = build_export_content(&store.export_all().unwrap(), "");
        assert!(contains_line(&out, REG_HEADER));
        assert!(contains_line(
            &out,
            "[HKEY_LOCAL_MACHINE\\SOFTWARE\\ExampleVendor\\ExampleApp]"
        ));
        assert!(contains_line(&out, "@=\"Example Default\""));
        assert!(contains_line(
            &out,
            "\"InstallDir\"=\"C:\\\\Program Files\\\\Example App\""
        ));
        assert!(contains_line(&out, "\"Answer\"=dword:0000002a"));
        assert!(contains_line(&out, "\"Big\"=hex(b):88,77,66,55,44,33,22,11"));
        assert!(contains_line(&out, "\"Blob\"=hex:de,ad,be,ef"));
        assert!(contains_line(
            &out,
            "[HKEY_LOCAL_MACHINE\\SOFTWARE\\ExampleVendor\\ExampleApp\\Settings]"
        ));
        assert!(contains_line(&out, "\"Theme\"=\"Dark\""));
        assert!(contains_line(
            &out,
            "[HKEY_LOCAL_MACHINE\\SOFTWARE\\ExampleVendor\\ExampleApp\\EmptyA]"
        ));
        assert!(contains_line(
            &out,
            "[HKEY_LOCAL_MACHINE\\SOFTWARE\\ExampleVendor\\ExampleApp\\EmptyB\\Child]"
        ));
    }

    #[test]
    fn empty_key_headers_appear_exactly_once() {
        let (_dir, store) = open_temp_store();
        let reg_text = "[HKEY_LOCAL_MACHINE\\SOFTWARE\\V\\App]\n\
            @=\"Example Default\"\n\
            \"Answer\"=dword:0000002a\n\
            [HKEY_LOCAL_MACHINE\\SOFTWARE\\V\\App\\EmptyA]\n\
            [HKEY_LOCAL_MACHINE\\SOFTWARE\\V\\App\\EmptyB\\Child]\n";
        import_reg_text(&store, reg_text).unwrap();

        let out = build_export_content(&store.export_all().unwrap(), "");
        assert_eq!(count_line(&out, "[HKEY_LOCAL_MACHINE\\SOFTWARE\\V\\App]"), 1);
        assert_eq!(count_line(&out, "@=\"Example Default\""), 1);
        assert_eq!(count_line(&out, "\"Answer\"=dword:0000002a"), 1);
        assert_eq!(
            count_line(&out, "[HKEY_LOCAL_MACHINE\\SOFTWARE\\V\\App\\EmptyA]"),
            1
        );
        assert_eq!(
            count_line(&out, "[HKEY_LOCAL_MACHINE\\SOFTWARE\\V\\App\\EmptyB\\Child]"),
            1
        );
        // EmptyB itself was never created explicitly, so it must not emit.
        assert_eq!(
            count_line(&out, "[HKEY_LOCAL_MACHINE\\SOFTWARE\\V\\App\\EmptyB]"),
            0
        );
    }

    #[test]
    fn typed_hex_values_keep_their_type_id() {
        let (_dir, store) = open_temp_store();
        let reg_text = "[HKEY_LOCAL_MACHINE\\SOFTWARE\\ExampleVendor\\ExampleApp]\n\
            \"0\"=hex(0):\n\
            \"X\"=hex(2):01,02,0a,ff\n";
        import_reg_text(&store, reg_text).unwrap();

        let v = store
            .get_value("HKLM\\SOFTWARE\\ExampleVendor\\ExampleApp", "0")
            .unwrap()
            .unwrap();
        assert!(!v.is_deleted);
        assert_eq!(v.value_type, 0);
        assert!(v.data.is_empty());

        let v = store
            .get_value("HKLM\\SOFTWARE\\ExampleVendor\\ExampleApp", "X")
            .unwrap()
            .unwrap();
        assert_eq!(v.value_type, REG_EXPAND_SZ);
        assert_eq!(v.data, vec![0x01, 0x02, 0x0a, 0xff]);

        // Unknown type ids survive untouched, including multi-digit ones.
        let reg_text = "[HKEY_LOCAL_MACHINE\\SOFTWARE\\ExampleVendor\\ExampleApp]\n\
            \"Odd\"=hex(10):aa,bb\n";
        import_reg_text(&store, reg_text).unwrap();
        let v = store
            .get_value("HKLM\\SOFTWARE\\ExampleVendor\\ExampleApp", "Odd")
            .unwrap()
            .unwrap();
        assert_eq!(v.value_type, 0x10);
        assert_eq!(v.data, vec![0xaa, 0xbb]);
    }

    #[test]
    fn delete_forms_tombstone_keys_and_values() {
        let (_dir, store) = open_temp_store();
        import_reg_text(
            &store,
            "[HKEY_LOCAL_MACHINE\\SOFTWARE\\A]\n\"v\"=dword:00000001\n\
             [HKEY_LOCAL_MACHINE\\SOFTWARE\\B]\n\"w\"=dword:00000002\n",
        )
        .unwrap();

        import_reg_text(
            &store,
            "[-HKEY_LOCAL_MACHINE\\SOFTWARE\\A]\n\
             [HKEY_LOCAL_MACHINE\\SOFTWARE\\B]\n\"w\"=-\n",
        )
        .unwrap();

        assert!(store.is_key_deleted("HKLM\\SOFTWARE\\A").unwrap());
        let w = store.get_value("HKLM\\SOFTWARE\\B", "w").unwrap().unwrap();
        assert!(w.is_deleted);
    }

    #[test]
    fn parse_is_idempotent() {
        let (dir, store) = open_temp_store();
        let reg_text = "[HKEY_LOCAL_MACHINE\\SOFTWARE\\Twice]\n\
            @=\"dflt\"\n\"N\"=dword:000000ff\n\"B\"=hex:01,02\n";
        import_reg_text(&store, reg_text).unwrap();
        let first = build_export_content(&store.export_all().unwrap(), "");
        import_reg_text(&store, reg_text).unwrap();
        let second = build_export_content(&store.export_all().unwrap(), "");
        assert_eq!(first, second);
        drop(store);
        drop(dir);
    }

    #[test]
    fn export_import_cycle_reproduces_store_state() {
        let (_dir, source) = open_temp_store();
        source.put_key("HKLM\\SOFTWARE\\RT\\Empty").unwrap();
        source
            .put_value(
                "HKLM\\SOFTWARE\\RT",
                "Str",
                REG_SZ,
                &utf16le_bytes_with_nul("va\"lue\\x"),
            )
            .unwrap();
        source
            .put_value("HKLM\\SOFTWARE\\RT", "Num", REG_DWORD, &42u32.to_le_bytes())
            .unwrap();
        source
            .put_value("HKLM\\SOFTWARE\\RT", "Wide", REG_QWORD, &7u64.to_le_bytes())
            .unwrap();
        source
            .put_value("HKLM\\SOFTWARE\\RT", "Bin", REG_BINARY, &[0xde, 0xad])
            .unwrap();

        let text = build_export_content(&source.export_all().unwrap(), "");

        let (_dir2, copy) = open_temp_store();
        import_reg_text(&copy, &text).unwrap();

        for name in ["Str", "Num", "Wide", "Bin"] {
            let a = source.get_value("HKLM\\SOFTWARE\\RT", name).unwrap().unwrap();
            let b = copy.get_value("HKLM\\SOFTWARE\\RT", name).unwrap().unwrap();
            assert_eq!(a, b, "value {name} should round-trip");
        }
        assert!(copy.key_exists_locally("HKLM\\SOFTWARE\\RT\\Empty").unwrap());
    }

    #[test]
    fn malformed_lines_are_skipped_silently() {
        let (_dir, store) = open_temp_store();
        let reg_text = "; comment line\n\
            garbage without equals\n\
            \"orphan\"=\"before any key\"\n\
            [HKEY_LOCAL_MACHINE\\SOFTWARE\\OK]\n\
            not-a-quoted-name=\"x\"\n\
            \"fine\"=dword:00000001\n\
            \"bad-dword\"=dword:zz\n";
        import_reg_text(&store, reg_text).unwrap();

        let rows = store.list_values("HKLM\\SOFTWARE\\OK").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "fine");
    }

    #[test]
    fn export_prefix_filter_limits_the_subtree() {
        let (_dir, store) = open_temp_store();
        store
            .put_value("HKLM\\SOFTWARE\\Keep\\K", "a", REG_DWORD, &[1, 0, 0, 0])
            .unwrap();
        store
            .put_value("HKLM\\SOFTWARE\\Drop\\D", "b", REG_DWORD, &[2, 0, 0, 0])
            .unwrap();

        let out = build_export_content(&store.export_all().unwrap(), "HKLM\\SOFTWARE\\Keep");
        assert!(contains_line(&out, "[HKEY_LOCAL_MACHINE\\SOFTWARE\\Keep\\K]"));
        assert!(!out.contains("Drop"));
    }
}
