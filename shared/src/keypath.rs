//! Canonical key-path handling.
//!
//! A canonical path is `HKLM` followed by backslash-separated segments, kept
//! in original case. All comparisons fold to lowercase; separators are
//! normalized at every entry point so `HKEY_LOCAL_MACHINE/Software\` and
//! `HKLM\Software` name the same key.

use crate::constants::HKLM_ROOT;

/// Lowercase fold used for every name comparison (key segments and value
/// names alike).
pub fn case_fold(s: &str) -> String {
    s.chars().flat_map(char::to_lowercase).collect()
}

/// Normalizes a subkey string received from an API call: forward slashes
/// become backslashes, leading and trailing separators are stripped.
pub fn canonicalize_subkey(s: &str) -> String {
    let trimmed = s.trim_matches(|c| c == '\\' || c == '/');
    trimmed.replace('/', "\\")
}

/// Joins a base path and an already-canonicalized subkey.
pub fn join_key_path(base: &str, sub: &str) -> String {
    if sub.is_empty() {
        return base.to_string();
    }
    if base.is_empty() {
        return sub.to_string();
    }
    if base.ends_with('\\') {
        format!("{base}{sub}")
    } else {
        format!("{base}\\{sub}")
    }
}

/// Rewrites the long root spelling to the canonical `HKLM` and normalizes
/// separators. Used by the codec and the CLI, which accept either spelling.
pub fn canon_key(input: &str) -> String {
    let s = input.replace('/', "\\");
    if let Some(rest) = strip_prefix_fold(&s, "HKEY_LOCAL_MACHINE\\") {
        return format!("{HKLM_ROOT}\\{rest}");
    }
    if s.eq_ignore_ascii_case("HKEY_LOCAL_MACHINE") {
        return HKLM_ROOT.to_string();
    }
    s
}

fn strip_prefix_fold<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

/// The path itself followed by every ancestor, ending at the root segment.
/// `HKLM\A\B` yields `[HKLM\A\B, HKLM\A, HKLM]`.
pub fn key_prefixes(key_path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = key_path;
    loop {
        out.push(cur.to_string());
        match cur.rfind('\\') {
            Some(pos) if pos > 0 => cur = &cur[..pos],
            _ => break,
        }
    }
    out
}

/// Parent path, or `None` for a single-segment path.
pub fn parent_of(key_path: &str) -> Option<&str> {
    match key_path.rfind('\\') {
        Some(pos) if pos > 0 => Some(&key_path[..pos]),
        _ => None,
    }
}

/// First segment of `full` below `parent`, when `full` lies under it.
pub fn immediate_child_of<'a>(parent: &str, full: &'a str) -> Option<&'a str> {
    let rest = full.strip_prefix(parent)?.strip_prefix('\\')?;
    if rest.is_empty() {
        return None;
    }
    Some(match rest.find('\\') {
        Some(pos) => &rest[..pos],
        None => rest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_strips_separators_and_normalizes_slashes() {
        assert_eq!(canonicalize_subkey("\\Software/Vendor\\"), "Software\\Vendor");
        assert_eq!(canonicalize_subkey("A/B/C"), "A\\B\\C");
        assert_eq!(canonicalize_subkey(""), "");
        assert_eq!(canonicalize_subkey("\\\\"), "");
    }

    #[test]
    fn join_handles_empty_and_trailing_separator_cases() {
        assert_eq!(join_key_path("", "child"), "child");
        assert_eq!(join_key_path("parent", ""), "parent");
        assert_eq!(join_key_path("parent", "child"), "parent\\child");
        assert_eq!(join_key_path("parent\\", "child"), "parent\\child");
    }

    #[test]
    fn canon_key_rewrites_long_root_spelling() {
        assert_eq!(canon_key("HKEY_LOCAL_MACHINE\\Software\\App"), "HKLM\\Software\\App");
        assert_eq!(canon_key("hkey_local_machine/Software"), "HKLM\\Software");
        assert_eq!(canon_key("HKEY_LOCAL_MACHINE"), "HKLM");
        assert_eq!(canon_key("HKLM\\Software"), "HKLM\\Software");
    }

    #[test]
    fn prefixes_walk_up_to_the_root() {
        assert_eq!(
            key_prefixes("HKLM\\A\\B"),
            vec!["HKLM\\A\\B".to_string(), "HKLM\\A".to_string(), "HKLM".to_string()]
        );
        assert_eq!(key_prefixes("HKLM"), vec!["HKLM".to_string()]);
    }

    #[test]
    fn immediate_child_extraction() {
        assert_eq!(immediate_child_of("HKLM\\A", "HKLM\\A\\B\\C"), Some("B"));
        assert_eq!(immediate_child_of("HKLM\\A", "HKLM\\A\\B"), Some("B"));
        assert_eq!(immediate_child_of("HKLM\\A", "HKLM\\AB\\C"), None);
        assert_eq!(immediate_child_of("HKLM\\A", "HKLM\\A"), None);
    }

    #[test]
    fn case_fold_lowercases_beyond_ascii() {
        assert_eq!(case_fold("SoftWare"), "software");
        assert_eq!(case_fold("ÄPP"), "äpp");
    }
}
