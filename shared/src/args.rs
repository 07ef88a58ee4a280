//! Windows command-line quoting.
//!
//! The launcher forwards the target's argument vector through
//! `CreateProcessW`, so arguments must be re-quoted exactly the way the
//! CRT/`CommandLineToArgvW` parse them back.

/// Quotes a single argument following CreateProcess command-line parsing
/// rules: backslashes double only when they precede a quote, and an embedded
/// quote becomes `\"`.
pub fn quote_windows_arg(arg: &str) -> String {
    if arg.is_empty() {
        return "\"\"".to_string();
    }

    let needs_quotes = arg
        .chars()
        .any(|c| matches!(c, ' ' | '\t' | '\n' | '\u{b}' | '"'));
    if !needs_quotes {
        return arg.to_string();
    }

    let mut out = String::with_capacity(arg.len() + 2);
    out.push('"');
    let mut backslashes = 0usize;
    for ch in arg.chars() {
        if ch == '\\' {
            backslashes += 1;
            continue;
        }
        if ch == '"' {
            out.extend(std::iter::repeat_n('\\', backslashes * 2 + 1));
            out.push('"');
            backslashes = 0;
            continue;
        }
        if backslashes > 0 {
            out.extend(std::iter::repeat_n('\\', backslashes));
            backslashes = 0;
        }
        out.push(ch);
    }
    if backslashes > 0 {
        out.extend(std::iter::repeat_n('\\', backslashes * 2));
    }
    out.push('"');
    out
}

/// Builds the full command line for an executable and its arguments.
pub fn build_command_line(exe_path: &str, args: &[String]) -> String {
    let mut cmd = quote_windows_arg(exe_path);
    for arg in args {
        cmd.push(' ');
        cmd.push_str(&quote_windows_arg(arg));
    }
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_quoting() {
        assert_eq!(quote_windows_arg(""), "\"\"");
        assert_eq!(quote_windows_arg("plain"), "plain");
        assert_eq!(quote_windows_arg("has space"), "\"has space\"");
        assert_eq!(quote_windows_arg("a\"b"), "\"a\\\"b\"");
    }

    #[test]
    fn trailing_backslashes_double_only_inside_quotes() {
        assert_eq!(quote_windows_arg("C:\\Path\\"), "C:\\Path\\");
        assert_eq!(
            quote_windows_arg("C:\\Path With Space\\"),
            "\"C:\\Path With Space\\\\\""
        );
    }

    #[test]
    fn command_line_quotes_executable_and_arguments() {
        let cmd = build_command_line(
            "C:\\Program Files\\Tool\\app.exe",
            &["--mode".into(), "fast run".into(), "a\"b".into()],
        );
        assert_eq!(
            cmd,
            "\"C:\\Program Files\\Tool\\app.exe\" --mode \"fast run\" \"a\\\"b\""
        );
    }

    #[test]
    fn embedded_nul_passes_through() {
        let cmd = build_command_line("tool.exe", &["ab\0cd".to_string()]);
        assert!(cmd.contains('\0'));
    }
}
