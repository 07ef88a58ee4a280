//! Launcher command-line parsing.
//!
//! Launcher-owned flags come before the target executable; everything after
//! it belongs to the target and is forwarded verbatim. The surface-scale
//! flags are validated here but belong to the graphics add-ons: they are
//! re-injected into the target's argument vector (and mirrored into the
//! environment by the caller) so add-ons can read either source.

pub struct LaunchConfig {
    pub target_exe: String,
    pub forwarded_args: Vec<String>,
    pub debug_apis: Option<String>,
    pub db_path: Option<String>,
    pub scale: Option<String>,
    pub scale_method: Option<String>,
}

pub enum ParseOutcome {
    Launch(LaunchConfig),
    Help,
    Error(String),
}

pub fn usage() -> String {
    let exe = "regtwin.exe";
    format!(
        "Usage:\n  {exe} [--db <path>] [--debug <api1,api2,...|all>] [--scale <1.1-100>] \
         [--scale-method <point|bilinear|bicubic|cr|catmull-rom|lanczos|lanczos3|pixfast>] \
         <target_exe> [target arguments...]\n\n\
         Examples:\n  {exe} C:\\Apps\\TargetApp.exe\n  {exe} --db .\\HKLM.sqlite C:\\Apps\\TargetApp.exe\n  \
         {exe} --debug RegOpenKey,RegQueryValue C:\\Apps\\TargetApp.exe\n  \
         {exe} C:\\Apps\\TargetApp.exe --mode test --config \"C:\\path with spaces\\cfg.json\""
    )
}

fn is_valid_scale(value: &str) -> bool {
    value
        .parse::<f64>()
        .map(|v| (1.1..=100.0).contains(&v))
        .unwrap_or(false)
}

fn normalize_scale_method(value: &str) -> Option<String> {
    let lower = value.to_lowercase();
    let known = matches!(
        lower.as_str(),
        "point"
            | "bilinear"
            | "bicubic"
            | "cr"
            | "catmull-rom"
            | "catmullrom"
            | "lanczos"
            | "lanczos2"
            | "lanczos3"
            | "pixfast"
            | "pix"
            | "pixel"
    );
    if known { Some(lower) } else { None }
}

pub fn parse_launch_args(raw_args: &[String]) -> ParseOutcome {
    if raw_args.is_empty() {
        return ParseOutcome::Error(usage());
    }
    if matches!(raw_args[0].as_str(), "-h" | "--help" | "/?") {
        return ParseOutcome::Help;
    }

    let mut debug_apis = None;
    let mut db_path = None;
    let mut scale = None;
    let mut scale_method = None;

    let mut i = 0usize;
    while i < raw_args.len() {
        let arg = raw_args[i].as_str();
        if arg == "--debug" {
            let Some(value) = raw_args.get(i + 1) else {
                return ParseOutcome::Error(
                    "Missing value for --debug. Expected comma-separated API list or all.".into(),
                );
            };
            debug_apis = Some(value.clone());
            i += 2;
            continue;
        }
        if arg == "--db" {
            let Some(value) = raw_args.get(i + 1) else {
                return ParseOutcome::Error("Missing value for --db.".into());
            };
            db_path = Some(value.clone());
            i += 2;
            continue;
        }
        if arg == "--scale" || arg.starts_with("--scale=") {
            let value = if arg == "--scale" {
                let Some(value) = raw_args.get(i + 1) else {
                    return ParseOutcome::Error(
                        "Missing value for --scale. Expected a number between 1.1 and 100.".into(),
                    );
                };
                i += 2;
                value.clone()
            } else {
                i += 1;
                arg["--scale=".len()..].to_string()
            };
            if !is_valid_scale(&value) {
                return ParseOutcome::Error(
                    "Invalid --scale value. Expected a number between 1.1 and 100.".into(),
                );
            }
            scale = Some(value);
            continue;
        }
        if arg == "--scale-method" || arg.starts_with("--scale-method=") {
            let value = if arg == "--scale-method" {
                let Some(value) = raw_args.get(i + 1) else {
                    return ParseOutcome::Error(
                        "Missing value for --scale-method. Expected point, bilinear, bicubic, \
                         cr (catmull-rom), lanczos/lanczos3, or pixfast."
                            .into(),
                    );
                };
                i += 2;
                value.clone()
            } else {
                i += 1;
                arg["--scale-method=".len()..].to_string()
            };
            let Some(normalized) = normalize_scale_method(&value) else {
                return ParseOutcome::Error(
                    "Invalid --scale-method. Expected point, bilinear, bicubic, cr (catmull-rom), \
                     lanczos/lanczos3, or pixfast."
                        .into(),
                );
            };
            scale_method = Some(normalized);
            continue;
        }
        break;
    }

    let Some(target_exe) = raw_args.get(i) else {
        return ParseOutcome::Error(usage());
    };
    let mut forwarded_args: Vec<String> = raw_args[i + 1..].to_vec();

    // Re-inject the scaling options at the front of the target command line
    // so the injected add-ons can see them.
    let mut injected = Vec::new();
    if let Some(scale) = &scale {
        injected.push("--scale".to_string());
        injected.push(scale.clone());
    }
    if let Some(method) = &scale_method {
        injected.push("--scale-method".to_string());
        injected.push(method.clone());
    }
    if !injected.is_empty() {
        injected.append(&mut forwarded_args);
        forwarded_args = injected;
    }

    ParseOutcome::Launch(LaunchConfig {
        target_exe: target_exe.clone(),
        forwarded_args,
        debug_apis,
        db_path,
        scale,
        scale_method,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn expect_launch(outcome: ParseOutcome) -> LaunchConfig {
        match outcome {
            ParseOutcome::Launch(cfg) => cfg,
            ParseOutcome::Help => panic!("unexpected help"),
            ParseOutcome::Error(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn bare_target_launches_with_defaults() {
        let cfg = expect_launch(parse_launch_args(&args(&["C:\\Apps\\app.exe", "--x"])));
        assert_eq!(cfg.target_exe, "C:\\Apps\\app.exe");
        assert_eq!(cfg.forwarded_args, vec!["--x"]);
        assert!(cfg.db_path.is_none());
        assert!(cfg.debug_apis.is_none());
    }

    #[test]
    fn launcher_flags_stop_at_the_target() {
        let cfg = expect_launch(parse_launch_args(&args(&[
            "--db",
            "state.sqlite",
            "--debug",
            "RegOpenKey,RegQueryValue",
            "app.exe",
            "--db",
            "target-owned",
        ])));
        assert_eq!(cfg.db_path.as_deref(), Some("state.sqlite"));
        assert_eq!(cfg.debug_apis.as_deref(), Some("RegOpenKey,RegQueryValue"));
        assert_eq!(cfg.forwarded_args, vec!["--db", "target-owned"]);
    }

    #[test]
    fn scale_flags_validate_and_forward() {
        let cfg = expect_launch(parse_launch_args(&args(&[
            "--scale",
            "2.0",
            "--scale-method=Lanczos3",
            "app.exe",
            "--own",
        ])));
        assert_eq!(cfg.scale.as_deref(), Some("2.0"));
        assert_eq!(cfg.scale_method.as_deref(), Some("lanczos3"));
        assert_eq!(
            cfg.forwarded_args,
            vec!["--scale", "2.0", "--scale-method", "lanczos3", "--own"]
        );

        assert!(matches!(
            parse_launch_args(&args(&["--scale", "1.0", "app.exe"])),
            ParseOutcome::Error(_)
        ));
        assert!(matches!(
            parse_launch_args(&args(&["--scale-method", "nearest", "app.exe"])),
            ParseOutcome::Error(_)
        ));
    }

    #[test]
    fn missing_target_or_values_are_usage_errors() {
        assert!(matches!(parse_launch_args(&args(&[])), ParseOutcome::Error(_)));
        assert!(matches!(
            parse_launch_args(&args(&["--db"])),
            ParseOutcome::Error(_)
        ));
        assert!(matches!(
            parse_launch_args(&args(&["--debug", "all"])),
            ParseOutcome::Error(_)
        ));
        assert!(matches!(parse_launch_args(&args(&["--help"])), ParseOutcome::Help));
    }
}
