//! `regtwin`: starts a target process with its `HKLM` view virtualized.
//!
//! The launcher creates the target suspended, injects the shim DLL with a
//! remote `LoadLibraryW` thread, waits for the hook-ready rendezvous, then
//! resumes the target and forwards its exit code. All launcher-owned state
//! (overlay path, debug settings) travels to the child through environment
//! variables exported before `CreateProcessW`.

mod cli;
#[cfg(any(windows, test))]
mod compat;
mod logger;
mod winerr;

#[cfg(windows)]
mod bitness;
#[cfg(windows)]
mod console;
#[cfg(windows)]
mod debug_bridge;
#[cfg(windows)]
mod inject;
#[cfg(windows)]
mod job;
#[cfg(windows)]
mod launch;

use std::env;
use std::process::exit;

use cli::ParseOutcome;

fn main() {
    let raw_args: Vec<String> = env::args_os()
        .skip(1)
        .map(|a| a.to_string_lossy().into_owned())
        .collect();

    let config = match cli::parse_launch_args(&raw_args) {
        ParseOutcome::Help => {
            println!("{}", cli::usage());
            exit(0);
        }
        ParseOutcome::Error(message) => {
            eprintln!("{message}");
            exit(1);
        }
        ParseOutcome::Launch(config) => config,
    };

    // Keep the logger handle alive for the lifetime of the launch.
    let _logger = logger::init_logger(config.debug_apis.is_some()).ok();

    #[cfg(windows)]
    match launch::run(config) {
        Ok(code) => exit(code),
        Err(err) => {
            eprintln!("{err}");
            exit(err.exit_code());
        }
    }

    #[cfg(not(windows))]
    {
        let _ = config;
        eprintln!("regtwin launches Windows targets only.");
        exit(1);
    }
}
