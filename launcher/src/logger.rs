use std::io::Write;

use flexi_logger::{DeferredNow, Logger, LoggerHandle};
use log::Record;

/// Initializes stderr logging. `--debug` raises the launcher's own trace
/// lines to `info`; without it only warnings and errors surface.
pub fn init_logger(verbose: bool) -> Result<LoggerHandle, Box<dyn std::error::Error>> {
    let spec = if verbose { "info" } else { "warn" };
    let handle = Logger::try_with_str(spec)?.format(log_format).start()?;
    Ok(handle)
}

/// Launch-trace line format: tool name plus a short wall-clock timestamp so
/// the launcher's own lines stay distinguishable from target output relayed
/// over the debug pipe. Source location and thread name carry no signal for
/// a single-shot launcher, so neither is printed.
fn log_format(w: &mut dyn Write, now: &mut DeferredNow, record: &Record) -> std::io::Result<()> {
    write!(
        w,
        "[regtwin {}] {:<5} {}",
        now.format("%H:%M:%S%.3f"),
        record.level(),
        record.args()
    )
}
