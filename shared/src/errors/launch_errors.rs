use thiserror::Error;

/// Launcher bootstrap failures. Each variant maps to a distinct process exit
/// code so scripts can tell launcher problems apart from whatever the target
/// itself returns.
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("CreateProcessW failed: {detail}")]
    CreateProcess { code: u32, detail: String },

    #[error("failed to inject shim DLL into target process: {detail}")]
    Injection { detail: String },

    #[error("failed to enable the RunAsInvoker compatibility layer: {detail}")]
    CompatLayer { detail: String },

    #[error("failed to bind stdout to console for --debug mode")]
    StdioRebind,

    #[error("failed to create debug pipe: {detail}")]
    DebugPipe { detail: String },

    #[error(
        "launcher/target architecture mismatch detected; regtwin.exe, regtwin_shim.dll \
         (or legacy hklm_shim.dll), and the target EXE must share one bitness \
         (all x86 or all x64)"
    )]
    BitnessMismatch,
}

impl LaunchError {
    /// The launcher's exit code for this failure, distinct from likely
    /// target exit codes. A failed `CreateProcessW` reports the raw Win32
    /// code, matching what a direct launch attempt would surface.
    pub fn exit_code(&self) -> i32 {
        match self {
            LaunchError::CreateProcess { code, .. } => *code as i32,
            LaunchError::Injection { .. } => 2,
            LaunchError::CompatLayer { .. } => 3,
            LaunchError::StdioRebind => 4,
            LaunchError::DebugPipe { .. } => 5,
            LaunchError::BitnessMismatch => 6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_stay_distinct() {
        let codes = [
            LaunchError::Injection { detail: String::new() }.exit_code(),
            LaunchError::CompatLayer { detail: String::new() }.exit_code(),
            LaunchError::StdioRebind.exit_code(),
            LaunchError::DebugPipe { detail: String::new() }.exit_code(),
            LaunchError::BitnessMismatch.exit_code(),
        ];
        assert_eq!(codes, [2, 3, 4, 5, 6]);
    }

    #[test]
    fn create_process_forwards_the_win32_code() {
        let err = LaunchError::CreateProcess {
            code: 740,
            detail: "elevation required".into(),
        };
        assert_eq!(err.exit_code(), 740);
        assert!(err.to_string().contains("elevation required"));
    }
}
