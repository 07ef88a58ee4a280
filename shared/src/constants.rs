//! Process-wide conventions: environment variable names, default file names
//! and the registry type identifiers used by the store and the codec.
//!
//! Every environment variable has a primary and a legacy spelling. The
//! launcher exports both; readers check the primary name first.

/// Overlay store path exported by the launcher, read by the shim.
pub const ENV_DB_PATH: &str = "REGTWIN_DB_PATH";
pub const ENV_DB_PATH_LEGACY: &str = "HKLM_SHIM_DB_PATH";

/// Hook scope selection: `core`/`minimal`/`wide`/`unicode` installs the wide
/// surface only, `off`/`none`/`disabled` installs nothing, anything else
/// (including unset) installs the full wide+ANSI surface.
pub const ENV_HOOK_MODE: &str = "REGTWIN_HOOK_MODE";
pub const ENV_HOOK_MODE_LEGACY: &str = "HKLM_SHIM_HOOK_MODE";

/// Comma-separated API filter list (or `all`) enabling the debug trace.
pub const ENV_DEBUG_APIS: &str = "REGTWIN_DEBUG_APIS";
pub const ENV_DEBUG_APIS_LEGACY: &str = "HKLM_SHIM_DEBUG_APIS";

/// Full path of the inbound named pipe the shim writes trace lines to.
pub const ENV_DEBUG_PIPE: &str = "REGTWIN_DEBUG_PIPE";
pub const ENV_DEBUG_PIPE_LEGACY: &str = "HKLM_SHIM_DEBUG_PIPE";

/// Name of the event the shim signals once hook installation finished.
pub const ENV_HOOK_READY_EVENT: &str = "REGTWIN_HOOK_READY_EVENT";
pub const ENV_HOOK_READY_EVENT_LEGACY: &str = "HKLM_SHIM_HOOK_READY_EVENT";

/// Surface-scale settings forwarded verbatim for the graphics add-ons.
pub const ENV_SCALE: &str = "REGTWIN_SCALE";
pub const ENV_SCALE_LEGACY: &str = "HKLM_SHIM_SCALE";
pub const ENV_SCALE_METHOD: &str = "REGTWIN_SCALE_METHOD";
pub const ENV_SCALE_METHOD_LEGACY: &str = "HKLM_SHIM_SCALE_METHOD";

/// Default overlay store file, resolved against the current directory.
pub const DEFAULT_DB_FILE: &str = "HKLM.sqlite";

/// Shim DLL expected next to the launcher binary; the legacy name is still
/// accepted when the primary file is absent.
pub const SHIM_DLL_NAME: &str = "regtwin_shim.dll";
pub const SHIM_DLL_NAME_LEGACY: &str = "hklm_shim.dll";

/// Debug pipe name prefix; the launcher appends its own process id.
pub const DEBUG_PIPE_PREFIX: &str = r"\\.\pipe\regtwin_debug_";

/// The virtualized root. All canonical key paths start with this segment.
pub const HKLM_ROOT: &str = "HKLM";

/// Upper bound on enumeration ordinals when walking the real registry, so a
/// broken provider cannot spin the merge forever.
pub const MAX_ENUM_ORDINAL: u32 = 100_000;

// Registry value type identifiers. Kept aligned with the Win32 REG_* ids so
// payloads round-trip between the store, the codec and the hooked APIs.
pub const REG_NONE: u32 = 0;
pub const REG_SZ: u32 = 1;
pub const REG_EXPAND_SZ: u32 = 2;
pub const REG_BINARY: u32 = 3;
pub const REG_DWORD: u32 = 4;
pub const REG_MULTI_SZ: u32 = 7;
pub const REG_QWORD: u32 = 11;

/// True for the three string-typed value kinds that are stored as UTF-16LE.
pub fn is_string_type(value_type: u32) -> bool {
    matches!(value_type, REG_SZ | REG_EXPAND_SZ | REG_MULTI_SZ)
}
