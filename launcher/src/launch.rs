//! The launch sequence: export environment, create the target suspended,
//! verify bitness, inject the shim, rendezvous, resume, and forward the exit
//! code.

use std::env;
use std::mem;
use std::path::{Path, PathBuf};

use log::{info, warn};

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows_sys::Win32::System::Threading::{
    CREATE_SUSPENDED, CREATE_UNICODE_ENVIRONMENT, CreateEventW, CreateProcessW,
    GetExitCodeProcess, INFINITE, PROCESS_INFORMATION, ResumeThread, STARTUPINFOW,
    TerminateProcess, WaitForSingleObject,
};

use shared::args::build_command_line;
use shared::constants::{
    DEFAULT_DB_FILE, ENV_DB_PATH, ENV_DB_PATH_LEGACY, ENV_DEBUG_APIS, ENV_DEBUG_APIS_LEGACY,
    ENV_DEBUG_PIPE, ENV_DEBUG_PIPE_LEGACY, ENV_HOOK_READY_EVENT, ENV_HOOK_READY_EVENT_LEGACY,
    ENV_SCALE, ENV_SCALE_LEGACY, ENV_SCALE_METHOD, ENV_SCALE_METHOD_LEGACY, SHIM_DLL_NAME,
    SHIM_DLL_NAME_LEGACY,
};
use shared::errors::LaunchError;

use crate::bitness::is_bitness_mismatched;
use crate::cli::LaunchConfig;
use crate::compat::CompatLayerGuard;
use crate::console::ensure_stdout_bound_to_console;
use crate::debug_bridge::DebugPipeBridge;
use crate::inject::inject_dll_into_process;
use crate::job::TrackingJob;
use crate::winerr::{format_win32_error, last_error};

/// How long the launcher waits for the shim's hook-ready signal. Expiry is
/// logged but never fatal.
const HOOK_READY_TIMEOUT_MS: u32 = 2_000;

fn set_env_compat(primary: &str, legacy: &str, value: &str) {
    unsafe {
        env::set_var(primary, value);
        env::set_var(legacy, value);
    }
}

fn resolve_db_path(raw: Option<&str>, cwd: &Path) -> PathBuf {
    match raw {
        None => cwd.join(DEFAULT_DB_FILE),
        Some(raw) => {
            let p = PathBuf::from(raw);
            if p.is_absolute() { p } else { cwd.join(p) }
        }
    }
}

/// The shim DLL is expected next to the launcher binary; the legacy file
/// name still works when the primary is absent.
fn resolve_shim_path(launcher_dir: &Path) -> PathBuf {
    let primary = launcher_dir.join(SHIM_DLL_NAME);
    if primary.is_file() {
        return primary;
    }
    let legacy = launcher_dir.join(SHIM_DLL_NAME_LEGACY);
    if legacy.is_file() { legacy } else { primary }
}

fn make_hook_ready_event_name() -> String {
    let pid = std::process::id();
    let tick = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("Local\\regtwin_hook_ready_{pid}_{tick}")
}

struct OwnedHandle(HANDLE);
impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { CloseHandle(self.0) };
        }
    }
}

pub fn run(config: LaunchConfig) -> Result<i32, LaunchError> {
    let launcher_dir = env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));
    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let db_path = resolve_db_path(config.db_path.as_deref(), &cwd);
    let shim_path = resolve_shim_path(&launcher_dir);

    set_env_compat(ENV_DB_PATH, ENV_DB_PATH_LEGACY, &db_path.to_string_lossy());

    // Export surface-scaling settings for any injected add-on; the core
    // itself ignores them.
    if let Some(scale) = &config.scale {
        set_env_compat(ENV_SCALE, ENV_SCALE_LEGACY, scale);
    }
    if let Some(method) = &config.scale_method {
        set_env_compat(ENV_SCALE_METHOD, ENV_SCALE_METHOD_LEGACY, method);
    }

    let mut debug_bridge: Option<DebugPipeBridge> = None;
    let mut hook_ready_event: Option<OwnedHandle> = None;
    if let Some(apis) = &config.debug_apis {
        if !ensure_stdout_bound_to_console() {
            return Err(LaunchError::StdioRebind);
        }
        info!("debug mode enabled");

        // A named event the shim signals once hooks are installed, so fast
        // targets cannot run to completion before interception is active.
        let event_name = make_hook_ready_event_name();
        let event_wide: Vec<u16> = event_name.encode_utf16().chain(std::iter::once(0)).collect();
        let event = unsafe { CreateEventW(std::ptr::null(), 1, 0, event_wide.as_ptr()) };
        if !event.is_null() {
            hook_ready_event = Some(OwnedHandle(event));
            set_env_compat(ENV_HOOK_READY_EVENT, ENV_HOOK_READY_EVENT_LEGACY, &event_name);
        }

        let Some(bridge) = DebugPipeBridge::start() else {
            return Err(LaunchError::DebugPipe {
                detail: format_win32_error(last_error()),
            });
        };
        info!("debug pipe created: {}", bridge.pipe_name());
        set_env_compat(ENV_DEBUG_APIS, ENV_DEBUG_APIS_LEGACY, apis);
        set_env_compat(ENV_DEBUG_PIPE, ENV_DEBUG_PIPE_LEGACY, bridge.pipe_name());
        debug_bridge = Some(bridge);
    }

    let cmd_line = build_command_line(&config.target_exe, &config.forwarded_args);
    let work_dir = Path::new(&config.target_exe)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf);

    info!("launching target: {}", config.target_exe);
    if let Some(dir) = &work_dir {
        info!("working directory: {}", dir.display());
    }

    // Ignore requestedExecutionLevel in embedded manifests for the child.
    let _compat_guard = CompatLayerGuard::enable_run_as_invoker()?;

    let target_wide: Vec<u16> = config
        .target_exe
        .encode_utf16()
        .chain(std::iter::once(0))
        .collect();
    let mut cmd_wide: Vec<u16> = cmd_line.encode_utf16().chain(std::iter::once(0)).collect();
    let work_dir_wide: Option<Vec<u16>> = work_dir
        .as_ref()
        .map(|d| d.as_os_str().to_string_lossy().encode_utf16().chain(std::iter::once(0)).collect());

    let mut si: STARTUPINFOW = unsafe { mem::zeroed() };
    si.cb = mem::size_of::<STARTUPINFOW>() as u32;
    let mut pi: PROCESS_INFORMATION = unsafe { mem::zeroed() };

    let created = unsafe {
        CreateProcessW(
            target_wide.as_ptr(),
            cmd_wide.as_mut_ptr(),
            std::ptr::null(),
            std::ptr::null(),
            0,
            CREATE_SUSPENDED | CREATE_UNICODE_ENVIRONMENT,
            std::ptr::null(),
            work_dir_wide
                .as_ref()
                .map(|d| d.as_ptr())
                .unwrap_or(std::ptr::null()),
            &si,
            &mut pi,
        )
    };
    if created == 0 {
        let code = last_error();
        return Err(LaunchError::CreateProcess {
            code,
            detail: format_win32_error(code),
        });
    }
    info!("CreateProcessW succeeded");
    let process = OwnedHandle(pi.hProcess);
    let thread = OwnedHandle(pi.hThread);

    if is_bitness_mismatched(process.0) {
        unsafe { TerminateProcess(process.0, 1) };
        return Err(LaunchError::BitnessMismatch);
    }

    info!("injecting shim: {}", shim_path.display());
    if let Err(err) = inject_dll_into_process(process.0, &shim_path.to_string_lossy()) {
        unsafe { TerminateProcess(process.0, 1) };
        return Err(err);
    }
    info!("shim injected successfully");

    if let Some(event) = &hook_ready_event {
        info!("waiting for shim hook-ready signal");
        match unsafe { WaitForSingleObject(event.0, HOOK_READY_TIMEOUT_MS) } {
            WAIT_OBJECT_0 => info!("shim hook-ready signaled"),
            WAIT_TIMEOUT => warn!("timed out waiting for shim hook-ready signal"),
            _ => warn!(
                "failed waiting for shim hook-ready signal: {}",
                format_win32_error(last_error())
            ),
        }
    }

    // With tracing active, track the whole process tree so the pipe drains
    // even when the child re-execs itself.
    let mut tracking_job: Option<TrackingJob> = None;
    if debug_bridge.is_some() {
        if let Some(job) = TrackingJob::create() {
            if job.assign(process.0) {
                tracking_job = Some(job);
            }
        }
    }

    unsafe { ResumeThread(thread.0) };
    info!("target resumed");
    drop(thread);

    let mut waited_for_job = false;
    if let Some(job) = &tracking_job {
        info!("waiting for job-tracked process tree to exit");
        waited_for_job = job.wait_for_drain();
    }
    if !waited_for_job {
        info!("waiting for target process handle to signal");
        unsafe { WaitForSingleObject(process.0, INFINITE) };
    }

    info!("wait complete; stopping debug pipe bridge");
    if let Some(bridge) = &mut debug_bridge {
        bridge.stop();
    }

    let mut exit_code = 0u32;
    unsafe { GetExitCodeProcess(process.0, &mut exit_code) };
    info!("launcher returning exit code {exit_code} (0x{exit_code:X})");

    if hook_ready_event.is_some() {
        // Best-effort cleanup of the coordination variables in our own
        // environment; the child inherited its copies at create time.
        unsafe {
            env::remove_var(ENV_HOOK_READY_EVENT);
            env::remove_var(ENV_HOOK_READY_EVENT_LEGACY);
        }
    }
    Ok(exit_code as i32)
}
