//! Remote-thread DLL injection into the suspended child.

use std::ffi::c_void;
use std::mem;
use std::ptr;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
use windows_sys::Win32::System::Diagnostics::Debug::WriteProcessMemory;
use windows_sys::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
use windows_sys::Win32::System::Memory::{
    MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE, VirtualAllocEx, VirtualFreeEx,
};
use windows_sys::Win32::System::Threading::{CreateRemoteThread, GetExitCodeThread, INFINITE, WaitForSingleObject};

use shared::errors::LaunchError;

use crate::winerr::{format_win32_error, last_error};

fn injection_error() -> LaunchError {
    LaunchError::Injection {
        detail: format_win32_error(last_error()),
    }
}

/// Writes the DLL path into the target and runs `LoadLibraryW` over it on a
/// remote thread. A zero thread exit code means the loader rejected the DLL.
pub fn inject_dll_into_process(process: HANDLE, dll_path: &str) -> Result<(), LaunchError> {
    if process.is_null() || dll_path.is_empty() {
        return Err(LaunchError::Injection {
            detail: "invalid injection parameters".to_string(),
        });
    }
    let wide: Vec<u16> = dll_path.encode_utf16().chain(std::iter::once(0)).collect();
    let bytes = wide.len() * mem::size_of::<u16>();

    unsafe {
        let remote = VirtualAllocEx(
            process,
            ptr::null(),
            bytes,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_READWRITE,
        );
        if remote.is_null() {
            return Err(injection_error());
        }

        let mut written = 0usize;
        if WriteProcessMemory(process, remote, wide.as_ptr() as *const c_void, bytes, &mut written) == 0
            || written != bytes
        {
            VirtualFreeEx(process, remote, 0, MEM_RELEASE);
            return Err(injection_error());
        }

        let kernel32 = GetModuleHandleW(windows_sys::core::w!("kernel32.dll"));
        if kernel32.is_null() {
            VirtualFreeEx(process, remote, 0, MEM_RELEASE);
            return Err(injection_error());
        }
        let Some(load_library_w) = GetProcAddress(kernel32, c"LoadLibraryW".as_ptr() as *const u8)
        else {
            VirtualFreeEx(process, remote, 0, MEM_RELEASE);
            return Err(injection_error());
        };

        let start_routine: unsafe extern "system" fn(*mut c_void) -> u32 =
            mem::transmute(load_library_w);
        let thread = CreateRemoteThread(
            process,
            ptr::null(),
            0,
            Some(start_routine),
            remote,
            0,
            ptr::null_mut(),
        );
        if thread.is_null() {
            VirtualFreeEx(process, remote, 0, MEM_RELEASE);
            return Err(injection_error());
        }

        WaitForSingleObject(thread, INFINITE);
        let mut exit_code = 0u32;
        GetExitCodeThread(thread, &mut exit_code);
        CloseHandle(thread);
        VirtualFreeEx(process, remote, 0, MEM_RELEASE);
        if exit_code == 0 {
            return Err(LaunchError::Injection {
                detail: "LoadLibraryW returned no module handle in the target".to_string(),
            });
        }
    }
    Ok(())
}
