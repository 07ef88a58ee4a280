//! Console binding for `--debug` runs: trace relaying needs working std
//! handles even when the launcher was started without a console.

use windows_sys::Win32::Foundation::{
    ERROR_ACCESS_DENIED, ERROR_SUCCESS, GENERIC_READ, GENERIC_WRITE, GetLastError, HANDLE,
    INVALID_HANDLE_VALUE, SetLastError,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FILE_ATTRIBUTE_NORMAL, FILE_SHARE_WRITE, FILE_TYPE_UNKNOWN, GetFileType,
    OPEN_EXISTING,
};
use windows_sys::Win32::System::Console::{
    ATTACH_PARENT_PROCESS, AllocConsole, AttachConsole, GetStdHandle, STD_ERROR_HANDLE,
    STD_OUTPUT_HANDLE, SetStdHandle,
};

fn has_valid_std_handle(std_id: u32) -> bool {
    unsafe {
        let handle = GetStdHandle(std_id);
        if handle.is_null() || handle == INVALID_HANDLE_VALUE {
            return false;
        }
        SetLastError(ERROR_SUCCESS);
        let file_type = GetFileType(handle);
        !(file_type == FILE_TYPE_UNKNOWN && GetLastError() != ERROR_SUCCESS)
    }
}

fn open_conout() -> HANDLE {
    let conout: Vec<u16> = "CONOUT$".encode_utf16().chain(std::iter::once(0)).collect();
    unsafe {
        CreateFileW(
            conout.as_ptr(),
            GENERIC_READ | GENERIC_WRITE,
            FILE_SHARE_WRITE,
            std::ptr::null(),
            OPEN_EXISTING,
            FILE_ATTRIBUTE_NORMAL,
            std::ptr::null_mut(),
        )
    }
}

/// Attaches to the parent console (or allocates one) and rebinds stdout and
/// stderr to it when the current std handles are unusable.
pub fn ensure_stdout_bound_to_console() -> bool {
    if has_valid_std_handle(STD_OUTPUT_HANDLE) && has_valid_std_handle(STD_ERROR_HANDLE) {
        return true;
    }

    unsafe {
        if AttachConsole(ATTACH_PARENT_PROCESS) == 0 && GetLastError() != ERROR_ACCESS_DENIED {
            if AllocConsole() == 0 {
                return false;
            }
        }

        let out = open_conout();
        if out == INVALID_HANDLE_VALUE {
            return false;
        }
        if SetStdHandle(STD_OUTPUT_HANDLE, out) == 0 {
            return false;
        }
        let err = open_conout();
        if err == INVALID_HANDLE_VALUE {
            return false;
        }
        SetStdHandle(STD_ERROR_HANDLE, err) != 0
    }
}
