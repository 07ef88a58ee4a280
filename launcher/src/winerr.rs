//! Human-readable Win32 error text for diagnostics.

#[cfg(windows)]
pub fn format_win32_error(code: u32) -> String {
    use windows::core::HRESULT;
    let message = windows::core::Error::from_hresult(HRESULT::from_win32(code)).message();
    if message.is_empty() {
        format!("error {code}")
    } else {
        message
    }
}

#[cfg(windows)]
pub fn last_error() -> u32 {
    unsafe { windows_sys::Win32::Foundation::GetLastError() }
}
