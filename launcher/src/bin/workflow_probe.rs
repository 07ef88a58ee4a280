//! Registry probe used by the launch workflow test: create a key under
//! `HKLM\Software`, write a string value, read it back, and report any
//! divergence through the exit code.

fn main() {
    std::process::exit(run());
}

#[cfg(not(windows))]
fn run() -> i32 {
    2
}

#[cfg(windows)]
fn run() -> i32 {
    use std::ptr;
    use windows_sys::Win32::Foundation::ERROR_SUCCESS;
    use windows_sys::Win32::System::Registry::{
        HKEY, HKEY_LOCAL_MACHINE, KEY_READ, KEY_WRITE, REG_OPTION_NON_VOLATILE, REG_SZ,
        RegCloseKey, RegCreateKeyExW, RegQueryValueExW, RegSetValueExW,
    };

    let Some(suffix) = std::env::args().nth(1).filter(|s| !s.is_empty()) else {
        return 2;
    };

    let sub_key = format!("Software\\regtwin-workflow\\{suffix}");
    let value_name = "WorkflowValue";
    let value_text = "wrapped-ok";

    let sub_key_w: Vec<u16> = sub_key.encode_utf16().chain(std::iter::once(0)).collect();
    let value_name_w: Vec<u16> = value_name.encode_utf16().chain(std::iter::once(0)).collect();
    let value_text_w: Vec<u16> = value_text.encode_utf16().chain(std::iter::once(0)).collect();

    unsafe {
        let mut key: HKEY = ptr::null_mut();
        let rc = RegCreateKeyExW(
            HKEY_LOCAL_MACHINE,
            sub_key_w.as_ptr(),
            0,
            ptr::null(),
            REG_OPTION_NON_VOLATILE,
            KEY_READ | KEY_WRITE,
            ptr::null(),
            &mut key,
            ptr::null_mut(),
        );
        if rc != ERROR_SUCCESS || key.is_null() {
            return 10;
        }

        let set_bytes = value_text_w.len() * 2;
        let rc = RegSetValueExW(
            key,
            value_name_w.as_ptr(),
            0,
            REG_SZ,
            value_text_w.as_ptr() as *const u8,
            set_bytes as u32,
        );
        if rc != ERROR_SUCCESS {
            RegCloseKey(key);
            return 11;
        }

        let mut value_type = 0u32;
        let mut cb = 0u32;
        let rc = RegQueryValueExW(
            key,
            value_name_w.as_ptr(),
            ptr::null(),
            &mut value_type,
            ptr::null_mut(),
            &mut cb,
        );
        if rc != ERROR_SUCCESS || value_type != REG_SZ || cb < 2 {
            RegCloseKey(key);
            return 12;
        }

        let mut buf = vec![0u8; cb as usize];
        let rc = RegQueryValueExW(
            key,
            value_name_w.as_ptr(),
            ptr::null(),
            &mut value_type,
            buf.as_mut_ptr(),
            &mut cb,
        );
        RegCloseKey(key);
        if rc != ERROR_SUCCESS || value_type != REG_SZ || cb < 2 {
            return 13;
        }

        let units: Vec<u16> = buf[..cb as usize]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        let end = units.iter().position(|&u| u == 0).unwrap_or(units.len());
        let queried = String::from_utf16_lossy(&units[..end]);
        if queried != value_text {
            return 14;
        }
    }
    0
}
