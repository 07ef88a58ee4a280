//! Inbound named pipe that relays the shim's trace lines onto stdout.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use windows_sys::Win32::Foundation::{
    CloseHandle, ERROR_PIPE_CONNECTED, GENERIC_WRITE, GetLastError, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FILE_FLAGS_AND_ATTRIBUTES, OPEN_EXISTING, ReadFile,
};
use windows_sys::Win32::System::Pipes::{
    ConnectNamedPipe, CreateNamedPipeW, DisconnectNamedPipe, PIPE_ACCESS_INBOUND,
    PIPE_READMODE_MESSAGE, PIPE_TYPE_MESSAGE, PIPE_WAIT,
};
use windows_sys::Win32::System::Threading::{GetCurrentProcessId, Sleep};

use shared::constants::DEBUG_PIPE_PREFIX;

struct PipeHandle(HANDLE);
unsafe impl Send for PipeHandle {}
unsafe impl Sync for PipeHandle {}

pub struct DebugPipeBridge {
    pipe: Arc<PipeHandle>,
    pipe_name: String,
    stopping: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl DebugPipeBridge {
    /// Creates the inbound pipe `\\.\pipe\regtwin_debug_<pid>` and starts
    /// the relay thread. Returns `None` when the pipe cannot be created.
    pub fn start() -> Option<Self> {
        let pipe_name = format!("{DEBUG_PIPE_PREFIX}{}", unsafe { GetCurrentProcessId() });
        let wide: Vec<u16> = pipe_name.encode_utf16().chain(std::iter::once(0)).collect();
        let pipe = unsafe {
            CreateNamedPipeW(
                wide.as_ptr(),
                PIPE_ACCESS_INBOUND,
                PIPE_TYPE_MESSAGE | PIPE_READMODE_MESSAGE | PIPE_WAIT,
                1,
                4096,
                4096,
                0,
                std::ptr::null(),
            )
        };
        if pipe == INVALID_HANDLE_VALUE {
            return None;
        }

        let pipe = Arc::new(PipeHandle(pipe));
        let stopping = Arc::new(AtomicBool::new(false));
        let reader = {
            let pipe = Arc::clone(&pipe);
            let stopping = Arc::clone(&stopping);
            thread::Builder::new()
                .name("debug_pipe".into())
                .spawn(move || relay_loop(&pipe, &stopping))
                .ok()?
        };

        Some(Self {
            pipe,
            pipe_name,
            stopping,
            reader: Some(reader),
        })
    }

    pub fn pipe_name(&self) -> &str {
        &self.pipe_name
    }

    /// Stops the relay: a throwaway client connection unblocks a pending
    /// `ConnectNamedPipe`, then the reader joins and the pipe closes.
    pub fn stop(&mut self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        let wide: Vec<u16> = self
            .pipe_name
            .encode_utf16()
            .chain(std::iter::once(0))
            .collect();
        unsafe {
            let unblock = CreateFileW(
                wide.as_ptr(),
                GENERIC_WRITE,
                0,
                std::ptr::null(),
                OPEN_EXISTING,
                FILE_FLAGS_AND_ATTRIBUTES::default(),
                std::ptr::null_mut(),
            );
            if unblock != INVALID_HANDLE_VALUE {
                CloseHandle(unblock);
            }
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        unsafe { CloseHandle(self.pipe.0) };
    }
}

impl Drop for DebugPipeBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

fn relay_loop(pipe: &PipeHandle, stopping: &AtomicBool) {
    while !stopping.load(Ordering::SeqCst) {
        let connected = unsafe { ConnectNamedPipe(pipe.0, std::ptr::null_mut()) };
        if connected == 0 && unsafe { GetLastError() } != ERROR_PIPE_CONNECTED {
            if stopping.load(Ordering::SeqCst) {
                break;
            }
            unsafe { Sleep(10) };
            continue;
        }

        let mut buffer = [0u8; 1024];
        while !stopping.load(Ordering::SeqCst) {
            let mut bytes_read = 0u32;
            let ok = unsafe {
                ReadFile(
                    pipe.0,
                    buffer.as_mut_ptr(),
                    buffer.len() as u32,
                    &mut bytes_read,
                    std::ptr::null_mut(),
                )
            };
            if ok == 0 || bytes_read == 0 {
                break;
            }
            let mut stdout = std::io::stdout();
            let _ = stdout.write_all(&buffer[..bytes_read as usize]);
            let _ = stdout.flush();
        }
        unsafe { DisconnectNamedPipe(pipe.0) };
    }
}
