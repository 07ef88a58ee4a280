//! Job-object tracking for debug runs.
//!
//! With tracing active the launcher must outlive the whole process tree, not
//! just the direct child, so the debug pipe keeps draining after the child
//! respawns itself. Silent-breakaway keeps intentional breakaway children
//! out of the wait.

use std::mem;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
use windows_sys::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, JOB_OBJECT_LIMIT_SILENT_BREAKAWAY_OK,
    JOBOBJECT_BASIC_ACCOUNTING_INFORMATION, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
    JobObjectBasicAccountingInformation, JobObjectExtendedLimitInformation,
    QueryInformationJobObject, SetInformationJobObject,
};
use windows_sys::Win32::System::Threading::Sleep;

pub struct TrackingJob {
    handle: HANDLE,
}

impl TrackingJob {
    pub fn create() -> Option<Self> {
        unsafe {
            let job = CreateJobObjectW(std::ptr::null(), std::ptr::null());
            if job.is_null() {
                return None;
            }
            let mut limits: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = mem::zeroed();
            limits.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_SILENT_BREAKAWAY_OK;
            let ok = SetInformationJobObject(
                job,
                JobObjectExtendedLimitInformation,
                &limits as *const _ as *const _,
                mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
            );
            if ok == 0 {
                CloseHandle(job);
                return None;
            }
            Some(Self { handle: job })
        }
    }

    pub fn assign(&self, process: HANDLE) -> bool {
        unsafe { AssignProcessToJobObject(self.handle, process) != 0 }
    }

    /// Polls until no process remains in the job. Returns false when the
    /// accounting query fails (caller falls back to the process handle).
    pub fn wait_for_drain(&self) -> bool {
        loop {
            let mut info: JOBOBJECT_BASIC_ACCOUNTING_INFORMATION = unsafe { mem::zeroed() };
            let ok = unsafe {
                QueryInformationJobObject(
                    self.handle,
                    JobObjectBasicAccountingInformation,
                    &mut info as *mut _ as *mut _,
                    mem::size_of::<JOBOBJECT_BASIC_ACCOUNTING_INFORMATION>() as u32,
                    std::ptr::null_mut(),
                )
            };
            if ok == 0 {
                return false;
            }
            if info.ActiveProcesses == 0 {
                return true;
            }
            unsafe { Sleep(50) };
        }
    }
}

impl Drop for TrackingJob {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.handle) };
    }
}
