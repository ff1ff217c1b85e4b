use std::arch::asm;

use anyhow::{bail, Result};
use ntapi::ntpebteb::TEB;
use winapi::shared::minwindef::BOOL;
use winapi::shared::ntdef::{HANDLE, NTSTATUS};
use winapi::um::errhandlingapi::GetLastError;

pub fn nt_success(status: NTSTATUS) -> bool {
    status >= 0
}

/// Turns a failing NTSTATUS into an error naming the call.
pub fn check(status: NTSTATUS, what: &str) -> Result<()> {
    if nt_success(status) {
        Ok(())
    } else {
        bail!("{what} failed with status {status:#x}")
    }
}

/// Turns a failing Win32 BOOL into an error carrying the last error code.
pub fn win32_check(ok: BOOL, what: &str) -> Result<()> {
    if ok != 0 {
        Ok(())
    } else {
        bail!("{what} failed with error {}", unsafe { GetLastError() })
    }
}

/// The pseudo-handle for the current process, accepted wherever a real
/// process handle is.
pub fn current_process() -> HANDLE {
    -1isize as HANDLE
}

/// The calling thread's TEB, read from the gs segment.
#[cfg(target_arch = "x86_64")]
pub fn current_teb() -> *mut TEB {
    let teb: *mut TEB;
    unsafe {
        asm!("mov {}, qword ptr gs:[0x30]", out(reg) teb, options(nostack, preserves_flags));
    }
    teb
}
