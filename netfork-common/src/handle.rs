use std::ptr;

use ntapi::ntpsapi::NtTerminateProcess;
use winapi::shared::ntdef::HANDLE;
use winapi::shared::ntstatus::STATUS_UNSUCCESSFUL;
use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
use winapi::um::memoryapi::UnmapViewOfFile;
use winapi::um::winnt::PVOID;

/// Scoped owner of an OS handle; closed on drop.
pub struct OwnedHandle(HANDLE);

impl OwnedHandle {
    pub fn from_raw(handle: HANDLE) -> Self {
        Self(handle)
    }

    pub fn as_raw(&self) -> HANDLE {
        self.0
    }

    // Handles have two "invalid" values, NULL and INVALID_HANDLE_VALUE.
    pub fn is_valid(&self) -> bool {
        !self.0.is_null() && self.0 != INVALID_HANDLE_VALUE
    }

    /// Releases ownership without closing the handle.
    pub fn into_raw(mut self) -> HANDLE {
        std::mem::replace(&mut self.0, ptr::null_mut())
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if self.is_valid() {
            unsafe { CloseHandle(self.0) };
        }
    }
}

/// Owner of a process handle that terminates the process when dropped, so a
/// partially assembled process never outlives a failed setup. `detach`
/// relinquishes that supervision on the success path.
pub struct AttachedProcess(HANDLE);

impl AttachedProcess {
    pub fn from_raw(handle: HANDLE) -> Self {
        Self(handle)
    }

    pub fn as_raw(&self) -> HANDLE {
        self.0
    }

    /// Hands the process over: it keeps running after the handle is closed.
    pub fn detach(mut self) -> OwnedHandle {
        OwnedHandle::from_raw(std::mem::replace(&mut self.0, ptr::null_mut()))
    }
}

impl Drop for AttachedProcess {
    fn drop(&mut self) {
        if !self.0.is_null() && self.0 != INVALID_HANDLE_VALUE {
            unsafe {
                NtTerminateProcess(self.0, STATUS_UNSUCCESSFUL);
                CloseHandle(self.0);
            }
        }
    }
}

/// Scoped file-mapping view; unmapped on drop.
pub struct MappedView(PVOID);

impl MappedView {
    pub fn from_raw(view: PVOID) -> Self {
        Self(view)
    }

    pub fn as_ptr(&self) -> PVOID {
        self.0
    }
}

impl Drop for MappedView {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { UnmapViewOfFile(self.0) };
        }
    }
}
