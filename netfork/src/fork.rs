use std::{mem, ptr};

use netfork_common::{
    anyhow::Result,
    nt,
    ntapi::{
        ntpebteb::{PEB, TEB},
        ntrtl::{RtlAcquirePebLock, RtlReleasePebLock},
    },
    proto::Record,
    tracing::{debug, error},
    transport::Connection,
    winapi::{
        shared::minwindef::HMODULE,
        um::{
            libloaderapi::{GetModuleHandleExW, GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT},
            processthreadsapi::GetCurrentProcess,
            psapi::{GetModuleInformation, MODULEINFO},
            winnt::{RtlCaptureContext, CONTEXT, CONTEXT_ALL, MEMORY_BASIC_INFORMATION, MEM_IMAGE},
        },
    },
};

use crate::vm::Snapshot;

/// The two logical returns of [`fork`], plus the failure case observed only
/// on the parent side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum ForkReturn {
    Error = 0,
    Parent = 1,
    Child = 2,
}

const CHILD_RAX: u64 = ForkReturn::Child as u64;

struct ImageInfo {
    base_address: usize,
    size: u32,
}

/// Forks the calling process onto the server behind `server`.
///
/// Returns twice logically: the invoking process observes
/// [`ForkReturn::Parent`] once the snapshot has been fully streamed, and the
/// process reconstructed on the server side re-enters this call and observes
/// [`ForkReturn::Child`] without executing any of the transmission path.
/// [`ForkReturn::Error`] is seen only by the parent, only when a send fails.
///
/// `restore_context` substitutes the transmitted thread context, relocating
/// the child's resume point to an arbitrary entry; the calling thread's own
/// captured context is used otherwise.
pub fn fork(server: &mut Connection, restore_context: Option<&CONTEXT>) -> ForkReturn {
    let mut current_context: CONTEXT = unsafe { mem::zeroed() };
    current_context.ContextFlags = CONTEXT_ALL;
    unsafe { RtlCaptureContext(&mut current_context) };

    // Execution re-enters at this point on the reconstructed side. The saved
    // register image is patched with the child marker below, before the
    // stack is streamed, so the rebuilt frame reads the marker back here and
    // skips transmission entirely.
    if current_context.Rax == CHILD_RAX {
        return ForkReturn::Child;
    }
    current_context.Rax = CHILD_RAX;

    let context_to_restore = restore_context.unwrap_or(&current_context);
    if let Err(e) = server.send_value(context_to_restore) {
        error!("failed to send thread context: {e:#}");
        return ForkReturn::Error;
    }

    let peb = capture_peb();
    if let Err(e) = server.send_value(&peb) {
        error!("failed to send process environment block: {e:#}");
        return ForkReturn::Error;
    }

    let teb = unsafe { ptr::read(nt::current_teb() as *const TEB) };
    if let Err(e) = server.send_value(&teb) {
        error!("failed to send thread environment block: {e:#}");
        return ForkReturn::Error;
    }

    let image = match image_info() {
        Ok(image) => image,
        Err(e) => {
            error!("failed to locate the process image: {e:#}");
            return ForkReturn::Error;
        }
    };
    debug_assert_eq!(peb.ImageBaseAddress as usize, image.base_address);

    if let Err(e) = server.send_value(&image.size) {
        error!("failed to send image size: {e:#}");
        return ForkReturn::Error;
    }

    // The image is streamed body-only; the server already knows its size and
    // rebuilds the layout from the PE headers contained in the bytes.
    let image_base = image.base_address;
    let mut image_snapshot = Snapshot::new(move |mbi: &MEMORY_BASIC_INFORMATION| {
        mbi.Type == MEM_IMAGE && mbi.AllocationBase as usize == image_base
    });
    while let Some(record) = image_snapshot.next() {
        if let Record::Bytes(bytes) = record {
            if let Err(e) = server.send_bytes(bytes) {
                error!("failed to send image bytes: {e:#}");
                return ForkReturn::Error;
            }
            debug!("sent {:#x} image bytes", bytes.len());
        }
    }

    let mut snapshot = Snapshot::new(|mbi: &MEMORY_BASIC_INFORMATION| mbi.Type != MEM_IMAGE);
    while let Some(record) = snapshot.next() {
        let result = match record {
            Record::Region(region) => server.send_value(&region),
            Record::Subregion(subregion) => server.send_value(&subregion),
            Record::Bytes(bytes) => server.send_bytes(bytes),
        };
        if let Err(e) = result {
            error!("failed to send region data: {e:#}");
            return ForkReturn::Error;
        }
    }

    ForkReturn::Parent
}

// The PEB is copied under the loader lock so loader data is not mid-update
// while the bytes are taken.
fn capture_peb() -> PEB {
    let mut peb: PEB = unsafe { mem::zeroed() };
    unsafe {
        RtlAcquirePebLock();
        ptr::copy_nonoverlapping(
            (*nt::current_teb()).ProcessEnvironmentBlock as *const PEB,
            &mut peb,
            1,
        );
        RtlReleasePebLock();
    }
    peb
}

fn image_info() -> Result<ImageInfo> {
    unsafe {
        let mut process_image: HMODULE = ptr::null_mut();
        nt::win32_check(
            GetModuleHandleExW(
                GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
                ptr::null(),
                &mut process_image,
            ),
            "GetModuleHandleExW",
        )?;

        let mut mi: MODULEINFO = mem::zeroed();
        nt::win32_check(
            GetModuleInformation(
                GetCurrentProcess(),
                process_image,
                &mut mi,
                mem::size_of::<MODULEINFO>() as u32,
            ),
            "GetModuleInformation",
        )?;

        Ok(ImageInfo {
            base_address: mi.lpBaseOfDll as usize,
            size: mi.SizeOfImage,
        })
    }
}
