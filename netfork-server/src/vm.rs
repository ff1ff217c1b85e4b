use std::cmp;

use netfork_common::{
    anyhow::{Context, Result},
    proto::{RegionInfo, SubregionInfo},
    tracing::{debug, warn},
    transport::Connection,
    winapi::{
        shared::ntdef::HANDLE,
        um::{
            errhandlingapi::GetLastError,
            memoryapi::{VirtualAllocEx, VirtualProtectEx, WriteProcessMemory},
            winnt::{
                MEM_COMMIT, MEM_RESERVE, PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY,
                PAGE_GUARD, PAGE_READWRITE, PAGE_WRITECOPY,
            },
        },
    },
};

const REGION_BUFFER_SIZE: usize = 4096;

// Copy-on-write has no meaning in a synthesized address space; the writable
// equivalents are applied instead.
fn writable_protect(protect: u32) -> u32 {
    let mut protect = protect;
    if protect & PAGE_EXECUTE_WRITECOPY != 0 {
        protect = (protect & !PAGE_EXECUTE_WRITECOPY) | PAGE_EXECUTE_READWRITE;
    }
    if protect & PAGE_WRITECOPY != 0 {
        protect = (protect & !PAGE_WRITECOPY) | PAGE_READWRITE;
    }
    protect
}

/// Rebuilds every non-image region of the forked process from the stream.
///
/// Reserve, commit, and write failures are logged and skipped so the rebuild
/// can report exactly which region failed; only a truncated stream is fatal.
/// The loop ends when the client closes the connection on a region boundary.
pub fn rebuild_forked_process(process: HANDLE, client: &mut Connection) -> Result<()> {
    loop {
        let Some(region) = client
            .try_recv_value::<RegionInfo>()
            .context("stream broke on a region boundary")?
        else {
            // Clean close: the snapshot has been fully replayed.
            return Ok(());
        };

        debug!("received region {region:?}");

        let region_ptr = unsafe {
            VirtualAllocEx(
                process,
                region.base_address as *mut _,
                region.allocation_size,
                MEM_RESERVE,
                writable_protect(region.protect),
            )
        };
        if region_ptr.is_null() {
            warn!(
                "failed to reserve {:#x} bytes at {:#x}: error {}",
                region.allocation_size,
                region.base_address,
                unsafe { GetLastError() },
            );
        }

        for _ in 0..region.subregion_info_size {
            let subregion: SubregionInfo = client
                .recv_value()
                .context("fatal error when rebuilding virtual memory")?;

            debug!("received subregion {subregion:?}");

            // Reserved-only block; the client sends no bytes for it.
            if subregion.protect == 0 {
                continue;
            }

            let block_protect = writable_protect(subregion.protect);

            let block_ptr = unsafe {
                VirtualAllocEx(
                    process,
                    subregion.base_address as *mut _,
                    subregion.region_size,
                    MEM_COMMIT,
                    PAGE_READWRITE,
                )
            };
            if block_ptr.is_null() {
                warn!(
                    "failed to commit {:#x} bytes at {:#x}: error {}",
                    subregion.region_size,
                    subregion.base_address,
                    unsafe { GetLastError() },
                );
            }

            // Guard pages carry no bytes either; the final protection is
            // applied directly.
            if subregion.protect & PAGE_GUARD != 0 {
                apply_protection(process, &subregion, block_protect);
                continue;
            }

            receive_subregion_bytes(process, client, &subregion);
            apply_protection(process, &subregion, block_protect);
        }
    }
}

// Streams one subregion body from the wire into the target in fixed-size
// chunks, low offset to high.
fn receive_subregion_bytes(process: HANDLE, client: &mut Connection, subregion: &SubregionInfo) {
    let mut buffer = [0u8; REGION_BUFFER_SIZE];
    let mut remaining = subregion.region_size;
    let mut offset = 0usize;

    while remaining > 0 {
        let bytes_to_read = cmp::min(REGION_BUFFER_SIZE, remaining);

        if let Err(e) = client.recv_exact(&mut buffer[..bytes_to_read]) {
            warn!("failed to receive full subregion: {e:#}");
        }

        let target_address = subregion.base_address + offset;
        let mut bytes_written = 0usize;
        let write_successful = unsafe {
            WriteProcessMemory(
                process,
                target_address as *mut _,
                buffer.as_ptr() as *const _,
                bytes_to_read,
                &mut bytes_written,
            )
        };
        if write_successful == 0 || bytes_written != bytes_to_read {
            warn!("failed to write memory at {target_address:#x}: error {}", unsafe {
                GetLastError()
            });
        }

        remaining -= bytes_to_read;
        offset += bytes_to_read;
    }
}

fn apply_protection(process: HANDLE, subregion: &SubregionInfo, protect: u32) {
    let mut old_protect = 0u32;
    let ok = unsafe {
        VirtualProtectEx(
            process,
            subregion.base_address as *mut _,
            subregion.region_size,
            protect,
            &mut old_protect,
        )
    };
    if ok == 0 {
        warn!(
            "failed to change protection to {protect:#x} at {:#x}: error {}",
            subregion.base_address,
            unsafe { GetLastError() },
        );
    }
}

#[cfg(test)]
mod tests {
    use netfork_common::winapi::um::winnt::{PAGE_EXECUTE_READ, PAGE_NOACCESS, PAGE_READONLY};

    use super::*;

    #[test]
    fn rewrites_copy_on_write_to_writable() {
        assert_eq!(writable_protect(PAGE_EXECUTE_WRITECOPY), PAGE_EXECUTE_READWRITE);
        assert_eq!(writable_protect(PAGE_WRITECOPY), PAGE_READWRITE);
        assert_eq!(
            writable_protect(PAGE_GUARD | PAGE_WRITECOPY),
            PAGE_GUARD | PAGE_READWRITE
        );
    }

    #[test]
    fn leaves_plain_protections_untouched() {
        for protect in [
            0,
            PAGE_NOACCESS,
            PAGE_READONLY,
            PAGE_READWRITE,
            PAGE_EXECUTE_READ,
            PAGE_EXECUTE_READWRITE,
        ] {
            assert_eq!(writable_protect(protect), protect);
        }
    }
}
