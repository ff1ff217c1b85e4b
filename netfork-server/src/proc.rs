use std::{iter, mem, ptr};

use netfork_common::{
    anyhow::{bail, ensure, Result},
    handle::{AttachedProcess, OwnedHandle},
    nt,
    ntapi::{
        ntmmapi::{NtCreateSection, NtWriteVirtualMemory, SECTION_IMAGE_INFORMATION},
        ntpsapi::{
            NtCreateProcessEx, NtCreateThreadEx, NtQueryInformationProcess,
            ProcessBasicInformation, ProcessImageInformation, PROCESS_BASIC_INFORMATION,
            THREAD_CREATE_FLAGS_CREATE_SUSPENDED,
        },
        ntrtl::{
            RtlCreateProcessParametersEx, RtlDeNormalizeProcessParams,
            RtlDestroyProcessParameters, RtlInitUnicodeString, PRTL_USER_PROCESS_PARAMETERS,
            RTL_USER_PROC_PARAMS_NORMALIZED,
        },
    },
    winapi::{
        shared::{
            minwindef::MAX_PATH,
            ntdef::{HANDLE, PUNICODE_STRING, UNICODE_STRING},
        },
        um::{
            errhandlingapi::GetLastError,
            fileapi::GetFinalPathNameByHandleW,
            memoryapi::VirtualAllocEx,
            processthreadsapi::SetThreadContext,
            winbase::{FILE_NAME_NORMALIZED, VOLUME_NAME_DOS},
            winnt::{
                CONTEXT, MEM_COMMIT, MEM_RESERVE, PAGE_READONLY, PAGE_READWRITE,
                PROCESS_ALL_ACCESS, PVOID, SECTION_ALL_ACCESS, SEC_IMAGE, THREAD_ALL_ACCESS,
            },
        },
    },
};

// Owns the locally built RTL parameter block until it has been copied into
// the target.
struct ProcessParameters(PRTL_USER_PROCESS_PARAMETERS);

impl Drop for ProcessParameters {
    fn drop(&mut self) {
        unsafe { RtlDestroyProcessParameters(self.0) };
    }
}

/// Creates a suspended process backed by an image section over the
/// reconstructed PE and injects a relocated parameter block into it.
///
/// The returned process is attached: dropping it terminates the process, so
/// a failure in any later assembly step tears the partial child down. The
/// caller detaches once the child is running.
pub fn create_forked_process(image_file: HANDLE) -> Result<AttachedProcess> {
    let mut section: HANDLE = ptr::null_mut();
    unsafe {
        nt::check(
            NtCreateSection(
                &mut section,
                SECTION_ALL_ACCESS,
                ptr::null_mut(),
                ptr::null_mut(),
                PAGE_READONLY,
                SEC_IMAGE,
                image_file,
            ),
            "NtCreateSection",
        )?;
    }
    let section = OwnedHandle::from_raw(section);

    let mut process: HANDLE = ptr::null_mut();
    unsafe {
        nt::check(
            NtCreateProcessEx(
                &mut process,
                PROCESS_ALL_ACCESS,
                ptr::null_mut(),
                nt::current_process(),
                0,
                section.as_raw(),
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            ),
            "NtCreateProcessEx",
        )?;
    }
    let process = AttachedProcess::from_raw(process);

    let mut process_info: PROCESS_BASIC_INFORMATION = unsafe { mem::zeroed() };
    unsafe {
        nt::check(
            NtQueryInformationProcess(
                process.as_raw(),
                ProcessBasicInformation,
                &mut process_info as *mut _ as *mut _,
                mem::size_of::<PROCESS_BASIC_INFORMATION>() as u32,
                ptr::null_mut(),
            ),
            "NtQueryInformationProcess(ProcessBasicInformation)",
        )?;
    }

    write_process_parameters(&process, &process_info, image_file)?;

    Ok(process)
}

// The child is not started through the usual loader path, so its parameter
// block is built locally in normalized form, converted to offsets, rebased,
// written into the target, and hooked up through the PEB.
fn write_process_parameters(
    process: &AttachedProcess,
    process_info: &PROCESS_BASIC_INFORMATION,
    image_file: HANDLE,
) -> Result<()> {
    // The image's DOS path doubles as image name and command line.
    let mut final_image_path = [0u16; MAX_PATH + 1];
    let required = unsafe {
        GetFinalPathNameByHandleW(
            image_file,
            final_image_path.as_mut_ptr(),
            MAX_PATH as u32,
            FILE_NAME_NORMALIZED | VOLUME_NAME_DOS,
        )
    };
    ensure!(
        required != 0 && required <= MAX_PATH as u32,
        "GetFinalPathNameByHandleW failed with error {}",
        unsafe { GetLastError() },
    );

    let window_title: Vec<u16> = "netforked process"
        .encode_utf16()
        .chain(iter::once(0))
        .collect();

    unsafe {
        let mut image_name: UNICODE_STRING = mem::zeroed();
        RtlInitUnicodeString(&mut image_name, final_image_path.as_ptr());
        let mut window_name: UNICODE_STRING = mem::zeroed();
        RtlInitUnicodeString(&mut window_name, window_title.as_ptr());

        // The image path doubles as the command line, so the same string is
        // passed twice.
        let image_name_ptr: PUNICODE_STRING = &mut image_name;

        let mut parameters: PRTL_USER_PROCESS_PARAMETERS = ptr::null_mut();
        nt::check(
            RtlCreateProcessParametersEx(
                &mut parameters,
                image_name_ptr,
                ptr::null_mut(),
                ptr::null_mut(),
                image_name_ptr,
                ptr::null_mut(),
                &mut window_name,
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
                RTL_USER_PROC_PARAMS_NORMALIZED,
            ),
            "RtlCreateProcessParametersEx",
        )?;
        let parameters = ProcessParameters(parameters);

        let params_size = (*parameters.0).MaximumLength as usize
            + (*parameters.0).EnvironmentSize as usize;
        let params_remote = VirtualAllocEx(
            process.as_raw(),
            ptr::null_mut(),
            params_size,
            MEM_RESERVE | MEM_COMMIT,
            PAGE_READWRITE,
        );
        if params_remote.is_null() {
            bail!(
                "VirtualAllocEx for the parameter block failed with error {}",
                GetLastError()
            );
        }

        // Denormalized parameters use offsets instead of absolute pointers;
        // the target's loader normalizes them back during startup.
        RtlDeNormalizeProcessParams(parameters.0);

        // Denormalization does not rewrite the environment pointer, so it is
        // rebased by hand to be valid at the remote address.
        let delta = (params_remote as usize).wrapping_sub(parameters.0 as usize);
        (*parameters.0).Environment =
            ((*parameters.0).Environment as usize).wrapping_add(delta) as *mut _;

        nt::check(
            NtWriteVirtualMemory(
                process.as_raw(),
                params_remote,
                parameters.0 as *mut _,
                params_size,
                ptr::null_mut(),
            ),
            "NtWriteVirtualMemory(parameters)",
        )?;

        // Point the child's PEB at the remote copy.
        let mut remote_parameters = params_remote;
        nt::check(
            NtWriteVirtualMemory(
                process.as_raw(),
                ptr::addr_of_mut!((*process_info.PebBaseAddress).ProcessParameters) as *mut _,
                &mut remote_parameters as *mut _ as *mut _,
                mem::size_of::<PVOID>(),
                ptr::null_mut(),
            ),
            "NtWriteVirtualMemory(ProcessParameters)",
        )?;
    }

    Ok(())
}

/// Creates the initial thread, suspended, from the image section's entry
/// parameters, and installs the captured register file on it.
pub fn create_forked_thread(process: HANDLE, thread_context: &CONTEXT) -> Result<OwnedHandle> {
    let mut image_info: SECTION_IMAGE_INFORMATION = unsafe { mem::zeroed() };
    unsafe {
        nt::check(
            NtQueryInformationProcess(
                process,
                ProcessImageInformation,
                &mut image_info as *mut _ as *mut _,
                mem::size_of::<SECTION_IMAGE_INFORMATION>() as u32,
                ptr::null_mut(),
            ),
            "NtQueryInformationProcess(ProcessImageInformation)",
        )?;
    }

    let mut thread: HANDLE = ptr::null_mut();
    unsafe {
        nt::check(
            NtCreateThreadEx(
                &mut thread,
                THREAD_ALL_ACCESS,
                ptr::null_mut(),
                process,
                image_info.TransferAddress,
                ptr::null_mut(),
                THREAD_CREATE_FLAGS_CREATE_SUSPENDED,
                image_info.ZeroBits as usize,
                image_info.CommittedStackSize,
                image_info.MaximumStackSize,
                ptr::null_mut(),
            ),
            "NtCreateThreadEx",
        )?;
    }
    let thread = OwnedHandle::from_raw(thread);

    // The register file goes in while the thread is still suspended;
    // resuming is the caller's last step.
    unsafe {
        nt::win32_check(
            SetThreadContext(thread.as_raw(), thread_context),
            "SetThreadContext",
        )?;
    }

    Ok(thread)
}
