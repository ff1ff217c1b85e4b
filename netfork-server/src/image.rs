use std::{iter, mem, ptr};

use netfork_common::{
    anyhow::{bail, Result},
    handle::{MappedView, OwnedHandle},
    nt,
    ntapi::{
        ntioapi::{
            FileDispositionInformation, FileEndOfFileInformation, NtCreateFile,
            NtSetInformationFile, FILE_DELETE_ON_CLOSE, FILE_DISPOSITION_INFORMATION,
            FILE_END_OF_FILE_INFORMATION, FILE_OVERWRITE_IF, FILE_SYNCHRONOUS_IO_NONALERT,
            IO_STATUS_BLOCK,
        },
        ntrtl::{RtlExpandEnvironmentStrings_U, RtlInitUnicodeString},
    },
    winapi::{
        shared::{
            minwindef::MAX_PATH,
            ntdef::{HANDLE, LARGE_INTEGER, OBJECT_ATTRIBUTES, UNICODE_STRING},
        },
        um::{
            errhandlingapi::GetLastError,
            memoryapi::{CreateFileMappingW, MapViewOfFile, FILE_MAP_ALL_ACCESS},
            winnt::{
                DELETE, FILE_ATTRIBUTE_TEMPORARY, FILE_GENERIC_READ, FILE_GENERIC_WRITE,
                FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE, PAGE_READWRITE,
            },
        },
    },
};

// TODO: attach a unique id to the name so two reconstructions do not fight
// over the same file.
const IMAGE_PATH_TEMPLATE: &str = r"\??\%TEMP%\netforked-image.exe";

/// Expanded NT path of the temporary image; keeps the backing buffer alive
/// alongside the counted string pointing into it.
pub struct NtImagePath {
    buffer: Vec<u16>,
    length: u16,
}

impl NtImagePath {
    pub fn unicode(&mut self) -> UNICODE_STRING {
        UNICODE_STRING {
            Length: self.length,
            MaximumLength: (self.buffer.len() * mem::size_of::<u16>()) as u16,
            Buffer: self.buffer.as_mut_ptr(),
        }
    }
}

pub fn expand_image_path() -> Result<NtImagePath> {
    let source: Vec<u16> = IMAGE_PATH_TEMPLATE
        .encode_utf16()
        .chain(iter::once(0))
        .collect();

    unsafe {
        let mut source_string: UNICODE_STRING = mem::zeroed();
        RtlInitUnicodeString(&mut source_string, source.as_ptr());

        let mut buffer = vec![0u16; MAX_PATH];
        let mut expanded = UNICODE_STRING {
            Length: 0,
            MaximumLength: (buffer.len() * mem::size_of::<u16>()) as u16,
            Buffer: buffer.as_mut_ptr(),
        };
        nt::check(
            RtlExpandEnvironmentStrings_U(
                ptr::null_mut(),
                &mut source_string,
                &mut expanded,
                ptr::null_mut(),
            ),
            "RtlExpandEnvironmentStrings_U",
        )?;

        Ok(NtImagePath {
            buffer,
            length: expanded.Length,
        })
    }
}

/// Creates the delete-on-close backing file for the received image, sized so
/// a mapping view can be created over it.
pub fn create_temporary_image(image_size: u32, image_path: &mut NtImagePath) -> Result<OwnedHandle> {
    let mut path = image_path.unicode();

    let mut obj_attr: OBJECT_ATTRIBUTES = unsafe { mem::zeroed() };
    obj_attr.Length = mem::size_of::<OBJECT_ATTRIBUTES>() as u32;
    obj_attr.ObjectName = &mut path;

    let mut isb: IO_STATUS_BLOCK = unsafe { mem::zeroed() };
    let mut file_size: LARGE_INTEGER = unsafe { mem::zeroed() };
    unsafe { *file_size.QuadPart_mut() = i64::from(image_size) };

    let mut handle: HANDLE = ptr::null_mut();
    unsafe {
        nt::check(
            NtCreateFile(
                &mut handle,
                DELETE | FILE_GENERIC_READ | FILE_GENERIC_WRITE,
                &mut obj_attr,
                &mut isb,
                &mut file_size,
                FILE_ATTRIBUTE_TEMPORARY,
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                FILE_OVERWRITE_IF,
                FILE_SYNCHRONOUS_IO_NONALERT | FILE_DELETE_ON_CLOSE,
                ptr::null_mut(),
                0,
            ),
            "NtCreateFile",
        )?;
    }
    let handle = OwnedHandle::from_raw(handle);

    // Mark the temporary file for deletion.
    let mut disposition = FILE_DISPOSITION_INFORMATION { DeleteFile: 1 };
    unsafe {
        nt::check(
            NtSetInformationFile(
                handle.as_raw(),
                &mut isb,
                &mut disposition as *mut _ as *mut _,
                mem::size_of::<FILE_DISPOSITION_INFORMATION>() as u32,
                FileDispositionInformation,
            ),
            "NtSetInformationFile(FileDispositionInformation)",
        )?;
    }

    // Give the file its final size up front; an empty file cannot back a
    // mapping view.
    let mut end_of_file = FILE_END_OF_FILE_INFORMATION {
        EndOfFile: file_size,
    };
    unsafe {
        nt::check(
            NtSetInformationFile(
                handle.as_raw(),
                &mut isb,
                &mut end_of_file as *mut _ as *mut _,
                mem::size_of::<FILE_END_OF_FILE_INFORMATION>() as u32,
                FileEndOfFileInformation,
            ),
            "NtSetInformationFile(FileEndOfFileInformation)",
        )?;
    }

    Ok(handle)
}

pub struct ImageView {
    pub mapping: OwnedHandle,
    pub view: MappedView,
}

pub fn create_image_view(image_file: HANDLE, view_size: u32) -> Result<ImageView> {
    unsafe {
        let mapping = CreateFileMappingW(
            image_file,
            ptr::null_mut(),
            PAGE_READWRITE,
            0, // high-order DWORD of the mapping size (0 maps the whole file)
            0, // low-order DWORD of the mapping size
            ptr::null(),
        );
        if mapping.is_null() {
            bail!("CreateFileMappingW failed with error {}", GetLastError());
        }
        let mapping = OwnedHandle::from_raw(mapping);

        let view = MapViewOfFile(mapping.as_raw(), FILE_MAP_ALL_ACCESS, 0, 0, view_size as usize);
        if view.is_null() {
            bail!("MapViewOfFile failed with error {}", GetLastError());
        }

        Ok(ImageView {
            mapping,
            view: MappedView::from_raw(view),
        })
    }
}
