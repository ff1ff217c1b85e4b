use std::mem;

use netfork_common::{
    anyhow::{bail, Result},
    tracing::debug,
    winapi::um::winnt::{
        IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE, IMAGE_DOS_HEADER, IMAGE_DOS_SIGNATURE,
        IMAGE_NT_HEADERS64, IMAGE_NT_SIGNATURE, IMAGE_SECTION_HEADER, PVOID,
    },
};

/// Patches the received image in place so the loader reproduces the forked
/// process's virtual layout when it maps the file.
///
/// The received bytes are a virtual snapshot, not a file layout, so every
/// section's raw-data fields are overwritten with its virtual ones and the
/// preferred base is pinned to where the image lived in the forked process,
/// with dynamic relocation disabled so the loader honors it.
///
/// # Safety
///
/// `view` must point at a writable mapping of at least the image's size.
pub unsafe fn patch_image_for_execution(view: PVOID, image_base: u64) -> Result<()> {
    let dos_header = view as *const IMAGE_DOS_HEADER;
    if (*dos_header).e_magic != IMAGE_DOS_SIGNATURE {
        bail!("image has no DOS header");
    }

    let nt_headers = (view as usize + (*dos_header).e_lfanew as usize) as *mut IMAGE_NT_HEADERS64;
    if (*nt_headers).Signature != IMAGE_NT_SIGNATURE {
        bail!("image has no NT headers");
    }

    let optional_header = &mut (*nt_headers).OptionalHeader;
    optional_header.ImageBase = image_base;
    optional_header.DllCharacteristics &= !IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE;

    let section_headers =
        (nt_headers as usize + mem::size_of::<IMAGE_NT_HEADERS64>()) as *mut IMAGE_SECTION_HEADER;
    for section_index in 0..(*nt_headers).FileHeader.NumberOfSections as usize {
        let section_header = &mut *section_headers.add(section_index);

        debug!(
            "section {}: raw pointer {:#x} -> {:#x}, raw size {:#x} -> {:#x}",
            String::from_utf8_lossy(&section_header.Name),
            section_header.PointerToRawData,
            section_header.VirtualAddress,
            section_header.SizeOfRawData,
            *section_header.Misc.VirtualSize(),
        );

        section_header.PointerToRawData = section_header.VirtualAddress;
        section_header.SizeOfRawData = *section_header.Misc.VirtualSize();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use netfork_common::winapi::um::winnt::IMAGE_NT_OPTIONAL_HDR64_MAGIC;

    use super::*;

    const SECTIONS: [(u32, u32); 2] = [(0x1000, 0x1234), (0x3000, 0x80)];

    // Backing storage is u64 so the headers land on a properly aligned base.
    fn build_image() -> Vec<u64> {
        let mut buf = vec![0u64; 0x400];
        unsafe {
            let base = buf.as_mut_ptr() as *mut u8;
            let dos_header = base as *mut IMAGE_DOS_HEADER;
            (*dos_header).e_magic = IMAGE_DOS_SIGNATURE;
            (*dos_header).e_lfanew = 0x80;

            let nt_headers = base.add(0x80) as *mut IMAGE_NT_HEADERS64;
            (*nt_headers).Signature = IMAGE_NT_SIGNATURE;
            (*nt_headers).FileHeader.NumberOfSections = SECTIONS.len() as u16;
            (*nt_headers).OptionalHeader.Magic = IMAGE_NT_OPTIONAL_HDR64_MAGIC;
            (*nt_headers).OptionalHeader.ImageBase = 0x1_4000_0000;
            (*nt_headers).OptionalHeader.DllCharacteristics =
                IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE | 0x100;

            let section_headers = (nt_headers as usize + mem::size_of::<IMAGE_NT_HEADERS64>())
                as *mut IMAGE_SECTION_HEADER;
            for (i, (virtual_address, virtual_size)) in SECTIONS.iter().enumerate() {
                let section = &mut *section_headers.add(i);
                section.Name = *b".sect\0\0\0";
                section.VirtualAddress = *virtual_address;
                *section.Misc.VirtualSize_mut() = *virtual_size;
                section.PointerToRawData = 0x400 + i as u32 * 0x200;
                section.SizeOfRawData = 0x200;
            }
        }
        buf
    }

    #[test]
    fn pins_base_and_rewrites_section_layout() {
        let mut image = build_image();
        let view = image.as_mut_ptr() as PVOID;

        unsafe {
            patch_image_for_execution(view, 0x7ff6_1000_0000).unwrap();

            let dos_header = view as *const IMAGE_DOS_HEADER;
            let nt_headers =
                (view as usize + (*dos_header).e_lfanew as usize) as *const IMAGE_NT_HEADERS64;
            assert_eq!((*nt_headers).OptionalHeader.ImageBase, 0x7ff6_1000_0000);
            assert_eq!(
                (*nt_headers).OptionalHeader.DllCharacteristics
                    & IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE,
                0
            );
            // Unrelated characteristics survive the patch.
            assert_eq!((*nt_headers).OptionalHeader.DllCharacteristics & 0x100, 0x100);

            let section_headers = (nt_headers as usize + mem::size_of::<IMAGE_NT_HEADERS64>())
                as *const IMAGE_SECTION_HEADER;
            for (i, (virtual_address, virtual_size)) in SECTIONS.iter().enumerate() {
                let section = &*section_headers.add(i);
                assert_eq!(section.PointerToRawData, *virtual_address);
                assert_eq!(section.SizeOfRawData, *virtual_size);
            }
        }
    }

    #[test]
    fn rejects_bytes_without_headers() {
        let mut garbage = vec![0u64; 0x100];
        let result = unsafe { patch_image_for_execution(garbage.as_mut_ptr() as PVOID, 0) };
        assert!(result.is_err());
    }
}
