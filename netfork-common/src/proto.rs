use std::fmt;

use ntapi::ntpebteb::{PEB, TEB};
use winapi::um::winnt::CONTEXT;

/// Marker for records shipped over the wire as verbatim copies of their
/// in-memory representation.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` plain data for which every bit pattern
/// is a valid value. Both peers are assumed to share word size, endianness,
/// and struct layout; raw pointer fields travel as opaque addresses.
pub unsafe trait Wire: Copy + Sized {}

/// One contiguous virtual-address reservation, as reported by the memory
/// query. Followed on the wire by exactly `subregion_info_size`
/// [`SubregionInfo`] records in address order.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    /// Allocation base of the region.
    pub base_address: usize,
    /// Allocation-wide memory protection flags.
    pub protect: u32,
    /// Total size of the region in bytes.
    pub allocation_size: usize,
    /// Number of `SubregionInfo` records that follow.
    pub subregion_info_size: usize,
}

/// One commit/protection unit inside a region. `base_address` lies within
/// `[region.base_address, region.base_address + region.allocation_size)`.
/// Raw bytes follow on the wire unless the protection is zero or carries the
/// no-access or guard-page bits.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SubregionInfo {
    /// Base address of the subregion.
    pub base_address: usize,
    /// Subregion size in bytes.
    pub region_size: usize,
    /// Current memory protection flags.
    pub protect: u32,
}

impl fmt::Debug for RegionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionInfo")
            .field("base_address", &format_args!("{:#x}", self.base_address))
            .field("protect", &format_args!("{:#x}", self.protect))
            .field("allocation_size", &format_args!("{:#x}", self.allocation_size))
            .field("subregion_info_size", &self.subregion_info_size)
            .finish()
    }
}

impl fmt::Debug for SubregionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubregionInfo")
            .field("base_address", &format_args!("{:#x}", self.base_address))
            .field("region_size", &format_args!("{:#x}", self.region_size))
            .field("protect", &format_args!("{:#x}", self.protect))
            .finish()
    }
}

/// A single item produced by the snapshot iterator: a region header, a
/// subregion header, or the raw bytes of a readable subregion.
pub enum Record<'a> {
    Region(RegionInfo),
    Subregion(SubregionInfo),
    Bytes(&'a [u8]),
}

unsafe impl Wire for RegionInfo {}
unsafe impl Wire for SubregionInfo {}
unsafe impl Wire for u32 {}
unsafe impl Wire for CONTEXT {}
unsafe impl Wire for PEB {}
unsafe impl Wire for TEB {}

#[cfg(test)]
mod tests {
    use std::mem::size_of;

    use super::*;

    // The records are fixed-layout: pointer-sized fields plus a 32-bit
    // protection word, padded to pointer alignment.
    #[test]
    fn record_layout_is_fixed() {
        assert_eq!(size_of::<RegionInfo>(), 4 * size_of::<usize>());
        assert_eq!(size_of::<SubregionInfo>(), 3 * size_of::<usize>());
    }
}
