use std::{mem, slice};

use netfork_common::{
    proto::{Record, RegionInfo, SubregionInfo},
    tracing::{debug, warn},
    winapi::um::{
        errhandlingapi::GetLastError,
        memoryapi::{VirtualProtectEx, VirtualQuery},
        processthreadsapi::GetCurrentProcess,
        winnt::{
            MEMORY_BASIC_INFORMATION, MEM_FREE, PAGE_EXECUTE_READWRITE, PAGE_GUARD, PAGE_NOACCESS,
        },
    },
};

/// Streaming enumeration of the calling process's address space.
///
/// Walks the virtual memory map by successive queries at increasing base
/// addresses and yields, for every allocation accepted by the filter, one
/// [`Record::Region`], then a [`Record::Subregion`] per commit/protection
/// unit, then [`Record::Bytes`] for each subregion whose protection allows
/// reading. Free regions are skipped entirely.
pub struct Snapshot<F> {
    address: usize,
    filter: F,
    current: Option<RegionWalk>,
    guard: Option<RelaxedProtection>,
}

struct RegionWalk {
    info: RegionInfo,
    subregions: Vec<SubregionInfo>,
    next_subregion: usize,
    stage: Stage,
}

enum Stage {
    Region,
    Subregion,
    Bytes,
}

impl<F: FnMut(&MEMORY_BASIC_INFORMATION) -> bool> Snapshot<F> {
    pub fn new(filter: F) -> Self {
        Self {
            address: 0,
            filter,
            current: None,
            guard: None,
        }
    }

    /// Produces the next record. The bytes of a readable subregion are
    /// yielded behind a temporary protection relaxation that is undone on
    /// the following call (or when the snapshot is dropped).
    pub fn next(&mut self) -> Option<Record<'_>> {
        self.guard = None;

        loop {
            let Some(walk) = self.current.as_mut() else {
                self.current = Some(self.next_region()?);
                continue;
            };

            match walk.stage {
                Stage::Region => {
                    walk.stage = Stage::Subregion;
                    return Some(Record::Region(walk.info));
                }
                Stage::Subregion => {
                    let Some(subregion) = walk.subregions.get(walk.next_subregion).copied()
                    else {
                        self.current = None;
                        continue;
                    };

                    debug!("subregion {subregion:?}");
                    walk.stage = Stage::Bytes;
                    return Some(Record::Subregion(subregion));
                }
                Stage::Bytes => {
                    let subregion = walk.subregions[walk.next_subregion];
                    walk.next_subregion += 1;
                    walk.stage = Stage::Subregion;

                    // Reserved-only and unreadable blocks carry no body.
                    if subregion.protect == 0
                        || subregion.protect & (PAGE_NOACCESS | PAGE_GUARD) != 0
                    {
                        continue;
                    }

                    self.guard = Some(RelaxedProtection::relax(&subregion));
                    let bytes = unsafe {
                        slice::from_raw_parts(
                            subregion.base_address as *const u8,
                            subregion.region_size,
                        )
                    };
                    return Some(Record::Bytes(bytes));
                }
            }
        }
    }

    fn next_region(&mut self) -> Option<RegionWalk> {
        loop {
            let mut mbi: MEMORY_BASIC_INFORMATION = unsafe { mem::zeroed() };
            let queried = unsafe {
                VirtualQuery(
                    self.address as *const _,
                    &mut mbi,
                    mem::size_of::<MEMORY_BASIC_INFORMATION>(),
                )
            };
            if queried == 0 {
                return None;
            }

            self.address += mbi.RegionSize;

            if mbi.State == MEM_FREE || !(self.filter)(&mbi) {
                continue;
            }

            let mut info = RegionInfo {
                base_address: mbi.AllocationBase as usize,
                protect: mbi.AllocationProtect,
                allocation_size: mbi.RegionSize,
                subregion_info_size: 0,
            };
            let mut subregions = vec![SubregionInfo {
                base_address: mbi.BaseAddress as usize,
                region_size: mbi.RegionSize,
                protect: mbi.Protect,
            }];

            // Subregions are discovered by walking forward while the
            // allocation base stays unchanged.
            let allocation_base = mbi.AllocationBase;
            loop {
                let mut mbi: MEMORY_BASIC_INFORMATION = unsafe { mem::zeroed() };
                let queried = unsafe {
                    VirtualQuery(
                        self.address as *const _,
                        &mut mbi,
                        mem::size_of::<MEMORY_BASIC_INFORMATION>(),
                    )
                };
                if queried == 0 || mbi.AllocationBase != allocation_base {
                    break;
                }

                subregions.push(SubregionInfo {
                    base_address: mbi.BaseAddress as usize,
                    region_size: mbi.RegionSize,
                    protect: mbi.Protect,
                });
                info.allocation_size += mbi.RegionSize;
                self.address += mbi.RegionSize;
            }

            info.subregion_info_size = subregions.len();
            debug!("region {info:?}");

            return Some(RegionWalk {
                info,
                subregions,
                next_subregion: 0,
                stage: Stage::Region,
            });
        }
    }
}

// Widens a subregion to RWX so its bytes can be read out, and restores the
// recorded protection when dropped. A failed relaxation is logged; the
// restore still runs.
struct RelaxedProtection {
    base_address: usize,
    region_size: usize,
    protect: u32,
}

impl RelaxedProtection {
    fn relax(subregion: &SubregionInfo) -> Self {
        let mut old_protect = 0u32;
        let ok = unsafe {
            VirtualProtectEx(
                GetCurrentProcess(),
                subregion.base_address as *mut _,
                subregion.region_size,
                PAGE_EXECUTE_READWRITE,
                &mut old_protect,
            )
        };
        if ok == 0 {
            warn!(
                "failed to relax protection to RWX at {:#x}: error {}",
                subregion.base_address,
                unsafe { GetLastError() },
            );
        }

        Self {
            base_address: subregion.base_address,
            region_size: subregion.region_size,
            protect: subregion.protect,
        }
    }
}

impl Drop for RelaxedProtection {
    fn drop(&mut self) {
        let mut old_protect = 0u32;
        unsafe {
            VirtualProtectEx(
                GetCurrentProcess(),
                self.base_address as *mut _,
                self.region_size,
                self.protect,
                &mut old_protect,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::ptr;

    use netfork_common::winapi::um::{
        memoryapi::{VirtualAlloc, VirtualFree},
        winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READONLY, PAGE_READWRITE},
    };

    use super::*;

    const PAGE: usize = 0x1000;

    #[derive(Debug, PartialEq)]
    enum Seen {
        Region(RegionInfo),
        Subregion(SubregionInfo),
        Bytes(usize),
    }

    #[test]
    fn emits_region_grammar_and_restores_protection() {
        unsafe {
            let base = VirtualAlloc(ptr::null_mut(), 4 * PAGE, MEM_RESERVE, PAGE_READWRITE);
            assert!(!base.is_null());
            assert!(!VirtualAlloc(base, 2 * PAGE, MEM_COMMIT, PAGE_READWRITE).is_null());
            let readonly = (base as usize + 2 * PAGE) as *mut _;
            assert!(!VirtualAlloc(readonly, PAGE, MEM_COMMIT, PAGE_READONLY).is_null());

            let data = slice::from_raw_parts_mut(base as *mut u8, 2 * PAGE);
            for (i, byte) in data.iter_mut().enumerate() {
                *byte = (i % 251) as u8;
            }

            let target = base as usize;
            let mut snapshot = Snapshot::new(move |mbi: &MEMORY_BASIC_INFORMATION| {
                mbi.AllocationBase as usize == target
            });

            let mut seen = vec![];
            while let Some(record) = snapshot.next() {
                seen.push(match record {
                    Record::Region(info) => Seen::Region(info),
                    Record::Subregion(info) => Seen::Subregion(info),
                    Record::Bytes(bytes) => {
                        if bytes.len() == 2 * PAGE {
                            assert!(bytes.iter().enumerate().all(|(i, b)| *b == (i % 251) as u8));
                        }
                        Seen::Bytes(bytes.len())
                    }
                });
            }
            drop(snapshot);

            assert_eq!(
                seen,
                vec![
                    Seen::Region(RegionInfo {
                        base_address: target,
                        protect: PAGE_READWRITE,
                        allocation_size: 4 * PAGE,
                        subregion_info_size: 3,
                    }),
                    Seen::Subregion(SubregionInfo {
                        base_address: target,
                        region_size: 2 * PAGE,
                        protect: PAGE_READWRITE,
                    }),
                    Seen::Bytes(2 * PAGE),
                    Seen::Subregion(SubregionInfo {
                        base_address: target + 2 * PAGE,
                        region_size: PAGE,
                        protect: PAGE_READONLY,
                    }),
                    Seen::Bytes(PAGE),
                    // Reserved tail: descriptor only, no body.
                    Seen::Subregion(SubregionInfo {
                        base_address: target + 3 * PAGE,
                        region_size: PAGE,
                        protect: 0,
                    }),
                ]
            );

            // The RWX relaxation must be transparent.
            let mut mbi: MEMORY_BASIC_INFORMATION = mem::zeroed();
            VirtualQuery(
                readonly,
                &mut mbi,
                mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            );
            assert_eq!(mbi.Protect, PAGE_READONLY);

            VirtualFree(base, 0, MEM_RELEASE);
        }
    }
}
