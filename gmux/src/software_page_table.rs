//! Software page tables.
//!
//! The BAR1 and BAR3 windows need the engine to *resolve* guest offsets to
//! guest-physical pages, not to hand the device a table. This mirror keeps
//! the decoded (and already host-translated) entries in plain memory, with
//! no VRAM behind it. It also accepts paravirt reflections: a cooperating
//! guest pushes individual entry updates instead of forcing a rescan.

use crate::aspace::AddressSpace;
use crate::hypervisor::Hypervisor;
use crate::mmio::Mmio;
use crate::page_table::{
    PageDirectory, PageEntry, LARGE_PAGE_COUNT, LARGE_PAGE_SIZE, MAX_PAGE_DIRECTORIES,
    PAGE_DIRECTORY_COVERED_SIZE, PAGE_SHIFT, SMALL_PAGE_COUNT, SMALL_PAGE_SIZE,
};
use crate::pv::PvPage;

#[derive(Default)]
struct SoftwareDirectory {
    large: Option<Vec<PageEntry>>,
    small: Option<Vec<PageEntry>>,
}

impl SoftwareDirectory {
    fn refresh(
        &mut self,
        mmio: &mut Mmio,
        hv: &mut dyn Hypervisor,
        aspace: AddressSpace,
        dir: PageDirectory,
        remain: u64,
    ) {
        if dir.large_present() {
            let address = aspace.to_host((dir.large_address() as u64) << PAGE_SHIFT);
            let entries = self
                .large
                .get_or_insert_with(|| vec![PageEntry::default(); LARGE_PAGE_COUNT]);
            let count = (remain / LARGE_PAGE_SIZE).min(dir.large_entry_count() as u64);
            for i in 0..count {
                let item = 8 * i;
                entries[i as usize] =
                    match PageEntry::load(|a| mmio.read_host32(a), address + item) {
                        Some(entry) => aspace.translate_entry(entry, hv),
                        None => PageEntry::default(),
                    };
            }
        } else {
            self.large = None;
        }

        if dir.small_present() {
            let address = aspace.to_host((dir.small_address() as u64) << PAGE_SHIFT);
            let entries = self
                .small
                .get_or_insert_with(|| vec![PageEntry::default(); SMALL_PAGE_COUNT]);
            let count = remain / SMALL_PAGE_SIZE;
            for i in 0..count {
                let item = 8 * i;
                entries[i as usize] =
                    match PageEntry::load(|a| mmio.read_host32(a), address + item) {
                        Some(entry) => aspace.translate_entry(entry, hv),
                        None => PageEntry::default(),
                    };
            }
        } else {
            self.small = None;
        }
    }

    fn resolve(&self, offset: u64) -> Option<(u64, PageEntry)> {
        if let Some(small) = &self.small {
            let index = (offset / SMALL_PAGE_SIZE) as usize;
            let rest = offset % SMALL_PAGE_SIZE;
            if let Some(entry) = small.get(index) {
                if entry.present() {
                    return Some((((entry.address() as u64) << PAGE_SHIFT) + rest, *entry));
                }
            }
        }
        if let Some(large) = &self.large {
            let index = (offset / LARGE_PAGE_SIZE) as usize;
            let rest = offset % LARGE_PAGE_SIZE;
            if let Some(entry) = large.get(index) {
                if entry.present() {
                    return Some((((entry.address() as u64) << PAGE_SHIFT) + rest, *entry));
                }
            }
        }
        None
    }

    fn pv_reflect(
        &mut self,
        hv: &mut dyn Hypervisor,
        aspace: AddressSpace,
        big: bool,
        index: usize,
        guest_raw: u64,
    ) {
        let entry = PageEntry(guest_raw);
        let translated = if entry.present() {
            aspace.translate_entry(entry, hv)
        } else {
            PageEntry::default()
        };
        let entries = if big {
            self.large
                .get_or_insert_with(|| vec![PageEntry::default(); LARGE_PAGE_COUNT])
        } else {
            self.small
                .get_or_insert_with(|| vec![PageEntry::default(); SMALL_PAGE_COUNT])
        };
        if index < entries.len() {
            entries[index] = translated;
        }
    }

    fn pv_scan(&mut self, mmio: &mut Mmio, big: bool, pgt: &PvPage, remain: u64) {
        // Entries in a paravirt page table are already host form; copy
        // them in as-is.
        if big {
            let entries = self
                .large
                .get_or_insert_with(|| vec![PageEntry::default(); LARGE_PAGE_COUNT]);
            let count = (remain / LARGE_PAGE_SIZE).min(LARGE_PAGE_COUNT as u64);
            for i in 0..count {
                let item = 8 * i;
                entries[i as usize] =
                    PageEntry::load(|a| pgt.page().read32(mmio, a), item)
                        .unwrap_or_default();
            }
        } else {
            let entries = self
                .small
                .get_or_insert_with(|| vec![PageEntry::default(); SMALL_PAGE_COUNT]);
            let count = (remain / SMALL_PAGE_SIZE).min(SMALL_PAGE_COUNT as u64);
            for i in 0..count {
                let item = 8 * i;
                entries[i as usize] =
                    PageEntry::load(|a| pgt.page().read32(mmio, a), item)
                        .unwrap_or_default();
            }
        }
    }
}

pub struct SoftwarePageTable {
    directories: Vec<SoftwareDirectory>,
    size: u64,
    page_directory_address: u64,
    channel_id: i32,
    /// Non-zero for tables over a fixed window (BAR1/BAR3), where the size
    /// never follows the guest's page limit.
    predefined_max: u64,
}

impl SoftwarePageTable {
    pub fn new(channel_id: i32, para: bool, predefined_max: u64) -> SoftwarePageTable {
        let size = predefined_max;
        let mut table = SoftwarePageTable {
            directories: Vec::new(),
            size,
            page_directory_address: 0,
            channel_id,
            predefined_max,
        };
        if para {
            // paravirt reflections arrive before any scan
            let count = table.page_directory_count();
            table
                .directories
                .resize_with(count as usize, SoftwareDirectory::default);
        }
        table
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn page_directory_address(&self) -> u64 {
        self.page_directory_address
    }

    fn page_directory_count(&self) -> u64 {
        crate::page_table::round_up(self.size, PAGE_DIRECTORY_COVERED_SIZE)
            / PAGE_DIRECTORY_COVERED_SIZE
    }

    pub fn refresh(
        &mut self,
        mmio: &mut Mmio,
        hv: &mut dyn Hypervisor,
        aspace: AddressSpace,
        page_directory_address: u64,
        page_limit: u64,
    ) {
        self.page_directory_address = page_directory_address;
        if self.predefined_max == 0 {
            self.size = (page_limit + 1) & ((1u64 << 40) - 1);
        }
        if self.page_directory_count() > MAX_PAGE_DIRECTORIES {
            return;
        }
        self.refresh_page_directories(mmio, hv, aspace, page_directory_address);
    }

    pub fn refresh_page_directories(
        &mut self,
        mmio: &mut Mmio,
        hv: &mut dyn Hypervisor,
        aspace: AddressSpace,
        address: u64,
    ) {
        self.page_directory_address = address;
        let count = self.page_directory_count() as usize;
        self.directories
            .resize_with(count, SoftwareDirectory::default);

        let mut remain = self.size % PAGE_DIRECTORY_COVERED_SIZE;
        if remain == 0 {
            remain = PAGE_DIRECTORY_COVERED_SIZE;
        }
        for i in 0..count {
            let item = 8 * i as u64;
            let dir = PageDirectory::load(|a| mmio.read_host32(a), address + item);
            let span = if self.predefined_max != 0 && i + 1 == count {
                remain
            } else {
                PAGE_DIRECTORY_COVERED_SIZE
            };
            self.directories[i].refresh(mmio, hv, aspace, dir, span);
        }
        log::debug!(
            "scanned software table of channel {}: pd {:#x}, {} directories",
            self.channel_id,
            address,
            count
        );
    }

    /// Walk the mirror: guest-virtual offset to host-physical address.
    pub fn resolve(&self, virtual_address: u64) -> Option<u64> {
        self.resolve_entry(virtual_address).map(|(addr, _)| addr)
    }

    pub fn resolve_entry(&self, virtual_address: u64) -> Option<(u64, PageEntry)> {
        let index = (virtual_address / PAGE_DIRECTORY_COVERED_SIZE) as usize;
        let dir = self.directories.get(index)?;
        dir.resolve(virtual_address % PAGE_DIRECTORY_COVERED_SIZE)
    }

    /// Apply a single paravirt entry update without re-reading guest
    /// memory.
    pub fn pv_reflect_entry(
        &mut self,
        hv: &mut dyn Hypervisor,
        aspace: AddressSpace,
        dir: usize,
        big: bool,
        index: usize,
        guest_raw: u64,
    ) {
        if let Some(directory) = self.directories.get_mut(dir) {
            directory.pv_reflect(hv, aspace, big, index, guest_raw);
        }
    }

    /// Re-read one branch of one directory from a paravirt page table.
    pub fn pv_scan(&mut self, mmio: &mut Mmio, dir: usize, big: bool, pgt: &PvPage) {
        let remain = self.predefined_max;
        if let Some(directory) = self.directories.get_mut(dir) {
            directory.pv_scan(mmio, big, pgt, remain);
        }
    }
}
