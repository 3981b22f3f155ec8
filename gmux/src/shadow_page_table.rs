//! Shadow page tables.
//!
//! A channel's RAMIN names a guest-authored page directory. The device is
//! never pointed at it directly: the engine scans it and builds a shadow
//! copy in host VRAM with every address rewritten into the guest's window
//! (see `AddressSpace::translate_entry`). The GPU then walks the shadow.
//!
//! Rebuilds happen on every guest TLB flush, so the per-branch PTE pages
//! are pooled: a refresh resets the pool cursors and reuses the pages
//! allocated by earlier refreshes instead of churning the arena.

use crate::aspace::AddressSpace;
use crate::hypervisor::Hypervisor;
use crate::mmio::Mmio;
use crate::page_table::{
    PageDirectory, PageEntry, LARGE_PAGE_COUNT, PAGE_SHIFT, PAGE_SIZE, SMALL_PAGE_COUNT,
};
use crate::vram::{ArenaRef, Page};

/// The shadow page directory covers 8192 slots of 8 bytes.
const DIRECTORY_SPAN: u64 = 0x10000;
const DIRECTORY_PAGES: usize = (DIRECTORY_SPAN / PAGE_SIZE) as usize;

const LARGE_TABLE_PAGES: usize = LARGE_PAGE_COUNT * 8 / PAGE_SIZE as usize;
const SMALL_TABLE_PAGES: usize = SMALL_PAGE_COUNT * 8 / PAGE_SIZE as usize;

pub struct ShadowPageTable {
    channel_id: u32,
    /// Virtual-space size derived from the guest's page limit (40-bit).
    size: u64,
    page_directory_address: u64,
    /// The shadow page-directory page, allocated lazily.
    phys: Option<Page>,
    large_pool: Vec<Page>,
    small_pool: Vec<Page>,
    large_cursor: usize,
    small_cursor: usize,
}

impl ShadowPageTable {
    pub fn new(channel_id: u32) -> ShadowPageTable {
        ShadowPageTable {
            channel_id,
            size: 0,
            page_directory_address: 0,
            phys: None,
            large_pool: Vec::new(),
            small_pool: Vec::new(),
            large_cursor: 0,
            small_cursor: 0,
        }
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn page_directory_address(&self) -> u64 {
        self.page_directory_address
    }

    /// Host-physical address of the shadow page directory, 0 before the
    /// first refresh.
    pub fn shadow_address(&self) -> u64 {
        self.phys.as_ref().map(|p| p.address()).unwrap_or(0)
    }

    pub fn allocate_shadow(&mut self, arena: &ArenaRef, mmio: &mut Mmio) {
        if self.phys.is_none() {
            let page = Page::new(arena, DIRECTORY_PAGES);
            page.clear(mmio);
            self.phys = Some(page);
        }
    }

    pub fn refresh(
        &mut self,
        mmio: &mut Mmio,
        hv: &mut dyn Hypervisor,
        arena: &ArenaRef,
        aspace: AddressSpace,
        page_directory_address: u64,
        page_limit: u64,
    ) {
        self.allocate_shadow(arena, mmio);
        self.page_directory_address = page_directory_address;
        self.size = (page_limit + 1) & ((1u64 << 40) - 1);
        self.refresh_page_directories(mmio, hv, arena, aspace, page_directory_address);
    }

    pub fn refresh_page_directories(
        &mut self,
        mmio: &mut Mmio,
        hv: &mut dyn Hypervisor,
        arena: &ArenaRef,
        aspace: AddressSpace,
        address: u64,
    ) {
        self.page_directory_address = address;
        self.large_cursor = 0;
        self.small_cursor = 0;

        if aspace.to_guest(address) == 0 {
            return;
        }
        if !aspace.contains(address) || !aspace.fits(self.size) {
            log::debug!(
                "page directory out of range: {:#x} size {:#x}",
                address,
                self.size
            );
            return;
        }

        let mut offset = 0;
        while offset < DIRECTORY_SPAN {
            let dir = PageDirectory::load(|a| mmio.read_host32(a), address + offset);
            let result = self.refresh_directory(mmio, hv, arena, aspace, dir);
            let phys = self.phys.as_ref().expect("shadow directory allocated");
            phys.write32(mmio, offset, result.word0());
            phys.write32(mmio, offset + 4, result.word1());
            offset += 8;
        }
        log::debug!(
            "scanned page table of channel {}: pd {:#x}",
            self.channel_id,
            address
        );
    }

    fn refresh_directory(
        &mut self,
        mmio: &mut Mmio,
        hv: &mut dyn Hypervisor,
        arena: &ArenaRef,
        aspace: AddressSpace,
        dir: PageDirectory,
    ) -> PageDirectory {
        let mut result = dir;

        if dir.large_present() {
            let guest = aspace.to_host((dir.large_address() as u64) << PAGE_SHIFT);
            let page = pool_page(
                &mut self.large_pool,
                &mut self.large_cursor,
                arena,
                LARGE_TABLE_PAGES,
            );
            for i in 0..dir.large_entry_count() as u64 {
                let item = 8 * i;
                match PageEntry::load(|a| mmio.read_host32(a), guest + item) {
                    Some(entry) => {
                        let entry = aspace.translate_entry(entry, hv);
                        page.write32(mmio, item, entry.word0());
                        page.write32(mmio, item + 4, entry.word1());
                    }
                    None => page.write32(mmio, item, 0),
                }
            }
            result.set_large_address((page.address() >> PAGE_SHIFT) as u32);
        } else {
            result.clear_large();
        }

        if dir.small_present() {
            let guest = aspace.to_host((dir.small_address() as u64) << PAGE_SHIFT);
            let page = pool_page(
                &mut self.small_pool,
                &mut self.small_cursor,
                arena,
                SMALL_TABLE_PAGES,
            );
            for i in 0..SMALL_PAGE_COUNT as u64 {
                let item = 8 * i;
                match PageEntry::load(|a| mmio.read_host32(a), guest + item) {
                    Some(entry) => {
                        let entry = aspace.translate_entry(entry, hv);
                        page.write32(mmio, item, entry.word0());
                        page.write32(mmio, item + 4, entry.word1());
                    }
                    None => page.write32(mmio, item, 0),
                }
            }
            result.set_small_address((page.address() >> PAGE_SHIFT) as u32);
        } else {
            result.clear_small();
        }

        result
    }
}

/// Hand out the next pooled page, allocating when the pool runs dry. The
/// cursor resets on each full refresh; pool pages are never returned to
/// the arena between refreshes.
fn pool_page<'a>(
    pool: &'a mut Vec<Page>,
    cursor: &mut usize,
    arena: &ArenaRef,
    pages: usize,
) -> &'a Page {
    if *cursor == pool.len() {
        pool.push(Page::new(arena, pages));
    }
    let page = &pool[*cursor];
    *cursor += 1;
    page
}
