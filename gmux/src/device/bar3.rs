//! Device-wide BAR3 shadow.
//!
//! BAR3 is the RAMIN aperture guests use to author channel control
//! structures. The mediator owns the physical window and gives each guest
//! a fixed slice of it: guest BAR3 page tables are folded into one shared
//! device-side table, and — when BAR3 remapping is enabled — the guest's
//! physmap is edited through the hypervisor so its BAR3 pages alias the
//! host aperture directly. Pages the engine itself shadows (tracked in the
//! guest's barrier table) are deliberately left unmapped so their writes
//! keep trapping into the mediator.

use crate::aspace::AddressSpace;
use crate::barrier::BarrierTable;
use crate::hypervisor::Hypervisor;
use crate::mmio::Mmio;
use crate::page_table::{
    PageDirectory, PageEntry, LARGE_PAGE_COUNT, LARGE_PAGE_SIZE, PAGE_SHIFT, PAGE_SIZE,
    SMALL_PAGE_COUNT, SMALL_PAGE_SIZE,
};
use crate::vram::{ArenaRef, Page};
use crate::{BAR3_ARENA_SIZE, BAR3_TOTAL_SIZE};

pub struct DeviceBar3 {
    /// Host-physical base of the BAR3 aperture.
    address: u64,
    size: u64,
    ramin: Page,
    directory: Page,
    entries: Page,
    /// Per small page: the guest-physical address currently mapped, 0 if
    /// none. Used to rewire barrier-tracked pages on RAMIN moves.
    software: Vec<u64>,
    large: Vec<PageEntry>,
    small: Vec<PageEntry>,
    remapping: bool,
}

impl DeviceBar3 {
    pub fn new(
        mmio: &mut Mmio,
        arena: &ArenaRef,
        address: u64,
        size: u64,
        remapping: bool,
    ) -> DeviceBar3 {
        let entry_pages = (BAR3_TOTAL_SIZE / PAGE_SIZE * 8 / PAGE_SIZE) as usize;
        let bar3 = DeviceBar3 {
            address,
            size,
            ramin: Page::new(arena, 1),
            directory: Page::new(arena, 8),
            entries: Page::new(arena, entry_pages),
            software: vec![0; (BAR3_TOTAL_SIZE / PAGE_SIZE) as usize],
            large: vec![PageEntry::default(); (BAR3_TOTAL_SIZE / LARGE_PAGE_SIZE) as usize],
            small: vec![PageEntry::default(); (BAR3_TOTAL_SIZE / SMALL_PAGE_SIZE) as usize],
            remapping,
        };
        bar3.ramin.clear(mmio);
        bar3.directory.clear(mmio);
        bar3.entries.clear(mmio);

        bar3.ramin.write64(mmio, 0x0200, bar3.directory.address());
        bar3.ramin.write64(mmio, 0x0208, BAR3_TOTAL_SIZE - 1);

        bar3.directory.write32(mmio, 0x0, 0);
        bar3.directory
            .write32(mmio, 0x4, ((bar3.entries.address() >> 8) | 0x1) as u32);
        bar3.refresh(mmio);
        bar3
    }

    pub fn directory_address(&self) -> u64 {
        self.directory.address()
    }

    pub fn aperture_size(&self) -> u64 {
        self.size
    }

    /// Point the hardware BAR3 channel at the shadow RAMIN.
    pub fn refresh(&self, mmio: &mut Mmio) {
        mmio.write32(0x001714, 0xc000_0000 | (self.ramin.address() >> 12) as u32);
    }

    pub fn flush(&self, mmio: &mut Mmio) {
        let engine = 1 | 4;
        mmio.write32(0x100cb8, (self.directory.address() >> 8) as u32);
        mmio.write32(0x100cbc, 0x8000_0000 | engine);
    }

    // ── hypervisor physmap edits ───────────────────────────────

    fn map_guest_pages(
        &self,
        hv: &mut dyn Hypervisor,
        aspace: AddressSpace,
        bar3_base: u64,
        offset: u64,
        count: u64,
    ) {
        let guest = bar3_base + offset;
        let host = self.address + aspace.id as u64 * BAR3_ARENA_SIZE + offset;
        if self.remapping {
            hv.add_memory_mapping(
                aspace.domid,
                guest >> PAGE_SHIFT,
                host >> PAGE_SHIFT,
                count,
            );
        }
    }

    fn unmap_guest_pages(
        &self,
        hv: &mut dyn Hypervisor,
        aspace: AddressSpace,
        bar3_base: u64,
        offset: u64,
        count: u64,
    ) {
        let guest = bar3_base + offset;
        let host = self.address + aspace.id as u64 * BAR3_ARENA_SIZE + offset;
        if self.remapping {
            hv.remove_memory_mapping(
                aspace.domid,
                guest >> PAGE_SHIFT,
                host >> PAGE_SHIFT,
                count,
            );
        }
    }

    fn map(&mut self, mmio: &mut Mmio, index: u64, entry: PageEntry) {
        self.entries.write32(mmio, 8 * index, entry.word0());
        self.entries.write32(mmio, 8 * index + 4, entry.word1());
        self.software[index as usize] = if entry.present() {
            (entry.address() as u64) << PAGE_SHIFT
        } else {
            0
        };
    }

    /// Rebuild this guest's slice of the shared table and remap its BAR3
    /// pages, skipping any page the engine shadows.
    pub fn shadow(
        &mut self,
        mmio: &mut Mmio,
        hv: &mut dyn Hypervisor,
        aspace: AddressSpace,
        barrier: &BarrierTable,
        bar3_base: u64,
    ) {
        log::debug!("{} BAR3 shadowed", aspace.id);
        self.unmap_guest_pages(hv, aspace, bar3_base, 0, BAR3_ARENA_SIZE / PAGE_SIZE);

        let mut offset = 0;
        while offset < BAR3_ARENA_SIZE {
            let virt = aspace.id as u64 * BAR3_ARENA_SIZE + offset;
            let index = virt / PAGE_SIZE;
            match self.resolve_entry(aspace, offset) {
                Some((gphys, entry)) => {
                    self.map(mmio, index, entry);
                    if !barrier.tracked(gphys) {
                        self.map_guest_pages(hv, aspace, bar3_base, offset, 1);
                    }
                }
                None => {
                    self.map(mmio, index, PageEntry::default());
                }
            }
            offset += PAGE_SIZE;
        }
    }

    /// After a channel's RAMIN moved, re-expose the page that stopped
    /// being shadowed and hide the one that now is.
    pub fn reset_barrier(
        &self,
        hv: &mut dyn Hypervisor,
        aspace: AddressSpace,
        bar3_base: u64,
        old: u64,
        new: u64,
        old_remap: bool,
    ) {
        let shift = aspace.id as u64 * BAR3_ARENA_SIZE / PAGE_SIZE;
        for index in 0..BAR3_ARENA_SIZE / PAGE_SIZE {
            let target = self.software[(shift + index) as usize];
            if target == old && old_remap {
                self.map_guest_pages(hv, aspace, bar3_base, index * PAGE_SIZE, 1);
            } else if target == new {
                self.unmap_guest_pages(hv, aspace, bar3_base, index * PAGE_SIZE, 1);
            }
        }
    }

    /// Rescan this guest's BAR3 page directory into the software arrays.
    pub fn refresh_table(
        &mut self,
        mmio: &mut Mmio,
        hv: &mut dyn Hypervisor,
        aspace: AddressSpace,
        phys: u64,
    ) {
        if phys == 0 {
            return;
        }

        let dir = PageDirectory::load(|a| mmio.read_host32(a), phys);

        let large_shift = (aspace.id as u64 * BAR3_ARENA_SIZE / LARGE_PAGE_SIZE) as usize;
        let large_span = (BAR3_ARENA_SIZE / LARGE_PAGE_SIZE) as usize;
        if dir.large_present() {
            let address = aspace.to_host((dir.large_address() as u64) << PAGE_SHIFT);
            let count = large_span.min(dir.large_entry_count());
            debug_assert!(count <= LARGE_PAGE_COUNT);
            for i in 0..count {
                let item = 8 * i as u64;
                self.large[large_shift + i] =
                    match PageEntry::load(|a| mmio.read_host32(a), address + item) {
                        Some(entry) => aspace.translate_entry(entry, hv),
                        None => PageEntry::default(),
                    };
            }
        } else {
            self.large[large_shift..large_shift + large_span].fill(PageEntry::default());
        }

        let small_shift = (aspace.id as u64 * BAR3_ARENA_SIZE / SMALL_PAGE_SIZE) as usize;
        let small_span = (BAR3_ARENA_SIZE / SMALL_PAGE_SIZE) as usize;
        if dir.small_present() {
            let address = aspace.to_host((dir.small_address() as u64) << PAGE_SHIFT);
            debug_assert!(small_span <= SMALL_PAGE_COUNT);
            for i in 0..small_span {
                let item = 8 * i as u64;
                self.small[small_shift + i] =
                    match PageEntry::load(|a| mmio.read_host32(a), address + item) {
                        Some(entry) => aspace.translate_entry(entry, hv),
                        None => PageEntry::default(),
                    };
            }
        } else {
            self.small[small_shift..small_shift + small_span].fill(PageEntry::default());
        }
    }

    /// Resolve a guest BAR3 offset to a host-physical address.
    pub fn resolve(&self, aspace: AddressSpace, gvaddr: u64) -> Option<u64> {
        self.resolve_entry(aspace, gvaddr).map(|(addr, _)| addr)
    }

    fn resolve_entry(&self, aspace: AddressSpace, gvaddr: u64) -> Option<(u64, PageEntry)> {
        if gvaddr >= BAR3_ARENA_SIZE {
            return None;
        }
        let hvaddr = gvaddr + aspace.id as u64 * BAR3_ARENA_SIZE;
        {
            let index = (hvaddr / SMALL_PAGE_SIZE) as usize;
            let rest = hvaddr % SMALL_PAGE_SIZE;
            if let Some(entry) = self.small.get(index) {
                if entry.present() {
                    return Some((((entry.address() as u64) << PAGE_SHIFT) + rest, *entry));
                }
            }
        }
        {
            let index = (hvaddr / LARGE_PAGE_SIZE) as usize;
            let rest = hvaddr % LARGE_PAGE_SIZE;
            if let Some(entry) = self.large.get(index) {
                if entry.present() {
                    return Some((((entry.address() as u64) << PAGE_SHIFT) + rest, *entry));
                }
            }
        }
        None
    }

    /// Apply one paravirt PTE update.
    pub fn pv_reflect(
        &mut self,
        mmio: &mut Mmio,
        hv: &mut dyn Hypervisor,
        aspace: AddressSpace,
        barrier: &BarrierTable,
        bar3_base: u64,
        index: u32,
        guest_raw: u64,
        host_raw: u64,
    ) {
        let hindex = index as u64 + aspace.id as u64 * BAR3_ARENA_SIZE / PAGE_SIZE;
        let goffset = index as u64 * PAGE_SIZE;

        let gentry = PageEntry(guest_raw);
        self.small[hindex as usize] = if gentry.present() {
            aspace.translate_entry(gentry, hv)
        } else {
            PageEntry::default()
        };

        let entry = PageEntry(host_raw);
        if host_raw != 0 {
            let gphys = (entry.address() as u64) << PAGE_SHIFT;
            self.map(mmio, hindex, entry);
            if !barrier.tracked(gphys) {
                self.map_guest_pages(hv, aspace, bar3_base, goffset, 1);
            } else {
                self.unmap_guest_pages(hv, aspace, bar3_base, goffset, 1);
            }
        } else {
            self.map(mmio, hindex, entry);
            self.unmap_guest_pages(hv, aspace, bar3_base, goffset, 1);
        }
    }

    /// Apply a contiguous burst of paravirt PTE updates, coalescing
    /// adjacent map/unmap runs into single hypervisor calls.
    #[allow(clippy::too_many_arguments)]
    pub fn pv_reflect_batch(
        &mut self,
        mmio: &mut Mmio,
        hv: &mut dyn Hypervisor,
        aspace: AddressSpace,
        barrier: &BarrierTable,
        bar3_base: u64,
        index: u32,
        first: u64,
        stride: u64,
        count: u32,
    ) {
        let mut mode: Option<bool> = None; // Some(true)=mapping run, Some(false)=unmapping run
        let mut run_start = 0u64;
        let mut run_len = 0u64;
        let mut guest = first;

        for i in 0..count {
            let hindex = (index + i) as u64 + aspace.id as u64 * BAR3_ARENA_SIZE / PAGE_SIZE;
            let goffset = (index + i) as u64 * PAGE_SIZE;
            let gentry = PageEntry(guest);
            self.small[hindex as usize] = if gentry.present() {
                aspace.translate_entry(gentry, hv)
            } else {
                PageEntry::default()
            };
            let entry = aspace.translate_entry(gentry, hv);
            self.map(mmio, hindex, entry);
            guest = guest.wrapping_add(stride);

            let mappable = entry.0 != 0
                && !barrier.tracked((entry.address() as u64) << PAGE_SHIFT);
            if mappable {
                match mode {
                    Some(true) => {
                        run_len += 1;
                        continue;
                    }
                    Some(false) => {
                        self.unmap_guest_pages(hv, aspace, bar3_base, run_start, run_len)
                    }
                    None => {}
                }
                mode = Some(true);
                run_start = goffset;
                run_len = 1;
            } else {
                match mode {
                    Some(false) => {
                        run_len += 1;
                        continue;
                    }
                    Some(true) => {
                        self.map_guest_pages(hv, aspace, bar3_base, run_start, run_len)
                    }
                    None => {}
                }
                mode = Some(false);
                run_start = goffset;
                run_len = 1;
            }
        }

        match mode {
            Some(true) => self.map_guest_pages(hv, aspace, bar3_base, run_start, run_len),
            Some(false) => self.unmap_guest_pages(hv, aspace, bar3_base, run_start, run_len),
            None => {}
        }
    }
}
