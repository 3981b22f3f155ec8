//! Device-wide BAR1 shadow channel.
//!
//! The real BAR1 channel belongs to the mediator, not to any guest. Its
//! RAMIN, page directory and page table are built once at startup; guest
//! BAR1 layouts are folded into the shared page table by `shadow`, one
//! poll-area slot per physical channel, so every guest's doorbell pages
//! appear at that guest's slice of the window.

use crate::aspace::AddressSpace;
use crate::chipset::{Card, Chipset};
use crate::mmio::Mmio;
use crate::page_table::{PageEntry, PAGE_DIRECTORY_COVERED_SIZE, SMALL_PAGE_SIZE};
use crate::software_page_table::SoftwarePageTable;
use crate::vram::{ArenaRef, Page};
use crate::DOMAIN_CHANNELS;

pub struct DeviceBar1 {
    ramin: Page,
    directory: Page,
    entry: Page,
    /// Bytes of BAR1 window per channel (chipset-dependent).
    range: u64,
}

impl DeviceBar1 {
    pub fn new(mmio: &mut Mmio, arena: &ArenaRef, chipset: &Chipset) -> DeviceBar1 {
        let bar1 = DeviceBar1 {
            ramin: Page::new(arena, 1),
            directory: Page::new(arena, 8),
            entry: Page::new(arena, 1),
            range: match chipset.card() {
                Card::Nvc0 => 0x1000,
                Card::Nve0 => 0x200,
            },
        };
        bar1.ramin.clear(mmio);
        bar1.directory.clear(mmio);
        bar1.entry.clear(mmio);

        // channel RAMIN points at our own directory
        bar1.ramin.write64(mmio, 0x0200, bar1.directory.address());
        bar1.ramin.write32(mmio, 0x0208, 0xffff_ffff);
        bar1.ramin.write32(mmio, 0x020c, 0x0000_00ff);

        // minimum page table: one small-branch directory entry
        bar1.directory.write32(mmio, 0x0, 0);
        bar1.directory
            .write32(mmio, 0x4, ((bar1.entry.address() >> 8) | 0x1) as u32);

        bar1.refresh_poll_area(mmio, chipset);
        bar1.refresh(mmio);
        log::debug!(
            "BAR1 shadow channel {:#x} with PDE {:#x} PTE {:#x}",
            bar1.ramin.address(),
            bar1.directory.address(),
            bar1.entry.address()
        );
        bar1
    }

    pub fn range(&self) -> u64 {
        self.range
    }

    pub fn address(&self) -> u64 {
        self.directory.address()
    }

    /// Point the hardware BAR1 channel at the shadow RAMIN.
    pub fn refresh(&self, mmio: &mut Mmio) {
        mmio.write32(0x001704, 0x8000_0000 | (self.ramin.address() >> 12) as u32);
    }

    /// Physical poll area always starts at 0.
    pub fn refresh_poll_area(&self, mmio: &mut Mmio, chipset: &Chipset) {
        if chipset.card() == Card::Nvc0 {
            mmio.mask32(0x002200, 0x0000_0001, 0x0000_0001);
        }
        mmio.write32(0x2254, 0x1000_0000);
    }

    /// Fold one guest's BAR1 layout into the shared page table: resolve
    /// each virtual channel's doorbell page through the guest's software
    /// table and install it at the physical channel's slot.
    pub fn shadow(
        &self,
        mmio: &mut Mmio,
        aspace: AddressSpace,
        poll_area: u64,
        table: &SoftwarePageTable,
    ) {
        log::debug!("{} BAR1 shadowed", aspace.id);
        for vcid in 0..DOMAIN_CHANNELS as u32 {
            let offset = vcid as u64 * self.range + poll_area;
            let pcid = aspace.phys_channel_id(vcid);
            let virt = pcid as u64 * self.range;
            if let Some((_, entry)) = table.resolve_entry(offset) {
                self.map(mmio, virt, entry);
            }
        }
    }

    fn map(&self, mmio: &mut Mmio, virt: u64, entry: PageEntry) {
        if virt / PAGE_DIRECTORY_COVERED_SIZE != 0 {
            return;
        }
        let index = virt / SMALL_PAGE_SIZE;
        if 8 * index + 8 > self.entry.size() {
            return;
        }
        self.entry.write32(mmio, 8 * index, entry.word0());
        self.entry.write32(mmio, 8 * index + 4, entry.word1());
    }

    /// Publish the shared page table to the hardware TLB.
    pub fn flush(&self, mmio: &mut Mmio) {
        let engine = 1 | 4;
        mmio.wait_ne(0x100c80, 0x00ff_0000, 0);
        mmio.write32(0x100cb8, (self.directory.address() >> 8) as u32);
        mmio.write32(0x100cbc, 0x8000_0000 | engine);
        mmio.wait_eq(0x100c80, 0x0000_8000, 0x0000_8000);
    }

    /// Raw guest access into its slice of the physical BAR1 window.
    pub fn write(
        &self,
        mmio: &mut Mmio,
        aspace: AddressSpace,
        poll_area: u64,
        offset: u64,
        value: u32,
        size: usize,
    ) {
        let offset =
            offset.wrapping_sub(poll_area) + self.range * (aspace.id as u64) * DOMAIN_CHANNELS as u64;
        mmio.bar_write(1, offset, value, size);
    }

    pub fn read(
        &self,
        mmio: &mut Mmio,
        aspace: AddressSpace,
        poll_area: u64,
        offset: u64,
        size: usize,
    ) -> u32 {
        let offset =
            offset.wrapping_sub(poll_area) + self.range * (aspace.id as u64) * DOMAIN_CHANNELS as u64;
        mmio.bar_read(1, offset, size)
    }

    /// Apply a paravirt PTE update for one channel slot.
    pub fn pv_reflect_entry(
        &self,
        mmio: &mut Mmio,
        aspace: AddressSpace,
        big: bool,
        index: u32,
        host_raw: u64,
    ) {
        log::debug!("{} BAR1 reflect entry {:#x}", aspace.id, index);
        if big {
            return;
        }
        let virt =
            (aspace.id as u64 * DOMAIN_CHANNELS as u64 + index as u64) * self.range;
        self.map(mmio, virt, PageEntry(host_raw));
    }
}
