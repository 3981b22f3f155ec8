//! Per-channel shadow state.
//!
//! A `Channel` owns the shadow RAMIN page and the shadow page table for
//! one virtual channel. Channels are stored by value in a dense array
//! inside their context; operations that need the rest of the context
//! (barrier table, RAMIN lookup map, sibling channels) live on `Context`
//! and borrow the pieces they touch, so a channel never keeps a back
//! pointer.
//!
//! Channels whose RAMIN names the same page directory share one shadow:
//! the first one scanned becomes the *origin* and the others borrow its
//! shadow PD ("overridden"). `reuse` is the sibling-index set of a group,
//! meaningful on the origin; a borrower records its origin in
//! `derived_from`.

use crate::mmio::Mmio;
use crate::shadow_page_table::ShadowPageTable;
use crate::vram::{ArenaRef, Page};

pub struct Channel {
    id: usize,
    enabled: bool,
    tlb_flush_needed: bool,
    ramin_address: u64,
    shadow_ramin: Page,
    table: ShadowPageTable,
    submitted: u32,
    reuse: u64,
    derived_from: Option<usize>,
}

impl Channel {
    pub fn new(arena: &ArenaRef, id: usize) -> Channel {
        Channel {
            id,
            enabled: false,
            tlb_flush_needed: false,
            ramin_address: 0,
            shadow_ramin: Page::new(arena, 1),
            table: ShadowPageTable::new(id as u32),
            submitted: 0,
            reuse: 1u64 << id,
            derived_from: None,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn enable(&mut self, ramin_address: u64) {
        self.enabled = true;
        self.ramin_address = ramin_address;
    }

    pub fn ramin_address(&self) -> u64 {
        self.ramin_address
    }

    pub fn shadow_ramin(&self) -> &Page {
        &self.shadow_ramin
    }

    pub fn table(&self) -> &ShadowPageTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut ShadowPageTable {
        &mut self.table
    }

    pub fn submitted(&self) -> u32 {
        self.submitted
    }

    pub fn submit(&mut self, value: u32) {
        self.submitted = value;
    }

    // ── TLB dirty flag ─────────────────────────────────────────

    pub fn flush_needed(&self) -> bool {
        self.tlb_flush_needed
    }

    pub fn mark_flush_needed(&mut self) {
        self.tlb_flush_needed = true;
    }

    pub fn clear_flush_needed(&mut self) {
        self.tlb_flush_needed = false;
    }

    // ── shadow sharing ─────────────────────────────────────────

    pub fn is_overridden(&self) -> bool {
        self.derived_from.is_some()
    }

    pub fn derived_from(&self) -> Option<usize> {
        self.derived_from
    }

    pub fn set_derived_from(&mut self, origin: Option<usize>) {
        self.derived_from = origin;
    }

    /// Reset the group to just this channel (it becomes an origin).
    pub fn reset_reuse(&mut self) {
        self.reuse = 1u64 << self.id;
        self.derived_from = None;
    }

    pub fn reuse_mask(&self) -> u64 {
        self.reuse
    }

    pub fn reuse_insert(&mut self, id: usize) {
        self.reuse |= 1u64 << id;
    }

    pub fn reuse_remove(&mut self, id: usize) {
        self.reuse &= !(1u64 << id);
    }

    /// Patch the RAMIN page-directory pointer (offset 0x200) to a shadow
    /// page directory.
    pub fn write_shadow_page_table(&self, mmio: &mut Mmio, shadow: u64) {
        self.shadow_ramin.write64(mmio, 0x0200, shadow);
    }
}
