//! Per-guest address arithmetic.
//!
//! Guest GPU addresses and channel IDs are dense per-guest spaces mapped
//! onto the physical device by a constant shift: guest `id` owns host VRAM
//! `[id * MEMORY_SIZE, (id + 1) * MEMORY_SIZE)` and physical channels
//! `[id * DOMAIN_CHANNELS, ...)`. `AddressSpace` is a small copyable view
//! of a context used by every shadow structure.

use crate::hypervisor::Hypervisor;
use crate::page_table::{target, PageEntry, PAGE_SHIFT};
use crate::{DOMAIN_CHANNELS, MEMORY_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace {
    /// Virtualized GPU id (dense guest slot).
    pub id: u32,
    /// Guest domain id, for hypervisor calls.
    pub domid: i32,
}

impl AddressSpace {
    pub fn shift(&self) -> u64 {
        self.id as u64 * MEMORY_SIZE
    }

    pub fn vram_size(&self) -> u64 {
        MEMORY_SIZE
    }

    pub fn to_host(&self, virt: u64) -> u64 {
        virt + self.shift()
    }

    pub fn to_guest(&self, phys: u64) -> u64 {
        phys.wrapping_sub(self.shift())
    }

    /// Whether a host-physical address lies inside this guest's window.
    pub fn contains(&self, phys: u64) -> bool {
        self.to_guest(phys) < self.vram_size()
    }

    pub fn fits(&self, size: u64) -> bool {
        size <= self.vram_size()
    }

    pub fn phys_channel_id(&self, vcid: u32) -> u32 {
        vcid + self.id * DOMAIN_CHANNELS as u32
    }

    pub fn virt_channel_id(&self, pcid: u32) -> u32 {
        pcid - self.id * DOMAIN_CHANNELS as u32
    }

    /// Rewrite a guest-authored page-table entry into host form.
    ///
    /// VRAM targets shift into this guest's window; an address that lands
    /// outside it is forced not-present so the guest faults at its own
    /// level instead of touching foreign memory. System-memory targets
    /// resolve the guest frame through the hypervisor. Every other bit is
    /// preserved.
    pub fn translate_entry(&self, entry: PageEntry, hv: &mut dyn Hypervisor) -> PageEntry {
        let mut result = entry;
        if !entry.present() {
            return result;
        }
        match entry.target() {
            target::VRAM => {
                let guest = (entry.address() as u64) << PAGE_SHIFT;
                let host = self.to_host(guest);
                result.set_address((host >> PAGE_SHIFT) as u32);
                if !(self.shift() <= host && host < self.shift() + self.vram_size()) {
                    log::debug!("entry out of window: {:#x} -> {:#x}", guest, host);
                    result.set_present(false);
                }
            }
            target::SYSRAM | target::SYSRAM_NO_SNOOP => {
                let mfn = hv.gfn_to_mfn(self.domid, entry.address() as u64);
                result.set_address(mfn as u32);
            }
            _ => {}
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::NullHypervisor;

    fn aspace(id: u32) -> AddressSpace {
        AddressSpace { id, domid: 7 }
    }

    #[test]
    fn test_address_shift() {
        let a = aspace(1);
        assert_eq!(a.to_host(0x1000), MEMORY_SIZE + 0x1000);
        assert_eq!(a.to_guest(MEMORY_SIZE + 0x1000), 0x1000);
        assert!(a.contains(MEMORY_SIZE));
        assert!(!a.contains(0));
        assert!(!a.contains(2 * MEMORY_SIZE));
    }

    #[test]
    fn test_channel_ids() {
        let a = aspace(1);
        assert_eq!(a.phys_channel_id(5), 69);
        assert_eq!(a.virt_channel_id(69), 5);
    }

    #[test]
    fn test_vram_entry_translation() {
        let mut hv = NullHypervisor;
        let a = aspace(1);
        let mut entry = PageEntry::from_words(1 | (0x40 << 4), 0);
        entry = a.translate_entry(entry, &mut hv);
        assert!(entry.present());
        assert_eq!(
            entry.address() as u64,
            0x40 + (MEMORY_SIZE >> PAGE_SHIFT)
        );
    }

    #[test]
    fn test_out_of_window_entry_forced_absent() {
        let mut hv = NullHypervisor;
        let a = aspace(0);
        // frame beyond the guest quota
        let frame = ((2 * MEMORY_SIZE) >> PAGE_SHIFT) as u32;
        let entry = PageEntry::from_words(1 | (frame << 4), 0);
        let entry = a.translate_entry(entry, &mut hv);
        assert!(!entry.present());
    }

    #[test]
    fn test_sysram_entry_resolved_via_hypervisor() {
        let mut hv = NullHypervisor; // identity gfn -> mfn
        let a = aspace(1);
        let word1 = target::SYSRAM << 1;
        let entry = PageEntry::from_words(1 | (0x1234 << 4), word1);
        let entry = a.translate_entry(entry, &mut hv);
        assert!(entry.present());
        assert_eq!(entry.address(), 0x1234);
    }

    #[test]
    fn test_absent_entry_untouched() {
        let mut hv = NullHypervisor;
        let a = aspace(1);
        let entry = PageEntry::from_words(0x40 << 4, 0);
        assert_eq!(a.translate_entry(entry, &mut hv), entry);
    }
}
