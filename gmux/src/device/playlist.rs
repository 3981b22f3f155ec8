//! Runlist virtualization.
//!
//! Guests submit runlists of their own virtual channel IDs. The mediator
//! keeps a device-wide bitset of scheduled physical channels and rebuilds
//! the real runlist from it into one of two double-buffered host pages, so
//! one guest's update never evicts another guest's channels.

use crate::aspace::AddressSpace;
use crate::mmio::Mmio;
use crate::vram::{ArenaRef, Page};
use crate::{CHANNELS, DOMAIN_CHANNELS};

pub struct Playlist {
    pages: [Page; 2],
    channels: u128,
    cursor: usize,
}

impl Playlist {
    pub fn new(arena: &ArenaRef) -> Playlist {
        Playlist {
            pages: [Page::new(arena, 1), Page::new(arena, 1)],
            channels: 0,
            cursor: 0,
        }
    }

    fn toggle(&mut self) -> &Page {
        self.cursor ^= 1;
        &self.pages[self.cursor & 1]
    }

    /// Rebuild the physical runlist from a guest's update.
    ///
    /// `address` is the host-physical address of the guest runlist,
    /// `cmd` the guest's write to the length register (entry count in the
    /// low byte).
    pub fn update(&mut self, mmio: &mut Mmio, aspace: AddressSpace, address: u64, cmd: u32) {
        for vcid in 0..DOMAIN_CHANNELS as u32 {
            let pcid = aspace.phys_channel_id(vcid);
            self.channels &= !(1u128 << pcid);
        }

        let count = cmd & 0xff;
        log::debug!("playlist update with {} entries", count);
        if count == 0 {
            return;
        }

        for i in 0..count {
            let vcid = mmio.read_host32(address + i as u64 * 8);
            let pcid = aspace.phys_channel_id(vcid);
            self.channels |= 1u128 << pcid;
        }

        let channels = self.channels;
        let page = self.toggle();
        let mut phys_count = 0u32;
        for pcid in 0..CHANNELS as u32 {
            if channels & (1u128 << pcid) != 0 {
                page.write32(mmio, phys_count as u64 * 8, pcid);
                page.write32(mmio, phys_count as u64 * 8 + 4, 0x4);
                phys_count += 1;
            }
        }

        let shadow = page.address();
        let phys_cmd = (cmd & !0xff) | phys_count;
        mmio.write32(0x2270, (shadow >> 12) as u32);
        mmio.write32(0x2274, phys_cmd);
        log::debug!("playlist cmd from {:#x} to {:#x}", cmd, phys_cmd);
    }
}
