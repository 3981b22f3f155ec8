//! PFIFO channel-table geometry.
//!
//! The device exposes one 8-byte slot per physical channel at a
//! chipset-dependent base: word 0 is the channel's RAMIN pointer, word 1
//! its status. Guests address their slots by virtual channel ID; the
//! context remaps accesses onto the guest's physical slots.

use crate::chipset::{Card, Chipset};
use crate::{CHANNELS, DOMAIN_CHANNELS};

#[derive(Debug, Clone, Copy)]
pub struct PfifoAccess {
    /// Virtual channel the guest addressed.
    pub vcid: u32,
    /// Offset of the RAMIN-pointer word (true) vs the status word.
    pub ramin_area: bool,
    /// Intra-slot byte offset.
    pub rest: u32,
}

pub struct Pfifo {
    total_channels: u32,
    channels: u32,
    base: u32,
}

impl Pfifo {
    pub fn new(chipset: &Chipset) -> Pfifo {
        Pfifo {
            total_channels: CHANNELS as u32,
            channels: DOMAIN_CHANNELS as u32,
            base: match chipset.card() {
                Card::Nvc0 => 0x003000,
                Card::Nve0 => 0x800000,
            },
        }
    }

    /// Per-guest channel budget.
    pub fn channels(&self) -> u32 {
        self.channels
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn in_range(&self, offset: u32) -> bool {
        offset >= self.base && (offset - self.base) <= self.total_channels * 8
    }

    pub fn decompose(&self, offset: u32) -> PfifoAccess {
        let sub = offset - self.base;
        PfifoAccess {
            vcid: sub / 8,
            ramin_area: sub % 8 == 0,
            rest: sub % 8,
        }
    }

    /// The physical register offset for a guest access, after vcid → pcid
    /// substitution.
    pub fn adjust(&self, offset: u32, vcid: u32, pcid: u32) -> u32 {
        (offset - vcid * 8) + pcid * 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chipset::Chipset;

    fn pfifo() -> Pfifo {
        Pfifo::new(&Chipset::from_boot0(0x0c10_00a1).unwrap())
    }

    #[test]
    fn test_range() {
        let p = pfifo();
        assert!(p.in_range(0x3000));
        assert!(p.in_range(0x3000 + 128 * 8));
        assert!(!p.in_range(0x2fff));
    }

    #[test]
    fn test_decompose_and_adjust() {
        let p = pfifo();
        let access = p.decompose(0x3000 + 5 * 8);
        assert!(access.ramin_area);
        assert_eq!(access.vcid, 5);
        let status = p.decompose(0x3000 + 5 * 8 + 4);
        assert!(!status.ramin_area);
        assert_eq!(status.vcid, 5);
        // guest 1: vcid 5 -> pcid 69
        assert_eq!(p.adjust(0x3000 + 5 * 8, 5, 69), 0x3000 + 69 * 8);
        assert_eq!(p.adjust(0x3000 + 5 * 8 + 4, 5, 69), 0x3000 + 69 * 8 + 4);
    }
}
