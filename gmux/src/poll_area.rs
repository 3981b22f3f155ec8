//! BAR1 poll area geometry.
//!
//! The poll area is a per-channel doorbell range inside BAR1: one slot per
//! virtual channel, slot size depending on the chipset generation. Its
//! base is set by a guest BAR0 write to 0x2254.

use crate::chipset::{Card, Chipset};
use crate::DOMAIN_CHANNELS;

#[derive(Debug, Clone, Copy)]
pub struct ChannelAndOffset {
    pub channel: u32,
    pub offset: u64,
}

pub struct PollArea {
    per_size: u64,
    area: u64,
}

impl PollArea {
    pub fn new(chipset: &Chipset) -> PollArea {
        PollArea {
            per_size: match chipset.card() {
                Card::Nvc0 => 0x1000,
                Card::Nve0 => 0x200,
            },
            area: 0,
        }
    }

    pub fn set_area(&mut self, area: u64) {
        log::debug!("poll area at {:#x}", area);
        self.area = area;
    }

    pub fn area(&self) -> u64 {
        self.area
    }

    pub fn in_range(&self, offset: u64) -> bool {
        self.area <= offset && offset < self.area + DOMAIN_CHANNELS as u64 * self.per_size
    }

    pub fn extract_channel_and_offset(&self, offset: u64) -> ChannelAndOffset {
        let sub = offset - self.area;
        ChannelAndOffset {
            channel: (sub / self.per_size) as u32,
            offset: sub % self.per_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chipset::Chipset;

    fn nvc0() -> Chipset {
        Chipset::from_boot0(0x0c10_00a1).unwrap()
    }

    #[test]
    fn test_range_follows_base() {
        let mut pa = PollArea::new(&nvc0());
        pa.set_area(0x10000);
        assert!(pa.in_range(0x10000));
        assert!(pa.in_range(0x10000 + 64 * 0x1000 - 4));
        assert!(!pa.in_range(0xffff));
        assert!(!pa.in_range(0x10000 + 64 * 0x1000));
    }

    #[test]
    fn test_extract_channel_and_offset() {
        let mut pa = PollArea::new(&nvc0());
        pa.set_area(0x10000);
        let co = pa.extract_channel_and_offset(0x10000 + 5 * 0x1000 + 0x8c);
        assert_eq!(co.channel, 5);
        assert_eq!(co.offset, 0x8c);
    }
}
