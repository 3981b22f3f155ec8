//! Raw PCI BAR access.
//!
//! `Bus` is the byte-granular seam between the mediation core and the
//! physical device. The production implementation reads and writes the
//! sysfs resource files of the PCI function; tests substitute an in-memory
//! device model.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;

use log::info;

use crate::config::Bdf;
use crate::{Error, Result};

/// Byte-granular register I/O on the device BARs. Accesses are 1, 2 or 4
/// bytes wide; wider values are handled above this layer.
pub trait Bus: Send {
    fn read(&mut self, bar: usize, offset: u64, size: usize) -> u32;
    fn write(&mut self, bar: usize, offset: u64, value: u32, size: usize);
    /// Host-physical base address of a BAR (used to place the BAR3 shadow
    /// aperture).
    fn base(&self, bar: usize) -> u64;
    fn size(&self, bar: usize) -> u64;
}

/// The BARs gmux mediates.
pub const USED_BARS: [usize; 3] = [0, 1, 3];

struct Resource {
    file: File,
    base: u64,
    size: u64,
}

/// PCI access through `/sys/bus/pci/devices/<bdf>/resource{0,1,3}`.
pub struct SysfsBus {
    resources: [Option<Resource>; 5],
}

impl SysfsBus {
    pub fn open(bdf: &Bdf) -> Result<SysfsBus> {
        let dir = format!("/sys/bus/pci/devices/0000:{}", bdf);
        let ranges = parse_resource_ranges(&dir)?;
        let mut resources: [Option<Resource>; 5] = Default::default();
        for &bar in USED_BARS.iter() {
            let (base, end) = ranges
                .get(bar)
                .copied()
                .filter(|&(base, end)| end > base)
                .ok_or_else(|| Error::DeviceNotFound(format!("{} has no BAR{}", bdf, bar)))?;
            let path = format!("{}/resource{}", dir, bar);
            let file = OpenOptions::new().read(true).write(true).open(&path)?;
            resources[bar] = Some(Resource {
                file,
                base,
                size: end - base + 1,
            });
        }
        info!("opened GPU at {}", bdf);
        Ok(SysfsBus { resources })
    }

    fn resource(&self, bar: usize) -> &Resource {
        self.resources[bar]
            .as_ref()
            .expect("access to an unmapped BAR")
    }
}

/// Parse the `resource` file of the device: one `start end flags` hex
/// triple per line, indexed by BAR.
fn parse_resource_ranges(dir: &str) -> Result<Vec<(u64, u64)>> {
    let text = std::fs::read_to_string(format!("{}/resource", dir))
        .map_err(|_| Error::DeviceNotFound(dir.into()))?;
    let mut ranges = Vec::new();
    for line in text.lines() {
        let mut fields = line.split_whitespace().map(|f| {
            u64::from_str_radix(f.trim_start_matches("0x"), 16).unwrap_or(0)
        });
        let start = fields.next().unwrap_or(0);
        let end = fields.next().unwrap_or(0);
        ranges.push((start, end));
    }
    Ok(ranges)
}

impl Bus for SysfsBus {
    fn read(&mut self, bar: usize, offset: u64, size: usize) -> u32 {
        let mut buf = [0u8; 4];
        let res = self.resource(bar);
        if res.file.read_exact_at(&mut buf[..size], offset).is_err() {
            return !0;
        }
        u32::from_le_bytes(buf) & size_mask(size)
    }

    fn write(&mut self, bar: usize, offset: u64, value: u32, size: usize) {
        let buf = value.to_le_bytes();
        let res = self.resource(bar);
        let _ = res.file.write_all_at(&buf[..size], offset);
    }

    fn base(&self, bar: usize) -> u64 {
        self.resource(bar).base
    }

    fn size(&self, bar: usize) -> u64 {
        self.resource(bar).size
    }
}

pub fn size_mask(size: usize) -> u32 {
    match size {
        1 => 0xff,
        2 => 0xffff,
        _ => !0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_mask() {
        assert_eq!(size_mask(1), 0xff);
        assert_eq!(size_mask(2), 0xffff);
        assert_eq!(size_mask(4), 0xffff_ffff);
    }
}
