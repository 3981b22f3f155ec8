//! Register and VRAM accessors over the raw bus.
//!
//! `Mmio` owns the `Bus` plus the state of the PMEM paging window: BAR0
//! offsets 0x700000..0x800000 are a 1 MiB window into VRAM whose base is
//! selected by register 0x1700. Everything that touches the device —
//! registers, doorbells, guest memory — funnels through this type, and the
//! type itself lives inside the single device mutex, so holding `&mut Mmio`
//! is holding the device.

use std::time::{Duration, Instant};

use log::warn;

use crate::bus::{size_mask, Bus};

/// Register polls that run longer than this are reported as failures.
const POLL_TIMEOUT: Duration = Duration::from_secs(2);

const PMEM_BASE: u64 = 0x700000;
const PMEM_WINDOW: u64 = 0x100000;

pub struct Mmio {
    bus: Box<dyn Bus>,
    /// Current value of the paging-window register 0x1700.
    window: u32,
}

impl Mmio {
    pub fn new(mut bus: Box<dyn Bus>) -> Mmio {
        let window = bus.read(0, 0x1700, 4);
        Mmio { bus, window }
    }

    // ── BAR0 registers ──────────────────────────────────────────

    pub fn read(&mut self, offset: u32, size: usize) -> u32 {
        self.bus.read(0, offset as u64, size)
    }

    pub fn write(&mut self, offset: u32, value: u32, size: usize) {
        self.bus.write(0, offset as u64, value, size);
    }

    pub fn read32(&mut self, offset: u32) -> u32 {
        self.read(offset, 4)
    }

    pub fn write32(&mut self, offset: u32, value: u32) {
        self.write(offset, value, 4);
    }

    /// Read-modify-write; returns the prior value.
    pub fn mask32(&mut self, offset: u32, mask: u32, value: u32) -> u32 {
        let prior = self.read32(offset);
        self.write32(offset, (prior & !mask) | value);
        prior
    }

    /// Poll until `reg & mask == value`. Returns false on timeout.
    pub fn wait_eq(&mut self, offset: u32, mask: u32, value: u32) -> bool {
        self.wait(offset, mask, value, true)
    }

    /// Poll until `reg & mask != value`. Returns false on timeout.
    pub fn wait_ne(&mut self, offset: u32, mask: u32, value: u32) -> bool {
        self.wait(offset, mask, value, false)
    }

    fn wait(&mut self, offset: u32, mask: u32, value: u32, eq: bool) -> bool {
        let deadline = Instant::now() + POLL_TIMEOUT;
        loop {
            let hit = (self.read32(offset) & mask) == value;
            if hit == eq {
                return true;
            }
            if Instant::now() >= deadline {
                warn!("poll timed out at {:#08x} (mask {:#x})", offset, mask);
                return false;
            }
            std::thread::yield_now();
        }
    }

    // ── Other BARs (doorbells, apertures) ───────────────────────

    pub fn bar_read(&mut self, bar: usize, offset: u64, size: usize) -> u32 {
        self.bus.read(bar, offset, size)
    }

    pub fn bar_write(&mut self, bar: usize, offset: u64, value: u32, size: usize) {
        self.bus.write(bar, offset, value, size);
    }

    pub fn bar_base(&self, bar: usize) -> u64 {
        self.bus.base(bar)
    }

    pub fn bar_size(&self, bar: usize) -> u64 {
        self.bus.size(bar)
    }

    // ── VRAM through the PMEM window ────────────────────────────

    fn slide(&mut self, addr: u64) -> u32 {
        let window = ((addr & 0xff_fff0_0000u64) >> 16) as u32;
        if window != self.window {
            self.window = window;
            self.write32(0x1700, window);
        }
        (PMEM_BASE + (addr & (PMEM_WINDOW - 1))) as u32
    }

    pub fn read_host(&mut self, addr: u64, size: usize) -> u32 {
        let offset = self.slide(addr);
        self.read(offset, size) & size_mask(size)
    }

    pub fn write_host(&mut self, addr: u64, value: u32, size: usize) {
        let offset = self.slide(addr);
        self.write(offset, value, size);
    }

    pub fn read_host32(&mut self, addr: u64) -> u32 {
        self.read_host(addr, 4)
    }

    pub fn write_host32(&mut self, addr: u64, value: u32) {
        self.write_host(addr, value, 4);
    }

    pub fn read_host64(&mut self, addr: u64) -> u64 {
        let lower = self.read_host32(addr) as u64;
        let upper = self.read_host32(addr + 4) as u64;
        lower | (upper << 32)
    }

    pub fn write_host64(&mut self, addr: u64, value: u64) {
        self.write_host32(addr, value as u32);
        self.write_host32(addr + 4, (value >> 32) as u32);
    }

    /// Current paging-window register value.
    pub fn window(&self) -> u32 {
        self.window
    }

    pub fn set_window(&mut self, window: u32) {
        self.window = window;
    }
}
