//! The physical device and its device-wide shadow state.
//!
//! There is exactly one `Device` per daemon, shared by every session and
//! scheduler thread through an `Arc`. All mutable device-wide state — the
//! register accessor (with its PMEM window), the hypervisor backend, the
//! BAR1/BAR3 shadows, the playlist and the guest-slot table — lives behind
//! one non-recursive mutex; holding the guard *is* holding the device.
//! Helpers borrow disjoint fields out of the guard instead of re-locking.

pub mod bar1;
pub mod bar3;
pub mod playlist;

use std::sync::{Arc, Mutex, MutexGuard};

use log::info;

use crate::bus::{Bus, SysfsBus};
use crate::chipset::Chipset;
use crate::config::Config;
use crate::hypervisor::{Hypervisor, NullHypervisor};
use crate::instruments::Instruments;
use crate::mmio::Mmio;
use crate::vram::{ArenaRef, VramArena};
use crate::{Error, Result, ARENA_BASE, ARENA_SIZE, VM_COUNT};

pub use bar1::DeviceBar1;
pub use bar3::DeviceBar3;
pub use playlist::Playlist;

pub struct DeviceInner {
    pub mmio: Mmio,
    pub hypervisor: Box<dyn Hypervisor>,
    pub bar1: DeviceBar1,
    pub bar3: DeviceBar3,
    pub playlist: Playlist,
    slots: [bool; VM_COUNT],
    instruments: [Option<Arc<Instruments>>; VM_COUNT],
}

impl DeviceInner {
    /// Clear shadowing counters of every live context.
    pub fn clear_shadowing_utilization(&self) {
        for instruments in self.instruments.iter().flatten() {
            instruments.clear_shadowing_utilization();
        }
    }
}

pub struct Device {
    inner: Mutex<DeviceInner>,
    arena: ArenaRef,
    chipset: Chipset,
    config: Config,
}

pub type DeviceRef = Arc<Device>;

impl Device {
    /// Open the GPU named in the configuration through sysfs, with no
    /// hypervisor binding.
    pub fn open(config: Config) -> Result<DeviceRef> {
        let bus = SysfsBus::open(&config.bdf)?;
        Device::new(Box::new(bus), Box::new(NullHypervisor), config)
    }

    pub fn new(
        bus: Box<dyn Bus>,
        hypervisor: Box<dyn Hypervisor>,
        config: Config,
    ) -> Result<DeviceRef> {
        let mut mmio = Mmio::new(bus);
        let boot0 = mmio.read32(0);
        let chipset = Chipset::from_boot0(boot0)?;

        let arena = VramArena::new(ARENA_BASE, ARENA_SIZE);
        let bar1 = DeviceBar1::new(&mut mmio, &arena, &chipset);
        let bar3_base = mmio.bar_base(3);
        let bar3_size = mmio.bar_size(3);
        let bar3 = DeviceBar3::new(
            &mut mmio,
            &arena,
            bar3_base,
            bar3_size,
            config.bar3_remapping,
        );
        let playlist = Playlist::new(&arena);

        info!("NV{:02X} device initialized", chipset.detail());

        Ok(Arc::new(Device {
            inner: Mutex::new(DeviceInner {
                mmio,
                hypervisor,
                bar1,
                bar3,
                playlist,
                slots: [true; VM_COUNT],
                instruments: Default::default(),
            }),
            arena,
            chipset,
            config,
        }))
    }

    /// Take the device mutex. Every MMIO touch happens under this guard.
    pub fn lock(&self) -> MutexGuard<'_, DeviceInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn arena(&self) -> &ArenaRef {
        &self.arena
    }

    pub fn chipset(&self) -> &Chipset {
        &self.chipset
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Allocate a guest slot (dense virtualized GPU id).
    pub fn acquire_slot(&self, instruments: Arc<Instruments>) -> Result<u32> {
        let mut inner = self.lock();
        for id in 0..VM_COUNT {
            if inner.slots[id] {
                inner.slots[id] = false;
                inner.instruments[id] = Some(instruments);
                return Ok(id as u32);
            }
        }
        Err(Error::NoFreeSlot)
    }

    pub fn release_slot(&self, id: u32) {
        let mut inner = self.lock();
        inner.slots[id as usize] = true;
        inner.instruments[id as usize] = None;
    }

    /// Whether the graphics engine is still busy with a submitted command.
    pub fn is_active(&self) -> bool {
        self.lock().mmio.read32(0x400700) != 0
    }
}
