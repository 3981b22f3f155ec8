//! In-memory device model and hypervisor mock for tests.
//!
//! `FakeBus` emulates just enough of the GPU for the mediation paths:
//! a BAR0 register file with programmed defaults, the PMEM sliding window
//! backed by a sparse VRAM word store, and a write log for asserting what
//! reached "hardware". `MockHypervisor` records physmap edits and serves
//! the paravirt slot buffer from a plain byte vector.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::bus::{size_mask, Bus};
use crate::config::Config;
use crate::device::{Device, DeviceRef};
use crate::hypervisor::{Hypervisor, SlotSlab};
use crate::pv::SLOT_TOTAL;

/// Boot register of an NVC1 board.
pub const BOOT0_NVC1: u32 = 0x0c10_00a1;

pub struct FakeState {
    /// Per-BAR word stores (bar 0 registers live here too).
    pub words: HashMap<(usize, u64), u32>,
    /// Sparse VRAM word store addressed by host-physical address.
    pub vram: HashMap<u64, u32>,
    /// Every write that reached the device, in order.
    pub writes: Vec<(usize, u64, u32)>,
}

impl FakeState {
    pub fn vram32(&self, addr: u64) -> u32 {
        self.vram.get(&(addr & !3)).copied().unwrap_or(0)
    }

    pub fn set_vram32(&mut self, addr: u64, value: u32) {
        self.vram.insert(addr & !3, value);
    }

    pub fn set_vram64(&mut self, addr: u64, value: u64) {
        self.set_vram32(addr, value as u32);
        self.set_vram32(addr + 4, (value >> 32) as u32);
    }

    /// Last value written to a BAR0 register, if any.
    pub fn reg(&self, offset: u64) -> Option<u32> {
        self.words.get(&(0, offset)).copied()
    }

    pub fn writes_to(&self, bar: usize, offset: u64) -> Vec<u32> {
        self.writes
            .iter()
            .filter(|(b, o, _)| *b == bar && *o == offset)
            .map(|(_, _, v)| *v)
            .collect()
    }
}

pub struct FakeBus {
    state: Arc<Mutex<FakeState>>,
}

const PMEM_BASE: u64 = 0x700000;
const PMEM_END: u64 = 0x800000;

impl FakeBus {
    pub fn new() -> (FakeBus, Arc<Mutex<FakeState>>) {
        let mut words = HashMap::new();
        // chipset and "flush already settled" defaults
        words.insert((0usize, 0u64), BOOT0_NVC1);
        words.insert((0, 0x100c80), 0x00ff_8000);
        words.insert((0, 0x400700), 0); // engine idle
        let state = Arc::new(Mutex::new(FakeState {
            words,
            vram: HashMap::new(),
            writes: Vec::new(),
        }));
        (
            FakeBus {
                state: state.clone(),
            },
            state,
        )
    }

    fn pmem_target(state: &FakeState, offset: u64) -> u64 {
        let window = state.words.get(&(0, 0x1700)).copied().unwrap_or(0) as u64;
        (window << 16) + (offset - PMEM_BASE)
    }
}

fn merge(word: u32, offset: u64, value: u32, size: usize) -> u32 {
    let shift = (offset & 3) as u32 * 8;
    let mask = size_mask(size) << shift;
    (word & !mask) | ((value << shift) & mask)
}

fn extract(word: u32, offset: u64, size: usize) -> u32 {
    let shift = (offset & 3) as u32 * 8;
    (word >> shift) & size_mask(size)
}

impl Bus for FakeBus {
    fn read(&mut self, bar: usize, offset: u64, size: usize) -> u32 {
        let state = self.state.lock().unwrap();
        if bar == 0 && (PMEM_BASE..PMEM_END).contains(&offset) {
            let addr = Self::pmem_target(&state, offset);
            let word = state.vram.get(&(addr & !3)).copied().unwrap_or(0);
            return extract(word, addr, size);
        }
        let word = state.words.get(&(bar, offset & !3)).copied().unwrap_or(0);
        extract(word, offset, size)
    }

    fn write(&mut self, bar: usize, offset: u64, value: u32, size: usize) {
        let mut state = self.state.lock().unwrap();
        state.writes.push((bar, offset, value));
        if bar == 0 && (PMEM_BASE..PMEM_END).contains(&offset) {
            let addr = Self::pmem_target(&state, offset);
            let word = state.vram.get(&(addr & !3)).copied().unwrap_or(0);
            let merged = merge(word, addr, value, size);
            state.vram.insert(addr & !3, merged);
            return;
        }
        let key = (bar, offset & !3);
        let word = state.words.get(&key).copied().unwrap_or(0);
        let merged = merge(word, offset, value, size);
        state.words.insert(key, merged);
    }

    fn base(&self, bar: usize) -> u64 {
        match bar {
            1 => 0xf000_0000,
            3 => 0xe000_0000,
            _ => 0,
        }
    }

    fn size(&self, bar: usize) -> u64 {
        match bar {
            1 => crate::BAR1_ARENA_SIZE,
            3 => crate::BAR3_TOTAL_SIZE,
            _ => 32 << 20,
        }
    }
}

#[derive(Default)]
pub struct MockHvState {
    pub added: Vec<(i32, u64, u64, u64)>,
    pub removed: Vec<(i32, u64, u64, u64)>,
    pub slab: Arc<Mutex<Vec<u8>>>,
}

pub struct MockHypervisor {
    state: Arc<Mutex<MockHvState>>,
}

impl MockHypervisor {
    pub fn new() -> (MockHypervisor, Arc<Mutex<MockHvState>>) {
        let state = Arc::new(Mutex::new(MockHvState::default()));
        state.lock().unwrap().slab.lock().unwrap().resize(SLOT_TOTAL, 0);
        (
            MockHypervisor {
                state: state.clone(),
            },
            state,
        )
    }
}

/// Machine frames are guest frames plus this offset, so tests can tell
/// translated entries apart.
pub const MFN_OFFSET: u64 = 0x8000;

impl Hypervisor for MockHypervisor {
    fn gfn_to_mfn(&mut self, _domid: i32, gfn: u64) -> u64 {
        gfn + MFN_OFFSET
    }

    fn add_memory_mapping(&mut self, domid: i32, gpfn: u64, mfn: u64, count: u64) {
        self.state
            .lock()
            .unwrap()
            .added
            .push((domid, gpfn, mfn, count));
    }

    fn remove_memory_mapping(&mut self, domid: i32, gpfn: u64, mfn: u64, count: u64) {
        self.state
            .lock()
            .unwrap()
            .removed
            .push((domid, gpfn, mfn, count));
    }

    fn map_foreign_range(
        &mut self,
        _domid: i32,
        bytes: usize,
        _gpfn: u64,
    ) -> Option<Box<dyn SlotSlab>> {
        let slab = self.state.lock().unwrap().slab.clone();
        slab.lock().unwrap().resize(bytes, 0);
        Some(Box::new(VecSlab { slab }))
    }
}

pub struct VecSlab {
    slab: Arc<Mutex<Vec<u8>>>,
}

impl SlotSlab for VecSlab {
    fn read8(&self, offset: usize) -> u8 {
        self.slab.lock().unwrap()[offset]
    }

    fn read32(&self, offset: usize) -> u32 {
        let slab = self.slab.lock().unwrap();
        u32::from_le_bytes([
            slab[offset],
            slab[offset + 1],
            slab[offset + 2],
            slab[offset + 3],
        ])
    }

    fn read64(&self, offset: usize) -> u64 {
        self.read32(offset) as u64 | ((self.read32(offset + 4) as u64) << 32)
    }

    fn write32(&mut self, offset: usize, value: u32) {
        let mut slab = self.slab.lock().unwrap();
        slab[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}

pub struct Harness {
    pub device: DeviceRef,
    pub bus: Arc<Mutex<FakeState>>,
    pub hv: Arc<Mutex<MockHvState>>,
}

/// A device over the in-memory model, with BAR3 remapping enabled so
/// hypervisor traffic is observable.
pub fn harness() -> Harness {
    harness_with(Config {
        bar3_remapping: true,
        ..Config::default()
    })
}

pub fn harness_with(config: Config) -> Harness {
    let (bus, bus_state) = FakeBus::new();
    let (hv, hv_state) = MockHypervisor::new();
    let device = Device::new(Box::new(bus), Box::new(hv), config).expect("fake device");
    Harness {
        device,
        bus: bus_state,
        hv: hv_state,
    }
}

/// Write a paravirt slot's bytes directly into the mock slab.
pub fn write_slot(hv: &Arc<Mutex<MockHvState>>, index: usize, words: &[(usize, u32)]) {
    let state = hv.lock().unwrap();
    let mut slab = state.slab.lock().unwrap();
    let base = index * crate::pv::SLOT_SIZE;
    for &(word, value) in words {
        slab[base + word * 4..base + word * 4 + 4].copy_from_slice(&value.to_le_bytes());
    }
}

pub fn read_slot_word(hv: &Arc<Mutex<MockHvState>>, index: usize, word: usize) -> u32 {
    let state = hv.lock().unwrap();
    let slab = state.slab.lock().unwrap();
    let base = index * crate::pv::SLOT_SIZE + word * 4;
    u32::from_le_bytes([slab[base], slab[base + 1], slab[base + 2], slab[base + 3]])
}
