//! BAR1 dispatch: doorbells and the guest VRAM window.
//!
//! Accesses inside the poll area address a channel's doorbell slot; the
//! fire offset (0x8C) becomes a scheduler submission instead of touching
//! the device directly. Everything else resolves through the guest's BAR1
//! page-table mirror onto guest VRAM, with barrier fanout for shadowed
//! pages.

use log::{debug, trace};

use crate::command::Command;
use crate::device::DeviceInner;

use super::Guest;

/// Intra-slot doorbell offset firing a channel.
const FIRE_OFFSET: u64 = 0x8c;

impl Guest {
    pub(crate) fn write_bar1(&mut self, cmd: &Command) {
        if self.poll_area.in_range(cmd.offset as u64) {
            let access = self.poll_area.extract_channel_and_offset(cmd.offset as u64);
            match access.offset {
                FIRE_OFFSET => {
                    let vcid = access.channel as usize;
                    if !self.para_virtualized && self.lazy_shadowing {
                        // publish any deferred shadow rebuild before the
                        // device runs the channel
                        let device = self.device.clone();
                        let mut inner = device.lock();
                        self.flush_channel(&mut inner, vcid);
                    }
                    self.channels[vcid].submit(cmd.value);
                    self.sched.enqueue(self.run.clone(), *cmd);
                }
                _ => {
                    let device = self.device.clone();
                    let mut inner = device.lock();
                    let DeviceInner { mmio, bar1, .. } = &mut *inner;
                    bar1.write(
                        mmio,
                        self.aspace,
                        self.poll_area.area(),
                        cmd.offset as u64,
                        cmd.value,
                        cmd.size(),
                    );
                }
            }
            return;
        }

        match self.bar1_channel.table().resolve(cmd.offset as u64) {
            Some(gphys) => {
                trace!("BAR1 write {:#x} => {:#x}", cmd.offset, gphys);
                let device = self.device.clone();
                let mut inner = device.lock();
                inner.mmio.write_host(gphys, cmd.value, cmd.size());
                if self.barrier.tracked(gphys) {
                    self.write_barrier(&mut inner, gphys, cmd);
                }
            }
            None => {
                trace!("BAR1 unresolved write {:#x} dropped", cmd.offset);
            }
        }
    }

    pub(crate) fn read_bar1(&mut self, cmd: &Command) -> u32 {
        if self.poll_area.in_range(cmd.offset as u64) {
            let access = self.poll_area.extract_channel_and_offset(cmd.offset as u64);
            return match access.offset {
                FIRE_OFFSET => self.channels[access.channel as usize].submitted(),
                _ => {
                    let device = self.device.clone();
                    let mut inner = device.lock();
                    let DeviceInner { mmio, bar1, .. } = &mut *inner;
                    bar1.read(
                        mmio,
                        self.aspace,
                        self.poll_area.area(),
                        cmd.offset as u64,
                        cmd.size(),
                    )
                }
            };
        }

        match self.bar1_channel.table().resolve(cmd.offset as u64) {
            Some(gphys) => {
                trace!("BAR1 read {:#x} => {:#x}", cmd.offset, gphys);
                let device = self.device.clone();
                let mut inner = device.lock();
                let value = inner.mmio.read_host(gphys, cmd.size());
                if self.barrier.tracked(gphys) {
                    self.read_barrier(gphys, cmd);
                }
                value
            }
            None => {
                debug!("BAR1 unresolved read {:#x}", cmd.offset);
                !0
            }
        }
    }
}
