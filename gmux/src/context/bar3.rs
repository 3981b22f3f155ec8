//! BAR3 dispatch: the RAMIN aperture.
//!
//! Guest BAR3 offsets resolve through the device-wide BAR3 shadow onto
//! guest VRAM. Writes that land on barrier-tracked pages (a RAMIN block
//! the engine shadows) fan out to the shadow copies.

use log::debug;

use crate::command::Command;

use super::Guest;

impl Guest {
    pub(crate) fn write_bar3(&mut self, cmd: &Command) {
        let device = self.device.clone();
        let mut inner = device.lock();
        match inner.bar3.resolve(self.aspace, cmd.offset as u64) {
            Some(gphys) => {
                inner.mmio.write_host(gphys, cmd.value, cmd.size());
                if self.barrier.tracked(gphys) {
                    self.write_barrier(&mut inner, gphys, cmd);
                }
            }
            None => {
                debug!("BAR3 unresolved write {:#x} dropped", cmd.offset);
            }
        }
    }

    pub(crate) fn read_bar3(&mut self, cmd: &Command) -> u32 {
        let device = self.device.clone();
        let mut inner = device.lock();
        match inner.bar3.resolve(self.aspace, cmd.offset as u64) {
            Some(gphys) => {
                let value = inner.mmio.read_host(gphys, cmd.size());
                if self.barrier.tracked(gphys) {
                    self.read_barrier(gphys, cmd);
                }
                value
            }
            None => {
                debug!("BAR3 unresolved read {:#x}", cmd.offset);
                !0
            }
        }
    }
}
