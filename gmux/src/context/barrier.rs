//! Write-barrier fanout.
//!
//! A guest can edit a RAMIN page through any aperture that reaches its
//! VRAM (PMEM window, BAR1, BAR3). When such a write lands on a page the
//! engine shadows, the same write is replayed into every shadow observing
//! that page, and the BAR window shadows are rebuilt if their control
//! block was touched.

use log::debug;

use crate::command::Command;
use crate::device::DeviceInner;
use crate::page_table::PAGE_SIZE;

use super::Guest;

impl Guest {
    pub(crate) fn write_barrier(&mut self, inner: &mut DeviceInner, addr: u64, cmd: &Command) {
        let page = addr & !(PAGE_SIZE - 1);
        let rest = addr - page;
        debug!(
            "write barrier {:#x}: page {:#x} <= {:#x}",
            addr, page, cmd.value
        );

        let vcids = self.ramin_map.get(&page).cloned().unwrap_or_default();
        for vcid in vcids {
            debug!(
                "write reflect shadow {:#x}: rest {:#x}",
                self.channels[vcid].shadow_ramin().address(),
                rest
            );
            if cmd.value != 0 && self.lazy_shadowing {
                self.flush_channel(inner, vcid);
            }
            self.channels[vcid]
                .shadow_ramin()
                .write(&mut inner.mmio, rest, cmd.value, cmd.size());
        }

        if page == self.bar3_channel.ramin_address() {
            debug!("write reflects BAR3 control block");
            let aspace = self.aspace;
            let DeviceInner {
                mmio,
                hypervisor,
                bar3,
                ..
            } = &mut *inner;
            self.bar3_channel
                .shadow(mmio, hypervisor.as_mut(), bar3, aspace, self.para_virtualized);
        }

        if page == self.bar1_channel.ramin_address() {
            debug!("write reflects BAR1 control block");
            let aspace = self.aspace;
            let DeviceInner {
                mmio, hypervisor, ..
            } = &mut *inner;
            self.bar1_channel
                .shadow(mmio, hypervisor.as_mut(), aspace, self.para_virtualized);
        }
    }

    pub(crate) fn read_barrier(&self, addr: u64, _cmd: &Command) {
        let page = addr & !(PAGE_SIZE - 1);
        debug!("read barrier {:#x}: page {:#x}", addr, page);
    }
}
