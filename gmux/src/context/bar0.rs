//! BAR0 dispatch: the control-register table.
//!
//! Every mediated register either lands in the per-guest register shadow,
//! gets its address/channel fields rewritten before touching hardware, or
//! passes straight through under the device mutex. Readbacks of mediated
//! registers come from the shadow; the memory-controller geometry is
//! virtualized so guest drivers size themselves to their quota instead of
//! the physical board.

use log::debug;

use crate::command::Command;
use crate::device::DeviceInner;
use crate::{MEMORY_CTL_NUM, MEMORY_CTL_PART};

use super::Guest;

const FRAME_MASK: u32 = 0x0fff_ffff;

impl Guest {
    pub(crate) fn write_bar0(&mut self, cmd: &Command) {
        let aspace = self.aspace;
        match cmd.offset {
            0x001700 => {
                // VRAM paging window
                self.regs.set(cmd.offset, cmd.value);
            }

            0x001704 => {
                // BAR1 channel pointer
                self.regs.set(cmd.offset, cmd.value);
                let virt = ((cmd.value & FRAME_MASK) as u64) << 12;
                let phys = aspace.to_host(virt);
                debug!("0x1704 => {:#x}", phys);
                let device = self.device.clone();
                let mut inner = device.lock();
                let DeviceInner {
                    mmio,
                    hypervisor,
                    bar1,
                    ..
                } = &mut *inner;
                self.bar1_channel.refresh(
                    mmio,
                    hypervisor.as_mut(),
                    aspace,
                    &mut self.barrier,
                    phys,
                    self.para_virtualized,
                );
                bar1.refresh(mmio);
            }

            0x001714 => {
                // BAR3 channel pointer
                self.regs.set(cmd.offset, cmd.value);
                let virt = ((cmd.value & FRAME_MASK) as u64) << 12;
                let phys = aspace.to_host(virt);
                debug!("0x1714 => {:#x}", phys);
                let device = self.device.clone();
                let mut inner = device.lock();
                let DeviceInner {
                    mmio,
                    hypervisor,
                    bar3,
                    ..
                } = &mut *inner;
                self.bar3_channel.refresh(
                    mmio,
                    hypervisor.as_mut(),
                    bar3,
                    aspace,
                    &mut self.barrier,
                    phys,
                    self.para_virtualized,
                );
                bar3.refresh(mmio);
            }

            0x002254 => {
                // POLL_AREA base
                self.poll_area
                    .set_area(((cmd.value & FRAME_MASK) as u64) << 12);
                self.run.set_poll_area(self.poll_area.area());
                self.regs.set(cmd.offset, cmd.value);
                let device = self.device.clone();
                let mut inner = device.lock();
                let DeviceInner { mmio, bar1, .. } = &mut *inner;
                bar1.refresh_poll_area(mmio, self.device.chipset());
            }

            0x002270 => {
                // PLAYLIST_WR
                self.regs.set(cmd.offset, cmd.value);
            }

            0x002274 => {
                // PLAYLIST_WR_LEN: rebuild the physical runlist
                self.regs.set(cmd.offset, cmd.value);
                let address =
                    aspace.to_host(((self.regs.get(0x2270) & FRAME_MASK) as u64) << 12);
                let length = self.regs.get(0x2274);
                let device = self.device.clone();
                let mut inner = device.lock();
                let DeviceInner { mmio, playlist, .. } = &mut *inner;
                playlist.update(mmio, aspace, address, length);
            }

            0x002634 => {
                // channel kill
                if cmd.value >= self.pfifo.channels() {
                    return;
                }
                let phys = aspace.phys_channel_id(cmd.value);
                debug!("killing cid {:#x}", phys);
                let device = self.device.clone();
                let mut inner = device.lock();
                inner.mmio.write32(cmd.offset, phys);
                if !inner.mmio.wait_eq(0x002634, !0, phys) {
                    debug!("failed killing cid {:#x}", phys);
                }
                self.regs.set(cmd.offset, cmd.value);
            }

            0x070000 => {
                // RAMIN flush state
                let device = self.device.clone();
                let mut inner = device.lock();
                inner.mmio.write32(cmd.offset, cmd.value);
                debug!("RAMIN flush state write {:#x}", cmd.value);
            }

            0x022438 => {
                // memory controller count is virtualized; drop the write
            }

            0x100cb8 => {
                // TLB flush vspace
                self.regs.set(cmd.offset, cmd.value);
            }

            0x100cbc => {
                // TLB flush trigger
                self.regs.set(cmd.offset, cmd.value);
                let vspace = self.regs.get(0x100cb8);
                let trigger = self.regs.get(0x100cbc);
                let device = self.device.clone();
                let mut inner = device.lock();
                self.flush_tlb(&mut inner, vspace, trigger);
            }

            0x104050 | 0x104054 | 0x105050 | 0x105054 => {
                // PCOPY engine instance: point it at the shadow RAMIN
                let device = self.device.clone();
                let mut inner = device.lock();
                let value = self.encode_to_shadow_ramin(&mut inner, cmd.value);
                inner.mmio.write32(cmd.offset, value);
            }

            0x121c75 => {
                // memory controller count is virtualized; drop the write
            }

            0x400204 => {
                // icmd data
                self.regs.set(cmd.offset, cmd.value);
            }

            0x400200 => {
                // icmd trigger: replay data then command
                let data = self.regs.get(0x400204);
                let device = self.device.clone();
                let mut inner = device.lock();
                inner.mmio.write32(0x400204, data);
                inner.mmio.write32(0x400200, cmd.value);
                debug!("icmd {:#x}|{:#x}", data, cmd.value);
            }

            0x40448c => {
                // mthd data
                self.regs.set(cmd.offset, cmd.value);
            }

            0x404488 => {
                // mthd trigger
                let data = self.regs.get(0x40448c);
                let device = self.device.clone();
                let mut inner = device.lock();
                inner.mmio.write32(0x40448c, data);
                inner.mmio.write32(0x404488, cmd.value);
                debug!("method {:#x}|{:#x}", data, cmd.value);
            }

            0x409500 => {
                // WRCMD_DATA
                self.regs.set(cmd.offset, cmd.value);
            }

            0x409504 => {
                self.write_graph_cmd(cmd);
            }

            0x409b00 => {
                // graph IRQ channel instance: readback-only
            }

            0x4188b4 | 0x4188b8 => {
                // GPC broadcast addresses, 8-bit shifted
                self.regs.set(cmd.offset, cmd.value);
                let virt = (cmd.value as u64) << 8;
                let phys = aspace.to_host(virt);
                let device = self.device.clone();
                let mut inner = device.lock();
                inner.mmio.write32(cmd.offset, (phys >> 8) as u32);
            }

            0x610010 => {
                // PDISPLAY objects
                self.regs.set(cmd.offset, cmd.value);
                let value = cmd.value.wrapping_add((aspace.shift() >> 8) as u32);
                let device = self.device.clone();
                let mut inner = device.lock();
                inner.mmio.write32(cmd.offset, value);
            }

            offset if (0x700000..0x800000).contains(&offset) => {
                // PMEM sliding window into the guest's VRAM
                let base = aspace.to_host((self.regs.get(0x1700) as u64) << 16);
                let addr = base + (offset - 0x700000) as u64;
                let device = self.device.clone();
                let mut inner = device.lock();
                inner.mmio.write_host(addr, cmd.value, cmd.size());
                if self.barrier.tracked(addr) {
                    self.write_barrier(&mut inner, addr, cmd);
                }
            }

            offset if self.pfifo.in_range(offset) => {
                self.pfifo_write(cmd);
            }

            _ => {
                let device = self.device.clone();
                let mut inner = device.lock();
                inner.mmio.write(cmd.offset, cmd.value, cmd.size());
            }
        }
    }

    pub(crate) fn read_bar0(&mut self, cmd: &Command) -> u32 {
        let aspace = self.aspace;
        match cmd.offset {
            0x001700 | 0x001704 | 0x001714 | 0x002254 | 0x002270 | 0x002634 | 0x100cb8
            | 0x100cbc | 0x409500 | 0x409504 | 0x4188b4 | 0x4188b8 | 0x610010 => {
                self.regs.get(cmd.offset)
            }

            0x070000 => {
                let device = self.device.clone();
                let mut inner = device.lock();
                let value = inner.mmio.read32(cmd.offset);
                debug!("RAMIN flush state read {:#x}", value);
                value
            }

            0x022438 | 0x121c74 => {
                // memory controller partition count
                MEMORY_CTL_NUM
            }

            0x104050 | 0x104054 | 0x105050 | 0x105054 => {
                let device = self.device.clone();
                let mut inner = device.lock();
                let raw = inner.mmio.read32(cmd.offset);
                self.decode_to_virt_ramin(raw)
            }

            0x409b00 => {
                // graph IRQ channel instance, shifted back to guest form
                let device = self.device.clone();
                let mut inner = device.lock();
                let value = inner.mmio.read32(cmd.offset);
                value.wrapping_sub((aspace.shift() >> 12) as u32)
            }

            offset if (0x700000..0x800000).contains(&offset) => {
                let base = aspace.to_host((self.regs.get(0x1700) as u64) << 16);
                let addr = base + (offset - 0x700000) as u64;
                let device = self.device.clone();
                let mut inner = device.lock();
                let value = inner.mmio.read_host(addr, cmd.size());
                if self.barrier.tracked(addr) {
                    self.read_barrier(addr, cmd);
                }
                value
            }

            offset if self.pfifo.in_range(offset) => self.pfifo_read(cmd),

            // memory controller partition sizes
            0x11020c | 0x11120c | 0x11220c | 0x11320c | 0x11420c | 0x11520c | 0x11620c
            | 0x10f20c => (MEMORY_CTL_PART >> 20) as u32,

            _ => {
                let device = self.device.clone();
                let mut inner = device.lock();
                inner.mmio.read(cmd.offset, cmd.size())
            }
        }
    }

    /// WRCMD: if the data word carries a VRAM address, it names a channel
    /// RAMIN; emit the command once per channel with the frame field
    /// replaced by that channel's shadow RAMIN.
    fn write_graph_cmd(&mut self, cmd: &Command) {
        let aspace = self.aspace;
        self.regs.set(cmd.offset, cmd.value);
        let data = self.regs.get(0x409500);
        let device = self.device.clone();
        let mut inner = device.lock();

        if data & (1 << 31) != 0 {
            let virt = ((data & FRAME_MASK) as u64) << 12;
            let phys = aspace.to_host(virt);
            let rewritten = (data & !FRAME_MASK) | ((phys >> 12) as u32 & FRAME_MASK);

            let vcids = self.ramin_map.get(&phys).cloned().unwrap_or_default();
            if vcids.is_empty() {
                debug!("channel not found for graph command");
                inner.mmio.write32(0x409500, rewritten);
                inner.mmio.write32(0x409504, cmd.value);
                return;
            }

            debug!("WRCMD start cmd {:#x}", cmd.value);
            for vcid in vcids {
                if self.lazy_shadowing {
                    self.flush_channel(&mut inner, vcid);
                }
                let shadow = self.channels[vcid].shadow_ramin().address();
                let result = (data & !FRAME_MASK) | ((shadow >> 12) as u32 & FRAME_MASK);
                debug!(
                    "graph command for channel {} {:#x} => {:#x}",
                    vcid, data, result
                );
                inner.mmio.write32(0x409500, result);
                inner.mmio.write32(0x409504, cmd.value);
            }
            debug!("WRCMD end cmd {:#x}", cmd.value);
            return;
        }

        inner.mmio.write32(0x409500, data);
        inner.mmio.write32(0x409504, cmd.value);
    }

    // ── PFIFO channel table ────────────────────────────────────

    fn pfifo_write(&mut self, cmd: &Command) {
        let aspace = self.aspace;
        let access = self.pfifo.decompose(cmd.offset);
        if access.vcid >= self.pfifo.channels() {
            // beyond the per-guest budget; drop
            return;
        }
        let pcid = aspace.phys_channel_id(access.vcid);
        let adjusted = self.pfifo.adjust(cmd.offset, access.vcid, pcid);
        debug!("adjusted offset {:#x}", adjusted);

        if access.ramin_area {
            // RAMIN pointer: install the channel and point the device at
            // the shadow RAMIN
            self.regs.set(cmd.offset, cmd.value);
            let virt = ((cmd.value & FRAME_MASK) as u64) << 12;
            let phys = aspace.to_host(virt);
            let device = self.device.clone();
            let mut inner = device.lock();
            let shadow = self.refresh_channel(&mut inner, access.vcid as usize, phys);
            let value = (cmd.value & !FRAME_MASK) | ((shadow >> 12) as u32 & FRAME_MASK);
            debug!(
                "channel shift {} -> {} mem {:#x} -> {:#x}",
                access.vcid, pcid, phys, shadow
            );
            inner.mmio.write32(adjusted, value);
        } else {
            let device = self.device.clone();
            let mut inner = device.lock();
            inner.mmio.write32(adjusted, cmd.value);
        }
    }

    fn pfifo_read(&mut self, cmd: &Command) -> u32 {
        let aspace = self.aspace;
        let access = self.pfifo.decompose(cmd.offset);
        if access.vcid >= self.pfifo.channels() {
            return 0;
        }
        let pcid = aspace.phys_channel_id(access.vcid);
        let adjusted = self.pfifo.adjust(cmd.offset, access.vcid, pcid);
        if access.ramin_area {
            self.regs.get(cmd.offset)
        } else {
            let device = self.device.clone();
            let mut inner = device.lock();
            inner.mmio.read32(adjusted)
        }
    }

    // ── PCOPY instance encode/decode ───────────────────────────

    /// Rewrite a channel-instance register value to the shadow RAMIN of
    /// the channel it names.
    fn encode_to_shadow_ramin(&mut self, inner: &mut DeviceInner, value: u32) -> u32 {
        debug!("encoding channel {:#x}", value);
        if value == 0 {
            return value;
        }
        let virt = ((value & FRAME_MASK) as u64) << 12;
        let phys = self.aspace.to_host(virt);
        let vcids = self.ramin_map.get(&phys).cloned().unwrap_or_default();
        let Some(&vcid) = vcids.first() else {
            debug!("encoding channel not found");
            return value;
        };
        if self.lazy_shadowing {
            self.flush_channel(inner, vcid);
        }
        let shadow = self.channels[vcid].shadow_ramin().address();
        debug!("encode: virt {:#x} to shadow ramin {:#x}", virt, shadow);
        (value & !FRAME_MASK) | ((shadow >> 12) as u32 & FRAME_MASK)
    }

    /// Reverse mapping for readback: shadow RAMIN frame back to the
    /// guest's own RAMIN frame.
    fn decode_to_virt_ramin(&self, value: u32) -> u32 {
        debug!("decoding channel {:#x}", value);
        if value == 0 {
            return value;
        }
        let shadow = ((value & FRAME_MASK) as u64) << 12;
        for channel in self.channels.iter().filter(|c| c.enabled()) {
            if channel.shadow_ramin().address() == shadow {
                let virt = self.aspace.to_guest(channel.ramin_address());
                debug!("decode: shadow {:#x} to virt {:#x}", shadow, virt);
                return (value & !FRAME_MASK) | ((virt >> 12) as u32 & FRAME_MASK);
            }
        }
        0
    }
}
