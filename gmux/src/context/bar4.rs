//! BAR4 dispatch: the paravirt hypercall window.
//!
//! A cooperating guest driver writes its slot-buffer base into offsets
//! 0x4/0x8, reads offset 0x0 once to have the buffer foreign-mapped, then
//! triggers calls by writing a slot index to offset 0xC. Results go into
//! slot word 0; allocation calls also return the new page id in word 1.

use log::debug;

use crate::command::Command;
use crate::device::DeviceInner;
use crate::page_table::PageEntry;
use crate::pv::{self, op, PvPage, PvPageType, SlotView, CID_BAR1, CID_BAR3, SLOT_COUNT, SLOT_TOTAL};

use super::Guest;

impl Guest {
    pub(crate) fn write_bar4(&mut self, cmd: &Command) -> u32 {
        match cmd.offset {
            0x000000 => 0,

            0x000004 | 0x000008 => {
                self.pv_regs.insert(cmd.offset, cmd.value);
                0
            }

            0x00000c => {
                let pos = cmd.value as usize;
                if pos >= SLOT_COUNT {
                    return pv::EINVAL as u32;
                }
                let Some(mut slab) = self.slots.take() else {
                    return pv::EINVAL as u32;
                };
                let mut slot = SlotView::new(slab.as_mut(), pos);
                let result = self.pv_call(&mut slot);
                slot.set_u32(0, result as u32);
                self.slots = Some(slab);
                0
            }

            _ => 0,
        }
    }

    pub(crate) fn read_bar4(&mut self, cmd: &Command) -> u32 {
        match cmd.offset {
            0x000000 => {
                // map the guest slot buffer
                let lower = self.pv_regs.get(&0x4).copied().unwrap_or(0) as u64;
                let upper = self.pv_regs.get(&0x8).copied().unwrap_or(0) as u64;
                let gp = lower | (upper << 32);
                debug!("guest call data at {:#x}", gp);
                self.slots = None;
                let device = self.device.clone();
                let mut inner = device.lock();
                match inner
                    .hypervisor
                    .map_foreign_range(self.aspace.domid, SLOT_TOTAL, gp >> 12)
                {
                    Some(slab) => {
                        debug!("guest call data cookie {:#x}", slab.read32(0));
                        self.slots = Some(slab);
                        0
                    }
                    None => pv::EINVAL as u32,
                }
            }

            0x00000c => 0xdead_beef,

            _ => 0,
        }
    }

    fn pv_call(&mut self, slot: &mut SlotView) -> i32 {
        let code = slot.u8(0);
        self.instruments.hypercall(self.aspace.id, code);
        match code {
            op::SET_PGD => {
                let pgd_id = slot.u32(1);
                if !self.allocated.contains_key(&pgd_id) {
                    return pv::ENOENT;
                }
                let cid = slot.u32(2) as i32;
                debug!("SET_PGD cid {}", cid);
                match cid {
                    CID_BAR3 => self.pv_bar3_pgd = Some(pgd_id),
                    CID_BAR1 => self.pv_bar1_pgd = Some(pgd_id),
                    cid if (0..crate::DOMAIN_CHANNELS as i32).contains(&cid) => {
                        self.pgds[cid as usize] = Some(pgd_id);
                    }
                    _ => return pv::ERANGE,
                }
                if let Some(page) = self.allocated.get_mut(&pgd_id) {
                    page.set_page_type(PvPageType::PageDirectory);
                    page.mark_channel(cid);
                }
                0
            }

            op::MAP_PGT => {
                let pgd_id = slot.u32(1);
                if !self.allocated.contains_key(&pgd_id) {
                    return pv::ENOENT;
                }
                // slot words 2/3 carry small and large table ids, in that
                // order; a zero id leaves that branch alone
                let small_id = match slot.u32(2) {
                    0 => None,
                    id if self.allocated.contains_key(&id) => Some(id),
                    _ => return pv::ENOENT,
                };
                let large_id = match slot.u32(3) {
                    0 => None,
                    id if self.allocated.contains_key(&id) => Some(id),
                    _ => return pv::ENOENT,
                };

                if Some(pgd_id) == self.pv_bar1_pgd {
                    let aspace = self.aspace;
                    if large_id.is_some() && large_id != self.pv_bar1_large_pgt {
                        self.pv_bar1_large_pgt = large_id;
                        let pgt = &self.allocated[&large_id.unwrap()];
                        let device = self.device.clone();
                        let mut inner = device.lock();
                        let DeviceInner { mmio, bar1, .. } = &mut *inner;
                        self.bar1_channel.table_mut().pv_scan(mmio, 0, true, pgt);
                        bar1.shadow(
                            mmio,
                            aspace,
                            self.poll_area.area(),
                            self.bar1_channel.table(),
                        );
                    }
                    if small_id.is_some() && small_id != self.pv_bar1_small_pgt {
                        self.pv_bar1_small_pgt = small_id;
                        let pgt = &self.allocated[&small_id.unwrap()];
                        let device = self.device.clone();
                        let mut inner = device.lock();
                        let DeviceInner { mmio, bar1, .. } = &mut *inner;
                        self.bar1_channel.table_mut().pv_scan(mmio, 0, false, pgt);
                        bar1.shadow(
                            mmio,
                            aspace,
                            self.poll_area.area(),
                            self.bar1_channel.table(),
                        );
                    }
                    return 0;
                }
                if Some(pgd_id) == self.pv_bar3_pgd {
                    return 0;
                }

                let index = slot.u32(4) as u64;
                let pgd = &self.allocated[&pgd_id];
                if 8 * (index + 1) > pgd.size() {
                    return pv::ERANGE;
                }
                let large_word = large_id
                    .map(|id| (0x1 | (self.allocated[&id].address() >> 8)) as u32)
                    .unwrap_or(0);
                let small_word = small_id
                    .map(|id| (0x1 | (self.allocated[&id].address() >> 8)) as u32)
                    .unwrap_or(0);
                let device = self.device.clone();
                let mut inner = device.lock();
                let pgd = &self.allocated[&pgd_id];
                pgd.page().write32(&mut inner.mmio, 8 * index, large_word);
                pgd.page()
                    .write32(&mut inner.mmio, 8 * index + 4, small_word);
                0
            }

            op::MAP => {
                let pgt_id = slot.u32(1);
                if !self.allocated.contains_key(&pgt_id) {
                    return pv::ENOENT;
                }
                let index = slot.u32(2);
                let guest = slot.u64(2);
                let device = self.device.clone();
                let mut inner = device.lock();
                let host = self
                    .aspace
                    .translate_entry(PageEntry(guest), inner.hypervisor.as_mut());
                self.pv_map(&mut inner, pgt_id, index, guest, host.0)
            }

            op::MAP_BATCH => {
                let pgt_id = slot.u32(1);
                if !self.allocated.contains_key(&pgt_id) {
                    return pv::ENOENT;
                }
                let index = slot.u32(2);
                let stride = slot.u32(3) as u64;
                let count = slot.u32(4);
                let mut guest = slot.u64(3);
                let device = self.device.clone();
                let mut inner = device.lock();
                if Some(pgt_id) == self.pv_bar3_pgt {
                    let pages = crate::BAR3_ARENA_SIZE / crate::page_table::PAGE_SIZE;
                    if index as u64 + count as u64 > pages {
                        return pv::ERANGE;
                    }
                    let aspace = self.aspace;
                    let DeviceInner {
                        mmio,
                        hypervisor,
                        bar3,
                        ..
                    } = &mut *inner;
                    bar3.pv_reflect_batch(
                        mmio,
                        hypervisor.as_mut(),
                        aspace,
                        &self.barrier,
                        self.bar3_address,
                        index,
                        guest,
                        stride,
                        count,
                    );
                    return 0;
                }
                for i in 0..count {
                    let host = self
                        .aspace
                        .translate_entry(PageEntry(guest), inner.hypervisor.as_mut());
                    let ret = self.pv_map(&mut inner, pgt_id, index + i, guest, host.0);
                    if ret != 0 {
                        return ret;
                    }
                    guest = guest.wrapping_add(stride);
                }
                0
            }

            op::MAP_SG_BATCH => {
                let pgt_id = slot.u32(1);
                if !self.allocated.contains_key(&pgt_id) {
                    return pv::ENOENT;
                }
                let index = slot.u32(2);
                let count = slot.u32(3);
                let device = self.device.clone();
                let mut inner = device.lock();
                for i in 0..count {
                    let guest = slot.u64(2 + i as usize);
                    let host = self
                        .aspace
                        .translate_entry(PageEntry(guest), inner.hypervisor.as_mut());
                    let ret = self.pv_map(&mut inner, pgt_id, index + i, guest, host.0);
                    if ret != 0 {
                        return ret;
                    }
                }
                0
            }

            op::UNMAP_BATCH => {
                let pgt_id = slot.u32(1);
                if !self.allocated.contains_key(&pgt_id) {
                    return pv::ENOENT;
                }
                let index = slot.u32(2);
                let count = slot.u32(3);
                let device = self.device.clone();
                let mut inner = device.lock();
                for i in 0..count {
                    let ret = self.pv_map(&mut inner, pgt_id, index + i, 0, 0);
                    if ret != 0 {
                        return ret;
                    }
                }
                0
            }

            op::VM_FLUSH => {
                let pgd_id = slot.u32(1);
                if !self.allocated.contains_key(&pgd_id) {
                    return pv::ENOENT;
                }
                let device = self.device.clone();
                let mut inner = device.lock();
                if Some(pgd_id) == self.pv_bar1_pgd {
                    let DeviceInner { mmio, bar1, .. } = &mut *inner;
                    bar1.flush(mmio);
                    return 0;
                }
                if Some(pgd_id) == self.pv_bar3_pgd {
                    debug!("BAR3 flush");
                    let DeviceInner { mmio, bar3, .. } = &mut *inner;
                    bar3.flush(mmio);
                    return 0;
                }
                let engine = slot.u32(2);
                let address = self.allocated[&pgd_id].address();
                if !inner.mmio.wait_ne(0x100c80, 0x00ff_0000, 0) {
                    return pv::EINVAL;
                }
                inner.mmio.write32(0x100cb8, (address >> 8) as u32);
                inner.mmio.write32(0x100cbc, 0x8000_0000 | engine);
                if !inner.mmio.wait_eq(0x100c80, 0x0000_8000, 0x0000_8000) {
                    return pv::EINVAL;
                }
                0
            }

            op::MEM_ALLOC => {
                let bytes = slot.u32(1) as u64;
                let page = PvPage::alloc(&self.arena, bytes);
                {
                    let device = self.device.clone();
                    let mut inner = device.lock();
                    page.page().clear(&mut inner.mmio);
                }
                let id = page.id();
                debug_assert!(id != 0);
                debug_assert!(!self.allocated.contains_key(&id));
                slot.set_u32(1, id);
                self.allocated.insert(id, page);
                0
            }

            op::MEM_FREE => {
                self.allocated.remove(&slot.u32(1));
                0
            }

            op::BAR3_PGT => {
                let pgt_id = slot.u32(1);
                if !self.allocated.contains_key(&pgt_id) {
                    return pv::ENOENT;
                }
                if let Some(page) = self.allocated.get_mut(&pgt_id) {
                    page.set_page_type(PvPageType::PageTable);
                }
                self.pv_bar3_pgt = Some(pgt_id);
                0
            }

            _ => pv::EINVAL,
        }
    }

    /// Write one translated entry into a paravirt page table, routing the
    /// BAR-window tables to their device-side shadows.
    fn pv_map(
        &mut self,
        inner: &mut DeviceInner,
        pgt_id: u32,
        index: u32,
        guest: u64,
        host: u64,
    ) -> i32 {
        if Some(pgt_id) == self.pv_bar3_pgt {
            if index as u64 >= crate::BAR3_ARENA_SIZE / crate::page_table::PAGE_SIZE {
                return pv::ERANGE;
            }
            let aspace = self.aspace;
            let DeviceInner {
                mmio,
                hypervisor,
                bar3,
                ..
            } = &mut *inner;
            bar3.pv_reflect(
                mmio,
                hypervisor.as_mut(),
                aspace,
                &self.barrier,
                self.bar3_address,
                index,
                guest,
                host,
            );
            return 0;
        }
        if Some(pgt_id) == self.pv_bar1_large_pgt {
            let aspace = self.aspace;
            let DeviceInner {
                mmio,
                hypervisor,
                bar1,
                ..
            } = &mut *inner;
            self.bar1_channel.table_mut().pv_reflect_entry(
                hypervisor.as_mut(),
                aspace,
                0,
                true,
                index as usize,
                guest,
            );
            bar1.pv_reflect_entry(mmio, aspace, true, index, host);
            return 0;
        }
        if Some(pgt_id) == self.pv_bar1_small_pgt {
            let aspace = self.aspace;
            let DeviceInner {
                mmio,
                hypervisor,
                bar1,
                ..
            } = &mut *inner;
            self.bar1_channel.table_mut().pv_reflect_entry(
                hypervisor.as_mut(),
                aspace,
                0,
                false,
                index as usize,
                guest,
            );
            bar1.pv_reflect_entry(mmio, aspace, false, index, host);
            return 0;
        }

        let Some(pgt) = self.allocated.get(&pgt_id) else {
            return pv::ENOENT;
        };
        if 8 * (index as u64 + 1) > pgt.size() {
            debug!("entry index {} out of range", index);
            return pv::ERANGE;
        }
        pgt.page()
            .write32(&mut inner.mmio, 8 * index as u64, host as u32);
        pgt.page()
            .write32(&mut inner.mmio, 8 * index as u64 + 4, (host >> 32) as u32);
        0
    }
}
