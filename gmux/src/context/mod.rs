//! Per-guest mediation context.
//!
//! A `Context` is owned by one session thread and handles every command
//! record that guest emits. On INIT it acquires a guest slot and becomes a
//! `Guest`: the per-guest aggregate owning the channel array, the barrier
//! table, the BAR0 register shadow, the paravirt state and the scheduler
//! handle. Dispatch fans out by (bar, offset); the BAR-specific handlers
//! live in the sibling modules.
//!
//! Channels are held by value in a dense array. Operations that span a
//! channel and the rest of the guest state (barrier table, RAMIN lookup
//! map, sibling channels) are written as `Guest` methods with field-level
//! borrows instead of back pointers.

mod bar0;
mod bar1;
mod bar3;
mod bar4;
mod barrier;

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, trace};

use crate::aspace::AddressSpace;
use crate::bar_channel::{Bar1Channel, Bar3Channel};
use crate::barrier::BarrierTable;
use crate::channel::Channel;
use crate::command::{self, Command};
use crate::device::{DeviceInner, DeviceRef};
use crate::hypervisor::SlotSlab;
use crate::instruments::Instruments;
use crate::pfifo::Pfifo;
use crate::poll_area::PollArea;
use crate::pv::PvPage;
use crate::sched::{RunContext, Scheduler, Timer};
use crate::utility;
use crate::vram::ArenaRef;
use crate::DOMAIN_CHANNELS;

/// Sparse BAR0 register shadow: reads of mediated registers are served
/// from here, never from hardware.
#[derive(Default)]
pub struct RegisterShadow {
    words: HashMap<u32, u32>,
}

impl RegisterShadow {
    pub fn get(&self, offset: u32) -> u32 {
        self.words.get(&offset).copied().unwrap_or(0)
    }

    pub fn set(&mut self, offset: u32, value: u32) {
        self.words.insert(offset, value);
    }
}

pub struct Context {
    device: DeviceRef,
    sched: Arc<dyn Scheduler>,
    through: bool,
    guest: Option<Guest>,
    reply: u32,
}

impl Context {
    pub fn new(device: DeviceRef, sched: Arc<dyn Scheduler>, through: bool) -> Context {
        Context {
            device,
            sched,
            through,
            guest: None,
            reply: 0,
        }
    }

    /// The value to carry back in the reply record.
    pub fn reply(&self) -> u32 {
        self.reply
    }

    pub fn guest(&self) -> Option<&Guest> {
        self.guest.as_ref()
    }

    /// Handle one command record. Returns whether a reply must be posted
    /// before the next request is consumed.
    pub fn handle(&mut self, cmd: &Command) -> bool {
        match cmd.kind {
            command::TYPE_INIT => {
                let domid = cmd.value as i32;
                let para = cmd.offset != 0;
                match Guest::new(&self.device, &self.sched, domid, para) {
                    Ok(guest) => {
                        self.reply = guest.aspace.id;
                        info!(
                            "INIT domid {} as GPU {} with {}",
                            domid,
                            guest.aspace.id,
                            if para { "para-virt" } else { "full-virt" }
                        );
                        self.guest = Some(guest);
                    }
                    Err(e) => {
                        log::error!("guest init failed: {}", e);
                        self.reply = !0;
                    }
                }
                return true;
            }

            command::TYPE_BAR3 => {
                if let Some(guest) = &mut self.guest {
                    guest.bar3_address = ((cmd.value as u64) << 12) + cmd.offset as u64;
                    debug!("BAR3 address notification {:#x}", guest.bar3_address);
                }
                return false;
            }

            command::TYPE_UTILITY => {
                self.reply = self.handle_utility(cmd);
                return true;
            }

            _ => {}
        }

        if self.through {
            let mut inner = self.device.lock();
            match cmd.kind {
                command::TYPE_WRITE => {
                    inner
                        .mmio
                        .bar_write(cmd.bar as usize, cmd.offset as u64, cmd.value, cmd.size());
                    return false;
                }
                command::TYPE_READ => {
                    self.reply =
                        inner
                            .mmio
                            .bar_read(cmd.bar as usize, cmd.offset as u64, cmd.size());
                    return true;
                }
                _ => return false,
            }
        }

        let Some(guest) = &mut self.guest else {
            trace!("command before INIT dropped");
            self.reply = !0;
            return cmd.kind == command::TYPE_READ;
        };

        match cmd.kind {
            command::TYPE_WRITE => match cmd.bar {
                0 => {
                    guest.write_bar0(cmd);
                    trace!("BAR0 write {:#010x} {:#010x}", cmd.offset, cmd.value);
                    false
                }
                1 => {
                    guest.write_bar1(cmd);
                    trace!("BAR1 write {:#010x} {:#010x}", cmd.offset, cmd.value);
                    false
                }
                3 => {
                    guest.write_bar3(cmd);
                    trace!("BAR3 write {:#010x} {:#010x}", cmd.offset, cmd.value);
                    false
                }
                4 => {
                    self.reply = guest.write_bar4(cmd);
                    true
                }
                _ => false,
            },
            command::TYPE_READ => {
                self.reply = match cmd.bar {
                    0 => guest.read_bar0(cmd),
                    1 => guest.read_bar1(cmd),
                    3 => guest.read_bar3(cmd),
                    4 => guest.read_bar4(cmd),
                    _ => !0,
                };
                trace!("BAR{} read {:#010x} {:#010x}", cmd.bar, cmd.offset, self.reply);
                utility::inspect(cmd, self.reply);
                true
            }
            _ => false,
        }
    }

    fn handle_utility(&mut self, cmd: &Command) -> u32 {
        let mut inner = self.device.lock();
        match cmd.value {
            command::UTILITY_REGISTER_READ => inner.mmio.read32(cmd.offset),
            command::UTILITY_PGRAPH_STATUS => {
                let status = inner.mmio.read32(0x400700);
                debug!("PGRAPH status {:#x}", status);
                for pid in 0..crate::CHANNELS as u32 {
                    let offset = 0x3000 + 0x8 * pid + 0x4;
                    trace!("chan{} => {:#x}", pid, inner.mmio.read32(offset));
                }
                status
            }
            command::UTILITY_CLEAR_SHADOWING_UTILIZATION => {
                inner.clear_shadowing_utilization();
                debug!("cleared context shadowing utilizations");
                0
            }
            _ => 0,
        }
    }
}

pub struct Guest {
    device: DeviceRef,
    sched: Arc<dyn Scheduler>,
    arena: ArenaRef,
    aspace: AddressSpace,
    para_virtualized: bool,
    lazy_shadowing: bool,

    bar1_channel: Bar1Channel,
    bar3_channel: Bar3Channel,
    channels: Vec<Channel>,
    barrier: BarrierTable,
    poll_area: PollArea,
    regs: RegisterShadow,
    /// Host-physical RAMIN page -> ids of channels shadowing it.
    ramin_map: HashMap<u64, Vec<usize>>,
    bar3_address: u64,
    pfifo: Pfifo,
    instruments: Arc<Instruments>,
    run: Arc<RunContext>,

    // paravirt state
    pv_regs: HashMap<u32, u32>,
    slots: Option<Box<dyn SlotSlab>>,
    allocated: HashMap<u32, PvPage>,
    pgds: [Option<u32>; DOMAIN_CHANNELS],
    pv_bar1_pgd: Option<u32>,
    pv_bar1_large_pgt: Option<u32>,
    pv_bar1_small_pgt: Option<u32>,
    pv_bar3_pgd: Option<u32>,
    pv_bar3_pgt: Option<u32>,
}

impl Guest {
    fn new(
        device: &DeviceRef,
        sched: &Arc<dyn Scheduler>,
        domid: i32,
        para: bool,
    ) -> crate::Result<Guest> {
        let instruments = Arc::new(Instruments::default());
        let id = device.acquire_slot(instruments.clone())?;
        let aspace = AddressSpace { id, domid };
        let arena = device.arena().clone();

        let run = RunContext::new(id);
        run.set_domid(domid);
        sched.register_context(run.clone());

        let channels = (0..DOMAIN_CHANNELS)
            .map(|i| Channel::new(&arena, i))
            .collect();

        Ok(Guest {
            device: device.clone(),
            sched: sched.clone(),
            arena,
            aspace,
            para_virtualized: para,
            lazy_shadowing: device.config().lazy_shadowing,
            bar1_channel: Bar1Channel::new(para),
            bar3_channel: Bar3Channel::new(),
            channels,
            barrier: BarrierTable::new(aspace.shift(), aspace.vram_size()),
            poll_area: PollArea::new(device.chipset()),
            regs: RegisterShadow::default(),
            ramin_map: HashMap::new(),
            bar3_address: 0,
            pfifo: Pfifo::new(device.chipset()),
            instruments,
            run,
            pv_regs: HashMap::new(),
            slots: None,
            allocated: HashMap::new(),
            pgds: [None; DOMAIN_CHANNELS],
            pv_bar1_pgd: None,
            pv_bar1_large_pgt: None,
            pv_bar1_small_pgt: None,
            pv_bar3_pgd: None,
            pv_bar3_pgt: None,
        })
    }

    pub fn id(&self) -> u32 {
        self.aspace.id
    }

    pub fn aspace(&self) -> AddressSpace {
        self.aspace
    }

    pub fn bar3_address(&self) -> u64 {
        self.bar3_address
    }

    pub fn reg(&self, offset: u32) -> u32 {
        self.regs.get(offset)
    }

    pub fn channel(&self, vcid: usize) -> &Channel {
        &self.channels[vcid]
    }

    pub fn instruments(&self) -> &Arc<Instruments> {
        &self.instruments
    }

    /// Host address of the paravirt page directory assigned to a channel.
    fn pgd_address(&self, vcid: usize) -> Option<u64> {
        let id = self.pgds[vcid]?;
        self.allocated.get(&id).map(|p| p.address())
    }

    // ── channel shadow orchestration ───────────────────────────

    /// Install a channel's RAMIN pointer; returns the shadow RAMIN
    /// address the device must see instead.
    pub(crate) fn refresh_channel(
        &mut self,
        inner: &mut DeviceInner,
        vcid: usize,
        addr: u64,
    ) -> u64 {
        debug!(
            "mapping {:#x} with shadow {:#x}",
            addr,
            self.channels[vcid].shadow_ramin().address()
        );
        let mut old_remap = false;
        let old = self.channels[vcid].ramin_address();
        if self.channels[vcid].enabled() {
            if addr == old {
                return self.channels[vcid].shadow_ramin().address();
            }
            old_remap = !self.detach_channel(vcid);
        }
        self.channels[vcid].enable(addr);
        self.attach_channel(inner, vcid, addr);

        let DeviceInner {
            hypervisor, bar3, ..
        } = &mut *inner;
        bar3.reset_barrier(
            hypervisor.as_mut(),
            self.aspace,
            self.bar3_address,
            old,
            addr,
            old_remap,
        );
        self.channels[vcid].shadow_ramin().address()
    }

    /// Returns whether the old RAMIN page is still barrier-tracked.
    fn detach_channel(&mut self, vcid: usize) -> bool {
        let old = self.channels[vcid].ramin_address();
        debug!("detach channel {} from {:#x}", vcid, old);
        let still_tracked = self.barrier.unmap(old);
        if let Some(ids) = self.ramin_map.get_mut(&old) {
            ids.retain(|&id| id != vcid);
            if ids.is_empty() {
                self.ramin_map.remove(&old);
            }
        }
        still_tracked
    }

    fn attach_channel(&mut self, inner: &mut DeviceInner, vcid: usize, addr: u64) {
        self.shadow_channel(inner, vcid);
        self.ramin_map.entry(addr).or_default().push(vcid);
        self.barrier.map(addr);
    }

    /// Rebuild a channel's shadow RAMIN from the guest copy, translating
    /// the structure pointers it carries, then re-shadow its page table.
    pub(crate) fn shadow_channel(&mut self, inner: &mut DeviceInner, vcid: usize) {
        let aspace = self.aspace;
        let ramin = self.channels[vcid].ramin_address();
        let DeviceInner {
            mmio, hypervisor, ..
        } = &mut *inner;

        {
            let shadow = self.channels[vcid].shadow_ramin();
            let mut offset = 0u64;
            while offset < 0x1000 {
                let value = mmio.read_host32(ramin + offset);
                shadow.write32(mmio, offset, value);
                offset += 4;
            }
        }

        let mut pd_phys = 0u64;
        let mut pd_size = 0u64;
        if !self.para_virtualized {
            // page directory pointer and limit
            let pd_virt = mmio.read_host64(ramin + 0x0200);
            pd_phys = aspace.to_host(pd_virt);
            pd_size = mmio.read_host64(ramin + 0x0208);
            let shadow = self.channels[vcid].shadow_ramin();
            shadow.write64(mmio, 0x0200, pd_phys);
            shadow.write64(mmio, 0x0208, pd_size);
            debug!(
                "channel {} pd virt {:#x} phys {:#x} size {:#x}",
                vcid, pd_virt, pd_phys, pd_size
            );
        }

        // fault context pointer
        let fctx_virt = mmio.read_host64(ramin + 0x08);
        self.channels[vcid]
            .shadow_ramin()
            .write64(mmio, 0x08, aspace.to_host(fctx_virt));

        // MPEG context fields
        let mpeg_limit = mmio.read_host32(ramin + 0x60 + 0x04) as u64;
        self.channels[vcid].shadow_ramin().write32(
            mmio,
            0x60 + 0x04,
            aspace.to_host(mpeg_limit) as u32,
        );
        let mpeg_ctx = mmio.read_host32(ramin + 0x60 + 0x08) as u64;
        self.channels[vcid].shadow_ramin().write32(
            mmio,
            0x60 + 0x08,
            aspace.to_host(mpeg_ctx) as u32,
        );

        if !self.para_virtualized {
            let channel = &mut self.channels[vcid];
            channel.table_mut().refresh(
                mmio,
                hypervisor.as_mut(),
                &self.arena,
                aspace,
                pd_phys,
                pd_size,
            );
            let shadow_pd = channel.table().shadow_address();
            channel.write_shadow_page_table(mmio, shadow_pd);

            mmio.wait_ne(0x100c80, 0x00ff_0000, 0);
            mmio.write32(0x100cb8, (shadow_pd >> 8) as u32);
            mmio.write32(0x100cbc, 0x8000_0000 | 0x1);
            mmio.wait_eq(0x100c80, 0x0000_8000, 0x0000_8000);
        } else if let Some(pgd) = self.pgd_address(vcid) {
            debug!("set pgd for channel {} at {:#x}", vcid, pgd);
            self.channels[vcid].write_shadow_page_table(mmio, pgd);
        }
    }

    /// Deferred shadow rebuild: if the channel's group is dirty, rebuild
    /// the origin's shadow page directory once, clear every member's
    /// dirty flag and publish to the hardware TLB.
    pub(crate) fn flush_channel(&mut self, inner: &mut DeviceInner, vcid: usize) {
        if !self.channels[vcid].flush_needed() {
            return;
        }

        let origin = self.channels[vcid].derived_from().unwrap_or(vcid);
        let members = self.channels[origin].reuse_mask();
        for i in 0..DOMAIN_CHANNELS {
            if members & (1u64 << i) != 0 {
                self.channels[i].clear_flush_needed();
            }
        }

        let pd = self.channels[vcid].table().page_directory_address();
        let aspace = self.aspace;
        let DeviceInner {
            mmio, hypervisor, ..
        } = &mut *inner;

        let timer = Timer::start();
        self.channels[origin].table_mut().refresh_page_directories(
            mmio,
            hypervisor.as_mut(),
            &self.arena,
            aspace,
            pd,
        );
        self.instruments
            .increment_shadowing(timer.elapsed().to_std().unwrap_or_default());

        let shadow = self.channels[origin].table().shadow_address();
        debug!("flush channel {} shadow {:#x}", origin, shadow);
        mmio.wait_ne(0x100c80, 0x00ff_0000, 0);
        mmio.write32(0x100cb8, (shadow >> 8) as u32);
        mmio.write32(0x100cbc, 0x8000_0000 | 0x1);
        mmio.wait_eq(0x100c80, 0x0000_8000, 0x0000_8000);
    }

    fn remove_overridden_shadow(&mut self, inner: &mut DeviceInner, vcid: usize) {
        if let Some(origin) = self.channels[vcid].derived_from() {
            self.channels[origin].reuse_remove(vcid);
            self.channels[vcid].set_derived_from(None);
            let shadow = self.channels[vcid].table().shadow_address();
            self.channels[vcid].write_shadow_page_table(&mut inner.mmio, shadow);
        }
    }

    /// Guest TLB flush: rescan the BAR windows if their directory
    /// matches, and mark every matching channel dirty. The first matching
    /// channel becomes the origin of a shared shadow; the rest borrow it.
    pub(crate) fn flush_tlb(&mut self, inner: &mut DeviceInner, vspace: u32, trigger: u32) {
        let aspace = self.aspace;
        let page_directory =
            aspace.to_host(((vspace as u64) << 8) & ((1u64 << 40) - 1));
        debug!("TLB flush pd {:#x}", page_directory);

        if self.bar1_channel.table().page_directory_address() == page_directory {
            let DeviceInner {
                mmio,
                hypervisor,
                bar1,
                ..
            } = &mut *inner;
            self.bar1_channel.table_mut().refresh_page_directories(
                mmio,
                hypervisor.as_mut(),
                aspace,
                page_directory,
            );
            bar1.shadow(mmio, aspace, self.poll_area.area(), self.bar1_channel.table());
            bar1.flush(mmio);
        }

        if self.bar3_channel.page_directory_address() == page_directory {
            let DeviceInner {
                mmio,
                hypervisor,
                bar3,
                ..
            } = &mut *inner;
            self.bar3_channel
                .refresh_table(mmio, hypervisor.as_mut(), bar3, aspace, page_directory);
            bar3.shadow(
                mmio,
                hypervisor.as_mut(),
                aspace,
                &self.barrier,
                self.bar3_address,
            );
            bar3.flush(mmio);
        }

        let mut already = 0u64;
        let mut origin = 0usize;
        for vcid in 0..DOMAIN_CHANNELS {
            if !self.channels[vcid].enabled() {
                continue;
            }
            if self.channels[vcid].table().page_directory_address() != page_directory {
                continue;
            }
            self.channels[vcid].mark_flush_needed();
            if already != 0 {
                self.channels[origin].reuse_insert(vcid);
                self.channels[vcid].set_derived_from(Some(origin));
                self.channels[vcid].write_shadow_page_table(&mut inner.mmio, already);
            } else {
                if self.channels[vcid].is_overridden() {
                    self.remove_overridden_shadow(inner, vcid);
                }
                self.channels[vcid].reset_reuse();
                self.channels[vcid]
                    .table_mut()
                    .allocate_shadow(&self.arena, &mut inner.mmio);
                already = self.channels[vcid].table().shadow_address();
                origin = vcid;
                if !self.lazy_shadowing {
                    self.flush_channel(inner, vcid);
                }
            }
        }

        if already != 0 {
            debug!("flush {:#x}", already);
            inner.mmio.write32(0x100cb8, (already >> 8) as u32);
            inner.mmio.write32(0x100cbc, trigger);
        }
    }
}

impl Drop for Guest {
    fn drop(&mut self) {
        self.sched.unregister_context(self.aspace.id);
        self.device.release_slot(self.aspace.id);
        info!("END and release GPU id {}", self.aspace.id);
    }
}
