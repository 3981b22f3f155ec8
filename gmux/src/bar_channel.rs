//! Guest-side BAR1 and BAR3 channels.
//!
//! Each guest programs channel pointers for its BAR1 (doorbell window) and
//! BAR3 (RAMIN aperture) through BAR0. Neither channel gets hardware
//! pages of its own: BAR1 keeps a software mirror used to resolve guest
//! window offsets, BAR3 records its page directory and feeds the
//! device-wide BAR3 shadow.

use crate::aspace::AddressSpace;
use crate::barrier::BarrierTable;
use crate::device::DeviceBar3;
use crate::hypervisor::Hypervisor;
use crate::mmio::Mmio;
use crate::software_page_table::SoftwarePageTable;
use crate::BAR1_ARENA_SIZE;

pub struct Bar1Channel {
    enabled: bool,
    ramin_address: u64,
    table: SoftwarePageTable,
}

impl Bar1Channel {
    pub fn new(para: bool) -> Bar1Channel {
        Bar1Channel {
            enabled: false,
            ramin_address: 0,
            table: SoftwarePageTable::new(-1, para, BAR1_ARENA_SIZE),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn ramin_address(&self) -> u64 {
        self.ramin_address
    }

    pub fn table(&self) -> &SoftwarePageTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut SoftwarePageTable {
        &mut self.table
    }

    /// Rescan the guest's BAR1 page table from its RAMIN.
    pub fn shadow(
        &mut self,
        mmio: &mut Mmio,
        hv: &mut dyn Hypervisor,
        aspace: AddressSpace,
        para: bool,
    ) {
        if para {
            return;
        }
        let pd_virt = mmio.read_host64(self.ramin_address + 0x0200);
        let pd_phys = aspace.to_host(pd_virt);
        let pd_size = mmio.read_host64(self.ramin_address + 0x0208);
        self.table.refresh(mmio, hv, aspace, pd_phys, pd_size);
    }

    pub fn refresh(
        &mut self,
        mmio: &mut Mmio,
        hv: &mut dyn Hypervisor,
        aspace: AddressSpace,
        barrier: &mut BarrierTable,
        addr: u64,
        para: bool,
    ) {
        if self.enabled {
            if addr == self.ramin_address {
                return;
            }
            log::debug!(
                "BAR1 channel moves {:#x} -> {:#x}",
                self.ramin_address,
                addr
            );
            barrier.unmap(self.ramin_address);
        }
        self.enabled = true;
        self.ramin_address = addr;
        self.shadow(mmio, hv, aspace, para);
        barrier.map(addr);
    }
}

pub struct Bar3Channel {
    enabled: bool,
    ramin_address: u64,
    page_directory_address: u64,
}

impl Bar3Channel {
    pub fn new() -> Bar3Channel {
        Bar3Channel {
            enabled: false,
            ramin_address: 0,
            page_directory_address: 0,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn ramin_address(&self) -> u64 {
        self.ramin_address
    }

    pub fn page_directory_address(&self) -> u64 {
        self.page_directory_address
    }

    /// Record the guest's BAR3 page directory and rescan the device-wide
    /// shadow slice.
    pub fn refresh_table(
        &mut self,
        mmio: &mut Mmio,
        hv: &mut dyn Hypervisor,
        bar3: &mut DeviceBar3,
        aspace: AddressSpace,
        addr: u64,
    ) {
        self.page_directory_address = addr;
        bar3.refresh_table(mmio, hv, aspace, addr);
    }

    /// Re-read the page-directory pointer from the guest RAMIN.
    pub fn shadow(
        &mut self,
        mmio: &mut Mmio,
        hv: &mut dyn Hypervisor,
        bar3: &mut DeviceBar3,
        aspace: AddressSpace,
        para: bool,
    ) {
        if para {
            return;
        }
        let pd_virt = mmio.read_host64(self.ramin_address + 0x0200);
        let pd_phys = aspace.to_host(pd_virt);
        self.refresh_table(mmio, hv, bar3, aspace, pd_phys);
    }

    pub fn refresh(
        &mut self,
        mmio: &mut Mmio,
        hv: &mut dyn Hypervisor,
        bar3: &mut DeviceBar3,
        aspace: AddressSpace,
        barrier: &mut BarrierTable,
        addr: u64,
        para: bool,
    ) {
        if self.enabled {
            if addr == self.ramin_address {
                return;
            }
            log::debug!(
                "BAR3 channel moves {:#x} -> {:#x}",
                self.ramin_address,
                addr
            );
            barrier.unmap(self.ramin_address);
        }
        self.enabled = true;
        self.ramin_address = addr;
        self.shadow(mmio, hv, bar3, aspace, para);
        barrier.map(addr);
    }
}

impl Default for Bar3Channel {
    fn default() -> Self {
        Bar3Channel::new()
    }
}
