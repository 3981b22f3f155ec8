//! Hypervisor interface.
//!
//! The mediation core needs four services from the hypervisor: resolving a
//! guest frame number to a machine frame, adding and removing machine-frame
//! mappings in a guest's physmap (BAR3 remapping), and mapping a range of
//! guest memory into the daemon (the paravirt slot buffer). The toolstack
//! binding is a deployment concern; this trait is the boundary, and the
//! default backend degrades gracefully so the daemon runs without one.

use log::warn;

/// A guest buffer mapped into the daemon. Used for the BAR4 hypercall
/// slots.
pub trait SlotSlab: Send {
    fn read8(&self, offset: usize) -> u8;
    fn read32(&self, offset: usize) -> u32;
    fn read64(&self, offset: usize) -> u64;
    fn write32(&mut self, offset: usize, value: u32);
}

pub trait Hypervisor: Send {
    /// Resolve a guest page frame to a machine frame.
    fn gfn_to_mfn(&mut self, domid: i32, gfn: u64) -> u64;

    /// Map `count` machine frames starting at `mfn` into the guest physmap
    /// at `gpfn`.
    fn add_memory_mapping(&mut self, domid: i32, gpfn: u64, mfn: u64, count: u64);

    /// Remove such a mapping.
    fn remove_memory_mapping(&mut self, domid: i32, gpfn: u64, mfn: u64, count: u64);

    /// Map `bytes` of guest memory starting at guest frame `gpfn` into the
    /// daemon, read-write.
    fn map_foreign_range(
        &mut self,
        domid: i32,
        bytes: usize,
        gpfn: u64,
    ) -> Option<Box<dyn SlotSlab>>;
}

/// Backend used when no hypervisor binding is available: frame resolution
/// is the identity, physmap edits are dropped, and foreign mapping fails.
/// Guests still run, with system-memory surfaces degraded.
pub struct NullHypervisor;

impl Hypervisor for NullHypervisor {
    fn gfn_to_mfn(&mut self, _domid: i32, gfn: u64) -> u64 {
        gfn
    }

    fn add_memory_mapping(&mut self, domid: i32, gpfn: u64, _mfn: u64, count: u64) {
        warn!(
            "dropping physmap add for dom{} at {:#x} ({} pages)",
            domid, gpfn, count
        );
    }

    fn remove_memory_mapping(&mut self, _domid: i32, _gpfn: u64, _mfn: u64, _count: u64) {}

    fn map_foreign_range(
        &mut self,
        domid: i32,
        bytes: usize,
        gpfn: u64,
    ) -> Option<Box<dyn SlotSlab>> {
        warn!(
            "cannot foreign-map {:#x} bytes of dom{} at frame {:#x}",
            bytes, domid, gpfn
        );
        None
    }
}
