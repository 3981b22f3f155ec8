//! gmux — user-space GPU mediation for Fermi/Kepler-class NVIDIA GPUs
//!
//! gmux sits between guest VMs and a single physical GPU. Each guest talks
//! to a per-guest session over a Unix socket using fixed 16-byte command
//! records describing MMIO accesses to the four device apertures (BAR0
//! control registers, BAR1 doorbells, BAR3 RAMIN window, BAR4 paravirt
//! window). The mediation core rewrites addresses and channel IDs so that
//! every guest sees a private GPU carved out of the real one:
//!
//! - guest GPU addresses are shifted into a per-guest VRAM window and
//!   guest-authored page tables are scanned into host-side shadow copies,
//! - channel control blocks (RAMIN) are shadowed with their internal
//!   pointers rewritten to host-physical form,
//! - channel IDs and runlists are remapped from per-guest to physical,
//! - command submission is serialized by a pluggable GPU-time scheduler
//!   (FIFO, credit, band).
//!
//! A cooperating paravirtualized guest driver can bypass the scan-and-shadow
//! path entirely through a slot-based hypercall interface on BAR4.

#[macro_use]
extern crate lazy_static;

pub mod aspace;
pub mod bar_channel;
pub mod barrier;
pub mod bus;
pub mod channel;
pub mod chipset;
pub mod command;
pub mod config;
pub mod context;
pub mod device;
pub mod hypervisor;
pub mod instruments;
pub mod logger;
pub mod mmio;
pub mod page_table;
pub mod pfifo;
pub mod poll_area;
pub mod pv;
pub mod sched;
pub mod session;
pub mod shadow_page_table;
pub mod software_page_table;
pub mod utility;
pub mod vram;

#[cfg(test)]
pub mod test_support;
#[cfg(test)]
mod tests;

use std::fmt;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Physical GPU channels.
pub const CHANNELS: usize = 128;
/// Channels assignable to one guest; vcid space is `[0, DOMAIN_CHANNELS)`.
pub const DOMAIN_CHANNELS: usize = CHANNELS / 2;
/// Guest slots multiplexed onto the device.
pub const VM_COUNT: usize = 2;

/// Per-guest VRAM quota. Guest GPU addresses are shifted by
/// `id * MEMORY_SIZE` to form host-physical addresses.
pub const MEMORY_SIZE: u64 = 512 << 20;
/// Memory-controller partition count reported to guests.
pub const MEMORY_CTL_NUM: u32 = 1;
/// Memory-controller partition size reported to guests.
pub const MEMORY_CTL_PART: u64 = 512 << 20;

/// Span of the BAR0 register shadow.
pub const BAR0_SIZE: u64 = 32 << 20;
/// Span of the BAR4 paravirt window.
pub const BAR4_SIZE: u64 = 0x1000;

/// Host-VRAM arena backing shadow structures. Placed above every guest's
/// VRAM window.
pub const ARENA_BASE: u64 = MEMORY_SIZE * VM_COUNT as u64;
pub const ARENA_SIZE: u64 = 512 << 20;

/// Raw BAR1 window size.
pub const BAR1_ARENA_SIZE: u64 = 128 << 20;
/// Per-guest slice of the BAR3 shadow aperture.
pub const BAR3_ARENA_SIZE: u64 = 32 << 20;
/// Whole BAR3 shadow span.
pub const BAR3_TOTAL_SIZE: u64 = BAR3_ARENA_SIZE * VM_COUNT as u64;

/// Errors surfaced by the mediation core. Guest protocol violations are
/// reported back to the guest as negative codes in the reply record and do
/// not use this type.
#[derive(Debug)]
pub enum Error {
    /// PCI device with the requested BDF was not found or could not be
    /// opened.
    DeviceNotFound(String),
    /// Underlying I/O failure (socket, sysfs resource files).
    Io(std::io::Error),
    /// A register poll did not converge within the timeout.
    PollTimeout { offset: u32 },
    /// A hypervisor call failed; the guest mapping is degraded.
    Hypervisor(&'static str),
    /// No free guest slot is available.
    NoFreeSlot,
    /// Malformed command record on the session transport.
    BadRecord,
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::DeviceNotFound(bdf) => write!(f, "GPU not found at {}", bdf),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::PollTimeout { offset } => {
                write!(f, "register poll timed out at {:#08x}", offset)
            }
            Error::Hypervisor(what) => write!(f, "hypervisor call failed: {}", what),
            Error::NoFreeSlot => write!(f, "all guest slots are in use"),
            Error::BadRecord => write!(f, "malformed command record"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}
