//! MMIO traffic inspector.
//!
//! Renders command records as one-line summaries for trace logging, with
//! well-known control registers annotated by name.

use std::collections::HashMap;

use crate::command::{self, Command};

lazy_static! {
    static ref REGISTER_NAMES: HashMap<u32, &'static str> = {
        let mut names = HashMap::new();
        names.insert(0x001700, "PMEM_WINDOW");
        names.insert(0x001704, "BAR1_CHAN");
        names.insert(0x001714, "BAR3_CHAN");
        names.insert(0x002254, "POLL_AREA");
        names.insert(0x002270, "PLAYLIST_WR");
        names.insert(0x002274, "PLAYLIST_WR_LEN");
        names.insert(0x00227c, "PLAYLIST_RD_LEN");
        names.insert(0x002634, "CHAN_KILL");
        names.insert(0x100cb8, "TLB_VSPACE");
        names.insert(0x100cbc, "TLB_TRIGGER");
        names.insert(0x100c80, "TLB_STATUS");
        names.insert(0x400700, "PGRAPH_STATUS");
        names.insert(0x409500, "WRCMD_DATA");
        names.insert(0x409504, "WRCMD_CMD");
        names.insert(0x4188b4, "GPC_BCAST_08B4");
        names.insert(0x4188b8, "GPC_BCAST_08B8");
        names.insert(0x610010, "PDISPLAY_OBJS");
        names
    };
}

pub fn examine(cmd: &Command, value: u32) -> Option<String> {
    if cmd.kind != command::TYPE_READ && cmd.kind != command::TYPE_WRITE {
        return None;
    }
    let rw = if cmd.kind == command::TYPE_READ { 'R' } else { 'W' };
    let v = if cmd.kind == command::TYPE_READ {
        value
    } else {
        cmd.value
    };
    let name = if cmd.bar == 0 {
        REGISTER_NAMES.get(&cmd.offset).copied()
    } else {
        None
    };
    Some(match name {
        Some(name) => format!(
            "[{}] BAR{} {:#010x} {:#010x} ({})",
            rw, cmd.bar, cmd.offset, v, name
        ),
        None => format!("[{}] BAR{} {:#010x} {:#010x}", rw, cmd.bar, cmd.offset, v),
    })
}

pub fn inspect(cmd: &Command, value: u32) {
    if let Some(line) = examine(cmd, value) {
        log::trace!("I {}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_examine_annotates_known_registers() {
        let cmd = Command {
            kind: command::TYPE_WRITE,
            value: 0x8000_0123,
            offset: 0x1704,
            bar: 0,
            size: 4,
        };
        let line = examine(&cmd, 0).unwrap();
        assert!(line.contains("BAR1_CHAN"));
        assert!(line.starts_with("[W] BAR0"));
    }

    #[test]
    fn test_examine_skips_non_access_records() {
        let cmd = Command {
            kind: command::TYPE_INIT,
            value: 0,
            offset: 0,
            bar: 0,
            size: 4,
        };
        assert!(examine(&cmd, 0).is_none());
    }
}
