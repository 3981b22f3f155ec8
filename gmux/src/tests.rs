//! Mediation-path tests against the in-memory device model.
//!
//! These drive whole command records through `Context::handle` the way a
//! session thread would, and assert on what reached the fake hardware,
//! the VRAM store and the hypervisor mock.

use std::sync::Arc;

use crate::command::{Command, TYPE_BAR3, TYPE_INIT, TYPE_READ, TYPE_WRITE};
use crate::context::Context;
use crate::page_table::PAGE_SIZE;
use crate::pv;
use crate::sched::fifo::FifoScheduler;
use crate::sched::Scheduler;
use crate::test_support::{harness, read_slot_word, write_slot, Harness};
use crate::MEMORY_SIZE;

fn sched_for(h: &Harness) -> Arc<dyn Scheduler> {
    Arc::new(FifoScheduler::new(h.device.clone()))
}

fn context(h: &Harness) -> Context {
    Context::new(h.device.clone(), sched_for(h), false)
}

fn init(ctx: &mut Context, domid: i32, para: bool) -> u32 {
    let cmd = Command {
        kind: TYPE_INIT,
        value: domid as u32,
        offset: para as u32,
        bar: 0,
        size: 4,
    };
    assert!(ctx.handle(&cmd));
    ctx.reply()
}

fn write(ctx: &mut Context, bar: u8, offset: u32, value: u32) {
    let cmd = Command {
        kind: TYPE_WRITE,
        value,
        offset,
        bar,
        size: 4,
    };
    ctx.handle(&cmd);
}

fn read(ctx: &mut Context, bar: u8, offset: u32) -> u32 {
    let cmd = Command {
        kind: TYPE_READ,
        value: 0,
        offset,
        bar,
        size: 4,
    };
    assert!(ctx.handle(&cmd));
    ctx.reply()
}

#[test]
fn test_init_assigns_dense_guest_ids() {
    let h = harness();
    let mut first = context(&h);
    let mut second = context(&h);
    assert_eq!(init(&mut first, 1, false), 0);
    assert_eq!(init(&mut second, 2, false), 1);
    drop(first);
    // the released slot is reused
    let mut third = context(&h);
    assert_eq!(init(&mut third, 3, false), 0);
}

#[test]
fn test_bar3_notification_records_base() {
    let h = harness();
    let mut ctx = context(&h);
    init(&mut ctx, 1, false);
    let cmd = Command {
        kind: TYPE_BAR3,
        value: 0x100,
        offset: 0,
        bar: 0,
        size: 4,
    };
    assert!(!ctx.handle(&cmd));
    assert_eq!(ctx.guest().unwrap().bar3_address(), 0x100000);
}

#[test]
fn test_bar1_channel_pointer_shadowed_and_read_back() {
    let h = harness();
    let mut ctx = context(&h);
    init(&mut ctx, 1, false);

    write(&mut ctx, 0, 0x1704, 0x8000_0123);
    // readback comes from the register shadow
    assert_eq!(read(&mut ctx, 0, 0x1704), 0x8000_0123);
    // the device saw our own BAR1 shadow channel, not the guest value
    let hw = h.bus.lock().unwrap().writes_to(0, 0x1704);
    assert!(!hw.is_empty());
    assert_ne!(*hw.last().unwrap(), 0x8000_0123);
    assert_eq!(hw.last().unwrap() & 0x8000_0000, 0x8000_0000);
}

#[test]
fn test_register_shadow_round_trip() {
    let h = harness();
    let mut ctx = context(&h);
    init(&mut ctx, 1, false);
    write(&mut ctx, 0, 0x409500, 0x1234_5678);
    assert_eq!(read(&mut ctx, 0, 0x409500), 0x1234_5678);
}

#[test]
fn test_memory_controller_reads_are_virtualized() {
    let h = harness();
    let mut ctx = context(&h);
    init(&mut ctx, 1, false);
    assert_eq!(read(&mut ctx, 0, 0x022438), 1);
    assert_eq!(read(&mut ctx, 0, 0x121c74), 1);
    // 512 MiB partition
    assert_eq!(read(&mut ctx, 0, 0x11020c), 512);
    assert_eq!(read(&mut ctx, 0, 0x10f20c), 512);
}

/// Install a channel through PFIFO with its guest RAMIN at `frame`,
/// carrying `pd_virt` at the page-directory slot.
fn install_channel(h: &Harness, ctx: &mut Context, vcid: u32, frame: u32, pd_virt: u64) {
    let shift = ctx.guest().unwrap().aspace().shift();
    let ramin = shift + ((frame as u64) << 12);
    {
        let mut bus = h.bus.lock().unwrap();
        bus.set_vram64(ramin + 0x200, pd_virt);
        bus.set_vram64(ramin + 0x208, 0);
    }
    write(ctx, 0, 0x3000 + vcid * 8, 0x8000_0000 | frame);
}

#[test]
fn test_pfifo_install_points_device_at_shadow_ramin() {
    let h = harness();
    let mut ctx = context(&h);
    init(&mut ctx, 1, false);

    install_channel(&h, &mut ctx, 1, 0x200, 0x40000);

    let guest = ctx.guest().unwrap();
    let channel = guest.channel(1);
    assert!(channel.enabled());
    assert_eq!(channel.ramin_address(), 0x200000);
    let shadow = channel.shadow_ramin().address();
    let shadow_pd = channel.table().shadow_address();
    assert_ne!(shadow, 0x200000);
    assert_ne!(shadow_pd, 0);

    let bus = h.bus.lock().unwrap();
    // the device-visible slot is the physical channel's, with the shadow
    // RAMIN frame
    let slot = bus.writes_to(0, 0x3000 + 1 * 8);
    assert_eq!(
        *slot.last().unwrap(),
        0x8000_0000 | (shadow >> 12) as u32
    );
    // the shadow RAMIN carries the translated page-directory pointer
    assert_eq!(bus.vram32(shadow + 0x200), 0x40000);
    assert_eq!(bus.vram32(shadow + 0x204), 0);
    // and the TLB refresh was pointed at the shadow page directory
    assert_eq!(
        *bus.writes_to(0, 0x100cb8).last().unwrap(),
        (shadow_pd >> 8) as u32
    );
}

#[test]
fn test_pfifo_rejects_vcid_beyond_budget() {
    let h = harness();
    let mut ctx = context(&h);
    init(&mut ctx, 1, false);
    let before = h.bus.lock().unwrap().writes.len();
    write(&mut ctx, 0, 0x3000 + 80 * 8, 0x8000_0000 | 0x200);
    // dropped: nothing reached the device
    assert_eq!(h.bus.lock().unwrap().writes.len(), before);
}

#[test]
fn test_pmem_write_fans_out_to_shadow_ramin() {
    let h = harness();
    let mut ctx = context(&h);
    init(&mut ctx, 1, false);
    install_channel(&h, &mut ctx, 2, 0x200, 0x40000);
    let shadow = ctx.guest().unwrap().channel(2).shadow_ramin().address();

    // point the PMEM window at the RAMIN page and write through it
    write(&mut ctx, 0, 0x1700, 0x20);
    write(&mut ctx, 0, 0x700010, 0xabcd_1234);

    let bus = h.bus.lock().unwrap();
    assert_eq!(bus.vram32(0x200010), 0xabcd_1234);
    assert_eq!(bus.vram32(shadow + 0x10), 0xabcd_1234);
}

#[test]
fn test_tlb_flush_shares_one_shadow_across_matching_channels() {
    let h = harness();
    let mut ctx = context(&h);
    init(&mut ctx, 1, false);
    install_channel(&h, &mut ctx, 1, 0x200, 0x40000);
    install_channel(&h, &mut ctx, 2, 0x202, 0x40000);

    write(&mut ctx, 0, 0x100cb8, 0x400); // pd 0x40000 >> 8
    write(&mut ctx, 0, 0x100cbc, 0x8000_0001);

    let guest = ctx.guest().unwrap();
    let origin = guest.channel(1);
    let borrower = guest.channel(2);
    assert!(!origin.is_overridden());
    assert!(borrower.is_overridden());
    assert_eq!(borrower.derived_from(), Some(1));
    assert_ne!(origin.reuse_mask() & (1 << 2), 0);
    // eager shadowing already flushed the origin; the borrower stays
    // dirty until its own fire
    assert!(!origin.flush_needed());
    assert!(borrower.flush_needed());

    let bus = h.bus.lock().unwrap();
    let shadow_pd = origin.table().shadow_address();
    assert_eq!(
        *bus.writes_to(0, 0x100cb8).last().unwrap(),
        (shadow_pd >> 8) as u32
    );
    assert_eq!(*bus.writes_to(0, 0x100cbc).last().unwrap(), 0x8000_0001);
}

#[test]
fn test_gpc_broadcast_addresses_are_shifted() {
    let h = harness();
    let mut ctx0 = context(&h);
    let mut ctx1 = context(&h);
    init(&mut ctx0, 1, false);
    init(&mut ctx1, 2, false);

    write(&mut ctx1, 0, 0x4188b4, 0x1234);
    let bus = h.bus.lock().unwrap();
    let expected = 0x1234 + (MEMORY_SIZE >> 8) as u32;
    assert_eq!(*bus.writes_to(0, 0x4188b4).last().unwrap(), expected);
    drop(bus);
    // readback returns the guest's own value
    assert_eq!(read(&mut ctx1, 0, 0x4188b4), 0x1234);
}

#[test]
fn test_playlist_rewrites_virtual_channels_to_physical() {
    let h = harness();
    let mut ctx0 = context(&h);
    let mut ctx1 = context(&h);
    init(&mut ctx0, 1, false);
    init(&mut ctx1, 2, false);

    let guest_runlist = 0x10000u64;
    {
        let mut bus = h.bus.lock().unwrap();
        let host = MEMORY_SIZE + guest_runlist;
        bus.set_vram32(host, 0);
        bus.set_vram32(host + 8, 5);
        bus.set_vram32(host + 16, 7);
    }
    write(&mut ctx1, 0, 0x2270, (guest_runlist >> 12) as u32);
    write(&mut ctx1, 0, 0x2274, 3);

    let bus = h.bus.lock().unwrap();
    assert_eq!(*bus.writes_to(0, 0x2274).last().unwrap(), 3);
    let page = (*bus.writes_to(0, 0x2270).last().unwrap() as u64) << 12;
    // guest 1's vcids 0, 5, 7 become pcids 64, 69, 71, ascending
    for (i, pcid) in [64u32, 69, 71].iter().enumerate() {
        assert_eq!(bus.vram32(page + i as u64 * 8), *pcid);
        assert_eq!(bus.vram32(page + i as u64 * 8 + 4), 0x4);
    }
}

#[test]
fn test_channel_kill_remaps_channel_id() {
    let h = harness();
    let mut ctx0 = context(&h);
    let mut ctx1 = context(&h);
    init(&mut ctx0, 1, false);
    init(&mut ctx1, 2, false);

    write(&mut ctx1, 0, 0x2634, 5);
    let bus = h.bus.lock().unwrap();
    assert_eq!(*bus.writes_to(0, 0x2634).last().unwrap(), 69);
    drop(bus);
    assert_eq!(read(&mut ctx1, 0, 0x2634), 5);
}

// ── paravirt ────────────────────────────────────────────────────

fn pv_context(h: &Harness, domid: i32) -> (Context, u32) {
    let mut ctx = Context::new(h.device.clone(), sched_for(h), false);
    let id = init(&mut ctx, domid, true);
    // slot buffer at guest frame 0x30
    write(&mut ctx, 4, 0x4, 0x30000);
    write(&mut ctx, 4, 0x8, 0);
    assert_eq!(read(&mut ctx, 4, 0x0), 0);
    (ctx, id)
}

fn pv_call(h: &Harness, ctx: &mut Context, words: &[(usize, u32)]) -> u32 {
    write_slot(&h.hv, 0, words);
    write(ctx, 4, 0xc, 0);
    read_slot_word(&h.hv, 0, 0)
}

#[test]
fn test_pv_alloc_and_map_translate_entries() {
    let h = harness();
    let mut ctx0 = context(&h);
    init(&mut ctx0, 1, false);
    let (mut ctx, id) = pv_context(&h, 5);
    assert_eq!(id, 1);

    let ret = pv_call(&h, &mut ctx, &[(0, pv::op::MEM_ALLOC as u32), (1, 0x1000)]);
    assert_eq!(ret, 0);
    let page_id = read_slot_word(&h.hv, 0, 1);
    assert_ne!(page_id & (1 << 28), 0);
    let page_addr = ((page_id & 0x0fff_ffff) as u64) << 12;

    // map guest VRAM frame 0x40 at entry 0
    let raw = 1 | (0x40u32 << 4);
    let ret = pv_call(
        &h,
        &mut ctx,
        &[
            (0, pv::op::MAP as u32),
            (1, page_id),
            (2, 0),
            (4, raw),
            (5, 0),
        ],
    );
    assert_eq!(ret, 0);

    let bus = h.bus.lock().unwrap();
    // the address field was shifted into guest 1's VRAM window
    let frame = 0x40 + (MEMORY_SIZE >> 12) as u32;
    assert_eq!(bus.vram32(page_addr), 1 | (frame << 4));
}

#[test]
fn test_pv_error_codes() {
    let h = harness();
    let (mut ctx, _) = pv_context(&h, 5);

    // unknown op
    assert_eq!(pv_call(&h, &mut ctx, &[(0, 99)]), pv::EINVAL as u32);
    // unknown page id
    assert_eq!(
        pv_call(&h, &mut ctx, &[(0, pv::op::MAP as u32), (1, 0x1234)]),
        pv::ENOENT as u32
    );

    // out-of-range entry index in a one-page table
    let ret = pv_call(&h, &mut ctx, &[(0, pv::op::MEM_ALLOC as u32), (1, 0x1000)]);
    assert_eq!(ret, 0);
    let page_id = read_slot_word(&h.hv, 0, 1);
    let ret = pv_call(
        &h,
        &mut ctx,
        &[(0, pv::op::MAP as u32), (1, page_id), (2, 512), (4, 1), (5, 0)],
    );
    assert_eq!(ret, pv::ERANGE as u32);
}

#[test]
fn test_pv_bar3_map_reaches_hypervisor() {
    let h = harness();
    let (mut ctx, id) = pv_context(&h, 5);
    assert_eq!(id, 0);

    // guest announces its BAR3 base
    let cmd = Command {
        kind: TYPE_BAR3,
        value: 0x300,
        offset: 0,
        bar: 0,
        size: 4,
    };
    ctx.handle(&cmd);

    let ret = pv_call(&h, &mut ctx, &[(0, pv::op::MEM_ALLOC as u32), (1, 0x1000)]);
    assert_eq!(ret, 0);
    let pgt_id = read_slot_word(&h.hv, 0, 1);
    assert_eq!(
        pv_call(&h, &mut ctx, &[(0, pv::op::BAR3_PGT as u32), (1, pgt_id)]),
        0
    );

    // map page 2 of the BAR3 window
    let raw = 1 | (0x40u32 << 4);
    let ret = pv_call(
        &h,
        &mut ctx,
        &[
            (0, pv::op::MAP as u32),
            (1, pgt_id),
            (2, 2),
            (4, raw),
            (5, 0),
        ],
    );
    assert_eq!(ret, 0);

    let hv = h.hv.lock().unwrap();
    let guest_frame = (0x300000u64 + 2 * PAGE_SIZE) >> 12;
    let host_frame = (0xe000_0000u64 + 2 * PAGE_SIZE) >> 12;
    assert!(hv
        .added
        .iter()
        .any(|&(domid, gpfn, mfn, count)| domid == 5
            && gpfn == guest_frame
            && mfn == host_frame
            && count == 1));
}

#[test]
fn test_pv_set_pgd_rejects_bad_channel() {
    let h = harness();
    let (mut ctx, _) = pv_context(&h, 5);
    let ret = pv_call(&h, &mut ctx, &[(0, pv::op::MEM_ALLOC as u32), (1, 0x1000)]);
    assert_eq!(ret, 0);
    let pgd_id = read_slot_word(&h.hv, 0, 1);
    assert_eq!(
        pv_call(
            &h,
            &mut ctx,
            &[(0, pv::op::SET_PGD as u32), (1, pgd_id), (2, 200)]
        ),
        pv::ERANGE as u32
    );
    assert_eq!(
        pv_call(
            &h,
            &mut ctx,
            &[(0, pv::op::SET_PGD as u32), (1, pgd_id), (2, 3)]
        ),
        0
    );
}

// ── scheduler and session ───────────────────────────────────────

#[test]
fn test_fire_flows_through_scheduler_to_doorbell() {
    let h = harness();
    let sched: Arc<dyn Scheduler> = Arc::new(FifoScheduler::new(h.device.clone()));
    sched.start();
    let mut ctx = Context::new(h.device.clone(), sched.clone(), false);
    init(&mut ctx, 1, false);

    // poll area at 0x10000, fire channel 1
    write(&mut ctx, 0, 0x2254, 0x10);
    write(&mut ctx, 1, 0x10000 + 0x1000 + 0x8c, 0xbeef);

    let expected = (0x1000 + 0x8c) as u64;
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        {
            let bus = h.bus.lock().unwrap();
            if bus.writes_to(1, expected).contains(&0xbeef) {
                break;
            }
        }
        assert!(
            std::time::Instant::now() < deadline,
            "doorbell write never reached the device"
        );
        std::thread::yield_now();
    }
    assert_eq!(ctx.guest().unwrap().channel(1).submitted(), 0xbeef);
    sched.stop();
}

#[test]
fn test_session_init_round_trip() {
    use std::io::{Read, Write as IoWrite};

    let h = harness();
    let sched: Arc<dyn Scheduler> = Arc::new(FifoScheduler::new(h.device.clone()));
    let dir = tempfile::tempdir().unwrap();
    let endpoint = dir.path().join("gmux.sock");
    let endpoint = endpoint.to_str().unwrap().to_string();

    let server =
        crate::session::Server::bind(h.device.clone(), sched, &endpoint).unwrap();
    std::thread::spawn(move || {
        let _ = server.run();
    });

    let mut stream = std::os::unix::net::UnixStream::connect(&endpoint).unwrap();
    let cmd = Command {
        kind: TYPE_INIT,
        value: 7,
        offset: 0,
        bar: 0,
        size: 4,
    };
    stream.write_all(&cmd.encode()).unwrap();
    let mut reply = [0u8; 16];
    stream.read_exact(&mut reply).unwrap();
    let reply = Command::decode(&reply).unwrap();
    assert_eq!(reply.value, 0);
}
