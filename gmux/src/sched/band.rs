//! Bandwidth-aware (BAND) scheduler.
//!
//! Like the credit scheduler, but the pick classifies runnable contexts
//! each round: `over` has negative budget, `band` is within budget but
//! above its fair share of the period's observed bandwidth, `under` is
//! everything else. Picks prefer under → band → over. Before switching
//! away from a lighter current context to a heavier one, the scheduler
//! yields briefly and rechecks, damping thrash while a command finishes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use chrono::Duration;

use crate::command::Command;
use crate::device::DeviceRef;

use super::sampler::Sampler;
use super::{
    submit_to_device, yield_chance, RunContext, Scheduler, Timer, Wakeup, DEFAULT_PERIOD,
    DEFAULT_SAMPLE,
};

struct Counters {
    bandwidth: Duration,
    gpu_idle: Duration,
    previous_bandwidth: Duration,
}

impl Counters {
    fn new() -> Counters {
        Counters {
            bandwidth: Duration::zero(),
            gpu_idle: Duration::zero(),
            previous_bandwidth: Duration::zero(),
        }
    }
}

struct Shared {
    running: AtomicBool,
    wakeup: Wakeup,
    contexts: Arc<Mutex<Vec<Arc<RunContext>>>>,
    fire: Mutex<()>,
    counters: Mutex<Counters>,
    current: Mutex<Option<Arc<RunContext>>>,
    period: Duration,
}

pub struct BandScheduler {
    device: DeviceRef,
    shared: Arc<Shared>,
    sampler: Arc<Sampler>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BandScheduler {
    pub fn new(device: DeviceRef) -> BandScheduler {
        let contexts = Arc::new(Mutex::new(Vec::new()));
        let sampler = Sampler::new(contexts.clone(), Duration::milliseconds(DEFAULT_SAMPLE));
        BandScheduler {
            device,
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                wakeup: Wakeup::new(),
                contexts,
                fire: Mutex::new(()),
                counters: Mutex::new(Counters::new()),
                current: Mutex::new(None),
                period: Duration::milliseconds(DEFAULT_PERIOD),
            }),
            sampler,
            workers: Mutex::new(Vec::new()),
        }
    }
}

/// Whether a context consumed more than its fair share of the bandwidth
/// observed since the last replenish. A period with no observed
/// bandwidth counts as over-share, which only biases the very first
/// pick.
fn utilization_over_bandwidth(
    counters: &Counters,
    ctx: &RunContext,
    context_count: usize,
) -> bool {
    if counters.bandwidth == Duration::zero() {
        return true;
    }
    let n = context_count.max(1) as i32;
    if ctx.bandwidth_used() > counters.previous_bandwidth / n {
        return true;
    }
    let used = ctx.bandwidth_used().num_microseconds().unwrap_or(0);
    let total = counters.bandwidth.num_microseconds().unwrap_or(0);
    used * n as i64 > total
}

fn select_next(shared: &Shared, idle: bool, idle_timer: &Timer) -> Option<Arc<RunContext>> {
    let mut contexts = shared.contexts.lock().unwrap();
    let count = contexts.len();
    if idle {
        let mut counters = shared.counters.lock().unwrap();
        counters.gpu_idle = counters.gpu_idle + idle_timer.elapsed();
    }

    let current = shared.current.lock().unwrap().clone();
    if let Some(current) = &current {
        let counters = shared.counters.lock().unwrap();
        if current.budget() < Duration::zero()
            && utilization_over_bandwidth(&counters, current, count)
        {
            if let Some(pos) = contexts.iter().position(|c| c.id() == current.id()) {
                let ctx = contexts.remove(pos);
                contexts.push(ctx);
            }
        }
    }

    let mut band: Option<Arc<RunContext>> = None;
    let mut under: Option<Arc<RunContext>> = None;
    let mut over: Option<Arc<RunContext>> = None;
    {
        let counters = shared.counters.lock().unwrap();
        for ctx in contexts.iter() {
            if !ctx.is_suspended() {
                continue;
            }
            if ctx.budget() < Duration::zero() {
                over.get_or_insert_with(|| ctx.clone());
            } else if utilization_over_bandwidth(&counters, ctx, count) {
                band.get_or_insert_with(|| ctx.clone());
            } else {
                under.get_or_insert_with(|| ctx.clone());
            }
            if over.is_some() && under.is_some() && band.is_some() {
                break;
            }
        }
    }
    drop(contexts);

    let next = under.or(band).or(over);
    let Some(current) = current else { return next };

    if let Some(next_ctx) = &next {
        let switch_to_heavier = {
            let counters = shared.counters.lock().unwrap();
            next_ctx.id() != current.id()
                && utilization_over_bandwidth(&counters, next_ctx, count)
                && !utilization_over_bandwidth(&counters, &current, count)
                && next_ctx.bandwidth_used() > current.bandwidth_used()
        };
        if switch_to_heavier {
            yield_chance(Duration::microseconds(500));
            if current.is_suspended() {
                return Some(current);
            }
        }
    }
    next
}

fn submit(device: &DeviceRef, shared: &Shared, sampler: &Sampler, ctx: &Arc<RunContext>) {
    let _fire = shared.fire.lock().unwrap();
    let cmd: Option<Command> = ctx.dequeue();
    let Some(cmd) = cmd else { return };
    let elapsed = submit_to_device(device, ctx, cmd);
    let mut counters = shared.counters.lock().unwrap();
    counters.bandwidth = counters.bandwidth + elapsed;
    drop(counters);
    sampler.add(elapsed);
    ctx.update_budget(elapsed);
}

fn run(device: DeviceRef, shared: Arc<Shared>, sampler: Arc<Sampler>) {
    while shared.running.load(Ordering::SeqCst) {
        let idle_timer = Timer::start();
        let idle = shared.wakeup.wait(|| !shared.running.load(Ordering::SeqCst));
        if !shared.running.load(Ordering::SeqCst) {
            return;
        }
        let picked = select_next(&shared, idle, &idle_timer);
        *shared.current.lock().unwrap() = picked.clone();
        if let Some(ctx) = picked {
            shared.wakeup.consume();
            submit(&device, &shared, &sampler, &ctx);
        }
    }
}

fn replenish(shared: Arc<Shared>) {
    let period = shared.period.to_std().unwrap_or_default();
    while shared.running.load(Ordering::SeqCst) {
        {
            let contexts = shared.contexts.lock().unwrap();
            if !contexts.is_empty() {
                let _fire = shared.fire.lock().unwrap();
                let mut counters = shared.counters.lock().unwrap();
                let observed = counters.bandwidth + counters.gpu_idle;
                let designed = shared.period / contexts.len() as i32;
                counters.previous_bandwidth = observed;
                if observed != Duration::zero() {
                    let budget = observed / contexts.len() as i32;
                    let idle = counters.bandwidth == Duration::zero();
                    for ctx in contexts.iter() {
                        ctx.replenish(budget, shared.period, designed, idle);
                    }
                }
                counters.bandwidth = Duration::zero();
                counters.gpu_idle = Duration::zero();
            }
        }
        std::thread::sleep(period);
    }
}

impl Scheduler for BandScheduler {
    fn start(&self) {
        let mut workers = self.workers.lock().unwrap();
        if !workers.is_empty() {
            return;
        }
        self.shared.running.store(true, Ordering::SeqCst);
        self.sampler.start();
        let device = self.device.clone();
        let shared = self.shared.clone();
        let sampler = self.sampler.clone();
        workers.push(std::thread::spawn(move || run(device, shared, sampler)));
        let shared = self.shared.clone();
        workers.push(std::thread::spawn(move || replenish(shared)));
    }

    fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.wakeup.notify_all();
        self.sampler.stop();
        for handle in self.workers.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }

    fn enqueue(&self, ctx: Arc<RunContext>, cmd: Command) {
        ctx.enqueue(cmd);
        self.shared.wakeup.post();
    }

    fn register_context(&self, ctx: Arc<RunContext>) {
        self.shared.contexts.lock().unwrap().push(ctx);
    }

    fn unregister_context(&self, id: u32) {
        let mut contexts = self.shared.contexts.lock().unwrap();
        contexts.retain(|c| c.id() != id);
        let mut current = self.shared.current.lock().unwrap();
        if current.as_ref().map(|c| c.id()) == Some(id) {
            *current = None;
        }
    }
}

impl Drop for BandScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
