//! Credit scheduler.
//!
//! Round-robin over registered contexts with time credits: each period a
//! replenisher splits the observed GPU time (busy plus idle) evenly and
//! refills every context's budget; a context that overdrew rotates to the
//! tail of the run list before the next pick. A sampling thread maintains
//! 100 ms / 500 ms utilization windows.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use chrono::Duration;

use crate::command::Command;
use crate::device::DeviceRef;

use super::{submit_to_device, RunContext, Scheduler, Timer, Wakeup, DEFAULT_PERIOD, DEFAULT_SAMPLE};

struct Counters {
    bandwidth: Duration,
    gpu_idle: Duration,
    previous_bandwidth: Duration,
    sampling_bandwidth: Duration,
    sampling_bandwidth_100: Duration,
}

impl Counters {
    fn new() -> Counters {
        Counters {
            bandwidth: Duration::zero(),
            gpu_idle: Duration::zero(),
            previous_bandwidth: Duration::zero(),
            sampling_bandwidth: Duration::zero(),
            sampling_bandwidth_100: Duration::zero(),
        }
    }
}

struct Shared {
    running: AtomicBool,
    wakeup: Wakeup,
    contexts: Mutex<Vec<Arc<RunContext>>>,
    fire: Mutex<()>,
    counters: Mutex<Counters>,
    current: Mutex<Option<Arc<RunContext>>>,
    period: Duration,
    sample: Duration,
}

pub struct CreditScheduler {
    device: DeviceRef,
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CreditScheduler {
    pub fn new(device: DeviceRef) -> CreditScheduler {
        CreditScheduler {
            device,
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                wakeup: Wakeup::new(),
                contexts: Mutex::new(Vec::new()),
                fire: Mutex::new(()),
                counters: Mutex::new(Counters::new()),
                current: Mutex::new(None),
                period: Duration::milliseconds(DEFAULT_PERIOD),
                sample: Duration::milliseconds(DEFAULT_SAMPLE),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }
}

fn select_next(shared: &Shared, idle: bool, idle_timer: &Timer) -> Option<Arc<RunContext>> {
    let mut contexts = shared.contexts.lock().unwrap();
    if idle {
        let mut counters = shared.counters.lock().unwrap();
        counters.gpu_idle = counters.gpu_idle + idle_timer.elapsed();
    }

    // lower the priority of a context that overdrew its budget
    let current = shared.current.lock().unwrap().clone();
    if let Some(current) = current {
        if current.budget() < Duration::zero() {
            if let Some(pos) = contexts.iter().position(|c| c.id() == current.id()) {
                let ctx = contexts.remove(pos);
                contexts.push(ctx);
            }
        }
    }

    let next = contexts.iter().find(|c| c.is_suspended()).cloned();
    *shared.current.lock().unwrap() = next.clone();
    next
}

fn submit(device: &DeviceRef, shared: &Shared, ctx: &Arc<RunContext>) {
    let _fire = shared.fire.lock().unwrap();
    let cmd: Option<Command> = ctx.dequeue();
    let Some(cmd) = cmd else { return };
    let elapsed = submit_to_device(device, ctx, cmd);
    let mut counters = shared.counters.lock().unwrap();
    counters.bandwidth = counters.bandwidth + elapsed;
    counters.sampling_bandwidth = counters.sampling_bandwidth + elapsed;
    counters.sampling_bandwidth_100 = counters.sampling_bandwidth_100 + elapsed;
    drop(counters);
    ctx.update_budget(elapsed);
}

fn run(device: DeviceRef, shared: Arc<Shared>) {
    while shared.running.load(Ordering::SeqCst) {
        let idle_timer = Timer::start();
        let idle = shared.wakeup.wait(|| !shared.running.load(Ordering::SeqCst));
        if !shared.running.load(Ordering::SeqCst) {
            return;
        }
        if let Some(ctx) = select_next(&shared, idle, &idle_timer) {
            shared.wakeup.consume();
            submit(&device, &shared, &ctx);
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
                        ctx.replenish(budget, budget * 2, designed, idle);
                    }
                }
                counters.bandwidth = Duration::zero();
                counters.gpu_idle = Duration::zero();
            }
        }
        std::thread::sleep(period);
    }
}

fn sampling(shared: Arc<Shared>) {
    let sample = shared.sample.to_std().unwrap_or_default();
    let mut points: u64 = 0;
    while shared.running.load(Ordering::SeqCst) {
        {
            let contexts = shared.contexts.lock().unwrap();
            if !contexts.is_empty() {
                let _fire = shared.fire.lock().unwrap();
                let mut counters = shared.counters.lock().unwrap();
                let mut next_points = points;
                let use_100 = counters.sampling_bandwidth_100 != Duration::zero();
                let use_500 = counters.sampling_bandwidth != Duration::zero();
                if use_100 || use_500 {
                    for ctx in contexts.iter() {
                        ctx.clear_sampling_bandwidth_used(points);
                    }
                    next_points = (points + 1) % 5;
                }
                counters.sampling_bandwidth_100 = Duration::zero();
                if points % 5 == 4 {
                    counters.sampling_bandwidth = Duration::zero();
                }
                points = next_points;
            }
        }
        std::thread::sleep(sample);
    }
}

impl Scheduler for CreditScheduler {
    fn start(&self) {
        let mut workers = self.workers.lock().unwrap();
        if !workers.is_empty() {
            return;
        }
        self.shared.running.store(true, Ordering::SeqCst);
        let device = self.device.clone();
        let shared = self.shared.clone();
        workers.push(std::thread::spawn(move || run(device, shared)));
        let shared = self.shared.clone();
        workers.push(std::thread::spawn(move || replenish(shared)));
        let shared = self.shared.clone();
        workers.push(std::thread::spawn(move || sampling(shared)));
    }

    fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.wakeup.notify_all();
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

impl Drop for CreditScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
