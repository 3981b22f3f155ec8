//! GPU-time schedulers.
//!
//! Doorbell writes do not reach the device directly: the session thread
//! enqueues them and a scheduler worker performs the actual submission,
//! serialized across guests by the fire mutex, then waits for the engine
//! to go idle and charges the elapsed time to the guest.
//!
//! Scheduling state is decoupled from `Context` ownership: each context
//! registers a shared `RunContext` handle (its queue of suspended
//! commands plus budget and bandwidth accounting), and the run list is a
//! vector of those handles. Lock order is always sched → fire → device.

pub mod band;
pub mod credit;
pub mod fifo;
pub mod sampler;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use chrono::Duration;

use crate::aspace::AddressSpace;
use crate::command::Command;
use crate::config::SchedulerKind;
use crate::device::{DeviceInner, DeviceRef};

/// Doorbell-to-device latency budget per submission poll.
pub const DEFAULT_WAIT: i64 = 50; // microseconds
/// Replenish period.
pub const DEFAULT_PERIOD: i64 = 500; // milliseconds
/// Sampling period.
pub const DEFAULT_SAMPLE: i64 = 100; // milliseconds

pub trait Scheduler: Send + Sync {
    fn start(&self);
    fn stop(&self);
    /// Record a pending submission. Non-blocking.
    fn enqueue(&self, ctx: Arc<RunContext>, cmd: Command);
    fn register_context(&self, ctx: Arc<RunContext>);
    fn unregister_context(&self, id: u32);
}

pub fn create(kind: SchedulerKind, device: DeviceRef) -> Arc<dyn Scheduler> {
    match kind {
        SchedulerKind::Fifo => Arc::new(fifo::FifoScheduler::new(device)),
        SchedulerKind::Credit => Arc::new(credit::CreditScheduler::new(device)),
        SchedulerKind::Band => Arc::new(band::BandScheduler::new(device)),
    }
}

pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn start() -> Timer {
        Timer {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_std(self.start.elapsed()).unwrap_or_else(|_| Duration::zero())
    }
}

struct BudgetState {
    budget: Duration,
    bandwidth_used: Duration,
    sampling_bandwidth_used: Duration,
    sampling_bandwidth_used_100: Duration,
}

impl BudgetState {
    fn new() -> BudgetState {
        BudgetState {
            budget: Duration::zero(),
            bandwidth_used: Duration::zero(),
            sampling_bandwidth_used: Duration::zero(),
            sampling_bandwidth_used_100: Duration::zero(),
        }
    }
}

/// The scheduler-facing handle of a context. The owning session updates
/// the poll area; scheduler threads drain the queue and settle budgets.
pub struct RunContext {
    id: u32,
    domid: AtomicI32,
    poll_area: AtomicU64,
    queue: Mutex<VecDeque<Command>>,
    budget: Mutex<BudgetState>,
}

impl RunContext {
    pub fn new(id: u32) -> Arc<RunContext> {
        Arc::new(RunContext {
            id,
            domid: AtomicI32::new(-1),
            poll_area: AtomicU64::new(0),
            queue: Mutex::new(VecDeque::new()),
            budget: Mutex::new(BudgetState::new()),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn set_domid(&self, domid: i32) {
        self.domid.store(domid, Ordering::Relaxed);
    }

    pub fn set_poll_area(&self, base: u64) {
        self.poll_area.store(base, Ordering::Relaxed);
    }

    pub fn poll_area(&self) -> u64 {
        self.poll_area.load(Ordering::Relaxed)
    }

    fn aspace(&self) -> AddressSpace {
        AddressSpace {
            id: self.id,
            domid: self.domid.load(Ordering::Relaxed),
        }
    }

    /// Returns whether the queue was empty before this command.
    pub fn enqueue(&self, cmd: Command) -> bool {
        let mut queue = self.queue.lock().unwrap();
        let was_empty = queue.is_empty();
        queue.push_back(cmd);
        was_empty
    }

    pub fn dequeue(&self) -> Option<Command> {
        self.queue.lock().unwrap().pop_front()
    }

    /// A context with queued commands is "suspended" and eligible to run.
    pub fn is_suspended(&self) -> bool {
        !self.queue.lock().unwrap().is_empty()
    }

    pub fn budget(&self) -> Duration {
        self.budget.lock().unwrap().budget
    }

    pub fn bandwidth_used(&self) -> Duration {
        self.budget.lock().unwrap().bandwidth_used
    }

    pub fn sampling_bandwidth_used(&self) -> Duration {
        self.budget.lock().unwrap().sampling_bandwidth_used
    }

    pub fn update_budget(&self, elapsed: Duration) {
        let mut state = self.budget.lock().unwrap();
        state.budget = state.budget - elapsed;
        state.bandwidth_used = state.bandwidth_used + elapsed;
        state.sampling_bandwidth_used = state.sampling_bandwidth_used + elapsed;
        state.sampling_bandwidth_used_100 = state.sampling_bandwidth_used_100 + elapsed;
    }

    /// Credit refill at the end of a period. `credit` is this context's
    /// fair share of the observed period, `threshold` bounds accumulated
    /// credit/debt, `bandwidth` is the designed per-context share, and
    /// `idle` reports a period with no submissions at all.
    pub fn replenish(
        &self,
        credit: Duration,
        threshold: Duration,
        bandwidth: Duration,
        idle: bool,
    ) {
        let mut state = self.budget.lock().unwrap();
        state.budget = state.budget + credit;
        if idle && state.budget >= bandwidth {
            state.budget = bandwidth;
        } else {
            if state.budget > threshold {
                state.budget = bandwidth;
            }
            if state.budget < -threshold {
                state.budget = Duration::zero();
            }
        }
        state.bandwidth_used = Duration::zero();
    }

    /// Reset sampling windows; the 500 ms window drains every fifth
    /// 100 ms point.
    pub fn clear_sampling_bandwidth_used(&self, point: u64) {
        let mut state = self.budget.lock().unwrap();
        if point % 5 == 4 {
            state.sampling_bandwidth_used = Duration::zero();
        }
        state.sampling_bandwidth_used_100 = Duration::zero();
    }
}

/// Perform one submission: write the doorbell through the device BAR1
/// window, then wait for the engine to drain. Returns the busy time.
/// Caller holds the fire mutex; the device mutex is taken per touch so
/// the activity poll does not starve session threads.
pub(crate) fn submit_to_device(device: &DeviceRef, ctx: &RunContext, cmd: Command) -> Duration {
    let timer = Timer::start();
    {
        let mut inner = device.lock();
        let DeviceInner { mmio, bar1, .. } = &mut *inner;
        bar1.write(
            mmio,
            ctx.aspace(),
            ctx.poll_area(),
            cmd.offset as u64,
            cmd.value,
            cmd.size(),
        );
    }
    let deadline = Instant::now() + std::time::Duration::from_secs(5);
    while device.is_active() {
        if Instant::now() >= deadline {
            log::warn!("engine stayed busy after a fire from {}", ctx.id());
            break;
        }
        std::thread::sleep(std::time::Duration::from_micros(DEFAULT_WAIT as u64));
    }
    timer.elapsed()
}

/// Busy-yield for roughly `duration`, giving the current owner a chance
/// to finish before the scheduler switches away.
pub(crate) fn yield_chance(duration: Duration) {
    let deadline = Instant::now() + duration.to_std().unwrap_or_default();
    while Instant::now() < deadline {
        std::thread::yield_now();
    }
}

/// Pending-submission counter with its wakeup condvar.
pub(crate) struct Wakeup {
    counter: Mutex<u64>,
    cond: Condvar,
}

impl Wakeup {
    pub(crate) fn new() -> Wakeup {
        Wakeup {
            counter: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn post(&self) {
        let mut counter = self.counter.lock().unwrap();
        *counter += 1;
        self.cond.notify_one();
    }

    /// Wait until work is pending or `stopped` turns true. Returns
    /// whether the thread actually slept (the GPU sat idle).
    pub(crate) fn wait(&self, stopped: impl Fn() -> bool) -> bool {
        let mut counter = self.counter.lock().unwrap();
        let mut idle = false;
        while *counter == 0 && !stopped() {
            idle = true;
            counter = self
                .cond
                .wait_timeout(counter, std::time::Duration::from_millis(50))
                .unwrap()
                .0;
        }
        idle
    }

    /// Consume one pending submission after a context was picked.
    pub(crate) fn consume(&self) {
        let mut counter = self.counter.lock().unwrap();
        *counter = counter.saturating_sub(1);
    }

    pub(crate) fn notify_all(&self) {
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, TYPE_WRITE};

    fn cmd(value: u32) -> Command {
        Command {
            kind: TYPE_WRITE,
            value,
            offset: 0x8c,
            bar: 1,
            size: 4,
        }
    }

    #[test]
    fn test_run_context_queue_order() {
        let ctx = RunContext::new(0);
        assert!(!ctx.is_suspended());
        assert!(ctx.enqueue(cmd(1)));
        assert!(!ctx.enqueue(cmd(2)));
        assert!(ctx.is_suspended());
        assert_eq!(ctx.dequeue().unwrap().value, 1);
        assert_eq!(ctx.dequeue().unwrap().value, 2);
        assert!(ctx.dequeue().is_none());
    }

    #[test]
    fn test_update_budget_charges_all_windows() {
        let ctx = RunContext::new(0);
        ctx.update_budget(Duration::milliseconds(40));
        assert_eq!(ctx.budget(), Duration::milliseconds(-40));
        assert_eq!(ctx.bandwidth_used(), Duration::milliseconds(40));
        assert_eq!(ctx.sampling_bandwidth_used(), Duration::milliseconds(40));
    }

    #[test]
    fn test_replenish_fair_share_and_reset() {
        // two contexts over a 500 ms period, one consumed 400 ms
        let ctx = RunContext::new(0);
        ctx.update_budget(Duration::milliseconds(400));
        let share = Duration::milliseconds(250);
        ctx.replenish(share, share * 2, share, false);
        assert_eq!(ctx.budget(), Duration::milliseconds(-150));
        assert_eq!(ctx.bandwidth_used(), Duration::zero());
    }

    #[test]
    fn test_replenish_caps_idle_budget() {
        let ctx = RunContext::new(0);
        let share = Duration::milliseconds(250);
        ctx.replenish(share, share * 2, share, true);
        ctx.replenish(share, share * 2, share, true);
        // idle periods cannot hoard more than one designed share
        assert_eq!(ctx.budget(), share);
    }

    #[test]
    fn test_replenish_zeroes_runaway_debt() {
        let ctx = RunContext::new(0);
        ctx.update_budget(Duration::milliseconds(2000));
        let share = Duration::milliseconds(250);
        ctx.replenish(share, share * 2, share, false);
        // debt beyond -2*share resets to zero
        assert_eq!(ctx.budget(), Duration::zero());
    }

    #[test]
    fn test_sampling_windows_clear_on_fifth_point() {
        let ctx = RunContext::new(0);
        ctx.update_budget(Duration::milliseconds(10));
        ctx.clear_sampling_bandwidth_used(0);
        assert_eq!(ctx.sampling_bandwidth_used(), Duration::milliseconds(10));
        ctx.clear_sampling_bandwidth_used(4);
        assert_eq!(ctx.sampling_bandwidth_used(), Duration::zero());
    }
}
