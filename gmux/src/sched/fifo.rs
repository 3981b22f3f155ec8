//! Strict-FIFO scheduler.
//!
//! One run thread drains a single queue of (context, command) pairs in
//! arrival order. No priorities, no budgets; submissions still settle
//! elapsed time into the context so sampling stays meaningful if the
//! operator switches schedulers later.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::command::Command;
use crate::device::DeviceRef;

use super::{submit_to_device, RunContext, Scheduler};

struct Shared {
    queue: Mutex<VecDeque<(Arc<RunContext>, Command)>>,
    cond: Condvar,
    running: AtomicBool,
    contexts: Mutex<Vec<Arc<RunContext>>>,
    fire: Mutex<()>,
}

pub struct FifoScheduler {
    device: DeviceRef,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FifoScheduler {
    pub fn new(device: DeviceRef) -> FifoScheduler {
        FifoScheduler {
            device,
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                cond: Condvar::new(),
                running: AtomicBool::new(false),
                contexts: Mutex::new(Vec::new()),
                fire: Mutex::new(()),
            }),
            worker: Mutex::new(None),
        }
    }
}

fn run(device: DeviceRef, shared: Arc<Shared>) {
    loop {
        let handle = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if !shared.running.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(handle) = queue.pop_front() {
                    break handle;
                }
                queue = shared
                    .cond
                    .wait_timeout(queue, std::time::Duration::from_millis(50))
                    .unwrap()
                    .0;
            }
        };

        let _fire = shared.fire.lock().unwrap();
        let elapsed = submit_to_device(&device, &handle.0, handle.1);
        handle.0.update_budget(elapsed);
    }
}

impl Scheduler for FifoScheduler {
    fn start(&self) {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return;
        }
        self.shared.running.store(true, Ordering::SeqCst);
        let device = self.device.clone();
        let shared = self.shared.clone();
        *worker = Some(std::thread::spawn(move || run(device, shared)));
    }

    fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.cond.notify_all();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn enqueue(&self, ctx: Arc<RunContext>, cmd: Command) {
        let mut queue = self.shared.queue.lock().unwrap();
        queue.push_back((ctx, cmd));
        self.shared.cond.notify_one();
    }

    fn register_context(&self, ctx: Arc<RunContext>) {
        self.shared.contexts.lock().unwrap().push(ctx);
    }

    fn unregister_context(&self, id: u32) {
        let mut contexts = self.shared.contexts.lock().unwrap();
        contexts.retain(|c| c.id() != id);
        let mut queue = self.shared.queue.lock().unwrap();
        queue.retain(|(c, _)| c.id() != id);
    }
}

impl Drop for FifoScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
