//! Utilization sampler.
//!
//! Tracks GPU busy time over 100 ms and 500 ms windows and periodically
//! drains every context's per-window counters, so schedulers can compare
//! a context's recent share against the whole device's.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use chrono::Duration;

use super::RunContext;

pub struct Sampler {
    contexts: Arc<Mutex<Vec<Arc<RunContext>>>>,
    sample: Duration,
    running: AtomicBool,
    bandwidth_100: Mutex<Duration>,
    bandwidth_500: Mutex<Duration>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Sampler {
    pub fn new(contexts: Arc<Mutex<Vec<Arc<RunContext>>>>, sample: Duration) -> Arc<Sampler> {
        Arc::new(Sampler {
            contexts,
            sample,
            running: AtomicBool::new(false),
            bandwidth_100: Mutex::new(Duration::zero()),
            bandwidth_500: Mutex::new(Duration::zero()),
            worker: Mutex::new(None),
        })
    }

    /// Record busy time from a submission.
    pub fn add(&self, time: Duration) {
        let mut b100 = self.bandwidth_100.lock().unwrap();
        *b100 = *b100 + time;
        drop(b100);
        let mut b500 = self.bandwidth_500.lock().unwrap();
        *b500 = *b500 + time;
    }

    pub fn bandwidth_500(&self) -> Duration {
        *self.bandwidth_500.lock().unwrap()
    }

    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return;
        }
        self.running.store(true, Ordering::SeqCst);
        let this = self.clone();
        *worker = Some(std::thread::spawn(move || this.run()));
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn run(&self) {
        let sample = self.sample.to_std().unwrap_or_default();
        let mut points: u64 = 0;
        while self.running.load(Ordering::SeqCst) {
            {
                let contexts = self.contexts.lock().unwrap();
                if !contexts.is_empty() {
                    let mut b100 = self.bandwidth_100.lock().unwrap();
                    let mut b500 = self.bandwidth_500.lock().unwrap();
                    if *b500 != Duration::zero() {
                        for ctx in contexts.iter() {
                            log::trace!(
                                "utilization[{}]: {} us / {} us",
                                ctx.id(),
                                ctx.sampling_bandwidth_used().num_microseconds().unwrap_or(0),
                                b500.num_microseconds().unwrap_or(0)
                            );
                            ctx.clear_sampling_bandwidth_used(points);
                        }
                        points = (points + 1) % 5;
                    }
                    *b100 = Duration::zero();
                    if points % 5 == 4 {
                        *b500 = Duration::zero();
                    }
                }
            }
            std::thread::sleep(sample);
        }
    }
}
