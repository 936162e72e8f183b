//! Bounded task queue whose worker count auto-scales from host CPU
//! utilization, with cooldowns (component D, `DynamicWorkerPool`).
//!
//! Workers are real OS threads draining a shared queue via a `None`
//! poison-pill shutdown protocol: shrinking posts a poison pill per worker
//! to remove and lets it drain whatever it's already holding before
//! exiting; growing spawns a fresh thread immediately.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use sysinfo::System;
use tokio::sync::oneshot;

type Job = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub cpu_threshold: f32,
    pub scale_up_cooldown: Duration,
    pub scale_down_cooldown: Duration,
    pub check_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        let cpus = num_cpus::get();
        Self {
            min_workers: 2,
            max_workers: (cpus as f64 * 0.8).floor().max(2.0) as usize,
            cpu_threshold: 80.0,
            scale_up_cooldown: Duration::from_secs(15),
            scale_down_cooldown: Duration::from_secs(5),
            check_interval: Duration::from_secs(10),
        }
    }
}

/// Given current CPU utilization (0-100) and queue depth, decide the new
/// worker-count target.
fn calculate_optimal_workers(config: &WorkerPoolConfig, current_workers: usize, cpu_util: f32, queue_size: usize) -> usize {
    if cpu_util >= 95.0 {
        let remove = ((current_workers.saturating_sub(config.min_workers)) / 2).max(2);
        return current_workers.saturating_sub(remove).max(config.min_workers);
    }
    if cpu_util >= 90.0 {
        return current_workers.saturating_sub(2).max(config.min_workers);
    }
    if cpu_util >= 80.0 {
        return current_workers.saturating_sub(1).max(config.min_workers);
    }

    let headroom = config.cpu_threshold - cpu_util;
    let scale_factor = (headroom / config.cpu_threshold).clamp(0.0, 1.0);
    let raw_target = config.min_workers as f64 + (config.max_workers - config.min_workers) as f64 * scale_factor as f64;
    let mut target = raw_target.round() as usize;

    if queue_size > current_workers && cpu_util < 40.0 {
        target = (current_workers + 2).min(config.max_workers).max(target);
    }
    target.clamp(config.min_workers, config.max_workers)
}

struct Shared {
    sender: Sender<Option<Job>>,
    receiver: Receiver<Option<Job>>,
    worker_count: AtomicUsize,
    config: WorkerPoolConfig,
    last_scale_up: Mutex<Instant>,
    last_scale_down: Mutex<Instant>,
}

/// A task queue with a min/max worker bound and a supervisory policy
/// driven by host CPU utilization.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        let (sender, receiver) = unbounded();
        let shared = Arc::new(Shared {
            sender,
            receiver,
            worker_count: AtomicUsize::new(0),
            config,
            last_scale_up: Mutex::new(Instant::now() - config.scale_up_cooldown),
            last_scale_down: Mutex::new(Instant::now() - config.scale_down_cooldown),
        });

        let pool = Self { shared };
        for _ in 0..config.min_workers {
            pool.spawn_worker();
        }
        pool
    }

    fn spawn_worker(&self) {
        let receiver = self.shared.receiver.clone();
        self.shared.worker_count.fetch_add(1, Ordering::SeqCst);
        std::thread::spawn(move || {
            while let Ok(Some(job)) = receiver.recv() {
                job();
            }
        });
    }

    pub fn worker_count(&self) -> usize {
        self.shared.worker_count.load(Ordering::SeqCst)
    }

    pub fn queue_len(&self) -> usize {
        self.shared.sender.len()
    }

    /// Submit a closure for execution on a worker thread. Panics inside
    /// `f` are captured on the returned receiver rather than killing the
    /// worker; cancellation is not supported once a task is dequeued.
    pub fn submit<F, T>(&self, f: F) -> oneshot::Receiver<std::thread::Result<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
            let _ = tx.send(result);
        });
        let _ = self.shared.sender.send(Some(job));
        rx
    }

    /// Shrink by one worker: post a poison pill. The worker that dequeues
    /// it exits after finishing whatever it already holds.
    fn scale_down_one(&self) {
        let _ = self.shared.sender.send(None);
        self.shared.worker_count.fetch_sub(1, Ordering::SeqCst);
    }

    fn scale_to(&self, target: usize) {
        let current = self.worker_count();
        if target > current {
            for _ in 0..(target - current) {
                self.spawn_worker();
            }
        } else if target < current {
            for _ in 0..(current - target) {
                self.scale_down_one();
            }
        }
    }

    /// Evaluate the scaling policy once, honoring cooldowns. Called
    /// periodically by [`Self::spawn_cpu_monitor`].
    fn adjust(&self, cpu_util: f32) {
        let current = self.worker_count();
        let target = calculate_optimal_workers(&self.shared.config, current, cpu_util, self.queue_len());

        if target == current {
            return;
        }

        let now = Instant::now();
        if target > current {
            let mut last = self.shared.last_scale_up.lock();
            if now.duration_since(*last) < self.shared.config.scale_up_cooldown {
                return;
            }
            *last = now;
        } else {
            let mut last = self.shared.last_scale_down.lock();
            if now.duration_since(*last) < self.shared.config.scale_down_cooldown {
                return;
            }
            *last = now;
        }

        tracing::info!(current, target, cpu_util, "scaling worker pool");
        self.scale_to(target);
    }

    /// Spawn the background CPU-sampling loop. Returns a handle the caller
    /// can abort at shutdown.
    pub fn spawn_cpu_monitor(&self) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        let interval = pool.shared.config.check_interval;
        tokio::spawn(async move {
            let mut system = System::new();
            loop {
                tokio::time::sleep(interval).await;
                system.refresh_cpu_usage();
                let cpu_util = system.global_cpu_usage();
                pool.adjust(cpu_util);
            }
        })
    }

    /// Drain the pool: stop accepting new scaling and let every worker
    /// exit after its poison pill.
    pub fn shutdown(&self) {
        let count = self.worker_count();
        for _ in 0..count {
            let _ = self.shared.sender.send(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> WorkerPoolConfig {
        WorkerPoolConfig {
            min_workers: 2,
            max_workers: 10,
            cpu_threshold: 80.0,
            scale_up_cooldown: Duration::from_secs(15),
            scale_down_cooldown: Duration::from_secs(5),
            check_interval: Duration::from_secs(10),
        }
    }

    #[test]
    fn very_high_cpu_removes_half_above_min() {
        let c = config();
        let target = calculate_optimal_workers(&c, 10, 96.0, 0);
        assert_eq!(target, 10 - ((10 - 2) / 2).max(2));
    }

    #[test]
    fn high_cpu_removes_two() {
        let c = config();
        assert_eq!(calculate_optimal_workers(&c, 8, 92.0, 0), 6);
    }

    #[test]
    fn elevated_cpu_removes_one() {
        let c = config();
        assert_eq!(calculate_optimal_workers(&c, 8, 85.0, 0), 7);
    }

    #[test]
    fn never_drops_below_min_workers() {
        let c = config();
        assert_eq!(calculate_optimal_workers(&c, 3, 99.0, 0), c.min_workers);
    }

    #[test]
    fn low_cpu_with_backlog_boosts_by_two() {
        let c = config();
        let target = calculate_optimal_workers(&c, 2, 10.0, 5);
        assert!(target >= 4);
        assert!(target <= c.max_workers);
    }

    #[tokio::test]
    async fn submit_executes_and_returns_result() {
        let pool = WorkerPool::new(config());
        let rx = pool.submit(|| 2 + 2);
        let result = rx.await.unwrap().unwrap();
        assert_eq!(result, 4);
        pool.shutdown();
    }

    #[tokio::test]
    async fn panic_in_task_is_captured_not_propagated() {
        let pool = WorkerPool::new(config());
        let rx = pool.submit(|| -> i32 { panic!("boom") });
        let result = rx.await.unwrap();
        assert!(result.is_err());
        pool.shutdown();
    }
}
