//! Virtual-user pool.
//!
//! Each VU is an OS thread looping over the workload. Scaling down and
//! draining only ever raise a stop flag: a VU finishes the iteration it is in
//! before it exits. Only `drain` force-stops, and only after the grace period.
//!
//! Every started iteration produces exactly one outcome. The in-flight slot
//! of a VU is claimed either by the VU when its call returns or by the
//! force-stop path, under the same lock, so an iteration is never counted
//! twice or dropped.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::clock::Clock;
use super::workload::{VuContext, Workload};
use crate::stats::{Outcome, SharedCollector};
use crate::utils::as_millis_f64;

/// Upper bound on one uninterrupted sleep inside a VU, so stop flags are
/// noticed promptly during pauses.
const PAUSE_SLICE: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VuState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
}

/// Shared countdown of iterations, drawn from by every VU.
#[derive(Debug)]
pub struct IterationBudget {
    remaining: AtomicU64,
}

impl IterationBudget {
    pub fn new(total: u64) -> Self {
        Self {
            remaining: AtomicU64::new(total),
        }
    }

    /// Take one iteration ticket; `false` once the budget is spent.
    pub fn acquire(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining.load(Ordering::Acquire) == 0
    }

    pub fn remaining(&self) -> u64 {
        self.remaining.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PoolSettings {
    /// Sleep after every iteration.
    pub pause: Duration,
    /// Iterations shorter than this are padded out to it.
    pub min_iteration_duration: Duration,
    pub seed: u64,
}

struct InFlight {
    started: Instant,
}

struct VuSlot {
    id: u32,
    state: AtomicU8,
    stop: AtomicBool,
    cancel: Arc<AtomicBool>,
    abandoned: AtomicBool,
    in_flight: Mutex<Option<InFlight>>,
}

impl VuSlot {
    fn new(id: u32) -> Self {
        Self {
            id,
            state: AtomicU8::new(VuState::Idle as u8),
            stop: AtomicBool::new(false),
            cancel: Arc::new(AtomicBool::new(false)),
            abandoned: AtomicBool::new(false),
            in_flight: Mutex::new(None),
        }
    }

    fn state(&self) -> VuState {
        match self.state.load(Ordering::Acquire) {
            1 => VuState::Running,
            2 => VuState::Stopping,
            _ => VuState::Idle,
        }
    }

    fn set_state(&self, state: VuState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn signal_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.set_state(VuState::Stopping);
    }

    fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

struct VuHandle {
    slot: Arc<VuSlot>,
    thread: Option<JoinHandle<()>>,
}

/// Result of [`VuPool::drain`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// VUs that exited on their own within the grace period.
    pub drained: usize,
    /// VUs force-stopped after the grace period.
    pub forced: usize,
    /// In-flight iterations recorded as cancelled outcomes.
    pub cancelled_iterations: usize,
}

pub struct VuPool<W: Workload> {
    workload: Arc<W>,
    collector: SharedCollector,
    clock: Arc<dyn Clock>,
    budget: Option<Arc<IterationBudget>>,
    settings: PoolSettings,
    active: Vec<VuHandle>,
    draining: Vec<VuHandle>,
    next_id: u32,
    peak: usize,
    exit_tx: Sender<u32>,
    exit_rx: Receiver<u32>,
}

impl<W: Workload> VuPool<W> {
    pub fn new(
        workload: Arc<W>,
        collector: SharedCollector,
        clock: Arc<dyn Clock>,
        budget: Option<Arc<IterationBudget>>,
        settings: PoolSettings,
    ) -> Self {
        let (exit_tx, exit_rx) = crossbeam_channel::unbounded();
        Self {
            workload,
            collector,
            clock,
            budget,
            settings,
            active: Vec::new(),
            draining: Vec::new(),
            next_id: 0,
            peak: 0,
            exit_tx,
            exit_rx,
        }
    }

    /// VUs that are looping and have not been asked to stop.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// VUs finishing their last iteration after a scale-down.
    pub fn draining_count(&self) -> usize {
        self.draining.len()
    }

    pub fn peak(&self) -> usize {
        self.peak
    }

    pub fn budget_exhausted(&self) -> bool {
        self.budget.as_ref().is_some_and(|b| b.is_exhausted())
    }

    /// State of every VU still owned by the pool, active first.
    pub fn vu_states(&self) -> Vec<(u32, VuState)> {
        self.active
            .iter()
            .chain(&self.draining)
            .map(|h| (h.slot.id, h.slot.state()))
            .collect()
    }

    /// Bring the number of active VUs to `target`. Returns the active count.
    pub fn reconcile(&mut self, target: usize) -> usize {
        self.reap();

        while self.active.len() > target {
            if let Some(handle) = self.active.pop() {
                debug!(vu = handle.slot.id, "scaling down VU");
                handle.slot.signal_stop();
                self.draining.push(handle);
            }
        }

        // an exhausted budget means new VUs would exit immediately
        if !self.budget_exhausted() {
            while self.active.len() < target {
                match self.spawn() {
                    Ok(handle) => self.active.push(handle),
                    Err(e) => {
                        warn!(error = %e, "failed to spawn VU, holding at {}", self.active.len());
                        break;
                    }
                }
            }
        }

        self.peak = self.peak.max(self.active.len());
        self.active.len()
    }

    /// Join VUs whose threads have exited, active or draining.
    pub fn reap(&mut self) -> usize {
        let mut reaped = 0;
        while let Ok(id) = self.exit_rx.try_recv() {
            for list in [&mut self.active, &mut self.draining] {
                if let Some(pos) = list.iter().position(|h| h.slot.id == id) {
                    let mut handle = list.swap_remove(pos);
                    if let Some(thread) = handle.thread.take() {
                        let _ = thread.join();
                    }
                    reaped += 1;
                    break;
                }
            }
        }
        reaped
    }

    /// Stop every VU. Waits up to `grace` for in-flight iterations to
    /// finish, then force-stops whatever is left.
    pub fn drain(&mut self, grace: Duration) -> DrainReport {
        for handle in self.active.drain(..) {
            handle.slot.signal_stop();
            self.draining.push(handle);
        }

        let total = self.draining.len();
        let deadline = Instant::now() + grace;
        while !self.draining.is_empty() {
            self.reap();
            if self.draining.is_empty() {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if let Ok(id) = self.exit_rx.recv_timeout(deadline - now) {
                // put it back for reap() to join
                let _ = self.exit_tx.send(id);
            }
        }

        let mut report = DrainReport {
            drained: total - self.draining.len(),
            ..DrainReport::default()
        };

        for handle in self.draining.drain(..) {
            report.forced += 1;
            let tag = self.workload.name();
            if force_stop(&handle.slot, &self.collector, self.clock.as_ref(), tag) {
                report.cancelled_iterations += 1;
            }
            warn!(
                vu = handle.slot.id,
                grace_ms = grace.as_millis() as u64,
                "VU did not stop within grace period, force-stopped"
            );
            // the thread is detached; it discards its result when the call returns
        }
        report
    }

    fn spawn(&mut self) -> std::io::Result<VuHandle> {
        let id = self.next_id;
        let slot = Arc::new(VuSlot::new(id));
        let worker = VuWorker {
            slot: slot.clone(),
            workload: self.workload.clone(),
            collector: self.collector.clone(),
            clock: self.clock.clone(),
            budget: self.budget.clone(),
            settings: self.settings,
        };
        let exit_tx = self.exit_tx.clone();
        let thread = std::thread::Builder::new()
            .name(format!("vu-{}", id))
            .spawn(move || {
                worker.run();
                let _ = exit_tx.send(id);
            })?;
        self.next_id += 1;
        debug!(vu = id, "spawned VU");
        Ok(VuHandle {
            slot,
            thread: Some(thread),
        })
    }
}

impl<W: Workload> Drop for VuPool<W> {
    fn drop(&mut self) {
        for handle in self.active.iter().chain(&self.draining) {
            handle.slot.signal_stop();
        }
    }
}

/// Record the VU's in-flight iteration as cancelled and mark the VU
/// abandoned. Returns whether an iteration was in flight.
fn force_stop(slot: &VuSlot, collector: &SharedCollector, clock: &dyn Clock, tag: &str) -> bool {
    slot.cancel.store(true, Ordering::SeqCst);
    let mut in_flight = slot.in_flight.lock();
    slot.abandoned.store(true, Ordering::SeqCst);
    match in_flight.take() {
        Some(flight) => {
            let mut outcome = Outcome::failure(
                slot.id,
                tag,
                clock.elapsed(),
                as_millis_f64(flight.started.elapsed()),
                "cancelled after graceful stop timeout",
            );
            outcome.cancelled = true;
            collector.ingest(outcome);
            true
        }
        None => false,
    }
}

struct VuWorker<W: Workload> {
    slot: Arc<VuSlot>,
    workload: Arc<W>,
    collector: SharedCollector,
    clock: Arc<dyn Clock>,
    budget: Option<Arc<IterationBudget>>,
    settings: PoolSettings,
}

impl<W: Workload> VuWorker<W> {
    fn run(self) {
        let mut ctx = VuContext::new(self.slot.id, self.settings.seed, self.slot.cancel.clone());
        self.slot.set_state(VuState::Running);

        while !self.slot.should_stop() {
            if let Some(budget) = &self.budget {
                if !budget.acquire() {
                    break;
                }
            }

            let started = Instant::now();
            {
                let mut in_flight = self.slot.in_flight.lock();
                if self.slot.abandoned.load(Ordering::SeqCst) {
                    break;
                }
                *in_flight = Some(InFlight { started });
            }

            let result = panic::catch_unwind(AssertUnwindSafe(|| self.workload.execute(&mut ctx)));
            let elapsed = started.elapsed();
            let tag = ctx
                .take_tag()
                .unwrap_or_else(|| self.workload.name().to_string());
            ctx.advance();

            let latency_ms = as_millis_f64(elapsed);
            let at = self.clock.elapsed();
            let outcome = match result {
                Ok(Ok(output)) if self.workload.check(&output) => {
                    Outcome::success(self.slot.id, tag, at, latency_ms)
                }
                Ok(Ok(_)) => Outcome::failure(
                    self.slot.id,
                    tag,
                    at,
                    latency_ms,
                    format!("check failed: {}", self.workload.check_name()),
                ),
                Ok(Err(e)) => Outcome::failure(self.slot.id, tag, at, latency_ms, e.to_string()),
                Err(payload) => Outcome::failure(
                    self.slot.id,
                    tag,
                    at,
                    latency_ms,
                    format!("panic: {}", panic_message(payload.as_ref())),
                ),
            };

            {
                let mut in_flight = self.slot.in_flight.lock();
                if in_flight.take().is_none() {
                    // force-stopped while running; already recorded as cancelled
                    break;
                }
                self.collector.ingest(outcome);
            }

            self.pace(elapsed);
        }

        self.slot.set_state(VuState::Idle);
    }

    fn pace(&self, elapsed: Duration) {
        let padding = self.settings.min_iteration_duration.saturating_sub(elapsed);
        let wait = padding.max(self.settings.pause);
        let until = Instant::now() + wait;
        loop {
            if self.slot.should_stop() {
                return;
            }
            let now = Instant::now();
            if now >= until {
                return;
            }
            std::thread::sleep((until - now).min(PAUSE_SLICE));
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::clock::MonotonicClock;
    use crate::engine::workload::from_fn;
    use crate::stats::{CollectorConfig, MetricsCollector, WindowSpec};

    fn pool_with<W: Workload>(
        workload: W,
        budget: Option<u64>,
        settings: PoolSettings,
    ) -> (VuPool<W>, SharedCollector) {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::start());
        let collector = Arc::new(MetricsCollector::new(CollectorConfig::default(), clock.clone()));
        let pool = VuPool::new(
            Arc::new(workload),
            collector.clone(),
            clock,
            budget.map(|n| Arc::new(IterationBudget::new(n))),
            settings,
        );
        (pool, collector)
    }

    fn sleeper(ms: u64) -> impl Workload {
        from_fn("sleep", move |_| {
            std::thread::sleep(Duration::from_millis(ms));
            Ok(())
        })
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_budget_is_shared_and_exact() {
        let budget = IterationBudget::new(3);
        assert!(budget.acquire());
        assert!(budget.acquire());
        assert!(budget.acquire());
        assert!(!budget.acquire());
        assert!(budget.is_exhausted());
        assert_eq!(budget.remaining(), 0);
    }

    #[test]
    fn test_scale_up_and_down() {
        let (mut pool, _) = pool_with(sleeper(5), None, PoolSettings::default());
        assert_eq!(pool.reconcile(5), 5);
        assert_eq!(pool.active_count(), 5);
        assert_eq!(pool.peak(), 5);
        assert_eq!(pool.reconcile(2), 2);
        assert_eq!(pool.active_count(), 2);
        // scaled-down VUs finish their iteration and get reaped
        assert!(wait_until(Duration::from_secs(2), || {
            pool.reap();
            pool.draining_count() == 0
        }));
        let report = pool.drain(Duration::from_secs(2));
        assert_eq!(report.forced, 0);
    }

    #[test]
    fn test_graceful_scale_down_records_no_failures() {
        let (mut pool, collector) = pool_with(sleeper(30), None, PoolSettings::default());
        pool.reconcile(5);
        std::thread::sleep(Duration::from_millis(100));
        pool.reconcile(0);
        let report = pool.drain(Duration::from_secs(1));
        assert_eq!(report.forced, 0);
        assert_eq!(report.cancelled_iterations, 0);

        let snap = collector.snapshot(WindowSpec::Cumulative);
        assert!(snap.count >= 5, "count was {}", snap.count);
        assert_eq!(snap.fail_count, 0);
        assert_eq!(collector.summary().cancelled, 0);
    }

    #[test]
    fn test_failures_and_panics_do_not_kill_vu() {
        let workload = from_fn("flaky", |ctx| {
            if ctx.iteration() % 2 == 0 {
                panic!("boom at {}", ctx.iteration());
            }
            anyhow::bail!("connection refused")
        });
        let settings = PoolSettings {
            pause: Duration::from_millis(1),
            ..PoolSettings::default()
        };
        let (mut pool, collector) = pool_with(workload, None, settings);
        pool.reconcile(1);
        assert!(wait_until(Duration::from_secs(2), || {
            collector.snapshot(WindowSpec::Cumulative).count >= 6
        }));
        // still the same single VU
        pool.reap();
        assert_eq!(pool.active_count(), 1);
        assert_eq!(pool.vu_states()[0].0, 0);
        pool.drain(Duration::from_secs(1));

        let summary = collector.summary();
        assert_eq!(summary.failed, summary.total);
        assert!(summary.errors.contains_key("connection refused"));
        assert!(summary.errors.keys().any(|e| e.starts_with("panic: boom at")));
    }

    #[test]
    fn test_check_failure_is_failed_outcome() {
        struct Status(u16);
        impl Workload for Status {
            type Output = u16;
            fn name(&self) -> &str {
                "GET /health"
            }
            fn execute(&self, _ctx: &mut VuContext) -> anyhow::Result<u16> {
                Ok(self.0)
            }
            fn check(&self, status: &u16) -> bool {
                *status == 200
            }
            fn check_name(&self) -> &str {
                "status is 200"
            }
        }
        let (mut pool, collector) = pool_with(Status(503), Some(4), PoolSettings::default());
        pool.reconcile(2);
        assert!(wait_until(Duration::from_secs(2), || {
            pool.reap();
            pool.active_count() == 0
        }));
        let summary = collector.summary();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.failed, 4);
        assert_eq!(summary.errors["check failed: status is 200"], 4);
        assert_eq!(summary.tags["GET /health"].count, 4);
    }

    #[test]
    fn test_budget_exhaustion_stops_respawn() {
        let (mut pool, collector) = pool_with(sleeper(1), Some(20), PoolSettings::default());
        pool.reconcile(3);
        assert!(wait_until(Duration::from_secs(2), || {
            pool.reconcile(3);
            pool.active_count() == 0
        }));
        assert!(pool.budget_exhausted());
        assert_eq!(collector.snapshot(WindowSpec::Cumulative).count, 20);
    }

    #[test]
    fn test_force_stop_records_exactly_one_cancelled_outcome() {
        let workload = from_fn("stuck", |ctx| {
            let deadline = Instant::now() + Duration::from_secs(5);
            while !ctx.is_cancelled() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        });
        let (mut pool, collector) = pool_with(workload, None, PoolSettings::default());
        pool.reconcile(1);
        std::thread::sleep(Duration::from_millis(50));

        let report = pool.drain(Duration::from_millis(100));
        assert_eq!(report.drained, 0);
        assert_eq!(report.forced, 1);
        assert_eq!(report.cancelled_iterations, 1);

        // the detached thread sees the cancel flag, returns and discards its result
        std::thread::sleep(Duration::from_millis(100));
        let summary = collector.summary();
        assert_eq!(summary.total, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.cancelled, 1);
        assert_eq!(summary.errors["cancelled after graceful stop timeout"], 1);
    }

    #[test]
    fn test_pause_is_interrupted_by_stop() {
        let settings = PoolSettings {
            pause: Duration::from_secs(30),
            ..PoolSettings::default()
        };
        let (mut pool, collector) = pool_with(sleeper(1), None, settings);
        pool.reconcile(1);
        assert!(wait_until(Duration::from_secs(1), || {
            collector.snapshot(WindowSpec::Cumulative).count == 1
        }));
        let started = Instant::now();
        let report = pool.drain(Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(report.drained, 1);
        assert_eq!(collector.snapshot(WindowSpec::Cumulative).count, 1);
    }

    #[test]
    fn test_min_iteration_duration_paces_loop() {
        let settings = PoolSettings {
            min_iteration_duration: Duration::from_millis(50),
            ..PoolSettings::default()
        };
        let (mut pool, collector) = pool_with(sleeper(1), None, settings);
        pool.reconcile(1);
        std::thread::sleep(Duration::from_millis(260));
        pool.drain(Duration::from_secs(1));
        let count = collector.snapshot(WindowSpec::Cumulative).count;
        assert!((3..=7).contains(&count), "count was {}", count);
    }
}
