use anyhow::Result;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::stats::report::RunReport;
use crate::stats::thresholds::ThresholdEngine;
use crate::stats::{CollectorConfig, MetricSnapshot, MetricsCollector, SharedCollector, WindowSpec};

pub mod clock;
pub mod control;
pub mod pool;
pub mod schedule;
pub mod workload;

use clock::{Clock, MonotonicClock};
use control::{ControlState, RunState, StopReason};
use pool::{IterationBudget, PoolSettings, VuPool};
use schedule::StageSchedule;
use workload::Workload;

pub const DEFAULT_GRACEFUL_STOP: Duration = Duration::from_secs(30);
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);
pub const DEFAULT_THRESHOLD_INTERVAL: Duration = Duration::from_secs(1);

/// Everything a run needs, validated and typed.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub schedule: StageSchedule,
    pub thresholds: ThresholdEngine,
    /// Shared iteration budget across all VUs.
    pub iterations: Option<u64>,
    /// Hard cap on active run time.
    pub duration: Duration,
    pub pause: Duration,
    pub min_iteration_duration: Duration,
    pub graceful_stop: Duration,
    pub tick: Duration,
    pub threshold_interval: Duration,
    pub seed: u64,
}

impl RunPlan {
    /// Plan that runs for exactly the schedule's length with no thresholds.
    pub fn new(schedule: StageSchedule) -> Self {
        Self {
            duration: schedule.total_duration(),
            schedule,
            thresholds: ThresholdEngine::default(),
            iterations: None,
            pause: Duration::ZERO,
            min_iteration_duration: Duration::ZERO,
            graceful_stop: DEFAULT_GRACEFUL_STOP,
            tick: DEFAULT_TICK,
            threshold_interval: DEFAULT_THRESHOLD_INTERVAL,
            seed: 0,
        }
    }
}

pub struct Engine {
    plan: RunPlan,
}

impl Engine {
    pub fn new(plan: RunPlan) -> Self {
        Self { plan }
    }

    pub fn plan(&self) -> &RunPlan {
        &self.plan
    }

    /// Spawn the control loop and return immediately.
    pub fn start<W: Workload>(self, workload: W) -> Result<RunHandle> {
        let plan = self.plan;
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::start());
        let collector = Arc::new(MetricsCollector::new(
            CollectorConfig::for_vus(plan.schedule.max_target(), plan.seed),
            clock.clone(),
        ));
        let control = Arc::new(ControlState::new());

        info!(
            stages = plan.schedule.stages().len(),
            max_vus = plan.schedule.max_target(),
            duration_s = plan.duration.as_secs_f64(),
            iterations = ?plan.iterations,
            thresholds = plan.thresholds.specs().len(),
            shards = collector.shard_count(),
            "starting run"
        );

        let controller = Controller {
            plan,
            workload: Arc::new(workload),
            control: control.clone(),
            collector: collector.clone(),
            clock,
        };
        let thread = std::thread::Builder::new()
            .name("run-controller".to_string())
            .spawn(move || controller.run())?;

        Ok(RunHandle {
            control,
            collector,
            thread,
        })
    }

    /// Start and block until the run reaches a terminal state.
    pub fn run<W: Workload>(self, workload: W) -> Result<RunReport> {
        self.start(workload)?.run()
    }
}

/// Handle to a running load test.
pub struct RunHandle {
    control: Arc<ControlState>,
    collector: SharedCollector,
    thread: JoinHandle<RunReport>,
}

impl RunHandle {
    pub fn state(&self) -> RunState {
        self.control.state()
    }

    pub fn active_vus(&self) -> usize {
        self.control.active_vus()
    }

    /// Ask the run to stop. Idempotent; the run drains and ends `Aborted`.
    pub fn stop(&self) {
        self.control.request_stop();
    }

    /// Live cumulative metrics.
    pub fn snapshot(&self) -> MetricSnapshot {
        self.collector.snapshot(WindowSpec::Cumulative)
    }

    pub fn window(&self, spec: WindowSpec) -> MetricSnapshot {
        self.collector.snapshot(spec)
    }

    /// Block until the run is over.
    pub fn run(self) -> Result<RunReport> {
        self.thread
            .join()
            .map_err(|_| anyhow::anyhow!("Run controller thread panicked"))
    }
}

struct Controller<W: Workload> {
    plan: RunPlan,
    workload: Arc<W>,
    control: Arc<ControlState>,
    collector: SharedCollector,
    clock: Arc<dyn Clock>,
}

impl<W: Workload> Controller<W> {
    fn run(self) -> RunReport {
        let plan = &self.plan;
        let mut pool = VuPool::new(
            self.workload.clone(),
            self.collector.clone(),
            self.clock.clone(),
            plan.iterations.map(|n| Arc::new(IterationBudget::new(n))),
            PoolSettings {
                pause: plan.pause,
                min_iteration_duration: plan.min_iteration_duration,
                seed: plan.seed,
            },
        );

        self.control.publish(RunState::Ramping);
        let mut current_stage = None;
        let mut last_eval = Duration::ZERO;

        let reason = loop {
            let elapsed = self.clock.elapsed();

            if self.control.stop_requested() {
                info!("stop requested");
                break StopReason::Requested;
            }
            if elapsed >= plan.duration {
                break StopReason::DurationElapsed;
            }

            let stage = plan.schedule.stage_at(elapsed);
            if stage != current_stage {
                if let Some(i) = stage {
                    let s = plan.schedule.stages()[i];
                    info!(
                        stage = i,
                        target = s.target,
                        duration_s = s.duration.as_secs_f64(),
                        "entering stage"
                    );
                } else if current_stage.is_some() {
                    info!(policy = ?plan.schedule.end_policy(), "stages finished");
                }
                current_stage = stage;
            }

            let target = plan.schedule.target_at(elapsed) as usize;
            let active = pool.reconcile(target);
            self.control.set_active_vus(active);

            if pool.budget_exhausted() && active == 0 && pool.draining_count() == 0 {
                info!(iterations = ?plan.iterations, "iteration budget exhausted");
                break StopReason::IterationsExhausted;
            }
            if self.control.state() == RunState::Ramping && active == target {
                debug!(vus = active, "initial reconciliation done");
                self.control.publish(RunState::Running);
            }

            let eval_due = elapsed.saturating_sub(last_eval) >= plan.threshold_interval;
            if !plan.thresholds.is_empty() && eval_due {
                last_eval = elapsed;
                let snapshot = self.collector.snapshot(WindowSpec::Cumulative);
                let evaluation = plan.thresholds.evaluate_live(&snapshot, elapsed);
                if let Some(i) = evaluation.abort {
                    let breached = &evaluation.results[i];
                    warn!(
                        metric = %breached.metric,
                        expression = %breached.expression,
                        observed = breached.observed,
                        "abort threshold breached, stopping run"
                    );
                    let expression = format!("{} {}", breached.metric, breached.expression);
                    break StopReason::Threshold(expression);
                }
            }

            let remaining = plan.duration.saturating_sub(elapsed);
            std::thread::sleep(plan.tick.min(remaining).max(Duration::from_millis(1)));
        };

        self.control.publish(RunState::Stopping);
        info!(
            reason = ?reason,
            vus = pool.active_count() + pool.draining_count(),
            grace_s = plan.graceful_stop.as_secs_f64(),
            "stopping VUs"
        );
        let drain = pool.drain(plan.graceful_stop);
        self.control.set_active_vus(0);
        if drain.forced > 0 {
            warn!(
                forced = drain.forced,
                cancelled = drain.cancelled_iterations,
                "VUs force-stopped after graceful stop timeout"
            );
        }

        let final_snapshot = self.collector.snapshot(WindowSpec::Cumulative);
        let threshold_results = plan.thresholds.evaluate(&final_snapshot);
        let state = match reason {
            StopReason::DurationElapsed | StopReason::IterationsExhausted => RunState::Completed,
            StopReason::Threshold(_) | StopReason::Requested => RunState::Aborted,
        };

        let report = RunReport {
            state,
            stop_reason: reason,
            threshold_results,
            summary: self.collector.summary(),
            duration: self.clock.elapsed(),
            peak_vus: pool.peak(),
        };
        self.control.publish(state);
        info!(
            state = %state,
            iterations = report.summary.total,
            failed = report.summary.failed,
            thresholds_passed = report.thresholds_passed(),
            "run finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::schedule::{EndPolicy, Stage};
    use crate::engine::workload::from_fn;
    use crate::stats::thresholds::ThresholdSpec;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::time::Instant;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn fast_plan(schedule: StageSchedule) -> RunPlan {
        RunPlan {
            tick: ms(20),
            threshold_interval: ms(50),
            graceful_stop: Duration::from_secs(2),
            ..RunPlan::new(schedule)
        }
    }

    fn thresholds(list: &[(&str, &str, bool)]) -> ThresholdEngine {
        ThresholdEngine::new(
            list.iter()
                .map(|(metric, expr, abort)| {
                    ThresholdSpec::parse(metric, expr)
                        .unwrap()
                        .with_abort(*abort, Duration::ZERO)
                })
                .collect(),
        )
    }

    #[test]
    fn test_staged_run_completes_and_passes() {
        let schedule = StageSchedule::new(
            vec![Stage::new(Duration::from_secs(1), 1), Stage::new(Duration::from_secs(1), 0)],
            EndPolicy::HoldLast,
        );
        let mut plan = fast_plan(schedule);
        plan.thresholds = thresholds(&[("http_req_duration", "p(95)<300", false)]);

        let workload = from_fn("fast", |_| {
            std::thread::sleep(ms(10));
            Ok(())
        });
        let report = Engine::new(plan).run(workload).unwrap();

        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.stop_reason, StopReason::DurationElapsed);
        assert_eq!(report.threshold_results.len(), 1);
        assert!(report.threshold_results[0].passed);
        assert!(report.passed());
        assert_eq!(report.peak_vus, 1);
        // ~1s of a single VU at ~10ms per iteration
        let count = report.summary.total;
        assert!((30..=110).contains(&count), "count was {}", count);
        assert_eq!(report.summary.failed, 0);
        assert!(report.duration >= Duration::from_secs(2));
    }

    #[test]
    fn test_empty_stages_run_base_vus_for_duration() {
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let seen_in = seen.clone();
        let workload = from_fn("base", move |ctx| {
            seen_in.lock().insert(ctx.vu());
            std::thread::sleep(ms(5));
            Ok(())
        });
        let plan = fast_plan(StageSchedule::constant(1, ms(300)));
        let report = Engine::new(plan).run(workload).unwrap();

        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.peak_vus, 1);
        assert_eq!(*seen.lock(), HashSet::from([0]));
        assert!(report.duration >= ms(300));
        assert!(report.summary.total > 10);
    }

    #[test]
    fn test_failure_rate_threshold_verdicts() {
        let passing = {
            let mut plan = fast_plan(StageSchedule::constant(2, ms(300)));
            plan.thresholds = thresholds(&[("http_req_failed", "rate<0.01", true)]);
            Engine::new(plan)
                .run(from_fn("ok", |_| {
                    std::thread::sleep(ms(5));
                    Ok(())
                }))
                .unwrap()
        };
        assert_eq!(passing.state, RunState::Completed);
        assert!(passing.passed());

        let failing = {
            let mut plan = fast_plan(StageSchedule::constant(2, Duration::from_secs(10)));
            plan.thresholds = thresholds(&[("http_req_failed", "rate<0.01", true)]);
            Engine::new(plan)
                .run(from_fn("broken", |_| {
                    std::thread::sleep(ms(5));
                    anyhow::bail!("HTTP 500")
                }))
                .unwrap()
        };
        assert_eq!(failing.state, RunState::Aborted);
        assert_eq!(
            failing.stop_reason,
            StopReason::Threshold("http_req_failed rate<0.01".to_string())
        );
        assert!(failing.duration < Duration::from_secs(5));
        assert!(!failing.threshold_results[0].passed);
        assert_eq!(failing.threshold_results[0].observed, 1.0);
        assert!(!failing.passed());
    }

    #[test]
    fn test_non_aborting_threshold_is_reported_only() {
        let mut plan = fast_plan(StageSchedule::constant(1, ms(300)));
        plan.thresholds = thresholds(&[("http_req_failed", "rate<0.01", false)]);
        let report = Engine::new(plan)
            .run(from_fn("broken", |_| {
                std::thread::sleep(ms(5));
                anyhow::bail!("HTTP 503")
            }))
            .unwrap();
        assert_eq!(report.state, RunState::Completed);
        assert!(!report.thresholds_passed());
        assert!(!report.passed());
        assert!(report.summary.errors["HTTP 503"] > 0);
    }

    #[test]
    fn test_iteration_budget_is_exact() {
        let mut plan = fast_plan(StageSchedule::constant(3, Duration::from_secs(30)));
        plan.iterations = Some(20);
        let report = Engine::new(plan)
            .run(from_fn("budget", |_| {
                std::thread::sleep(ms(2));
                Ok(())
            }))
            .unwrap();
        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.stop_reason, StopReason::IterationsExhausted);
        assert_eq!(report.summary.total, 20);
        assert!(report.duration < Duration::from_secs(5));
    }

    #[test]
    fn test_scale_down_to_zero_is_graceful() {
        let schedule = StageSchedule::new(
            vec![Stage::new(ms(300), 5), Stage::new(ms(300), 0)],
            EndPolicy::HoldLast,
        );
        let report = Engine::new(fast_plan(schedule))
            .run(from_fn("steady", |_| {
                std::thread::sleep(ms(20));
                Ok(())
            }))
            .unwrap();
        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.peak_vus, 5);
        assert_eq!(report.summary.failed, 0);
        assert_eq!(report.summary.cancelled, 0);
    }

    #[test]
    fn test_end_policy_applies_after_last_stage() {
        for (policy, expected) in [(EndPolicy::HoldLast, 2), (EndPolicy::RampDown, 0)] {
            let mut plan = fast_plan(StageSchedule::new(vec![Stage::new(ms(200), 2)], policy));
            plan.duration = ms(800);
            let handle = Engine::new(plan)
                .start(from_fn("tail", |_| {
                    std::thread::sleep(ms(5));
                    Ok(())
                }))
                .unwrap();

            std::thread::sleep(ms(500));
            assert_eq!(handle.active_vus(), expected, "{:?}", policy);

            let report = handle.run().unwrap();
            assert_eq!(report.state, RunState::Completed);
            assert_eq!(report.stop_reason, StopReason::DurationElapsed);
            assert_eq!(report.peak_vus, 2);
            assert!(report.duration >= ms(800));
        }
    }

    #[test]
    fn test_stop_aborts_running_run() {
        let plan = fast_plan(StageSchedule::constant(2, Duration::from_secs(30)));
        let handle = Engine::new(plan)
            .start(from_fn("loop", |_| {
                std::thread::sleep(ms(5));
                Ok(())
            }))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while handle.state() != RunState::Running && Instant::now() < deadline {
            std::thread::sleep(ms(5));
        }
        assert_eq!(handle.state(), RunState::Running);
        std::thread::sleep(ms(100));
        assert_eq!(handle.active_vus(), 2);
        assert!(handle.snapshot().count > 0);

        handle.stop();
        handle.stop();
        let report = handle.run().unwrap();
        assert_eq!(report.state, RunState::Aborted);
        assert_eq!(report.stop_reason, StopReason::Requested);
        assert!(report.duration < Duration::from_secs(5));
    }

    #[test]
    fn test_straggler_is_cancelled_after_grace() {
        let mut plan = fast_plan(StageSchedule::constant(1, ms(100)));
        plan.graceful_stop = ms(50);
        let report = Engine::new(plan)
            .run(from_fn("hang", |ctx| {
                let until = Instant::now() + Duration::from_secs(5);
                while !ctx.is_cancelled() && Instant::now() < until {
                    std::thread::sleep(ms(5));
                }
                Ok(())
            }))
            .unwrap();
        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.summary.total, 1);
        assert_eq!(report.summary.cancelled, 1);
        assert_eq!(report.summary.failed, 1);
    }
}
