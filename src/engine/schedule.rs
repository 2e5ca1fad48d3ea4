//! Stage schedule: maps elapsed run time to a target VU count.
//!
//! The schedule is a step function. Each stage holds its `target` for its
//! whole `[start, start + duration)` range; zero-length stages occupy no time
//! and are stepped over. The schedule carries no mutable state, so any number
//! of readers may poll it.

use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Stage {
    pub duration: Duration,
    pub target: u32,
}

impl Stage {
    pub fn new(duration: Duration, target: u32) -> Self {
        Self { duration, target }
    }
}

/// What the target becomes once the last stage has ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum EndPolicy {
    /// Keep the last stage's target.
    #[default]
    HoldLast,
    /// Drop to zero VUs.
    RampDown,
}

#[derive(Debug, Clone)]
pub struct StageSchedule {
    stages: Vec<Stage>,
    base_vus: u32,
    base_duration: Duration,
    end_policy: EndPolicy,
}

impl StageSchedule {
    pub fn new(stages: Vec<Stage>, end_policy: EndPolicy) -> Self {
        Self {
            stages,
            base_vus: 0,
            base_duration: Duration::ZERO,
            end_policy,
        }
    }

    /// Constant `vus` for `duration`; used when no stages are configured.
    pub fn constant(vus: u32, duration: Duration) -> Self {
        Self {
            stages: Vec::new(),
            base_vus: vus,
            base_duration: duration,
            end_policy: EndPolicy::HoldLast,
        }
    }

    /// Base VUs used when the stage list is empty.
    pub fn with_base(mut self, vus: u32, duration: Duration) -> Self {
        self.base_vus = vus;
        self.base_duration = duration;
        self
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn end_policy(&self) -> EndPolicy {
        self.end_policy
    }

    pub fn total_duration(&self) -> Duration {
        if self.stages.is_empty() {
            self.base_duration
        } else {
            self.stages.iter().map(|s| s.duration).sum()
        }
    }

    pub fn max_target(&self) -> u32 {
        self.stages
            .iter()
            .map(|s| s.target)
            .max()
            .unwrap_or(self.base_vus)
    }

    /// Index of the stage whose range contains `elapsed`, or `None` past the
    /// end of the schedule (or for an empty stage list).
    pub fn stage_at(&self, elapsed: Duration) -> Option<usize> {
        let mut end = Duration::ZERO;
        for (i, stage) in self.stages.iter().enumerate() {
            end += stage.duration;
            if elapsed < end {
                return Some(i);
            }
        }
        None
    }

    pub fn target_at(&self, elapsed: Duration) -> u32 {
        if self.stages.is_empty() {
            return self.base_vus;
        }
        match self.stage_at(elapsed) {
            Some(i) => self.stages[i].target,
            None => match self.end_policy {
                EndPolicy::HoldLast => self.stages.last().map_or(0, |s| s.target),
                EndPolicy::RampDown => 0,
            },
        }
    }
}
