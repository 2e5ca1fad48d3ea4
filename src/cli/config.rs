use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::engine::schedule::{EndPolicy, Stage, StageSchedule};
use crate::engine::{RunPlan, DEFAULT_GRACEFUL_STOP, DEFAULT_THRESHOLD_INTERVAL};
use crate::error::{ConfigError, ConfigResult};
use crate::stats::thresholds::{ThresholdEngine, ThresholdSpec};
use crate::utils::{optional_duration, parse_config_duration};

/// Run length used when only an iteration budget is given (k6 maxDuration).
pub const DEFAULT_MAX_DURATION: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct StageConfig {
    pub duration: String,
    pub target: u32,
}

/// A threshold expression, optionally with abort settings.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[serde(untagged)]
pub enum ThresholdEntry {
    Expr(String),
    Detailed {
        threshold: String,
        #[serde(default, alias = "abortOnFail")]
        abort_on_fail: bool,
        #[serde(default, alias = "delayAbortEval")]
        delay_abort_eval: Option<String>,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
pub struct ProbeConfig {
    /// Path appended to the base URL (e.g., "/healthz")
    pub path: Option<String>,
    /// Status code that counts as success (default: 200)
    #[serde(alias = "expectStatus")]
    pub expect_status: Option<u16>,
    /// Query parameters; one value per parameter is picked at random each iteration
    pub query: Option<BTreeMap<String, Vec<String>>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
pub struct RunConfig {
    /// Target base URL (env: APP_URL)
    #[serde(alias = "baseURL", alias = "baseUrl")]
    pub base_url: Option<String>,
    /// Per-request timeout (e.g., "5s")
    #[serde(alias = "requestTimeout")]
    pub request_timeout: Option<String>,
    /// Number of concurrent VUs when no stages are given
    pub vus: Option<u32>,
    /// Duration of the test (e.g., "10s", "1m"). With stages, runs on past
    /// the last stage if longer than the stages.
    pub duration: Option<String>,
    /// Total iterations shared by all VUs
    pub iterations: Option<u64>,
    /// Ramping schedule
    pub stages: Option<Vec<StageConfig>>,
    /// Drop to zero VUs once the last stage ends instead of holding its target
    #[serde(alias = "rampDownAfterLastStage")]
    pub ramp_down_after_last_stage: Option<bool>,
    /// Sleep after each iteration
    #[serde(alias = "iterationPause", alias = "sleep")]
    pub iteration_pause: Option<String>,
    /// Minimum time per iteration
    #[serde(alias = "minIterationDuration")]
    pub min_iteration_duration: Option<String>,
    /// How long in-flight iterations may run after a stop
    #[serde(alias = "gracefulStop")]
    pub graceful_stop: Option<String>,
    /// How often thresholds are evaluated during the run
    #[serde(alias = "thresholdInterval")]
    pub threshold_interval: Option<String>,
    /// Seed for sampling and per-VU randomness
    pub seed: Option<u64>,
    /// Pass/Fail criteria keyed by metric name
    pub thresholds: Option<BTreeMap<String, Vec<ThresholdEntry>>>,
    pub probe: Option<ProbeConfig>,
}

/// Where and how the HTTP probe hits the system under test.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeTarget {
    pub base_url: String,
    pub path: String,
    pub expect_status: u16,
    pub query: Vec<(String, Vec<String>)>,
    pub timeout: Duration,
}

impl ProbeTarget {
    pub fn url(&self) -> String {
        format!("{}{}", self.base_url, self.path)
    }
}

/// A validated descriptor, ready to hand to the engine.
#[derive(Debug, Clone)]
pub struct LoadTest {
    pub plan: RunPlan,
    pub probe: ProbeTarget,
}

impl RunConfig {
    /// Read a YAML or JSON descriptor. `.json` files are parsed as JSON,
    /// everything else as YAML.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let load_err = |reason: String| ConfigError::Load {
            path: path.display().to_string(),
            reason,
        };
        let content = std::fs::read_to_string(path).map_err(|e| load_err(e.to_string()))?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        if is_json {
            serde_json::from_str(&content).map_err(|e| load_err(e.to_string()))
        } else {
            serde_yaml::from_str(&content).map_err(|e| load_err(e.to_string()))
        }
    }

    /// Built-in descriptors mirroring the stock smoke and ramp checks.
    pub fn profile(name: &str) -> ConfigResult<Self> {
        match name {
            "smoke" => Ok(Self {
                vus: Some(1),
                iterations: Some(20),
                request_timeout: Some("5s".to_string()),
                iteration_pause: Some("200ms".to_string()),
                probe: Some(ProbeConfig {
                    path: Some("/health".to_string()),
                    expect_status: Some(200),
                    query: None,
                }),
                ..Self::default()
            }),
            "ramp" => Ok(Self {
                stages: Some(vec![
                    StageConfig {
                        duration: "30s".to_string(),
                        target: 10,
                    },
                    StageConfig {
                        duration: "60s".to_string(),
                        target: 20,
                    },
                    StageConfig {
                        duration: "30s".to_string(),
                        target: 0,
                    },
                ]),
                request_timeout: Some("5s".to_string()),
                iteration_pause: Some("1s".to_string()),
                thresholds: Some(BTreeMap::from([
                    (
                        "http_req_failed".to_string(),
                        vec![ThresholdEntry::Expr("rate<0.01".to_string())],
                    ),
                    (
                        "http_req_duration".to_string(),
                        vec![ThresholdEntry::Expr("p(95)<300".to_string())],
                    ),
                ])),
                probe: Some(ProbeConfig {
                    path: Some("/healthz".to_string()),
                    expect_status: Some(200),
                    query: None,
                }),
                ..Self::default()
            }),
            other => Err(ConfigError::UnknownProfile(other.to_string())),
        }
    }

    /// Layer `other` on top of `self`; fields set in `other` win.
    pub fn overlay(self, other: RunConfig) -> RunConfig {
        RunConfig {
            base_url: other.base_url.or(self.base_url),
            request_timeout: other.request_timeout.or(self.request_timeout),
            vus: other.vus.or(self.vus),
            duration: other.duration.or(self.duration),
            iterations: other.iterations.or(self.iterations),
            stages: other.stages.or(self.stages),
            ramp_down_after_last_stage: other
                .ramp_down_after_last_stage
                .or(self.ramp_down_after_last_stage),
            iteration_pause: other.iteration_pause.or(self.iteration_pause),
            min_iteration_duration: other.min_iteration_duration.or(self.min_iteration_duration),
            graceful_stop: other.graceful_stop.or(self.graceful_stop),
            threshold_interval: other.threshold_interval.or(self.threshold_interval),
            seed: other.seed.or(self.seed),
            thresholds: other.thresholds.or(self.thresholds),
            probe: other.probe.or(self.probe),
        }
    }

    /// Validate everything up front. Nothing is spawned on error.
    pub fn into_plan(self) -> ConfigResult<LoadTest> {
        let base_url = self
            .base_url
            .as_deref()
            .map(|u| {
                let u = u.trim();
                u.strip_suffix('/').unwrap_or(u)
            })
            .filter(|u| !u.is_empty())
            .ok_or(ConfigError::MissingBaseUrl)?
            .to_string();

        let stages = self
            .stages
            .as_deref()
            .unwrap_or_default()
            .iter()
            .enumerate()
            .map(|(index, s)| {
                parse_config_duration("stage duration", &s.duration)
                    .map(|d| Stage::new(d, s.target))
                    .map_err(|_| ConfigError::InvalidStage {
                        index,
                        reason: format!("invalid duration '{}'", s.duration),
                    })
            })
            .collect::<ConfigResult<Vec<_>>>()?;

        if self.iterations == Some(0) {
            return Err(invalid("iterations", "must be at least 1"));
        }

        let end_policy = if self.ramp_down_after_last_stage.unwrap_or(false) {
            EndPolicy::RampDown
        } else {
            EndPolicy::HoldLast
        };

        let (schedule, duration) = if !stages.is_empty() {
            let schedule = StageSchedule::new(stages, end_policy);
            let total = schedule.total_duration();
            // an explicit duration may run past the last stage, where the end policy applies
            let duration = match (&self.duration, self.iterations) {
                (Some(d), _) => parse_config_duration("duration", d)?.max(total),
                (None, Some(_)) if total.is_zero() => DEFAULT_MAX_DURATION,
                (None, _) => total,
            };
            if duration.is_zero() {
                return Err(ConfigError::NoDuration);
            }
            (schedule, duration)
        } else {
            let vus = self.vus.unwrap_or(1);
            if vus == 0 {
                return Err(invalid("vus", "must be at least 1 when no stages are given"));
            }
            let duration = match (&self.duration, self.iterations) {
                (Some(d), _) => parse_config_duration("duration", d)?,
                (None, Some(_)) => DEFAULT_MAX_DURATION,
                (None, None) => return Err(ConfigError::NoDuration),
            };
            if duration.is_zero() {
                return Err(ConfigError::NoDuration);
            }
            (StageSchedule::constant(vus, duration), duration)
        };

        let mut specs = Vec::new();
        for (metric, entries) in self.thresholds.iter().flatten() {
            for entry in entries {
                let spec = match entry {
                    ThresholdEntry::Expr(expr) => ThresholdSpec::parse(metric, expr)?,
                    ThresholdEntry::Detailed {
                        threshold,
                        abort_on_fail,
                        delay_abort_eval,
                    } => {
                        let delay = optional_duration(
                            "delayAbortEval",
                            delay_abort_eval.as_deref(),
                            Duration::ZERO,
                        )?;
                        ThresholdSpec::parse(metric, threshold)?.with_abort(*abort_on_fail, delay)
                    }
                };
                specs.push(spec);
            }
        }

        let threshold_interval = optional_duration(
            "threshold_interval",
            self.threshold_interval.as_deref(),
            DEFAULT_THRESHOLD_INTERVAL,
        )?;
        if threshold_interval.is_zero() {
            return Err(invalid("threshold_interval", "must be greater than zero"));
        }

        let probe = self.probe.unwrap_or_default();
        let expect_status = probe.expect_status.unwrap_or(200);
        if !(100..=599).contains(&expect_status) {
            return Err(invalid("expect_status", "not an HTTP status code"));
        }
        let path = match probe.path {
            Some(p) if p.starts_with('/') => p,
            Some(p) if p.is_empty() => "/".to_string(),
            Some(p) => format!("/{}", p),
            None => "/".to_string(),
        };
        let query = probe
            .query
            .unwrap_or_default()
            .into_iter()
            .filter(|(_, values)| !values.is_empty())
            .collect();

        let plan = RunPlan {
            thresholds: ThresholdEngine::new(specs),
            iterations: self.iterations,
            duration,
            pause: optional_duration(
                "iteration_pause",
                self.iteration_pause.as_deref(),
                Duration::ZERO,
            )?,
            min_iteration_duration: optional_duration(
                "min_iteration_duration",
                self.min_iteration_duration.as_deref(),
                Duration::ZERO,
            )?,
            graceful_stop: optional_duration(
                "graceful_stop",
                self.graceful_stop.as_deref(),
                DEFAULT_GRACEFUL_STOP,
            )?,
            threshold_interval,
            seed: self.seed.unwrap_or(0),
            ..RunPlan::new(schedule)
        };

        Ok(LoadTest {
            plan,
            probe: ProbeTarget {
                base_url,
                path,
                expect_status,
                query,
                timeout: optional_duration(
                    "request_timeout",
                    self.request_timeout.as_deref(),
                    DEFAULT_REQUEST_TIMEOUT,
                )?,
            },
        })
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
