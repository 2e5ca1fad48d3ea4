//! Threshold parsing and evaluation.
//!
//! Expressions use the k6 grammar, e.g. `rate<0.01`, `p(95) < 300`,
//! `avg<=200`. They are parsed once at config time into a closed set of
//! aggregations and comparators; evaluation never touches strings.

use serde::Serialize;
use std::fmt;
use std::time::Duration;

use super::MetricSnapshot;
use crate::error::{ConfigError, ConfigResult};

/// Metric a threshold is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricName {
    /// Failure ratio of iterations.
    HttpReqFailed,
    /// Iteration latency in milliseconds.
    HttpReqDuration,
    IterationDuration,
    /// Iteration count / throughput.
    Iterations,
    /// Success ratio of iterations.
    Checks,
}

impl MetricName {
    pub fn parse(name: &str) -> ConfigResult<Self> {
        match name.trim() {
            "http_req_failed" => Ok(Self::HttpReqFailed),
            "http_req_duration" => Ok(Self::HttpReqDuration),
            "iteration_duration" => Ok(Self::IterationDuration),
            "iterations" => Ok(Self::Iterations),
            "checks" => Ok(Self::Checks),
            other => Err(ConfigError::UnknownMetric(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::HttpReqFailed => "http_req_failed",
            Self::HttpReqDuration => "http_req_duration",
            Self::IterationDuration => "iteration_duration",
            Self::Iterations => "iterations",
            Self::Checks => "checks",
        }
    }

    pub fn is_trend(self) -> bool {
        matches!(self, Self::HttpReqDuration | Self::IterationDuration)
    }

    fn supports(self, agg: Aggregation) -> bool {
        match self {
            Self::HttpReqFailed | Self::Checks => agg == Aggregation::Rate,
            Self::Iterations => matches!(agg, Aggregation::Rate | Aggregation::Count),
            Self::HttpReqDuration | Self::IterationDuration => {
                !matches!(agg, Aggregation::Rate)
            }
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Rate,
    Percentile(f64),
    Avg,
    Min,
    Max,
    Med,
    Count,
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rate => f.write_str("rate"),
            Self::Percentile(q) => write!(f, "p({})", q),
            Self::Avg => f.write_str("avg"),
            Self::Min => f.write_str("min"),
            Self::Max => f.write_str("max"),
            Self::Med => f.write_str("med"),
            Self::Count => f.write_str("count"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Comparator {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl Comparator {
    pub fn holds(self, observed: f64, expected: f64) -> bool {
        match self {
            Self::Lt => observed < expected,
            Self::Le => observed <= expected,
            Self::Gt => observed > expected,
            Self::Ge => observed >= expected,
            Self::Eq => (observed - expected).abs() < f64::EPSILON,
            Self::Ne => (observed - expected).abs() >= f64::EPSILON,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
        }
    }
}

/// A parsed pass/fail predicate over one metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdSpec {
    pub metric: MetricName,
    pub source: String,
    pub aggregation: Aggregation,
    pub comparator: Comparator,
    pub value: f64,
    pub abort_on_fail: bool,
    /// Abort checks are skipped until this much run time has elapsed.
    pub delay_abort_eval: Duration,
}

impl ThresholdSpec {
    pub fn parse(metric: &str, expression: &str) -> ConfigResult<Self> {
        let metric = MetricName::parse(metric)?;
        let invalid = |reason: &str| ConfigError::InvalidThreshold {
            metric: metric.to_string(),
            expression: expression.to_string(),
            reason: reason.to_string(),
        };

        let compact: String = expression.chars().filter(|c| !c.is_whitespace()).collect();
        let op_at = compact
            .find(['<', '>', '=', '!'])
            .ok_or_else(|| invalid("missing comparator"))?;
        let (lhs, rest) = compact.split_at(op_at);

        let (comparator, rhs) = [
            ("<=", Comparator::Le),
            (">=", Comparator::Ge),
            ("==", Comparator::Eq),
            ("!=", Comparator::Ne),
            ("<", Comparator::Lt),
            (">", Comparator::Gt),
        ]
        .iter()
        .find_map(|(sym, cmp)| rest.strip_prefix(sym).map(|rhs| (*cmp, rhs)))
        .ok_or_else(|| invalid("unknown comparator"))?;

        let aggregation = parse_aggregation(lhs).ok_or_else(|| invalid("unknown aggregation"))?;
        if !metric.supports(aggregation) {
            return Err(invalid("aggregation not available for this metric"));
        }

        let value: f64 = rhs
            .trim_end_matches("ms")
            .parse()
            .map_err(|_| invalid("threshold value is not a number"))?;
        if !value.is_finite() {
            return Err(invalid("threshold value is not finite"));
        }

        Ok(Self {
            metric,
            source: expression.trim().to_string(),
            aggregation,
            comparator,
            value,
            abort_on_fail: false,
            delay_abort_eval: Duration::ZERO,
        })
    }

    pub fn with_abort(mut self, abort_on_fail: bool, delay: Duration) -> Self {
        self.abort_on_fail = abort_on_fail;
        self.delay_abort_eval = delay;
        self
    }

    /// The value this threshold looks at in `snapshot`.
    pub fn observe(&self, snapshot: &MetricSnapshot) -> f64 {
        match (self.metric, self.aggregation) {
            (MetricName::HttpReqFailed, _) => snapshot.rate,
            (MetricName::Checks, _) => snapshot.success_rate(),
            (MetricName::Iterations, Aggregation::Count) => snapshot.count as f64,
            (MetricName::Iterations, _) => snapshot.throughput,
            (_, Aggregation::Percentile(q)) => snapshot.percentile(q),
            (_, Aggregation::Avg) => snapshot.avg,
            (_, Aggregation::Min) => snapshot.min,
            (_, Aggregation::Max) => snapshot.max,
            (_, Aggregation::Med) => snapshot.p50,
            (_, Aggregation::Count) => snapshot.count as f64,
            (_, Aggregation::Rate) => snapshot.rate,
        }
    }

    pub fn check(&self, snapshot: &MetricSnapshot) -> ThresholdResult {
        let observed = self.observe(snapshot);
        ThresholdResult {
            metric: self.metric,
            expression: self.source.clone(),
            comparator: self.comparator,
            expected: self.value,
            observed,
            passed: self.comparator.holds(observed, self.value),
            abort_on_fail: self.abort_on_fail,
        }
    }
}

fn parse_aggregation(lhs: &str) -> Option<Aggregation> {
    match lhs {
        "rate" => Some(Aggregation::Rate),
        "avg" => Some(Aggregation::Avg),
        "min" => Some(Aggregation::Min),
        "max" => Some(Aggregation::Max),
        "med" => Some(Aggregation::Med),
        "count" => Some(Aggregation::Count),
        _ => {
            // p(95), p(99.9) and the shorthand p95
            let inner = lhs
                .strip_prefix("p(")
                .and_then(|s| s.strip_suffix(')'))
                .or_else(|| lhs.strip_prefix('p'))?;
            let q: f64 = inner.parse().ok()?;
            (q > 0.0 && q <= 100.0).then_some(Aggregation::Percentile(q))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdResult {
    pub metric: MetricName,
    pub expression: String,
    pub comparator: Comparator,
    pub expected: f64,
    pub observed: f64,
    pub passed: bool,
    pub abort_on_fail: bool,
}

impl fmt::Display for ThresholdResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = if self.passed { "✓" } else { "✗" };
        let unit = if self.metric.is_trend() { "ms" } else { "" };
        write!(
            f,
            "{} {} {} (observed {:.4}{}, expected {} {}{})",
            mark,
            self.metric,
            self.expression,
            self.observed,
            unit,
            self.comparator.symbol(),
            self.expected,
            unit
        )
    }
}

/// What one evaluation pass concluded.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub results: Vec<ThresholdResult>,
    /// Index of the first failing abort-on-fail threshold that is past its delay.
    pub abort: Option<usize>,
}

impl Evaluation {
    pub fn passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }
}

/// Holds the immutable threshold set for a run.
#[derive(Debug, Clone, Default)]
pub struct ThresholdEngine {
    specs: Vec<ThresholdSpec>,
}

impl ThresholdEngine {
    pub fn new(specs: Vec<ThresholdSpec>) -> Self {
        Self { specs }
    }

    pub fn specs(&self) -> &[ThresholdSpec] {
        &self.specs
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn has_abort_thresholds(&self) -> bool {
        self.specs.iter().any(|s| s.abort_on_fail)
    }

    /// Every threshold reads the same cumulative snapshot; the metric only
    /// picks which field of it is compared.
    pub fn evaluate(&self, snapshot: &MetricSnapshot) -> Vec<ThresholdResult> {
        self.specs.iter().map(|s| s.check(snapshot)).collect()
    }

    /// Evaluation during the run: also reports whether an abort is due at
    /// `elapsed`.
    pub fn evaluate_live(&self, snapshot: &MetricSnapshot, elapsed: Duration) -> Evaluation {
        let results = self.evaluate(snapshot);
        let abort = self.specs.iter().zip(&results).position(|(spec, result)| {
            spec.abort_on_fail && !result.passed && elapsed >= spec.delay_abort_eval
        });
        Evaluation { results, abort }
    }
}
