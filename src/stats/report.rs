use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

use super::thresholds::ThresholdResult;
use crate::engine::control::{RunState, StopReason};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TagSummary {
    pub count: u64,
    pub failures: u64,
    pub fail_rate: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct MetricSummary {
    pub total: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub fail_rate: f64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    /// Iterations per second.
    pub throughput: f64,
    /// False when percentiles come from a sampled reservoir.
    pub exact_percentiles: bool,
    pub errors: BTreeMap<String, u64>,
    pub tags: BTreeMap<String, TagSummary>,
}

/// Final verdict of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub state: RunState,
    pub stop_reason: StopReason,
    pub threshold_results: Vec<ThresholdResult>,
    pub summary: MetricSummary,
    #[serde(serialize_with = "as_secs")]
    pub duration: Duration,
    pub peak_vus: usize,
}

fn as_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

impl RunReport {
    pub fn thresholds_passed(&self) -> bool {
        self.threshold_results.iter().all(|r| r.passed)
    }

    /// Completed naturally and every threshold held.
    pub fn passed(&self) -> bool {
        self.state == RunState::Completed && self.thresholds_passed()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn print_summary(&self) {
        let s = &self.summary;
        println!("\n--- Run Summary ---");
        println!("State:          {} ({:?})", self.state, self.stop_reason);
        println!("Duration:       {:.1}s", self.duration.as_secs_f64());
        println!("Peak VUs:       {}", self.peak_vus);

        if s.total == 0 {
            println!("No iterations completed.");
        } else {
            println!("Iterations:     {} ({:.2}/s)", s.total, s.throughput);
            println!(
                "Failed:         {} ({:.2}%){}",
                s.failed,
                s.fail_rate * 100.0,
                if s.cancelled > 0 {
                    format!(", {} cancelled", s.cancelled)
                } else {
                    String::new()
                }
            );
            println!("Avg Latency:    {:.2} ms", s.avg_ms);
            println!("Min Latency:    {:.2} ms", s.min_ms);
            println!("Max Latency:    {:.2} ms", s.max_ms);
            println!("P50 Latency:    {:.2} ms", s.p50_ms);
            println!("P90 Latency:    {:.2} ms", s.p90_ms);
            println!("P95 Latency:    {:.2} ms", s.p95_ms);
            println!("P99 Latency:    {:.2} ms", s.p99_ms);
            if !s.exact_percentiles {
                println!("  (percentiles estimated from a sampled reservoir)");
            }
        }

        if !s.tags.is_empty() {
            println!("\nBy Tag:");
            for (name, tag) in &s.tags {
                println!("  {}", name);
                println!("    Count: {}", tag.count);
                println!("    P95:   {:.2} ms", tag.p95_ms);
                if tag.failures > 0 {
                    println!("    Failed: {} ({:.2}%)", tag.failures, tag.fail_rate * 100.0);
                }
            }
        }

        if !s.errors.is_empty() {
            println!("\nErrors:");
            for (err, count) in &s.errors {
                println!("  {}: {}", err, count);
            }
        }

        if !self.threshold_results.is_empty() {
            println!("\nThresholds:");
            for result in &self.threshold_results {
                println!("  {}", result);
            }
        }

        println!("-------------------\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::thresholds::{Comparator, MetricName};

    fn report(state: RunState, passed: bool) -> RunReport {
        RunReport {
            state,
            stop_reason: StopReason::DurationElapsed,
            threshold_results: vec![ThresholdResult {
                metric: MetricName::HttpReqFailed,
                expression: "rate<0.01".to_string(),
                comparator: Comparator::Lt,
                expected: 0.01,
                observed: if passed { 0.0 } else { 0.5 },
                passed,
                abort_on_fail: false,
            }],
            summary: MetricSummary::default(),
            duration: Duration::from_millis(1500),
            peak_vus: 3,
        }
    }

    #[test]
    fn test_verdict() {
        assert!(report(RunState::Completed, true).passed());
        assert!(!report(RunState::Completed, false).passed());
        assert!(!report(RunState::Aborted, true).passed());
        assert!(report(RunState::Aborted, true).thresholds_passed());
    }

    #[test]
    fn test_json_export() {
        let json = report(RunState::Completed, true).to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["state"], "Completed");
        assert_eq!(value["duration"], 1.5);
        assert_eq!(value["stop_reason"]["kind"], "duration_elapsed");
        assert_eq!(value["threshold_results"][0]["comparator"], "<");
        assert_eq!(value["threshold_results"][0]["metric"], "http_req_failed");
        assert_eq!(value["summary"]["total"], 0);
    }
}
