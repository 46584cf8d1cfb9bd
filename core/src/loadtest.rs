/// Load harness for the credential endpoint and the home page
///
/// Each scenario drives GET requests at a ramping arrival rate, checks every
/// response, and compares latency percentiles and error rate with its thresholds.
use crate::auth_api::AUTH_PATH;
use crate::error::Result;
use crate::http_client;
use futures_util::future::join_all;
use hyper::{Method, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Home,
    Auth,
}

/// Move linearly to `target` requests per second over `duration`
#[derive(Debug, Clone, Copy)]
pub struct Stage {
    pub duration: Duration,
    pub target: f64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Thresholds {
    #[serde(with = "millis")]
    pub p95: Duration,
    #[serde(with = "millis")]
    pub p99: Duration,
    pub max_error_rate: f64,
}

#[derive(Debug, Clone)]
pub struct Scenario {
    pub name: &'static str,
    pub target: Target,
    pub start_rate: f64,
    pub stages: Vec<Stage>,
    /// Concurrent requests allowed before iterations are dropped
    pub max_in_flight: usize,
    pub thresholds: Option<Thresholds>,
}

impl Scenario {
    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    /// Arrival rate at `elapsed`, `None` once every stage has run
    pub fn rate_at(&self, elapsed: Duration) -> Option<f64> {
        let mut from = self.start_rate;
        let mut offset = Duration::ZERO;
        for stage in &self.stages {
            if elapsed < offset + stage.duration {
                let progress = (elapsed - offset).as_secs_f64() / stage.duration.as_secs_f64();
                return Some(from + (stage.target - from) * progress);
            }
            offset += stage.duration;
            from = stage.target;
        }
        None
    }

    /// Same shape, every stage duration multiplied by `factor`
    pub fn scaled(mut self, factor: f64) -> Self {
        for stage in &mut self.stages {
            stage.duration = stage.duration.mul_f64(factor);
        }
        self
    }
}

const AUTH_THRESHOLDS: Thresholds = Thresholds {
    p95: Duration::from_millis(100),
    p99: Duration::from_millis(200),
    max_error_rate: 0.01,
};

const HOME_THRESHOLDS: Thresholds = Thresholds {
    p95: Duration::from_millis(300),
    p99: Duration::from_millis(600),
    max_error_rate: 0.01,
};

/// Warmup on the home page, then ramps on both endpoints
pub fn default_scenarios() -> Vec<Scenario> {
    let secs = Duration::from_secs;
    vec![
        Scenario {
            name: "warmup",
            target: Target::Home,
            start_rate: 1.0,
            stages: vec![Stage { duration: secs(20), target: 1.0 }],
            max_in_flight: 10,
            thresholds: None,
        },
        Scenario {
            name: "ramp_auth",
            target: Target::Auth,
            start_rate: 1.0,
            stages: vec![
                Stage { duration: secs(45), target: 5.0 },
                Stage { duration: secs(60), target: 10.0 },
                Stage { duration: secs(30), target: 0.0 },
            ],
            max_in_flight: 40,
            thresholds: Some(AUTH_THRESHOLDS),
        },
        Scenario {
            name: "ramp_home",
            target: Target::Home,
            start_rate: 1.0,
            stages: vec![
                Stage { duration: secs(45), target: 3.0 },
                Stage { duration: secs(60), target: 5.0 },
                Stage { duration: secs(30), target: 0.0 },
            ],
            max_in_flight: 30,
            thresholds: Some(HOME_THRESHOLDS),
        },
    ]
}

#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub latency: Duration,
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: &'static str,
    pub target: Target,
    pub requests: usize,
    pub failures: usize,
    pub dropped: usize,
    pub error_rate: f64,
    #[serde(with = "millis")]
    pub p95: Duration,
    #[serde(with = "millis")]
    pub p99: Duration,
    pub violations: Vec<String>,
}

impl ScenarioReport {
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Nearest-rank percentile of an ascending slice
pub fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

pub fn summarize(scenario: &Scenario, samples: &[Sample], dropped: usize) -> ScenarioReport {
    let mut latencies: Vec<Duration> = samples.iter().map(|s| s.latency).collect();
    latencies.sort();
    let failures = samples.iter().filter(|s| !s.ok).count();
    let error_rate = if samples.is_empty() {
        0.0
    } else {
        failures as f64 / samples.len() as f64
    };
    let p95 = percentile(&latencies, 95.0);
    let p99 = percentile(&latencies, 99.0);

    let mut violations = Vec::new();
    if let Some(limits) = &scenario.thresholds {
        if p95 >= limits.p95 {
            violations.push(format!("p(95)={:?} >= {:?}", p95, limits.p95));
        }
        if p99 >= limits.p99 {
            violations.push(format!("p(99)={:?} >= {:?}", p99, limits.p99));
        }
        if error_rate >= limits.max_error_rate {
            violations.push(format!("error rate {:.4} >= {}", error_rate, limits.max_error_rate));
        }
    }

    ScenarioReport {
        name: scenario.name,
        target: scenario.target,
        requests: samples.len(),
        failures,
        dropped,
        error_rate,
        p95,
        p99,
        violations,
    }
}

/// One iteration: request plus checks
async fn hit(base_url: &str, target: Target, iteration: u64) -> Sample {
    let url = match target {
        Target::Home => format!("{}/", base_url),
        Target::Auth => format!("{}{}?clientId=vu{}-it{}", base_url, AUTH_PATH, iteration % 40, iteration),
    };

    let started = Instant::now();
    let result = http_client::send(Method::GET, &url, REQUEST_TIMEOUT).await;
    let latency = started.elapsed();

    let ok = match result {
        Ok(resp) if resp.status == StatusCode::OK => match target {
            Target::Home => !resp.body.is_empty(),
            Target::Auth => serde_json::from_slice::<serde_json::Value>(&resp.body)
                .ok()
                .and_then(|v| v.get("mac").and_then(|m| m.as_str()).map(|m| !m.is_empty()))
                .unwrap_or(false),
        },
        Ok(resp) => {
            debug!("{} answered {}", url, resp.status);
            false
        }
        Err(e) => {
            debug!("{} failed: {}", url, e);
            false
        }
    };
    Sample { latency, ok }
}

pub async fn run_scenario(base_url: Arc<str>, scenario: Scenario) -> ScenarioReport {
    info!(
        "Scenario {} starting ({:?}, {:?} total)",
        scenario.name,
        scenario.target,
        scenario.total_duration()
    );
    let slots = Arc::new(Semaphore::new(scenario.max_in_flight));
    let mut tasks = JoinSet::new();
    let mut dropped = 0usize;
    let mut iteration = 0u64;
    let start = Instant::now();
    let mut next_at = start;

    loop {
        let now = Instant::now();
        if now < next_at {
            sleep(next_at - now).await;
        }
        let Some(rate) = scenario.rate_at(next_at - start) else {
            break;
        };
        if rate < 0.01 {
            // Idle until the ramp picks up again
            next_at += Duration::from_millis(100);
            continue;
        }
        next_at += Duration::from_secs_f64(1.0 / rate);

        match slots.clone().try_acquire_owned() {
            Ok(permit) => {
                let base_url = base_url.clone();
                let target = scenario.target;
                let n = iteration;
                tasks.spawn(async move {
                    let sample = hit(&base_url, target, n).await;
                    drop(permit);
                    sample
                });
            }
            Err(_) => dropped += 1,
        }
        iteration += 1;
    }

    let mut samples = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(sample) => samples.push(sample),
            Err(e) => warn!("Load iteration panicked: {}", e),
        }
    }
    if dropped > 0 {
        warn!("Scenario {} dropped {} iterations (all slots busy)", scenario.name, dropped);
    }

    let report = summarize(&scenario, &samples, dropped);
    info!(
        "Scenario {} done: {} requests, p95={:?}, p99={:?}, error rate {:.4}",
        report.name, report.requests, report.p95, report.p99, report.error_rate
    );
    report
}

/// Run every scenario concurrently
pub async fn run(base_url: &str, scenarios: Vec<Scenario>) -> Result<Vec<ScenarioReport>> {
    let base_url: Arc<str> = Arc::from(base_url.trim_end_matches('/'));
    let runs = scenarios
        .into_iter()
        .map(|scenario| run_scenario(base_url.clone(), scenario));
    Ok(join_all(runs).await)
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64() * 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp() -> Scenario {
        Scenario {
            name: "ramp",
            target: Target::Auth,
            start_rate: 1.0,
            stages: vec![
                Stage { duration: Duration::from_secs(10), target: 5.0 },
                Stage { duration: Duration::from_secs(10), target: 0.0 },
            ],
            max_in_flight: 4,
            thresholds: Some(AUTH_THRESHOLDS),
        }
    }

    #[test]
    fn test_rate_interpolates_between_stages() {
        let scenario = ramp();
        assert_eq!(scenario.rate_at(Duration::ZERO), Some(1.0));
        assert_eq!(scenario.rate_at(Duration::from_secs(5)), Some(3.0));
        assert_eq!(scenario.rate_at(Duration::from_secs(15)), Some(2.5));
        assert_eq!(scenario.rate_at(Duration::from_secs(20)), None);
        assert_eq!(scenario.total_duration(), Duration::from_secs(20));
        assert_eq!(ramp().scaled(0.5).total_duration(), Duration::from_secs(10));
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let sorted: Vec<Duration> = (1..=100).map(Duration::from_millis).collect();
        assert_eq!(percentile(&sorted, 95.0), Duration::from_millis(95));
        assert_eq!(percentile(&sorted, 99.0), Duration::from_millis(99));
        assert_eq!(percentile(&[], 95.0), Duration::ZERO);
        assert_eq!(percentile(&sorted[..1], 99.0), Duration::from_millis(1));
    }

    #[test]
    fn test_thresholds() {
        let fast: Vec<Sample> = (0..100)
            .map(|_| Sample { latency: Duration::from_millis(5), ok: true })
            .collect();
        assert!(summarize(&ramp(), &fast, 0).passed());

        let mut slow = fast.clone();
        for sample in slow.iter_mut().take(10) {
            sample.latency = Duration::from_millis(500);
        }
        let report = summarize(&ramp(), &slow, 0);
        assert!(!report.passed());
        assert_eq!(report.violations.len(), 2);

        let mut failing = fast;
        failing[0].ok = false;
        failing[1].ok = false;
        let report = summarize(&ramp(), &failing, 0);
        assert_eq!(report.failures, 2);
        assert!(!report.passed());
    }
}
