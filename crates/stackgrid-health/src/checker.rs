//! Target health: the threshold tracker and the HTTP probe.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use stackgrid_core::config::TargetPoolSettings;
use tracing::{debug, warn};

/// Probe spacing never grows past this while a target keeps failing.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// What the target pool currently believes about one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    /// No threshold crossed yet. New targets start here.
    Unknown,
}

/// Outcome of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// 2xx response.
    Healthy,
    /// Any other status code.
    Unhealthy,
    /// No response at all: refused, reset or timed out.
    Failed,
}

impl ProbeResult {
    pub fn passed(self) -> bool {
        self == ProbeResult::Healthy
    }
}

/// How a target pool probes its targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbePolicy {
    pub path: String,
    #[serde(with = "millis")]
    pub interval: Duration,
    #[serde(with = "millis")]
    pub timeout: Duration,
    /// Consecutive passes before a target is healthy.
    pub healthy_threshold: u32,
    /// Consecutive failures before a target is unhealthy.
    pub unhealthy_threshold: u32,
}

impl From<&TargetPoolSettings> for ProbePolicy {
    fn from(settings: &TargetPoolSettings) -> Self {
        Self {
            path: settings.health_path.clone(),
            interval: settings.interval,
            timeout: settings.timeout,
            healthy_threshold: settings.healthy_threshold,
            unhealthy_threshold: settings.unhealthy_threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Streak {
    Empty,
    Passing(u32),
    Failing(u32),
}

/// Consecutive-result bookkeeping for a single target.
///
/// Status only flips when a streak reaches its threshold, so a lone failed
/// probe does not evict a healthy target and a lone pass does not admit a
/// new one.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    status: HealthStatus,
    streak: Streak,
    healthy_threshold: u32,
    unhealthy_threshold: u32,
    interval: Duration,
    backoff: Duration,
}

impl HealthTracker {
    pub fn new(policy: &ProbePolicy) -> Self {
        Self {
            status: HealthStatus::Unknown,
            streak: Streak::Empty,
            healthy_threshold: policy.healthy_threshold.max(1),
            unhealthy_threshold: policy.unhealthy_threshold.max(1),
            interval: policy.interval,
            backoff: policy.interval,
        }
    }

    /// Fold one probe result in and return the resulting status.
    pub fn record(&mut self, result: ProbeResult) -> HealthStatus {
        if result.passed() {
            let run = match self.streak {
                Streak::Passing(n) => n + 1,
                _ => 1,
            };
            self.streak = Streak::Passing(run);
            self.backoff = self.interval;
            if run >= self.healthy_threshold && self.status != HealthStatus::Healthy {
                debug!(passes = run, "target passed healthy threshold");
                self.status = HealthStatus::Healthy;
            }
        } else {
            let run = match self.streak {
                Streak::Failing(n) => n + 1,
                _ => 1,
            };
            self.streak = Streak::Failing(run);
            self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
            if run >= self.unhealthy_threshold && self.status != HealthStatus::Unhealthy {
                warn!(
                    failures = run,
                    threshold = self.unhealthy_threshold,
                    "target marked unhealthy"
                );
                self.status = HealthStatus::Unhealthy;
            }
        }
        self.status
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    pub fn consecutive_failures(&self) -> u32 {
        match self.streak {
            Streak::Failing(n) => n,
            _ => 0,
        }
    }

    /// Delay before the next probe: the policy interval, doubled per
    /// consecutive failure up to [`MAX_BACKOFF`].
    pub fn next_interval(&self) -> Duration {
        self.backoff
    }
}

/// `GET http://{address}{path}` over a fresh HTTP/1.1 connection.
///
/// Everything, connect included, must finish within `timeout`.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");
    match tokio::time::timeout(timeout, fetch_status(address, &uri)).await {
        Ok(Ok(status)) if status.is_success() => ProbeResult::Healthy,
        Ok(Ok(status)) => {
            debug!(%status, %uri, "health probe non-2xx");
            ProbeResult::Unhealthy
        }
        Ok(Err(reason)) => {
            debug!(%reason, %uri, "health probe failed");
            ProbeResult::Failed
        }
        Err(_) => {
            debug!(%uri, "health probe timed out");
            ProbeResult::Failed
        }
    }
}

async fn fetch_status(address: &str, uri: &str) -> Result<http::StatusCode, String> {
    let stream = tokio::net::TcpStream::connect(address)
        .await
        .map_err(|e| format!("connect: {e}"))?;
    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| format!("handshake: {e}"))?;
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let request = http::Request::get(uri)
        .header(http::header::HOST, address)
        .header(http::header::USER_AGENT, "stackgrid-health/0.1")
        .body(http_body_util::Empty::<bytes::Bytes>::new())
        .map_err(|e| format!("request: {e}"))?;
    let response = sender
        .send_request(request)
        .await
        .map_err(|e| format!("send: {e}"))?;
    Ok(response.status())
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
