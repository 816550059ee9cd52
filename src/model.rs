use serde::{Deserialize, Serialize};
use std::time::Duration;
use time::OffsetDateTime;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// GET endpoint streaming a large payload (>= 100 MB).
    pub download_url: String,
    /// POST endpoint accepting an arbitrarily long streamed body.
    pub upload_url: String,
    /// GET endpoint answering quickly with a tiny payload.
    pub latency_url: String,
    pub latency_count: u32,
    #[serde(with = "humantime_serde")]
    pub latency_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub latency_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub download_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub upload_duration: Duration,
    pub upload_streams: usize,
    /// Content-Length announced for each upload stream. Never actually reached.
    pub upload_declared_length: u64,
    pub user_agent: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            download_url: "https://speed.cloudflare.com/__down?bytes=104857600".into(),
            upload_url: "https://speed.cloudflare.com/__up".into(),
            latency_url: "https://speed.cloudflare.com/__down?bytes=1".into(),
            latency_count: 20,
            latency_timeout: Duration::from_secs(5),
            latency_interval: Duration::from_millis(100),
            download_duration: Duration::from_secs(10),
            upload_duration: Duration::from_secs(10),
            upload_streams: 3,
            upload_declared_length: 1024 * 1024 * 1024,
            user_agent: format!("netpulse/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// One measurement cycle. Fields of failed probes stay zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MeasurementResult {
    /// Mbps
    pub download_speed: f64,
    /// Mbps
    pub upload_speed: f64,
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    #[serde(with = "humantime_serde")]
    pub jitter: Duration,
    /// Percent, 0..=100
    pub packet_loss: f64,
}

/// A stored sample: any value plus the UTC instant it was taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry<T> {
    pub value: T,
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
}

impl<T> HistoryEntry<T> {
    /// Builds an entry, normalising the timestamp to UTC.
    pub fn new(value: T, time: OffsetDateTime) -> Self {
        Self {
            value,
            time: time.to_offset(time::UtcOffset::UTC),
        }
    }
}
