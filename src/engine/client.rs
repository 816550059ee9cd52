use crate::error::ProbeError;
use crate::model::ProbeConfig;
use reqwest::Url;
use std::time::Duration;

/// HTTP clients shared by the probes.
#[derive(Clone)]
pub struct ProbeClient {
    /// Pooled client for the throughput probes.
    pub http: reqwest::Client,
    /// Client that never reuses a connection, so every latency sample
    /// includes connection setup.
    pub fresh: reqwest::Client,
}

impl ProbeClient {
    pub fn new(cfg: &ProbeConfig) -> Result<Self, ProbeError> {
        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .tcp_keepalive(Duration::from_secs(15))
            .build()
            .map_err(|e| ProbeError::Client(e.to_string()))?;

        let fresh = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(cfg.latency_timeout)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| ProbeError::Client(e.to_string()))?;

        Ok(Self { http, fresh })
    }
}

pub fn parse_url(raw: &str) -> Result<Url, ProbeError> {
    Url::parse(raw).map_err(|e| ProbeError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })
}
