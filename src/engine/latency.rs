use crate::engine::client::{parse_url, ProbeClient};
use crate::error::ProbeError;
use crate::stats::OnlineStats;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencySummary {
    pub sent: u32,
    pub received: u32,
    /// Mean round trip of the successful requests.
    pub latency: Duration,
    /// Population standard deviation of those round trips.
    pub jitter: Duration,
    /// Percent of requests that failed.
    pub packet_loss: f64,
}

/// Sends `count` sequential GETs to `url`, each on a new connection, pausing
/// `interval` between attempts. Failed attempts are counted, never retried.
pub async fn run_latency_probes(
    client: &ProbeClient,
    url: &str,
    count: u32,
    interval: Duration,
) -> Result<LatencySummary, ProbeError> {
    let url = parse_url(url)?;
    let mut received = 0u32;
    let mut online = OnlineStats::default();

    for i in 0..count {
        let start = Instant::now();
        let ok = match client.fresh.get(url.clone()).send().await {
            Ok(resp) => resp.bytes().await.is_ok(),
            Err(e) => {
                tracing::debug!(attempt = i + 1, "latency probe failed: {e}");
                false
            }
        };
        if ok {
            received += 1;
            online.push(start.elapsed().as_secs_f64());
        }

        if i + 1 < count {
            tokio::time::sleep(interval).await;
        }
    }

    if received == 0 {
        return Err(ProbeError::NoSuccessfulProbes { attempts: count });
    }

    let failed = count - received;
    Ok(LatencySummary {
        sent: count,
        received,
        latency: Duration::from_secs_f64(online.mean()),
        jitter: Duration::from_secs_f64(online.population_stddev()),
        packet_loss: f64::from(failed) / f64::from(count) * 100.0,
    })
}
