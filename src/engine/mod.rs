mod client;
mod latency;
#[cfg(test)]
pub(crate) mod testing;
mod throughput;

use client::ProbeClient;
use latency::run_latency_probes;
use throughput::{run_download, run_upload};

use crate::clock::Clock;
use crate::error::{AggregateFailure, ProbeError, ProbeFailure, ProbeKind, StoreError};
use crate::model::{MeasurementResult, ProbeConfig};
use crate::storage::HistoryStore;
use time::OffsetDateTime;

/// Outcome of one engine run: whatever succeeded, plus every probe failure.
#[derive(Debug)]
pub struct Measurement {
    pub result: MeasurementResult,
    pub failures: Vec<ProbeFailure>,
}

pub struct MeasurementEngine {
    cfg: ProbeConfig,
}

impl MeasurementEngine {
    pub fn new(cfg: ProbeConfig) -> Self {
        Self { cfg }
    }

    /// Runs latency, download and upload probes in turn. A failing probe
    /// leaves its fields at zero and does not stop the others.
    pub async fn run(&self) -> Measurement {
        let mut result = MeasurementResult::default();
        let mut failures = Vec::new();
        let mut fail = |kind: ProbeKind, source: ProbeError| {
            tracing::warn!("{kind} test failed: {source}");
            failures.push(ProbeFailure { kind, source });
        };

        let client = match ProbeClient::new(&self.cfg) {
            Ok(c) => c,
            Err(e) => {
                let reason = e.to_string();
                result.packet_loss = 100.0;
                for kind in [ProbeKind::Latency, ProbeKind::Download, ProbeKind::Upload] {
                    fail(kind, ProbeError::Client(reason.clone()));
                }
                return Measurement { result, failures };
            }
        };

        tracing::info!("measuring latency ({} probes)", self.cfg.latency_count);
        match run_latency_probes(
            &client,
            &self.cfg.latency_url,
            self.cfg.latency_count,
            self.cfg.latency_interval,
        )
        .await
        {
            Ok(s) => {
                tracing::info!(
                    "latency: {:?} (jitter: {:?}), packet loss: {:.1}% ({}/{} replies)",
                    s.latency,
                    s.jitter,
                    s.packet_loss,
                    s.received,
                    s.sent
                );
                result.latency = s.latency;
                result.jitter = s.jitter;
                result.packet_loss = s.packet_loss;
            }
            Err(e) => {
                // Nothing came back at all.
                result.packet_loss = 100.0;
                fail(ProbeKind::Latency, e);
            }
        }

        tracing::info!("measuring download for {:?}", self.cfg.download_duration);
        match run_download(&client, &self.cfg.download_url, self.cfg.download_duration).await {
            Ok(t) => {
                tracing::info!(
                    "download speed: {:.2} Mbps ({} bytes in {:?})",
                    t.mbps,
                    t.bytes,
                    t.elapsed
                );
                result.download_speed = t.mbps;
            }
            Err(e) => fail(ProbeKind::Download, e),
        }

        tracing::info!(
            "measuring upload for {:?} over {} streams",
            self.cfg.upload_duration,
            self.cfg.upload_streams
        );
        match run_upload(
            &client,
            &self.cfg.upload_url,
            self.cfg.upload_streams,
            self.cfg.upload_duration,
            self.cfg.upload_declared_length,
        )
        .await
        {
            Ok(report) => {
                tracing::info!(
                    "upload speed: {:.2} Mbps ({} bytes)",
                    report.throughput.mbps,
                    report.throughput.bytes
                );
                result.upload_speed = report.throughput.mbps;
                if let Some(e) = report.stream_error {
                    fail(ProbeKind::Upload, e);
                }
            }
            Err(e) => fail(ProbeKind::Upload, e),
        }

        Measurement { result, failures }
    }
}

/// A measurement that has been written to history.
#[derive(Debug)]
pub struct CycleReport {
    pub result: MeasurementResult,
    pub time: OffsetDateTime,
    pub failures: Option<AggregateFailure>,
}

/// Appends a finished measurement, partial or not, to `store`.
pub fn record<S, C>(
    store: &mut S,
    clock: &C,
    measurement: Measurement,
) -> Result<CycleReport, StoreError>
where
    S: HistoryStore<MeasurementResult> + ?Sized,
    C: Clock + ?Sized,
{
    let time = clock.now();
    store.append(measurement.result, time)?;
    let failures = if measurement.failures.is_empty() {
        None
    } else {
        Some(AggregateFailure(measurement.failures))
    };
    Ok(CycleReport {
        result: measurement.result,
        time,
        failures,
    })
}
