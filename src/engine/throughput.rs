use crate::engine::client::{parse_url, ProbeClient};
use crate::error::ProbeError;
use bytes::Bytes;
use futures::{stream, Stream, StreamExt};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};

/// Repeated to fill every upload chunk.
const UPLOAD_PATTERN: &[u8] = b"0123456789";
/// Upload chunk size (10 KB of pattern).
const UPLOAD_CHUNK_REPEAT: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throughput {
    pub bytes: u64,
    pub elapsed: Duration,
    pub mbps: f64,
}

fn throughput(bytes: u64, elapsed: Duration) -> Result<Throughput, ProbeError> {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return Err(ProbeError::ZeroElapsed);
    }
    Ok(Throughput {
        bytes,
        elapsed,
        mbps: (bytes as f64) * 8.0 / secs / 1_000_000.0,
    })
}

/// Reads one large download until the body ends or `duration` runs out.
/// Running out of time is the normal way for this probe to finish.
pub async fn run_download(
    client: &ProbeClient,
    url: &str,
    duration: Duration,
) -> Result<Throughput, ProbeError> {
    let url = parse_url(url)?;
    let start = Instant::now();
    let deadline = start + duration;

    let resp = match timeout_at(deadline, client.http.get(url).send()).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => return Err(ProbeError::Request(e)),
        Err(_) => return Err(ProbeError::NoResponse(duration)),
    };

    let mut body = resp.bytes_stream();
    let mut total = 0u64;
    loop {
        match timeout_at(deadline, body.next()).await {
            Err(_) | Ok(None) => break,
            Ok(Some(Ok(chunk))) => total += chunk.len() as u64,
            Ok(Some(Err(e))) => return Err(ProbeError::Read(e)),
        }
    }

    throughput(total, start.elapsed())
}

/// Upload throughput plus the first genuine stream failure, if any.
#[derive(Debug)]
pub struct UploadReport {
    pub throughput: Throughput,
    pub stream_error: Option<ProbeError>,
}

/// Endless pattern chunks until `deadline`, counting every byte handed out.
fn pattern_body(
    deadline: Instant,
    produced: Arc<AtomicU64>,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
    let chunk = Bytes::from(UPLOAD_PATTERN.repeat(UPLOAD_CHUNK_REPEAT));
    stream::iter(std::iter::from_fn(move || {
        if Instant::now() >= deadline {
            return None;
        }
        produced.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        Some(Ok(chunk.clone()))
    }))
}

/// Runs `streams` concurrent uploads sharing one deadline and sums what they
/// sent. Hitting the deadline is not an error; a transport failure is, and the
/// first one to happen is reported alongside the throughput.
pub async fn run_upload(
    client: &ProbeClient,
    url: &str,
    streams: usize,
    duration: Duration,
    declared_length: u64,
) -> Result<UploadReport, ProbeError> {
    let url = parse_url(url)?;
    let start = Instant::now();
    let deadline = start + duration;

    let mut counters = Vec::with_capacity(streams);
    let mut tasks = JoinSet::new();
    for stream_id in 0..streams {
        let produced = Arc::new(AtomicU64::new(0));
        counters.push(produced.clone());
        let req = client
            .http
            .post(url.clone())
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, declared_length)
            .body(reqwest::Body::wrap_stream(pattern_body(deadline, produced)));

        tasks.spawn(async move {
            match timeout_at(deadline, req.send()).await {
                Err(_) => Ok(()),
                // The body ran dry because time is up; the server just saw it cut short.
                Ok(Err(_)) if Instant::now() >= deadline => Ok(()),
                Ok(Err(source)) => Err(ProbeError::Stream {
                    stream: stream_id,
                    source,
                }),
                Ok(Ok(resp)) => {
                    let _ = timeout_at(deadline, resp.bytes()).await;
                    Ok(())
                }
            }
        });
    }

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let err = match joined {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e,
            Err(e) => ProbeError::Join(e.to_string()),
        };
        tracing::debug!("upload stream failed: {err}");
        if first_error.is_none() {
            first_error = Some(err);
        }
    }

    let elapsed = start.elapsed();
    let bytes: u64 = counters.iter().map(|c| c.load(Ordering::Relaxed)).sum();
    if bytes == 0 {
        if let Some(err) = &first_error {
            tracing::warn!("nothing uploaded, first stream error: {err}");
        }
        return Err(ProbeError::NoDataUploaded);
    }
    Ok(UploadReport {
        throughput: throughput(bytes, elapsed)?,
        stream_error: first_error,
    })
}
