use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Latency,
    Download,
    Upload,
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProbeKind::Latency => "latency",
            ProbeKind::Download => "download",
            ProbeKind::Upload => "upload",
        })
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid probe URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to build HTTP client: {0}")]
    Client(String),
    #[error("no successful probes out of {attempts} attempts")]
    NoSuccessfulProbes { attempts: u32 },
    #[error("failed to start download: {0}")]
    Request(#[source] reqwest::Error),
    #[error("no response within {0:?}")]
    NoResponse(std::time::Duration),
    #[error("download read error: {0}")]
    Read(#[source] reqwest::Error),
    #[error("stream {stream}: upload failed: {source}")]
    Stream {
        stream: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("upload task aborted: {0}")]
    Join(String),
    #[error("no data was uploaded")]
    NoDataUploaded,
    #[error("test completed too quickly to measure")]
    ZeroElapsed,
}

/// One probe's failure in a measurement cycle.
#[derive(Debug, Error)]
#[error("{kind} test failed: {source}")]
pub struct ProbeFailure {
    pub kind: ProbeKind,
    #[source]
    pub source: ProbeError,
}

/// Every probe failure of a cycle, reported together.
#[derive(Debug, Error)]
pub struct AggregateFailure(pub Vec<ProbeFailure>);

impl fmt::Display for AggregateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}

impl AggregateFailure {
    pub fn kinds(&self) -> Vec<ProbeKind> {
        self.0.iter().map(|f| f.kind).collect()
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("history I/O on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode history entry: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("corrupt history entry at {}:{line}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to replace history file {}: {source}", .path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}
