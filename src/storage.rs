use crate::error::StoreError;
use crate::model::{HistoryEntry, MeasurementResult};
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

/// Persistence needed by the measurement cycle and the compactor.
///
/// All methods take `&mut self`: a caller holding the store has exclusive
/// access for the whole read-modify-replace sequence. Hosts that share a
/// store between tasks wrap it in a single mutex.
pub trait HistoryStore<T> {
    fn append(&mut self, value: T, time: OffsetDateTime) -> Result<(), StoreError>;

    /// Every entry, sorted by timestamp ascending.
    fn retrieve_all(&mut self) -> Result<Vec<HistoryEntry<T>>, StoreError>;

    /// Replace the whole history in one step. On error the previous history
    /// is left as it was.
    fn replace_all(&mut self, entries: &[HistoryEntry<T>]) -> Result<(), StoreError>;
}

/// Default directory for application data.
fn base_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("netpulse")
}

pub fn default_history_path() -> PathBuf {
    base_dir().join("history.jsonl")
}

/// History kept as one JSON object per line.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Opens (creating parent directories for) the history file at `path`.
    /// The file itself is created on first append.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
        }
        tracing::debug!(path = %path.display(), "history store opened");
        Ok(Self { path })
    }

    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(d) if !d.as_os_str().is_empty() => d,
            _ => Path::new("."),
        }
    }
}

impl<T> HistoryStore<T> for FileStore
where
    T: Serialize + DeserializeOwned,
{
    fn append(&mut self, value: T, time: OffsetDateTime) -> Result<(), StoreError> {
        let entry = HistoryEntry::new(value, time);
        let mut line = serde_json::to_vec(&entry).map_err(StoreError::Encode)?;
        line.push(b'\n');

        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| StoreError::io(&self.path, e))?;
        f.write_all(&line)
            .map_err(|e| StoreError::io(&self.path, e))?;
        f.sync_all().map_err(|e| StoreError::io(&self.path, e))?;
        Ok(())
    }

    fn retrieve_all(&mut self) -> Result<Vec<HistoryEntry<T>>, StoreError> {
        let f = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };

        let mut entries = Vec::new();
        for (i, line) in BufReader::new(f).lines().enumerate() {
            let line = line.map_err(|e| StoreError::io(&self.path, e))?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let entry: HistoryEntry<T> =
                serde_json::from_str(line).map_err(|source| StoreError::Corrupt {
                    path: self.path.clone(),
                    line: i + 1,
                    source,
                })?;
            entries.push(entry);
        }
        // Appends from a clock that stepped backwards would otherwise leak out of order.
        entries.sort_by_key(|e| e.time);
        Ok(entries)
    }

    fn replace_all(&mut self, entries: &[HistoryEntry<T>]) -> Result<(), StoreError> {
        let tmp = tempfile::NamedTempFile::new_in(self.dir())
            .map_err(|e| StoreError::io(self.dir(), e))?;
        {
            let mut w = BufWriter::new(tmp.as_file());
            for entry in entries {
                serde_json::to_writer(&mut w, entry).map_err(StoreError::Encode)?;
                w.write_all(b"\n")
                    .map_err(|e| StoreError::io(tmp.path(), e))?;
            }
            w.flush().map_err(|e| StoreError::io(tmp.path(), e))?;
        }
        tmp.as_file()
            .sync_all()
            .map_err(|e| StoreError::io(tmp.path(), e))?;
        tmp.persist(&self.path).map_err(|e| StoreError::Persist {
            path: self.path.clone(),
            source: e.error,
        })?;
        Ok(())
    }
}

/// Vector-backed store.
#[cfg(test)]
#[derive(Debug, Clone)]
pub struct MemoryStore<T> {
    entries: Vec<HistoryEntry<T>>,
}

#[cfg(test)]
impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

#[cfg(test)]
impl<T> MemoryStore<T> {
    pub fn with_entries(mut entries: Vec<HistoryEntry<T>>) -> Self {
        entries.sort_by_key(|e| e.time);
        Self { entries }
    }
}

#[cfg(test)]
impl<T: Clone> HistoryStore<T> for MemoryStore<T> {
    fn append(&mut self, value: T, time: OffsetDateTime) -> Result<(), StoreError> {
        let entry = HistoryEntry::new(value, time);
        let at = self.entries.partition_point(|e| e.time <= entry.time);
        self.entries.insert(at, entry);
        Ok(())
    }

    fn retrieve_all(&mut self) -> Result<Vec<HistoryEntry<T>>, StoreError> {
        Ok(self.entries.clone())
    }

    fn replace_all(&mut self, entries: &[HistoryEntry<T>]) -> Result<(), StoreError> {
        self.entries = entries.to_vec();
        Ok(())
    }
}

#[derive(serde::Serialize)]
pub struct DataResponse<'a> {
    pub test_results: &'a [HistoryEntry<MeasurementResult>],
}

pub fn write_json<W: Write>(
    out: W,
    entries: &[HistoryEntry<MeasurementResult>],
) -> anyhow::Result<()> {
    serde_json::to_writer_pretty(out, &DataResponse { test_results: entries })?;
    Ok(())
}

pub fn write_csv<W: Write>(
    mut out: W,
    entries: &[HistoryEntry<MeasurementResult>],
) -> anyhow::Result<()> {
    writeln!(
        out,
        "time_utc,download_mbps,upload_mbps,latency_ms,jitter_ms,packet_loss_pct"
    )?;
    for e in entries {
        let ts = e
            .time
            .format(&time::format_description::well_known::Rfc3339)?;
        writeln!(
            out,
            "{},{:.3},{:.3},{:.3},{:.3},{:.1}",
            csv_escape(&ts),
            e.value.download_speed,
            e.value.upload_speed,
            e.value.latency.as_secs_f64() * 1000.0,
            e.value.jitter.as_secs_f64() * 1000.0,
            e.value.packet_loss,
        )?;
    }
    Ok(())
}

/// Escape a string for CSV format (handles commas, quotes, and newlines).
fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
