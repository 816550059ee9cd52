//! Age-based downsampling of the measurement history.
//!
//! Entries from today are never touched. Entries from the last month are
//! folded per clock hour, entries one to three months old per six-hour block.
//! Anything older than three months was already folded by an earlier pass and
//! is passed through. Each group of more than one entry is replaced by the
//! result of a caller-supplied join function.

use crate::clock::Clock;
use crate::error::StoreError;
use crate::model::{HistoryEntry, MeasurementResult};
use crate::stats::{median, median_time};
use crate::storage::HistoryStore;
use time::{Date, Month, OffsetDateTime, Time, UtcOffset};

/// Reference instants for one pass, fixed at its start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Anchors {
    pub now: OffsetDateTime,
    pub start_of_today: OffsetDateTime,
    pub one_month_ago: OffsetDateTime,
    pub three_months_ago: OffsetDateTime,
}

impl Anchors {
    /// Anchors for `now`, using the calendar of `now`'s offset.
    pub fn at(now: OffsetDateTime) -> Self {
        Self {
            now,
            start_of_today: now.replace_time(Time::MIDNIGHT),
            one_month_ago: months_before(now, 1),
            three_months_ago: months_before(now, 3),
        }
    }

    fn offset(&self) -> UtcOffset {
        self.now.offset()
    }
}

/// Same wall-clock time `months` calendar months earlier. The day is clamped
/// to the length of the target month.
fn months_before(t: OffsetDateTime, months: u8) -> OffsetDateTime {
    let total = t.year() * 12 + (u8::from(t.month()) as i32 - 1) - months as i32;
    let year = total.div_euclid(12);
    // rem_euclid(12) is 0..=11, always a valid month.
    let month = Month::try_from((total.rem_euclid(12) + 1) as u8).unwrap_or(Month::January);
    let day = t.day().min(month.length(year));
    match Date::from_calendar_date(year, month, day) {
        Ok(date) => t.replace_date(date),
        Err(_) => t,
    }
}

/// Granularity bucket an entry falls in. Hourly and six-hourly keys never
/// compare equal, even for the same day and index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BucketKey {
    Hour { date: Date, hour: u8 },
    SixHours { date: Date, block: u8 },
}

/// Where an entry goes in a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Left exactly as stored.
    Passthrough,
    Bucket(BucketKey),
}

pub fn placement(anchors: &Anchors, time: OffsetDateTime) -> Placement {
    if time < anchors.three_months_ago || time >= anchors.start_of_today {
        return Placement::Passthrough;
    }
    let local = time.to_offset(anchors.offset());
    let date = local.date();
    let hour = local.hour();
    if time > anchors.one_month_ago {
        Placement::Bucket(BucketKey::Hour { date, hour })
    } else {
        Placement::Bucket(BucketKey::SixHours {
            date,
            block: hour / 6,
        })
    }
}

/// Folds an already time-sorted history.
///
/// Output keeps the input's relative order. A group of one is kept verbatim,
/// so running the pass again on its own output changes nothing.
pub fn compact<T, F>(
    entries: Vec<HistoryEntry<T>>,
    anchors: &Anchors,
    mut join: F,
) -> Vec<HistoryEntry<T>>
where
    F: FnMut(&[HistoryEntry<T>]) -> HistoryEntry<T>,
{
    let mut out = Vec::with_capacity(entries.len());
    let mut group: Vec<HistoryEntry<T>> = Vec::new();
    let mut group_key: Option<BucketKey> = None;

    let mut flush = |group: &mut Vec<HistoryEntry<T>>, out: &mut Vec<HistoryEntry<T>>| {
        match group.len() {
            0 => {}
            1 => out.append(group),
            _ => {
                out.push(join(group));
                group.clear();
            }
        }
    };

    for entry in entries {
        match placement(anchors, entry.time) {
            Placement::Passthrough => {
                flush(&mut group, &mut out);
                group_key = None;
                out.push(entry);
            }
            Placement::Bucket(key) => {
                if group_key != Some(key) {
                    flush(&mut group, &mut out);
                    group_key = Some(key);
                }
                group.push(entry);
            }
        }
    }
    flush(&mut group, &mut out);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionStats {
    pub before: usize,
    pub after: usize,
}

/// One full pass against a store: read everything, fold, replace everything.
///
/// Any store error aborts the pass; nothing is written unless the whole
/// history was read and folded.
pub fn compact_store<T, S, C, F>(
    store: &mut S,
    clock: &C,
    join: F,
) -> Result<CompactionStats, StoreError>
where
    S: HistoryStore<T> + ?Sized,
    C: Clock + ?Sized,
    F: FnMut(&[HistoryEntry<T>]) -> HistoryEntry<T>,
{
    let anchors = Anchors::at(clock.now());
    let entries = store.retrieve_all()?;
    let before = entries.len();
    let compacted = compact(entries, &anchors, join);
    let after = compacted.len();

    if after != before {
        store.replace_all(&compacted)?;
    }
    tracing::info!(before, after, "history compacted");
    Ok(CompactionStats { before, after })
}

/// Median of every field across the group; timestamp is the group's median
/// timestamp, so it is one of the input instants.
pub fn join_measurements(
    group: &[HistoryEntry<MeasurementResult>],
) -> HistoryEntry<MeasurementResult> {
    if let [only] = group {
        return only.clone();
    }
    let field = |f: fn(&MeasurementResult) -> f64| -> f64 {
        median(&group.iter().map(|e| f(&e.value)).collect::<Vec<_>>())
    };
    let latencies: Vec<_> = group.iter().map(|e| e.value.latency).collect();
    let jitters: Vec<_> = group.iter().map(|e| e.value.jitter).collect();
    let times: Vec<_> = group.iter().map(|e| e.time).collect();

    HistoryEntry::new(
        MeasurementResult {
            download_speed: field(|v| v.download_speed),
            upload_speed: field(|v| v.upload_speed),
            latency: median(&latencies),
            jitter: median(&jitters),
            packet_loss: field(|v| v.packet_loss),
        },
        median_time(&times),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::storage::MemoryStore;
    use std::time::Duration;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2024-06-15 12:00 UTC);

    fn m(down: f64, up: f64, latency_ms: u64, loss: f64) -> MeasurementResult {
        MeasurementResult {
            download_speed: down,
            upload_speed: up,
            latency: Duration::from_millis(latency_ms),
            jitter: Duration::from_millis(latency_ms / 10),
            packet_loss: loss,
        }
    }

    fn entry(down: f64, time: OffsetDateTime) -> HistoryEntry<MeasurementResult> {
        HistoryEntry::new(m(down, down / 10.0, 20, 0.0), time)
    }

    fn run(entries: Vec<HistoryEntry<MeasurementResult>>) -> Vec<HistoryEntry<MeasurementResult>> {
        compact(entries, &Anchors::at(NOW), join_measurements)
    }

    #[test]
    fn anchors_follow_calendar() {
        let a = Anchors::at(NOW);
        assert_eq!(a.start_of_today, datetime!(2024-06-15 00:00 UTC));
        assert_eq!(a.one_month_ago, datetime!(2024-05-15 12:00 UTC));
        assert_eq!(a.three_months_ago, datetime!(2024-03-15 12:00 UTC));
    }

    #[test]
    fn month_subtraction_clamps_day_and_crosses_years() {
        assert_eq!(
            months_before(datetime!(2024-03-31 08:00 UTC), 1),
            datetime!(2024-02-29 08:00 UTC)
        );
        assert_eq!(
            months_before(datetime!(2024-02-10 08:00 UTC), 3),
            datetime!(2023-11-10 08:00 UTC)
        );
        assert_eq!(
            months_before(datetime!(2023-05-31 08:00 UTC), 3),
            datetime!(2023-02-28 08:00 UTC)
        );
    }

    #[test]
    fn start_of_today_uses_local_calendar_day() {
        // 23:30 UTC on the 14th is already the 15th at +02:00.
        let now = datetime!(2024-06-15 01:30 +02:00);
        let a = Anchors::at(now);
        assert_eq!(a.start_of_today, datetime!(2024-06-14 22:00 UTC));
        assert_eq!(
            placement(&a, datetime!(2024-06-14 22:30 UTC)),
            Placement::Passthrough
        );
        assert_eq!(
            placement(&a, datetime!(2024-06-14 21:30 UTC)),
            Placement::Bucket(BucketKey::Hour {
                date: time::macros::date!(2024-06-14),
                hour: 23,
            })
        );
    }

    #[test]
    fn folds_same_hour_and_leaves_today_alone() {
        let input = vec![
            HistoryEntry::new(m(100.0, 10.0, 30, 0.0), datetime!(2024-06-14 10:05 UTC)),
            HistoryEntry::new(m(80.0, 12.0, 20, 5.0), datetime!(2024-06-14 10:10 UTC)),
            HistoryEntry::new(m(90.0, 11.0, 25, 10.0), datetime!(2024-06-14 10:50 UTC)),
            entry(50.0, datetime!(2024-06-15 00:00 UTC)),
            entry(55.0, datetime!(2024-06-15 00:00:30 UTC)),
        ];
        let out = run(input.clone());
        assert_eq!(out.len(), 3);

        let folded = &out[0];
        // Lower median of three values is the smallest.
        assert_eq!(folded.value, m(80.0, 10.0, 20, 0.0));
        assert_eq!(folded.time, datetime!(2024-06-14 10:05 UTC));
        assert_eq!(&out[1..], &input[3..]);
    }

    #[test]
    fn recent_and_singleton_entries_are_untouched() {
        let input = vec![
            entry(1.0, NOW - time::Duration::days(40)),
            entry(2.0, NOW - time::Duration::hours(1)),
            entry(3.0, NOW),
        ];
        assert_eq!(run(input.clone()), input);
    }

    #[test]
    fn hour_boundary_splits_groups() {
        let same_hour = vec![
            entry(1.0, datetime!(2024-06-10 10:00 UTC)),
            entry(2.0, datetime!(2024-06-10 10:59 UTC)),
        ];
        assert_eq!(run(same_hour).len(), 1);

        let across = vec![
            entry(1.0, datetime!(2024-06-10 10:30 UTC)),
            entry(2.0, datetime!(2024-06-10 11:10 UTC)),
        ];
        assert_eq!(run(across.clone()), across);
    }

    #[test]
    fn six_hour_blocks_between_one_and_three_months() {
        let input = vec![
            entry(1.0, datetime!(2024-04-20 01:00 UTC)),
            entry(2.0, datetime!(2024-04-20 05:00 UTC)),
            entry(3.0, datetime!(2024-04-20 05:59 UTC)),
            entry(4.0, datetime!(2024-04-20 06:00 UTC)),
            entry(5.0, datetime!(2024-04-20 11:00 UTC)),
        ];
        let out = run(input);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].value.download_speed, 1.0);
        assert_eq!(out[0].time, datetime!(2024-04-20 01:00 UTC));
        assert_eq!(out[1].value.download_speed, 4.0);
        assert_eq!(out[1].time, datetime!(2024-04-20 06:00 UTC));
    }

    #[test]
    fn hourly_and_six_hourly_keys_do_not_merge_across_the_month_line() {
        // 2024-05-15 00:30 is older than one month, 2024-05-15 12:30 is newer;
        // hour 0 and block 0 would collide under a naive tuple key.
        let a = Anchors::at(NOW);
        let older = placement(&a, datetime!(2024-05-15 00:30 UTC));
        let newer = placement(&a, datetime!(2024-05-15 12:30 UTC));
        assert!(matches!(older, Placement::Bucket(BucketKey::SixHours { block: 0, .. })));
        assert!(matches!(newer, Placement::Bucket(BucketKey::Hour { hour: 12, .. })));
        assert_ne!(older, newer);
    }

    #[test]
    fn older_than_three_months_is_never_touched() {
        let input = vec![
            entry(1.0, datetime!(2024-01-02 03:00 UTC)),
            entry(2.0, datetime!(2024-01-02 03:10 UTC)),
            entry(3.0, datetime!(2024-01-02 03:20 UTC)),
        ];
        assert_eq!(run(input.clone()), input);
    }

    #[test]
    fn pending_group_is_flushed_before_todays_entries() {
        let input = vec![
            entry(1.0, datetime!(2024-06-14 23:10 UTC)),
            entry(2.0, datetime!(2024-06-14 23:20 UTC)),
            entry(3.0, datetime!(2024-06-15 00:05 UTC)),
        ];
        let out = run(input);
        assert_eq!(out.len(), 2);
        assert!(out[0].time < out[1].time);
        assert_eq!(out[1].value.download_speed, 3.0);
    }

    #[test]
    fn compaction_is_idempotent() {
        let mut input = Vec::new();
        let mut t = datetime!(2024-02-01 00:00 UTC);
        while t < NOW {
            input.push(entry((t.unix_timestamp() % 97) as f64, t));
            t += time::Duration::minutes(25);
        }
        let once = run(input.clone());
        assert!(once.len() < input.len());
        let twice = run(once.clone());
        assert_eq!(twice, once);
        assert!(once.windows(2).all(|w| w[0].time <= w[1].time));
    }

    #[test]
    fn join_is_generic_over_value_type() {
        let input: Vec<HistoryEntry<u32>> = vec![
            HistoryEntry::new(7, datetime!(2024-06-14 10:00 UTC)),
            HistoryEntry::new(3, datetime!(2024-06-14 10:30 UTC)),
        ];
        let out = compact(input, &Anchors::at(NOW), |g| {
            HistoryEntry::new(g.iter().map(|e| e.value).sum::<u32>(), g[0].time)
        });
        assert_eq!(out, vec![HistoryEntry::new(10, datetime!(2024-06-14 10:00 UTC))]);
    }

    #[test]
    fn compact_store_replaces_history() {
        let mut store = MemoryStore::with_entries(vec![
            entry(1.0, datetime!(2024-06-14 10:05 UTC)),
            entry(2.0, datetime!(2024-06-14 10:10 UTC)),
            entry(3.0, datetime!(2024-06-15 09:00 UTC)),
        ]);
        let stats = compact_store(&mut store, &FixedClock(NOW), join_measurements).unwrap();
        assert_eq!(stats, CompactionStats { before: 3, after: 2 });
        assert_eq!(store.retrieve_all().unwrap().len(), 2);

        let again = compact_store(&mut store, &FixedClock(NOW), join_measurements).unwrap();
        assert_eq!(again, CompactionStats { before: 2, after: 2 });
    }

    struct FailingReplace(MemoryStore<MeasurementResult>);

    impl HistoryStore<MeasurementResult> for FailingReplace {
        fn append(
            &mut self,
            value: MeasurementResult,
            time: OffsetDateTime,
        ) -> Result<(), StoreError> {
            self.0.append(value, time)
        }

        fn retrieve_all(&mut self) -> Result<Vec<HistoryEntry<MeasurementResult>>, StoreError> {
            self.0.retrieve_all()
        }

        fn replace_all(
            &mut self,
            _: &[HistoryEntry<MeasurementResult>],
        ) -> Result<(), StoreError> {
            Err(StoreError::io(
                "history.jsonl",
                std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
            ))
        }
    }

    #[test]
    fn failed_replace_leaves_history_intact() {
        let original = vec![
            entry(1.0, datetime!(2024-06-14 10:05 UTC)),
            entry(2.0, datetime!(2024-06-14 10:10 UTC)),
        ];
        let mut store = FailingReplace(MemoryStore::with_entries(original.clone()));
        assert!(compact_store(&mut store, &FixedClock(NOW), join_measurements).is_err());
        assert_eq!(store.retrieve_all().unwrap(), original);
    }

    #[test]
    fn corrupt_history_aborts_the_pass() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        std::fs::write(&path, "{\"value\":1,\"time\":\"yesterday\"}\n").unwrap();
        let before = std::fs::read(&path).unwrap();
        let mut store = crate::storage::FileStore::open(&path).unwrap();
        let err = compact_store(&mut store, &FixedClock(NOW), join_measurements).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { line: 1, .. }));
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }
}
