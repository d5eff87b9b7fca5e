//! In-memory summary of a partition's day files.

use std::collections::BTreeMap;

use serde::Serialize;

use hiri_types::{Day, Reading, Timestamp};

/// Record count and newest timestamp of one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DaySummary {
    pub day: Day,
    pub count: usize,
    pub last_time: Option<Timestamp>,
}

/// Snapshot of every day stored for a partition.
///
/// A `DayIndex` is immutable once published; the store swaps in a new
/// `Arc<DayIndex>` after each mutation, so a reader holding a snapshot sees a
/// consistent set of per-day counts no matter what is appended afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DayIndex {
    days: BTreeMap<Day, DaySummary>,
}

impl DayIndex {
    /// Days in ascending order.
    pub fn days(&self) -> Vec<Day> {
        self.days.keys().copied().collect()
    }

    /// Per-day summaries in ascending order.
    pub fn summaries(&self) -> impl DoubleEndedIterator<Item = &DaySummary> {
        self.days.values()
    }

    pub fn get(&self, day: Day) -> Option<&DaySummary> {
        self.days.get(&day)
    }

    /// Number of records stored for `day` (0 if unknown).
    pub fn count(&self, day: Day) -> usize {
        self.days.get(&day).map_or(0, |s| s.count)
    }

    /// Total number of records across all days.
    pub fn total(&self) -> usize {
        self.days.values().map(|s| s.count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    /// The newest timestamp stored in any day.
    pub fn high_water(&self) -> Option<Timestamp> {
        self.days.values().filter_map(|s| s.last_time).max()
    }

    /// A copy of this index with `rows` added to `day`.
    pub(crate) fn with_appended(&self, day: Day, rows: &[Reading]) -> Self {
        let mut next = self.clone();
        next.record(day, rows);
        next
    }

    pub(crate) fn record(&mut self, day: Day, rows: &[Reading]) {
        if rows.is_empty() {
            return;
        }
        let newest = rows.iter().map(|r| r.time).max();
        let summary = self.days.entry(day).or_insert(DaySummary {
            day,
            count: 0,
            last_time: None,
        });
        summary.count += rows.len();
        summary.last_time = summary.last_time.max(newest);
    }
}

/// Outcome of rescanning a partition's files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    /// Days with at least one record.
    pub days: usize,
    /// Records indexed.
    pub records: usize,
    /// Complete lines dropped because they could not be decoded, were
    /// duplicates, or belonged to another day.
    pub skipped_lines: usize,
    /// Files whose partially written last line was cut off.
    pub truncated_files: usize,
    /// Files rewritten without their skipped lines.
    pub compacted_files: usize,
    /// Files deleted because they held no records.
    pub removed_files: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(time: &str) -> Reading {
        Reading::new("X", time.parse().unwrap(), None)
    }

    #[test]
    fn test_record_tracks_count_and_last_time() {
        let day: Day = "2025-09-01".parse().unwrap();
        let mut index = DayIndex::default();
        index.record(
            day,
            &[reading("2025-09-01T10:00:00"), reading("2025-09-01T12:00:00")],
        );
        index.record(day, &[reading("2025-09-01T11:00:00")]);

        let summary = index.get(day).unwrap();
        assert_eq!(summary.count, 3);
        assert_eq!(summary.last_time.unwrap().to_string(), "2025-09-01T12:00:00");
        assert_eq!(index.total(), 3);
    }

    #[test]
    fn test_high_water_spans_days() {
        let d1: Day = "2025-09-01".parse().unwrap();
        let d2: Day = "2025-09-02".parse().unwrap();
        let index = DayIndex::default()
            .with_appended(d2, &[reading("2025-09-02T01:00:00")])
            .with_appended(d1, &[reading("2025-09-01T23:00:00")]);

        assert_eq!(index.days(), vec![d1, d2]);
        assert_eq!(
            index.high_water().unwrap().to_string(),
            "2025-09-02T01:00:00"
        );
    }

    #[test]
    fn test_empty_index() {
        let index = DayIndex::default();
        assert!(index.is_empty());
        assert_eq!(index.high_water(), None);
        assert_eq!(index.count("2025-01-01".parse().unwrap()), 0);

        let unchanged = index.with_appended("2025-01-01".parse().unwrap(), &[]);
        assert!(unchanged.is_empty());
    }
}
