use std::collections::BTreeMap;

use super::metric::{Emission, MetricRow};

/// Combines per-metric emissions into one row per bucket.
///
/// Emissions for a bucket are max-merged into its partial row, and every
/// ingest yields a snapshot of that row for eager forwarding. With
/// `max_buckets` set, the oldest buckets are dropped once the limit is
/// exceeded; emissions at or below the newest dropped bucket are refused,
/// since a rebuilt row would replace the full one already forwarded.
#[derive(Debug, Default)]
pub struct MetricMerger {
    rows: BTreeMap<i64, MetricRow>,
    max_buckets: Option<usize>,
    evicted: u64,
    /// Newest bucket dropped by the retention limit.
    watermark: Option<i64>,
    late: u64,
}

impl MetricMerger {
    pub fn new(max_buckets: Option<usize>) -> Self {
        Self {
            rows: BTreeMap::new(),
            max_buckets: max_buckets.filter(|n| *n > 0),
            ..Self::default()
        }
    }

    /// Merges one emission and returns the current row for its bucket, or
    /// `None` when the bucket has already been evicted.
    pub fn ingest(&mut self, emission: Emission) -> Option<MetricRow> {
        if self.watermark.is_some_and(|w| emission.bucket <= w) {
            self.late += 1;
            return None;
        }

        let row = self
            .rows
            .entry(emission.bucket)
            .or_insert_with(|| MetricRow::new(emission.bucket));
        row.merge(emission.kind, emission.value);
        let snapshot = *row;

        self.enforce_limit();

        Some(snapshot)
    }

    fn enforce_limit(&mut self) {
        let Some(max) = self.max_buckets else {
            return;
        };

        while self.rows.len() > max {
            let Some((bucket, _)) = self.rows.pop_first() else {
                break;
            };
            self.watermark = Some(self.watermark.map_or(bucket, |w| w.max(bucket)));
            self.evicted += 1;
        }
    }

    pub fn row(&self, bucket: i64) -> Option<&MetricRow> {
        self.rows.get(&bucket)
    }

    /// Buckets currently held.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Total buckets dropped by the retention limit.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Emissions refused because their bucket was already evicted.
    pub fn late(&self) -> u64 {
        self.late
    }
}
