use chrono::{DateTime, Duration, Utc};
use statrs::statistics::Statistics;

/// Build an inclusive range of timestamps from `start` to `end` at `step`.
pub fn date_range(start: DateTime<Utc>, end: DateTime<Utc>, step: Duration) -> Vec<DateTime<Utc>> {
    let mut out = Vec::new();
    if step <= Duration::zero() {
        return out;
    }
    let mut ts = start;
    while ts <= end {
        out.push(ts);
        ts += step;
    }
    out
}

/// Floor a timestamp to the nearest multiple of `step` (anchored at the epoch).
pub fn floor_to_step(ts: DateTime<Utc>, step: Duration) -> DateTime<Utc> {
    let step_secs = step.num_seconds().max(1);
    let secs = ts.timestamp();
    let floored = secs - secs.rem_euclid(step_secs);
    DateTime::from_timestamp(floored, 0).unwrap_or(ts)
}

/// A single time-indexed series of optional values.
///
/// Timestamps are kept sorted and unique (first value wins on duplicates).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeSeries {
    timestamps: Vec<DateTime<Utc>>,
    values: Vec<Option<f64>>,
}

impl TimeSeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from raw points, sorting by timestamp and dropping duplicates
    /// (keeping the first occurrence, matching the ingest dedup rule).
    pub fn from_points(mut points: Vec<(DateTime<Utc>, Option<f64>)>) -> Self {
        points.sort_by_key(|(ts, _)| *ts);
        let mut timestamps = Vec::with_capacity(points.len());
        let mut values = Vec::with_capacity(points.len());
        for (ts, v) in points {
            if timestamps.last() == Some(&ts) {
                continue;
            }
            timestamps.push(ts);
            values.push(v);
        }
        Self { timestamps, values }
    }

    pub fn from_values(timestamps: Vec<DateTime<Utc>>, values: Vec<f64>) -> Self {
        Self::from_points(
            timestamps
                .into_iter()
                .zip(values.into_iter().map(Some))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    pub fn values(&self) -> &[Option<f64>] {
        &self.values
    }

    pub fn first_timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamps.first().copied()
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamps.last().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (DateTime<Utc>, Option<f64>)> + '_ {
        self.timestamps
            .iter()
            .copied()
            .zip(self.values.iter().copied())
    }

    /// Value at an exact timestamp, if present and non-null.
    pub fn value_at(&self, ts: DateTime<Utc>) -> Option<f64> {
        match self.timestamps.binary_search(&ts) {
            Ok(pos) => self.values[pos],
            Err(_) => None,
        }
    }

    /// Resample onto a fixed step, aggregating with the mean of non-null
    /// values per bucket. Buckets with no data yield no row.
    pub fn resample_mean(&self, step: Duration) -> TimeSeries {
        let mut out = TimeSeries::new();
        let mut bucket_start: Option<DateTime<Utc>> = None;
        let mut bucket: Vec<f64> = Vec::new();

        let flush = |start: Option<DateTime<Utc>>, bucket: &mut Vec<f64>, out: &mut TimeSeries| {
            if let Some(ts) = start {
                let value = if bucket.is_empty() {
                    None
                } else {
                    Some(bucket.iter().copied().collect::<Vec<f64>>().mean())
                };
                out.timestamps.push(ts);
                out.values.push(value);
                bucket.clear();
            }
        };

        for (ts, value) in self.iter() {
            let floored = floor_to_step(ts, step);
            if bucket_start != Some(floored) {
                flush(bucket_start, &mut bucket, &mut out);
                bucket_start = Some(floored);
            }
            if let Some(v) = value {
                bucket.push(v);
            }
        }
        flush(bucket_start, &mut bucket, &mut out);
        out
    }

    /// Reindex onto the given timestamps. Missing timestamps become null.
    pub fn reindex(&self, index: &[DateTime<Utc>]) -> TimeSeries {
        TimeSeries {
            timestamps: index.to_vec(),
            values: index.iter().map(|ts| self.value_at(*ts)).collect(),
        }
    }

    /// Rows with `start <= ts <= end`.
    pub fn slice(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> TimeSeries {
        let from = self.timestamps.partition_point(|ts| *ts < start);
        let to = self.timestamps.partition_point(|ts| *ts <= end);
        TimeSeries {
            timestamps: self.timestamps[from..to].to_vec(),
            values: self.values[from..to].to_vec(),
        }
    }

    /// Count of non-null values at or after `cutoff`.
    pub fn non_null_count_since(&self, cutoff: DateTime<Utc>) -> usize {
        let from = self.timestamps.partition_point(|ts| *ts < cutoff);
        self.values[from..].iter().filter(|v| v.is_some()).count()
    }

    pub fn non_null_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }

    /// Null-aware mean over the whole series.
    pub fn mean(&self) -> Option<f64> {
        let xs: Vec<f64> = self.values.iter().filter_map(|v| *v).collect();
        if xs.is_empty() {
            None
        } else {
            Some(xs.mean())
        }
    }
}
