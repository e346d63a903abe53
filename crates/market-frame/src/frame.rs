use std::collections::HashMap;

use chrono::{DateTime, Utc};
use statrs::statistics::Statistics;

use crate::series::TimeSeries;

/// A time-indexed frame: one sorted UTC index shared by all columns.
///
/// Columns are stored by name and keep their insertion order. Every column
/// has exactly one `Option<f64>` per index row.
#[derive(Debug, Clone, Default)]
pub struct TimeFrame {
    index: Vec<DateTime<Utc>>,
    columns: Vec<String>,
    data: HashMap<String, Vec<Option<f64>>>,
}

impl TimeFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_index(mut index: Vec<DateTime<Utc>>) -> Self {
        index.sort();
        index.dedup();
        Self {
            index,
            columns: Vec::new(),
            data: HashMap::new(),
        }
    }

    pub fn index(&self) -> &[DateTime<Utc>] {
        &self.index
    }

    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    pub fn n_rows(&self) -> usize {
        self.index.len()
    }

    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty() || self.columns.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.data.contains_key(name)
    }

    pub fn column(&self, name: &str) -> Option<&[Option<f64>]> {
        self.data.get(name).map(|v| v.as_slice())
    }

    /// Extract one column as a standalone series.
    pub fn column_series(&self, name: &str) -> Option<TimeSeries> {
        self.data.get(name).map(|values| {
            TimeSeries::from_points(self.index.iter().copied().zip(values.iter().copied()).collect())
        })
    }

    /// Insert a column, outer-joining on the index: timestamps the frame has
    /// not seen extend the index, and every existing column is re-aligned
    /// with nulls in the new rows.
    pub fn outer_join_column(&mut self, name: &str, series: &TimeSeries) {
        let mut union: Vec<DateTime<Utc>> = self
            .index
            .iter()
            .copied()
            .chain(series.timestamps().iter().copied())
            .collect();
        union.sort();
        union.dedup();

        if union.len() != self.index.len() {
            for values in self.data.values_mut() {
                let old: HashMap<DateTime<Utc>, Option<f64>> =
                    self.index.iter().copied().zip(values.iter().copied()).collect();
                *values = union
                    .iter()
                    .map(|ts| old.get(ts).copied().flatten())
                    .collect();
            }
            self.index = union;
        }

        let aligned: Vec<Option<f64>> = self.index.iter().map(|ts| series.value_at(*ts)).collect();
        if !self.data.contains_key(name) {
            self.columns.push(name.to_string());
        }
        self.data.insert(name.to_string(), aligned);
    }

    /// Insert a column already aligned to the current index.
    pub fn insert_aligned(&mut self, name: &str, values: Vec<Option<f64>>) {
        debug_assert_eq!(values.len(), self.index.len());
        if !self.data.contains_key(name) {
            self.columns.push(name.to_string());
        }
        self.data.insert(name.to_string(), values);
    }

    pub fn drop_column(&mut self, name: &str) -> bool {
        if self.data.remove(name).is_some() {
            self.columns.retain(|c| c != name);
            true
        } else {
            false
        }
    }

    /// New frame with only the named columns (same index).
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> TimeFrame {
        let mut out = TimeFrame::with_index(self.index.clone());
        for name in names {
            if let Some(values) = self.data.get(name.as_ref()) {
                out.insert_aligned(name.as_ref(), values.clone());
            }
        }
        out
    }

    /// Column names ending with the given suffix, in insertion order.
    pub fn columns_with_suffix(&self, suffix: &str) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.ends_with(suffix))
            .cloned()
            .collect()
    }

    /// Rows with `start <= ts <= end`, all columns.
    pub fn slice(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> TimeFrame {
        let from = self.index.partition_point(|ts| *ts < start);
        let to = self.index.partition_point(|ts| *ts <= end);
        self.row_range(from, to)
    }

    /// The last `n` rows.
    pub fn tail(&self, n: usize) -> TimeFrame {
        let from = self.index.len().saturating_sub(n);
        self.row_range(from, self.index.len())
    }

    /// Rows strictly before the given timestamp.
    pub fn before(&self, cutoff: DateTime<Utc>) -> TimeFrame {
        let to = self.index.partition_point(|ts| *ts < cutoff);
        self.row_range(0, to)
    }

    /// Rows up to and including the given timestamp.
    pub fn up_to(&self, cutoff: DateTime<Utc>) -> TimeFrame {
        let to = self.index.partition_point(|ts| *ts <= cutoff);
        self.row_range(0, to)
    }

    fn row_range(&self, from: usize, to: usize) -> TimeFrame {
        let mut out = TimeFrame {
            index: self.index[from..to].to_vec(),
            columns: self.columns.clone(),
            data: HashMap::new(),
        };
        for (name, values) in &self.data {
            out.data.insert(name.clone(), values[from..to].to_vec());
        }
        out
    }

    /// Reindex all columns onto the given timestamps (missing rows → null).
    pub fn reindex(&self, index: &[DateTime<Utc>]) -> TimeFrame {
        let positions: Vec<Option<usize>> = index
            .iter()
            .map(|ts| self.index.binary_search(ts).ok())
            .collect();
        let mut out = TimeFrame {
            index: index.to_vec(),
            columns: self.columns.clone(),
            data: HashMap::new(),
        };
        for (name, values) in &self.data {
            out.data.insert(
                name.clone(),
                positions
                    .iter()
                    .map(|pos| pos.and_then(|p| values[p]))
                    .collect(),
            );
        }
        out
    }

    /// Per-column count of non-null values.
    pub fn non_null_counts(&self) -> HashMap<String, usize> {
        self.columns
            .iter()
            .map(|name| {
                let count = self.data[name].iter().filter(|v| v.is_some()).count();
                (name.clone(), count)
            })
            .collect()
    }

    /// Global minimum and maximum over every non-null cell.
    pub fn min_max(&self) -> Option<(f64, f64)> {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut seen = false;
        for values in self.data.values() {
            for v in values.iter().flatten() {
                min = min.min(*v);
                max = max.max(*v);
                seen = true;
            }
        }
        seen.then_some((min, max))
    }

    /// Null-aware mean across columns, per row. A row with no non-null cell
    /// stays null.
    pub fn row_mean(&self) -> Vec<Option<f64>> {
        self.map_rows(|xs| Some(xs.to_vec().mean()))
    }

    /// Null-aware median across columns, per row.
    pub fn row_median(&self) -> Vec<Option<f64>> {
        self.map_rows(|xs| {
            let mut xs = xs.to_vec();
            xs.sort_by(|a, b| a.total_cmp(b));
            let n = xs.len();
            Some(if n % 2 == 1 {
                xs[n / 2]
            } else {
                (xs[n / 2 - 1] + xs[n / 2]) / 2.0
            })
        })
    }

    /// Weighted sum across columns, per row. Weights are positional over the
    /// given column names; null cells contribute nothing with their weight.
    pub fn row_weighted_sum(&self, names: &[String], weights: &[f64]) -> Vec<Option<f64>> {
        debug_assert_eq!(names.len(), weights.len());
        let cols: Vec<&Vec<Option<f64>>> = names.iter().filter_map(|n| self.data.get(n)).collect();
        (0..self.index.len())
            .map(|row| {
                let mut total = 0.0;
                let mut any = false;
                for (col, w) in cols.iter().zip(weights) {
                    if let Some(v) = col[row] {
                        total += v * w;
                        any = true;
                    }
                }
                any.then_some(total)
            })
            .collect()
    }

    fn map_rows<F>(&self, f: F) -> Vec<Option<f64>>
    where
        F: Fn(&[f64]) -> Option<f64>,
    {
        (0..self.index.len())
            .map(|row| {
                let xs: Vec<f64> = self
                    .columns
                    .iter()
                    .filter_map(|name| self.data[name][row])
                    .collect();
                if xs.is_empty() {
                    None
                } else {
                    f(&xs)
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::date_range;
    use chrono::{Duration, TimeZone};

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
    }

    fn base_index() -> Vec<DateTime<Utc>> {
        date_range(ts(0, 0), ts(1, 0), Duration::minutes(15))
    }

    #[test]
    fn outer_join_extends_index_and_realigns() {
        let mut frame = TimeFrame::with_index(base_index());
        frame.insert_aligned("a", vec![Some(1.0); 5]);

        let late = TimeSeries::from_values(vec![ts(1, 15), ts(1, 30)], vec![7.0, 8.0]);
        frame.outer_join_column("b", &late);

        assert_eq!(frame.n_rows(), 7);
        assert_eq!(frame.column("a").unwrap()[5], None);
        assert_eq!(frame.column("b").unwrap()[5], Some(7.0));
    }

    #[test]
    fn suffix_selection_preserves_order() {
        let mut frame = TimeFrame::with_index(base_index());
        frame.insert_aligned("s1_q50", vec![None; 5]);
        frame.insert_aligned("s1_q10", vec![None; 5]);
        frame.insert_aligned("s2_q50", vec![None; 5]);
        assert_eq!(frame.columns_with_suffix("_q50"), vec!["s1_q50", "s2_q50"]);
    }

    #[test]
    fn row_median_skips_nulls() {
        let mut frame = TimeFrame::with_index(vec![ts(0, 0)]);
        frame.insert_aligned("a", vec![Some(1.0)]);
        frame.insert_aligned("b", vec![None]);
        frame.insert_aligned("c", vec![Some(3.0)]);
        assert_eq!(frame.row_median(), vec![Some(2.0)]);
    }

    #[test]
    fn tail_and_slice() {
        let mut frame = TimeFrame::with_index(base_index());
        frame.insert_aligned("a", vec![Some(0.0), Some(1.0), Some(2.0), Some(3.0), Some(4.0)]);
        assert_eq!(frame.tail(2).column("a").unwrap(), &[Some(3.0), Some(4.0)]);
        let sliced = frame.slice(ts(0, 15), ts(0, 45));
        assert_eq!(sliced.n_rows(), 3);
    }

    #[test]
    fn weighted_sum_over_columns() {
        let mut frame = TimeFrame::with_index(vec![ts(0, 0)]);
        frame.insert_aligned("a", vec![Some(100.0)]);
        frame.insert_aligned("b", vec![Some(200.0)]);
        let names = vec!["a".to_string(), "b".to_string()];
        let out = frame.row_weighted_sum(&names, &[0.25, 0.75]);
        assert_eq!(out, vec![Some(175.0)]);
    }

    #[test]
    fn min_max_is_global() {
        let mut frame = TimeFrame::with_index(vec![ts(0, 0), ts(0, 15)]);
        frame.insert_aligned("a", vec![Some(-2.0), None]);
        frame.insert_aligned("b", vec![Some(5.0), Some(1.0)]);
        assert_eq!(frame.min_max(), Some((-2.0, 5.0)));
    }
}
