use market_frame::TimeFrame;
use nalgebra::DVector;

/// Distance between a forecast profile and the reference profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceMetric {
    #[default]
    Dtw,
    Euclidean,
}

/// Dynamic Time Warping distance between two equal-frequency series.
pub fn dtw_distance(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let mut prev = vec![f64::INFINITY; b.len() + 1];
    let mut curr = vec![f64::INFINITY; b.len() + 1];
    prev[0] = 0.0;

    for &x in a {
        curr[0] = f64::INFINITY;
        for (j, &y) in b.iter().enumerate() {
            let cost = (x - y).powi(2);
            curr[j + 1] = cost + prev[j].min(prev[j + 1]).min(curr[j]);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()].sqrt()
}

pub fn euclidean_distance(a: &[f64], b: &[f64]) -> f64 {
    let a = DVector::from_row_slice(a);
    let b = DVector::from_row_slice(b);
    (a - b).norm()
}

/// Flag forecaster columns whose profile is far from the median profile.
///
/// The whole matrix is min-max normalised with a single global min/max so
/// that detection is scale-invariant across forecasters. Distances to the
/// per-timestamp median profile are thresholded at `median + alpha * MAD`;
/// MAD is used over the standard deviation because the distance distribution
/// is heavy-tailed.
pub fn detect_outliers(
    frame: &TimeFrame,
    alpha: f64,
    min_forecasters: usize,
    metric: DistanceMetric,
) -> Vec<String> {
    if frame.n_cols() < min_forecasters {
        return Vec::new();
    }

    let Some((min, max)) = frame.min_max() else {
        return Vec::new();
    };
    if max - min == 0.0 {
        // All values identical, nothing to flag.
        return Vec::new();
    }
    let span = max - min;

    // Normalised copy of every column, paired against the median profile.
    let normalised: Vec<(String, Vec<Option<f64>>)> = frame
        .column_names()
        .iter()
        .map(|name| {
            let values = frame
                .column(name)
                .map(|col| col.iter().map(|v| v.map(|x| (x - min) / span)).collect())
                .unwrap_or_default();
            (name.clone(), values)
        })
        .collect();

    let mut profile_frame = TimeFrame::with_index(frame.index().to_vec());
    for (name, values) in &normalised {
        profile_frame.insert_aligned(name, values.clone());
    }
    let base_profile = profile_frame.row_median();

    let distances: Vec<(String, f64)> = normalised
        .into_iter()
        .map(|(name, values)| {
            let mut column = Vec::new();
            let mut profile = Vec::new();
            for (v, p) in values.iter().zip(&base_profile) {
                if let (Some(v), Some(p)) = (v, p) {
                    column.push(*v);
                    profile.push(*p);
                }
            }
            let distance = match metric {
                DistanceMetric::Dtw => dtw_distance(&column, &profile),
                DistanceMetric::Euclidean => euclidean_distance(&column, &profile),
            };
            (name, distance)
        })
        .collect();

    let mut sorted: Vec<f64> = distances.iter().map(|(_, d)| *d).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let median_dist = median_of_sorted(&sorted);
    let mut abs_dev: Vec<f64> = sorted.iter().map(|d| (d - median_dist).abs()).collect();
    abs_dev.sort_by(|a, b| a.total_cmp(b));
    let mad = median_of_sorted(&abs_dev);
    let threshold = median_dist + alpha * mad;

    distances
        .into_iter()
        .filter(|(_, d)| *d > threshold)
        .map(|(name, _)| name)
        .collect()
}

/// DTW variant with the production defaults.
pub fn detect_outliers_dtw(frame: &TimeFrame, alpha: f64, min_forecasters: usize) -> Vec<String> {
    detect_outliers(frame, alpha, min_forecasters, DistanceMetric::Dtw)
}

fn median_of_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use market_frame::date_range;

    fn index(n: usize) -> Vec<DateTime<Utc>> {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        date_range(
            start,
            start + Duration::minutes(15 * (n as i64 - 1)),
            Duration::minutes(15),
        )
    }

    fn frame_with(columns: &[(&str, Vec<f64>)]) -> TimeFrame {
        let n = columns[0].1.len();
        let mut frame = TimeFrame::with_index(index(n));
        for (name, values) in columns {
            frame.insert_aligned(name, values.iter().copied().map(Some).collect());
        }
        frame
    }

    #[test]
    fn dtw_of_identical_series_is_zero() {
        let a = [1.0, 2.0, 3.0];
        assert_eq!(dtw_distance(&a, &a), 0.0);
    }

    #[test]
    fn dtw_tolerates_time_shift_better_than_euclidean() {
        let a = [0.0, 1.0, 0.0, 0.0];
        let b = [0.0, 0.0, 1.0, 0.0];
        assert!(dtw_distance(&a, &b) < euclidean_distance(&a, &b));
    }

    #[test]
    fn below_min_forecasters_returns_empty() {
        let frame = frame_with(&[
            ("a_q50", vec![1.0, 2.0, 3.0]),
            ("b_q50", vec![500.0, 510.0, 520.0]),
        ]);
        assert!(detect_outliers_dtw(&frame, 20.0, 4).is_empty());
    }

    #[test]
    fn magnitude_outlier_is_flagged() {
        let frame = frame_with(&[
            ("a_q50", vec![100.0, 105.0, 110.0, 108.0]),
            ("b_q50", vec![100.0, 105.0, 110.0, 108.0]),
            ("c_q50", vec![100.0, 105.0, 110.0, 108.0]),
            ("d_q50", vec![1000.0, 1050.0, 1100.0, 1080.0]),
        ]);
        assert_eq!(detect_outliers_dtw(&frame, 20.0, 4), vec!["d_q50"]);
    }

    #[test]
    fn constant_matrix_has_no_outliers() {
        let frame = frame_with(&[
            ("a_q50", vec![5.0; 4]),
            ("b_q50", vec![5.0; 4]),
            ("c_q50", vec![5.0; 4]),
            ("d_q50", vec![5.0; 4]),
        ]);
        assert!(detect_outliers_dtw(&frame, 20.0, 4).is_empty());
    }
}
