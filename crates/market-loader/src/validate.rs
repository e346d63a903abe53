use std::collections::HashSet;

use chrono::{DateTime, Utc};
use market_core::{Quantile, SAMPLES_PER_DAY};
use market_frame::TimeFrame;
use tracing::warn;

/// Default history requirement: roughly one month of 15-minute samples.
pub const DEFAULT_MIN_SAMPLES: usize = SAMPLES_PER_DAY * 31;

fn forecaster_id(column: &str) -> &str {
    column.rsplit_once('_').map(|(p, _)| p).unwrap_or(column)
}

/// Validate which forecasters are usable for ensembling.
///
/// Returns `(valid_forecasters, forecasters_with_history)`:
/// - forecasters whose forecast-window slice is fully populated for all
///   three quantiles;
/// - among those, the columns with at least `min_samples` non-null
///   historical points (for strategies that need training history).
pub fn validate_forecasters(
    forecast_range: &[DateTime<Utc>],
    market: &TimeFrame,
    min_samples: usize,
) -> (Vec<String>, Vec<String>) {
    let (Some(start), Some(end)) = (forecast_range.first(), forecast_range.last()) else {
        return (Vec::new(), Vec::new());
    };
    let window = market.slice(*start, *end);

    // Columns with no nulls inside the forecast window.
    let complete: HashSet<String> = window
        .column_names()
        .iter()
        .filter(|name| {
            window
                .column(name)
                .map(|values| values.iter().all(|v| v.is_some()))
                .unwrap_or(false)
        })
        .cloned()
        .collect();

    let ids_for = |quantile: Quantile| -> HashSet<&str> {
        complete
            .iter()
            .filter(|c| c.ends_with(quantile.suffix()))
            .map(|c| forecaster_id(c))
            .collect()
    };

    let mut valid: Vec<String> = ids_for(Quantile::Q50)
        .intersection(&ids_for(Quantile::Q10))
        .copied()
        .collect::<HashSet<_>>()
        .intersection(&ids_for(Quantile::Q90))
        .map(|id| id.to_string())
        .collect();
    valid.sort();

    let ignored: Vec<&String> = market
        .column_names()
        .iter()
        .filter(|c| !valid.iter().any(|id| forecaster_id(c) == id.as_str()))
        .collect();
    if !ignored.is_empty() {
        warn!(
            ?ignored,
            "Ignoring forecasters that did not submit all quantiles"
        );
    }

    // Historical depth over the whole market frame, restricted to valid
    // forecasters.
    let counts = market.non_null_counts();
    let mut with_history: Vec<String> = market
        .column_names()
        .iter()
        .filter(|c| {
            counts.get(*c).copied().unwrap_or(0) >= min_samples
                && valid.iter().any(|id| forecaster_id(c) == id.as_str())
        })
        .cloned()
        .collect();
    with_history.sort();

    (valid, with_history)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use market_frame::date_range;

    fn index(days: i64) -> Vec<DateTime<Utc>> {
        let end = Utc.with_ymd_and_hms(2024, 5, 10, 23, 45, 0).unwrap();
        let start = end - Duration::days(days) + Duration::minutes(15);
        date_range(start, end, Duration::minutes(15))
    }

    fn forecast_range(index: &[DateTime<Utc>]) -> Vec<DateTime<Utc>> {
        index[index.len() - 96..].to_vec()
    }

    #[test]
    fn only_full_quantile_forecasters_are_valid() {
        let idx = index(2);
        let n = idx.len();
        let mut market = TimeFrame::with_index(idx.clone());
        for q in ["_q10", "_q50", "_q90"] {
            market.insert_aligned(&format!("full{q}"), vec![Some(1.0); n]);
        }
        // Missing q90 entirely.
        market.insert_aligned("partial_q10", vec![Some(1.0); n]);
        market.insert_aligned("partial_q50", vec![Some(1.0); n]);

        let (valid, _) = validate_forecasters(&forecast_range(&idx), &market, 1);
        assert_eq!(valid, vec!["full"]);
    }

    #[test]
    fn null_in_forecast_window_invalidates() {
        let idx = index(2);
        let n = idx.len();
        let mut market = TimeFrame::with_index(idx.clone());
        for q in ["_q10", "_q50", "_q90"] {
            let mut values = vec![Some(1.0); n];
            if q == "_q50" {
                // One hole inside the forecast window.
                values[n - 10] = None;
            }
            market.insert_aligned(&format!("s1{q}"), values);
        }
        let (valid, with_history) = validate_forecasters(&forecast_range(&idx), &market, 1);
        assert!(valid.is_empty());
        assert!(with_history.is_empty());
    }

    #[test]
    fn history_gate_filters_short_columns() {
        let idx = index(40);
        let n = idx.len();
        let mut market = TimeFrame::with_index(idx.clone());
        for q in ["_q10", "_q50", "_q90"] {
            // Deep history for s1.
            market.insert_aligned(&format!("s1{q}"), vec![Some(1.0); n]);
            // s2 submitted only the last 2 days.
            let mut values = vec![None; n];
            for v in values.iter_mut().skip(n - 192) {
                *v = Some(1.0);
            }
            market.insert_aligned(&format!("s2{q}"), values);
        }

        let (valid, with_history) =
            validate_forecasters(&forecast_range(&idx), &market, DEFAULT_MIN_SAMPLES);
        assert_eq!(valid, vec!["s1", "s2"]);
        assert_eq!(
            with_history,
            vec!["s1_q10", "s1_q50", "s1_q90"]
        );
    }

    #[test]
    fn empty_range_returns_nothing() {
        let market = TimeFrame::new();
        let (valid, with_history) = validate_forecasters(&[], &market, 1);
        assert!(valid.is_empty());
        assert!(with_history.is_empty());
    }
}
