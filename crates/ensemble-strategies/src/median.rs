use market_core::Quantile;
use market_frame::TimeFrame;

use crate::simple::{Combine, SimpleStrategy};
use crate::strategy::{Strategy, StrategyParams, StrategyState};

/// Median of forecaster predictions. More robust to extreme submissions than
/// the arithmetic mean; all forecasters share equal weight.
#[derive(Debug)]
pub struct MedianCombine;

impl Combine for MedianCombine {
    fn name(&self) -> &'static str {
        "median"
    }

    fn combine(
        &mut self,
        forecasts: &TimeFrame,
        _quantile: Quantile,
        _state: &mut StrategyState,
    ) -> Vec<Option<f64>> {
        forecasts.row_median()
    }
}

pub type MedianStrategy = SimpleStrategy<MedianCombine>;

pub fn factory(_params: &StrategyParams) -> Box<dyn Strategy> {
    Box::new(SimpleStrategy::new(MedianCombine))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use market_frame::date_range;

    fn index(n: usize) -> Vec<DateTime<Utc>> {
        let start = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();
        date_range(
            start,
            start + Duration::minutes(15 * (n as i64 - 1)),
            Duration::minutes(15),
        )
    }

    #[test]
    fn median_is_robust_to_one_extreme() {
        let mut strategy = SimpleStrategy::new(MedianCombine);
        strategy
            .fit(&TimeFrame::new(), &TimeFrame::new(), &[Quantile::Q50])
            .unwrap();

        let mut frame = TimeFrame::with_index(index(2));
        frame.insert_aligned("a_q50", vec![Some(10.0), Some(10.0)]);
        frame.insert_aligned("b_q50", vec![Some(12.0), Some(12.0)]);
        frame.insert_aligned("c_q50", vec![Some(900.0), Some(900.0)]);

        let predictions = strategy.predict(&frame, &[Quantile::Q50]).unwrap();
        for row in predictions.rows() {
            assert_eq!(row.value, 12.0);
        }
        let weights = &strategy.weights()[&Quantile::Q50];
        assert!((weights["a"] - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn quantile_without_columns_is_omitted() {
        let mut strategy = SimpleStrategy::new(MedianCombine);
        strategy
            .fit(&TimeFrame::new(), &TimeFrame::new(), &Quantile::ALL)
            .unwrap();

        let mut frame = TimeFrame::with_index(index(2));
        frame.insert_aligned("a_q50", vec![Some(10.0), Some(10.0)]);

        let predictions = strategy.predict(&frame, &Quantile::ALL).unwrap();
        assert_eq!(predictions.quantiles(), vec![Quantile::Q50]);
    }
}
