pub mod kpi;
pub mod report;

#[cfg(test)]
mod tests;

pub use kpi::{
    DailyRank, DailyScore, ForecastRow, KpiEngine, PowerBinBoxplot, RankStats,
    ResidualDistribution, ScoreStats, ThresholdPoint,
};
pub use report::{monthly_records, MonthlyKpiRecord};
