pub mod calculator;
pub mod metrics;

pub use calculator::{compute_forecasters_skill_scores, compute_scores, ForecastIdKind};
pub use metrics::{
    boxplot_summary, mae, percentile_linear, pinball_loss, pinball_per_observation, rmse,
    squared_error_per_observation, winkler, winkler_per_observation, BoxplotSummary,
    WINKLER_ALPHA,
};
