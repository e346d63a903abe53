use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use market_core::{League, ScoreMetric, Track};
use serde::Serialize;
use statrs::statistics::Statistics;

use crate::kpi::{
    DailyScore, KpiEngine, PowerBinBoxplot, ResidualDistribution, ScoreStats, ThresholdPoint,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankDistribution {
    pub rank_1_5: usize,
    pub rank_6_10: usize,
    pub rank_11_plus: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyScoreEntry {
    pub target_day: NaiveDate,
    pub score: f64,
    pub is_penalty: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyRankEntry {
    pub target_day: NaiveDate,
    pub rank: usize,
    pub total_forecasters: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthScoreEntry {
    pub user_id: String,
    pub score: f64,
}

/// One forecaster's monthly stats row, uploaded wholesale per
/// (year, month, resource).
#[derive(Debug, Clone, Serialize)]
pub struct MonthlyKpiRecord {
    pub user: String,
    pub resource: String,
    pub year: i32,
    pub month: u32,
    pub metric: ScoreMetric,
    pub track: Track,

    // Participation stats.
    pub days_with_submissions: usize,
    pub days_in_period: usize,
    pub participation_rate: f64,
    pub n_days_w_penalties: usize,
    pub nr_participants: usize,

    // Monthly score stats, raw.
    pub avg_score: f64,
    pub best_score: f64,
    pub worst_score: f64,
    pub median_score: f64,
    pub std_score: f64,

    // Monthly score stats, penalty-adjusted.
    pub avg_score_w_pen: f64,
    pub best_score_w_pen: f64,
    pub worst_score_w_pen: f64,
    pub median_score_w_pen: f64,
    pub std_score_w_pen: f64,
    pub avg_score_w_pen_rank: Option<usize>,

    // Daily ranking stats (penalties only affect league evaluation).
    pub avg_rank: Option<f64>,
    pub best_rank: Option<usize>,
    pub worst_rank: Option<usize>,
    pub median_rank: Option<f64>,
    pub std_rank: Option<f64>,
    pub podium_count: usize,
    pub podium_pct: f64,

    pub is_fixed_payment: bool,
    pub league_id: League,

    pub rank_distribution_json: RankDistribution,
    pub daily_scores_json: Vec<DailyScoreEntry>,
    pub daily_ranks_json: Vec<DailyRankEntry>,
    pub month_scores_json: Vec<MonthScoreEntry>,
    pub avg_score_w_pen_podium: Option<f64>,
    pub diff_podium_score_w_pen: Option<f64>,
    pub league_thresholds_json: BTreeMap<League, Vec<ThresholdPoint>>,
    pub residual_distributions_json: Option<ResidualDistribution>,
    pub boxplot_by_power_json: Vec<PowerBinBoxplot>,
}

/// Assemble the monthly records for every forecaster the engine has seen:
/// the ranked population plus fixed-payment forecasters, which are emitted
/// with league `unassigned` and no rank fields.
pub fn monthly_records(
    engine: &KpiEngine,
    year: i32,
    month: u32,
    resource_id: &str,
    metric: ScoreMetric,
    participation: &HashMap<String, bool>,
) -> Vec<MonthlyKpiRecord> {
    let days_in_period = engine
        .month_ranks
        .values()
        .map(|s| s.count)
        .max()
        .unwrap_or(engine.days.len());

    // Month comparison list: penalty-adjusted averages of forecasters that
    // qualified (not too many missing days).
    let month_scores_json: Vec<MonthScoreEntry> = engine
        .month_scores_w_pen
        .iter()
        .filter(|(user, _)| engine.league.get(user.as_str()) != Some(&League::Unqualified))
        .map(|(user, stats)| MonthScoreEntry {
            user_id: user.clone(),
            score: stats.avg,
        })
        .collect();

    // Podium: average of the three best penalty-adjusted averages.
    let mut pen_averages: Vec<f64> = engine.month_scores_w_pen.values().map(|s| s.avg).collect();
    pen_averages.sort_by(|a, b| a.total_cmp(b));
    let podium: Option<f64> = if pen_averages.is_empty() {
        None
    } else {
        let take = pen_averages.len().min(3);
        Some(pen_averages[..take].to_vec().mean())
    };

    let mut records = Vec::new();

    for (user, pen_stats) in &engine.month_scores_w_pen {
        let rank_stats = engine.month_ranks.get(user);
        let raw_stats = engine.month_scores.get(user);

        let user_ranks: Vec<usize> = engine
            .daily_ranks
            .iter()
            .filter(|r| &r.user_id == user)
            .map(|r| r.rank)
            .collect();
        let podium_count = user_ranks.iter().filter(|r| **r <= 3).count();
        let podium_pct = if user_ranks.is_empty() {
            0.0
        } else {
            podium_count as f64 / user_ranks.len() as f64 * 100.0
        };

        let rank_distribution = RankDistribution {
            rank_1_5: user_ranks.iter().filter(|r| **r <= 5).count(),
            rank_6_10: user_ranks.iter().filter(|r| **r > 5 && **r <= 10).count(),
            rank_11_plus: user_ranks.iter().filter(|r| **r > 10).count(),
        };

        let daily_scores_json = daily_scores_entries(engine, user);

        let daily_ranks_json: Vec<DailyRankEntry> = engine
            .daily_ranks
            .iter()
            .filter(|r| &r.user_id == user)
            .map(|r| DailyRankEntry {
                target_day: r.target_day,
                rank: r.rank,
                total_forecasters: engine.nr_participants,
            })
            .collect();

        let diff_podium = podium.and_then(|p| (p > 0.0).then(|| pen_stats.avg - p));

        records.push(MonthlyKpiRecord {
            user: user.clone(),
            resource: resource_id.to_string(),
            year,
            month,
            metric,
            track: engine.track(),
            days_with_submissions: rank_stats.map(|s| s.count).unwrap_or(0),
            days_in_period,
            participation_rate: rank_stats
                .map(|s| s.count as f64 / days_in_period.max(1) as f64 * 100.0)
                .unwrap_or(0.0),
            n_days_w_penalties: engine.n_days_w_penalties.get(user).copied().unwrap_or(0),
            nr_participants: engine.nr_participants,
            avg_score: raw_stats.map(|s| s.avg).unwrap_or(f64::NAN),
            best_score: raw_stats.map(|s| s.min).unwrap_or(f64::NAN),
            worst_score: raw_stats.map(|s| s.max).unwrap_or(f64::NAN),
            median_score: raw_stats.map(|s| s.median).unwrap_or(f64::NAN),
            std_score: raw_stats.map(|s| s.std).unwrap_or(f64::NAN),
            avg_score_w_pen: pen_stats.avg,
            best_score_w_pen: pen_stats.min,
            worst_score_w_pen: pen_stats.max,
            median_score_w_pen: pen_stats.median,
            std_score_w_pen: pen_stats.std,
            avg_score_w_pen_rank: engine.month_scores_ranked.get(user).copied(),
            avg_rank: rank_stats.map(|s| s.avg),
            best_rank: rank_stats.map(|s| s.min),
            worst_rank: rank_stats.map(|s| s.max),
            median_rank: rank_stats.map(|s| s.median),
            std_rank: rank_stats.map(|s| s.std),
            podium_count,
            podium_pct,
            is_fixed_payment: participation.get(user).copied().unwrap_or(false),
            league_id: engine
                .league
                .get(user)
                .copied()
                .unwrap_or(League::Unassigned),
            rank_distribution_json: rank_distribution,
            daily_scores_json,
            daily_ranks_json,
            month_scores_json: month_scores_json.clone(),
            avg_score_w_pen_podium: podium,
            diff_podium_score_w_pen: diff_podium,
            league_thresholds_json: engine.league_thresholds.clone(),
            residual_distributions_json: engine
                .residual_distributions
                .get(user)
                .cloned()
                .flatten(),
            boxplot_by_power_json: engine.boxplot_by_power.get(user).cloned().unwrap_or_default(),
        });
    }

    // Fixed-payment forecasters: reported, never ranked.
    for user in engine.fixed_payment_users() {
        let user_scores: Vec<&DailyScore> = engine
            .fixed_scores()
            .iter()
            .filter(|s| s.user_id == user)
            .collect();
        let values: Vec<f64> = user_scores.iter().map(|s| s.value).collect();
        let stats = fixed_stats(&values);

        let daily_scores_json: Vec<DailyScoreEntry> = user_scores
            .iter()
            .map(|s| DailyScoreEntry {
                target_day: s.target_day,
                score: s.value,
                is_penalty: false,
            })
            .collect();

        records.push(MonthlyKpiRecord {
            user: user.clone(),
            resource: resource_id.to_string(),
            year,
            month,
            metric,
            track: engine.track(),
            days_with_submissions: user_scores.len(),
            days_in_period,
            participation_rate: user_scores.len() as f64 / days_in_period.max(1) as f64 * 100.0,
            n_days_w_penalties: 0,
            nr_participants: engine.nr_participants,
            avg_score: stats.avg,
            best_score: stats.min,
            worst_score: stats.max,
            median_score: stats.median,
            std_score: stats.std,
            avg_score_w_pen: stats.avg,
            best_score_w_pen: stats.min,
            worst_score_w_pen: stats.max,
            median_score_w_pen: stats.median,
            std_score_w_pen: stats.std,
            avg_score_w_pen_rank: None,
            avg_rank: None,
            best_rank: None,
            worst_rank: None,
            median_rank: None,
            std_rank: None,
            podium_count: 0,
            podium_pct: 0.0,
            is_fixed_payment: true,
            league_id: League::Unassigned,
            rank_distribution_json: RankDistribution {
                rank_1_5: 0,
                rank_6_10: 0,
                rank_11_plus: 0,
            },
            daily_scores_json,
            daily_ranks_json: Vec::new(),
            month_scores_json: month_scores_json.clone(),
            avg_score_w_pen_podium: podium,
            diff_podium_score_w_pen: None,
            league_thresholds_json: engine.league_thresholds.clone(),
            residual_distributions_json: engine
                .residual_distributions
                .get(&user)
                .cloned()
                .flatten(),
            boxplot_by_power_json: engine
                .boxplot_by_power
                .get(&user)
                .cloned()
                .unwrap_or_default(),
        });
    }

    records
}

fn daily_scores_entries(engine: &KpiEngine, user: &str) -> Vec<DailyScoreEntry> {
    let Some(by_day) = engine.daily_scores_w_pen.get(user) else {
        return Vec::new();
    };
    let missing = engine.days_wout_submissions.get(user);
    by_day
        .iter()
        .map(|(day, score)| DailyScoreEntry {
            target_day: *day,
            score: *score,
            is_penalty: missing.map(|m| m.contains(day)).unwrap_or(false),
        })
        .collect()
}

fn fixed_stats(values: &[f64]) -> ScoreStats {
    if values.is_empty() {
        return ScoreStats {
            avg: f64::NAN,
            min: f64::NAN,
            max: f64::NAN,
            median: f64::NAN,
            std: 0.0,
        };
    }
    let std = if values.len() > 1 { values.std_dev() } else { 0.0 };
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    let median = if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    };
    ScoreStats {
        avg: values.mean(),
        min: sorted[0],
        max: sorted[n - 1],
        median,
        std,
    }
}
