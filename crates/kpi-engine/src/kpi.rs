use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, NaiveDate, Utc};
use market_core::{League, LeagueConfig, Quantile, Track};
use market_frame::TimeSeries;
use serde::Serialize;
use skill_score::{boxplot_summary, percentile_linear, BoxplotSummary};
use statrs::statistics::Statistics;
use tracing::warn;

/// One daily score row for the month: the evaluated metric value of one
/// forecaster on one challenge day.
#[derive(Debug, Clone)]
pub struct DailyScore {
    pub user_id: String,
    pub challenge_id: String,
    pub target_day: NaiveDate,
    pub value: f64,
}

/// One deterministic forecast row used for the error distributions.
#[derive(Debug, Clone)]
pub struct ForecastRow {
    pub user_id: String,
    pub variable: Quantile,
    pub datetime: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DailyRank {
    pub user_id: String,
    pub challenge_id: String,
    pub target_day: NaiveDate,
    pub rank: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankStats {
    pub avg: f64,
    pub min: usize,
    pub max: usize,
    pub median: f64,
    pub std: f64,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreStats {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub median: f64,
    pub std: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdPoint {
    pub target_day: NaiveDate,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResidualDistribution {
    pub bin_edges: Vec<f64>,
    pub selected_user_counts: Vec<usize>,
    pub best_forecaster_counts: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PowerBinBoxplot {
    pub bin: String,
    pub selected_user: Option<BoxplotSummary>,
    pub best_forecaster: Option<BoxplotSummary>,
}

/// Number of residual histogram bins (shared edges for both forecasters).
const RESIDUAL_BINS: usize = 20;
/// Number of equal-width observation bins for the error boxplots.
const POWER_BINS: usize = 5;

/// Monthly KPI aggregation over one resource and track: daily rankings,
/// penalty-adjusted monthly scores, league assignment and error
/// distributions.
pub struct KpiEngine {
    track: Track,
    config: LeagueConfig,
    scores: Vec<DailyScore>,
    /// Scores of fixed-payment forecasters, kept out of rankings, leagues
    /// and thresholds but still reported.
    fixed_scores: Vec<DailyScore>,

    pub days: Vec<NaiveDate>,
    pub daily_ranks: Vec<DailyRank>,
    pub month_ranks: BTreeMap<String, RankStats>,
    pub nr_participants: usize,

    pub daily_scores: BTreeMap<String, BTreeMap<NaiveDate, f64>>,
    pub month_scores: BTreeMap<String, ScoreStats>,

    pub penalty_level: Option<f64>,
    pub daily_scores_w_pen: BTreeMap<String, BTreeMap<NaiveDate, f64>>,
    pub month_scores_w_pen: BTreeMap<String, ScoreStats>,
    pub month_scores_ranked: BTreeMap<String, usize>,
    pub n_days_w_penalties: BTreeMap<String, usize>,
    pub days_wout_submissions: BTreeMap<String, BTreeSet<NaiveDate>>,

    pub league: BTreeMap<String, League>,
    pub best_forecaster: Option<String>,
    pub league_thresholds: BTreeMap<League, Vec<ThresholdPoint>>,

    pub residual_distributions: BTreeMap<String, Option<ResidualDistribution>>,
    pub boxplot_by_power: BTreeMap<String, Vec<PowerBinBoxplot>>,
}

impl KpiEngine {
    pub fn new(track: Track, config: LeagueConfig) -> Self {
        Self {
            track,
            config,
            scores: Vec::new(),
            fixed_scores: Vec::new(),
            days: Vec::new(),
            daily_ranks: Vec::new(),
            month_ranks: BTreeMap::new(),
            nr_participants: 0,
            daily_scores: BTreeMap::new(),
            month_scores: BTreeMap::new(),
            penalty_level: None,
            daily_scores_w_pen: BTreeMap::new(),
            month_scores_w_pen: BTreeMap::new(),
            month_scores_ranked: BTreeMap::new(),
            n_days_w_penalties: BTreeMap::new(),
            days_wout_submissions: BTreeMap::new(),
            league: BTreeMap::new(),
            best_forecaster: None,
            league_thresholds: BTreeMap::new(),
            residual_distributions: BTreeMap::new(),
            boxplot_by_power: BTreeMap::new(),
        }
    }

    pub fn track(&self) -> Track {
        self.track
    }

    pub fn load_scores(mut self, scores: Vec<DailyScore>) -> Self {
        self.scores = scores;
        self
    }

    /// Drop score rows for operator-excluded target days.
    pub fn remove_dates(&mut self, dates: &[NaiveDate]) {
        if dates.is_empty() {
            return;
        }
        self.scores.retain(|s| !dates.contains(&s.target_day));
    }

    /// Move fixed-payment forecasters out of the ranked population. Their
    /// scores are retained separately so their monthly records can still be
    /// emitted (league `unassigned`).
    pub fn remove_fixed_payment(&mut self, participation: &HashMap<String, bool>) {
        let (fixed, ranked): (Vec<DailyScore>, Vec<DailyScore>) = self
            .scores
            .drain(..)
            .partition(|s| participation.get(&s.user_id).copied().unwrap_or(false));
        self.scores = ranked;
        self.fixed_scores = fixed;
    }

    pub fn fixed_payment_users(&self) -> Vec<String> {
        let users: BTreeSet<String> =
            self.fixed_scores.iter().map(|s| s.user_id.clone()).collect();
        users.into_iter().collect()
    }

    pub fn fixed_scores(&self) -> &[DailyScore] {
        &self.fixed_scores
    }

    /// Dense daily ranking per (challenge, target day), plus per-forecaster
    /// rank statistics over the month.
    pub fn daily_ranking(&mut self) {
        let mut groups: BTreeMap<(String, NaiveDate), Vec<usize>> = BTreeMap::new();
        for (i, score) in self.scores.iter().enumerate() {
            groups
                .entry((score.challenge_id.clone(), score.target_day))
                .or_default()
                .push(i);
        }

        self.daily_ranks.clear();
        for indices in groups.values() {
            // Dense ranking: ties share a rank, the next distinct value gets
            // the following integer.
            let mut values: Vec<f64> = indices.iter().map(|i| self.scores[*i].value).collect();
            values.sort_by(|a, b| a.total_cmp(b));
            values.dedup();
            for i in indices {
                let score = &self.scores[*i];
                let rank = values.partition_point(|v| *v < score.value) + 1;
                self.daily_ranks.push(DailyRank {
                    user_id: score.user_id.clone(),
                    challenge_id: score.challenge_id.clone(),
                    target_day: score.target_day,
                    rank,
                });
            }
        }

        let mut per_user: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for rank in &self.daily_ranks {
            per_user
                .entry(rank.user_id.clone())
                .or_default()
                .push(rank.rank);
        }

        self.month_ranks = per_user
            .into_iter()
            .map(|(user, ranks)| {
                let as_f64: Vec<f64> = ranks.iter().map(|r| *r as f64).collect();
                let std = if as_f64.len() > 1 {
                    as_f64.as_slice().std_dev()
                } else {
                    0.0
                };
                let stats = RankStats {
                    avg: as_f64.as_slice().mean(),
                    min: *ranks.iter().min().unwrap_or(&0),
                    max: *ranks.iter().max().unwrap_or(&0),
                    median: median(&as_f64),
                    std,
                    count: ranks.len(),
                };
                (user, stats)
            })
            .collect();

        self.nr_participants = self.month_ranks.len();
    }

    /// Pivot scores to (forecaster × day) and aggregate, leaving missing
    /// days missing.
    pub fn average_scores(&mut self) {
        let mut days: BTreeSet<NaiveDate> = BTreeSet::new();
        self.daily_scores.clear();
        for score in &self.scores {
            days.insert(score.target_day);
            self.daily_scores
                .entry(score.user_id.clone())
                .or_default()
                .insert(score.target_day, score.value);
        }
        self.days = days.into_iter().collect();

        self.month_scores = self
            .daily_scores
            .iter()
            .map(|(user, by_day)| {
                let values: Vec<f64> = by_day.values().copied().collect();
                (user.clone(), score_stats(&values))
            })
            .collect();
    }

    /// Fill missing days with the month-wide penalty level (75th percentile
    /// of all daily cells) and recompute the aggregates, plus the dense rank
    /// of the penalty-adjusted averages.
    pub fn average_scores_with_penalty(&mut self) {
        let all_cells: Vec<f64> = self
            .daily_scores
            .values()
            .flat_map(|by_day| by_day.values().copied())
            .collect();
        self.penalty_level = percentile_linear(&all_cells, self.config.penalty_quantile);

        self.days_wout_submissions.clear();
        self.n_days_w_penalties.clear();
        self.daily_scores_w_pen.clear();

        for (user, by_day) in &self.daily_scores {
            let mut filled = BTreeMap::new();
            let mut missing = BTreeSet::new();
            for day in &self.days {
                match by_day.get(day) {
                    Some(v) => {
                        filled.insert(*day, *v);
                    }
                    None => {
                        missing.insert(*day);
                        if let Some(penalty) = self.penalty_level {
                            filled.insert(*day, penalty);
                        }
                    }
                }
            }
            self.n_days_w_penalties.insert(user.clone(), missing.len());
            self.days_wout_submissions.insert(user.clone(), missing);
            self.daily_scores_w_pen.insert(user.clone(), filled);
        }

        self.month_scores_w_pen = self
            .daily_scores_w_pen
            .iter()
            .map(|(user, by_day)| {
                let values: Vec<f64> = by_day.values().copied().collect();
                (user.clone(), score_stats(&values))
            })
            .collect();

        // Dense rank of penalty-adjusted averages, ascending.
        let mut averages: Vec<f64> = self
            .month_scores_w_pen
            .values()
            .map(|s| s.avg)
            .collect();
        averages.sort_by(|a, b| a.total_cmp(b));
        averages.dedup();
        self.month_scores_ranked = self
            .month_scores_w_pen
            .iter()
            .map(|(user, stats)| {
                let rank = averages.partition_point(|v| *v < stats.avg) + 1;
                (user.clone(), rank)
            })
            .collect();
    }

    /// Assign leagues from the penalty-adjusted averages. Forecasters with
    /// too many missing days are disqualified before the cutoffs apply.
    pub fn find_forecaster_league(&mut self) -> &BTreeMap<String, League> {
        let unqualified: Vec<String> = self
            .n_days_w_penalties
            .iter()
            .filter(|(_, missing)| **missing > self.config.max_missing_days)
            .map(|(user, _)| user.clone())
            .collect();

        let mut qualified: Vec<(String, f64)> = self
            .month_scores_w_pen
            .iter()
            .filter(|(user, _)| !unqualified.contains(user))
            .map(|(user, stats)| (user.clone(), stats.avg))
            .collect();
        qualified.sort_by(|a, b| a.1.total_cmp(&b.1));

        self.league.clear();
        for (position, (user, _)) in qualified.iter().enumerate() {
            let rank = position + 1;
            let league = if rank <= self.config.elite_cutoff {
                League::Elite
            } else if rank <= self.config.challenger_cutoff {
                League::Challenger
            } else if rank == self.config.runner_up_rank {
                League::RunnerUp
            } else {
                League::Unassigned
            };
            self.league.insert(user.clone(), league);
        }
        for user in unqualified {
            self.league.insert(user, League::Unqualified);
        }

        self.best_forecaster = qualified.first().map(|(user, _)| user.clone());
        &self.league
    }

    /// Per-day league entry thresholds from expanding cumulative means: on
    /// each day, the 5th / 10th / 11th smallest cumulative mean.
    pub fn calculate_league_thresholds(&mut self) {
        let mut elite = Vec::new();
        let mut challenger = Vec::new();
        let mut runner_up = Vec::new();

        for (i, day) in self.days.iter().enumerate() {
            let mut cumulative: Vec<f64> = self
                .daily_scores_w_pen
                .values()
                .map(|by_day| {
                    let prefix: Vec<f64> = self
                        .days
                        .iter()
                        .take(i + 1)
                        .filter_map(|d| by_day.get(d).copied())
                        .collect();
                    prefix.as_slice().mean()
                })
                .collect();
            cumulative.sort_by(|a, b| a.total_cmp(b));

            let nth = |rank: usize| -> Option<f64> { cumulative.get(rank - 1).copied() };
            elite.push(ThresholdPoint {
                target_day: *day,
                value: nth(self.config.elite_cutoff),
            });
            challenger.push(ThresholdPoint {
                target_day: *day,
                value: nth(self.config.challenger_cutoff),
            });
            runner_up.push(ThresholdPoint {
                target_day: *day,
                value: nth(self.config.runner_up_rank),
            });
        }

        self.league_thresholds.clear();
        self.league_thresholds.insert(League::Elite, elite);
        self.league_thresholds.insert(League::Challenger, challenger);
        self.league_thresholds.insert(League::RunnerUp, runner_up);
    }

    /// Residual histograms and squared-error boxplots per power bin, each
    /// forecaster compared against the month's best forecaster. Only the
    /// deterministic track carries these; the probabilistic track emits
    /// empty entries.
    pub fn calculate_distributions(&mut self, forecasts: &[ForecastRow], observed: &TimeSeries) {
        self.residual_distributions.clear();
        self.boxplot_by_power.clear();

        let users: BTreeSet<String> = forecasts.iter().map(|f| f.user_id.clone()).collect();

        // Deterministic residuals only.
        let q50_rows: Vec<&ForecastRow> = forecasts
            .iter()
            .filter(|f| f.variable == Quantile::Q50)
            .collect();

        let residuals_for = |user: &str| -> Vec<(f64, f64)> {
            // (observed, residual) pairs on overlapping timestamps.
            q50_rows
                .iter()
                .filter(|f| f.user_id == user)
                .filter_map(|f| {
                    observed
                        .value_at(f.datetime)
                        .map(|obs| (obs, f.value - obs))
                })
                .collect()
        };

        let best_pairs: Vec<(f64, f64)> = self
            .best_forecaster
            .as_deref()
            .map(|best| residuals_for(best))
            .unwrap_or_default();

        for user in users {
            if self.track == Track::Probabilistic {
                self.residual_distributions.insert(user.clone(), None);
                self.boxplot_by_power.insert(user, Vec::new());
                continue;
            }

            let pairs = residuals_for(&user);
            if pairs.is_empty() {
                warn!(user = %user, "No overlapping forecast/observation data");
                self.residual_distributions.insert(user.clone(), None);
                self.boxplot_by_power.insert(user, Vec::new());
                continue;
            }

            let distribution = residual_histogram(&pairs, &best_pairs);
            self.residual_distributions
                .insert(user.clone(), Some(distribution));

            let boxplots = power_bin_boxplots(&pairs, &best_pairs);
            self.boxplot_by_power.insert(user, boxplots);
        }
    }
}

/// Shared symmetric histogram of residuals for a forecaster and the best
/// forecaster.
fn residual_histogram(pairs: &[(f64, f64)], best_pairs: &[(f64, f64)]) -> ResidualDistribution {
    let mut max_abs: f64 = 0.0;
    for (_, r) in pairs.iter().chain(best_pairs) {
        max_abs = max_abs.max(r.abs());
    }
    if max_abs == 0.0 {
        max_abs = 1.0;
    }

    let edges: Vec<f64> = (0..=RESIDUAL_BINS)
        .map(|i| -max_abs + 2.0 * max_abs * i as f64 / RESIDUAL_BINS as f64)
        .collect();

    let histogram = |data: &[(f64, f64)]| -> Vec<usize> {
        let mut counts = vec![0usize; RESIDUAL_BINS];
        for (_, r) in data {
            let pos = ((r + max_abs) / (2.0 * max_abs) * RESIDUAL_BINS as f64) as usize;
            counts[pos.min(RESIDUAL_BINS - 1)] += 1;
        }
        counts
    };

    ResidualDistribution {
        bin_edges: edges.iter().map(|e| (e * 1000.0).round() / 1000.0).collect(),
        selected_user_counts: histogram(pairs),
        best_forecaster_counts: histogram(best_pairs),
    }
}

/// Squared-error five-number summaries over equal-width observation bins.
/// Bins come from the selected forecaster's observation range and are shared
/// with the best forecaster.
fn power_bin_boxplots(pairs: &[(f64, f64)], best_pairs: &[(f64, f64)]) -> Vec<PowerBinBoxplot> {
    let range_min = pairs
        .iter()
        .map(|(obs, _)| *obs)
        .fold(f64::INFINITY, f64::min)
        .floor();
    let range_max = pairs
        .iter()
        .map(|(obs, _)| *obs)
        .fold(f64::NEG_INFINITY, f64::max)
        .ceil();
    let width = (range_max - range_min) / POWER_BINS as f64;
    if width <= 0.0 {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(POWER_BINS);
    for bin in 0..POWER_BINS {
        let lo = range_min + bin as f64 * width;
        let hi = range_min + (bin + 1) as f64 * width;

        let in_bin = |obs: f64| -> bool {
            if bin == 0 {
                obs >= lo && obs <= hi
            } else {
                obs > lo && obs <= hi
            }
        };

        let user_mse: Vec<f64> = pairs
            .iter()
            .filter(|(obs, _)| in_bin(*obs))
            .map(|(_, r)| r * r)
            .collect();
        let best_mse: Vec<f64> = best_pairs
            .iter()
            .filter(|(obs, _)| in_bin(*obs))
            .map(|(_, r)| r * r)
            .collect();

        out.push(PowerBinBoxplot {
            bin: format!("({lo:.3}, {hi:.3}]"),
            selected_user: boxplot_summary(&user_mse),
            best_forecaster: boxplot_summary(&best_mse),
        });
    }
    out
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    if n == 0 {
        return f64::NAN;
    }
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

fn score_stats(values: &[f64]) -> ScoreStats {
    let std = if values.len() > 1 { values.std_dev() } else { 0.0 };
    ScoreStats {
        avg: values.mean(),
        min: values.iter().copied().fold(f64::INFINITY, f64::min),
        max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        median: median(values),
        std,
    }
}

