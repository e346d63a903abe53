use std::collections::HashMap;

use chrono::{NaiveDate, TimeZone, Utc};
use market_core::{League, LeagueConfig, Quantile, ScoreMetric, Track};
use market_frame::TimeSeries;

use crate::kpi::{DailyScore, ForecastRow, KpiEngine};
use crate::report::monthly_records;

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 4, d).unwrap()
}

fn score(user: &str, d: u32, value: f64) -> DailyScore {
    DailyScore {
        user_id: user.to_string(),
        challenge_id: format!("ch-{d}"),
        target_day: day(d),
        value,
    }
}

fn engine_with(scores: Vec<DailyScore>) -> KpiEngine {
    KpiEngine::new(Track::Deterministic, LeagueConfig::default()).load_scores(scores)
}

#[test]
fn daily_ranking_is_dense() {
    let mut engine = engine_with(vec![
        score("a", 1, 1.0),
        score("b", 1, 1.0),
        score("c", 1, 2.0),
        score("d", 1, 3.0),
    ]);
    engine.daily_ranking();

    let rank_of = |user: &str| {
        engine
            .daily_ranks
            .iter()
            .find(|r| r.user_id == user)
            .unwrap()
            .rank
    };
    // Ties share a rank; the next distinct value takes the next integer.
    assert_eq!(rank_of("a"), 1);
    assert_eq!(rank_of("b"), 1);
    assert_eq!(rank_of("c"), 2);
    assert_eq!(rank_of("d"), 3);
    assert_eq!(engine.nr_participants, 4);
}

#[test]
fn month_rank_stats_aggregate_over_days() {
    let mut engine = engine_with(vec![
        score("a", 1, 1.0),
        score("b", 1, 2.0),
        score("a", 2, 5.0),
        score("b", 2, 1.0),
    ]);
    engine.daily_ranking();
    let a = &engine.month_ranks["a"];
    assert_eq!(a.count, 2);
    assert_eq!(a.min, 1);
    assert_eq!(a.max, 2);
    assert!((a.avg - 1.5).abs() < 1e-9);
}

#[test]
fn missing_days_filled_with_month_wide_percentile() {
    // Forecaster x misses day 3; the cells are chosen so the 75th
    // percentile of all (forecaster, day) values is 8.
    let mut engine = engine_with(vec![
        score("x", 1, 5.0),
        score("x", 2, 5.0),
        score("y", 1, 2.0),
        score("y", 2, 8.0),
        score("y", 3, 8.0),
        score("z", 1, 8.0),
        score("z", 2, 8.0),
        score("z", 3, 8.0),
    ]);
    engine.daily_ranking();
    engine.average_scores();
    engine.average_scores_with_penalty();

    assert_eq!(engine.penalty_level, Some(8.0));
    assert_eq!(engine.n_days_w_penalties["x"], 1);
    // x: (5 + 5 + 8) / 3
    assert!((engine.month_scores_w_pen["x"].avg - 6.0).abs() < 1e-9);
    // The raw average ignores the missing day entirely.
    assert!((engine.month_scores["x"].avg - 5.0).abs() < 1e-9);
}

#[test]
fn league_assignment_cutoffs() {
    // 15 qualified forecasters with distinct averages, plus one that missed
    // six days of the month.
    let mut scores = Vec::new();
    for i in 0..15 {
        let user = format!("u{i:02}");
        for d in 1..=10 {
            scores.push(score(&user, d, (i + 1) as f64));
        }
    }
    // u99 submits only 4 of 10 days (6 missing -> unqualified).
    for d in 1..=4 {
        scores.push(score("u99", d, 0.5));
    }

    let mut engine = engine_with(scores);
    engine.daily_ranking();
    engine.average_scores();
    engine.average_scores_with_penalty();
    engine.find_forecaster_league();

    for i in 0..5 {
        assert_eq!(engine.league[&format!("u{i:02}")], League::Elite);
    }
    for i in 5..10 {
        assert_eq!(engine.league[&format!("u{i:02}")], League::Challenger);
    }
    assert_eq!(engine.league["u10"], League::RunnerUp);
    for i in 11..15 {
        assert_eq!(engine.league[&format!("u{i:02}")], League::Unassigned);
    }
    assert_eq!(engine.league["u99"], League::Unqualified);
    assert_eq!(engine.best_forecaster.as_deref(), Some("u00"));
}

#[test]
fn league_thresholds_track_cumulative_means() {
    let mut scores = Vec::new();
    for i in 0..12 {
        let user = format!("u{i:02}");
        for d in 1..=3 {
            scores.push(score(&user, d, (i + 1) as f64));
        }
    }
    let mut engine = engine_with(scores);
    engine.daily_ranking();
    engine.average_scores();
    engine.average_scores_with_penalty();
    engine.find_forecaster_league();
    engine.calculate_league_thresholds();

    let elite = &engine.league_thresholds[&League::Elite];
    assert_eq!(elite.len(), 3);
    // Constant daily scores: the cumulative mean equals the value, and the
    // elite threshold is the 5th smallest.
    for point in elite {
        assert_eq!(point.value, Some(5.0));
    }
    let runner_up = &engine.league_thresholds[&League::RunnerUp];
    for point in runner_up {
        assert_eq!(point.value, Some(11.0));
    }
}

#[test]
fn thresholds_empty_when_too_few_forecasters() {
    let mut engine = engine_with(vec![
        score("a", 1, 1.0),
        score("b", 1, 2.0),
        score("c", 1, 3.0),
    ]);
    engine.daily_ranking();
    engine.average_scores();
    engine.average_scores_with_penalty();
    engine.find_forecaster_league();
    engine.calculate_league_thresholds();

    let elite = &engine.league_thresholds[&League::Elite];
    assert_eq!(elite[0].value, None);
}

#[test]
fn fixed_payment_forecasters_leave_the_ranking() {
    let mut engine = engine_with(vec![
        score("free", 1, 5.0),
        score("contracted", 1, 1.0),
    ]);
    let mut participation = HashMap::new();
    participation.insert("contracted".to_string(), true);
    participation.insert("free".to_string(), false);
    engine.remove_fixed_payment(&participation);
    engine.daily_ranking();

    assert_eq!(engine.nr_participants, 1);
    assert!(engine.month_ranks.contains_key("free"));
    assert_eq!(engine.fixed_payment_users(), vec!["contracted"]);
}

fn distribution_fixture() -> (Vec<ForecastRow>, TimeSeries) {
    let timestamps: Vec<_> = (0..4)
        .map(|i| Utc.with_ymd_and_hms(2024, 4, 1, i, 0, 0).unwrap())
        .collect();
    let observed = TimeSeries::from_values(timestamps.clone(), vec![10.0, 20.0, 30.0, 40.0]);

    let mut rows = Vec::new();
    for (user, offset) in [("a", 1.0), ("b", -2.0)] {
        for (i, ts) in timestamps.iter().enumerate() {
            rows.push(ForecastRow {
                user_id: user.to_string(),
                variable: Quantile::Q50,
                datetime: *ts,
                value: (10.0 + 10.0 * i as f64) + offset,
            });
        }
    }
    (rows, observed)
}

#[test]
fn residual_distributions_share_bin_edges() {
    let mut engine = engine_with(vec![score("a", 1, 1.0), score("b", 1, 2.0)]);
    engine.daily_ranking();
    engine.average_scores();
    engine.average_scores_with_penalty();
    engine.find_forecaster_league();
    assert_eq!(engine.best_forecaster.as_deref(), Some("a"));

    let (rows, observed) = distribution_fixture();
    engine.calculate_distributions(&rows, &observed);

    let dist_b = engine.residual_distributions["b"].as_ref().unwrap();
    // Edges are symmetric around zero and cover both forecasters (max |r| = 2).
    assert_eq!(dist_b.bin_edges.len(), 21);
    assert_eq!(dist_b.bin_edges[0], -2.0);
    assert_eq!(*dist_b.bin_edges.last().unwrap(), 2.0);
    assert_eq!(dist_b.selected_user_counts.iter().sum::<usize>(), 4);
    assert_eq!(dist_b.best_forecaster_counts.iter().sum::<usize>(), 4);
}

#[test]
fn probabilistic_track_emits_empty_distributions() {
    let mut engine = KpiEngine::new(Track::Probabilistic, LeagueConfig::default())
        .load_scores(vec![score("a", 1, 1.0)]);
    engine.daily_ranking();
    engine.average_scores();
    engine.average_scores_with_penalty();
    engine.find_forecaster_league();

    let (rows, observed) = distribution_fixture();
    engine.calculate_distributions(&rows, &observed);
    assert!(engine.residual_distributions["a"].is_none());
    assert!(engine.boxplot_by_power["a"].is_empty());
}

#[test]
fn power_bin_boxplots_partition_the_observation_range() {
    let mut engine = engine_with(vec![score("a", 1, 1.0), score("b", 1, 2.0)]);
    engine.daily_ranking();
    engine.average_scores();
    engine.average_scores_with_penalty();
    engine.find_forecaster_league();

    let (rows, observed) = distribution_fixture();
    engine.calculate_distributions(&rows, &observed);

    let boxplots = &engine.boxplot_by_power["a"];
    assert_eq!(boxplots.len(), 5);
    let total: usize = boxplots
        .iter()
        .filter_map(|b| b.selected_user.as_ref())
        .map(|s| s.n_samples)
        .sum();
    assert_eq!(total, 4);
}

#[test]
fn monthly_records_cover_ranked_and_fixed_users() {
    let mut engine = engine_with(vec![
        score("free1", 1, 5.0),
        score("free2", 1, 3.0),
        score("contracted", 1, 1.0),
    ]);
    let mut participation = HashMap::new();
    participation.insert("contracted".to_string(), true);
    engine.remove_fixed_payment(&participation);
    engine.daily_ranking();
    engine.average_scores();
    engine.average_scores_with_penalty();
    engine.find_forecaster_league();
    engine.calculate_league_thresholds();

    let records = monthly_records(
        &engine,
        2024,
        4,
        "wind-1",
        ScoreMetric::Rmse,
        &participation,
    );
    assert_eq!(records.len(), 3);

    let fixed = records.iter().find(|r| r.user == "contracted").unwrap();
    assert!(fixed.is_fixed_payment);
    assert_eq!(fixed.league_id, League::Unassigned);
    assert_eq!(fixed.avg_rank, None);
    assert_eq!(fixed.avg_score, 1.0);

    let free2 = records.iter().find(|r| r.user == "free2").unwrap();
    assert!(!free2.is_fixed_payment);
    assert_eq!(free2.league_id, League::Elite);
    assert_eq!(free2.avg_score_w_pen_rank, Some(1));
    assert_eq!(free2.days_with_submissions, 1);
    // The month comparison list only contains ranked, qualified users.
    assert_eq!(free2.month_scores_json.len(), 2);
}

#[test]
fn s6_scenario_penalty_average() {
    // Forecaster X misses day 15 in a 30-day month where X averages 5 on
    // submitted days and the month-wide 75th percentile is 8.
    let mut scores = Vec::new();
    for d in 1..=30 {
        if d != 15 {
            scores.push(score("x", d, 5.0));
        }
        // A spread of other forecasters pushing the 75th percentile to 8.
        scores.push(score("other", d, 8.0));
    }
    let mut engine = engine_with(scores);
    engine.daily_ranking();
    engine.average_scores();
    engine.average_scores_with_penalty();

    assert_eq!(engine.penalty_level, Some(8.0));
    let expected = (5.0 * 29.0 + 8.0) / 30.0;
    assert!((engine.month_scores_w_pen["x"].avg - expected).abs() < 1e-9);
}
