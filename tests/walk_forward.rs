use chrono::NaiveDate;

use propcast::backtest::{WalkForwardBacktester, walkforward_version};
use propcast::config::{BacktestParams, ConfidenceParams, StatType};
use propcast::features::FeatureBuilder;
use propcast::store::{self, GameRecord, PredictionRecord};
use propcast::under_rate::refresh_under_rates;

fn day(d: i64) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, 1).unwrap() + chrono::Duration::days(d)
}

fn league_history(players: i64, games: i64) -> Vec<GameRecord> {
    let mut out = Vec::new();
    for player in 1..=players {
        let (team, matchup) = if player % 2 == 0 {
            ("BOS", "BOS vs. LAL")
        } else {
            ("LAL", "LAL @ BOS")
        };
        for g in 0..games {
            out.push(GameRecord {
                player_id: player,
                game_id: format!("g{g}"),
                game_date: day(g),
                matchup: matchup.to_string(),
                team_abbreviation: team.to_string(),
                minutes: 24.0 + ((player + g) % 8) as f64,
                points: 8.0 + player as f64 * 2.0 + ((g * 3) % 7) as f64,
                assists: 2.0 + ((player + g) % 4) as f64,
                rebounds: 4.0 + ((g * 2) % 5) as f64,
                steals: 1.0,
                blocks: 0.5,
                turnovers: 2.0,
                fg_attempts: None,
                fg_made: None,
                three_attempts: None,
                three_made: None,
            });
        }
    }
    out
}

fn tester(min_train_rows: usize) -> WalkForwardBacktester {
    WalkForwardBacktester::new(
        BacktestParams {
            min_games: 3,
            min_train_rows,
            max_dates: None,
        },
        ConfidenceParams::default(),
    )
}

#[test]
fn replay_is_causal_under_future_data_changes() {
    // Predictions up to a cutoff date are bit-identical whether or not
    // later games exist in the dataset.
    let full = league_history(6, 25);
    let cutoff = day(18);
    let truncated: Vec<GameRecord> = full
        .iter()
        .filter(|g| g.game_date < cutoff)
        .cloned()
        .collect();

    let table_full = FeatureBuilder::new(full, Vec::new(), Vec::new())
        .training_table()
        .unwrap();
    let table_trunc = FeatureBuilder::new(truncated, Vec::new(), Vec::new())
        .training_table()
        .unwrap();

    let report_full = tester(40).run(&table_full, StatType::Points).unwrap();
    let report_trunc = tester(40).run(&table_trunc, StatType::Points).unwrap();

    let early_full: Vec<_> = report_full
        .predictions
        .iter()
        .filter(|p| p.game_date < cutoff)
        .collect();
    assert!(!early_full.is_empty());
    assert_eq!(early_full.len(), report_trunc.predictions.len());
    for (a, b) in early_full.iter().zip(&report_trunc.predictions) {
        assert_eq!(a.player_id, b.player_id);
        assert_eq!(a.game_id, b.game_id);
        assert_eq!(a.predicted, b.predicted);
        assert_eq!(a.interval.confidence, b.interval.confidence);
        assert_eq!(a.interval.p10, b.interval.p10);
        assert_eq!(a.interval.p90, b.interval.p90);
    }
}

#[test]
fn replay_is_deterministic() {
    let table = FeatureBuilder::new(league_history(6, 20), Vec::new(), Vec::new())
        .training_table()
        .unwrap();
    let a = tester(40).run(&table, StatType::Rebounds).unwrap();
    let b = tester(40).run(&table, StatType::Rebounds).unwrap();
    assert_eq!(a.predictions.len(), b.predictions.len());
    for (x, y) in a.predictions.iter().zip(&b.predictions) {
        assert_eq!(x.predicted, y.predicted);
        assert_eq!(x.interval.confidence, y.interval.confidence);
    }
}

#[test]
fn replay_logs_feed_under_rate_aggregates() {
    let games = league_history(6, 20);
    let table = FeatureBuilder::new(games.clone(), Vec::new(), Vec::new())
        .training_table()
        .unwrap();
    let report = tester(40).run(&table, StatType::Points).unwrap();
    assert!(!report.predictions.is_empty());

    let mut conn = store::open_in_memory().unwrap();
    store::upsert_games(&mut conn, &games).unwrap();

    let version = walkforward_version(StatType::Points);
    assert_eq!(version, "walkforward_points");
    let records: Vec<PredictionRecord> = report
        .predictions
        .iter()
        .map(|p| PredictionRecord {
            player_id: p.player_id,
            stat_type: "points".into(),
            game_id: p.game_id.clone(),
            game_date: Some(p.game_date),
            prediction_date: Some(p.game_date),
            pred_value: p.predicted,
            pred_p10: p.interval.p10,
            pred_p50: p.interval.p50,
            pred_p90: p.interval.p90,
            confidence: Some(p.interval.confidence),
            model_version: Some(version.clone()),
            actual_value: Some(p.actual),
            abs_error: Some((p.predicted - p.actual).abs()),
        })
        .collect();
    store::upsert_predictions(&mut conn, &records).unwrap();

    let written = refresh_under_rates(&mut conn, 20).unwrap();
    assert!(written > 0);
    let rate: f64 = conn
        .query_row(
            "SELECT MAX(under_rate) FROM player_under_risk WHERE stat_type = 'points'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert!((0.0..=1.0).contains(&rate));

    // Re-running the replay path clears and rewrites its own logs only.
    let removed = store::delete_walkforward_logs(&conn, StatType::Points).unwrap();
    assert_eq!(removed, records.len());
}
