use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};

use propcast::backtest::{WalkForwardBacktester, walkforward_version};
use propcast::config::{EngineConfig, StatType, default_db_path};
use propcast::features::FeatureBuilder;
use propcast::snapshot::refresh_snapshot;
use propcast::store::{self, PredictionRecord};
use propcast::trainer::ModelTrainer;
use propcast::under_rate::refresh_under_rates;

/// Nightly batch: snapshot refresh, model training, optional walk-forward
/// replays, prediction grading, under-rate aggregation.
fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut config = EngineConfig::from_env();
    if let Some(dir) = parse_path_arg("--models-dir") {
        config.models_dir = dir;
    }
    if let Some(n) = parse_usize_arg("--max-dates") {
        config.backtest.max_dates = Some(n);
    }
    let skip_train = has_flag("--skip-train");
    let run_backtests = has_flag("--backtest");
    let db_path = parse_path_arg("--db")
        .or_else(default_db_path)
        .ok_or_else(|| anyhow!("no --db given and no home directory for the default"))?;

    let mut conn = store::open_db(&db_path)?;
    let players = refresh_snapshot(&mut conn)?;
    println!("snapshot: {players} players");

    let games = store::load_games(&conn)?;
    if games.is_empty() {
        return Err(anyhow!("no game history in {}", db_path.display()));
    }
    let team_games = store::load_team_games(&conn)?;
    let lineups = store::load_lineups(&conn)?;
    let table = FeatureBuilder::new(games, team_games, lineups)
        .training_table()
        .context("build feature table")?;

    if !skip_train {
        let asof = store::latest_game_date(&conn)?
            .ok_or_else(|| anyhow!("game table has rows but no dates"))?;
        let trainer = ModelTrainer::new(config.training);
        let mut table = table.clone();
        trainer.train_minutes(&mut table, &config.models_dir, asof)?;
        for stat in StatType::ALL {
            let outcome = trainer.train_stat(&table, stat, &config.models_dir, asof)?;
            let meta = outcome.artifact.meta();
            println!(
                "trained {:9} mae={:.3} rmse={:.3}",
                stat.column(),
                meta.val_mae,
                meta.val_rmse
            );
        }
    }

    if run_backtests {
        let tester = WalkForwardBacktester::new(config.backtest, config.confidence);
        for stat in StatType::ALL {
            let report = tester.run(&table, stat)?;
            println!(
                "walk-forward {:9} dates={} rows={} mae={:.3}",
                stat.column(),
                report.dates_processed,
                report.predictions.len(),
                report.mae
            );
            store::delete_walkforward_logs(&conn, stat)?;
            let version = walkforward_version(stat);
            let records: Vec<PredictionRecord> = report
                .predictions
                .iter()
                .map(|p| PredictionRecord {
                    player_id: p.player_id,
                    stat_type: stat.column().to_string(),
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
            store::upsert_predictions(&mut conn, &records)?;
        }
    }

    let written = refresh_under_rates(&mut conn, config.under_rate_window)?;
    println!("under rates: {written} rows");
    Ok(())
}

fn parse_string_arg(name: &str) -> Option<String> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    for (idx, arg) in args.iter().enumerate() {
        if let Some(v) = arg.strip_prefix(&format!("{name}=")) {
            if !v.trim().is_empty() {
                return Some(v.trim().to_string());
            }
        }
        if arg == name
            && let Some(next) = args.get(idx + 1)
            && !next.trim().is_empty()
        {
            return Some(next.trim().to_string());
        }
    }
    None
}

fn parse_path_arg(name: &str) -> Option<PathBuf> {
    parse_string_arg(name).map(PathBuf::from)
}

fn parse_usize_arg(name: &str) -> Option<usize> {
    parse_string_arg(name).and_then(|v| v.parse().ok())
}

fn has_flag(flag: &str) -> bool {
    std::env::args().skip(1).any(|a| a == flag)
}
