use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};

use propcast::backtest::{WalkForwardBacktester, walkforward_version};
use propcast::config::{EngineConfig, StatType, default_db_path};
use propcast::features::FeatureBuilder;
use propcast::store::{self, PredictionRecord};

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut config = EngineConfig::from_env();
    let stat = parse_string_arg("--stat")
        .unwrap_or_else(|| "points".to_string())
        .parse::<StatType>()?;
    if let Some(n) = parse_usize_arg("--max-dates") {
        config.backtest.max_dates = Some(n);
    }
    let dry_run = has_flag("--dry-run");
    let db_path = parse_path_arg("--db")
        .or_else(default_db_path)
        .ok_or_else(|| anyhow!("no --db given and no home directory for the default"))?;

    let mut conn = store::open_db(&db_path)?;
    let games = store::load_games(&conn)?;
    if games.is_empty() {
        return Err(anyhow!("no game history in {}", db_path.display()));
    }
    let team_games = store::load_team_games(&conn)?;
    let lineups = store::load_lineups(&conn)?;
    let table = FeatureBuilder::new(games, team_games, lineups)
        .training_table()
        .context("build feature table")?;

    let tester = WalkForwardBacktester::new(config.backtest, config.confidence);
    let report = tester.run(&table, stat)?;

    println!(
        "walk-forward {} dates={} skipped={} rows={} mae={:.3}",
        stat.column(),
        report.dates_processed,
        report.dates_skipped,
        report.predictions.len(),
        report.mae
    );

    if dry_run {
        println!("dry run, nothing written");
        return Ok(());
    }

    // Replace any previous replay for this stat before writing the new one.
    let removed = store::delete_walkforward_logs(&conn, stat)?;
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
    let written = store::upsert_predictions(&mut conn, &records)?;
    println!("replaced {removed} old rows, wrote {written} prediction logs ({version})");
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
