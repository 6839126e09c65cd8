use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};

use propcast::config::{EngineConfig, StatType, default_db_path};
use propcast::features::FeatureBuilder;
use propcast::store;
use propcast::trainer::ModelTrainer;

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
    if let Some(n) = parse_usize_arg("--ensemble") {
        config.training.ensemble_members = n.clamp(1, 32);
    }
    let stats = match parse_string_arg("--stat") {
        Some(raw) => vec![raw.parse::<StatType>()?],
        None => StatType::ALL.to_vec(),
    };
    let db_path = parse_path_arg("--db")
        .or_else(default_db_path)
        .ok_or_else(|| anyhow!("no --db given and no home directory for the default"))?;

    let conn = store::open_db(&db_path)?;
    let games = store::load_games(&conn)?;
    if games.is_empty() {
        return Err(anyhow!("no game history in {}", db_path.display()));
    }
    let team_games = store::load_team_games(&conn)?;
    let lineups = store::load_lineups(&conn)?;
    let asof = store::latest_game_date(&conn)?
        .ok_or_else(|| anyhow!("game table has rows but no dates"))?;

    let mut table = FeatureBuilder::new(games, team_games, lineups)
        .training_table()
        .context("build training table")?;

    let trainer = ModelTrainer::new(config.training);
    let minutes = trainer.train_minutes(&mut table, &config.models_dir, asof)?;
    println!(
        "minutes   train={} val={} mae={:.3} rmse={:.3} -> {}",
        minutes.artifact.meta().train_rows,
        minutes.artifact.meta().val_rows,
        minutes.artifact.meta().val_mae,
        minutes.artifact.meta().val_rmse,
        minutes.path.display()
    );

    for stat in stats {
        let outcome = trainer.train_stat(&table, stat, &config.models_dir, asof)?;
        let meta = outcome.artifact.meta();
        println!(
            "{:9} train={} val={} mae={:.3} rmse={:.3} -> {}",
            stat.column(),
            meta.train_rows,
            meta.val_rows,
            meta.val_mae,
            meta.val_rmse,
            outcome.path.display()
        );
    }
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
