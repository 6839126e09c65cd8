use std::path::PathBuf;

use anyhow::{Result, anyhow};

use propcast::config::{DaySelector, EngineConfig, StatType, default_db_path};
use propcast::predict::LivePredictor;
use propcast::store;

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
    let day = parse_string_arg("--day")
        .unwrap_or_else(|| "today".to_string())
        .parse::<DaySelector>()?;
    let stats = match parse_string_arg("--stat") {
        Some(raw) => vec![raw.parse::<StatType>()?],
        None => StatType::ALL.to_vec(),
    };
    let db_path = parse_path_arg("--db")
        .or_else(default_db_path)
        .ok_or_else(|| anyhow!("no --db given and no home directory for the default"))?;

    let mut conn = store::open_db(&db_path)?;
    let mut predictor = LivePredictor::new(config);
    let records = predictor.run(&mut conn, day, &stats)?;

    if records.is_empty() {
        println!("no predictions (empty slate or no candidates)");
        return Ok(());
    }
    println!(
        "{:>10} {:>9} {:>8} {:>7} {:>7} {:>7} {:>6}",
        "player", "stat", "game", "p10", "p50", "p90", "conf"
    );
    for rec in &records {
        println!(
            "{:>10} {:>9} {:>8} {:>7.1} {:>7.1} {:>7.1} {:>6.1}",
            rec.player_id,
            rec.stat_type,
            rec.game_id,
            rec.pred_p10.unwrap_or(rec.pred_value),
            rec.pred_p50.unwrap_or(rec.pred_value),
            rec.pred_p90.unwrap_or(rec.pred_value),
            rec.confidence.unwrap_or(0.0),
        );
    }
    println!("{} predictions stored", records.len());
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
