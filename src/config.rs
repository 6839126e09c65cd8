use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};

use crate::error::EngineError;

const APP_CACHE_DIR: &str = "propcast";

const DEFAULT_CONFIDENCE_DEFAULT: f64 = 50.0;
const DEFAULT_CONFIDENCE_MIN: f64 = 10.0;
const DEFAULT_CONFIDENCE_MAX: f64 = 95.0;
const DEFAULT_CONFIDENCE_DECAY: f64 = 0.12;
const DEFAULT_CONFIDENCE_WINDOW: usize = 10;
const DEFAULT_OVER_PENALTY: f64 = 1.25;
const DEFAULT_UNDER_PENALTY: f64 = 1.0;
const DEFAULT_BAND_LOW_PCT: f64 = 0.10;
const DEFAULT_BAND_HIGH_PCT: f64 = 0.90;

const DEFAULT_WALK_FORWARD_MIN_GAMES: usize = 3;
const DEFAULT_MIN_TRAIN_ROWS: usize = 50;
const DEFAULT_VALIDATION_DATE_FRACTION: f64 = 0.20;
const DEFAULT_MIN_TRAIN_DATES: usize = 10;
const DEFAULT_UNDER_RATE_WINDOW: usize = 20;

// US Eastern standard time; NBA game days roll over on an Eastern calendar.
const DEFAULT_LEAGUE_UTC_OFFSET_HOURS: i32 = -5;

/// Stat types the engine forecasts. Parsed at the boundary so an invalid
/// value is rejected before any computation begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatType {
    Points,
    Assists,
    Rebounds,
}

impl StatType {
    pub const ALL: [StatType; 3] = [StatType::Points, StatType::Assists, StatType::Rebounds];

    pub fn column(self) -> &'static str {
        match self {
            StatType::Points => "points",
            StatType::Assists => "assists",
            StatType::Rebounds => "rebounds",
        }
    }

    /// Model artifact family prefix; the lexicographically-latest file
    /// matching this prefix is the artifact in service.
    pub fn model_prefix(self) -> &'static str {
        match self {
            StatType::Points => "points_model_",
            StatType::Assists => "assists_model_",
            StatType::Rebounds => "rebounds_model_",
        }
    }

    /// Threshold convention for the under-rate aggregate.
    pub fn threshold(self) -> ThresholdKind {
        match self {
            StatType::Points => ThresholdKind::Midpoint,
            _ => ThresholdKind::LowBound,
        }
    }
}

impl FromStr for StatType {
    type Err = EngineError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "points" => Ok(StatType::Points),
            "assists" => Ok(StatType::Assists),
            "rebounds" => Ok(StatType::Rebounds),
            other => Err(EngineError::Configuration(format!(
                "stat_type must be one of points, assists, rebounds (got {other:?})"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdKind {
    /// (low bound + estimate) / 2
    Midpoint,
    /// low bound alone
    LowBound,
}

impl ThresholdKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ThresholdKind::Midpoint => "midpoint",
            ThresholdKind::LowBound => "low_bound",
        }
    }
}

/// Day selector for the live-prediction path, resolved against the
/// league-local calendar rather than the server's local date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaySelector {
    Today,
    Tomorrow,
    Yesterday,
}

impl FromStr for DaySelector {
    type Err = EngineError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "today" => Ok(DaySelector::Today),
            "tomorrow" => Ok(DaySelector::Tomorrow),
            "yesterday" => Ok(DaySelector::Yesterday),
            other => Err(EngineError::Configuration(format!(
                "day must be one of today, tomorrow, yesterday (got {other:?})"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConfidenceParams {
    pub default: f64,
    pub min: f64,
    pub max: f64,
    pub decay: f64,
    pub window: usize,
    pub over_penalty: f64,
    pub under_penalty: f64,
    pub band_low_pct: f64,
    pub band_high_pct: f64,
}

impl Default for ConfidenceParams {
    fn default() -> Self {
        Self {
            default: DEFAULT_CONFIDENCE_DEFAULT,
            min: DEFAULT_CONFIDENCE_MIN,
            max: DEFAULT_CONFIDENCE_MAX,
            decay: DEFAULT_CONFIDENCE_DECAY,
            window: DEFAULT_CONFIDENCE_WINDOW,
            over_penalty: DEFAULT_OVER_PENALTY,
            under_penalty: DEFAULT_UNDER_PENALTY,
            band_low_pct: DEFAULT_BAND_LOW_PCT,
            band_high_pct: DEFAULT_BAND_HIGH_PCT,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TrainingParams {
    pub validation_date_fraction: f64,
    pub min_train_dates: usize,
    /// 0 or 1 trains a single estimator; >1 trains an ensemble.
    pub ensemble_members: usize,
    pub ensemble_seed: u64,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            validation_date_fraction: DEFAULT_VALIDATION_DATE_FRACTION,
            min_train_dates: DEFAULT_MIN_TRAIN_DATES,
            ensemble_members: 1,
            ensemble_seed: 42,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BacktestParams {
    /// A row needs at least this many prior games for its player.
    pub min_games: usize,
    /// A date needs at least this many cumulative training rows.
    pub min_train_rows: usize,
    pub max_dates: Option<usize>,
}

impl Default for BacktestParams {
    fn default() -> Self {
        Self {
            min_games: DEFAULT_WALK_FORWARD_MIN_GAMES,
            min_train_rows: DEFAULT_MIN_TRAIN_ROWS,
            max_dates: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub confidence: ConfidenceParams,
    pub training: TrainingParams,
    pub backtest: BacktestParams,
    pub under_rate_window: usize,
    pub league_utc_offset_hours: i32,
    pub models_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            confidence: ConfidenceParams::default(),
            training: TrainingParams::default(),
            backtest: BacktestParams::default(),
            under_rate_window: DEFAULT_UNDER_RATE_WINDOW,
            league_utc_offset_hours: DEFAULT_LEAGUE_UTC_OFFSET_HOURS,
            models_dir: default_models_dir(),
        }
    }
}

impl EngineConfig {
    /// Build from environment variables, clamping everything to sane ranges.
    pub fn from_env() -> Self {
        let mut cfg = EngineConfig::default();

        cfg.confidence.default =
            env_f64("PROPCAST_CONFIDENCE_DEFAULT", cfg.confidence.default).clamp(0.0, 100.0);
        cfg.confidence.min =
            env_f64("PROPCAST_CONFIDENCE_MIN", cfg.confidence.min).clamp(0.0, 100.0);
        cfg.confidence.max = env_f64("PROPCAST_CONFIDENCE_MAX", cfg.confidence.max)
            .clamp(cfg.confidence.min, 100.0);
        cfg.confidence.decay =
            env_f64("PROPCAST_CONFIDENCE_DECAY", cfg.confidence.decay).clamp(0.0, 2.0);
        cfg.confidence.window =
            env_usize("PROPCAST_CONFIDENCE_WINDOW", cfg.confidence.window).clamp(1, 200);
        cfg.confidence.over_penalty =
            env_f64("PROPCAST_OVER_PENALTY", cfg.confidence.over_penalty).clamp(0.1, 10.0);
        cfg.confidence.under_penalty =
            env_f64("PROPCAST_UNDER_PENALTY", cfg.confidence.under_penalty).clamp(0.1, 10.0);

        cfg.training.validation_date_fraction = env_f64(
            "PROPCAST_VALIDATION_DATE_FRACTION",
            cfg.training.validation_date_fraction,
        )
        .clamp(0.05, 0.50);
        cfg.training.min_train_dates =
            env_usize("PROPCAST_MIN_TRAIN_DATES", cfg.training.min_train_dates).clamp(2, 1000);
        cfg.training.ensemble_members =
            env_usize("PROPCAST_ENSEMBLE_MEMBERS", cfg.training.ensemble_members).clamp(1, 32);

        cfg.backtest.min_games =
            env_usize("PROPCAST_WALK_FORWARD_MIN_GAMES", cfg.backtest.min_games).clamp(0, 82);
        cfg.backtest.min_train_rows =
            env_usize("PROPCAST_MIN_TRAIN_ROWS", cfg.backtest.min_train_rows).clamp(1, 100_000);

        cfg.under_rate_window =
            env_usize("PROPCAST_UNDER_RATE_WINDOW", cfg.under_rate_window).clamp(1, 200);
        cfg.league_utc_offset_hours = env_i32(
            "PROPCAST_LEAGUE_UTC_OFFSET_HOURS",
            cfg.league_utc_offset_hours,
        )
        .clamp(-12, 14);

        if let Ok(raw) = env::var("PROPCAST_MODELS_DIR")
            && !raw.trim().is_empty()
        {
            cfg.models_dir = PathBuf::from(raw.trim());
        }

        cfg
    }

    /// Calendar date on the league's clock at the given UTC instant.
    pub fn league_local_date(&self, now_utc: DateTime<Utc>) -> NaiveDate {
        let offset = FixedOffset::east_opt(self.league_utc_offset_hours * 3600)
            .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset"));
        now_utc.with_timezone(&offset).date_naive()
    }

    /// Resolve a day selector to a concrete league-local date.
    pub fn target_date(&self, day: DaySelector, now_utc: DateTime<Utc>) -> NaiveDate {
        let base = self.league_local_date(now_utc);
        match day {
            DaySelector::Today => base,
            DaySelector::Tomorrow => base + Duration::days(1),
            DaySelector::Yesterday => base - Duration::days(1),
        }
    }
}

pub fn app_cache_dir() -> Option<PathBuf> {
    if let Ok(base) = env::var("XDG_CACHE_HOME")
        && !base.trim().is_empty()
    {
        return Some(PathBuf::from(base).join(APP_CACHE_DIR));
    }
    let home = env::var("HOME").ok()?;
    if home.trim().is_empty() {
        return None;
    }
    Some(PathBuf::from(home).join(".cache").join(APP_CACHE_DIR))
}

pub fn default_models_dir() -> PathBuf {
    app_cache_dir()
        .map(|dir| dir.join("models"))
        .unwrap_or_else(|| PathBuf::from("models"))
}

pub fn default_db_path() -> Option<PathBuf> {
    app_cache_dir().map(|dir| dir.join("propcast.sqlite"))
}

fn env_f64(key: &str, default: f64) -> f64 {
    match env::var(key) {
        Ok(raw) => raw.trim().parse::<f64>().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    match env::var(key) {
        Ok(raw) => raw.trim().parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_i32(key: &str, default: i32) -> i32 {
    match env::var(key) {
        Ok(raw) => raw.trim().parse::<i32>().unwrap_or(default),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn stat_type_parse_rejects_unknown() {
        assert_eq!("points".parse::<StatType>().unwrap(), StatType::Points);
        assert_eq!(" Rebounds ".parse::<StatType>().unwrap(), StatType::Rebounds);
        assert!("threept".parse::<StatType>().is_err());
    }

    #[test]
    fn day_selector_parse_rejects_unknown() {
        assert_eq!("today".parse::<DaySelector>().unwrap(), DaySelector::Today);
        assert!("someday".parse::<DaySelector>().is_err());
    }

    #[test]
    fn league_local_date_rolls_back_across_midnight_utc() {
        let cfg = EngineConfig {
            league_utc_offset_hours: -5,
            ..EngineConfig::default()
        };
        // 02:30 UTC is still 21:30 the previous day on the league clock.
        let now = Utc.with_ymd_and_hms(2025, 1, 15, 2, 30, 0).unwrap();
        assert_eq!(
            cfg.league_local_date(now),
            NaiveDate::from_ymd_opt(2025, 1, 14).unwrap()
        );
        assert_eq!(
            cfg.target_date(DaySelector::Tomorrow, now),
            NaiveDate::from_ymd_opt(2025, 1, 15).unwrap()
        );
        assert_eq!(
            cfg.target_date(DaySelector::Yesterday, now),
            NaiveDate::from_ymd_opt(2025, 1, 13).unwrap()
        );
    }

    #[test]
    fn league_local_date_matches_utc_midday() {
        let cfg = EngineConfig {
            league_utc_offset_hours: -5,
            ..EngineConfig::default()
        };
        let now = Utc.with_ymd_and_hms(2025, 1, 15, 18, 0, 0).unwrap();
        assert_eq!(
            cfg.league_local_date(now),
            NaiveDate::from_ymd_opt(2025, 1, 15).unwrap()
        );
    }

    #[test]
    fn threshold_convention_per_stat() {
        assert_eq!(StatType::Points.threshold(), ThresholdKind::Midpoint);
        assert_eq!(StatType::Assists.threshold(), ThresholdKind::LowBound);
        assert_eq!(StatType::Rebounds.threshold(), ThresholdKind::LowBound);
    }
}
