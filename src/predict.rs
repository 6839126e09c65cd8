use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use rusqlite::Connection;
use tracing::{info, warn};

use crate::cache::{TtlCache, cache_key};
use crate::config::{DaySelector, EngineConfig, StatType};
use crate::confidence::ConfidenceModel;
use crate::estimator::{ModelArtifact, latest_artifact};
use crate::features::{FeatureBuilder, MINUTES_FEATURES, ServeCandidate, stat_features};
use crate::store::{self, PredictionRecord, ScheduledGame};
use crate::table::FeatureTable;
use crate::trainer::MINUTES_MODEL_PREFIX;

const ARTIFACT_CACHE_TTL_SECS: u64 = 300;
const ARTIFACT_CACHE_CAPACITY: usize = 8;

/// Serves predictions for scheduled games out of the latest persisted
/// artifacts.
///
/// Candidates come from the rolling snapshot of each scheduled team; a
/// candidate without prior history is skipped, a missing artifact fails the
/// whole run.
pub struct LivePredictor {
    config: EngineConfig,
    confidence: ConfidenceModel,
    artifacts: TtlCache<Arc<ModelArtifact>>,
}

impl LivePredictor {
    pub fn new(config: EngineConfig) -> Self {
        let confidence = ConfidenceModel::new(config.confidence);
        Self {
            config,
            confidence,
            artifacts: TtlCache::new(
                Duration::from_secs(ARTIFACT_CACHE_TTL_SECS),
                ARTIFACT_CACHE_CAPACITY,
            ),
        }
    }

    /// Resolve the day selector on the league clock and predict that slate.
    pub fn run(
        &mut self,
        conn: &mut Connection,
        day: DaySelector,
        stats: &[StatType],
    ) -> Result<Vec<PredictionRecord>> {
        let target = self.config.target_date(day, Utc::now());
        self.run_for_date(conn, target, stats)
    }

    pub fn run_for_date(
        &mut self,
        conn: &mut Connection,
        target: NaiveDate,
        stats: &[StatType],
    ) -> Result<Vec<PredictionRecord>> {
        let schedule = store::load_schedule_on(conn, target)?;
        if schedule.is_empty() {
            info!(%target, "no scheduled games");
            return Ok(Vec::new());
        }

        let games = store::load_games(conn)?;
        let team_games = store::load_team_games(conn)?;
        let lineups = store::load_lineups(conn)?;
        let builder = FeatureBuilder::new(games, team_games, lineups);

        let candidates = self.collect_candidates(conn, &schedule, target)?;
        if candidates.is_empty() {
            info!(%target, "no snapshot candidates for scheduled teams");
            return Ok(Vec::new());
        }

        let mut table = FeatureTable::new(FeatureBuilder::table_columns());
        let mut served: Vec<(usize, ServeCandidate)> = Vec::new();
        for candidate in candidates {
            match builder.serve_row(&mut table, &candidate) {
                Ok(row) => served.push((row, candidate)),
                Err(err) if err.is_recoverable() => {
                    warn!(player_id = candidate.player_id, %err, "skipping candidate");
                }
                Err(err) => return Err(err.into()),
            }
        }

        // Substitute the minutes projection before any stat model scores.
        let minutes_artifact = self.artifact(MINUTES_MODEL_PREFIX)?;
        let minutes_idx = table.cols(&MINUTES_FEATURES)?;
        let pred_minutes_col = table.col("pred_minutes")?;
        for (row, _) in &served {
            let x = table.serve_vector(*row, &minutes_idx);
            let projected = minutes_artifact.predict(&x).max(0.0);
            table.set_cell(*row, pred_minutes_col, Some(projected));
        }

        let prediction_date = self.config.league_local_date(Utc::now());
        let mut out = Vec::new();
        for stat in stats {
            let artifact = self.artifact(stat.model_prefix())?;
            let feature_idx = table.cols(stat_features(*stat))?;
            for (row, candidate) in &served {
                let x = table.serve_vector(*row, &feature_idx);
                let predicted = artifact.predict(&x).max(0.0);
                let residuals = store::load_recent_residuals(
                    conn,
                    *stat,
                    candidate.player_id,
                    self.config.confidence.window,
                )?;
                let interval = match artifact.member_predictions(&x) {
                    Some(members) => self.confidence.from_ensemble(&members, &residuals),
                    None => self.confidence.from_history(predicted, &residuals),
                };
                out.push(PredictionRecord {
                    player_id: candidate.player_id,
                    stat_type: stat.column().to_string(),
                    game_id: candidate.game_id.clone(),
                    game_date: Some(target),
                    prediction_date: Some(prediction_date),
                    pred_value: predicted,
                    pred_p10: interval.p10,
                    pred_p50: interval.p50,
                    pred_p90: interval.p90,
                    confidence: Some(interval.confidence),
                    model_version: Some(artifact.meta().version.clone()),
                    actual_value: None,
                    abs_error: None,
                });
            }
        }

        store::upsert_predictions(conn, &out)?;
        info!(
            %target,
            games = schedule.len(),
            players = served.len(),
            predictions = out.len(),
            "stored live predictions"
        );
        Ok(out)
    }

    /// Snapshot players of both sides, with side-specific matchup strings so
    /// home/away and opponent parse out per player.
    fn collect_candidates(
        &self,
        conn: &Connection,
        schedule: &[ScheduledGame],
        target: NaiveDate,
    ) -> Result<Vec<ServeCandidate>> {
        let mut out = Vec::new();
        for game in schedule {
            let home_matchup = format!("{} vs. {}", game.home_team_abbr, game.away_team_abbr);
            let away_matchup = format!("{} @ {}", game.away_team_abbr, game.home_team_abbr);
            for (team, matchup) in [
                (&game.home_team_abbr, &home_matchup),
                (&game.away_team_abbr, &away_matchup),
            ] {
                for row in store::load_snapshot_for_team(conn, team)? {
                    out.push(ServeCandidate {
                        player_id: row.player_id,
                        game_id: game.game_id.clone(),
                        game_date: target,
                        matchup: matchup.clone(),
                        team_abbreviation: team.clone(),
                    });
                }
            }
        }
        Ok(out)
    }

    fn artifact(&mut self, prefix: &str) -> Result<Arc<ModelArtifact>> {
        let dir = self.config.models_dir.clone();
        let key = cache_key("latest_artifact", &[prefix, &dir.display().to_string()]);
        if let Some(cached) = self.artifacts.get(&key) {
            return Ok(cached.clone());
        }
        let (path, artifact) =
            latest_artifact(&dir, prefix).with_context(|| format!("load artifact {prefix}"))?;
        info!(path = %path.display(), "loaded model artifact");
        let arc = Arc::new(artifact);
        self.artifacts.put(key, arc.clone());
        Ok(arc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrainingParams;
    use crate::snapshot::refresh_snapshot;
    use crate::store::{GameRecord, open_in_memory, upsert_games, upsert_schedule};
    use crate::trainer::ModelTrainer;
    use std::path::PathBuf;

    fn day(d: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 1).unwrap() + chrono::Duration::days(d)
    }

    fn seed_games(conn: &mut Connection) {
        let mut rows = Vec::new();
        for (player, team, matchup_home) in [
            (1i64, "BOS", true),
            (2, "BOS", true),
            (3, "LAL", false),
            (4, "LAL", false),
        ] {
            for g in 0..25i64 {
                let matchup = if matchup_home {
                    "BOS vs. LAL".to_string()
                } else {
                    "LAL @ BOS".to_string()
                };
                rows.push(GameRecord {
                    player_id: player,
                    game_id: format!("h{g}"),
                    game_date: day(g),
                    matchup,
                    team_abbreviation: team.into(),
                    minutes: 26.0 + (g % 6) as f64,
                    points: 10.0 + player as f64 * 2.0 + (g % 5) as f64,
                    assists: 3.0 + (g % 3) as f64,
                    rebounds: 5.0 + (g % 4) as f64,
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
        upsert_games(conn, &rows).unwrap();
    }

    fn train_all(conn: &Connection, dir: &PathBuf) {
        let games = store::load_games(conn).unwrap();
        let mut table = FeatureBuilder::new(games, Vec::new(), Vec::new())
            .training_table()
            .unwrap();
        let trainer = ModelTrainer::new(TrainingParams::default());
        trainer.train_minutes(&mut table, dir, day(25)).unwrap();
        for stat in StatType::ALL {
            trainer.train_stat(&table, stat, dir, day(25)).unwrap();
        }
    }

    fn test_config(dir: PathBuf) -> EngineConfig {
        EngineConfig {
            models_dir: dir,
            ..EngineConfig::default()
        }
    }

    fn seed_graded_points_history(conn: &mut Connection, player_id: i64) {
        let records: Vec<PredictionRecord> = (0..3i64)
            .map(|g| PredictionRecord {
                player_id,
                stat_type: "points".into(),
                game_id: format!("h{g}"),
                game_date: Some(day(g)),
                prediction_date: Some(day(g)),
                pred_value: 14.0,
                pred_p10: None,
                pred_p50: None,
                pred_p90: None,
                confidence: None,
                model_version: Some("test".into()),
                actual_value: Some(12.0 + g as f64),
                abs_error: Some((14.0 - (12.0 + g as f64)).abs()),
            })
            .collect();
        store::upsert_predictions(conn, &records).unwrap();
    }

    #[test]
    fn predicts_full_slate_and_upserts_logs() {
        let mut conn = open_in_memory().unwrap();
        seed_games(&mut conn);
        refresh_snapshot(&mut conn).unwrap();
        upsert_schedule(
            &mut conn,
            &[ScheduledGame {
                game_id: "next1".into(),
                game_date: day(30),
                matchup: "BOS vs. LAL".into(),
                home_team_abbr: "BOS".into(),
                away_team_abbr: "LAL".into(),
            }],
        )
        .unwrap();
        // Player 1 has graded misses on record; everyone else starts cold.
        seed_graded_points_history(&mut conn, 1);

        let dir = std::env::temp_dir().join(format!("propcast_live_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        train_all(&conn, &dir);

        let mut predictor = LivePredictor::new(test_config(dir.clone()));
        let out = predictor
            .run_for_date(&mut conn, day(30), &StatType::ALL)
            .unwrap();
        // 4 players x 3 stats.
        assert_eq!(out.len(), 12);
        for rec in &out {
            assert!(rec.pred_value >= 0.0);
            assert_eq!(rec.game_id, "next1");
            assert!(rec.model_version.as_deref().unwrap().contains("model_"));
            if rec.player_id == 1 && rec.stat_type == "points" {
                // Residual history exists, so the band is defined and ordered.
                assert!(rec.pred_p10.unwrap() <= rec.pred_p50.unwrap());
                assert!(rec.pred_p50.unwrap() <= rec.pred_p90.unwrap());
            } else {
                // No graded history: bounds stay unset, confidence defaults.
                assert!(rec.pred_p10.is_none());
                assert!(rec.pred_p50.is_none());
                assert!(rec.pred_p90.is_none());
                assert_eq!(rec.confidence, Some(50.0));
            }
        }

        let stored: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM prediction_logs WHERE game_id = 'next1'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(stored, 12);

        // Re-running upserts in place instead of duplicating.
        predictor
            .run_for_date(&mut conn, day(30), &StatType::ALL)
            .unwrap();
        let stored: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM prediction_logs WHERE game_id = 'next1'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(stored, 12);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn candidate_without_history_is_skipped() {
        let mut conn = open_in_memory().unwrap();
        seed_games(&mut conn);
        refresh_snapshot(&mut conn).unwrap();
        // Phantom snapshot row with no game history behind it.
        store::upsert_snapshot_rows(
            &mut conn,
            &[store::SnapshotRow {
                player_id: 777,
                team_abbreviation: "BOS".into(),
                last_game_date: day(20),
                games_played: 5,
                avg_points_last5: 10.0,
                avg_assists_last5: 3.0,
                avg_rebounds_last5: 4.0,
                avg_minutes_last5: 20.0,
            }],
        )
        .unwrap();
        upsert_schedule(
            &mut conn,
            &[ScheduledGame {
                game_id: "next1".into(),
                game_date: day(30),
                matchup: "BOS vs. LAL".into(),
                home_team_abbr: "BOS".into(),
                away_team_abbr: "LAL".into(),
            }],
        )
        .unwrap();

        let dir = std::env::temp_dir().join(format!("propcast_skip_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        train_all(&conn, &dir);

        let mut predictor = LivePredictor::new(test_config(dir.clone()));
        let out = predictor
            .run_for_date(&mut conn, day(30), &[StatType::Points])
            .unwrap();
        assert_eq!(out.len(), 4);
        assert!(out.iter().all(|r| r.player_id != 777));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_artifact_fails_the_run() {
        let mut conn = open_in_memory().unwrap();
        seed_games(&mut conn);
        refresh_snapshot(&mut conn).unwrap();
        upsert_schedule(
            &mut conn,
            &[ScheduledGame {
                game_id: "next1".into(),
                game_date: day(30),
                matchup: "BOS vs. LAL".into(),
                home_team_abbr: "BOS".into(),
                away_team_abbr: "LAL".into(),
            }],
        )
        .unwrap();

        let dir = std::env::temp_dir().join("propcast_no_models");
        let _ = std::fs::remove_dir_all(&dir);
        let mut predictor = LivePredictor::new(test_config(dir));
        let err = predictor
            .run_for_date(&mut conn, day(30), &[StatType::Points])
            .unwrap_err();
        assert!(err.chain().any(|e| e.to_string().contains("artifact")));
    }

    #[test]
    fn empty_schedule_returns_empty() {
        let mut conn = open_in_memory().unwrap();
        let mut predictor = LivePredictor::new(test_config(PathBuf::from("/nonexistent")));
        let out = predictor
            .run_for_date(&mut conn, day(30), &StatType::ALL)
            .unwrap();
        assert!(out.is_empty());
    }
}
