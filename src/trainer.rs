use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{NaiveDate, Utc};
use rayon::prelude::*;
use tracing::{info, warn};

use crate::config::{StatType, TrainingParams};
use crate::error::EngineError;
use crate::estimator::{
    Estimator, ModelArtifact, ModelMeta, RidgeConfig, fit_ridge, mae, median, rmse, save_artifact,
};
use crate::features::{MINUTES_FEATURES, stat_features};
use crate::table::FeatureTable;

pub const MINUTES_MODEL_PREFIX: &str = "minutes_model_";

#[derive(Debug)]
pub struct TrainOutcome {
    pub path: PathBuf,
    pub artifact: ModelArtifact,
}

/// Fits and persists date-stamped model artifacts.
///
/// The split is chronological over distinct game dates, never row-shuffled:
/// the trailing fraction of dates is held out for validation so reported
/// errors reflect forecasting, not interpolation.
pub struct ModelTrainer {
    params: TrainingParams,
}

impl ModelTrainer {
    pub fn new(params: TrainingParams) -> Self {
        Self { params }
    }

    /// First date belonging to the validation block.
    fn split_date(&self, table: &FeatureTable) -> Result<NaiveDate> {
        let dates = table.distinct_dates();
        if dates.len() < self.params.min_train_dates {
            return Err(EngineError::MinTrainingDates {
                have: dates.len(),
                need: self.params.min_train_dates,
            }
            .into());
        }
        let held_out = ((dates.len() as f64 * self.params.validation_date_fraction).round()
            as usize)
            .clamp(1, dates.len() - 1);
        Ok(dates[dates.len() - held_out])
    }

    /// Fit the auxiliary minutes projection, substitute its output into the
    /// `pred_minutes` column for every row it can score, and persist the
    /// artifact. Must run before `train_stat` so primary fits see the same
    /// minutes signal serving will use.
    pub fn train_minutes(
        &self,
        table: &mut FeatureTable,
        models_dir: &Path,
        asof: NaiveDate,
    ) -> Result<TrainOutcome> {
        let split = self.split_date(table)?;
        let (x_tr, y_tr, _) =
            table.training_matrix(&MINUTES_FEATURES, "minutes", |r| r.game_date < split)?;
        let (x_val, y_val, _) =
            table.training_matrix(&MINUTES_FEATURES, "minutes", |r| r.game_date >= split)?;
        if x_tr.is_empty() {
            return Err(anyhow!("no complete rows to fit minutes projection"));
        }

        let model = fit_ridge(RidgeConfig::default(), &x_tr, &y_tr, &x_val, &y_val, None)?;

        // Score every row the projection can handle; the rest keep the
        // trailing-average proxy already in the column.
        let (x_all, _, kept) = table.training_matrix(&MINUTES_FEATURES, "minutes", |_| true)?;
        let pred_col = table.col("pred_minutes")?;
        for (row_idx, features) in kept.iter().zip(&x_all) {
            table.set_cell(*row_idx, pred_col, Some(model.predict(features).max(0.0)));
        }

        let preds: Vec<f64> = x_val.iter().map(|r| model.predict(r)).collect();
        let meta = ModelMeta {
            target: "minutes".to_string(),
            version: format!("{MINUTES_MODEL_PREFIX}{}", asof.format("%Y%m%d")),
            generated_at: Utc::now().to_rfc3339(),
            train_rows: x_tr.len(),
            val_rows: x_val.len(),
            val_mae: mae(&preds, &y_val),
            val_rmse: rmse(&preds, &y_val),
            feature_names: MINUTES_FEATURES.iter().map(|s| s.to_string()).collect(),
        };
        info!(
            stat = "minutes",
            train_rows = meta.train_rows,
            val_rows = meta.val_rows,
            val_mae = meta.val_mae,
            "fitted minutes projection"
        );
        let artifact = ModelArtifact::Single { model, meta };
        let path = save_artifact(models_dir, MINUTES_MODEL_PREFIX, asof, &artifact)?;
        Ok(TrainOutcome { path, artifact })
    }

    /// Fit (and persist) the primary estimator for one stat. With
    /// `ensemble_members > 1` this fits bootstrap members in parallel and
    /// stores them all.
    pub fn train_stat(
        &self,
        table: &FeatureTable,
        stat: StatType,
        models_dir: &Path,
        asof: NaiveDate,
    ) -> Result<TrainOutcome> {
        let split = self.split_date(table)?;
        let features = stat_features(stat);
        let (x_tr, y_tr, _) =
            table.training_matrix(features, stat.column(), |r| r.game_date < split)?;
        let (x_val, y_val, _) =
            table.training_matrix(features, stat.column(), |r| r.game_date >= split)?;
        if x_tr.is_empty() {
            return Err(anyhow!(
                "no complete training rows for {}",
                stat.column()
            ));
        }
        if x_val.is_empty() {
            warn!(stat = stat.column(), "empty validation block, metrics fall back to train");
        }

        let artifact = if self.params.ensemble_members > 1 {
            let members: Vec<_> = (0..self.params.ensemble_members)
                .into_par_iter()
                .map(|i| {
                    fit_ridge(
                        RidgeConfig::default(),
                        &x_tr,
                        &y_tr,
                        &x_val,
                        &y_val,
                        Some(self.params.ensemble_seed.wrapping_add(i as u64)),
                    )
                })
                .collect::<Result<Vec<_>>>()?;
            let meta = self.meta_for(stat, asof, &x_tr, &x_val, &y_val, |x| {
                median(members.iter().map(|m| m.predict(x)).collect())
            });
            ModelArtifact::Ensemble { members, meta }
        } else {
            let model = fit_ridge(RidgeConfig::default(), &x_tr, &y_tr, &x_val, &y_val, None)?;
            let meta = self.meta_for(stat, asof, &x_tr, &x_val, &y_val, |x| model.predict(x));
            ModelArtifact::Single { model, meta }
        };

        info!(
            stat = stat.column(),
            train_rows = artifact.meta().train_rows,
            val_rows = artifact.meta().val_rows,
            val_mae = artifact.meta().val_mae,
            val_rmse = artifact.meta().val_rmse,
            "fitted stat model"
        );
        let path = save_artifact(models_dir, stat.model_prefix(), asof, &artifact)
            .with_context(|| format!("persist {} artifact", stat.column()))?;
        Ok(TrainOutcome { path, artifact })
    }

    fn meta_for(
        &self,
        stat: StatType,
        asof: NaiveDate,
        x_tr: &[Vec<f64>],
        x_val: &[Vec<f64>],
        y_val: &[f64],
        predict: impl Fn(&[f64]) -> f64,
    ) -> ModelMeta {
        let preds: Vec<f64> = x_val.iter().map(|r| predict(r)).collect();
        ModelMeta {
            target: stat.column().to_string(),
            version: format!("{}{}", stat.model_prefix(), asof.format("%Y%m%d")),
            generated_at: Utc::now().to_rfc3339(),
            train_rows: x_tr.len(),
            val_rows: x_val.len(),
            val_mae: mae(&preds, y_val),
            val_rmse: rmse(&preds, y_val),
            feature_names: stat_features(stat).iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureBuilder;
    use crate::store::GameRecord;

    fn day(d: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 1).unwrap() + chrono::Duration::days(d)
    }

    fn synthetic_games() -> Vec<GameRecord> {
        let mut games = Vec::new();
        for player in 1..=4i64 {
            for g in 0..30i64 {
                let base = 10.0 + player as f64 * 3.0;
                games.push(GameRecord {
                    player_id: player,
                    game_id: format!("p{player}g{g}"),
                    game_date: day(g),
                    matchup: if g % 2 == 0 {
                        "BOS vs. LAL".into()
                    } else {
                        "BOS @ LAL".into()
                    },
                    team_abbreviation: "BOS".into(),
                    minutes: 28.0 + (g % 5) as f64,
                    points: base + (g % 7) as f64 - 3.0,
                    assists: 4.0 + (g % 3) as f64,
                    rebounds: 6.0 + (g % 4) as f64,
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
        games
    }

    fn models_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("propcast_trainer_{tag}_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn too_few_dates_is_fatal() {
        let games: Vec<GameRecord> = synthetic_games()
            .into_iter()
            .filter(|g| g.game_date < day(5))
            .collect();
        let mut table = FeatureBuilder::new(games, Vec::new(), Vec::new())
            .training_table()
            .unwrap();
        let trainer = ModelTrainer::new(TrainingParams::default());
        let err = trainer
            .train_minutes(&mut table, &models_dir("few"), day(30))
            .unwrap_err();
        let engine = err.downcast_ref::<EngineError>().unwrap();
        assert!(matches!(engine, EngineError::MinTrainingDates { .. }));
    }

    #[test]
    fn minutes_training_substitutes_pred_minutes() {
        let mut table = FeatureBuilder::new(synthetic_games(), Vec::new(), Vec::new())
            .training_table()
            .unwrap();
        let dir = models_dir("minutes");
        let trainer = ModelTrainer::new(TrainingParams::default());
        let outcome = trainer.train_minutes(&mut table, &dir, day(30)).unwrap();
        assert!(outcome.path.exists());
        assert_eq!(outcome.artifact.meta().target, "minutes");

        // Substituted values differ from the raw trailing-average proxy for
        // at least some rows.
        let pred_col = table.col("pred_minutes").unwrap();
        let proxy_col = table.col("avg_minutes_last5").unwrap();
        let changed = table
            .rows()
            .iter()
            .filter(|r| {
                if let (Some(p), Some(proxy)) = (r.value(pred_col), r.value(proxy_col)) {
                    (p - proxy).abs() > 1e-9
                } else {
                    false
                }
            })
            .count();
        assert!(changed > 0);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn stat_training_writes_dated_artifact() {
        let mut table = FeatureBuilder::new(synthetic_games(), Vec::new(), Vec::new())
            .training_table()
            .unwrap();
        let dir = models_dir("stat");
        let trainer = ModelTrainer::new(TrainingParams::default());
        trainer.train_minutes(&mut table, &dir, day(30)).unwrap();
        let outcome = trainer
            .train_stat(&table, StatType::Points, &dir, day(30))
            .unwrap();
        assert!(outcome.path.ends_with("points_model_20250131.json"));
        assert!(outcome.artifact.meta().train_rows > 0);
        assert!(outcome.artifact.meta().val_rows > 0);
        assert!(matches!(outcome.artifact, ModelArtifact::Single { .. }));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn ensemble_training_stores_all_members() {
        let mut table = FeatureBuilder::new(synthetic_games(), Vec::new(), Vec::new())
            .training_table()
            .unwrap();
        let dir = models_dir("ensemble");
        let trainer = ModelTrainer::new(TrainingParams {
            ensemble_members: 4,
            ..TrainingParams::default()
        });
        trainer.train_minutes(&mut table, &dir, day(30)).unwrap();
        let outcome = trainer
            .train_stat(&table, StatType::Rebounds, &dir, day(30))
            .unwrap();
        match outcome.artifact {
            ModelArtifact::Ensemble { members, .. } => assert_eq!(members.len(), 4),
            ModelArtifact::Single { .. } => panic!("expected ensemble artifact"),
        }
        let _ = std::fs::remove_dir_all(&dir);
    }
}
