use std::collections::HashMap;

use anyhow::Result;
use chrono::NaiveDate;
use tracing::debug;

use crate::config::{BacktestParams, ConfidenceParams, StatType};
use crate::confidence::{ConfidenceModel, PredictionInterval};
use crate::estimator::{Estimator, RidgeConfig, fit_ridge};
use crate::features::stat_features;
use crate::table::FeatureTable;

pub fn walkforward_version(stat: StatType) -> String {
    format!("walkforward_{}", stat.column())
}

#[derive(Debug, Clone)]
pub struct BacktestPrediction {
    pub player_id: i64,
    pub game_id: String,
    pub game_date: NaiveDate,
    pub predicted: f64,
    pub actual: f64,
    pub interval: PredictionInterval,
}

#[derive(Debug)]
pub struct BacktestReport {
    pub predictions: Vec<BacktestPrediction>,
    pub dates_processed: usize,
    pub dates_skipped: usize,
    pub mae: f64,
}

/// Replays history date by date with a fresh fit per date.
///
/// For each distinct game date D (ascending) the estimator is fitted on rows
/// strictly before D and scored on rows at D. Confidence for a row at D
/// consults only residuals realized before D; D's own residuals join the
/// per-player history after every prediction for D has been emitted.
pub struct WalkForwardBacktester {
    params: BacktestParams,
    confidence: ConfidenceModel,
}

impl WalkForwardBacktester {
    pub fn new(params: BacktestParams, confidence: ConfidenceParams) -> Self {
        Self {
            params,
            confidence: ConfidenceModel::new(confidence),
        }
    }

    pub fn run(&self, table: &FeatureTable, stat: StatType) -> Result<BacktestReport> {
        let features = stat_features(stat);
        let feature_idx = table.cols(features)?;
        let target_idx = table.col(stat.column())?;
        let games_idx = table.col("games_played_season")?;

        // Newest-first signed residuals per player.
        let mut history: HashMap<i64, Vec<f64>> = HashMap::new();
        let mut predictions = Vec::new();
        let mut dates_processed = 0usize;
        let mut dates_skipped = 0usize;

        for date in table.distinct_dates() {
            if let Some(cap) = self.params.max_dates
                && dates_processed >= cap
            {
                break;
            }

            let candidates: Vec<usize> = table
                .rows()
                .iter()
                .enumerate()
                .filter(|(_, r)| {
                    r.game_date == date
                        && r.value(target_idx).is_some()
                        && r.value(games_idx).unwrap_or(0.0) >= self.params.min_games as f64
                })
                .map(|(i, _)| i)
                .collect();
            if candidates.is_empty() {
                dates_skipped += 1;
                continue;
            }

            let (x_tr, y_tr, _) =
                table.training_matrix(features, stat.column(), |r| r.game_date < date)?;
            if x_tr.len() < self.params.min_train_rows {
                dates_skipped += 1;
                continue;
            }

            let model = fit_ridge(RidgeConfig::default(), &x_tr, &y_tr, &[], &[], None)?;

            let mut realized: Vec<(i64, f64)> = Vec::with_capacity(candidates.len());
            for &row_idx in &candidates {
                let row = &table.rows()[row_idx];
                let x = table.serve_vector(row_idx, &feature_idx);
                let predicted = model.predict(&x).max(0.0);
                let actual = row.value(target_idx).expect("candidate has target");

                let empty = Vec::new();
                let residuals = history.get(&row.player_id).unwrap_or(&empty);
                let interval = self.confidence.from_history(predicted, residuals);

                realized.push((row.player_id, predicted - actual));
                predictions.push(BacktestPrediction {
                    player_id: row.player_id,
                    game_id: row.game_id.clone(),
                    game_date: row.game_date,
                    predicted,
                    actual,
                    interval,
                });
            }

            // Update after use: today's misses only inform tomorrow.
            for (player_id, residual) in realized {
                history.entry(player_id).or_default().insert(0, residual);
            }

            dates_processed += 1;
            debug!(
                stat = stat.column(),
                %date,
                train_rows = x_tr.len(),
                scored = candidates.len(),
                "walk-forward date done"
            );
        }

        let mae = if predictions.is_empty() {
            0.0
        } else {
            predictions
                .iter()
                .map(|p| (p.predicted - p.actual).abs())
                .sum::<f64>()
                / predictions.len() as f64
        };

        Ok(BacktestReport {
            predictions,
            dates_processed,
            dates_skipped,
            mae,
        })
    }
}
