use anyhow::Result;
use chrono::NaiveDate;
use rusqlite::Connection;
use tracing::info;

use crate::config::{StatType, ThresholdKind};
use crate::store::{self, GradedPrediction, UnderRateRecord};

/// Rolls graded predictions up into a per-player under rate: how often the
/// player has recently landed below the prediction's conservative threshold.
///
/// Points use the midpoint of (low bound, estimate); assists and rebounds
/// use the low bound alone because their intervals are tighter in absolute
/// terms.
pub struct UnderRateAggregator {
    window: usize,
}

impl UnderRateAggregator {
    pub fn new(window: usize) -> Self {
        Self { window }
    }

    /// `graded` must be ordered per player by date descending, the order
    /// `load_graded_predictions` returns. Rows without a usable threshold are
    /// dropped before the window is applied, so they never crowd usable rows
    /// out of it; players with no usable rows produce no record. The as-of
    /// date is the latest graded date inside each player's window.
    pub fn compute(&self, stat: StatType, graded: &[GradedPrediction]) -> Vec<UnderRateRecord> {
        let mut out = Vec::new();
        let mut start = 0usize;
        while start < graded.len() {
            let player_id = graded[start].player_id;
            let mut end = start;
            while end < graded.len() && graded[end].player_id == player_id {
                end += 1;
            }

            let eligible: Vec<(NaiveDate, f64, f64)> = graded[start..end]
                .iter()
                .filter_map(|row| {
                    threshold_for(stat, row).map(|t| (row.game_date, t, row.actual_value))
                })
                .collect();
            let recent = &eligible[..eligible.len().min(self.window)];
            if let Some(as_of) = recent.iter().map(|(date, _, _)| *date).max() {
                let under_count = recent
                    .iter()
                    .filter(|(_, threshold, actual)| actual < threshold)
                    .count();
                out.push(UnderRateRecord {
                    player_id,
                    stat_type: stat.column().to_string(),
                    window_n: self.window,
                    sample_size: recent.len(),
                    under_count,
                    under_rate: under_count as f64 / recent.len() as f64,
                    threshold_type: stat.threshold().as_str().to_string(),
                    as_of_date: as_of,
                });
            }
            start = end;
        }
        out
    }
}

fn threshold_for(stat: StatType, row: &GradedPrediction) -> Option<f64> {
    let p10 = row.pred_p10?;
    match stat.threshold() {
        ThresholdKind::Midpoint => Some((p10 + row.pred_value) / 2.0),
        ThresholdKind::LowBound => Some(p10),
    }
}

/// Grade outstanding predictions and refresh the under-rate table for every
/// stat in one pass.
pub fn refresh_under_rates(conn: &mut Connection, window: usize) -> Result<usize> {
    let aggregator = UnderRateAggregator::new(window);
    let mut written = 0usize;
    for stat in StatType::ALL {
        let graded = store::grade_predictions(conn, stat)?;
        let rows = store::load_graded_predictions(conn, stat)?;
        let records = aggregator.compute(stat, &rows);
        written += store::upsert_under_rates(conn, &records)?;
        info!(
            stat = stat.column(),
            newly_graded = graded,
            players = records.len(),
            "refreshed under rates"
        );
    }
    Ok(written)
}
