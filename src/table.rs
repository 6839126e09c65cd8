use std::collections::HashMap;

use chrono::NaiveDate;

use crate::error::EngineError;

/// In-memory feature table with a fixed, validated column set.
///
/// Cells are `Option<f64>` so "undefined" (not enough history, join gap) is
/// distinct from zero. Column lookups fail loudly with `MissingColumn`
/// instead of silently inventing data.
#[derive(Debug, Clone)]
pub struct FeatureTable {
    columns: Vec<String>,
    index: HashMap<String, usize>,
    rows: Vec<TableRow>,
}

#[derive(Debug, Clone)]
pub struct TableRow {
    pub player_id: i64,
    pub game_id: String,
    pub game_date: NaiveDate,
    values: Vec<Option<f64>>,
}

impl TableRow {
    pub fn value(&self, idx: usize) -> Option<f64> {
        self.values.get(idx).copied().flatten()
    }
}

impl FeatureTable {
    pub fn new<S: AsRef<str>>(columns: &[S]) -> Self {
        let columns: Vec<String> = columns.iter().map(|c| c.as_ref().to_string()).collect();
        let index = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.clone(), i))
            .collect();
        Self {
            columns,
            index,
            rows: Vec::new(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[TableRow] {
        &self.rows
    }

    pub fn col(&self, name: &str) -> Result<usize, EngineError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| EngineError::MissingColumn {
                name: name.to_string(),
            })
    }

    /// Resolve several columns at once; the first absent name fails.
    pub fn cols(&self, names: &[&str]) -> Result<Vec<usize>, EngineError> {
        names.iter().map(|n| self.col(n)).collect()
    }

    pub fn row_buffer(&self) -> Vec<Option<f64>> {
        vec![None; self.columns.len()]
    }

    pub fn push_row(
        &mut self,
        player_id: i64,
        game_id: String,
        game_date: NaiveDate,
        values: Vec<Option<f64>>,
    ) {
        debug_assert_eq!(values.len(), self.columns.len());
        self.rows.push(TableRow {
            player_id,
            game_id,
            game_date,
            values,
        });
    }

    pub fn set_cell(&mut self, row: usize, col: usize, value: Option<f64>) {
        if let Some(r) = self.rows.get_mut(row)
            && let Some(slot) = r.values.get_mut(col)
        {
            *slot = value;
        }
    }

    pub fn sort_by_date(&mut self) {
        self.rows.sort_by(|a, b| {
            a.game_date
                .cmp(&b.game_date)
                .then_with(|| a.player_id.cmp(&b.player_id))
                .then_with(|| a.game_id.cmp(&b.game_id))
        });
    }

    pub fn distinct_dates(&self) -> Vec<NaiveDate> {
        let mut dates: Vec<NaiveDate> = self.rows.iter().map(|r| r.game_date).collect();
        dates.sort();
        dates.dedup();
        dates
    }

    /// Training selection: rows where every feature and the target are
    /// defined. Rows lacking history are dropped, never zero-filled, so
    /// early-career noise does not bias fits. Returns (X, y, kept row
    /// indices).
    pub fn training_matrix(
        &self,
        features: &[&str],
        target: &str,
        keep: impl Fn(&TableRow) -> bool,
    ) -> Result<(Vec<Vec<f64>>, Vec<f64>, Vec<usize>), EngineError> {
        let feature_idx = self.cols(features)?;
        let target_idx = self.col(target)?;

        let mut x = Vec::new();
        let mut y = Vec::new();
        let mut kept = Vec::new();

        'rows: for (i, row) in self.rows.iter().enumerate() {
            if !keep(row) {
                continue;
            }
            let Some(target_val) = row.value(target_idx) else {
                continue;
            };
            let mut vec = Vec::with_capacity(feature_idx.len());
            for &idx in &feature_idx {
                match row.value(idx) {
                    Some(v) if v.is_finite() => vec.push(v),
                    _ => continue 'rows,
                }
            }
            x.push(vec);
            y.push(target_val);
            kept.push(i);
        }

        Ok((x, y, kept))
    }

    /// Serve-time vector: undefined features fall back to a neutral zero.
    /// Only valid at prediction time; training goes through
    /// `training_matrix`.
    pub fn serve_vector(&self, row: usize, feature_idx: &[usize]) -> Vec<f64> {
        let Some(r) = self.rows.get(row) else {
            return vec![0.0; feature_idx.len()];
        };
        feature_idx
            .iter()
            .map(|&idx| r.value(idx).filter(|v| v.is_finite()).unwrap_or(0.0))
            .collect()
    }
}
