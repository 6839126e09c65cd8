use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::NaiveDate;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

const L2_REG: f64 = 0.06;
const MAX_ITERS: usize = 2200;
const LR_START: f64 = 0.08;
const IMPROVEMENT_EPS: f64 = 1e-6;
const INIT_JITTER: f64 = 0.01;

/// Anything that can score a serve-time feature vector.
pub trait Estimator {
    fn predict(&self, features: &[f64]) -> f64;
}

/// Ridge regression fitted by gradient descent on standardized features.
///
/// The model stores its own normalization stats so a serve-time vector is
/// scored exactly the way training data was.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RidgeModel {
    pub feature_means: Vec<f64>,
    pub feature_stds: Vec<f64>,
    pub coeffs: Vec<f64>,
    pub intercept: f64,
}

impl Estimator for RidgeModel {
    fn predict(&self, features: &[f64]) -> f64 {
        let mut z = self.intercept;
        for (i, coeff) in self.coeffs.iter().enumerate() {
            let x = features.get(i).copied().unwrap_or(0.0);
            z += coeff * standardized(x, self.feature_means[i], self.feature_stds[i]);
        }
        z
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RidgeConfig {
    pub l2: f64,
    pub max_iters: usize,
    pub lr_start: f64,
}

impl Default for RidgeConfig {
    fn default() -> Self {
        Self {
            l2: L2_REG,
            max_iters: MAX_ITERS,
            lr_start: LR_START,
        }
    }
}

/// Fit one ridge member. `seed` controls the init jitter and the bootstrap
/// resample, so a fixed seed gives a bit-identical model.
pub fn fit_ridge(
    config: RidgeConfig,
    x_train: &[Vec<f64>],
    y_train: &[f64],
    x_val: &[Vec<f64>],
    y_val: &[f64],
    seed: Option<u64>,
) -> Result<RidgeModel> {
    if x_train.is_empty() || x_train.len() != y_train.len() {
        return Err(anyhow!(
            "bad training shape: {} rows, {} targets",
            x_train.len(),
            y_train.len()
        ));
    }
    let n_features = x_train[0].len();
    if n_features == 0 {
        return Err(anyhow!("no features to fit"));
    }

    // Bootstrap-resample for ensemble members; plain pass-through otherwise.
    let (rows_x, rows_y): (Vec<&[f64]>, Vec<f64>) = match seed {
        Some(seed) => {
            let mut rng = StdRng::seed_from_u64(seed);
            let n = x_train.len();
            let mut xs = Vec::with_capacity(n);
            let mut ys = Vec::with_capacity(n);
            for _ in 0..n {
                let pick = rng.gen_range(0..n);
                xs.push(x_train[pick].as_slice());
                ys.push(y_train[pick]);
            }
            (xs, ys)
        }
        None => (
            x_train.iter().map(|r| r.as_slice()).collect(),
            y_train.to_vec(),
        ),
    };

    let (means, stds) = feature_norm_stats(&rows_x, n_features);
    let y_mean = rows_y.iter().sum::<f64>() / rows_y.len() as f64;

    let std_rows: Vec<Vec<f64>> = rows_x
        .iter()
        .map(|row| {
            (0..n_features)
                .map(|i| standardized(row[i], means[i], stds[i]))
                .collect()
        })
        .collect();
    let centered_y: Vec<f64> = rows_y.iter().map(|y| y - y_mean).collect();

    let val_rows: Vec<Vec<f64>> = x_val
        .iter()
        .map(|row| {
            (0..n_features)
                .map(|i| standardized(row[i], means[i], stds[i]))
                .collect()
        })
        .collect();
    let centered_val: Vec<f64> = y_val.iter().map(|y| y - y_mean).collect();

    let mut coeffs = vec![0.0; n_features];
    if let Some(seed) = seed {
        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(0x9e37_79b9));
        for c in &mut coeffs {
            *c = rng.gen_range(-INIT_JITTER..INIT_JITTER);
        }
    }

    let mut best = coeffs.clone();
    let mut best_val = sq_loss(&coeffs, &val_rows, &centered_val)
        .unwrap_or_else(|| sq_loss(&coeffs, &std_rows, &centered_y).unwrap_or(f64::INFINITY));
    let mut no_improve = 0usize;

    for iter in 0..config.max_iters {
        let mut grad = vec![0.0; n_features];
        for (row, &y) in std_rows.iter().zip(&centered_y) {
            let z = dot(&coeffs, row);
            let dz = z - y;
            for (g, &x) in grad.iter_mut().zip(row) {
                *g += dz * x;
            }
        }

        let lr = config.lr_start / (1.0 + (iter as f64 * 0.003));
        let n = std_rows.len() as f64;
        for (c, g) in coeffs.iter_mut().zip(&grad) {
            *c -= lr * (g / n + config.l2 * *c);
        }

        if iter % 20 == 0 || iter + 1 == config.max_iters {
            let val_ll = sq_loss(&coeffs, &val_rows, &centered_val)
                .unwrap_or_else(|| sq_loss(&coeffs, &std_rows, &centered_y).unwrap_or(f64::INFINITY));
            if val_ll + IMPROVEMENT_EPS < best_val {
                best_val = val_ll;
                best.copy_from_slice(&coeffs);
                no_improve = 0;
            } else {
                no_improve = no_improve.saturating_add(1);
                if no_improve >= 20 {
                    break;
                }
            }
        }
    }

    Ok(RidgeModel {
        feature_means: means,
        feature_stds: stds,
        coeffs: best,
        intercept: y_mean,
    })
}

fn feature_norm_stats(rows: &[&[f64]], n_features: usize) -> (Vec<f64>, Vec<f64>) {
    let mut mean = vec![0.0; n_features];
    let mut var = vec![0.0; n_features];
    let n = rows.len() as f64;

    for row in rows {
        for i in 0..n_features {
            mean[i] += row[i];
        }
    }
    for v in &mut mean {
        *v /= n;
    }
    for row in rows {
        for i in 0..n_features {
            let d = row[i] - mean[i];
            var[i] += d * d;
        }
    }
    for v in &mut var {
        *v = (*v / n).sqrt().max(1e-6);
    }
    (mean, var)
}

fn standardized(x: f64, mean: f64, std: f64) -> f64 {
    (x - mean) / std.max(1e-6)
}

fn sq_loss(coeffs: &[f64], rows: &[Vec<f64>], targets: &[f64]) -> Option<f64> {
    if rows.is_empty() {
        return None;
    }
    let mut sum = 0.0;
    for (row, &y) in rows.iter().zip(targets) {
        let d = dot(coeffs, row) - y;
        sum += d * d;
    }
    Some(sum / rows.len() as f64)
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn mae(preds: &[f64], actuals: &[f64]) -> f64 {
    if preds.is_empty() {
        return 0.0;
    }
    preds
        .iter()
        .zip(actuals)
        .map(|(p, a)| (p - a).abs())
        .sum::<f64>()
        / preds.len() as f64
}

pub fn rmse(preds: &[f64], actuals: &[f64]) -> f64 {
    if preds.is_empty() {
        return 0.0;
    }
    let ms = preds
        .iter()
        .zip(actuals)
        .map(|(p, a)| (p - a) * (p - a))
        .sum::<f64>()
        / preds.len() as f64;
    ms.sqrt()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMeta {
    pub target: String,
    pub version: String,
    pub generated_at: String,
    pub train_rows: usize,
    pub val_rows: usize,
    pub val_mae: f64,
    pub val_rmse: f64,
    pub feature_names: Vec<String>,
}

/// Persisted model shape, tagged so loaders never sniff the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelArtifact {
    Single {
        model: RidgeModel,
        meta: ModelMeta,
    },
    Ensemble {
        members: Vec<RidgeModel>,
        meta: ModelMeta,
    },
}

impl ModelArtifact {
    pub fn meta(&self) -> &ModelMeta {
        match self {
            ModelArtifact::Single { meta, .. } => meta,
            ModelArtifact::Ensemble { meta, .. } => meta,
        }
    }

    /// Point prediction: the single model's output, or the ensemble median.
    pub fn predict(&self, features: &[f64]) -> f64 {
        match self {
            ModelArtifact::Single { model, .. } => model.predict(features),
            ModelArtifact::Ensemble { members, .. } => {
                let preds = members.iter().map(|m| m.predict(features)).collect();
                median(preds)
            }
        }
    }

    /// Per-member outputs when an ensemble backs the artifact.
    pub fn member_predictions(&self, features: &[f64]) -> Option<Vec<f64>> {
        match self {
            ModelArtifact::Single { .. } => None,
            ModelArtifact::Ensemble { members, .. } => {
                Some(members.iter().map(|m| m.predict(features)).collect())
            }
        }
    }
}

pub fn median(mut values: Vec<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        values[mid]
    } else {
        (values[mid - 1] + values[mid]) / 2.0
    }
}

pub fn artifact_file_name(prefix: &str, date: NaiveDate) -> String {
    format!("{prefix}{}.json", date.format("%Y%m%d"))
}

/// Write the artifact as `{prefix}{YYYYMMDD}.json`, tmp-then-rename so a
/// concurrent loader never sees a partial file.
pub fn save_artifact(
    dir: &Path,
    prefix: &str,
    date: NaiveDate,
    artifact: &ModelArtifact,
) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let path = dir.join(artifact_file_name(prefix, date));
    let raw = serde_json::to_string_pretty(artifact).context("serialize model artifact")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, raw).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, &path).with_context(|| format!("rename {}", path.display()))?;
    Ok(path)
}

/// Load the lexicographically latest artifact matching `prefix`; with
/// date-stamped names that is also the chronologically newest.
pub fn latest_artifact(dir: &Path, prefix: &str) -> Result<(PathBuf, ModelArtifact)> {
    let mut best: Option<PathBuf> = None;
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !name.starts_with(prefix) || !name.ends_with(".json") {
                continue;
            }
            let path = entry.path();
            if best.as_ref().is_none_or(|b| path > *b) {
                best = Some(path);
            }
        }
    }
    let path = best.ok_or_else(|| EngineError::MissingArtifact {
        prefix: prefix.to_string(),
        dir: dir.display().to_string(),
    })?;
    let raw = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let artifact =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    Ok((path, artifact))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn linear_data(n: usize) -> (Vec<Vec<f64>>, Vec<f64>) {
        // y = 3 + 2*a - b, no noise.
        let mut x = Vec::new();
        let mut y = Vec::new();
        for i in 0..n {
            let a = (i % 13) as f64;
            let b = ((i * 7) % 11) as f64;
            x.push(vec![a, b]);
            y.push(3.0 + 2.0 * a - b);
        }
        (x, y)
    }

    #[test]
    fn fit_recovers_linear_relationship() {
        let (x, y) = linear_data(200);
        let model = fit_ridge(RidgeConfig::default(), &x, &y, &x, &y, None).unwrap();
        let pred = model.predict(&[5.0, 2.0]);
        assert_relative_eq!(pred, 11.0, epsilon = 0.5);
    }

    #[test]
    fn fixed_seed_is_deterministic() {
        let (x, y) = linear_data(120);
        let a = fit_ridge(RidgeConfig::default(), &x, &y, &x, &y, Some(7)).unwrap();
        let b = fit_ridge(RidgeConfig::default(), &x, &y, &x, &y, Some(7)).unwrap();
        assert_eq!(a.coeffs, b.coeffs);
        assert_eq!(a.intercept, b.intercept);
    }

    #[test]
    fn median_handles_even_and_odd() {
        assert_relative_eq!(median(vec![3.0, 1.0, 2.0]), 2.0);
        assert_relative_eq!(median(vec![4.0, 1.0, 3.0, 2.0]), 2.5);
    }

    #[test]
    fn artifact_roundtrip_keeps_tag() {
        let model = RidgeModel {
            feature_means: vec![0.0],
            feature_stds: vec![1.0],
            coeffs: vec![2.0],
            intercept: 1.0,
        };
        let artifact = ModelArtifact::Single {
            model,
            meta: ModelMeta {
                target: "points".into(),
                version: "points_model".into(),
                generated_at: "2025-01-01T00:00:00Z".into(),
                train_rows: 10,
                val_rows: 2,
                val_mae: 1.0,
                val_rmse: 1.5,
                feature_names: vec!["a".into()],
            },
        };
        let raw = serde_json::to_string(&artifact).unwrap();
        assert!(raw.contains("\"kind\":\"single\""));
        let back: ModelArtifact = serde_json::from_str(&raw).unwrap();
        assert_relative_eq!(back.predict(&[1.0]), 3.0);
    }

    #[test]
    fn latest_artifact_prefers_newest_stamp() {
        let dir = std::env::temp_dir().join(format!("propcast_est_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        let model = RidgeModel {
            feature_means: vec![0.0],
            feature_stds: vec![1.0],
            coeffs: vec![1.0],
            intercept: 0.0,
        };
        let meta = ModelMeta {
            target: "points".into(),
            version: "points_model".into(),
            generated_at: String::new(),
            train_rows: 1,
            val_rows: 1,
            val_mae: 0.0,
            val_rmse: 0.0,
            feature_names: vec!["a".into()],
        };
        for day in [3u32, 14, 9] {
            let artifact = ModelArtifact::Single {
                model: model.clone(),
                meta: ModelMeta {
                    generated_at: format!("day-{day}"),
                    ..meta.clone()
                },
            };
            save_artifact(
                &dir,
                "points_model_",
                NaiveDate::from_ymd_opt(2025, 1, day).unwrap(),
                &artifact,
            )
            .unwrap();
        }
        let (path, artifact) = latest_artifact(&dir, "points_model_").unwrap();
        assert!(path.ends_with("points_model_20250114.json"));
        assert_eq!(artifact.meta().generated_at, "day-14");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_artifact_is_fatal() {
        let dir = std::env::temp_dir().join("propcast_est_missing");
        let _ = fs::remove_dir_all(&dir);
        let err = latest_artifact(&dir, "points_model_").unwrap_err();
        let engine = err.downcast_ref::<EngineError>().unwrap();
        assert!(matches!(engine, EngineError::MissingArtifact { .. }));
    }
}
