use crate::config::ConfidenceParams;

/// Calibrated interval around a point prediction.
///
/// Bounds are `None` when no residual history exists: a band computed from
/// zero samples would be fiction, and downstream aggregates must be able to
/// exclude such rows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictionInterval {
    pub p10: Option<f64>,
    pub p50: Option<f64>,
    pub p90: Option<f64>,
    /// 0-100 score; decays with recent weighted error.
    pub confidence: f64,
}

/// Maps recent per-player residuals (or ensemble spread) to an interval.
///
/// Residuals are signed `predicted - actual`, newest first; only the most
/// recent `window` entries count.
#[derive(Debug, Clone, Copy)]
pub struct ConfidenceModel {
    params: ConfidenceParams,
}

impl ConfidenceModel {
    pub fn new(params: ConfidenceParams) -> Self {
        Self { params }
    }

    /// History-based banding: band width from the magnitude of recent
    /// misses, clamped around their 80th percentile so one blowout game
    /// cannot explode the interval.
    pub fn from_history(&self, prediction: f64, residuals: &[f64]) -> PredictionInterval {
        let recent = &residuals[..residuals.len().min(self.params.window)];
        if recent.is_empty() {
            // No realized misses to band from; the bounds stay undefined.
            return PredictionInterval {
                p10: None,
                p50: None,
                p90: None,
                confidence: self.params.default,
            };
        }

        let abs: Vec<f64> = recent.iter().map(|r| r.abs()).collect();
        let mean_abs = abs.iter().sum::<f64>() / abs.len() as f64;
        let q80 = percentile(&abs, 0.80);
        let band = mean_abs.clamp(0.5 * q80, (2.0 * q80).max(0.5 * q80));

        PredictionInterval {
            p10: Some((prediction - band).max(0.0)),
            p50: Some(prediction),
            p90: Some(prediction + band),
            confidence: self.score(recent),
        }
    }

    /// Ensemble banding: the interval is read off the member spread, the
    /// score still comes from realized residuals.
    pub fn from_ensemble(&self, members: &[f64], residuals: &[f64]) -> PredictionInterval {
        if members.is_empty() {
            return self.from_history(0.0, residuals);
        }
        let mut sorted = members.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let p50 = percentile(&sorted, 0.50);
        let mut p10 = percentile(&sorted, self.params.band_low_pct).max(0.0);
        let mut p90 = percentile(&sorted, self.params.band_high_pct);
        p10 = p10.min(p50);
        p90 = p90.max(p50);

        let recent = &residuals[..residuals.len().min(self.params.window)];
        let confidence = if recent.is_empty() {
            self.params.default
        } else {
            self.score(recent)
        };

        PredictionInterval {
            p10: Some(p10),
            p50: Some(p50),
            p90: Some(p90),
            confidence,
        }
    }

    /// Exponential decay on the penalty-weighted mean miss. Overpredictions
    /// (positive residual) cost more than underpredictions of the same size.
    fn score(&self, residuals: &[f64]) -> f64 {
        let weighted = residuals
            .iter()
            .map(|r| {
                let penalty = if *r > 0.0 {
                    self.params.over_penalty
                } else {
                    self.params.under_penalty
                };
                penalty * r.abs()
            })
            .sum::<f64>()
            / residuals.len() as f64;
        (self.params.max * (-self.params.decay * weighted).exp())
            .clamp(self.params.min, self.params.max)
    }
}

/// Linear-interpolated percentile over pre-sorted or unsorted values.
pub fn percentile(values: &[f64], pct: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = pct.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = rank - lo as f64;
        sorted[lo] * (1.0 - frac) + sorted[hi] * frac
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn model() -> ConfidenceModel {
        ConfidenceModel::new(ConfidenceParams::default())
    }

    #[test]
    fn empty_history_leaves_band_undefined() {
        let interval = model().from_history(22.0, &[]);
        assert!(interval.p10.is_none());
        assert!(interval.p50.is_none());
        assert!(interval.p90.is_none());
        assert_relative_eq!(interval.confidence, 50.0);
    }

    #[test]
    fn band_clamped_around_p80_of_misses() {
        // Misses 2,2,2,2,20: mean 5.6, p80 = 5.6 by interpolation between
        // 2 and 20 at rank 3.2.
        let residuals = [2.0, -2.0, 2.0, -2.0, 20.0];
        let interval = model().from_history(30.0, &residuals);
        let abs = [2.0, 2.0, 2.0, 2.0, 20.0];
        let q80 = percentile(&abs, 0.80);
        let band = interval.p90.unwrap() - 30.0;
        assert!(band >= 0.5 * q80 - 1e-9);
        assert!(band <= 2.0 * q80 + 1e-9);
        assert_relative_eq!(interval.p50.unwrap(), 30.0);
        assert_relative_eq!(interval.p10.unwrap(), 30.0 - band, epsilon = 1e-9);
    }

    #[test]
    fn lower_bound_never_negative() {
        let interval = model().from_history(1.0, &[8.0, -9.0, 10.0]);
        assert!(interval.p10.unwrap() >= 0.0);
    }

    #[test]
    fn confidence_decays_with_error() {
        let small = model().from_history(20.0, &[1.0, -1.0, 0.5]);
        let large = model().from_history(20.0, &[9.0, -8.0, 10.0]);
        assert!(small.confidence > large.confidence);
        assert!(large.confidence >= ConfidenceParams::default().min);
        assert!(small.confidence <= ConfidenceParams::default().max);
    }

    #[test]
    fn overprediction_penalized_harder() {
        let over = model().from_history(20.0, &[4.0, 4.0, 4.0]);
        let under = model().from_history(20.0, &[-4.0, -4.0, -4.0]);
        assert!(over.confidence < under.confidence);
    }

    #[test]
    fn window_ignores_stale_residuals() {
        let recent: Vec<f64> = vec![1.0; 10];
        let mut padded = recent.clone();
        padded.extend(vec![50.0; 5]);
        let a = model().from_history(20.0, &recent);
        let b = model().from_history(20.0, &padded);
        assert_relative_eq!(a.confidence, b.confidence);
        assert_relative_eq!(a.p90.unwrap(), b.p90.unwrap());
    }

    #[test]
    fn ensemble_interval_from_member_spread() {
        let members = [18.0, 20.0, 22.0, 24.0, 26.0];
        let interval = model().from_ensemble(&members, &[]);
        let (p10, p50, p90) = (
            interval.p10.unwrap(),
            interval.p50.unwrap(),
            interval.p90.unwrap(),
        );
        assert_relative_eq!(p50, 22.0);
        assert!(p10 >= 18.0 && p10 <= p50);
        assert!(p90 <= 26.0 && p90 >= p50);
        assert_relative_eq!(interval.confidence, 50.0);
    }

    #[test]
    fn percentile_interpolates() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert_relative_eq!(percentile(&values, 0.0), 1.0);
        assert_relative_eq!(percentile(&values, 1.0), 4.0);
        assert_relative_eq!(percentile(&values, 0.5), 2.5);
    }
}
