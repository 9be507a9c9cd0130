/// Scale factor turning a median absolute deviation into a Gaussian-consistent sigma.
pub const MAD_TO_SIGMA: f64 = 1.4826;

pub struct StatsHelper;

impl StatsHelper {
    pub fn mean(samples: &[f64]) -> Option<f64> {
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }

    /// Population standard deviation.
    pub fn std_dev(samples: &[f64]) -> Option<f64> {
        let mean = Self::mean(samples)?;
        let var = samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / samples.len() as f64;
        Some(var.sqrt())
    }

    pub fn median(samples: &[f64]) -> Option<f64> {
        if samples.is_empty() {
            return None;
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            Some((sorted[mid - 1] + sorted[mid]) / 2.0)
        } else {
            Some(sorted[mid])
        }
    }

    /// Robust sigma estimate: 1.4826 × median(|v − center|).
    pub fn mad_scale(samples: &[f64], center: f64) -> f64 {
        let deviations: Vec<f64> = samples.iter().map(|v| (v - center).abs()).collect();
        Self::median(&deviations).map_or(0.0, |mad| mad * MAD_TO_SIGMA)
    }

    /// Mean after discarding `fraction` of the values from each tail.
    pub fn trimmed_mean(samples: &[f64], fraction: f64) -> Option<f64> {
        if samples.is_empty() {
            return None;
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);
        let cut = ((sorted.len() as f64) * fraction.clamp(0.0, 0.5)).floor() as usize;
        let kept = &sorted[cut..sorted.len() - cut];
        if kept.is_empty() {
            return Self::median(&sorted);
        }
        Self::mean(kept)
    }
}
