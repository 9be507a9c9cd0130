use crate::prelude::{MergeError, MergeResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Looks `value` up among the display names of `all`; unknown names are
/// configuration errors.
fn parse_policy<T: Copy + fmt::Display>(value: &str, what: &str, all: &[T]) -> MergeResult<T> {
    let value = value.trim();
    all.iter()
        .copied()
        .find(|policy| policy.to_string() == value)
        .ok_or_else(|| {
            let names: Vec<String> = all.iter().map(T::to_string).collect();
            MergeError::InvalidConfiguration(format!(
                "unknown {} '{}' (expected one of: {})",
                what,
                value,
                names.join(", ")
            ))
        })
}

/// Which of two agreeing overlap samples survives into the merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicatePrecedence {
    #[default]
    PreferNewer,
    PreferHigherPrecision,
    PreferExplicitDatasetOrder,
}

impl DuplicatePrecedence {
    pub const ALL: [Self; 3] = [
        Self::PreferNewer,
        Self::PreferHigherPrecision,
        Self::PreferExplicitDatasetOrder,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PreferNewer => "prefer-newer",
            Self::PreferHigherPrecision => "prefer-higher-precision",
            Self::PreferExplicitDatasetOrder => "prefer-explicit-dataset-order",
        }
    }
}

impl fmt::Display for DuplicatePrecedence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DuplicatePrecedence {
    type Err = MergeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        parse_policy(value, "duplicate precedence policy", &Self::ALL)
    }
}

/// Fate of samples whose leveled residual exceeds the conflict tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    #[default]
    ExcludeBoth,
    AdmitFlagged,
}

impl ConflictPolicy {
    pub const ALL: [Self; 2] = [Self::ExcludeBoth, Self::AdmitFlagged];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExcludeBoth => "exclude-both",
            Self::AdmitFlagged => "admit-flagged",
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictPolicy {
    type Err = MergeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        parse_policy(value, "conflict policy", &Self::ALL)
    }
}

/// Shape of the per-dataset level correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LevelModel {
    #[default]
    Constant,
    Plane,
}

impl LevelModel {
    pub const ALL: [Self; 2] = [Self::Constant, Self::Plane];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Constant => "constant",
            Self::Plane => "plane",
        }
    }
}

impl fmt::Display for LevelModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LevelModel {
    type Err = MergeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        parse_policy(value, "level model", &Self::ALL)
    }
}

/// Location estimator applied to inlier overlap differences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LevelEstimator {
    #[default]
    Median,
    TrimmedMean,
}

impl LevelEstimator {
    pub const ALL: [Self; 2] = [Self::Median, Self::TrimmedMean];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Median => "median",
            Self::TrimmedMean => "trimmed-mean",
        }
    }
}

impl fmt::Display for LevelEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LevelEstimator {
    type Err = MergeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        parse_policy(value, "level estimator", &Self::ALL)
    }
}

/// What a per-dataset fatal error does to the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DatasetErrorPolicy {
    AbortAll,
    #[default]
    SkipAndContinue,
}

impl DatasetErrorPolicy {
    pub const ALL: [Self; 2] = [Self::AbortAll, Self::SkipAndContinue];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AbortAll => "abort-all",
            Self::SkipAndContinue => "skip-and-continue",
        }
    }
}

impl fmt::Display for DatasetErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasetErrorPolicy {
    type Err = MergeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        parse_policy(value, "dataset error policy", &Self::ALL)
    }
}

/// Line QC thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QcConfig {
    pub enabled: bool,
    /// Fourth-difference noise limit in nT.
    pub noise_threshold: f64,
    /// Un-admit noisy samples instead of only flagging them.
    pub reject_noisy: bool,
    pub diurnal_15s_threshold: f64,
    pub diurnal_60s_threshold: f64,
    /// Largest allowed distance (m) between flown elevation and the drape.
    pub drape_tolerance: f64,
    /// Out-of-drape runs shorter than this along-track length (m) are ignored.
    pub drape_min_length: f64,
}

impl Default for QcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            noise_threshold: 0.05,
            reject_noisy: false,
            diurnal_15s_threshold: 0.5,
            diurnal_60s_threshold: 3.0,
            drape_tolerance: 15.0,
            drape_min_length: 800.0,
        }
    }
}

/// Options recognized by the merge engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub working_projection: String,
    /// Pairing radius `d_max` in working-projection metres.
    pub overlap_tolerance_distance: f64,
    /// Outlier cut in robust sigmas.
    pub level_outlier_threshold: f64,
    /// Largest leveled residual (nT) for which two overlap samples agree.
    pub conflict_residual_tolerance: f64,
    pub duplicate_precedence_policy: DuplicatePrecedence,
    pub reference_dataset: Option<String>,
    pub conflict_policy: ConflictPolicy,
    pub suppress_duplicates: bool,
    pub level_model: LevelModel,
    pub level_estimator: LevelEstimator,
    pub trim_fraction: f64,
    pub min_segment_samples: usize,
    pub path_tolerance: f64,
    pub dataset_error_policy: DatasetErrorPolicy,
    /// Residual mean/std limit for accepting an overlap without review.
    /// Defaults to the conflict tolerance.
    pub review_residual_tolerance: Option<f64>,
    pub output_name: String,
    pub qc: QcConfig,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            working_projection: "EPSG:3338".to_string(),
            overlap_tolerance_distance: 25.0,
            level_outlier_threshold: 3.0,
            conflict_residual_tolerance: 5.0,
            duplicate_precedence_policy: DuplicatePrecedence::default(),
            reference_dataset: None,
            conflict_policy: ConflictPolicy::default(),
            suppress_duplicates: true,
            level_model: LevelModel::default(),
            level_estimator: LevelEstimator::default(),
            trim_fraction: 0.1,
            min_segment_samples: 3,
            path_tolerance: 5.0,
            dataset_error_policy: DatasetErrorPolicy::default(),
            review_residual_tolerance: None,
            output_name: "merged".to_string(),
            qc: QcConfig::default(),
        }
    }
}

impl MergeConfig {
    pub fn review_tolerance(&self) -> f64 {
        self.review_residual_tolerance
            .unwrap_or(self.conflict_residual_tolerance)
    }

    pub fn validate(&self) -> MergeResult<()> {
        if self.working_projection.trim().is_empty() {
            return Err(MergeError::InvalidConfiguration(
                "working_projection must not be empty".into(),
            ));
        }
        let positive = [
            ("overlap_tolerance_distance", self.overlap_tolerance_distance),
            ("level_outlier_threshold", self.level_outlier_threshold),
            ("conflict_residual_tolerance", self.conflict_residual_tolerance),
            ("path_tolerance", self.path_tolerance),
            ("review_residual_tolerance", self.review_tolerance()),
            ("qc.noise_threshold", self.qc.noise_threshold),
            ("qc.diurnal_15s_threshold", self.qc.diurnal_15s_threshold),
            ("qc.diurnal_60s_threshold", self.qc.diurnal_60s_threshold),
            ("qc.drape_tolerance", self.qc.drape_tolerance),
            ("qc.drape_min_length", self.qc.drape_min_length),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(MergeError::InvalidConfiguration(format!(
                    "{} must be a positive number, got {}",
                    name, value
                )));
            }
        }
        if !(0.0..0.5).contains(&self.trim_fraction) {
            return Err(MergeError::InvalidConfiguration(format!(
                "trim_fraction must lie in [0, 0.5), got {}",
                self.trim_fraction
            )));
        }
        if matches!(&self.reference_dataset, Some(name) if name.trim().is_empty()) {
            return Err(MergeError::InvalidConfiguration(
                "reference_dataset must not be blank".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(MergeConfig::default().validate().is_ok());
    }

    #[test]
    fn unknown_precedence_is_invalid_configuration() {
        let err = "prefer-loudest".parse::<DuplicatePrecedence>().unwrap_err();
        assert!(matches!(err, MergeError::InvalidConfiguration(_)));
        assert_eq!(
            "prefer-higher-precision".parse::<DuplicatePrecedence>(),
            Ok(DuplicatePrecedence::PreferHigherPrecision)
        );
    }

    #[test]
    fn policy_names_round_trip_through_display() {
        for policy in ConflictPolicy::ALL {
            assert_eq!(policy.as_str().parse::<ConflictPolicy>(), Ok(policy));
        }
        for estimator in LevelEstimator::ALL {
            assert_eq!(estimator.to_string().parse::<LevelEstimator>(), Ok(estimator));
        }
        let err = " median ".parse::<LevelModel>().unwrap_err().to_string();
        assert!(err.contains("constant, plane"), "{}", err);
    }

    #[test]
    fn non_positive_tolerance_is_rejected() {
        let config = MergeConfig {
            overlap_tolerance_distance: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(MergeError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn drape_limits_must_be_positive() {
        let mut config = MergeConfig::default();
        config.qc.drape_min_length = 0.0;
        assert!(config.validate().is_err());
        let config: MergeConfig = serde_json::from_str(r#"{"qc":{"drape_tolerance":20.0}}"#).unwrap();
        assert_eq!(config.qc.drape_tolerance, 20.0);
        assert_eq!(config.qc.drape_min_length, 800.0);
    }

    #[test]
    fn trim_fraction_must_be_below_half() {
        let config = MergeConfig {
            trim_fraction: 0.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn review_tolerance_falls_back_to_conflict_tolerance() {
        let config = MergeConfig::default();
        assert_eq!(config.review_tolerance(), config.conflict_residual_tolerance);
    }

    #[test]
    fn deserializes_kebab_case_policies() {
        let json = r#"{"duplicate_precedence_policy":"prefer-explicit-dataset-order","level_model":"plane"}"#;
        let config: MergeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            config.duplicate_precedence_policy,
            DuplicatePrecedence::PreferExplicitDatasetOrder
        );
        assert_eq!(config.level_model, LevelModel::Plane);
        assert_eq!(config.overlap_tolerance_distance, 25.0);
    }
}
