use crate::generator::profile::SurveyProfile;
use anyhow::Context;
use magcore::config::{
    ConflictPolicy, DatasetErrorPolicy, DuplicatePrecedence, LevelEstimator, LevelModel, QcConfig,
};
use magcore::{Dataset, MergeConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

/// Flight-number filter for one input, written `{ select: [lo, hi] }` or
/// `{ deselect: [lo, hi] }` with both ends inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlightFilter {
    Select([u32; 2]),
    Deselect([u32; 2]),
}

impl FlightFilter {
    fn range(&self) -> RangeInclusive<u32> {
        let [lo, hi] = match self {
            Self::Select(bounds) | Self::Deselect(bounds) => *bounds,
        };
        lo..=hi
    }

    pub fn apply(&self, dataset: &Dataset) -> anyhow::Result<Dataset> {
        let range = self.range();
        anyhow::ensure!(
            range.start() <= range.end(),
            "flight range {}..={} for {} is empty",
            range.start(),
            range.end(),
            dataset.name
        );
        Ok(match self {
            Self::Select(_) => dataset.select_flights(range),
            Self::Deselect(_) => dataset.deselect_flights(range),
        })
    }
}

/// Workflow file as written by operators. Policies stay plain strings here
/// and are checked when converted into a [`MergeConfig`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub working_projection: String,
    pub overlap_tolerance: f64,
    pub level_outlier_threshold: f64,
    pub conflict_tolerance: f64,
    pub review_tolerance: Option<f64>,
    pub precedence: String,
    pub conflict_policy: String,
    pub reference: Option<String>,
    pub suppress_duplicates: bool,
    pub level_model: String,
    pub level_estimator: String,
    pub trim_fraction: f64,
    pub min_segment_samples: usize,
    pub path_tolerance: f64,
    pub on_dataset_error: String,
    pub output_name: String,
    pub qc: QcConfig,
    /// Canned layout from the generator templates.
    pub scenario: Option<String>,
    pub surveys: Vec<SurveyProfile>,
    /// Datasets serialized as JSON by an upstream adapter.
    pub inputs: Vec<PathBuf>,
    /// Per-dataset flight filters, keyed by dataset name.
    pub flights: BTreeMap<String, FlightFilter>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        let merge = MergeConfig::default();
        Self {
            working_projection: merge.working_projection,
            overlap_tolerance: merge.overlap_tolerance_distance,
            level_outlier_threshold: merge.level_outlier_threshold,
            conflict_tolerance: merge.conflict_residual_tolerance,
            review_tolerance: merge.review_residual_tolerance,
            precedence: merge.duplicate_precedence_policy.to_string(),
            conflict_policy: merge.conflict_policy.to_string(),
            reference: merge.reference_dataset,
            suppress_duplicates: merge.suppress_duplicates,
            level_model: merge.level_model.to_string(),
            level_estimator: merge.level_estimator.to_string(),
            trim_fraction: merge.trim_fraction,
            min_segment_samples: merge.min_segment_samples,
            path_tolerance: merge.path_tolerance,
            on_dataset_error: merge.dataset_error_policy.to_string(),
            output_name: merge.output_name,
            qc: merge.qc,
            scenario: None,
            surveys: Vec::new(),
            inputs: Vec::new(),
            flights: BTreeMap::new(),
        }
    }
}

impl WorkflowConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref)
            .with_context(|| format!("reading workflow config {}", path_ref.display()))?;
        let config: WorkflowConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing workflow config {}", path_ref.display()))?;
        Ok(config)
    }

    pub fn from_scenario(scenario: &str) -> Self {
        Self {
            scenario: Some(scenario.to_string()),
            ..Default::default()
        }
    }

    pub fn to_merge_config(&self) -> anyhow::Result<MergeConfig> {
        let config = MergeConfig {
            working_projection: self.working_projection.clone(),
            overlap_tolerance_distance: self.overlap_tolerance,
            level_outlier_threshold: self.level_outlier_threshold,
            conflict_residual_tolerance: self.conflict_tolerance,
            duplicate_precedence_policy: self
                .precedence
                .parse::<DuplicatePrecedence>()
                .context("precedence")?,
            reference_dataset: self.reference.clone(),
            conflict_policy: self
                .conflict_policy
                .parse::<ConflictPolicy>()
                .context("conflict_policy")?,
            suppress_duplicates: self.suppress_duplicates,
            level_model: self.level_model.parse::<LevelModel>().context("level_model")?,
            level_estimator: self
                .level_estimator
                .parse::<LevelEstimator>()
                .context("level_estimator")?,
            trim_fraction: self.trim_fraction,
            min_segment_samples: self.min_segment_samples,
            path_tolerance: self.path_tolerance,
            dataset_error_policy: self
                .on_dataset_error
                .parse::<DatasetErrorPolicy>()
                .context("on_dataset_error")?,
            review_residual_tolerance: self.review_tolerance,
            output_name: self.output_name.clone(),
            qc: self.qc.clone(),
        };
        config.validate().context("validating merge configuration")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use magcore::MergeError;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn default_workflow_produces_default_merge_config() {
        let cfg = WorkflowConfig::default();
        assert_eq!(cfg.to_merge_config().unwrap(), MergeConfig::default());
    }

    #[test]
    fn config_load_reads_yaml() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(
            b"precedence: prefer-higher-precision\nreference: north\noverlap_tolerance: 40\nsurveys:\n  - name: north\n    line_count: 3\n",
        )
        .unwrap();
        let path = temp.into_temp_path();
        let cfg = WorkflowConfig::load(&path).unwrap();
        assert_eq!(cfg.surveys.len(), 1);
        assert_eq!(cfg.surveys[0].line_count, 3);

        let merge = cfg.to_merge_config().unwrap();
        assert_eq!(
            merge.duplicate_precedence_policy,
            DuplicatePrecedence::PreferHigherPrecision
        );
        assert_eq!(merge.reference_dataset.as_deref(), Some("north"));
        assert_eq!(merge.overlap_tolerance_distance, 40.0);
    }

    #[test]
    fn unknown_policy_string_is_invalid_configuration() {
        let cfg = WorkflowConfig {
            precedence: "prefer-louder".into(),
            ..Default::default()
        };
        let err = cfg.to_merge_config().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MergeError>(),
            Some(MergeError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn flight_filters_parse_from_yaml() {
        let yaml = "flights:\n  north: { select: [2, 3] }\n  south:\n    deselect: [1, 1]\n";
        let cfg: WorkflowConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.flights.get("north"), Some(&FlightFilter::Select([2, 3])));
        assert_eq!(cfg.flights.get("south"), Some(&FlightFilter::Deselect([1, 1])));
    }

    #[test]
    fn reversed_flight_range_is_rejected() {
        let dataset = Dataset::new("north", magcore::DatasetMetadata::new("EPSG:3338"), Vec::new());
        assert!(FlightFilter::Select([4, 2]).apply(&dataset).is_err());
        assert!(FlightFilter::Deselect([2, 2]).apply(&dataset).is_ok());
    }

    #[test]
    fn missing_file_reports_path() {
        let err = WorkflowConfig::load("/nonexistent/workflow.yaml").unwrap_err();
        assert!(format!("{:#}", err).contains("/nonexistent/workflow.yaml"));
    }
}
