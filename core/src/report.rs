use crate::math::StatsHelper;
use crate::prelude::{MergeError, MergeResult};
use crate::processing::level::{DatasetLevel, UnleveledReason};
use crate::processing::qc::LineQcSummary;
use crate::telemetry::StageMetric;
use serde::{Deserialize, Serialize};

/// Count, mean and population standard deviation of a set of differences.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResidualStats {
    pub count: usize,
    pub mean: f64,
    pub std_dev: f64,
}

impl ResidualStats {
    pub fn from_values(values: &[f64]) -> Self {
        Self {
            count: values.len(),
            mean: StatsHelper::mean(values).unwrap_or(0.0),
            std_dev: StatsHelper::std_dev(values).unwrap_or(0.0),
        }
    }
}

/// Diagnostics for one overlapping dataset pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlapSummary {
    pub dataset_a: String,
    pub dataset_b: String,
    pub pair_count: usize,
    /// `B − A` before leveling.
    pub pre_level: ResidualStats,
    /// `B − A` after leveling.
    pub residual: ResidualStats,
    pub conflicts: usize,
    pub duplicates_suppressed: usize,
    /// False when the overlap needs manual review.
    pub accepted: bool,
}

/// Expected survey irregularities, recorded instead of raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "condition", rename_all = "kebab-case")]
pub enum ReportedCondition {
    NoOverlapDetected {
        dataset_a: String,
        dataset_b: String,
    },
    UnleveledDataset {
        dataset: String,
        reason: UnleveledReason,
    },
    ConflictUnresolved {
        dataset_a: String,
        dataset_b: String,
        pairs: usize,
    },
    DatasetSkipped {
        dataset: String,
        reason: String,
    },
}

impl ReportedCondition {
    pub fn label(&self) -> &'static str {
        match self {
            Self::NoOverlapDetected { .. } => "no-overlap",
            Self::UnleveledDataset { .. } => "unleveled",
            Self::ConflictUnresolved { .. } => "conflict",
            Self::DatasetSkipped { .. } => "skipped",
        }
    }

    pub fn concerns(&self, dataset: &str) -> bool {
        match self {
            Self::NoOverlapDetected {
                dataset_a,
                dataset_b,
            }
            | Self::ConflictUnresolved {
                dataset_a,
                dataset_b,
                ..
            } => dataset_a == dataset || dataset_b == dataset,
            Self::UnleveledDataset { dataset: name, .. } | Self::DatasetSkipped { dataset: name, .. } => {
                name == dataset
            }
        }
    }
}

/// A dataset kept out of the merge by a per-dataset error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedDataset {
    pub dataset: String,
    pub reason: String,
}

impl SkippedDataset {
    pub fn from_error(dataset: &str, error: &MergeError) -> Self {
        Self {
            dataset: dataset.to_string(),
            reason: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SampleCounts {
    pub input: usize,
    /// Input samples of datasets skipped before the merge.
    pub skipped: usize,
    pub admitted: usize,
    pub duplicate_suppressed: usize,
    pub conflict_excluded: usize,
    /// Conflicting samples admitted with a `conflict` flag.
    pub conflict_flagged: usize,
    pub edge_trimmed: usize,
    pub qc_rejected: usize,
    /// Overlap pairs whose leveled residual exceeded the conflict tolerance.
    pub conflicts: usize,
}

/// Diagnostics produced alongside the merged dataset.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MergeReport {
    pub working_projection: String,
    pub reference_dataset: Option<String>,
    pub corrections: Vec<DatasetLevel>,
    pub overlaps: Vec<OverlapSummary>,
    pub counts: SampleCounts,
    pub conditions: Vec<ReportedCondition>,
    pub skipped: Vec<SkippedDataset>,
    pub qc: Vec<LineQcSummary>,
    pub stage_metrics: Vec<StageMetric>,
}

impl MergeReport {
    pub fn new(working_projection: impl Into<String>) -> Self {
        Self {
            working_projection: working_projection.into(),
            ..Default::default()
        }
    }

    pub fn has_condition(&self, label: &str) -> bool {
        self.conditions.iter().any(|c| c.label() == label)
    }

    pub fn conditions_for<'a>(&'a self, dataset: &'a str) -> impl Iterator<Item = &'a ReportedCondition> {
        self.conditions.iter().filter(move |c| c.concerns(dataset))
    }

    pub fn correction_for(&self, dataset: &str) -> Option<&DatasetLevel> {
        self.corrections.iter().find(|c| c.dataset == dataset)
    }

    /// Overlaps whose residuals need a human look.
    pub fn flagged_for_review(&self) -> impl Iterator<Item = &OverlapSummary> {
        self.overlaps.iter().filter(|o| !o.accepted)
    }

    pub fn to_json(&self) -> MergeResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|err| MergeError::Internal(format!("serializing merge report: {}", err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn residual_stats_of_empty_set_are_zero() {
        assert_eq!(ResidualStats::from_values(&[]), ResidualStats::default());
        let stats = ResidualStats::from_values(&[1.0, 3.0]);
        assert_eq!(stats.count, 2);
        assert_eq!(stats.mean, 2.0);
        assert_eq!(stats.std_dev, 1.0);
    }

    #[test]
    fn conditions_are_tagged_in_json() {
        let mut report = MergeReport::new("EPSG:3338");
        report.conditions.push(ReportedCondition::NoOverlapDetected {
            dataset_a: "A".into(),
            dataset_b: "B".into(),
        });
        let json = report.to_json().unwrap();
        assert!(json.contains("\"condition\": \"no-overlap-detected\""));
        assert!(report.has_condition("no-overlap"));
        assert_eq!(report.conditions_for("B").count(), 1);
        assert_eq!(report.conditions_for("C").count(), 0);
    }

    #[test]
    fn skipped_dataset_keeps_error_text() {
        let err = MergeError::UnsupportedProjection {
            dataset: "A".into(),
            projection: "LOCAL:9".into(),
        };
        let skipped = SkippedDataset::from_error("A", &err);
        assert!(skipped.reason.contains("LOCAL:9"));
    }
}
