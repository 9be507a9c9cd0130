use crate::config::{DatasetErrorPolicy, MergeConfig};
use crate::prelude::{MergeError, MergeResult, ProcessingStage};
use crate::processing::conflict::{ConflictResolver, ResolutionInput, ResolutionOutcome};
use crate::processing::level::{DatasetLevel, LevelReconciler, LevelingOutcome};
use crate::processing::overlap::OverlapDetector;
use crate::processing::projection::{ProjectionNormalizer, ProjectionTransform, VerticalTransform};
use crate::processing::qc::LineQc;
use crate::report::{MergeReport, ReportedCondition, SampleCounts, SkippedDataset};
use crate::survey::{Dataset, DatasetMetadata, Line, SampleFlag};
use crate::telemetry::{LogManager, MetricsRecorder};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Result of one merge run.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutput {
    pub dataset: Dataset,
    pub report: MergeReport,
}

/// Runs normalization, QC, overlap detection, leveling and conflict
/// resolution over a batch of datasets.
///
/// A run is a pure function of its inputs and configuration: datasets are
/// handled in name order whatever order the caller passes them in, and the
/// only caller-visible state is the optional abort flag.
#[derive(Clone)]
pub struct MergeEngine {
    config: MergeConfig,
    transform: Arc<dyn ProjectionTransform>,
    vertical: Option<Arc<dyn VerticalTransform>>,
    abort: Option<Arc<AtomicBool>>,
    logger: LogManager,
}

impl MergeEngine {
    pub fn new(config: MergeConfig, transform: Arc<dyn ProjectionTransform>) -> MergeResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            transform,
            vertical: None,
            abort: None,
            logger: LogManager::new("engine"),
        })
    }

    pub fn with_vertical_transform(mut self, vertical: Arc<dyn VerticalTransform>) -> Self {
        self.vertical = Some(vertical);
        self
    }

    /// Raising the flag stops the run at the next stage boundary.
    pub fn with_abort_flag(mut self, abort: Arc<AtomicBool>) -> Self {
        self.abort = Some(abort);
        self
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    pub fn run(&self, inputs: &[Dataset]) -> MergeResult<MergeOutput> {
        self.check_inputs(inputs)?;
        let input_order: Vec<String> = inputs.iter().map(|d| d.name.clone()).collect();
        let metrics = MetricsRecorder::new();
        let mut report = MergeReport::new(self.config.working_projection.clone());

        let mut ordered: Vec<&Dataset> = inputs.iter().collect();
        ordered.sort_by(|a, b| a.name.cmp(&b.name));

        self.checkpoint("projection")?;
        let mut datasets = self.normalize_all(&ordered, &metrics, &mut report)?;

        self.checkpoint("qc")?;
        let mut qc = LineQc::new();
        qc.initialize(&self.config)?;
        for dataset in datasets.iter_mut() {
            let lines = dataset.lines.len();
            report.qc.extend(qc.execute(dataset)?);
            metrics.record_processed(qc.name(), lines);
        }
        qc.cleanup();

        self.checkpoint("overlap")?;
        let mut detector = OverlapDetector::new();
        detector.initialize(&self.config)?;
        let regions = detector.execute(&datasets[..])?;
        detector.cleanup();
        metrics.record_processed("overlap", regions.iter().map(|r| r.len()).sum());
        for region in regions.iter().filter(|r| r.is_empty()) {
            self.push_condition(
                &mut report,
                ReportedCondition::NoOverlapDetected {
                    dataset_a: region.dataset_a.clone(),
                    dataset_b: region.dataset_b.clone(),
                },
            );
        }

        self.checkpoint("level")?;
        let mut reconciler = LevelReconciler::new();
        reconciler.initialize(&self.level_config(&datasets))?;
        let leveling = reconciler.execute((&datasets[..], &regions[..]))?;
        reconciler.cleanup();
        metrics.record_processed("level", leveling.levels.len());
        for level in leveling.unleveled() {
            if let Some(reason) = level.unleveled_reason {
                self.push_condition(
                    &mut report,
                    ReportedCondition::UnleveledDataset {
                        dataset: level.dataset.clone(),
                        reason,
                    },
                );
            }
        }

        self.checkpoint("resolve")?;
        let mut resolver = ConflictResolver::new();
        resolver.initialize(&self.config)?;
        let resolution = resolver.execute(ResolutionInput {
            datasets: &mut datasets,
            overlaps: &regions,
            leveling: &leveling,
            input_order: &input_order,
        })?;
        resolver.cleanup();
        metrics.record_processed("resolve", resolution.summaries.iter().map(|s| s.pair_count).sum());
        for summary in resolution.summaries.iter().filter(|s| s.conflicts > 0) {
            self.push_condition(
                &mut report,
                ReportedCondition::ConflictUnresolved {
                    dataset_a: summary.dataset_a.clone(),
                    dataset_b: summary.dataset_b.clone(),
                    pairs: summary.conflicts,
                },
            );
        }

        report.counts = count_samples(inputs, &datasets, &resolution);
        let dataset = self.assemble(&datasets, &leveling);
        report.reference_dataset = leveling.reference.clone();
        report.corrections = leveling.levels;
        report.overlaps = resolution.summaries;
        report.stage_metrics = metrics.snapshot();

        self.logger.record(&format!(
            "merged {} of {} datasets into {} ({} of {} samples admitted)",
            datasets.len(),
            inputs.len(),
            dataset.name,
            report.counts.admitted,
            report.counts.input
        ));
        Ok(MergeOutput { dataset, report })
    }

    fn check_inputs(&self, inputs: &[Dataset]) -> MergeResult<()> {
        if inputs.is_empty() {
            return Err(MergeError::InvalidInput("no datasets to merge".into()));
        }
        let mut names = BTreeSet::new();
        for dataset in inputs {
            if !names.insert(dataset.name.as_str()) {
                return Err(MergeError::InvalidInput(format!(
                    "dataset name {} appears more than once",
                    dataset.name
                )));
            }
        }
        if let Some(reference) = &self.config.reference_dataset {
            if !names.contains(reference.as_str()) {
                return Err(MergeError::InvalidConfiguration(format!(
                    "reference dataset {} is not among the inputs",
                    reference
                )));
            }
        }
        Ok(())
    }

    fn checkpoint(&self, stage: &str) -> MergeResult<()> {
        match &self.abort {
            Some(flag) if flag.load(Ordering::SeqCst) => {
                self.logger.warn(&format!("abort requested before {}", stage));
                Err(MergeError::Aborted {
                    stage: stage.to_string(),
                })
            }
            _ => {
                self.logger.detail(&format!("starting {}", stage));
                Ok(())
            }
        }
    }

    fn push_condition(&self, report: &mut MergeReport, condition: ReportedCondition) {
        self.logger.warn(&format!("{:?}", condition));
        report.conditions.push(condition);
    }

    fn normalize_all(
        &self,
        ordered: &[&Dataset],
        metrics: &MetricsRecorder,
        report: &mut MergeReport,
    ) -> MergeResult<Vec<Dataset>> {
        let mut normalizer = ProjectionNormalizer::new(self.transform.clone());
        if let Some(vertical) = &self.vertical {
            normalizer = normalizer.with_vertical(vertical.clone());
        }
        normalizer.initialize(&self.config)?;

        let mut normalized = Vec::with_capacity(ordered.len());
        for &dataset in ordered {
            let result = dataset
                .validate(self.config.path_tolerance)
                .and_then(|_| normalizer.execute(dataset));
            match result {
                Ok(dataset) => {
                    metrics.record_processed(normalizer.name(), dataset.sample_count());
                    normalized.push(dataset);
                }
                Err(err) if err.is_per_dataset() => {
                    metrics.record_error(normalizer.name());
                    if self.config.dataset_error_policy == DatasetErrorPolicy::AbortAll {
                        return Err(err);
                    }
                    let skipped = SkippedDataset::from_error(&dataset.name, &err);
                    self.push_condition(
                        report,
                        ReportedCondition::DatasetSkipped {
                            dataset: skipped.dataset.clone(),
                            reason: skipped.reason.clone(),
                        },
                    );
                    report.skipped.push(skipped);
                }
                Err(err) => return Err(err),
            }
        }
        normalizer.cleanup();
        Ok(normalized)
    }

    /// A configured reference that was skipped falls back to automatic choice.
    fn level_config(&self, datasets: &[Dataset]) -> MergeConfig {
        let mut config = self.config.clone();
        if let Some(reference) = &self.config.reference_dataset {
            if !datasets.iter().any(|d| &d.name == reference) {
                self.logger.warn(&format!(
                    "reference dataset {} was skipped, choosing one automatically",
                    reference
                ));
                config.reference_dataset = None;
            }
        }
        config
    }

    fn assemble(&self, datasets: &[Dataset], leveling: &LevelingOutcome) -> Dataset {
        let mut metadata = DatasetMetadata::new(self.config.working_projection.clone());
        let mut instruments = BTreeSet::new();
        for (idx, dataset) in datasets.iter().enumerate() {
            let source = &dataset.metadata;
            if idx == 0 {
                metadata.acquisition_start = source.acquisition_start;
                metadata.acquisition_end = source.acquisition_end;
                metadata.instrument_precision = source.instrument_precision;
            } else {
                metadata.acquisition_start = metadata.acquisition_start.min(source.acquisition_start);
                metadata.acquisition_end = metadata.acquisition_end.max(source.acquisition_end);
                metadata.instrument_precision =
                    metadata.instrument_precision.max(source.instrument_precision);
            }
            if !source.instrument.is_empty() {
                instruments.insert(source.instrument.as_str());
            }
            if leveling.reference.as_deref() == Some(dataset.name.as_str()) {
                metadata.base_level = source.base_level;
            }
        }
        metadata.instrument = instruments.into_iter().collect::<Vec<_>>().join("+");

        let mut lines: Vec<(&str, &str, Line)> = Vec::new();
        for dataset in datasets {
            let level = leveling.level(&dataset.name);
            let leveled = level.map_or(false, DatasetLevel::is_corrected);
            let correction = leveling.correction_for(&dataset.name);
            for line in &dataset.lines {
                let mut samples: Vec<_> = line
                    .samples
                    .iter()
                    .filter(|s| s.admitted)
                    .cloned()
                    .collect();
                if samples.is_empty() {
                    continue;
                }
                if leveled {
                    for sample in &mut samples {
                        sample.value += correction.at(&sample.position);
                        sample.flag(SampleFlag::Leveled);
                    }
                }
                samples.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
                let id = format!("{}/{}", dataset.name, line.id);
                for sample in &mut samples {
                    sample.line = id.clone();
                }
                let mut merged = Line::new(id, samples);
                merged.flight = line.flight;
                lines.push((dataset.name.as_str(), line.id.as_str(), merged));
            }
        }
        lines.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        Dataset::new(
            self.config.output_name.clone(),
            metadata,
            lines.into_iter().map(|(_, _, line)| line).collect(),
        )
    }
}

fn count_samples(inputs: &[Dataset], datasets: &[Dataset], resolution: &ResolutionOutcome) -> SampleCounts {
    let merged: BTreeSet<&str> = datasets.iter().map(|d| d.name.as_str()).collect();
    let mut counts = SampleCounts {
        input: inputs.iter().map(Dataset::sample_count).sum(),
        skipped: inputs
            .iter()
            .filter(|d| !merged.contains(d.name.as_str()))
            .map(Dataset::sample_count)
            .sum(),
        conflicts: resolution.conflicts,
        ..Default::default()
    };
    for sample in datasets.iter().flat_map(Dataset::samples) {
        if sample.admitted {
            counts.admitted += 1;
            if sample.has_flag(SampleFlag::Conflict) {
                counts.conflict_flagged += 1;
            }
        } else if sample.has_flag(SampleFlag::Conflict) {
            counts.conflict_excluded += 1;
        } else if sample.has_flag(SampleFlag::DuplicateSuppressed) {
            counts.duplicate_suppressed += 1;
        } else if sample.has_flag(SampleFlag::EdgeTrimmed) {
            counts.edge_trimmed += 1;
        } else if sample.has_flag(SampleFlag::NoisyFourthDifference) {
            counts.qc_rejected += 1;
        }
    }
    counts
}
