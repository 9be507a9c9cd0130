use crate::config::{ConflictPolicy, DuplicatePrecedence, MergeConfig};
use crate::prelude::{not_initialized, MergeResult, ProcessingStage};
use crate::processing::level::LevelingOutcome;
use crate::processing::overlap::OverlapRegion;
use crate::report::{OverlapSummary, ResidualStats};
use crate::survey::{Dataset, SampleFlag, SampleKey};
use crate::telemetry::log::LogManager;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// Everything the resolver needs for one run.
pub struct ResolutionInput<'a> {
    /// Normalized datasets, admission state is updated in place.
    pub datasets: &'a mut [Dataset],
    pub overlaps: &'a [OverlapRegion],
    pub leveling: &'a LevelingOutcome,
    /// Dataset names in caller order, used by `prefer-explicit-dataset-order`.
    pub input_order: &'a [String],
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResolutionOutcome {
    /// One entry per overlap region with at least one pair.
    pub summaries: Vec<OverlapSummary>,
    pub conflicts: usize,
    pub duplicates_suppressed: usize,
    pub edge_trimmed: usize,
}

#[derive(Debug, Clone)]
struct ResolverSettings {
    tolerance: f64,
    review_tolerance: f64,
    precedence: DuplicatePrecedence,
    policy: ConflictPolicy,
    suppress_duplicates: bool,
    min_segment_samples: usize,
}

impl From<&MergeConfig> for ResolverSettings {
    fn from(config: &MergeConfig) -> Self {
        Self {
            tolerance: config.conflict_residual_tolerance,
            review_tolerance: config.review_tolerance(),
            precedence: config.duplicate_precedence_policy,
            policy: config.conflict_policy,
            suppress_duplicates: config.suppress_duplicates,
            min_segment_samples: config.min_segment_samples,
        }
    }
}

/// Sample reference across datasets: (dataset index, key).
type GlobalKey = (usize, SampleKey);

/// Decides per-sample admission inside overlaps once levels are known.
///
/// Pairs whose leveled residual exceeds the tolerance are conflicts and
/// both samples are flagged. Consistent pairs are duplicates: the sample
/// from the lower-precedence dataset is suppressed. Short admitted slivers
/// left next to excluded samples are then trimmed.
pub struct ConflictResolver {
    settings: Option<ResolverSettings>,
    logger: LogManager,
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self {
            settings: None,
            logger: LogManager::new("resolve"),
        }
    }

    pub fn resolve(&self, input: ResolutionInput<'_>) -> MergeResult<ResolutionOutcome> {
        let settings = self
            .settings
            .as_ref()
            .ok_or_else(|| not_initialized("resolve"))?;
        let ResolutionInput {
            datasets,
            overlaps,
            leveling,
            input_order,
        } = input;

        let index: BTreeMap<&str, usize> = datasets
            .iter()
            .enumerate()
            .map(|(idx, d)| (d.name.as_str(), idx))
            .collect();
        let ranks = precedence_ranks(datasets, settings.precedence, input_order);

        let mut outcome = ResolutionOutcome::default();
        let mut conflicting: BTreeSet<GlobalKey> = BTreeSet::new();
        let mut candidates: Vec<(usize, Vec<(GlobalKey, GlobalKey)>)> = Vec::new();

        for region in overlaps.iter().filter(|r| !r.is_empty()) {
            let (Some(&ia), Some(&ib)) = (
                index.get(region.dataset_a.as_str()),
                index.get(region.dataset_b.as_str()),
            ) else {
                continue;
            };
            let (a, b) = (&datasets[ia], &datasets[ib]);
            let correction_a = leveling.correction_for(&a.name);
            let correction_b = leveling.correction_for(&b.name);

            let mut raw = Vec::with_capacity(region.len());
            let mut leveled = Vec::with_capacity(region.len());
            let mut conflicts = 0;
            let mut consistent = Vec::new();
            for pair in &region.pairs {
                let (Some(sa), Some(sb)) = (a.sample(pair.a), b.sample(pair.b)) else {
                    continue;
                };
                let va = sa.value + correction_a.at(&sa.position);
                let vb = sb.value + correction_b.at(&sb.position);
                let residual = vb - va;
                raw.push(sb.value - sa.value);
                leveled.push(residual);
                if residual.abs() > settings.tolerance {
                    conflicts += 1;
                    conflicting.insert((ia, pair.a));
                    conflicting.insert((ib, pair.b));
                } else {
                    consistent.push(((ia, pair.a), (ib, pair.b)));
                }
            }

            let residual = ResidualStats::from_values(&leveled);
            let accepted = residual.count > 0
                && residual.mean.abs() <= settings.review_tolerance
                && residual.std_dev <= settings.review_tolerance;
            if conflicts > 0 {
                self.logger.warn(&format!(
                    "{}/{}: {} of {} pairs exceed {:.2} nT",
                    a.name,
                    b.name,
                    conflicts,
                    region.len(),
                    settings.tolerance
                ));
            }
            outcome.conflicts += conflicts;
            candidates.push((outcome.summaries.len(), consistent));
            outcome.summaries.push(OverlapSummary {
                dataset_a: a.name.clone(),
                dataset_b: b.name.clone(),
                pair_count: leveled.len(),
                pre_level: ResidualStats::from_values(&raw),
                residual,
                conflicts,
                duplicates_suppressed: 0,
                accepted,
            });
        }

        for &(idx, key) in &conflicting {
            if let Some(sample) = datasets[idx].sample_mut(key) {
                match settings.policy {
                    ConflictPolicy::ExcludeBoth => sample.reject(SampleFlag::Conflict),
                    ConflictPolicy::AdmitFlagged => sample.flag(SampleFlag::Conflict),
                }
            }
        }

        if settings.suppress_duplicates {
            let mut suppressed: BTreeSet<GlobalKey> = BTreeSet::new();
            for (summary_idx, pairs) in candidates {
                let mut losers: BTreeSet<GlobalKey> = BTreeSet::new();
                for (ka, kb) in pairs {
                    let (winner, loser) = if ranks[ka.0] <= ranks[kb.0] {
                        (ka, kb)
                    } else {
                        (kb, ka)
                    };
                    if conflicting.contains(&winner) || conflicting.contains(&loser) {
                        continue;
                    }
                    losers.insert(loser);
                }
                outcome.summaries[summary_idx].duplicates_suppressed = losers.len();
                suppressed.extend(losers);
            }
            for &(idx, key) in &suppressed {
                if let Some(sample) = datasets[idx].sample_mut(key) {
                    sample.reject(SampleFlag::DuplicateSuppressed);
                }
            }
            outcome.duplicates_suppressed = suppressed.len();
        }

        if settings.min_segment_samples > 1 {
            for dataset in datasets.iter_mut() {
                outcome.edge_trimmed += trim_slivers(dataset, settings.min_segment_samples);
            }
        }

        self.logger.record(&format!(
            "{} conflicting pairs, {} duplicates suppressed, {} samples edge-trimmed",
            outcome.conflicts, outcome.duplicates_suppressed, outcome.edge_trimmed
        ));
        Ok(outcome)
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Rank per dataset index, 0 is the most preferred.
fn precedence_ranks(
    datasets: &[Dataset],
    policy: DuplicatePrecedence,
    input_order: &[String],
) -> Vec<usize> {
    let position = |name: &str| {
        input_order
            .iter()
            .position(|n| n == name)
            .unwrap_or(usize::MAX)
    };
    let newer = |a: &Dataset, b: &Dataset| {
        b.metadata
            .acquisition_end
            .total_cmp(&a.metadata.acquisition_end)
    };

    let mut order: Vec<usize> = (0..datasets.len()).collect();
    order.sort_by(|&i, &j| {
        let (a, b) = (&datasets[i], &datasets[j]);
        let primary = match policy {
            DuplicatePrecedence::PreferNewer => newer(a, b),
            DuplicatePrecedence::PreferHigherPrecision => a
                .metadata
                .instrument_precision
                .total_cmp(&b.metadata.instrument_precision)
                .then_with(|| newer(a, b)),
            DuplicatePrecedence::PreferExplicitDatasetOrder => {
                position(&a.name).cmp(&position(&b.name))
            }
        };
        match primary {
            Ordering::Equal => a.name.cmp(&b.name),
            other => other,
        }
    });

    let mut ranks = vec![0; datasets.len()];
    for (rank, idx) in order.into_iter().enumerate() {
        ranks[idx] = rank;
    }
    ranks
}

/// Un-admits admitted runs shorter than `min_len` that touch a sample the
/// merge excluded. Returns the number of samples trimmed.
fn trim_slivers(dataset: &mut Dataset, min_len: usize) -> usize {
    let mut trimmed = 0;
    for line in &mut dataset.lines {
        let n = line.samples.len();
        let mut start = 0;
        while start < n {
            if !line.samples[start].admitted {
                start += 1;
                continue;
            }
            let mut end = start;
            while end < n && line.samples[end].admitted {
                end += 1;
            }
            let touches_exclusion = (start > 0 && line.samples[start - 1].excluded_by_merge())
                || (end < n && line.samples[end].excluded_by_merge());
            if end - start < min_len && touches_exclusion {
                for sample in &mut line.samples[start..end] {
                    sample.reject(SampleFlag::EdgeTrimmed);
                }
                trimmed += end - start;
            }
            start = end;
        }
    }
    trimmed
}

impl ProcessingStage for ConflictResolver {
    type Input<'a> = ResolutionInput<'a>;
    type Output = ResolutionOutcome;

    fn name(&self) -> &'static str {
        "resolve"
    }

    fn initialize(&mut self, config: &MergeConfig) -> MergeResult<()> {
        self.settings = Some(ResolverSettings::from(config));
        Ok(())
    }

    fn execute<'a>(&mut self, input: Self::Input<'a>) -> MergeResult<Self::Output> {
        self.resolve(input)
    }

    fn cleanup(&mut self) {
        self.settings = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prelude::MergeError;
    use crate::processing::level::LevelReconciler;
    use crate::processing::overlap::OverlapDetector;
    use crate::survey::{DatasetMetadata, Line, Position, Sample};

    fn line(dataset: &str, id: &str, y: f64, xs: impl Iterator<Item = f64>, value: impl Fn(f64) -> f64) -> Line {
        let samples = xs
            .enumerate()
            .map(|(i, x)| Sample::new(dataset, id, Position::new(x, y), value(x), i as f64))
            .collect();
        Line::new(id, samples)
    }

    fn dataset(name: &str, end: f64, lines: Vec<Line>) -> Dataset {
        Dataset::new(
            name,
            DatasetMetadata::new("EPSG:3338").with_window(0.0, end),
            lines,
        )
    }

    struct Run {
        datasets: Vec<Dataset>,
        outcome: ResolutionOutcome,
    }

    fn resolve(mut datasets: Vec<Dataset>, config: &MergeConfig) -> Run {
        let regions = OverlapDetector::with_tolerance(config.overlap_tolerance_distance)
            .detect_all(&datasets)
            .unwrap();
        let mut level = LevelReconciler::new();
        level.initialize(config).unwrap();
        let leveling = level.reconcile(&datasets, &regions).unwrap();
        let order: Vec<String> = datasets.iter().map(|d| d.name.clone()).collect();

        let mut resolver = ConflictResolver::new();
        resolver.initialize(config).unwrap();
        let outcome = resolver
            .execute(ResolutionInput {
                datasets: &mut datasets,
                overlaps: &regions,
                leveling: &leveling,
                input_order: &order,
            })
            .unwrap();
        Run { datasets, outcome }
    }

    fn admitted(dataset: &Dataset) -> usize {
        dataset.admitted_count()
    }

    #[test]
    fn lone_pair_is_absorbed_by_leveling() {
        let a = dataset("A", 1.0, vec![line("A", "A1", 0.0, [0.0].into_iter(), |_| 100.0)]);
        let b = dataset("B", 2.0, vec![line("B", "B1", 5.0, [0.0].into_iter(), |_| 180.0)]);
        let config = MergeConfig {
            reference_dataset: Some("A".into()),
            ..Default::default()
        };
        let run = resolve(vec![a, b], &config);
        assert_eq!(run.outcome.summaries.len(), 1);
        assert_eq!(run.outcome.conflicts, 0);
        assert_eq!(run.outcome.summaries[0].pre_level.mean, 80.0);
        assert_eq!(run.outcome.summaries[0].residual.mean, 0.0);
        assert!(!run.datasets[0].lines[0].samples[0].admitted);
    }

    #[test]
    fn conflicting_samples_are_excluded_by_default() {
        let xs = || (0..20).map(|i| i as f64 * 10.0);
        let a = dataset("A", 1.0, vec![line("A", "A1", 0.0, xs(), |_| 100.0)]);
        let b = dataset(
            "B",
            2.0,
            vec![line("B", "B1", 5.0, xs(), |x| if x == 100.0 { 160.0 } else { 100.0 })],
        );
        let config = MergeConfig {
            overlap_tolerance_distance: 6.0,
            ..Default::default()
        };
        let run = resolve(vec![a, b], &config);

        assert_eq!(run.outcome.conflicts, 1);
        let summary = &run.outcome.summaries[0];
        assert_eq!(summary.conflicts, 1);
        let a_sample = &run.datasets[0].lines[0].samples[10];
        let b_sample = &run.datasets[1].lines[0].samples[10];
        assert!(!a_sample.admitted && a_sample.has_flag(SampleFlag::Conflict));
        assert!(!b_sample.admitted && b_sample.has_flag(SampleFlag::Conflict));
    }

    #[test]
    fn admit_flagged_keeps_conflicts_in_the_merge() {
        let xs = || (0..20).map(|i| i as f64 * 10.0);
        let a = dataset("A", 1.0, vec![line("A", "A1", 0.0, xs(), |_| 100.0)]);
        let b = dataset(
            "B",
            2.0,
            vec![line("B", "B1", 5.0, xs(), |x| if x == 100.0 { 160.0 } else { 100.0 })],
        );
        let config = MergeConfig {
            overlap_tolerance_distance: 6.0,
            conflict_policy: ConflictPolicy::AdmitFlagged,
            suppress_duplicates: false,
            ..Default::default()
        };
        let run = resolve(vec![a, b], &config);
        let b_sample = &run.datasets[1].lines[0].samples[10];
        assert!(b_sample.admitted && b_sample.has_flag(SampleFlag::Conflict));
        assert_eq!(admitted(&run.datasets[0]) + admitted(&run.datasets[1]), 40);
    }

    #[test]
    fn newer_dataset_wins_duplicates() {
        let xs = || (0..20).map(|i| i as f64 * 10.0);
        let old = dataset("old", 1.0, vec![line("old", "O1", 0.0, xs(), |_| 100.0)]);
        let new = dataset("new", 9.0, vec![line("new", "N1", 5.0, xs(), |_| 100.5)]);
        let config = MergeConfig {
            overlap_tolerance_distance: 6.0,
            ..Default::default()
        };
        let run = resolve(vec![new, old], &config);

        assert_eq!(run.outcome.duplicates_suppressed, 20);
        assert_eq!(admitted(&run.datasets[0]), 20);
        assert_eq!(admitted(&run.datasets[1]), 0);
        assert!(run.datasets[1].samples().all(|s| s.has_flag(SampleFlag::DuplicateSuppressed)));
        assert!(run.outcome.summaries[0].accepted);
    }

    #[test]
    fn precision_policy_prefers_lower_noise_floor() {
        let xs = || (0..10).map(|i| i as f64 * 10.0);
        let mut coarse = dataset("coarse", 9.0, vec![line("coarse", "C1", 0.0, xs(), |_| 0.0)]);
        coarse.metadata.instrument_precision = 1.0;
        let mut fine = dataset("fine", 1.0, vec![line("fine", "F1", 2.0, xs(), |_| 0.0)]);
        fine.metadata.instrument_precision = 0.01;
        let config = MergeConfig {
            overlap_tolerance_distance: 6.0,
            duplicate_precedence_policy: DuplicatePrecedence::PreferHigherPrecision,
            ..Default::default()
        };
        let run = resolve(vec![coarse, fine], &config);
        assert_eq!(admitted(&run.datasets[0]), 0);
        assert_eq!(admitted(&run.datasets[1]), 10);
    }

    #[test]
    fn explicit_order_uses_caller_sequence() {
        let datasets = vec![
            dataset("B", 0.0, vec![]),
            dataset("A", 5.0, vec![]),
            dataset("C", 9.0, vec![]),
        ];
        let order = vec!["C".to_string(), "A".to_string()];
        let ranks = precedence_ranks(&datasets, DuplicatePrecedence::PreferExplicitDatasetOrder, &order);
        assert_eq!(ranks, vec![2, 1, 0]);
        let ranks = precedence_ranks(&datasets, DuplicatePrecedence::PreferNewer, &order);
        assert_eq!(ranks, vec![2, 1, 0]);
    }

    #[test]
    fn slivers_next_to_exclusions_are_trimmed() {
        let xs = || (0..6).map(|i| i as f64 * 10.0);
        let mut d = dataset("A", 1.0, vec![line("A", "A1", 0.0, xs(), |_| 0.0)]);
        d.lines[0].samples[2].reject(SampleFlag::Conflict);
        d.lines[0].samples[3].reject(SampleFlag::EdgeTrimmed);
        // runs: [0,1] touches the conflict, [4,5] touches only a trimmed sample
        let trimmed = trim_slivers(&mut d, 3);
        assert_eq!(trimmed, 2);
        let admitted: Vec<bool> = d.lines[0].samples.iter().map(|s| s.admitted).collect();
        assert_eq!(admitted, vec![false, false, false, false, true, true]);
    }

    #[test]
    fn execute_requires_initialization() {
        let mut stage = ConflictResolver::new();
        let leveling = LevelingOutcome::default();
        let result = stage.execute(ResolutionInput {
            datasets: &mut [],
            overlaps: &[],
            leveling: &leveling,
            input_order: &[],
        });
        assert!(matches!(result, Err(MergeError::Internal(_))));
    }
}
