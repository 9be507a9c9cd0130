use crate::config::{LevelEstimator, LevelModel, MergeConfig};
use crate::math::{MatrixHelper, StatsHelper};
use crate::prelude::{not_initialized, MergeError, MergeResult, ProcessingStage};
use crate::processing::overlap::OverlapRegion;
use crate::survey::{Dataset, Position};
use crate::telemetry::log::LogManager;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Floor on the robust scale so exactly-agreeing overlaps still reject strays.
const MIN_SCALE: f64 = 1e-9;
const PLANE_ITERATIONS: usize = 3;

/// Additive correction for one dataset: a constant offset, optionally with a
/// planar trend about `origin`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LevelCorrection {
    pub offset: f64,
    #[serde(default)]
    pub gradient_x: f64,
    #[serde(default)]
    pub gradient_y: f64,
    #[serde(default)]
    pub origin_x: f64,
    #[serde(default)]
    pub origin_y: f64,
}

impl LevelCorrection {
    pub fn constant(offset: f64) -> Self {
        Self {
            offset,
            ..Default::default()
        }
    }

    /// Correction to add to a value measured at `position`.
    pub fn at(&self, position: &Position) -> f64 {
        self.offset
            + self.gradient_x * (position.x - self.origin_x)
            + self.gradient_y * (position.y - self.origin_y)
    }

    pub fn is_zero(&self) -> bool {
        self.offset == 0.0 && self.gradient_x == 0.0 && self.gradient_y == 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LevelStatus {
    Reference,
    Leveled,
    Unleveled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnleveledReason {
    /// The dataset overlaps nothing.
    NoOverlap,
    /// It overlaps others, but no chain of overlaps reaches the reference.
    /// Its component is still leveled against a local reference.
    Disconnected,
}

impl fmt::Display for UnleveledReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoOverlap => f.write_str("no overlap with any dataset"),
            Self::Disconnected => f.write_str("no overlap chain to the reference"),
        }
    }
}

/// Leveling result for one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetLevel {
    pub dataset: String,
    pub status: LevelStatus,
    pub correction: LevelCorrection,
    pub pairs_used: usize,
    pub outliers_excluded: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unleveled_reason: Option<UnleveledReason>,
    /// Dataset the correction is relative to when the dataset sits in a
    /// component that never reaches the global reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_reference: Option<String>,
}

impl DatasetLevel {
    fn reference(dataset: &str) -> Self {
        Self {
            dataset: dataset.to_string(),
            status: LevelStatus::Reference,
            correction: LevelCorrection::default(),
            pairs_used: 0,
            outliers_excluded: 0,
            unleveled_reason: None,
            local_reference: None,
        }
    }

    fn unleveled(dataset: &str, reason: UnleveledReason) -> Self {
        Self {
            status: LevelStatus::Unleveled,
            unleveled_reason: Some(reason),
            ..Self::reference(dataset)
        }
    }

    /// Whether merged values of this dataset take its correction.
    pub fn is_corrected(&self) -> bool {
        match self.status {
            LevelStatus::Leveled => true,
            LevelStatus::Reference => false,
            LevelStatus::Unleveled => self
                .local_reference
                .as_deref()
                .map_or(false, |local| local != self.dataset),
        }
    }
}

/// Corrections for a whole batch, ordered by dataset name.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LevelingOutcome {
    pub reference: Option<String>,
    pub levels: Vec<DatasetLevel>,
}

impl LevelingOutcome {
    pub fn level(&self, dataset: &str) -> Option<&DatasetLevel> {
        self.levels
            .binary_search_by(|l| l.dataset.as_str().cmp(dataset))
            .ok()
            .map(|idx| &self.levels[idx])
    }

    /// Zero for datasets that were never leveled.
    pub fn correction_for(&self, dataset: &str) -> LevelCorrection {
        self.level(dataset)
            .map(|l| l.correction)
            .unwrap_or_default()
    }

    pub fn unleveled(&self) -> impl Iterator<Item = &DatasetLevel> {
        self.levels
            .iter()
            .filter(|l| l.status == LevelStatus::Unleveled)
    }
}

#[derive(Debug, Clone)]
struct LevelSettings {
    model: LevelModel,
    estimator: LevelEstimator,
    outlier_threshold: f64,
    trim_fraction: f64,
    reference: Option<String>,
}

impl From<&MergeConfig> for LevelSettings {
    fn from(config: &MergeConfig) -> Self {
        Self {
            model: config.level_model,
            estimator: config.level_estimator,
            outlier_threshold: config.level_outlier_threshold,
            trim_fraction: config.trim_fraction,
            reference: config.reference_dataset.clone(),
        }
    }
}

/// Signed difference between a sample and its leveled counterpart.
struct Difference {
    position: Position,
    value: f64,
}

struct Fit {
    correction: LevelCorrection,
    inliers: usize,
    outliers: usize,
}

/// Estimates per-dataset level corrections from overlap differences.
///
/// One dataset is the zero-correction reference. The others are leveled one
/// at a time against everything already leveled, always taking next the
/// dataset with the most overlap pairs into the leveled set, so a dataset
/// overlapping several leveled neighbours is fitted to their pooled pairs.
///
/// Components with no overlap chain to the reference get a local reference
/// picked by the same rule and are leveled against it, but stay reported as
/// unleveled.
pub struct LevelReconciler {
    settings: Option<LevelSettings>,
    logger: LogManager,
}

impl LevelReconciler {
    pub fn new() -> Self {
        Self {
            settings: None,
            logger: LogManager::new("level"),
        }
    }

    pub fn reconcile(
        &self,
        datasets: &[Dataset],
        overlaps: &[OverlapRegion],
    ) -> MergeResult<LevelingOutcome> {
        let settings = self
            .settings
            .as_ref()
            .ok_or_else(|| not_initialized("level"))?;

        let by_name: BTreeMap<&str, &Dataset> =
            datasets.iter().map(|d| (d.name.as_str(), d)).collect();
        if by_name.is_empty() {
            return Ok(LevelingOutcome::default());
        }

        let live: Vec<&OverlapRegion> = overlaps
            .iter()
            .filter(|r| {
                !r.is_empty()
                    && by_name.contains_key(r.dataset_a.as_str())
                    && by_name.contains_key(r.dataset_b.as_str())
            })
            .collect();

        let mut totals: BTreeMap<&str, usize> = by_name.keys().map(|name| (*name, 0)).collect();
        for region in &live {
            for name in [region.dataset_a.as_str(), region.dataset_b.as_str()] {
                if let Some(total) = totals.get_mut(name) {
                    *total += region.len();
                }
            }
        }

        let reference = match &settings.reference {
            Some(name) => by_name
                .get_key_value(name.as_str())
                .map(|(key, _)| *key)
                .ok_or_else(|| {
                    MergeError::InvalidConfiguration(format!(
                        "reference dataset {} is not among the inputs",
                        name
                    ))
                })?,
            None => pick_reference(&totals),
        };
        self.logger.record(&format!(
            "reference dataset {} ({} overlap pairs)",
            reference,
            totals.get(reference).copied().unwrap_or(0)
        ));

        let mut levels: BTreeMap<&str, DatasetLevel> = BTreeMap::new();
        levels.insert(reference, DatasetLevel::reference(reference));

        self.grow(&mut levels, &by_name, &live, settings, None);

        loop {
            let remaining: BTreeMap<&str, usize> = totals
                .iter()
                .filter(|(name, total)| **total > 0 && !levels.contains_key(*name))
                .map(|(name, total)| (*name, *total))
                .collect();
            if remaining.is_empty() {
                break;
            }
            let local = pick_reference(&remaining);
            self.logger.warn(&format!(
                "{} has no overlap chain to {}; leveling its component locally",
                local, reference
            ));
            let mut seed = DatasetLevel::unleveled(local, UnleveledReason::Disconnected);
            seed.local_reference = Some(local.to_string());
            levels.insert(local, seed);
            self.grow(&mut levels, &by_name, &live, settings, Some(local));
        }

        for (&name, &total) in &totals {
            if levels.contains_key(name) {
                continue;
            }
            let reason = if total == 0 {
                UnleveledReason::NoOverlap
            } else {
                UnleveledReason::Disconnected
            };
            self.logger
                .warn(&format!("{} left unleveled: {}", name, reason));
            levels.insert(name, DatasetLevel::unleveled(name, reason));
        }

        Ok(LevelingOutcome {
            reference: Some(reference.to_string()),
            levels: levels.into_values().collect(),
        })
    }
}

impl LevelReconciler {
    /// Levels datasets one at a time against `levels` until nothing left
    /// shares a pair with it. With a `local_reference` the new entries are
    /// reported as disconnected from the global reference.
    fn grow<'n>(
        &self,
        levels: &mut BTreeMap<&'n str, DatasetLevel>,
        by_name: &BTreeMap<&'n str, &Dataset>,
        live: &[&OverlapRegion],
        settings: &LevelSettings,
        local_reference: Option<&str>,
    ) {
        loop {
            let mut next: Option<(&'n str, usize)> = None;
            for &name in by_name.keys() {
                if levels.contains_key(name) {
                    continue;
                }
                let shared: usize = live
                    .iter()
                    .filter(|r| r.partner_of(name).map_or(false, |p| levels.contains_key(p)))
                    .map(|r| r.len())
                    .sum();
                if shared > 0 && next.map_or(true, |(_, best)| shared > best) {
                    next = Some((name, shared));
                }
            }
            let Some((name, _)) = next else {
                return;
            };

            let differences = collect_differences(name, live, by_name, levels);
            let fit = fit_correction(&differences, settings);
            self.logger.record(&format!(
                "{} offset {:.3} nT from {} pairs ({} outliers excluded)",
                name, fit.correction.offset, fit.inliers, fit.outliers
            ));
            let (status, unleveled_reason) = match local_reference {
                Some(_) => (LevelStatus::Unleveled, Some(UnleveledReason::Disconnected)),
                None => (LevelStatus::Leveled, None),
            };
            levels.insert(
                name,
                DatasetLevel {
                    dataset: name.to_string(),
                    status,
                    correction: fit.correction,
                    pairs_used: fit.inliers,
                    outliers_excluded: fit.outliers,
                    unleveled_reason,
                    local_reference: local_reference.map(str::to_string),
                },
            );
        }
    }
}

impl Default for LevelReconciler {
    fn default() -> Self {
        Self::new()
    }
}

/// Most total overlap wins; ties go to the first name.
fn pick_reference<'n>(totals: &BTreeMap<&'n str, usize>) -> &'n str {
    let mut best: Option<(&'n str, usize)> = None;
    for (&name, &total) in totals {
        if best.map_or(true, |(_, top)| total > top) {
            best = Some((name, total));
        }
    }
    best.map(|(name, _)| name).unwrap_or_default()
}

fn collect_differences(
    name: &str,
    live: &[&OverlapRegion],
    by_name: &BTreeMap<&str, &Dataset>,
    levels: &BTreeMap<&str, DatasetLevel>,
) -> Vec<Difference> {
    let mut differences = Vec::new();
    let Some(own) = by_name.get(name) else {
        return differences;
    };
    for region in live {
        let Some(partner) = region.partner_of(name) else {
            continue;
        };
        let (Some(partner_level), Some(other)) = (levels.get(partner), by_name.get(partner)) else {
            continue;
        };
        let own_is_a = region.dataset_a == name;
        for pair in &region.pairs {
            let (own_key, other_key) = if own_is_a {
                (pair.a, pair.b)
            } else {
                (pair.b, pair.a)
            };
            let (Some(sample), Some(counterpart)) = (own.sample(own_key), other.sample(other_key))
            else {
                continue;
            };
            let leveled = counterpart.value + partner_level.correction.at(&counterpart.position);
            differences.push(Difference {
                position: sample.position,
                value: sample.value - leveled,
            });
        }
    }
    differences
}

/// Indices of values within `threshold` robust sigmas of the median.
fn robust_inliers(values: &[f64], threshold: f64) -> Vec<usize> {
    let Some(center) = StatsHelper::median(values) else {
        return Vec::new();
    };
    let scale = StatsHelper::mad_scale(values, center).max(MIN_SCALE);
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| (*v - center).abs() <= threshold * scale)
        .map(|(idx, _)| idx)
        .collect()
}

fn fit_correction(differences: &[Difference], settings: &LevelSettings) -> Fit {
    let values: Vec<f64> = differences.iter().map(|d| d.value).collect();
    let inliers = robust_inliers(&values, settings.outlier_threshold);

    if settings.model == LevelModel::Plane {
        if let Some(fit) = fit_plane(differences, inliers.clone(), settings) {
            return fit;
        }
    }

    let kept: Vec<f64> = inliers.iter().map(|&idx| values[idx]).collect();
    let estimate = match settings.estimator {
        LevelEstimator::Median => StatsHelper::median(&kept),
        LevelEstimator::TrimmedMean => StatsHelper::trimmed_mean(&kept, settings.trim_fraction),
    }
    .unwrap_or(0.0);

    Fit {
        correction: LevelCorrection::constant(-estimate),
        inliers: kept.len(),
        outliers: differences.len() - kept.len(),
    }
}

/// Iteratively reweighted plane fit; `None` when the geometry cannot
/// constrain a plane (too few pairs, or all pairs on one line).
fn fit_plane(differences: &[Difference], mut inliers: Vec<usize>, settings: &LevelSettings) -> Option<Fit> {
    for iteration in 0..PLANE_ITERATIONS {
        if inliers.len() < 3 {
            return None;
        }
        let n = inliers.len() as f64;
        let x0 = inliers.iter().map(|&i| differences[i].position.x).sum::<f64>() / n;
        let y0 = inliers.iter().map(|&i| differences[i].position.y).sum::<f64>() / n;

        let mut design = Array2::zeros((inliers.len(), 3));
        let mut observations = Array1::zeros(inliers.len());
        for (row, &idx) in inliers.iter().enumerate() {
            let d = &differences[idx];
            design[[row, 0]] = 1.0;
            design[[row, 1]] = d.position.x - x0;
            design[[row, 2]] = d.position.y - y0;
            observations[row] = d.value;
        }
        let beta = MatrixHelper::least_squares(design.view(), observations.view())?;
        let correction = LevelCorrection {
            offset: -beta[0],
            gradient_x: -beta[1],
            gradient_y: -beta[2],
            origin_x: x0,
            origin_y: y0,
        };

        let residuals: Vec<f64> = differences
            .iter()
            .map(|d| d.value + correction.at(&d.position))
            .collect();
        let next = robust_inliers(&residuals, settings.outlier_threshold);
        if next == inliers || iteration + 1 == PLANE_ITERATIONS {
            return Some(Fit {
                correction,
                inliers: inliers.len(),
                outliers: differences.len() - inliers.len(),
            });
        }
        inliers = next;
    }
    None
}

impl ProcessingStage for LevelReconciler {
    type Input<'a> = (&'a [Dataset], &'a [OverlapRegion]);
    type Output = LevelingOutcome;

    fn name(&self) -> &'static str {
        "level"
    }

    fn initialize(&mut self, config: &MergeConfig) -> MergeResult<()> {
        self.settings = Some(LevelSettings::from(config));
        Ok(())
    }

    fn execute<'a>(&mut self, input: Self::Input<'a>) -> MergeResult<Self::Output> {
        let (datasets, overlaps) = input;
        self.reconcile(datasets, overlaps)
    }

    fn cleanup(&mut self) {
        self.settings = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::overlap::OverlapDetector;
    use crate::survey::{DatasetMetadata, Line, Sample};

    fn field(x: f64, y: f64) -> f64 {
        55_000.0 + 0.01 * x - 0.02 * y + 30.0 * ((x / 400.0).sin() * (y / 300.0).cos())
    }

    /// East-west lines every 100 m, samples every 10 m.
    fn block(name: &str, y_start: f64, lines: usize, offset: impl Fn(f64, f64) -> f64) -> Dataset {
        let lines = (0..lines)
            .map(|l| {
                let y = y_start + l as f64 * 100.0;
                let id = format!("L{}", (y as i64) + 1000);
                let samples = (0..=100)
                    .map(|i| {
                        let x = i as f64 * 10.0;
                        Sample::new(name, id.clone(), Position::new(x, y), field(x, y) + offset(x, y), i as f64)
                    })
                    .collect();
                Line::new(id, samples)
            })
            .collect();
        Dataset::new(name, DatasetMetadata::new("EPSG:3338"), lines)
    }

    fn reconciler(config: &MergeConfig) -> LevelReconciler {
        let mut stage = LevelReconciler::new();
        stage.initialize(config).unwrap();
        stage
    }

    fn run(datasets: &[Dataset], config: &MergeConfig) -> LevelingOutcome {
        let regions = OverlapDetector::with_tolerance(config.overlap_tolerance_distance)
            .detect_all(datasets)
            .unwrap();
        reconciler(config).reconcile(datasets, &regions).unwrap()
    }

    #[test]
    fn recovers_injected_constant_offset() {
        let a = block("A", 0.0, 10, |_, _| 0.0);
        let b = block("B", 500.0, 10, |_, _| 50.0);
        let outcome = run(&[a, b], &MergeConfig::default());

        assert_eq!(outcome.reference.as_deref(), Some("A"));
        let level = outcome.level("B").unwrap();
        assert_eq!(level.status, LevelStatus::Leveled);
        assert!((level.correction.offset + 50.0).abs() < 0.5, "{:?}", level.correction);
    }

    #[test]
    fn outliers_do_not_move_the_offset() {
        let a = block("A", 0.0, 10, |_, _| 0.0);
        let b = block("B", 500.0, 10, |x, y| if y == 600.0 && x < 300.0 { 900.0 } else { -20.0 });
        let config = MergeConfig {
            level_estimator: LevelEstimator::TrimmedMean,
            ..Default::default()
        };
        let outcome = run(&[a, b], &config);
        let level = outcome.level("B").unwrap();
        assert!((level.correction.offset - 20.0).abs() < 0.5, "{:?}", level.correction);
        assert!(level.outliers_excluded > 0);
    }

    #[test]
    fn plane_model_recovers_trend() {
        let a = block("A", 0.0, 10, |_, _| 0.0);
        let b = block("B", 500.0, 10, |x, y| 10.0 + 0.02 * x - 0.01 * y);
        let config = MergeConfig {
            level_model: LevelModel::Plane,
            ..Default::default()
        };
        let outcome = run(&[a, b], &config);
        let correction = outcome.level("B").unwrap().correction;
        let point = Position::new(250.0, 700.0);
        let expected = -(10.0 + 0.02 * 250.0 - 0.01 * 700.0);
        assert!((correction.at(&point) - expected).abs() < 0.5, "{:?}", correction);
    }

    #[test]
    fn transitive_chain_is_leveled_through_neighbour() {
        let a = block("A", 0.0, 5, |_, _| 0.0);
        let b = block("B", 300.0, 5, |_, _| 40.0);
        let c = block("C", 600.0, 5, |_, _| -15.0);
        let outcome = run(&[c, a, b], &MergeConfig::default());

        assert_eq!(outcome.reference.as_deref(), Some("B"));
        assert!((outcome.correction_for("A").offset - 40.0).abs() < 0.5);
        assert!((outcome.correction_for("C").offset - 55.0).abs() < 0.5);
    }

    #[test]
    fn isolated_dataset_is_unleveled() {
        let a = block("A", 0.0, 5, |_, _| 0.0);
        let b = block("B", 300.0, 5, |_, _| 10.0);
        let far = block("Z", 50_000.0, 3, |_, _| 0.0);
        let outcome = run(&[a, b, far], &MergeConfig::default());
        let level = outcome.level("Z").unwrap();
        assert_eq!(level.status, LevelStatus::Unleveled);
        assert_eq!(level.unleveled_reason, Some(UnleveledReason::NoOverlap));
        assert!(level.correction.is_zero());
        assert_eq!(outcome.unleveled().count(), 1);
    }

    #[test]
    fn disconnected_component_is_flagged() {
        let a = block("A", 0.0, 5, |_, _| 0.0);
        let b = block("B", 300.0, 5, |_, _| 10.0);
        let c = block("C", 50_000.0, 5, |_, _| 0.0);
        let d = block("D", 50_300.0, 5, |_, _| 5.0);
        let config = MergeConfig {
            reference_dataset: Some("A".into()),
            ..Default::default()
        };
        let outcome = run(&[a, b, c, d], &config);
        assert_eq!(
            outcome.level("D").unwrap().unleveled_reason,
            Some(UnleveledReason::Disconnected)
        );
    }

    #[test]
    fn disconnected_component_is_leveled_against_its_own_reference() {
        let a = block("A", 0.0, 5, |_, _| 0.0);
        let b = block("B", 300.0, 5, |_, _| 0.0);
        let c = block("C", 50_000.0, 5, |_, _| 0.0);
        let d = block("D", 50_300.0, 5, |_, _| 40.0);
        let outcome = run(&[a, b, c, d], &MergeConfig::default());

        assert_eq!(outcome.reference.as_deref(), Some("A"));
        let c = outcome.level("C").unwrap();
        assert_eq!(c.status, LevelStatus::Unleveled);
        assert_eq!(c.local_reference.as_deref(), Some("C"));
        assert!(c.correction.is_zero());
        assert!(!c.is_corrected());

        let d = outcome.level("D").unwrap();
        assert_eq!(d.status, LevelStatus::Unleveled);
        assert_eq!(d.unleveled_reason, Some(UnleveledReason::Disconnected));
        assert_eq!(d.local_reference.as_deref(), Some("C"));
        assert!(d.is_corrected());
        assert!((d.correction.offset + 40.0).abs() < 0.5, "{:?}", d.correction);
        assert_eq!(outcome.unleveled().count(), 2);
    }

    #[test]
    fn unknown_reference_is_a_configuration_error() {
        let a = block("A", 0.0, 2, |_, _| 0.0);
        let config = MergeConfig {
            reference_dataset: Some("nope".into()),
            ..Default::default()
        };
        let err = reconciler(&config).reconcile(&[a], &[]).unwrap_err();
        assert!(matches!(err, MergeError::InvalidConfiguration(_)));
    }

    #[test]
    fn stage_requires_initialization() {
        let mut stage = LevelReconciler::new();
        let empty: (&[Dataset], &[OverlapRegion]) = (&[], &[]);
        assert!(matches!(stage.execute(empty), Err(MergeError::Internal(_))));
    }
}
