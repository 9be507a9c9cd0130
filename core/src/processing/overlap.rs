use crate::config::MergeConfig;
use crate::prelude::{not_initialized, MergeResult, ProcessingStage};
use crate::survey::{Dataset, Position, SampleKey};
use crate::telemetry::log::LogManager;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Two samples, one per dataset, closer than the overlap tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OverlapPair {
    pub a: SampleKey,
    pub b: SampleKey,
    pub distance: f64,
}

impl OverlapPair {
    pub fn reversed(&self) -> Self {
        Self {
            a: self.b,
            b: self.a,
            distance: self.distance,
        }
    }
}

/// All sample pairs shared by two datasets. Lives for one merge run only.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlapRegion {
    pub dataset_a: String,
    pub dataset_b: String,
    pub pairs: Vec<OverlapPair>,
}

impl OverlapRegion {
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn involves(&self, dataset: &str) -> bool {
        self.dataset_a == dataset || self.dataset_b == dataset
    }

    /// The other dataset of the region, when `dataset` takes part in it.
    pub fn partner_of(&self, dataset: &str) -> Option<&str> {
        if self.dataset_a == dataset {
            Some(&self.dataset_b)
        } else if self.dataset_b == dataset {
            Some(&self.dataset_a)
        } else {
            None
        }
    }

    /// Same region seen from the other dataset, pairs re-sorted.
    pub fn reversed(&self) -> Self {
        let mut pairs: Vec<OverlapPair> = self.pairs.iter().map(OverlapPair::reversed).collect();
        sort_pairs(&mut pairs);
        Self {
            dataset_a: self.dataset_b.clone(),
            dataset_b: self.dataset_a.clone(),
            pairs,
        }
    }
}

fn sort_pairs(pairs: &mut [OverlapPair]) {
    pairs.sort_by(|l, r| (l.a, l.b).cmp(&(r.a, r.b)));
}

type CellKey = (i64, i64);

/// Uniform grid bucketing the admitted samples of one dataset.
struct SpatialGrid {
    cell: f64,
    cells: HashMap<CellKey, Vec<SampleKey>>,
}

impl SpatialGrid {
    fn build(dataset: &Dataset, cell: f64) -> Self {
        let mut cells: HashMap<CellKey, Vec<SampleKey>> = HashMap::new();
        for (key, sample) in dataset.keyed_samples().filter(|(_, s)| s.admitted) {
            cells
                .entry(cell_of(&sample.position, cell))
                .or_default()
                .push(key);
        }
        Self { cell, cells }
    }

    /// Samples in the cell containing `position` and its eight neighbours.
    fn neighbours(&self, position: &Position) -> impl Iterator<Item = &SampleKey> + '_ {
        let (cx, cy) = cell_of(position, self.cell);
        (-1..=1)
            .flat_map(move |dx| (-1..=1).map(move |dy| (cx.saturating_add(dx), cy.saturating_add(dy))))
            .filter_map(move |key| self.cells.get(&key))
            .flatten()
    }
}

fn cell_of(position: &Position, cell: f64) -> CellKey {
    ((position.x / cell).floor() as i64, (position.y / cell).floor() as i64)
}

/// Finds every admitted sample pair of `a` and `b` within `d_max`.
///
/// Comparisons are restricted to the 3×3 grid neighbourhood of each sample,
/// which is exhaustive because the grid cell equals `d_max`.
pub fn find_pairs(a: &Dataset, b: &Dataset, d_max: f64) -> Vec<OverlapPair> {
    let (Some(bounds_a), Some(bounds_b)) = (a.bounds(), b.bounds()) else {
        return Vec::new();
    };
    if !bounds_a.intersects(&bounds_b, d_max) {
        return Vec::new();
    }

    let grid = SpatialGrid::build(b, d_max);
    let mut pairs = Vec::new();
    for (key_a, sample_a) in a.keyed_samples().filter(|(_, s)| s.admitted) {
        for &key_b in grid.neighbours(&sample_a.position) {
            let Some(sample_b) = b.sample(key_b) else {
                continue;
            };
            let distance = sample_a.position.distance_2d(&sample_b.position);
            if distance <= d_max {
                pairs.push(OverlapPair {
                    a: key_a,
                    b: key_b,
                    distance,
                });
            }
        }
    }
    sort_pairs(&mut pairs);
    pairs
}

/// Pairwise overlap detection across a batch of normalized datasets.
pub struct OverlapDetector {
    tolerance: Option<f64>,
    logger: LogManager,
}

impl OverlapDetector {
    pub fn new() -> Self {
        Self {
            tolerance: None,
            logger: LogManager::new("overlap"),
        }
    }

    pub fn with_tolerance(tolerance: f64) -> Self {
        Self {
            tolerance: Some(tolerance),
            ..Self::new()
        }
    }

    pub fn detect(&self, a: &Dataset, b: &Dataset) -> MergeResult<OverlapRegion> {
        let tolerance = self.tolerance.ok_or_else(|| not_initialized("overlap"))?;
        Ok(OverlapRegion {
            dataset_a: a.name.clone(),
            dataset_b: b.name.clone(),
            pairs: find_pairs(a, b, tolerance),
        })
    }

    /// One region per unordered dataset pair, `dataset_a` sorting before
    /// `dataset_b`. Pairs are searched in parallel; the result order only
    /// depends on dataset names.
    pub fn detect_all(&self, datasets: &[Dataset]) -> MergeResult<Vec<OverlapRegion>> {
        let tolerance = self.tolerance.ok_or_else(|| not_initialized("overlap"))?;
        let mut order: Vec<&Dataset> = datasets.iter().collect();
        order.sort_by(|l, r| l.name.cmp(&r.name));

        let jobs: Vec<(&Dataset, &Dataset)> = order
            .iter()
            .enumerate()
            .flat_map(|(i, a)| order[i + 1..].iter().map(move |b| (*a, *b)))
            .collect();

        let regions: Vec<OverlapRegion> = jobs
            .par_iter()
            .map(|(a, b)| OverlapRegion {
                dataset_a: a.name.clone(),
                dataset_b: b.name.clone(),
                pairs: find_pairs(a, b, tolerance),
            })
            .collect();

        for region in &regions {
            self.logger.detail(&format!(
                "{} x {}: {} pairs within {} m",
                region.dataset_a,
                region.dataset_b,
                region.len(),
                tolerance
            ));
        }
        Ok(regions)
    }
}

impl Default for OverlapDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessingStage for OverlapDetector {
    type Input<'a> = &'a [Dataset];
    type Output = Vec<OverlapRegion>;

    fn name(&self) -> &'static str {
        "overlap"
    }

    fn initialize(&mut self, config: &MergeConfig) -> MergeResult<()> {
        self.tolerance = Some(config.overlap_tolerance_distance);
        Ok(())
    }

    fn execute<'a>(&mut self, input: Self::Input<'a>) -> MergeResult<Self::Output> {
        self.detect_all(input)
    }

    fn cleanup(&mut self) {
        self.tolerance = None;
    }
}
