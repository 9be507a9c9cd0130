use crate::prelude::MergeResult;
use crate::survey::line::Line;
use crate::survey::sample::{Position, Sample};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

fn default_precision() -> f64 {
    0.1
}

/// Acquisition metadata declared by the source survey.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    /// Projection/datum identifier, e.g. `EPSG:26906`.
    pub projection: String,
    pub acquisition_start: f64,
    pub acquisition_end: f64,
    /// Declared base level in nT.
    #[serde(default)]
    pub base_level: f64,
    #[serde(default)]
    pub instrument: String,
    /// Nominal instrument noise floor in nT; smaller is more precise.
    #[serde(default = "default_precision")]
    pub instrument_precision: f64,
}

impl DatasetMetadata {
    pub fn new(projection: impl Into<String>) -> Self {
        Self {
            projection: projection.into(),
            acquisition_start: 0.0,
            acquisition_end: 0.0,
            base_level: 0.0,
            instrument: String::new(),
            instrument_precision: default_precision(),
        }
    }

    pub fn with_window(mut self, start: f64, end: f64) -> Self {
        self.acquisition_start = start;
        self.acquisition_end = end;
        self
    }

    pub fn with_instrument(mut self, instrument: impl Into<String>, precision: f64) -> Self {
        self.instrument = instrument.into();
        self.instrument_precision = precision;
        self
    }

    pub fn with_base_level(mut self, base_level: f64) -> Self {
        self.base_level = base_level;
        self
    }
}

/// Address of a sample inside a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SampleKey {
    pub line: usize,
    pub index: usize,
}

impl SampleKey {
    pub fn new(line: usize, index: usize) -> Self {
        Self { line, index }
    }
}

/// Axis-aligned horizontal extent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    fn from_position(position: &Position) -> Self {
        Self {
            min_x: position.x,
            min_y: position.y,
            max_x: position.x,
            max_y: position.y,
        }
    }

    fn include(&mut self, position: &Position) {
        self.min_x = self.min_x.min(position.x);
        self.min_y = self.min_y.min(position.y);
        self.max_x = self.max_x.max(position.x);
        self.max_y = self.max_y.max(position.y);
    }

    /// True when the two extents come within `margin` of each other.
    pub fn intersects(&self, other: &Bounds, margin: f64) -> bool {
        self.min_x - margin <= other.max_x
            && other.min_x - margin <= self.max_x
            && self.min_y - margin <= other.max_y
            && other.min_y - margin <= self.max_y
    }
}

/// One imported survey.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    pub metadata: DatasetMetadata,
    pub lines: Vec<Line>,
}

impl Dataset {
    pub fn new(name: impl Into<String>, metadata: DatasetMetadata, lines: Vec<Line>) -> Self {
        Self {
            name: name.into(),
            metadata,
            lines,
        }
    }

    pub fn sample_count(&self) -> usize {
        self.lines.iter().map(Line::len).sum()
    }

    pub fn admitted_count(&self) -> usize {
        self.lines.iter().map(Line::admitted_count).sum()
    }

    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.lines.iter().flat_map(|line| line.samples.iter())
    }

    pub fn keyed_samples(&self) -> impl Iterator<Item = (SampleKey, &Sample)> {
        self.lines.iter().enumerate().flat_map(|(line_idx, line)| {
            line.samples
                .iter()
                .enumerate()
                .map(move |(idx, sample)| (SampleKey::new(line_idx, idx), sample))
        })
    }

    pub fn sample(&self, key: SampleKey) -> Option<&Sample> {
        self.lines.get(key.line)?.samples.get(key.index)
    }

    pub fn sample_mut(&mut self, key: SampleKey) -> Option<&mut Sample> {
        self.lines.get_mut(key.line)?.samples.get_mut(key.index)
    }

    /// Extent of the admitted samples.
    pub fn bounds(&self) -> Option<Bounds> {
        let mut admitted = self.samples().filter(|s| s.admitted);
        let mut bounds = Bounds::from_position(&admitted.next()?.position);
        for sample in admitted {
            bounds.include(&sample.position);
        }
        Some(bounds)
    }

    pub fn validate(&self, path_tolerance: f64) -> MergeResult<()> {
        self.lines
            .iter()
            .try_for_each(|line| line.validate(&self.name, path_tolerance))
    }

    /// Copy holding only lines flown on the given flights.
    pub fn select_flights(&self, flights: RangeInclusive<u32>) -> Dataset {
        self.filter_lines(|line| line.flight.map_or(false, |f| flights.contains(&f)))
    }

    /// Copy without the lines flown on the given flights.
    pub fn deselect_flights(&self, flights: RangeInclusive<u32>) -> Dataset {
        self.filter_lines(|line| !line.flight.map_or(false, |f| flights.contains(&f)))
    }

    fn filter_lines(&self, keep: impl Fn(&Line) -> bool) -> Dataset {
        Dataset {
            name: self.name.clone(),
            metadata: self.metadata.clone(),
            lines: self.lines.iter().filter(|l| keep(l)).cloned().collect(),
        }
    }
}
