use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Position in the dataset's projection (metres), with optional elevation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y, z: None }
    }

    pub fn with_elevation(mut self, z: f64) -> Self {
        self.z = Some(z);
        self
    }

    /// Horizontal distance, ignoring elevation.
    pub fn distance_2d(&self, other: &Position) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// Whether the magnetic value is raw or already carries upstream corrections
/// (diurnal, IGRF removal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValueKind {
    #[default]
    Raw,
    Corrected,
}

/// Markers attached to a sample while it moves through the merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SampleFlag {
    Leveled,
    DuplicateSuppressed,
    Conflict,
    EdgeTrimmed,
    NoisyFourthDifference,
}

impl fmt::Display for SampleFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Leveled => "leveled",
            Self::DuplicateSuppressed => "duplicate-suppressed",
            Self::Conflict => "conflict",
            Self::EdgeTrimmed => "edge-trimmed",
            Self::NoisyFourthDifference => "noisy-fourth-difference",
        };
        f.write_str(label)
    }
}

fn admitted_by_default() -> bool {
    true
}

/// One magnetic reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub position: Position,
    /// Total magnetic intensity in nT.
    pub value: f64,
    #[serde(default)]
    pub value_kind: ValueKind,
    /// Seconds since the survey epoch.
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diurnal: Option<f64>,
    /// Planned drape surface elevation under the sample, in metres.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drape: Option<f64>,
    #[serde(default)]
    pub fiducial: u64,
    pub dataset: String,
    /// Owning line id; rewritten to `<dataset>/<line>` in merged output.
    pub line: String,
    #[serde(default = "admitted_by_default")]
    pub admitted: bool,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub flags: BTreeSet<SampleFlag>,
}

impl Sample {
    pub fn new(
        dataset: impl Into<String>,
        line: impl Into<String>,
        position: Position,
        value: f64,
        timestamp: f64,
    ) -> Self {
        Self {
            position,
            value,
            value_kind: ValueKind::Raw,
            timestamp,
            diurnal: None,
            drape: None,
            fiducial: 0,
            dataset: dataset.into(),
            line: line.into(),
            admitted: true,
            flags: BTreeSet::new(),
        }
    }

    pub fn with_diurnal(mut self, diurnal: f64) -> Self {
        self.diurnal = Some(diurnal);
        self
    }

    pub fn with_drape(mut self, drape: f64) -> Self {
        self.drape = Some(drape);
        self
    }

    /// Flown elevation minus the drape surface, when both are known.
    pub fn drape_deviation(&self) -> Option<f64> {
        Some(self.position.z? - self.drape?)
    }

    pub fn with_fiducial(mut self, fiducial: u64) -> Self {
        self.fiducial = fiducial;
        self
    }

    pub fn with_value_kind(mut self, kind: ValueKind) -> Self {
        self.value_kind = kind;
        self
    }

    pub fn flag(&mut self, flag: SampleFlag) {
        self.flags.insert(flag);
    }

    pub fn has_flag(&self, flag: SampleFlag) -> bool {
        self.flags.contains(&flag)
    }

    /// Excludes the sample from the merge and records why.
    pub fn reject(&mut self, flag: SampleFlag) {
        self.admitted = false;
        self.flags.insert(flag);
    }

    /// True when the sample was excluded by overlap resolution rather than QC.
    pub fn excluded_by_merge(&self) -> bool {
        !self.admitted
            && (self.has_flag(SampleFlag::DuplicateSuppressed) || self.has_flag(SampleFlag::Conflict))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_ignores_elevation() {
        let a = Position::new(0.0, 0.0).with_elevation(100.0);
        let b = Position::new(3.0, 4.0);
        assert_eq!(a.distance_2d(&b), 5.0);
        assert_eq!(b.distance_2d(&a), 5.0);
    }

    #[test]
    fn reject_clears_admission_and_records_flag() {
        let mut sample = Sample::new("A", "L10", Position::new(0.0, 0.0), 55_000.0, 1.0);
        assert!(sample.admitted);
        sample.reject(SampleFlag::Conflict);
        assert!(!sample.admitted);
        assert!(sample.excluded_by_merge());
        assert_eq!(SampleFlag::Conflict.to_string(), "conflict");
    }

    #[test]
    fn admitted_defaults_to_true_when_deserialized() {
        let json = r#"{"position":{"x":1.0,"y":2.0},"value":10.0,"timestamp":0.5,"dataset":"A","line":"L1"}"#;
        let sample: Sample = serde_json::from_str(json).unwrap();
        assert!(sample.admitted);
        assert!(sample.flags.is_empty());
        assert_eq!(sample.value_kind, ValueKind::Raw);
        assert_eq!(sample.drape, None);
    }

    #[test]
    fn drape_deviation_needs_elevation_and_surface() {
        let flat = Sample::new("A", "L1", Position::new(0.0, 0.0), 1.0, 0.0).with_drape(120.0);
        assert_eq!(flat.drape_deviation(), None);
        let flown = Sample::new("A", "L1", Position::new(0.0, 0.0).with_elevation(140.0), 1.0, 0.0)
            .with_drape(120.0);
        assert_eq!(flown.drape_deviation(), Some(20.0));
    }
}
