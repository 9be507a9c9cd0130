use crate::config::MergeConfig;
use crate::prelude::{not_initialized, MergeError, MergeResult, ProcessingStage};
use crate::survey::Dataset;
use crate::telemetry::log::LogManager;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Failure reported by an injected coordinate transform.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ProjectionError {
    #[error("no transform from {from} to {to}")]
    Unsupported { from: String, to: String },
    #[error("({x}, {y}) lies outside the domain of {from}")]
    OutOfDomain { from: String, x: f64, y: f64 },
}

/// Horizontal coordinate-transform capability supplied by the caller.
///
/// The merge core never implements projections itself; it only asks this
/// service to move points between named projections.
pub trait ProjectionTransform: Send + Sync {
    fn supports(&self, from: &str, to: &str) -> bool;
    fn transform(&self, x: f64, y: f64, from: &str, to: &str) -> Result<(f64, f64), ProjectionError>;
}

/// Optional vertical datum transform. Without one, elevations pass through.
pub trait VerticalTransform: Send + Sync {
    fn transform(&self, z: f64, x: f64, y: f64, from: &str, to: &str) -> Result<f64, ProjectionError>;
}

/// Transform that only resolves a projection onto itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransform;

impl ProjectionTransform for IdentityTransform {
    fn supports(&self, from: &str, to: &str) -> bool {
        from == to
    }

    fn transform(&self, x: f64, y: f64, from: &str, to: &str) -> Result<(f64, f64), ProjectionError> {
        if from == to {
            Ok((x, y))
        } else {
            Err(ProjectionError::Unsupported {
                from: from.to_string(),
                to: to.to_string(),
            })
        }
    }
}

/// `x' = a·x + b·y + c`, `y' = d·x + e·y + f`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffineTransform {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
}

impl AffineTransform {
    pub fn translation(dx: f64, dy: f64) -> Self {
        Self {
            a: 1.0,
            b: 0.0,
            c: dx,
            d: 0.0,
            e: 1.0,
            f: dy,
        }
    }

    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        (
            self.a * x + self.b * y + self.c,
            self.d * x + self.e * y + self.f,
        )
    }

    pub fn inverse(&self) -> Option<Self> {
        let det = self.a * self.e - self.b * self.d;
        if det.abs() < f64::EPSILON {
            return None;
        }
        let a = self.e / det;
        let b = -self.b / det;
        let d = -self.d / det;
        let e = self.a / det;
        Some(Self {
            a,
            b,
            c: -(a * self.c + b * self.f),
            d,
            e,
            f: -(d * self.c + e * self.f),
        })
    }
}

/// Lookup table of affine transforms between named grids.
///
/// Suits local survey grids that are rigid or scaled offsets of the working
/// grid; anything else belongs behind a full [`ProjectionTransform`].
#[derive(Debug, Clone, Default)]
pub struct AffineTransformRegistry {
    entries: BTreeMap<(String, String), AffineTransform>,
}

impl AffineTransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `from → to` and, when invertible, `to → from`.
    pub fn register(&mut self, from: &str, to: &str, transform: AffineTransform) {
        if let Some(inverse) = transform.inverse() {
            self.entries
                .insert((to.to_string(), from.to_string()), inverse);
        }
        self.entries
            .insert((from.to_string(), to.to_string()), transform);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ProjectionTransform for AffineTransformRegistry {
    fn supports(&self, from: &str, to: &str) -> bool {
        from == to
            || self
                .entries
                .contains_key(&(from.to_string(), to.to_string()))
    }

    fn transform(&self, x: f64, y: f64, from: &str, to: &str) -> Result<(f64, f64), ProjectionError> {
        if from == to {
            return Ok((x, y));
        }
        self.entries
            .get(&(from.to_string(), to.to_string()))
            .map(|t| t.apply(x, y))
            .ok_or_else(|| ProjectionError::Unsupported {
                from: from.to_string(),
                to: to.to_string(),
            })
    }
}

/// Re-expresses datasets in the working projection.
pub struct ProjectionNormalizer {
    transform: Arc<dyn ProjectionTransform>,
    vertical: Option<Arc<dyn VerticalTransform>>,
    working: Option<String>,
    logger: LogManager,
}

impl ProjectionNormalizer {
    pub fn new(transform: Arc<dyn ProjectionTransform>) -> Self {
        Self {
            transform,
            vertical: None,
            working: None,
            logger: LogManager::new("projection"),
        }
    }

    pub fn with_vertical(mut self, vertical: Arc<dyn VerticalTransform>) -> Self {
        self.vertical = Some(vertical);
        self
    }

    /// Returns a copy of `dataset` in `working`; the input is left untouched.
    pub fn normalize(&self, dataset: &Dataset, working: &str) -> MergeResult<Dataset> {
        self.reproject(dataset.clone(), working)
    }

    fn reproject(&self, mut dataset: Dataset, working: &str) -> MergeResult<Dataset> {
        let from = dataset.metadata.projection.clone();
        if from == working {
            self.logger
                .detail(&format!("{} already in {}", dataset.name, working));
            return Ok(dataset);
        }

        let unsupported = || MergeError::UnsupportedProjection {
            dataset: dataset.name.clone(),
            projection: from.clone(),
        };
        if !self.transform.supports(&from, working) {
            return Err(unsupported());
        }

        let transform = self.transform.as_ref();
        let vertical = self.vertical.as_deref();
        dataset
            .lines
            .par_iter_mut()
            .try_for_each(|line| -> Result<(), ProjectionError> {
                for sample in &mut line.samples {
                    let (x, y) = (sample.position.x, sample.position.y);
                    if let (Some(vertical), Some(z)) = (vertical, sample.position.z) {
                        sample.position.z = Some(vertical.transform(z, x, y, &from, working)?);
                    }
                    let (nx, ny) = transform.transform(x, y, &from, working)?;
                    sample.position.x = nx;
                    sample.position.y = ny;
                }
                Ok(())
            })
            .map_err(|err| {
                self.logger
                    .warn(&format!("{}: {}", dataset.name, err));
                unsupported()
            })?;

        self.logger.record(&format!(
            "{} reprojected {} -> {} ({} samples)",
            dataset.name,
            from,
            working,
            dataset.sample_count()
        ));
        dataset.metadata.projection = working.to_string();
        Ok(dataset)
    }
}

impl ProcessingStage for ProjectionNormalizer {
    type Input<'a> = &'a Dataset;
    type Output = Dataset;

    fn name(&self) -> &'static str {
        "projection"
    }

    fn initialize(&mut self, config: &MergeConfig) -> MergeResult<()> {
        self.working = Some(config.working_projection.clone());
        Ok(())
    }

    fn execute<'a>(&mut self, input: Self::Input<'a>) -> MergeResult<Self::Output> {
        let working = self
            .working
            .as_deref()
            .ok_or_else(|| not_initialized(self.name()))?;
        self.normalize(input, working)
    }

    fn cleanup(&mut self) {
        self.working = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::survey::{DatasetMetadata, Line, Position, Sample};

    fn local_dataset(projection: &str) -> Dataset {
        let samples = (0..4)
            .map(|i| {
                Sample::new(
                    "A",
                    "L1",
                    Position::new(i as f64 * 10.0, 5.0).with_elevation(120.0),
                    52_000.0,
                    i as f64,
                )
            })
            .collect();
        Dataset::new(
            "A",
            DatasetMetadata::new(projection),
            vec![Line::new("L1", samples)],
        )
    }

    fn registry() -> Arc<AffineTransformRegistry> {
        let mut registry = AffineTransformRegistry::new();
        registry.register("LOCAL:A", "EPSG:3338", AffineTransform::translation(1000.0, -500.0));
        Arc::new(registry)
    }

    #[test]
    fn normalizes_into_working_projection_without_touching_input() {
        let input = local_dataset("LOCAL:A");
        let normalizer = ProjectionNormalizer::new(registry());
        let output = normalizer.normalize(&input, "EPSG:3338").unwrap();

        assert_eq!(output.metadata.projection, "EPSG:3338");
        assert_eq!(output.lines[0].samples[1].position.x, 1010.0);
        assert_eq!(output.lines[0].samples[1].position.y, -495.0);
        assert_eq!(output.lines[0].samples[1].position.z, Some(120.0));
        assert_eq!(input.lines[0].samples[1].position.x, 10.0);
        assert_eq!(input.metadata.projection, "LOCAL:A");
    }

    #[test]
    fn normalizing_twice_is_a_no_op() {
        let normalizer = ProjectionNormalizer::new(registry());
        let once = normalizer
            .normalize(&local_dataset("LOCAL:A"), "EPSG:3338")
            .unwrap();
        let twice = normalizer.normalize(&once, "EPSG:3338").unwrap();
        for (a, b) in once.samples().zip(twice.samples()) {
            assert!(a.position.distance_2d(&b.position) < 1e-9);
        }
    }

    #[test]
    fn unknown_projection_is_unsupported() {
        let normalizer = ProjectionNormalizer::new(registry());
        let err = normalizer
            .normalize(&local_dataset("LOCAL:B"), "EPSG:3338")
            .unwrap_err();
        assert_eq!(
            err,
            MergeError::UnsupportedProjection {
                dataset: "A".into(),
                projection: "LOCAL:B".into()
            }
        );
    }

    #[test]
    fn registry_registers_inverse() {
        let transform = AffineTransform::translation(3.0, 4.0);
        let inverse = transform.inverse().unwrap();
        let (x, y) = transform.apply(10.0, 20.0);
        assert_eq!(inverse.apply(x, y), (10.0, 20.0));
        assert!(registry().supports("EPSG:3338", "LOCAL:A"));
    }

    struct GeoidShift(f64);

    impl VerticalTransform for GeoidShift {
        fn transform(&self, z: f64, _x: f64, _y: f64, _from: &str, _to: &str) -> Result<f64, ProjectionError> {
            Ok(z + self.0)
        }
    }

    #[test]
    fn vertical_transform_applies_only_when_configured() {
        let normalizer = ProjectionNormalizer::new(registry()).with_vertical(Arc::new(GeoidShift(-12.5)));
        let output = normalizer
            .normalize(&local_dataset("LOCAL:A"), "EPSG:3338")
            .unwrap();
        assert_eq!(output.lines[0].samples[0].position.z, Some(107.5));
    }

    #[test]
    fn stage_requires_initialization() {
        let mut stage = ProjectionNormalizer::new(Arc::new(IdentityTransform));
        assert!(matches!(
            stage.execute(&local_dataset("EPSG:3338")),
            Err(MergeError::Internal(_))
        ));
        stage.initialize(&MergeConfig::default()).unwrap();
        assert!(stage.execute(&local_dataset("EPSG:3338")).is_ok());
        stage.cleanup();
    }
}
