use crate::prelude::{MergeError, MergeResult};
use crate::survey::sample::Sample;
use serde::{Deserialize, Serialize};

/// One continuous traverse: samples in acquisition order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Line {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flight: Option<u32>,
    pub samples: Vec<Sample>,
}

impl Line {
    pub fn new(id: impl Into<String>, samples: Vec<Sample>) -> Self {
        Self {
            id: id.into(),
            flight: None,
            samples,
        }
    }

    pub fn with_flight(mut self, flight: u32) -> Self {
        self.flight = Some(flight);
        self
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn admitted_count(&self) -> usize {
        self.samples.iter().filter(|s| s.admitted).count()
    }

    /// Distance travelled between consecutive samples; `None` for the first.
    pub fn step_distances(&self) -> Vec<Option<f64>> {
        let mut steps = Vec::with_capacity(self.samples.len());
        if self.samples.is_empty() {
            return steps;
        }
        steps.push(None);
        steps.extend(
            self.samples
                .windows(2)
                .map(|pair| Some(pair[0].position.distance_2d(&pair[1].position))),
        );
        steps
    }

    /// Checks that timestamps strictly increase and that the traverse never
    /// doubles back along its own direction by more than `path_tolerance`.
    pub fn validate(&self, dataset: &str, path_tolerance: f64) -> MergeResult<()> {
        let violation = |reason: String| MergeError::InvalidLine {
            dataset: dataset.to_string(),
            line: self.id.clone(),
            reason,
        };

        for pair in self.samples.windows(2) {
            if !(pair[1].timestamp > pair[0].timestamp) {
                return Err(violation(format!(
                    "timestamps not strictly increasing at t={}",
                    pair[1].timestamp
                )));
            }
        }

        let (first, last) = match (self.samples.first(), self.samples.last()) {
            (Some(first), Some(last)) if self.samples.len() > 2 => (first.position, last.position),
            _ => return Ok(()),
        };

        let span = first.distance_2d(&last);
        if span <= path_tolerance {
            // Endpoints coincide: anything wandering away and back is a revisit.
            let excursion = self
                .samples
                .iter()
                .map(|s| s.position.distance_2d(&first))
                .fold(0.0_f64, f64::max);
            if excursion > path_tolerance {
                return Err(violation(format!(
                    "line returns to its start after a {:.1} m excursion",
                    excursion
                )));
            }
            return Ok(());
        }

        let ux = (last.x - first.x) / span;
        let uy = (last.y - first.y) / span;
        let mut furthest = f64::NEG_INFINITY;
        for sample in &self.samples {
            let along = (sample.position.x - first.x) * ux + (sample.position.y - first.y) * uy;
            if along < furthest - path_tolerance {
                return Err(violation(format!(
                    "path doubles back by {:.1} m at t={}",
                    furthest - along,
                    sample.timestamp
                )));
            }
            furthest = furthest.max(along);
        }
        Ok(())
    }
}
