use anyhow::{ensure, Context};
use magcore::{Dataset, DatasetMetadata, Line, Position, Sample};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

const SECONDS_BETWEEN_LINES: f64 = 120.0;

/// Layout of one synthetic survey block.
///
/// `origin_x`/`origin_y` are working-projection coordinates. A block declared
/// in another projection stores its positions shifted by `-grid_shift_*`, so
/// registering `translation(grid_shift_x, grid_shift_y)` for that projection
/// brings it back onto the working grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurveyProfile {
    pub name: String,
    pub projection: String,
    pub grid_shift_x: f64,
    pub grid_shift_y: f64,
    pub origin_x: f64,
    pub origin_y: f64,
    pub line_count: usize,
    pub line_spacing: f64,
    pub line_length: f64,
    pub sample_spacing: f64,
    /// Constant bias added to every reading, in nT.
    pub level_offset: f64,
    pub noise: f64,
    pub seed: u64,
    pub acquisition_start: f64,
    /// Ground speed in m/s.
    pub speed: f64,
    pub instrument: String,
    pub precision: f64,
    pub base_level: f64,
    pub first_flight: u32,
    pub lines_per_flight: usize,
}

impl Default for SurveyProfile {
    fn default() -> Self {
        Self {
            name: "survey".into(),
            projection: "EPSG:3338".into(),
            grid_shift_x: 0.0,
            grid_shift_y: 0.0,
            origin_x: 0.0,
            origin_y: 0.0,
            line_count: 10,
            line_spacing: 100.0,
            line_length: 2_000.0,
            sample_spacing: 10.0,
            level_offset: 0.0,
            noise: 0.0,
            seed: 0,
            acquisition_start: 0.0,
            speed: 60.0,
            instrument: "cesium".into(),
            precision: 0.1,
            base_level: 55_000.0,
            first_flight: 1,
            lines_per_flight: 5,
        }
    }
}

impl SurveyProfile {
    fn samples_per_line(&self) -> usize {
        (self.line_length / self.sample_spacing).floor() as usize + 1
    }

    fn seconds_per_sample(&self) -> f64 {
        self.sample_spacing / self.speed
    }

    fn line_duration(&self) -> f64 {
        (self.samples_per_line() - 1) as f64 * self.seconds_per_sample()
    }

    pub fn acquisition_end(&self) -> f64 {
        self.acquisition_start
            + self.line_count.saturating_sub(1) as f64 * (self.line_duration() + SECONDS_BETWEEN_LINES)
            + self.line_duration()
    }
}

/// Total field over the working grid: regional gradient plus two dipole-like bumps.
pub fn anomaly_field(base_level: f64, x: f64, y: f64) -> f64 {
    let bump = |cx: f64, cy: f64, amplitude: f64, width: f64| {
        let r2 = ((x - cx).powi(2) + (y - cy).powi(2)) / (width * width);
        amplitude * (-r2).exp()
    };
    base_level + 0.004 * x - 0.002 * y + bump(800.0, 600.0, 120.0, 600.0)
        - bump(1_500.0, 1_400.0, 60.0, 500.0)
}

/// Slow diurnal drift with a short-period ripple.
fn diurnal(t: f64) -> f64 {
    0.01 * t + 1.5 * (t / 900.0).sin()
}

pub fn build_dataset(profile: &SurveyProfile) -> anyhow::Result<Dataset> {
    ensure!(profile.line_count > 0, "survey {} has no lines", profile.name);
    ensure!(
        profile.sample_spacing > 0.0 && profile.speed > 0.0 && profile.line_length > 0.0,
        "survey {} needs positive spacing, speed and line length",
        profile.name
    );
    let per_line = profile.samples_per_line();
    per_line
        .checked_mul(profile.line_count)
        .context("overflow computing sample count for survey")?;

    let mut rng = StdRng::seed_from_u64(profile.seed);
    let dt = profile.seconds_per_sample();
    let lines_per_flight = profile.lines_per_flight.max(1);

    let lines = (0..profile.line_count)
        .map(|l| {
            let y = profile.origin_y + l as f64 * profile.line_spacing;
            let id = format!("L{}", 1000 + l * 10);
            let start = profile.acquisition_start + l as f64 * (profile.line_duration() + SECONDS_BETWEEN_LINES);
            // Alternate headings like a real survey pattern.
            let eastbound = l % 2 == 0;
            let samples = (0..per_line)
                .map(|i| {
                    let along = i as f64 * profile.sample_spacing;
                    let x = if eastbound {
                        profile.origin_x + along
                    } else {
                        profile.origin_x + profile.line_length - along
                    };
                    let jitter = if profile.noise > 0.0 {
                        rng.gen_range(-profile.noise..profile.noise)
                    } else {
                        0.0
                    };
                    let t = start + i as f64 * dt;
                    let value = anomaly_field(profile.base_level, x, y) + profile.level_offset + jitter;
                    let position = Position::new(x - profile.grid_shift_x, y - profile.grid_shift_y);
                    Sample::new(&profile.name, id.clone(), position, value, t)
                        .with_diurnal(diurnal(t))
                        .with_fiducial(i as u64)
                })
                .collect();
            let flight = profile.first_flight + (l / lines_per_flight) as u32;
            Line::new(id, samples).with_flight(flight)
        })
        .collect();

    let metadata = DatasetMetadata::new(profile.projection.clone())
        .with_window(profile.acquisition_start, profile.acquisition_end())
        .with_instrument(profile.instrument.clone(), profile.precision)
        .with_base_level(profile.base_level);
    Ok(Dataset::new(profile.name.clone(), metadata, lines))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generator_builds_expected_sample_count() {
        let profile = SurveyProfile {
            line_count: 4,
            line_length: 500.0,
            ..Default::default()
        };
        let dataset = build_dataset(&profile).unwrap();
        assert_eq!(dataset.lines.len(), 4);
        assert_eq!(dataset.sample_count(), 4 * 51);
        assert!(dataset.validate(5.0).is_ok());
        assert_eq!(dataset.metadata.acquisition_end, profile.acquisition_end());
    }

    #[test]
    fn shifted_grid_stores_local_coordinates() {
        let profile = SurveyProfile {
            projection: "LOCAL:1".into(),
            grid_shift_x: 10_000.0,
            grid_shift_y: 5_000.0,
            origin_x: 10_000.0,
            origin_y: 5_000.0,
            line_count: 1,
            line_length: 100.0,
            ..Default::default()
        };
        let dataset = build_dataset(&profile).unwrap();
        let first = &dataset.lines[0].samples[0];
        assert_eq!((first.position.x, first.position.y), (0.0, 0.0));
        assert_eq!(first.value, anomaly_field(profile.base_level, 10_000.0, 5_000.0));
    }

    #[test]
    fn same_seed_reproduces_noise() {
        let profile = SurveyProfile {
            noise: 0.5,
            seed: 13,
            line_count: 2,
            ..Default::default()
        };
        assert_eq!(build_dataset(&profile).unwrap(), build_dataset(&profile).unwrap());
    }

    #[test]
    fn lines_are_grouped_into_flights() {
        let profile = SurveyProfile {
            line_count: 7,
            lines_per_flight: 3,
            first_flight: 4,
            ..Default::default()
        };
        let dataset = build_dataset(&profile).unwrap();
        let flights: Vec<Option<u32>> = dataset.lines.iter().map(|l| l.flight).collect();
        assert_eq!(flights, vec![Some(4), Some(4), Some(4), Some(5), Some(5), Some(5), Some(6)]);
        assert_eq!(dataset.select_flights(5..=5).lines.len(), 3);
    }

    #[test]
    fn empty_survey_is_rejected() {
        let profile = SurveyProfile {
            line_count: 0,
            ..Default::default()
        };
        assert!(build_dataset(&profile).is_err());
    }
}
