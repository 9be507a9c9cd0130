use crate::config::{MergeConfig, QcConfig};
use crate::math::StatsHelper;
use crate::prelude::{not_initialized, MergeResult, ProcessingStage};
use crate::survey::{Dataset, Line, SampleFlag};
use crate::telemetry::log::LogManager;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

const CHORD_15S: f64 = 15.0;
const CHORD_60S: f64 = 60.0;

/// A stretch of line flown further from the drape surface than allowed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrapeSegment {
    pub fiducial_start: u64,
    pub fiducial_end: u64,
    /// Along-track length in metres.
    pub length: f64,
    /// Deviation of largest magnitude, signed (positive is above the drape).
    pub max_deviation: f64,
    pub mean_deviation: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean_speed: Option<f64>,
}

/// Findings for one line. Only lines with at least one finding are reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineQcSummary {
    pub dataset: String,
    pub line: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flight: Option<u32>,
    pub noisy_samples: usize,
    pub diurnal_15s_out_of_spec: usize,
    pub diurnal_60s_out_of_spec: usize,
    /// Metres per second over the line's steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean_speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub drape_segments: Vec<DrapeSegment>,
}

impl LineQcSummary {
    pub fn has_findings(&self) -> bool {
        self.noisy_samples > 0
            || self.diurnal_15s_out_of_spec > 0
            || self.diurnal_60s_out_of_spec > 0
            || !self.drape_segments.is_empty()
    }
}

/// `M[i-2] - 4M[i-1] + 6M[i] - 4M[i+1] + M[i+2]`; `None` where the stencil
/// does not fit.
pub fn fourth_difference(values: &[f64]) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if values.len() < 5 {
        return out;
    }
    for i in 2..values.len() - 2 {
        out[i] = Some(
            values[i - 2] - 4.0 * values[i - 1] + 6.0 * values[i] - 4.0 * values[i + 1]
                + values[i + 2],
        );
    }
    out
}

/// Linear interpolation of `values` through the samples whose timestamp,
/// truncated to a tenth of a second, falls on a multiple of `interval`.
/// Samples outside the first and last anchor have no chord.
pub fn diurnal_chord(timestamps: &[f64], values: &[f64], interval: f64) -> Vec<Option<f64>> {
    let anchors: Vec<usize> = timestamps
        .iter()
        .enumerate()
        .filter(|&(_, &t)| (t / interval).floor() * interval == (t * 10.0).floor() / 10.0)
        .map(|(idx, _)| idx)
        .collect();

    let mut chord = vec![None; values.len()];
    if let Some(&only) = anchors.first() {
        chord[only] = Some(values[only]);
    }
    for window in anchors.windows(2) {
        let (lo, hi) = (window[0], window[1]);
        let span = (hi - lo) as f64;
        for idx in lo..=hi {
            let w = (idx - lo) as f64 / span;
            chord[idx] = Some(values[lo] * (1.0 - w) + values[hi] * w);
        }
    }
    chord
}

fn count_off_chord(timestamps: &[f64], values: &[f64], interval: f64, threshold: f64) -> usize {
    diurnal_chord(timestamps, values, interval)
        .iter()
        .zip(values)
        .filter(|(chord, v)| chord.map_or(false, |c| (*v - c).abs() > threshold))
        .count()
}

/// Speed of each step into sample `i` (index 0 has none).
fn step_speeds(line: &Line, steps: &[Option<f64>]) -> Vec<Option<f64>> {
    let mut speeds = vec![None; line.len()];
    for (i, pair) in line.samples.windows(2).enumerate() {
        let dt = pair[1].timestamp - pair[0].timestamp;
        speeds[i + 1] = steps[i + 1].filter(|_| dt > 0.0).map(|d| d / dt);
    }
    speeds
}

fn mean_speed(speeds: &[Option<f64>]) -> Option<f64> {
    let speeds: Vec<f64> = speeds.iter().flatten().copied().collect();
    StatsHelper::mean(&speeds)
}

/// Runs of consecutive samples more than `tolerance` metres off the drape
/// surface whose along-track length reaches `min_length`. Samples without an
/// elevation or drape value end a run.
pub fn drape_segments(line: &Line, tolerance: f64, min_length: f64) -> Vec<DrapeSegment> {
    let steps = line.step_distances();
    let speeds = step_speeds(line, &steps);
    let out_of_spec: Vec<Option<f64>> = line
        .samples
        .iter()
        .map(|s| s.drape_deviation().filter(|d| d.abs() > tolerance))
        .collect();

    let mut segments = Vec::new();
    let mut idx = 0;
    while idx < out_of_spec.len() {
        if out_of_spec[idx].is_none() {
            idx += 1;
            continue;
        }
        let start = idx;
        while idx < out_of_spec.len() && out_of_spec[idx].is_some() {
            idx += 1;
        }
        let end = idx - 1;

        let length: f64 = steps[start + 1..=end].iter().flatten().sum();
        if length < min_length {
            continue;
        }
        let deviations: Vec<f64> = out_of_spec[start..=end].iter().flatten().copied().collect();
        let max_deviation = deviations
            .iter()
            .copied()
            .fold(0.0_f64, |top, d| if d.abs() > top.abs() { d } else { top });
        segments.push(DrapeSegment {
            fiducial_start: line.samples[start].fiducial,
            fiducial_end: line.samples[end].fiducial,
            length,
            max_deviation,
            mean_deviation: StatsHelper::mean(&deviations).unwrap_or(0.0),
            mean_speed: mean_speed(&speeds[start + 1..=end]),
        });
    }
    segments
}

/// Per-line noise, diurnal and drape checks run before overlap detection.
pub struct LineQc {
    config: Option<QcConfig>,
    logger: LogManager,
}

impl LineQc {
    pub fn new() -> Self {
        Self {
            config: None,
            logger: LogManager::new("qc"),
        }
    }

    /// Flags noisy samples in place and returns the lines with findings.
    pub fn inspect(&self, dataset: &mut Dataset) -> MergeResult<Vec<LineQcSummary>> {
        let config = self.config.as_ref().ok_or_else(|| not_initialized("qc"))?;
        if !config.enabled {
            return Ok(Vec::new());
        }
        let name = dataset.name.clone();
        let summaries: Vec<LineQcSummary> = dataset
            .lines
            .par_iter_mut()
            .map(|line| inspect_line(&name, line, config))
            .filter(LineQcSummary::has_findings)
            .collect();

        let noisy: usize = summaries.iter().map(|s| s.noisy_samples).sum();
        let drape: usize = summaries.iter().map(|s| s.drape_segments.len()).sum();
        if !summaries.is_empty() {
            self.logger.detail(&format!(
                "{}: {} lines with findings, {} noisy samples, {} drape segments",
                name,
                summaries.len(),
                noisy,
                drape
            ));
        }
        Ok(summaries)
    }
}

impl Default for LineQc {
    fn default() -> Self {
        Self::new()
    }
}

fn inspect_line(dataset: &str, line: &mut Line, config: &QcConfig) -> LineQcSummary {
    let values: Vec<f64> = line.samples.iter().map(|s| s.value).collect();
    let mut noisy_samples = 0;
    for (sample, diff) in line.samples.iter_mut().zip(fourth_difference(&values)) {
        if diff.map_or(false, |d| d.abs() > config.noise_threshold) {
            noisy_samples += 1;
            if config.reject_noisy {
                sample.reject(SampleFlag::NoisyFourthDifference);
            } else {
                sample.flag(SampleFlag::NoisyFourthDifference);
            }
        }
    }

    let (mut diurnal_15s_out_of_spec, mut diurnal_60s_out_of_spec) = (0, 0);
    if line.samples.iter().all(|s| s.diurnal.is_some()) && !line.is_empty() {
        let times: Vec<f64> = line.samples.iter().map(|s| s.timestamp).collect();
        let diurnal: Vec<f64> = line.samples.iter().filter_map(|s| s.diurnal).collect();
        diurnal_15s_out_of_spec =
            count_off_chord(&times, &diurnal, CHORD_15S, config.diurnal_15s_threshold);
        diurnal_60s_out_of_spec =
            count_off_chord(&times, &diurnal, CHORD_60S, config.diurnal_60s_threshold);
    }

    let steps = line.step_distances();
    LineQcSummary {
        dataset: dataset.to_string(),
        line: line.id.clone(),
        flight: line.flight,
        noisy_samples,
        diurnal_15s_out_of_spec,
        diurnal_60s_out_of_spec,
        mean_speed: mean_speed(&step_speeds(line, &steps)),
        drape_segments: drape_segments(line, config.drape_tolerance, config.drape_min_length),
    }
}

impl ProcessingStage for LineQc {
    type Input<'a> = &'a mut Dataset;
    type Output = Vec<LineQcSummary>;

    fn name(&self) -> &'static str {
        "qc"
    }

    fn initialize(&mut self, config: &MergeConfig) -> MergeResult<()> {
        self.config = Some(config.qc.clone());
        Ok(())
    }

    fn execute<'a>(&mut self, input: Self::Input<'a>) -> MergeResult<Self::Output> {
        self.inspect(input)
    }

    fn cleanup(&mut self) {
        self.config = None;
    }
}
