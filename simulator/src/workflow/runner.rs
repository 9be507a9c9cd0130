use crate::generator::profile::{build_dataset, SurveyProfile};
use crate::generator::template::scenario;
use crate::workflow::config::WorkflowConfig;
use anyhow::Context;
use magcore::processing::{AffineTransform, AffineTransformRegistry};
use magcore::{Dataset, MergeEngine, MergeReport};
use std::fs;
use std::sync::Arc;

#[derive(Debug)]
pub struct WorkflowResult {
    pub merged: Dataset,
    pub report: MergeReport,
    pub input_count: usize,
}

#[derive(Clone)]
pub struct Runner {
    config: WorkflowConfig,
}

impl Runner {
    pub fn new(config: WorkflowConfig) -> Self {
        Self { config }
    }

    /// Survey layouts to synthesize: explicit ones first, then the scenario's.
    fn profiles(&self) -> anyhow::Result<Vec<SurveyProfile>> {
        let mut profiles = self.config.surveys.clone();
        if let Some(name) = &self.config.scenario {
            profiles.extend(scenario(name)?);
        }
        Ok(profiles)
    }

    /// Every non-working projection used by a synthetic survey maps onto the
    /// working grid by the survey's grid shift.
    fn transforms(&self, profiles: &[SurveyProfile]) -> AffineTransformRegistry {
        let mut registry = AffineTransformRegistry::new();
        for profile in profiles {
            if profile.projection != self.config.working_projection {
                registry.register(
                    &profile.projection,
                    &self.config.working_projection,
                    AffineTransform::translation(profile.grid_shift_x, profile.grid_shift_y),
                );
            }
        }
        registry
    }

    pub fn datasets(&self, profiles: &[SurveyProfile]) -> anyhow::Result<Vec<Dataset>> {
        let mut datasets = profiles
            .iter()
            .map(|profile| {
                build_dataset(profile)
                    .with_context(|| format!("generating survey {}", profile.name))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        for path in &self.config.inputs {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("reading dataset {}", path.display()))?;
            let dataset: Dataset = serde_json::from_str(&contents)
                .with_context(|| format!("parsing dataset {}", path.display()))?;
            datasets.push(dataset);
        }
        for (name, filter) in &self.config.flights {
            let dataset = datasets
                .iter_mut()
                .find(|d| &d.name == name)
                .with_context(|| format!("flight filter names unknown dataset {}", name))?;
            let before = dataset.lines.len();
            *dataset = filter.apply(dataset)?;
            log::info!(
                "[workflow] {}: {:?} kept {} of {} lines",
                name,
                filter,
                dataset.lines.len(),
                before
            );
        }
        Ok(datasets)
    }

    pub fn execute(&self) -> anyhow::Result<WorkflowResult> {
        let merge_config = self.config.to_merge_config()?;
        let profiles = self.profiles()?;
        let datasets = self.datasets(&profiles)?;
        anyhow::ensure!(
            !datasets.is_empty(),
            "workflow names no surveys, scenario or input files"
        );

        let engine = MergeEngine::new(merge_config, Arc::new(self.transforms(&profiles)))
            .context("building merge engine")?;
        let output = engine.run(&datasets).context("running merge")?;

        Ok(WorkflowResult {
            merged: output.dataset,
            report: output.report,
            input_count: datasets.len(),
        })
    }
}
