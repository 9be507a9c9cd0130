use crate::config::MergeConfig;

/// Common error type for the merge pipeline.
///
/// `UnsupportedProjection` and `InvalidLine` are per-dataset failures: the
/// engine either aborts or skips the dataset depending on the configured
/// dataset error policy. The remaining variants always end the run.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum MergeError {
    #[error("dataset {dataset}: unsupported projection {projection}")]
    UnsupportedProjection { dataset: String, projection: String },
    #[error("dataset {dataset}, line {line}: {reason}")]
    InvalidLine {
        dataset: String,
        line: String,
        reason: String,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("merge aborted before stage {stage}")]
    Aborted { stage: String },
    #[error("internal failure: {0}")]
    Internal(String),
}

impl MergeError {
    /// Dataset a per-dataset failure belongs to, if any.
    pub fn dataset(&self) -> Option<&str> {
        match self {
            Self::UnsupportedProjection { dataset, .. } | Self::InvalidLine { dataset, .. } => {
                Some(dataset)
            }
            _ => None,
        }
    }

    pub fn is_per_dataset(&self) -> bool {
        self.dataset().is_some()
    }
}

pub type MergeResult<T> = Result<T, MergeError>;

/// Trait implemented by every pipeline stage.
///
/// Stages are configured once per run, execute over borrowed inputs and
/// release their configuration on cleanup. Executing a stage that was never
/// initialized is an [`MergeError::Internal`] failure.
pub trait ProcessingStage {
    type Input<'a>;
    type Output;

    fn name(&self) -> &'static str;
    fn initialize(&mut self, config: &MergeConfig) -> MergeResult<()>;
    fn execute<'a>(&mut self, input: Self::Input<'a>) -> MergeResult<Self::Output>;
    fn cleanup(&mut self);
}

pub(crate) fn not_initialized(stage: &str) -> MergeError {
    MergeError::Internal(format!("{} stage not initialized", stage))
}
