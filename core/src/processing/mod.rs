pub mod conflict;
pub mod level;
pub mod overlap;
pub mod projection;
pub mod qc;

pub use conflict::{ConflictResolver, ResolutionInput, ResolutionOutcome};
pub use level::{LevelCorrection, LevelReconciler, LevelStatus, LevelingOutcome};
pub use overlap::{OverlapDetector, OverlapRegion};
pub use projection::{
    AffineTransform, AffineTransformRegistry, IdentityTransform, ProjectionNormalizer,
    ProjectionTransform, VerticalTransform,
};
pub use qc::{DrapeSegment, LineQc, LineQcSummary};
