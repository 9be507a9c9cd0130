//! Merge-and-reconcile core for the Rust magnetic survey processing pipeline.
//!
//! Independently acquired survey datasets are normalized into one working
//! projection, compared where they overlap, leveled against a reference and
//! resolved sample by sample into a single merged dataset plus a report.

pub mod config;
pub mod engine;
pub mod math;
pub mod prelude;
pub mod processing;
pub mod report;
pub mod survey;
pub mod telemetry;

pub use config::MergeConfig;
pub use engine::{MergeEngine, MergeOutput};
pub use prelude::{MergeError, MergeResult, ProcessingStage};
pub use report::MergeReport;
pub use survey::{Dataset, DatasetMetadata, Line, Position, Sample};
