pub mod dataset;
pub mod line;
pub mod sample;

pub use dataset::{Bounds, Dataset, DatasetMetadata, SampleKey};
pub use line::Line;
pub use sample::{Position, Sample, SampleFlag, ValueKind};
