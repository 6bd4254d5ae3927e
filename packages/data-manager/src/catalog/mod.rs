//! The static catalog: bundles, datasets and variables, plus the YAML loader
//! and the repository operations that persist them.

mod bundle;
mod dataset;
mod ops;

pub use bundle::Bundle;
pub use dataset::{DataSet, SpatialResolution, TemporalResolution, Variable};
pub use ops::SchemaOperations;
