//! QA pipeline runner and test-output parsers.

pub mod parsers;
pub mod pipeline;

pub use parsers::{parse_test_output, TestFramework};
pub use pipeline::{QaPipeline, QaPipelineConfig};
