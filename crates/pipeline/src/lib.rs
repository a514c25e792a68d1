//! Cube generation pipeline: configuration, grid mapping resolution,
//! custom processing, pre-write normalization, and the per-dataset
//! driver loop.

pub mod config;
pub mod driver;
pub mod report;
pub mod resolver;
pub mod run;
pub mod transforms;
pub mod writer;

pub use config::{Config, DatasetSpec, FormatId, GeneralConfig, SchedulerMode, OUTPUT_STORE};
pub use driver::Generator;
pub use report::{DatasetReport, Outcome, RunReport, Stage};
pub use run::RunContext;
pub use transforms::TransformRegistry;
