pub mod aggregate;
pub mod config;
pub mod detectors;
pub mod features;
pub mod metrics_server;
pub mod observability;
pub mod pipeline;
pub mod scoring;
pub mod sinks;
pub mod sources;
pub mod transform;
pub mod views;
pub mod window;

pub use pipeline::{Envelope, RecomputeJob, RunReport};
