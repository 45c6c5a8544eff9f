//! EduScore Backend Library
//!
//! State-level education outcome modeling: fetch public datasets through a
//! cache with synthetic fallback, consolidate them per state, train and
//! select a regression model, and simulate policy scenarios.

pub mod cache;
pub mod config;
pub mod consolidation;
pub mod fallback;
pub mod modeling;
pub mod models;
pub mod pipeline;
pub mod simulation;
pub mod sources;

pub use config::PipelineConfig;
pub use pipeline::{Pipeline, PipelineError, PipelineRun};
